pub const HASH_SIZE: usize = 32;
/// Bucket holding every block keyed by its hash, plus the head pointer.
pub const BLOCKS_BUCKET: &str = "blocks";
/// Reserved key in [`BLOCKS_BUCKET`] whose value is the current head hash.
pub const HEAD_KEY: &[u8] = b"l";
pub const GENESIS_DATA: &str = "Genesis Block";
