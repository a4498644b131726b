use anyhow::Result;
use clap::{Parser, Subcommand};
use ledger_core::{Block, Chain};
use ledger_storage::SledStore;
use serde::Serialize;
use std::{path::PathBuf, sync::Arc};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "ledger-cli")]
#[command(about = "Append to and inspect a local hash-linked ledger")]
struct Cli {
    /// Path to the ledger database
    #[arg(long, env = "LEDGER_DB", default_value = "blockchain.db")]
    db: PathBuf,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Append a block carrying DATA
    AddBlock {
        #[arg(long)]
        data: String,
    },
    /// Print every block from the head back to genesis
    PrintChain {
        /// Emit one JSON object per line
        #[arg(long)]
        json: bool,
    },
    /// Print the current head hash
    Head,
}

#[derive(Serialize)]
struct BlockRow {
    hash: String,
    prev_hash: Option<String>,
    timestamp: u64,
    data: String,
}

impl From<&Block> for BlockRow {
    fn from(block: &Block) -> Self {
        Self {
            hash: hex::encode(block.hash),
            prev_hash: block.prev_block_hash.map(hex::encode),
            timestamp: block.timestamp,
            data: String::from_utf8_lossy(&block.data).into_owned(),
        }
    }
}

fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let store = Arc::new(SledStore::open(&cli.db)?);
    let chain = Chain::open(store)?;

    match cli.cmd {
        Command::AddBlock { data } => {
            let block = chain.append(data)?;
            info!(hash = %hex::encode(block.hash), "block added");
            println!("{}", hex::encode(block.hash));
        }
        Command::PrintChain { json } => {
            for block in chain.iter() {
                let row = BlockRow::from(&block?);
                if json {
                    println!("{}", serde_json::to_string(&row)?);
                } else {
                    println!("Prev. hash: {}", row.prev_hash.unwrap_or_default());
                    println!("Data: {}", row.data);
                    println!("Hash: {}", row.hash);
                    println!();
                }
            }
        }
        Command::Head => {
            println!("{}", hex::encode(chain.tip()));
        }
    }

    chain.close()?;
    Ok(())
}
