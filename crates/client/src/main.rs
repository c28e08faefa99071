//! StripeKV command-line client

use anyhow::Result;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use client::Client;
use sk_core::Key;

#[derive(Parser, Debug)]
#[command(name = "stripekv")]
#[command(about = "StripeKV client - talk to a gateway")]
struct Args {
    /// Gateway application address
    #[arg(short, long, default_value = "127.0.0.1:9000")]
    addr: String,

    /// Client instance id (unique per process)
    #[arg(short, long, default_value_t = 100)]
    instance_id: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read a key
    Get { key: String },
    /// Write a key
    Set { key: String, value: String },
    /// Overwrite part of a value in place
    Update {
        key: String,
        offset: u32,
        data: String,
    },
    /// Remove a key
    Delete { key: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::WARN)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let client = Client::connect(&args.addr, args.instance_id).await?;
    match args.command {
        Command::Get { key } => match client.get(Key::from(key.as_str())).await? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => println!("(not found)"),
        },
        Command::Set { key, value } => {
            let ok = client
                .set(Key::from(key.as_str()), Bytes::from(value))
                .await?;
            println!("{}", if ok { "OK" } else { "FAILED" });
        }
        Command::Update { key, offset, data } => {
            let ok = client
                .update(Key::from(key.as_str()), offset, Bytes::from(data))
                .await?;
            println!("{}", if ok { "OK" } else { "FAILED" });
        }
        Command::Delete { key } => {
            let ok = client.delete(Key::from(key.as_str())).await?;
            println!("{}", if ok { "OK" } else { "FAILED" });
        }
    }
    Ok(())
}
