//! # Remora Shell
//!
//! Interactive client for a Remora server. Connects through the remote
//! layer and exposes simple key-value commands against named indexes.

use remora::{ClientConfig, Database, RemoteError, Result, VERSION};
use tokio::io::{stdin, AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> Result<()> {
    println!("╔══════════════════════════════════════════════════════════╗");
    println!("║            Remora Shell - Interactive Client             ║");
    println!("║                    Version {}                         ║", VERSION);
    println!("╚══════════════════════════════════════════════════════════╝");
    println!();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9206".to_string());
    let tokens: Vec<u64> = std::env::args()
        .skip(2)
        .filter_map(|raw| raw.parse().ok())
        .collect();

    println!("Connecting to Remora server at {}...", addr);
    let db = Database::connect(ClientConfig::new(addr).with_tokens(&tokens)).await?;
    println!("Connected successfully!");
    println!("Commands: open <index>, get <k>, put <k> <v>, del <k>, scan, stats, exit");
    println!();

    let mut reader = BufReader::new(stdin()).lines();
    let mut index: Option<remora::Index> = None;

    loop {
        print_prompt(index.as_ref());
        let Ok(Some(line)) = reader.next_line().await else {
            break;
        };
        let parts: Vec<&str> = line.split_whitespace().collect();
        let result = match parts.as_slice() {
            [] => Ok(()),
            ["exit"] | ["quit"] => break,
            ["open", name] => match db.open_index(name.as_bytes()).await {
                Ok(opened) => {
                    println!("opened index {} (id {})", name, opened.id());
                    index = Some(opened);
                    Ok(())
                }
                Err(e) => Err(e),
            },
            ["get", key] => match &index {
                Some(ix) => get(ix, key).await,
                None => no_index(),
            },
            ["put", key, value] => match &index {
                Some(ix) => put(ix, key, value).await,
                None => no_index(),
            },
            ["del", key] => match &index {
                Some(ix) => del(ix, key).await,
                None => no_index(),
            },
            ["scan"] => match &index {
                Some(ix) => scan(ix).await,
                None => no_index(),
            },
            ["stats"] => stats(&db).await,
            _ => {
                println!("unknown command");
                Ok(())
            }
        };
        if let Err(e) = result {
            println!("error: {}", e);
        }
    }

    db.close().await.ok();
    println!("Goodbye!");
    Ok(())
}

fn print_prompt(index: Option<&remora::Index>) {
    use std::io::Write;
    match index {
        Some(index) => print!("remora:{}> ", index.name_string()),
        None => print!("remora> "),
    }
    std::io::stdout().flush().ok();
}

fn no_index() -> Result<()> {
    Err(RemoteError::illegal_state("no index open; use: open <name>"))
}

/// Printable form of a stored value; binary values render as hex.
fn display(value: &[u8]) -> String {
    match std::str::from_utf8(value) {
        Ok(text) => text.to_string(),
        Err(_) => format!("0x{}", hex::encode(value)),
    }
}

async fn get(index: &remora::Index, key: &str) -> Result<()> {
    match index.load(None, key.as_bytes()).await? {
        Some(value) => println!("{}", display(&value)),
        None => println!("(not found)"),
    }
    Ok(())
}

async fn put(index: &remora::Index, key: &str, value: &str) -> Result<()> {
    index
        .store(None, key.as_bytes(), Some(value.as_bytes()))
        .await?;
    println!("ok");
    Ok(())
}

async fn del(index: &remora::Index, key: &str) -> Result<()> {
    if index.delete(None, key.as_bytes()).await? {
        println!("deleted");
    } else {
        println!("(not found)");
    }
    Ok(())
}

async fn scan(index: &remora::Index) -> Result<()> {
    let cursor = index.new_cursor(None).await?;
    let mut result = cursor.first().await?;
    let _ = result;
    let mut count = 0u64;
    while let Some(key) = cursor.key() {
        let value = cursor.value().into_option().unwrap_or_default();
        println!("{} = {}", String::from_utf8_lossy(&key), display(&value));
        count += 1;
        result = cursor.next().await?;
        let _ = result;
    }
    println!("({} entries)", count);
    Ok(())
}

async fn stats(db: &Database) -> Result<()> {
    let stats = db.stats().await?;
    println!("page size:        {}", stats.page_size);
    println!("total pages:      {}", stats.total_pages);
    println!("open indexes:     {}", stats.open_indexes);
    println!("locks held:       {}", stats.lock_count);
    println!("live cursors:     {}", stats.cursor_count);
    println!("transactions:     {}", stats.transaction_count);
    Ok(())
}
