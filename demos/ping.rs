//! Ping client - connects to a running server, sends `PING` and `INFO`, and
//! prints the replies.
//!
//! # Running
//!
//! ```text
//! cargo run --bin homewire -- --bind 127.0.0.1:4242
//! cargo run --example ping -- --addr 127.0.0.1:4242
//! ```
//!
//! Pass `--key <64 hex chars>` when the server is configured with one.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use clap::Parser;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use homewire::cipher::Cipher;
use homewire::protocol::{encode, FrameBuffer};

#[derive(Debug, Parser)]
struct Args {
    /// Server address.
    #[arg(short, long, default_value = "127.0.0.1:4242")]
    addr: SocketAddr,

    /// Shared AES-256 key, hex.
    #[arg(short, long)]
    key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let cipher = match &args.key {
        Some(key) => Cipher::from_hex(key)?,
        None => Cipher::disabled(),
    };

    let mut stream = TcpStream::connect(args.addr).await?;
    println!("connected as {}", stream.local_addr()?);

    for request in [json!({"id": "1", "type": "PING"}), json!({"id": "2", "type": "INFO"})] {
        let sealed = cipher.seal(&serde_json::to_vec(&request)?)?;
        stream.write_all(&encode(&sealed)).await?;
    }

    // Two replies expected; broadcasts may arrive in between.
    let mut frames = FrameBuffer::new(4096);
    let mut buf = [0u8; 1024];
    let mut replies = 0;
    while replies < 2 {
        let n = tokio::time::timeout(Duration::from_secs(3), stream.read(&mut buf)).await??;
        if n == 0 {
            println!("server closed the connection");
            break;
        }
        for frame in frames.feed(&buf[..n], Instant::now()) {
            let plain = cipher.open(&frame?)?;
            let message: Value = serde_json::from_slice(&plain)?;
            println!("{}", serde_json::to_string_pretty(&message)?);
            if message["client_id"] != "server" {
                replies += 1;
            }
        }
    }

    Ok(())
}
