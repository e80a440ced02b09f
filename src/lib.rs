//! # homewire
//!
//! Network core of a two-core home controller: a length-framed JSON protocol
//! server with optional AES-256-CTR payload encryption, a fixed-capacity
//! client registry, latest-value broadcast to every client and rate-limited
//! persistence of a small durable record to flash.
//!
//! ## Architecture
//!
//! - **Core A** (async runtime): accept loop, per-client read/write tasks,
//!   dispatcher and a periodic driver for broadcasts, flash writes and idle
//!   reaping
//! - **Core B** (dedicated thread): the domain service's control loop, paused
//!   only around flash erase/program
//!
//! ## Wire format
//!
//! `<decimal-length>;<payload>`, where the payload is a JSON document or,
//! with a key configured, `base64(nonce || ciphertext)` of it.
//!
//! ## Example
//!
//! ```no_run
//! use homewire::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> homewire::Result<()> {
//!     let config = ServerConfig::load("homewire.toml")?;
//!     let server = Server::builder().config(config).start().await?;
//!     server.run(async { let _ = tokio::signal::ctrl_c().await; }).await
//! }
//! ```

pub mod broadcast;
pub mod cipher;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod multicore;
pub mod outbox;
pub mod protocol;
pub mod registry;
pub mod service;
pub mod store;
pub mod writer;

mod server;

pub use config::ServerConfig;
pub use error::{HomewireError, Result};
pub use server::{Server, ServerBuilder};
