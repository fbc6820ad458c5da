//! # tcpkit
//!
//! A reusable async TCP/TLS server skeleton. Bring your own protocol: each
//! accepted connection gets a pooled [`Context`] and is passed through a
//! chain of handlers.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tcpkit::{Server, ServerConfig};
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = Server::new(ServerConfig::with_addr("127.0.0.1:7000")).handler(|ctx| {
//!         Box::pin(async move {
//!             let mut buf = [0u8; 1024];
//!             loop {
//!                 let n = match ctx.read(&mut buf).await {
//!                     Ok(0) | Err(_) => break,
//!                     Ok(n) => n,
//!                 };
//!                 if ctx.write_all(&buf[..n]).await.is_err() || ctx.flush().await.is_err() {
//!                     break;
//!                 }
//!             }
//!         })
//!     });
//!
//!     let running = server.start();
//!     tokio::signal::ctrl_c().await.ok();
//!     running.close();
//!     running.done().await.ok();
//! }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod handler;
pub mod logging;
pub mod net;
pub mod server;

pub use config::ServerConfig;
pub use context::{Context, ContextPool};
pub use error::{ConfigError, ServerError};
pub use handler::{Chain, Handler, HandlerFuture, HandlerPanic, echo, handler_fn};
pub use logging::ErrorLog;
pub use net::Listener;
pub use server::{Graceful, Server};
