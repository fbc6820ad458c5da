//! Line echo server with graceful Ctrl-C shutdown.
//!
//! ```text
//! cargo run --example echo -- 127.0.0.1:7000
//! nc 127.0.0.1 7000
//! ```
//!
//! Pass a certificate and key to serve TLS instead:
//!
//! ```text
//! cargo run --example echo -- 127.0.0.1:7443 tests/data/cert.pem tests/data/key.pem
//! ```

use tcpkit::{Context, Server, ServerConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

async fn echo_lines(ctx: &mut Context) {
    let mut lines = 0u64;
    let mut line = String::new();
    loop {
        line.clear();
        // One-byte capacity: nothing is left behind when the reader drops.
        let read = {
            let mut reader = BufReader::with_capacity(1, &mut *ctx);
            reader.read_line(&mut line).await
        };
        match read {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "read failed");
                break;
            }
        }
        if ctx.write_all(line.as_bytes()).await.is_err() || ctx.flush().await.is_err() {
            break;
        }
        lines += 1;
    }
    info!(peer = ?ctx.peer_addr(), lines, "client disconnected");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:7000".to_owned());
    let cert = args.next();
    let key = args.next();

    let server =
        Server::new(ServerConfig::with_addr(addr)).handler(|ctx| Box::pin(echo_lines(ctx)));
    let running = match (&cert, &key) {
        (Some(cert), Some(key)) => server.start_tls(cert, key),
        _ => server.start(),
    };
    if let Some(addr) = running.local_addr() {
        info!(address = %addr, tls = cert.is_some(), "echo server ready");
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            running.close();
        }
        _ = running.done() => {}
    }

    running.done().await.map_err(|e| e.to_string())?;
    Ok(())
}
