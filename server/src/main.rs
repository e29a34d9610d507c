use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{Context, Result};
use clap::Parser;
use latchkey_common::config::{ServerCredentialPaths, DEFAULT_ADDRESS, DEFAULT_PORT};
use latchkey_server::{EchoOptions, EchoServer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "latchkey-echo")]
#[command(about = "Mutual-TLS echo server for the latchkey client")]
struct Args {
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Address to listen on
    #[arg(short, long, default_value = DEFAULT_ADDRESS)]
    address: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Directory holding server.pem, server.key.pem and root-ca.pem
    #[arg(long)]
    certs_dir: Option<PathBuf>,

    /// Send close_notify after echoing the first message
    #[arg(long)]
    close_after_first_echo: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal, stopping server...");
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    let paths = match &args.certs_dir {
        Some(dir) => ServerCredentialPaths::in_dir(dir),
        None => ServerCredentialPaths::new(),
    };
    if !paths.cert_path.exists() {
        warn!("Server certificate not found at {:?}", paths.cert_path);
    }

    let options = EchoOptions::default().with_close_after_first_echo(args.close_after_first_echo);
    let server = EchoServer::bind(&paths, (args.address.as_str(), args.port))
        .context("Failed to create echo server")?
        .with_options(options);

    server.run_with_shutdown(running).context("Server error")?;
    info!("Server stopped");
    Ok(())
}
