//! CMMS RPC - demo server and one-shot client for the duplex RPC transport.
//!
//! `serve` runs an `RpcServer` with a small set of session and utility
//! handlers; `call` connects, completes the handshake, issues one call on the
//! assigned channel and prints the result along with any pushes observed.

mod call;
mod handlers;
mod serve;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "cmms-rpc")]
#[command(about = "Duplex RPC server and client for CMMS")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the demo RPC server
    Serve {
        /// Port to listen on (0 = auto-assign)
        #[arg(short, long, default_value = "0")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Broadcast a "Notice" push to every channel this often (seconds)
        #[arg(long)]
        notice_interval: Option<u64>,
    },
    /// Connect, issue one call and print the result
    Call {
        /// Server address
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: String,

        /// Method to call, e.g. "Login.Whoami"
        #[arg(short, long)]
        method: String,

        /// JSON parameters; the channel id is added automatically
        #[arg(long, default_value = "null")]
        params: String,

        /// Keep listening for pushes this long after the reply (seconds)
        #[arg(long, default_value = "0")]
        listen: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match args.command {
        Command::Serve {
            port,
            host,
            notice_interval,
        } => serve::run(&host, port, notice_interval).await,
        Command::Call {
            addr,
            method,
            params,
            listen,
        } => call::run(&addr, &method, &params, listen).await,
    }
}
