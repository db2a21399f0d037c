//! muxlink standalone binary.

use clap::Parser;
use muxlink_server::cli::{run, Args};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    run(args).await
}
