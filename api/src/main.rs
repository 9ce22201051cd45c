use anyhow::Result;
use clap::Parser;

mod args;
mod auth;
mod error;
mod handlers;
mod server;
mod state;

use args::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    previewctl_common::init();
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => server::run_server(args).await,
        Commands::Migrate(args) => {
            let pool = previewctl_common::postgres::create_pool(args.postgres).await;
            previewctl_core::migrate::run(&pool).await?;
            println!("migrations applied");
            Ok(())
        }
    }
}
