use anyhow::Result;
use autocom_agents::cli::{self, Args};
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(cli::log_filter(args.log_level.as_deref())?)
        .with_writer(std::io::stderr)
        .init();

    cli::run(args).await
}
