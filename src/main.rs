use anyhow::Context;
use clap::Parser;
use visited_countries::{cli, init_tracing, Cli};

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_filter());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;
    let input = args.csv_file.display().to_string();
    runtime
        .block_on(cli::run(args))
        .with_context(|| format!("failed to process {input}"))?;
    Ok(())
}
