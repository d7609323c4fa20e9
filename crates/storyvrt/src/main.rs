mod artifacts;
mod capture;
mod cdp;
mod cli;
mod compare;
mod config;
mod pool;
mod report;
mod runner;
mod storybook;

use anyhow::{Result, bail};
use clap::Parser;
use config::{RunConfig, RunMode};
use tracing_subscriber::EnvFilter;

fn init_tracing(cli_filter: Option<String>) {
    // RUST_LOG wins over CLI flags, which win over the default.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(cli_filter.unwrap_or_else(|| "storyvrt=info".to_string()))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    match cli.command {
        cli::Command::Init { url, force } => {
            init_tracing(None);
            init(&url, force)?;
        }
        cli::Command::Test { args } => {
            init_tracing(args.log_filter());
            let config = RunConfig::resolve(RunMode::Test, args.into())?;
            let code = runner::run(config).await?;
            std::process::exit(code);
        }
        cli::Command::Update { args, clean } => {
            init_tracing(args.log_filter());
            let config = RunConfig::resolve(RunMode::Update { clean }, args.into())?;
            let code = runner::run(config).await?;
            std::process::exit(code);
        }
    }

    Ok(())
}

/// `storyvrt init` — create .storyvrt/config.toml.
fn init(url: &str, force: bool) -> Result<()> {
    if !force && config::config_file_exists() {
        bail!(".storyvrt/config.toml already exists (use --force to overwrite)");
    }

    config::write_template(url)?;
    config::write_gitignore(force)?;

    let verb = if force { "Regenerated" } else { "Created" };
    println!("{verb} .storyvrt/config.toml");
    println!("  storybook.url = {url}");
    Ok(())
}
