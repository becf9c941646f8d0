mod app;
mod bundle;
mod cache;
mod classify;
mod commands;
mod config;
mod connectivity;
mod http;
mod interceptor;
mod logging;
mod queue;
mod shell;
#[cfg(test)]
mod testing;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "hsync")]
#[command(about = "Offline caching and write replay for the heritage API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/heritage-sync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Debug logging (overrides HSYNC_LOG)
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(args.verbose)?;

  let config = config::Config::load(args.config.as_deref())?;

  let app = app::App::new(config)?;
  app.run(args.command).await?;

  Ok(())
}
