mod app;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;
use tierfetch::config::Config;
use tierfetch::logging;

use app::{App, WatchTarget};

#[derive(Parser, Debug)]
#[command(name = "tierfetch")]
#[command(about = "Read site content with live, cache and bundled-snapshot fallback")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tierfetch/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Mirror logs to stderr
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List posts, newest first
  Posts {
    /// Only posts for this service
    #[arg(short, long)]
    service: Option<String>,
  },
  /// Show a single post
  Post { id: i64 },
  /// List services
  Services,
  /// Fill the content database from the bundled snapshot
  Seed,
  /// Keep a query mounted and print every change until Ctrl-C
  Watch {
    #[command(subcommand)]
    target: WatchCommand,
  },
}

#[derive(Subcommand, Debug)]
enum WatchCommand {
  Posts {
    #[arg(short, long)]
    service: Option<String>,
  },
  Services,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _guard = logging::init(&config.logging, args.verbose)?;

  let app = App::new(config)?;
  match args.command {
    Command::Posts { service } => app.posts(service.as_deref()).await?,
    Command::Post { id } => app.post(id).await?,
    Command::Services => app.services().await?,
    Command::Seed => app.seed().await?,
    Command::Watch { target } => {
      let target = match target {
        WatchCommand::Posts { service } => WatchTarget::Posts { service },
        WatchCommand::Services => WatchTarget::Services,
      };
      app.watch(target).await?
    }
  }

  Ok(())
}
