//! Operational CLI surface: `status`, `update`, `restart`, `edit`,
//! `edit-env`, `logs`, `admin create|update`. Talks to a running panel over
//! its narrow HTTP surface for status/settings, and to the host's `systemd`/
//! `journalctl` for process lifecycle and logs.

mod admin;
mod config;
mod ops;

use clap::{Parser, Subcommand};

use crate::config::CliConfig;

#[derive(Parser)]
#[command(name = "tunnelmux", version, about = "Operate a tunnelmux panel")]
struct Cli {
  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Manage the panel admin identity.
  Admin {
    #[command(subcommand)]
    action: AdminAction,
  },
  /// Show panel process and API status.
  Status,
  /// Update the panel (reload unit definitions, restart).
  Update,
  /// Restart the panel, preserving applied tunnels.
  Restart,
  /// Edit the panel's systemd unit file.
  Edit,
  /// Edit the panel's environment file.
  EditEnv,
  /// View panel logs via journalctl.
  Logs {
    /// Follow the log output.
    #[arg(short, long)]
    follow: bool,
  },
}

#[derive(Subcommand)]
enum AdminAction {
  /// Create the panel admin.
  Create {
    #[arg(long)]
    username: Option<String>,
    #[arg(long)]
    password: Option<String>,
  },
  /// Update the panel admin's password.
  Update {
    #[arg(long)]
    password: Option<String>,
  },
}

fn main() -> anyhow::Result<()> {
  let cli = Cli::parse();
  let config = CliConfig::from_env();

  match cli.command {
    Commands::Admin { action } => match action {
      AdminAction::Create { username, password } => admin::create(&config, username, password),
      AdminAction::Update { password } => admin::update(&config, password),
    },
    Commands::Status => ops::status(&config),
    Commands::Update => ops::update(&config),
    Commands::Restart => ops::restart(&config),
    Commands::Edit => ops::edit(&config),
    Commands::EditEnv => ops::edit_env(&config),
    Commands::Logs { follow } => ops::logs(&config, follow),
  }
}
