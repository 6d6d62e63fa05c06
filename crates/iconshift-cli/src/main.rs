mod completion;
mod dispatch;
mod render;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use iconshift_core::{Target, TargetKind};
use tracing::error;

use crate::completion::CliCompletionShell;
use crate::render::{current_output_style, format_error_lines};

#[derive(Parser, Debug)]
#[command(name = "iconshift")]
#[command(
    about = "Transactional icon replacement for folders, file types, shortcuts and executables",
    long_about = None
)]
struct Cli {
    /// Directory holding backups and config.toml.
    #[arg(long, global = true)]
    state_root: Option<PathBuf>,
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Re-run elevated when a target needs administrator rights.
    #[arg(long, global = true)]
    elevate: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replace one icon and commit the change as a backup.
    Apply {
        kind: CliTargetKind,
        value: String,
        #[arg(long)]
        icon: PathBuf,
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        index: i32,
        /// Apply, report, then roll back without writing a backup.
        #[arg(long)]
        no_commit: bool,
    },
    /// Run a TOML batch plan.
    Batch { plan: PathBuf },
    Restore { backup_id: String },
    Backups {
        #[command(subcommand)]
        command: BackupsCommands,
    },
    /// Re-hash every backup object.
    Verify,
    ClearCache,
    Assess {
        kind: CliTargetKind,
        value: String,
    },
    Completion {
        #[arg(value_enum)]
        shell: Option<CliCompletionShell>,
    },
}

#[derive(Subcommand, Debug)]
enum BackupsCommands {
    List {
        #[arg(long)]
        json: bool,
    },
    Delete {
        backup_id: String,
    },
    Cleanup {
        #[arg(long)]
        retain: Option<usize>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum CliTargetKind {
    Folder,
    FileType,
    Shortcut,
    Executable,
}

impl CliTargetKind {
    fn target(self, value: &str) -> Target {
        TargetKind::from(self).target_from(value)
    }
}

impl From<CliTargetKind> for TargetKind {
    fn from(kind: CliTargetKind) -> Self {
        match kind {
            CliTargetKind::Folder => TargetKind::Folder,
            CliTargetKind::FileType => TargetKind::FileType,
            CliTargetKind::Shortcut => TargetKind::Shortcut,
            CliTargetKind::Executable => TargetKind::Executable,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let style = current_output_style();

    if let Err(err) = dispatch::run_cli(cli) {
        error!("{err:#}");
        for line in format_error_lines(style, &err) {
            eprintln!("{line}");
        }
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests;
