//! retrace: a trace-based incremental build tool.
//!
//! - `retrace build` - load the prior trace, rerun what changed, record a new trace
//! - `retrace check` - report which commands would rerun, without executing
//! - `retrace gc` - drop cache content the current trace no longer references

mod cmd;
mod output;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use output::OutputFormat;

#[derive(Parser)]
#[command(name = "retrace")]
#[command(version, about = "Trace-based incremental builds")]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Run the build, rerunning only commands whose inputs changed
  Build {
    /// Compute and print the must-rerun set without launching anything
    #[arg(long)]
    dry_run: bool,

    /// Print each command as it launches
    #[arg(long)]
    print_on_run: bool,

    /// Record every read, even repeats by the same command
    #[arg(long)]
    no_combine_reads: bool,

    /// Record every write, even overwrites by the same command
    #[arg(long)]
    no_combine_writes: bool,

    /// Record commands reading back their own writes
    #[arg(long)]
    no_ignore_self_reads: bool,
  },

  /// Report which commands would rerun
  Check {
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
  },

  /// Remove cache content the trace no longer references
  Gc {
    /// Report what would be removed without deleting anything
    #[arg(long)]
    dry_run: bool,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
  },
}

fn main() {
  let cli = Cli::parse();

  let level = if cli.verbose { Level::DEBUG } else { Level::WARN };
  FmtSubscriber::builder()
    .with_max_level(level)
    .with_target(false)
    .without_time()
    .with_writer(std::io::stderr)
    .init();

  let result = match cli.command {
    Commands::Build {
      dry_run,
      print_on_run,
      no_combine_reads,
      no_combine_writes,
      no_ignore_self_reads,
    } => cmd::cmd_build(
      dry_run,
      print_on_run,
      no_combine_reads,
      no_combine_writes,
      no_ignore_self_reads,
    ),
    Commands::Check { format } => cmd::cmd_check(format),
    Commands::Gc { dry_run, format } => cmd::cmd_gc(dry_run, format),
  };

  match result {
    Ok(code) => std::process::exit(code),
    Err(error) => {
      output::print_error(&format!("{:#}", error));
      std::process::exit(2);
    }
  }
}
