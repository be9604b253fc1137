//! Runtime options controlling trace filtering and build execution.

use crate::consts::DEFAULT_COMMAND_LENGTH;

/// Options recognized by the engine and the trace filters.
///
/// The combine/ignore toggles control the redundant-access elimination
/// performed by the per-artifact access filters; they default to on and are
/// disabled by the corresponding `--no-*` CLI flags.
#[derive(Debug, Clone)]
pub struct Options {
  /// Collapse repeated reads by the same command through the same ref.
  pub combine_reads: bool,

  /// Collapse repeated writes by the same command through the same ref.
  pub combine_writes: bool,

  /// Suppress a command reading back its own most recent write.
  pub ignore_self_reads: bool,

  /// Print each command's short name as it launches.
  pub print_on_run: bool,

  /// Compute and print the must-rerun set without launching anything.
  pub dry_run: bool,

  /// Column budget for command short names.
  pub command_length: usize,
}

impl Default for Options {
  fn default() -> Self {
    Options {
      combine_reads: true,
      combine_writes: true,
      ignore_self_reads: true,
      print_on_run: false,
      dry_run: false,
      command_length: DEFAULT_COMMAND_LENGTH,
    }
  }
}
