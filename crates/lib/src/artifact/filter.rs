//! Redundant-access elimination.
//!
//! Each artifact facet carries one filter. Consecutive reads by the same
//! command through the same ref collapse to a single recorded read;
//! consecutive writes with no intervening read collapse to a single recorded
//! write. The filter only gates what enters the trace; the model itself sees
//! every access.

use std::collections::HashSet;

use crate::command::{CommandId, RefId};
use crate::options::Options;
use crate::version::Version;

#[derive(Debug, Default)]
pub struct AccessFilter {
  /// (command, ref) pairs that have read since the last write.
  observed: HashSet<(CommandId, RefId)>,

  /// The command and ref of the most recent write.
  last_writer: Option<(CommandId, RefId)>,

  /// The version that write produced; its accessed flag is cleared on write
  /// and set whenever anyone reads it.
  last_written: Option<Version>,
}

impl AccessFilter {
  /// Does this read need to enter the trace?
  pub fn read_required(&self, options: &Options, command: CommandId, ref_id: RefId) -> bool {
    if !options.combine_reads {
      return true;
    }

    !self.observed.contains(&(command, ref_id))
  }

  /// Record an emitted read.
  pub fn read(&mut self, command: CommandId, ref_id: RefId) {
    self.observed.insert((command, ref_id));
  }

  /// Does this write need to enter the trace?
  pub fn write_required(&self, options: &Options, command: CommandId, ref_id: RefId) -> bool {
    if !options.combine_writes {
      return true;
    }

    // The first write through this filter always enters the trace.
    let Some(last) = &self.last_written else {
      return true;
    };

    // A write over an accessed version must be recorded; the access order
    // would otherwise be lost.
    if last.is_accessed() {
      return true;
    }

    // Same writer, same ref, unobserved previous write: collapse.
    self.last_writer != Some((command, ref_id))
  }

  /// Record an emitted write.
  pub fn write(&mut self, options: &Options, command: CommandId, ref_id: RefId, written: Version) {
    // Any future read can observe this write, so reads must be logged again.
    self.observed.clear();

    self.last_writer = Some((command, ref_id));
    self.last_written = Some(written);

    if options.ignore_self_reads {
      // The writer reading back its own value carries no new information.
      self.observed.insert((command, ref_id));
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::version::{ContentVersion, FileVersion};
  use std::rc::Rc;

  fn write_version() -> Version {
    Version::Content(ContentVersion::File(Rc::new(FileVersion::written())))
  }

  fn cmd(n: u32) -> CommandId {
    CommandId(n)
  }

  fn r(n: u32) -> RefId {
    RefId(n)
  }

  #[test]
  fn repeated_read_is_elided() {
    let options = Options::default();
    let mut filter = AccessFilter::default();

    assert!(filter.read_required(&options, cmd(1), r(0)));
    filter.read(cmd(1), r(0));
    assert!(!filter.read_required(&options, cmd(1), r(0)));

    // A different ref or command still needs recording.
    assert!(filter.read_required(&options, cmd(1), r(1)));
    assert!(filter.read_required(&options, cmd(2), r(0)));
  }

  #[test]
  fn disabled_combine_reads_records_everything() {
    let options = Options {
      combine_reads: false,
      ..Default::default()
    };
    let mut filter = AccessFilter::default();
    filter.read(cmd(1), r(0));
    assert!(filter.read_required(&options, cmd(1), r(0)));
  }

  #[test]
  fn back_to_back_writes_collapse() {
    let options = Options::default();
    let mut filter = AccessFilter::default();

    assert!(filter.write_required(&options, cmd(1), r(0)));
    filter.write(&options, cmd(1), r(0), write_version());

    // Same writer, same ref, nothing read in between.
    assert!(!filter.write_required(&options, cmd(1), r(0)));
  }

  #[test]
  fn accessed_write_forces_new_record() {
    let options = Options::default();
    let mut filter = AccessFilter::default();

    let written = write_version();
    filter.write(&options, cmd(1), r(0), written.clone());
    written.state().mark_accessed();

    assert!(filter.write_required(&options, cmd(1), r(0)));
  }

  #[test]
  fn different_writer_forces_new_record() {
    let options = Options::default();
    let mut filter = AccessFilter::default();

    filter.write(&options, cmd(1), r(0), write_version());
    assert!(filter.write_required(&options, cmd(2), r(0)));
    assert!(filter.write_required(&options, cmd(1), r(1)));
  }

  #[test]
  fn write_clears_observed_reads() {
    let options = Options::default();
    let mut filter = AccessFilter::default();

    filter.read(cmd(2), r(3));
    filter.write(&options, cmd(1), r(0), write_version());

    assert!(filter.read_required(&options, cmd(2), r(3)));
  }

  #[test]
  fn writer_self_read_is_elided_by_default() {
    let options = Options::default();
    let mut filter = AccessFilter::default();

    filter.write(&options, cmd(1), r(0), write_version());
    assert!(!filter.read_required(&options, cmd(1), r(0)));
  }

  #[test]
  fn self_read_recorded_when_option_disabled() {
    let options = Options {
      ignore_self_reads: false,
      ..Default::default()
    };
    let mut filter = AccessFilter::default();

    filter.write(&options, cmd(1), r(0), write_version());
    assert!(filter.read_required(&options, cmd(1), r(0)));
  }
}
