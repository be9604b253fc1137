//! End-to-end scenarios: a recorded compile replayed against changed and
//! unchanged filesystems, trace fallback, write combining, and replay
//! determinism.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serial_test::serial;
use tempfile::TempDir;

use retrace_lib::artifact::{ArtifactId, SpecialEntity};
use retrace_lib::command::{CommandDef, CommandId, RefId};
use retrace_lib::driver;
use retrace_lib::engine::Build;
use retrace_lib::fingerprint::{hash_bytes, Fingerprint};
use retrace_lib::flags::AccessFlags;
use retrace_lib::options::Options;
use retrace_lib::plan::{BuildObserver, InputType, NoopObserver, RebuildPlanner};
use retrace_lib::platform::paths;
use retrace_lib::trace::{replay, ContentData, InputTrace, OutputTrace, Record, TraceSink};
use retrace_lib::version::{Scenario, Version};

/// Run `f` with the build directory pointed at a fresh temp dir.
fn with_build_dir<F: FnOnce()>(f: F) {
  let temp = TempDir::new().unwrap();
  temp_env::with_var("RETRACE_DIR", Some(temp.path().to_str().unwrap()), f);
}

fn file_data(hash: Fingerprint) -> ContentData {
  ContentData::File {
    empty: false,
    cached: false,
    mtime: None,
    hash: Some(hash),
  }
}

fn root_def() -> CommandDef {
  CommandDef {
    args: Vec::new(),
    exe: RefId(5),
    cwd: RefId(4),
    root: RefId(3),
    initial_fds: BTreeMap::from([(0, RefId(0)), (1, RefId(1)), (2, RefId(2))]),
    executed: true,
  }
}

fn child_def(args: &[&str], executed: bool) -> CommandDef {
  CommandDef {
    args: args.iter().map(|s| s.to_string()).collect(),
    exe: RefId(0),
    cwd: RefId(1),
    root: RefId(2),
    initial_fds: BTreeMap::from([(0, RefId(3)), (1, RefId(4)), (2, RefId(5))]),
    executed,
  }
}

fn prelude(child: CommandDef) -> Vec<Record> {
  vec![
    Record::Command { id: 0, def: root_def() },
    Record::SpecialRef {
      cmd: 0,
      entity: SpecialEntity::Stdin,
      output: RefId(0),
    },
    Record::SpecialRef {
      cmd: 0,
      entity: SpecialEntity::Stdout,
      output: RefId(1),
    },
    Record::SpecialRef {
      cmd: 0,
      entity: SpecialEntity::Stderr,
      output: RefId(2),
    },
    Record::SpecialRef {
      cmd: 0,
      entity: SpecialEntity::Root,
      output: RefId(3),
    },
    Record::SpecialRef {
      cmd: 0,
      entity: SpecialEntity::Cwd,
      output: RefId(4),
    },
    Record::SpecialRef {
      cmd: 0,
      entity: SpecialEntity::LaunchExe,
      output: RefId(5),
    },
    Record::Command { id: 1, def: child },
    Record::Launch {
      cmd: 0,
      child: 1,
      refs: vec![
        (RefId(5), RefId(0)),
        (RefId(4), RefId(1)),
        (RefId(3), RefId(2)),
        (RefId(0), RefId(3)),
        (RefId(1), RefId(4)),
        (RefId(2), RefId(5)),
      ],
    },
  ]
}

fn epilogue() -> Vec<Record> {
  vec![
    Record::Join {
      cmd: 0,
      child: 1,
      exit_status: 0,
    },
    Record::Exit { cmd: 0, exit_status: 0 },
    Record::End,
  ]
}

/// A recorded `cc -c foo.c -o foo.o` run: read the source, write the object,
/// with the post-build predicate on the object the previous build emitted.
fn compile_trace(work: &Path, src_hash: Fingerprint, out_hash: Fingerprint) -> Vec<Record> {
  let mut records = prelude(child_def(&["cc", "-c", "foo.c", "-o", "foo.o"], true));

  records.extend([
    Record::PathRef {
      cmd: 1,
      base: RefId(2),
      path: work.join("foo.c"),
      flags: AccessFlags::read_only(),
      output: RefId(6),
    },
    Record::ExpectResult {
      cmd: 1,
      scenario: Scenario::Build,
      r: RefId(6),
      expected: 0,
    },
    Record::MatchContent {
      cmd: 1,
      scenario: Scenario::Build,
      r: RefId(6),
      version: file_data(src_hash),
    },
    Record::PathRef {
      cmd: 1,
      base: RefId(2),
      path: work.join("foo.o"),
      flags: AccessFlags {
        write: true,
        create: true,
        truncate: true,
        mode: 0o644,
        ..Default::default()
      },
      output: RefId(7),
    },
    Record::ExpectResult {
      cmd: 1,
      scenario: Scenario::Build,
      r: RefId(7),
      expected: 0,
    },
    Record::UpdateContent {
      cmd: 1,
      r: RefId(7),
      version: file_data(out_hash),
    },
    Record::MatchContent {
      cmd: 1,
      scenario: Scenario::PostBuild,
      r: RefId(7),
      version: file_data(out_hash),
    },
    Record::Exit { cmd: 1, exit_status: 0 },
  ]);

  records.extend(epilogue());
  records
}

fn write_trace(records: &[Record]) {
  let mut out = OutputTrace::create(paths::trace_temp_path(), paths::trace_path()).unwrap();
  replay(records, &mut out).unwrap();
}

struct CompileFixture {
  _work: TempDir,
  work: PathBuf,
}

/// Set up foo.c and foo.o on disk plus the matching trace.
fn compile_fixture() -> CompileFixture {
  let work_dir = TempDir::new().unwrap();
  let work = work_dir.path().to_path_buf();

  std::fs::write(work.join("foo.c"), b"int main() { return 0; }\n").unwrap();
  std::fs::write(work.join("foo.o"), b"\x7fELF object bytes").unwrap();

  let src_hash = hash_bytes(b"int main() { return 0; }\n");
  let out_hash = hash_bytes(b"\x7fELF object bytes");
  write_trace(&compile_trace(&work, src_hash, out_hash));

  CompileFixture {
    _work: work_dir,
    work,
  }
}

#[test]
#[serial]
fn untouched_build_reruns_nothing() {
  with_build_dir(|| {
    let _fixture = compile_fixture();

    let report = driver::check(&Options::default()).unwrap();
    assert!(
      report.is_up_to_date(),
      "unexpected rerun: {:?}",
      report.would_rerun
    );
  });
}

#[test]
#[serial]
fn modified_input_reruns_the_consumer() {
  with_build_dir(|| {
    let fixture = compile_fixture();
    std::fs::write(fixture.work.join("foo.c"), b"int main() { return 1; }\n").unwrap();

    let report = driver::check(&Options::default()).unwrap();
    assert_eq!(report.would_rerun.len(), 1);
    assert!(report.would_rerun[0].command.starts_with("cc"));
    assert!(report.would_rerun[0].reason.contains("content"));
  });
}

#[test]
#[serial]
fn deleted_output_reruns_the_producer() {
  with_build_dir(|| {
    let fixture = compile_fixture();
    std::fs::remove_file(fixture.work.join("foo.o")).unwrap();

    let report = driver::check(&Options::default()).unwrap();
    assert!(
      report.would_rerun.iter().any(|e| e.command.starts_with("cc")),
      "producer not selected: {:?}",
      report.would_rerun
    );
  });
}

#[test]
#[serial]
fn touched_input_with_same_content_stays_clean() {
  with_build_dir(|| {
    let fixture = compile_fixture();

    // Rewrite identical bytes; the mtime changes but the hash does not.
    std::fs::write(fixture.work.join("foo.c"), b"int main() { return 0; }\n").unwrap();

    let report = driver::check(&Options::default()).unwrap();
    assert!(report.is_up_to_date());
  });
}

#[test]
#[serial]
fn full_build_emulates_everything_when_clean() {
  with_build_dir(|| {
    let _fixture = compile_fixture();

    let summary = driver::build(&Options::default()).unwrap();
    assert!(summary.executed);
    assert!(summary.succeeded);
    assert_eq!(summary.traced_commands, 0);
    assert_eq!(summary.traced_steps, 0);
    assert!(summary.emulated_commands > 0);

    // The rewritten trace (now carrying regenerated post-build predicates)
    // still plans an empty rebuild.
    let report = driver::check(&Options::default()).unwrap();
    assert!(
      report.is_up_to_date(),
      "rewritten trace plans work: {:?}",
      report.would_rerun
    );
  });
}

#[test]
#[serial]
fn invalid_trace_falls_back_to_full_build() {
  with_build_dir(|| {
    std::fs::create_dir_all(paths::build_dir()).unwrap();
    let mut bytes = 0xDEADu64.to_le_bytes().to_vec();
    bytes.extend_from_slice(&1u64.to_le_bytes());
    std::fs::write(paths::trace_path(), bytes).unwrap();

    let report = driver::check(&Options::default()).unwrap();
    assert_eq!(report.would_rerun.len(), 1);
    assert!(report.would_rerun[0].command.starts_with("sh"));
    assert_eq!(report.would_rerun[0].reason, "never run");
  });
}

#[test]
#[serial]
fn missing_trace_plans_the_whole_build() {
  with_build_dir(|| {
    let report = driver::check(&Options::default()).unwrap();
    assert_eq!(report.would_rerun.len(), 1);
    assert_eq!(report.would_rerun[0].reason, "never run");
  });
}

#[test]
#[serial]
fn exit_only_root_trace_plans_nothing() {
  with_build_dir(|| {
    write_trace(&[
      Record::Command { id: 0, def: root_def() },
      Record::Exit { cmd: 0, exit_status: 0 },
      Record::End,
    ]);

    let report = driver::check(&Options::default()).unwrap();
    assert!(report.is_up_to_date());
  });
}

#[test]
#[serial]
fn pipe_content_matches_never_mismatch() {
  with_build_dir(|| {
    write_trace(&[
      Record::Command { id: 0, def: root_def() },
      Record::PipeRef {
        cmd: 0,
        read_end: RefId(6),
        write_end: RefId(7),
      },
      Record::MatchContent {
        cmd: 0,
        scenario: Scenario::Build,
        r: RefId(6),
        version: ContentData::PipeRead { writes: 0 },
      },
      Record::Exit { cmd: 0, exit_status: 0 },
      Record::End,
    ]);

    let report = driver::check(&Options::default()).unwrap();
    assert!(report.is_up_to_date());
  });
}

#[test]
#[serial]
fn exit_code_change_marks_the_joining_parent() {
  with_build_dir(|| {
    // The child's recorded exit disagrees with the join's expectation, as
    // happens when a rerun child exits differently.
    let mut records = prelude(child_def(&["test", "-f", "out"], true));
    records.push(Record::Exit { cmd: 1, exit_status: 1 });
    records.extend(epilogue());

    let mut planner = RebuildPlanner::default();
    {
      let mut engine = Build::emulator(&mut planner, Options::default());
      replay(&records, &mut engine).unwrap();
    }

    let plan = planner.plan();
    assert!(plan.must_rerun(CommandId(0)));
    assert!(!plan.must_rerun(CommandId(1)));
  });
}

#[test]
#[serial]
fn back_to_back_writes_collapse_into_one_step() {
  with_build_dir(|| {
    let counts = |options: Options| {
      let mut observer = NoopObserver;
      let mut engine = Build::emulator(&mut observer, options);
      engine
        .define_command(CommandId(0), &child_def(&["writer"], true))
        .unwrap();

      let r = engine.trace_file_ref(CommandId(0), 0o644).unwrap();
      engine
        .trace_update_content(CommandId(0), r, file_data(hash_bytes(b"a")))
        .unwrap();
      engine
        .trace_update_content(CommandId(0), r, file_data(hash_bytes(b"b")))
        .unwrap();

      let buffer = engine.take_output();
      buffer
        .records()
        .iter()
        .filter(|record| matches!(record, Record::UpdateContent { .. }))
        .count()
    };

    assert_eq!(counts(Options::default()), 1);

    let split = Options {
      combine_writes: false,
      ..Default::default()
    };
    assert_eq!(counts(split), 2);
  });
}

#[test]
#[serial]
fn repeated_reads_collapse_into_one_step() {
  with_build_dir(|| {
    let counts = |options: Options| {
      let mut observer = NoopObserver;
      let mut engine = Build::emulator(&mut observer, options);
      engine
        .define_command(CommandId(0), &child_def(&["reader"], true))
        .unwrap();

      let r = engine.trace_file_ref(CommandId(0), 0o644).unwrap();
      engine.trace_match_content(CommandId(0), r).unwrap();
      engine.trace_match_content(CommandId(0), r).unwrap();

      let buffer = engine.take_output();
      buffer
        .records()
        .iter()
        .filter(|record| matches!(record, Record::MatchContent { .. }))
        .count()
    };

    assert_eq!(counts(Options::default()), 1);

    let split = Options {
      combine_reads: false,
      ..Default::default()
    };
    assert_eq!(counts(split), 2);
  });
}

/// Records observer signals as comparable strings.
#[derive(Default)]
struct Recorder {
  signals: Vec<String>,
}

impl BuildObserver for Recorder {
  fn observe_output(&mut self, c: CommandId, a: ArtifactId, v: &Version) {
    self.signals.push(format!("output {} {} {}", c, a, v.kind_name()));
  }

  fn observe_input(&mut self, c: CommandId, a: ArtifactId, v: &Version, _t: InputType) {
    self.signals.push(format!("input {} {} {}", c, a, v.kind_name()));
  }

  fn observe_mismatch(
    &mut self,
    c: CommandId,
    scenario: Scenario,
    a: ArtifactId,
    _observed: Option<&Version>,
    expected: &Version,
  ) {
    self
      .signals
      .push(format!("mismatch {} {} {:?} {}", c, a, scenario, expected.kind_name()));
  }

  fn observe_launch(&mut self, parent: Option<CommandId>, child: CommandId) {
    self.signals.push(format!("launch {:?} {}", parent, child));
  }

  fn observe_command_never_run(&mut self, c: CommandId) {
    self.signals.push(format!("never-run {}", c));
  }

  fn observe_resolution_change(
    &mut self,
    c: CommandId,
    _scenario: Scenario,
    r: RefId,
    expected: i32,
    observed: i32,
  ) {
    self
      .signals
      .push(format!("resolution-change {} {} {} {}", c, r, expected, observed));
  }

  fn observe_exit_code_change(&mut self, parent: CommandId, child: CommandId, expected: i32, observed: i32) {
    self
      .signals
      .push(format!("exit-change {} {} {} {}", parent, child, expected, observed));
  }
}

#[test]
#[serial]
fn replaying_a_trace_is_deterministic() {
  with_build_dir(|| {
    let fixture = compile_fixture();
    let src_hash = hash_bytes(b"int main() { return 0; }\n");
    let out_hash = hash_bytes(b"\x7fELF object bytes");
    let records = compile_trace(&fixture.work, src_hash, out_hash);

    let run = || {
      let mut recorder = Recorder::default();
      {
        let mut engine = Build::emulator(&mut recorder, Options::default());
        replay(&records, &mut engine).unwrap();
      }
      recorder.signals
    };

    assert_eq!(run(), run());
  });
}

#[test]
#[serial]
fn trace_survives_a_write_and_reload() {
  with_build_dir(|| {
    let fixture = compile_fixture();
    let src_hash = hash_bytes(b"int main() { return 0; }\n");
    let out_hash = hash_bytes(b"\x7fELF object bytes");
    let records = compile_trace(&fixture.work, src_hash, out_hash);

    let reloaded = InputTrace::load(&paths::trace_path()).unwrap();
    assert_eq!(reloaded.records(), &records[..]);
  });
}
