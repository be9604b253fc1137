use anyhow::{Context, Result};

use retrace_lib::driver;
use retrace_lib::options::Options;

use crate::output::{print_info, print_rerun, print_stat, print_success};

pub fn cmd_build(
  dry_run: bool,
  print_on_run: bool,
  no_combine_reads: bool,
  no_combine_writes: bool,
  no_ignore_self_reads: bool,
) -> Result<i32> {
  let options = Options {
    combine_reads: !no_combine_reads,
    combine_writes: !no_combine_writes,
    ignore_self_reads: !no_ignore_self_reads,
    print_on_run,
    dry_run,
    ..Default::default()
  };

  let summary = driver::build(&options).context("build failed")?;

  if dry_run {
    if summary.planned.is_empty() {
      print_success("Nothing to do; the build is up to date.");
    } else {
      for entry in &summary.planned {
        print_rerun(&entry.command, &entry.reason);
      }
      print_info(&format!("{} command(s) would rerun", summary.planned.len()));
    }
    return Ok(0);
  }

  if summary.traced_commands == 0 {
    print_success("Build is up to date.");
  } else if summary.succeeded {
    print_success("Build complete.");
  }
  print_stat("commands run", &summary.traced_commands.to_string());
  print_stat("commands emulated", &summary.emulated_commands.to_string());

  if summary.succeeded {
    Ok(0)
  } else {
    Ok(1)
  }
}
