use anyhow::{Context, Result};

use retrace_lib::driver;
use retrace_lib::options::Options;

use crate::output::{print_info, print_json, print_rerun, print_success, OutputFormat};

pub fn cmd_check(format: OutputFormat) -> Result<i32> {
  let options = Options::default();
  let report = driver::check(&options).context("check failed")?;

  if format.is_json() {
    print_json(&report)?;
    return Ok(0);
  }

  if report.is_up_to_date() {
    print_success("Nothing to do; the build is up to date.");
  } else {
    for entry in &report.would_rerun {
      print_rerun(&entry.command, &entry.reason);
    }
    print_info(&format!("{} command(s) would rerun", report.would_rerun.len()));
  }

  Ok(0)
}
