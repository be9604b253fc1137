use std::time::Instant;

use anyhow::{Context, Result};

use retrace_lib::driver;

use crate::output::{format_bytes, print_info, print_json, print_stat, print_success, OutputFormat};

pub fn cmd_gc(dry_run: bool, format: OutputFormat) -> Result<i32> {
  let start = Instant::now();

  let result = driver::gc(dry_run).context("garbage collection failed")?;

  if format.is_json() {
    print_json(&result)?;
    return Ok(0);
  }

  if dry_run {
    print_info("Dry run - no changes made");
  } else {
    print_success("Garbage collection complete.");
  }
  print_stat("files removed", &result.stats.files_deleted.to_string());
  print_stat("space freed", &format_bytes(result.stats.bytes_freed));
  print_stat("duration", &format!("{}ms", start.elapsed().as_millis()));

  Ok(0)
}
