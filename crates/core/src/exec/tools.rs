//! Thin adapters around external tools.
//!
//! Processor bodies that wrap language tools shell out through these
//! helpers so stdout/stderr capture and error mapping stay uniform.

use std::path::Path;
use std::process::Command;

use tracing::debug;

use crate::{Error, Result};

/// Run an external command to completion, returning its stdout.
pub fn run_command(program: &Path, args: &[&str], stdin: Option<&[u8]>) -> Result<Vec<u8>> {
  use std::io::Write;
  use std::process::Stdio;

  debug!(program = %program.display(), ?args, "running external tool");

  let mut command = Command::new(program);
  command.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
  command.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() });

  let mut child = command
    .spawn()
    .map_err(|e| Error::User(format!("could not start '{}': {e}", program.display())))?;

  if let Some(bytes) = stdin
    && let Some(mut pipe) = child.stdin.take()
  {
    pipe.write_all(bytes)?;
  }

  let output = child.wait_with_output()?;
  if !output.status.success() {
    let stderr = String::from_utf8_lossy(&output.stderr);
    return Err(Error::User(format!(
      "'{}' exited with {}: {}",
      program.display(),
      output.status,
      stderr.trim()
    )));
  }
  Ok(output.stdout)
}

/// Mirror a directory tree to a (possibly remote) destination via rsync.
pub fn rsync(source: &Path, destination: &str) -> Result<()> {
  let source = format!("{}/", source.display());
  run_command(Path::new("rsync"), &["-a", "--delete", &source, destination], None)?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_run_command_captures_stdout() {
    let out = run_command(Path::new("echo"), &["hello"], None).unwrap();
    assert_eq!(String::from_utf8_lossy(&out).trim(), "hello");
  }

  #[test]
  fn test_run_command_reports_failure() {
    let err = run_command(Path::new("false"), &[], None).unwrap_err();
    assert!(matches!(err, Error::User(_)));
  }

  #[test]
  fn test_missing_binary_is_user_error() {
    let err = run_command(Path::new("weft-no-such-tool"), &[], None).unwrap_err();
    assert!(matches!(err, Error::User(_)));
  }
}
