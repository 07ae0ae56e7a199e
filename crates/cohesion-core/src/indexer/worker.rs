//! Disposable interpreter worker processes.
//!
//! Each call spawns a fresh OS process, drains its output on helper threads
//! so a chatty import cannot fill the pipe, and blocks until the process exits
//! or is killed at the deadline.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::errors::{CohesionError, CohesionResult};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Captured result of a worker that ran to completion.
#[derive(Debug)]
pub struct WorkerOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl WorkerOutput {
    /// Last few lines of stderr, for log messages.
    pub fn stderr_tail(&self, lines: usize) -> String {
        let all: Vec<&str> = self.stderr.lines().collect();
        all[all.len().saturating_sub(lines)..].join("\n")
    }
}

fn drain<R: Read + Send + 'static>(stream: Option<R>) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut stream) = stream {
            let _ = stream.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn wait_with_deadline(child: &mut Child, timeout: Option<Duration>) -> std::io::Result<Option<ExitStatus>> {
    let Some(timeout) = timeout else {
        return child.wait().map(Some);
    };
    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if started.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Run `python -c script args...` in `cwd`, killing it after `timeout`.
///
/// `label` names the work in the timeout error (the statement text for
/// import workers).
pub fn run_python(
    python: &str,
    script: &str,
    args: &[&str],
    cwd: Option<&Path>,
    timeout: Option<Duration>,
    label: &str,
) -> CohesionResult<WorkerOutput> {
    let mut command = Command::new(python);
    command
        .arg("-c")
        .arg(script)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env("PYTHONDONTWRITEBYTECODE", "1");
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let mut child = command.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            CohesionError::Config(format!("Python interpreter not found: {python}"))
        } else {
            CohesionError::Io(e)
        }
    })?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());
    let status = wait_with_deadline(&mut child, timeout)?;
    let stdout = stdout.join().unwrap_or_default();
    let stderr = stderr.join().unwrap_or_default();

    match status {
        Some(status) => Ok(WorkerOutput {
            status,
            stdout,
            stderr,
        }),
        None => {
            let seconds = timeout.map(|t| t.as_secs()).unwrap_or_default();
            warn!("Worker for {label:?} killed after {seconds}s");
            Err(CohesionError::Timeout {
                statement: label.to_string(),
                seconds,
            })
        }
    }
}

/// Payload following `marker` on its own stdout line, if the worker printed one.
pub fn marked_payload<'a>(stdout: &'a str, marker: &str) -> Option<&'a str> {
    stdout
        .lines()
        .rev()
        .find_map(|line| line.strip_prefix(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn python_available() -> bool {
        Command::new("python3")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[test]
    fn test_marked_payload_takes_last_marked_line() {
        let out = "noise\n@@{\"a\": 1}\nmore noise\n@@{\"a\": 2}\n";
        assert_eq!(marked_payload(out, "@@"), Some("{\"a\": 2}"));
        assert_eq!(marked_payload("nothing here", "@@"), None);
    }

    #[test]
    fn test_missing_interpreter_is_a_config_error() {
        let err = run_python(
            "definitely-not-a-python-binary",
            "pass",
            &[],
            None,
            None,
            "pass",
        )
        .unwrap_err();
        assert!(matches!(err, CohesionError::Config(_)));
    }

    #[test]
    fn test_run_python_captures_output() {
        if !python_available() {
            return;
        }
        let out = run_python(
            "python3",
            "import sys; print(sys.argv[1]); sys.stderr.write('warned')",
            &["hello"],
            None,
            Some(Duration::from_secs(30)),
            "echo",
        )
        .unwrap();
        assert!(out.status.success());
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr_tail(1), "warned");
    }

    #[test]
    fn test_hung_worker_is_killed() {
        if !python_available() {
            return;
        }
        let err = run_python(
            "python3",
            "import time; time.sleep(30)",
            &[],
            None,
            Some(Duration::from_millis(200)),
            "import sleepy",
        )
        .unwrap_err();
        assert!(matches!(err, CohesionError::Timeout { .. }));
    }
}
