//! Blocking execution of external engines with an optional timeout

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use super::ForceFieldError;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Captured result of a finished process
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Tail of stderr (or stdout when stderr is empty) for error messages
    pub fn failure_detail(&self) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        tail(source.trim(), 500)
    }
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}

fn drain<R: Read + Send + 'static>(source: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut source) = source {
            let _ = source.read_to_end(&mut buffer);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    })
}

fn wait_with_deadline(
    child: &mut Child,
    program: &str,
    timeout: Option<Duration>,
) -> Result<ExitStatus, ForceFieldError> {
    let Some(timeout) = timeout else {
        return Ok(child.wait()?);
    };

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ForceFieldError::Timeout {
                program: program.to_string(),
                timeout,
            });
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Run a command to completion, capturing stdout and stderr
///
/// A program that cannot be found is reported as [`ForceFieldError::Unavailable`];
/// exceeding `timeout` kills the child and reports [`ForceFieldError::Timeout`].
/// A non-zero exit is not an error here: callers decide what a failure means.
pub fn run_command(
    mut command: Command,
    program: &str,
    timeout: Option<Duration>,
) -> Result<ProcessOutput, ForceFieldError> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                ForceFieldError::Unavailable(format!("{} binary not found in PATH", program))
            }
            _ => ForceFieldError::Io(e),
        })?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = wait_with_deadline(&mut child, program, timeout);
    let stdout = stdout.join().unwrap_or_default();
    let stderr = stderr.join().unwrap_or_default();

    Ok(ProcessOutput {
        status: status?,
        stdout,
        stderr,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    #[test]
    fn test_captures_output_and_status() {
        let output = run_command(shell("echo out; echo err 1>&2; exit 3"), "sh", None).unwrap();
        assert!(!output.success());
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.failure_detail(), "err");
    }

    #[test]
    fn test_timeout_kills_child() {
        let err = run_command(shell("sleep 5"), "sh", Some(Duration::from_millis(200))).unwrap_err();
        assert!(matches!(err, ForceFieldError::Timeout { .. }));
    }

    #[test]
    fn test_missing_program_is_unavailable() {
        let command = Command::new("definitely-not-a-real-binary-7f3a");
        let err = run_command(command, "definitely-not-a-real-binary-7f3a", None).unwrap_err();
        assert!(matches!(err, ForceFieldError::Unavailable(_)));
    }

    #[test]
    fn test_tail_keeps_end() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab", 3), "ab");
    }
}
