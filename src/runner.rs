use deploykit::{CancellationToken, ExecutorError};
use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Captured result of a finished process
#[derive(Debug)]
pub struct Finished {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl Finished {
    /// Exit code, `None` when killed by a signal
    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }
}

/// Run a command with `input` on stdin and capture its output
///
/// The child is killed as soon as `cancel` is cancelled.
pub fn run_with_input(
    program: &str,
    args: &[String],
    input: &[u8],
    cancel: &CancellationToken,
) -> Result<Finished, ExecutorError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            ExecutorError::Unavailable(format!(
                "Failed to execute: {} {}: {e}",
                program,
                args.join(" ")
            ))
        })?;

    let stdout = capture(child.stdout.take());
    let stderr = capture(child.stderr.take());

    if let Some(mut stdin) = child.stdin.take() {
        // a handler may exit without reading its input
        if let Err(e) = stdin.write_all(input) {
            log::debug!("{program} closed stdin early: {e}");
        }
    }

    let status = wait_or_kill(&mut child, program, cancel)?;
    Ok(Finished {
        status,
        stdout: join_capture(stdout),
        stderr: join_capture(stderr),
    })
}

fn wait_or_kill(
    child: &mut Child,
    program: &str,
    cancel: &CancellationToken,
) -> Result<ExitStatus, ExecutorError> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {}
            Err(e) => return Err(ExecutorError::Handler(format!("{program}: {e}"))),
        }
        if cancel.is_cancelled() {
            log::warn!("Killing {program} (pid {})", child.id());
            if let Err(e) = child.kill() {
                log::warn!("Failed to kill {program}: {e}");
            }
            let _ = child.wait();
            return Err(ExecutorError::Cancelled);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn capture<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = String::new();
            let _ = pipe.read_to_string(&mut buf);
            buf
        })
    })
}

fn join_capture(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_captures_output_and_exit_code() {
        let finished = run_with_input(
            "sh",
            &sh("cat; echo oops >&2; exit 3"),
            b"hello",
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(finished.code(), Some(3));
        assert_eq!(finished.stdout, "hello");
        assert_eq!(finished.stderr.trim(), "oops");
    }

    #[test]
    fn test_cancel_kills_child() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            trigger.cancel();
        });

        let started = Instant::now();
        let result = run_with_input("sh", &sh("sleep 10"), b"", &cancel);
        assert!(matches!(result, Err(ExecutorError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_missing_program_is_unavailable() {
        let result = run_with_input(
            "/nonexistent/handler",
            &[],
            b"",
            &CancellationToken::new(),
        );
        assert!(matches!(result, Err(ExecutorError::Unavailable(_))));
    }
}
