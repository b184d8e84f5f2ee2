use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::{CommandOutput, CommandRequest, CommandRunner, RunnerError};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// [CommandRunner] backed by real OS processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

enum Stopped {
    Exited(Option<i32>),
    TimedOut,
    Cancelled,
}

impl CommandRunner for SystemRunner {
    fn run(&self, request: &CommandRequest) -> Result<CommandOutput, RunnerError> {
        let (program, args) = request.argv.split_first().ok_or(RunnerError::EmptyCommand)?;
        log::trace!(target: "runner", "Running: {}", request.display());

        let stdin = if request.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        };
        let mut child = Command::new(program)
            .args(args)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                program: request.program(),
                source,
            })?;

        let feeder = match (child.stdin.take(), request.stdin.clone()) {
            (Some(mut pipe), Some(input)) => Some(thread::spawn(move || {
                // a child that exits early closes the pipe; not an error here
                let _ = pipe.write_all(&input);
            })),
            _ => None,
        };
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let deadline = Instant::now() + request.timeout;
        let stopped = loop {
            if let Some(status) = child.try_wait()? {
                break Stopped::Exited(status.code());
            }
            if request.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                log::warn!(target: "runner", "Killing `{}` on cancellation", request.program());
                let _ = child.kill();
                let _ = child.wait();
                break Stopped::Cancelled;
            }
            if Instant::now() >= deadline {
                log::warn!(target: "runner", "Killing `{}` after timeout", request.program());
                let _ = child.kill();
                let _ = child.wait();
                break Stopped::TimedOut;
            }
            thread::sleep(POLL_INTERVAL);
        };

        if let Some(feeder) = feeder {
            let _ = feeder.join();
        }
        let stdout = stdout
            .map(|h| h.join().unwrap_or_default())
            .unwrap_or_default();
        let stderr = stderr
            .map(|h| h.join().unwrap_or_default())
            .unwrap_or_default();

        match stopped {
            Stopped::Exited(exit_code) => {
                if exit_code == Some(0) && !stderr.is_empty() {
                    log::warn!(target: "runner", "{}", String::from_utf8_lossy(&stderr).trim_end());
                }
                Ok(CommandOutput {
                    exit_code,
                    stdout,
                    stderr,
                })
            }
            Stopped::TimedOut => Err(RunnerError::TimedOut {
                timeout: request.timeout,
                stderr,
            }),
            Stopped::Cancelled => Err(RunnerError::Cancelled),
        }
    }
}
