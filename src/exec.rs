//! Process execution.
//!
//! Command lines are templates rendered into a single string, so they always
//! run through the platform shell.

use crate::error::Error;
use log::debug;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Observable result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Exit code; a process killed by signal `N` reports `-N`.
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl Outcome {
    /// Stdout and stderr joined with a newline.
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// How to run a rendered command line.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Environment overlay applied on top of the inherited environment.
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub stdin: Option<String>,
    /// Kill the process after this long. `None` blocks until it exits.
    pub timeout: Option<Duration>,
}

/// Build a shell invocation for `line`.
pub fn shell(line: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(line);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(line);
        cmd
    }
}

/// Run `line` to completion and capture its output.
pub fn run(line: &str, options: &RunOptions) -> Result<Outcome, Error> {
    let spawn_error = |source| Error::Spawn {
        command: line.to_string(),
        source,
    };

    let mut cmd = shell(line);
    cmd.envs(&options.env);
    if let Some(cwd) = &options.cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdin(if options.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    debug!("spawning {line:?}");
    let mut child = cmd.spawn().map_err(spawn_error)?;

    // Feed stdin and drain both pipes on their own threads so a chatty child
    // cannot block on a full pipe while we wait for it.
    let writer = match (options.stdin.clone(), child.stdin.take()) {
        (Some(data), Some(mut pipe)) => Some(thread::spawn(move || {
            let _ = pipe.write_all(data.as_bytes());
        })),
        _ => None,
    };
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = match options.timeout {
        None => child.wait().map_err(spawn_error)?,
        Some(timeout) => match wait_with_timeout(&mut child, timeout).map_err(spawn_error)? {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::Timeout {
                    command: line.to_string(),
                    timeout,
                });
            }
        },
    };

    if let Some(writer) = writer {
        let _ = writer.join();
    }
    let outcome = Outcome {
        status: exit_code(status),
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    };
    debug!("{line:?} exited with {}", outcome.status);
    Ok(outcome)
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if start.elapsed() > timeout {
            return Ok(None);
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}
