use std::{
    io::{self, Read, Write},
    process::{Child, Command, Stdio},
    thread::{self, JoinHandle},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, trace, warn};
use wait_timeout::ChildExt;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to communicate with `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` did not finish within {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("`{command}` exited with status {code}: {stderr:?}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// everything a finished command left behind
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// exit code, -1 if the process was terminated by a signal
    pub code: i32,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Runs command lines through `sh -c`
///
/// An optional timeout kills commands which hang, e.g. a scheduler CLI waiting on an
/// unresponsive controller.
#[derive(Debug, Clone, Default)]
pub struct Shell {
    timeout: Option<Duration>,
}

impl Shell {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Run `command`, optionally feeding `stdin` to it, and collect its output regardless of
    /// the exit code
    #[tracing::instrument(level = "debug", skip(self, stdin))]
    pub fn call(&self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput, ShellError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ShellError::Spawn {
                command: command.to_owned(),
                source,
            })?;

        // stdin is written from its own thread so a child producing lots of output before
        // reading its input can't deadlock us
        let writer = match (stdin, child.stdin.take()) {
            (Some(data), Some(mut pipe)) => {
                let data = data.to_vec();
                Some(thread::spawn(move || match pipe.write_all(&data) {
                    // the child is free to exit without reading its input
                    Err(error) if error.kind() == io::ErrorKind::BrokenPipe => Ok(()),
                    result => result,
                }))
            }
            _ => None,
        };
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        debug!("Waiting on {} for `{command}`", child.id());
        let code = self.wait(command, &mut child)?;

        let io_error = |source| ShellError::Io {
            command: command.to_owned(),
            source,
        };

        if let Some(writer) = writer {
            join(writer).map_err(io_error)?;
        }
        let output = CommandOutput {
            stdout: join(stdout).map_err(io_error)?,
            stderr: join(stderr).map_err(io_error)?,
            code,
        };

        trace!(
            code = output.code,
            stdout = %output.stdout_lossy(),
            stderr = %output.stderr_lossy(),
            "Command finished"
        );

        Ok(output)
    }

    /// Like [`Shell::call`] but a nonzero exit status is turned into
    /// [`ShellError::CommandFailed`]
    pub fn check_call(
        &self,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, ShellError> {
        let output = self.call(command, stdin)?;

        if output.success() {
            Ok(output)
        } else {
            Err(ShellError::CommandFailed {
                command: command.to_owned(),
                code: output.code,
                stderr: output.stderr_lossy(),
            })
        }
    }

    fn wait(&self, command: &str, child: &mut Child) -> Result<i32, ShellError> {
        let io_error = |source| ShellError::Io {
            command: command.to_owned(),
            source,
        };

        let status = match self.timeout {
            Some(timeout) => match child.wait_timeout(timeout).map_err(io_error)? {
                Some(status) => status,
                None => {
                    debug!("`{command}` ran into timeout, killing it");

                    if let Err(error) = child.kill() {
                        warn!(error = ?error, "Failed to kill timed out command");
                    }
                    // reap the child so it doesn't linger as a zombie
                    child.wait().map_err(io_error)?;

                    return Err(ShellError::Timeout {
                        command: command.to_owned(),
                        timeout,
                    });
                }
            },
            None => child.wait().map_err(io_error)?,
        };

        Ok(status.code().unwrap_or(-1))
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<io::Result<Vec<u8>>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();

        if let Some(mut pipe) = pipe {
            pipe.read_to_end(&mut buffer)?;
        }

        Ok(buffer)
    })
}

fn join<T>(handle: JoinHandle<io::Result<T>>) -> io::Result<T> {
    handle
        .join()
        .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::Other, "pipe thread panicked")))
}

/// Quote a single word for `sh`, leaving words made of safe characters untouched
pub fn quote(word: &str) -> String {
    let is_safe = |c: char| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c);

    if !word.is_empty() && word.chars().all(is_safe) {
        word.to_owned()
    } else {
        format!("'{}'", word.replace('\'', r#"'"'"'"#))
    }
}

/// Quote and join words into a single command line
pub fn join_words<S: AsRef<str>>(words: &[S]) -> String {
    words
        .iter()
        .map(|word| quote(word.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}
