//! Tasks every `cfut worker` knows about

use crate::{
    shell::Shell,
    task::{RegistryError, Task, TaskFailure, TaskRegistry},
};
use serde::{Deserialize, Serialize};

/// Run a command line through `sh` on the cluster node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellTask {
    pub command: String,
    #[serde(default)]
    pub stdin: Option<String>,
}

impl ShellTask {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            stdin: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
}

impl Task for ShellTask {
    const NAME: &'static str = "cfut.shell";
    type Output = ShellOutput;

    /// A nonzero exit code is part of the output, only failing to run the command is an error
    fn run(self) -> Result<ShellOutput, TaskFailure> {
        let output = Shell::default().call(&self.command, self.stdin.as_deref().map(str::as_bytes))?;

        Ok(ShellOutput {
            stdout: output.stdout_lossy(),
            stderr: output.stderr_lossy(),
            code: output.code,
        })
    }
}

pub fn register(registry: &mut TaskRegistry) -> Result<(), RegistryError> {
    registry.register::<ShellTask>()
}

/// Registry holding all builtin tasks
pub fn registry() -> Result<TaskRegistry, RegistryError> {
    let mut registry = TaskRegistry::new();
    register(&mut registry)?;

    Ok(registry)
}
