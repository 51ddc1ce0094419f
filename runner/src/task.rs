//! Typed tasks and the registry remote workers dispatch them through
//!
//! A task is a serializable value carrying its own arguments. It travels as a
//! [`TaskEnvelope`] naming the task type, the worker looks the name up in a [`TaskRegistry`]
//! and runs it through a type erased [`DynTask`].

use crate::handshake::{Outcome, TaskEnvelope};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    any::Any,
    backtrace::Backtrace,
    cell::RefCell,
    collections::BTreeMap,
    error::Error,
    fmt::Write,
    marker::PhantomData,
    panic::{self, AssertUnwindSafe},
};
use thiserror::Error;
use tracing::{debug, warn};

/// Error type tasks report failures with
pub type TaskFailure = Box<dyn Error + Send + Sync + 'static>;

/// A unit of work which can run on a remote host
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Square(i64);
///
/// impl Task for Square {
///     const NAME: &'static str = "example.square";
///     type Output = i64;
///
///     fn run(self) -> Result<i64, TaskFailure> {
///         Ok(self.0 * self.0)
///     }
/// }
/// ```
pub trait Task: Serialize + DeserializeOwned + Send + 'static {
    /// name the task is registered under, has to be identical on both sides
    const NAME: &'static str;
    type Output: Serialize + DeserializeOwned + Send + 'static;

    fn run(self) -> Result<Self::Output, TaskFailure>;
}

/// Wrap a task for the input marker
pub fn envelope<T: Task>(task: &T) -> Result<TaskEnvelope, serde_yaml::Error> {
    Ok(TaskEnvelope {
        task: T::NAME.to_owned(),
        payload: serde_yaml::to_value(task)?,
    })
}

/// Object safe view of a [`Task`] type
pub trait DynTask: Send + Sync {
    fn name(&self) -> &'static str;
    /// decode the payload, run the task and encode its output, failures are formatted
    fn run_dyn(&self, payload: serde_yaml::Value) -> Result<serde_yaml::Value, String>;
}

struct TypedTask<T>(PhantomData<fn() -> T>);

impl<T: Task> DynTask for TypedTask<T> {
    fn name(&self) -> &'static str {
        T::NAME
    }

    fn run_dyn(&self, payload: serde_yaml::Value) -> Result<serde_yaml::Value, String> {
        let task: T = serde_yaml::from_value(payload)
            .map_err(|error| format!("Failed to decode task `{}`: {error}", T::NAME))?;
        let output = task.run().map_err(|error| format_failure(error.as_ref()))?;

        serde_yaml::to_value(output)
            .map_err(|error| format!("Failed to encode the result of `{}`: {error}", T::NAME))
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Task '{0}' is already registered")]
    AlreadyRegistered(&'static str),
}

#[derive(Default)]
/// Map of task name -> runner, built once when a worker starts
pub struct TaskRegistry {
    tasks: BTreeMap<&'static str, Box<dyn DynTask>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Task>(&mut self) -> Result<(), RegistryError> {
        if self.tasks.contains_key(T::NAME) {
            return Err(RegistryError::AlreadyRegistered(T::NAME));
        }

        self.tasks
            .insert(T::NAME, Box::new(TypedTask::<T>(PhantomData)));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.tasks.keys().copied()
    }

    /// Run the task described by `envelope`
    ///
    /// Never fails: unknown tasks, errors returned by the task and panics all end up as
    /// [`Outcome::Error`] carrying a readable trace.
    pub fn run(&self, envelope: TaskEnvelope) -> Outcome {
        let Some(task) = self.tasks.get(envelope.task.as_str()) else {
            warn!(task = %envelope.task, "Received unknown task");

            return Outcome::Error(format!(
                "Task `{}` is not registered with this worker (known tasks: {})",
                envelope.task,
                self.tasks.keys().copied().collect::<Vec<_>>().join(", ")
            ));
        };

        debug!(task = task.name(), "Running task");
        match panic::catch_unwind(AssertUnwindSafe(|| task.run_dyn(envelope.payload))) {
            Ok(Ok(value)) => Outcome::Value(value),
            Ok(Err(trace)) => Outcome::Error(trace),
            Err(payload) => Outcome::Error(format_panic(task.name(), payload)),
        }
    }
}

/// Format an error and its chain of sources
pub fn format_failure(error: &(dyn Error + 'static)) -> String {
    let mut text = error.to_string();
    let mut source = error.source();

    if source.is_some() {
        text.push_str("\n\nCaused by:");
    }

    let mut depth = 0;
    while let Some(cause) = source {
        // writing into a String can't fail
        let _ = write!(text, "\n    {depth}: {cause}");
        depth += 1;
        source = cause.source();
    }

    text
}

thread_local! {
    static PANIC_BACKTRACE: RefCell<Option<Backtrace>> = RefCell::new(None);
}

/// Install a panic hook recording a backtrace for every panic, the backtrace is attached to
/// the outcome of panicking tasks
///
/// Meant for worker processes, the previous hook still runs afterwards.
pub fn capture_panic_backtraces() {
    let previous = panic::take_hook();

    panic::set_hook(Box::new(move |info| {
        PANIC_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(Backtrace::force_capture()));
        previous(info);
    }));
}

fn format_panic(name: &str, payload: Box<dyn Any + Send>) -> String {
    let message = payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<non-string panic payload>".to_owned());

    let mut text = format!("Task `{name}` panicked: {message}");

    if let Some(backtrace) = PANIC_BACKTRACE.with(|slot| slot.borrow_mut().take()) {
        let _ = write!(text, "\n\nBacktrace:\n{backtrace}");
    }

    text
}
