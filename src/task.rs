//! All the startup task abstractions.
//!
//! A startup task is a named unit of work performed while the application
//! process comes up. Tasks declare the names of the tasks they depend on and
//! the execution context they need. The scheduler never constructs tasks; a
//! loader does that and hands them over through a [`Registry`].
//!
//! Anything implementing [`StartupTask`] can be scheduled. [`TaskDescriptor`]
//! is the plain data implementation, deserializable from the same camelCase
//! keys the startup profiles use.
//!
//! [`Registry`]: crate::Registry

use std::borrow::Cow;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Where a task has to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionContext {
    /// The single serial context of the application, usually the UI thread.
    Main,
    /// Any pooled thread.
    Worker,
}

impl std::fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionContext::Main => f.write_str("main"),
            ExecutionContext::Worker => f.write_str("worker"),
        }
    }
}

/// Read-only view of a task, as seen by the scheduler.
pub trait StartupTask {
    fn name(&self) -> &str;

    /// Names of the tasks which have to complete before this one starts.
    fn dependencies(&self) -> &[String];

    /// Declared number of dependencies. The scheduler always recounts
    /// [`StartupTask::dependencies`] and only warns when this disagrees.
    #[inline]
    fn dependencies_count(&self) -> usize {
        self.dependencies().len()
    }

    fn call_on_main_thread(&self) -> bool;

    #[inline]
    fn exclude_from_auto_start(&self) -> bool {
        false
    }

    #[inline]
    fn context(&self) -> ExecutionContext {
        if self.call_on_main_thread() {
            ExecutionContext::Main
        } else {
            ExecutionContext::Worker
        }
    }
}

impl<T: StartupTask + ?Sized> StartupTask for Arc<T> {
    fn name(&self) -> &str {
        T::name(self)
    }

    fn dependencies(&self) -> &[String] {
        T::dependencies(self)
    }

    fn dependencies_count(&self) -> usize {
        T::dependencies_count(self)
    }

    fn call_on_main_thread(&self) -> bool {
        T::call_on_main_thread(self)
    }

    fn exclude_from_auto_start(&self) -> bool {
        T::exclude_from_auto_start(self)
    }
}

fn yes() -> bool {
    true
}

/// Plain data description of a startup task.
///
/// # Example
///
/// ```rust
/// use kidou::TaskDescriptor;
///
/// let task = TaskDescriptor::new("database")
///     .depends_on(["config", "logger"])
///     .on_worker();
///
/// assert_eq!(task.dependencies, ["config", "logger"]);
/// assert!(!task.call_on_main_thread);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDescriptor {
    pub name: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default = "yes")]
    pub call_on_main_thread: bool,
    /// Whether the main context blocks until this task is done. Carried for
    /// consumers, the scheduler itself does not read it.
    #[serde(default = "yes")]
    pub wait_on_main_thread: bool,
    #[serde(default)]
    pub exclude_from_auto_start: bool,
}

impl TaskDescriptor {
    /// Creates a root task which runs on the main context.
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into().into_owned(),
            dependencies: Vec::new(),
            call_on_main_thread: true,
            wait_on_main_thread: true,
            exclude_from_auto_start: false,
        }
    }

    pub fn depends_on<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn on_main(mut self) -> Self {
        self.call_on_main_thread = true;
        self
    }

    pub fn on_worker(mut self) -> Self {
        self.call_on_main_thread = false;
        self
    }

    pub fn wait_on_main_thread(mut self, wait: bool) -> Self {
        self.wait_on_main_thread = wait;
        self
    }

    pub fn exclude_from_auto_start(mut self, exclude: bool) -> Self {
        self.exclude_from_auto_start = exclude;
        self
    }
}

impl StartupTask for TaskDescriptor {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    fn call_on_main_thread(&self) -> bool {
        self.call_on_main_thread
    }

    fn exclude_from_auto_start(&self) -> bool {
        self.exclude_from_auto_start
    }
}
