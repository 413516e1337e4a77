#![forbid(unsafe_code)]
//! Startup task scheduling.
//!
//! Applications declare their startup work as named tasks with dependencies
//! and an execution context, either the single main context or a pooled
//! worker. This crate checks such a set of tasks, orders it so that every
//! task comes after everything it depends on, and can run the result.
//!
//! The pieces, in the order they are usually used:
//!
//! 1. Register tasks in a [`Registry`]. [`TaskDescriptor`] is the plain data
//!    task, any type implementing [`StartupTask`] works as well.
//! 2. Optionally narrow the registry with [`Registry::closure`] or
//!    [`Registry::auto_start`].
//! 3. [`sort`] it into a [`StartupSortResult`], or get a [`SortError`]
//!    saying what is wrong with the registry.
//! 4. Hand the result to a [`Dispatcher`] to execute the tasks.
//!
//! ```rust
//! use kidou::{Dispatcher, Registry, TaskDescriptor, sort};
//!
//! let registry = Registry::from_iter([
//!     TaskDescriptor::new("config"),
//!     TaskDescriptor::new("logger").depends_on(["config"]),
//!     TaskDescriptor::new("database").depends_on(["config"]).on_worker(),
//!     TaskDescriptor::new("ui").depends_on(["logger", "database"]),
//! ]);
//!
//! let schedule = sort(&registry).unwrap();
//! assert_eq!(schedule.order(), ["config", "logger", "database", "ui"]);
//! assert_eq!(schedule.main_count(), 3);
//! assert_eq!(schedule.worker_count(), 1);
//!
//! Dispatcher::new()
//!     .progress(false)
//!     .run(&registry, &schedule, |_| Ok(()))
//!     .unwrap();
//! ```

mod error;
mod executor;
pub mod graph;
mod registry;
mod sort;
mod task;
mod utils;

pub use crate::error::*;
pub use crate::executor::{Diagnostics, Dispatcher, TaskExecution, TaskResult};
pub use crate::registry::Registry;
pub use crate::sort::{StartupSortResult, StartupTopologySort, sort};
pub use crate::task::{ExecutionContext, StartupTask, TaskDescriptor};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
