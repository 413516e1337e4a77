mod diagnostics;

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use indicatif::ProgressStyle;
use tracing::Span;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::error::{DispatchError, RuntimeError};
use crate::registry::Registry;
use crate::sort::StartupSortResult;
use crate::task::{ExecutionContext, StartupTask};

pub use diagnostics::Diagnostics;

/// Result returned by a task callback.
pub type TaskResult = anyhow::Result<(), RuntimeError>;

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
    pub context: ExecutionContext,
}

/// Runs a sorted registry.
///
/// Tasks that have to run on the main context are executed one at a time on
/// the thread calling [`Dispatcher::run`]. Worker tasks go to the global
/// `rayon` pool. A task starts only after every task it depends on finished.
///
/// The calling thread must not itself be a thread of the `rayon` pool: it
/// blocks while waiting for worker results.
///
/// # Example
///
/// ```rust
/// use kidou::{Dispatcher, Registry, TaskDescriptor, sort};
///
/// let registry = Registry::from_iter([
///     TaskDescriptor::new("config"),
///     TaskDescriptor::new("cache").depends_on(["config"]).on_worker(),
/// ]);
/// let schedule = sort(&registry).unwrap();
///
/// let diagnostics = Dispatcher::new()
///     .progress(false)
///     .run(&registry, &schedule, |task| {
///         println!("starting {}", task.name);
///         Ok(())
///     })
///     .unwrap();
///
/// assert_eq!(diagnostics.execution_times.len(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct Dispatcher {
    progress: bool,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self { progress: true }
    }

    /// Whether to open progress spans for the run and for every task.
    pub fn progress(mut self, enabled: bool) -> Self {
        self.progress = enabled;
        self
    }

    /// Executes every task of `schedule`, calling `run` once per task.
    ///
    /// The first failing task, either returning an error or panicking, stops
    /// any further task from starting. Tasks already running on workers are
    /// awaited before the error is returned.
    pub fn run<'a, T, F>(
        &self,
        registry: &'a Registry<T>,
        schedule: &'a StartupSortResult,
        run: F,
    ) -> Result<Diagnostics, DispatchError>
    where
        T: StartupTask + Send + Sync,
        F: Fn(&T) -> TaskResult + Sync,
    {
        let mut state = State::new(registry, schedule)?;
        let total = state.pending.len();

        if total == 0 {
            return Ok(Diagnostics::default());
        }

        let root_span = if self.progress {
            let span = tracing::info_span!("startup");
            span.pb_set_length(total as u64);
            span.pb_set_style(&crate::utils::get_style_root());
            span.pb_set_message("Starting tasks...");
            span
        } else {
            Span::none()
        };
        let _enter = root_span.enter();

        let style = self.progress.then(crate::utils::get_style_task);
        let style = style.as_ref();
        let run = &run;

        rayon::in_place_scope(|s| {
            // (name, result, execution)
            let (sender, receiver) = channel::<(&'a str, TaskResult, TaskExecution)>();

            let spawn = |name: &'a str, task: &'a T| {
                let sender = sender.clone();
                let style = style.cloned();
                s.spawn(move |_| {
                    let (result, execution) =
                        execute(task, run, ExecutionContext::Worker, style.as_ref());
                    // The receiver outlives the scope.
                    let _ = sender.send((name, result, execution));
                });
            };

            let mut main = VecDeque::new();
            let mut in_flight = 0usize;

            while state.completed < total {
                if state.failure.is_none() {
                    while let Some(name) = state.unlocked.pop_front() {
                        let task = state.tasks[name];
                        match task.context() {
                            ExecutionContext::Main => main.push_back(name),
                            ExecutionContext::Worker => {
                                in_flight += 1;
                                spawn(name, task);
                            }
                        }
                    }

                    if let Some(name) = main.pop_front() {
                        let task = state.tasks[name];
                        let (result, execution) =
                            execute(task, run, ExecutionContext::Main, style);
                        if state.finish(schedule, name, result, execution) {
                            root_span.pb_inc(1);
                        }
                        continue;
                    }
                }

                if in_flight == 0 {
                    break;
                }

                let Ok((name, result, execution)) = receiver.recv() else {
                    break;
                };
                in_flight -= 1;
                if state.finish(schedule, name, result, execution) {
                    root_span.pb_inc(1);
                }
            }
        });

        if let Some(error) = state.failure {
            return Err(error);
        }

        if state.completed < total {
            tracing::error!("dispatch stalled, completed: {}, tasks: {total}", state.completed);
            return Err(DispatchError::Stalled {
                completed: state.completed,
                total,
            });
        }

        tracing::info!("Startup complete!");
        Ok(state.diagnostics)
    }
}

/// Scheduling state owned by the dispatching thread.
struct State<'a, T> {
    tasks: HashMap<&'a str, &'a T>,
    pending: HashMap<&'a str, usize>,
    unlocked: VecDeque<&'a str>,
    completed: usize,
    failure: Option<DispatchError>,
    diagnostics: Diagnostics,
}

impl<'a, T: StartupTask> State<'a, T> {
    fn new(registry: &'a Registry<T>, schedule: &'a StartupSortResult) -> Result<Self, DispatchError> {
        let mut tasks = HashMap::with_capacity(schedule.len());
        let mut pending = HashMap::with_capacity(schedule.len());

        for name in schedule.order() {
            let Some(task) = registry.get(name) else {
                tracing::error!("startup task not found: {name}");
                return Err(DispatchError::UnknownTask(name.clone()));
            };

            tasks.insert(name.as_str(), task.as_ref());
            pending.insert(name.as_str(), task.dependencies().len());
        }

        // Every unlock has to match one declared dependency, or the counts
        // in `finish` would underflow.
        let mut unlocks: HashMap<&str, usize> = HashMap::with_capacity(pending.len());
        for name in schedule.order() {
            for child in schedule.children_of(name) {
                if !pending.contains_key(child.as_str()) {
                    tracing::error!("startup task not found: {child}");
                    return Err(DispatchError::UnknownTask(child.clone()));
                }
                *unlocks.entry(child.as_str()).or_default() += 1;
            }
        }

        for (&name, &count) in &pending {
            let found = unlocks.get(name).copied().unwrap_or(0);
            if found != count {
                tracing::error!("{name}, dependencies: {count}, unlocked by: {found}");
                return Err(DispatchError::Stalled {
                    completed: 0,
                    total: pending.len(),
                });
            }
        }

        let unlocked = schedule
            .root_tasks()
            .iter()
            .map(String::as_str)
            .filter(|name| pending.get(name) == Some(&0))
            .collect();

        Ok(Self {
            tasks,
            pending,
            unlocked,
            completed: 0,
            failure: None,
            diagnostics: Diagnostics::default(),
        })
    }

    /// Records the outcome of a task and unlocks its children. Returns whether
    /// the task succeeded.
    fn finish(
        &mut self,
        schedule: &'a StartupSortResult,
        name: &'a str,
        result: TaskResult,
        execution: TaskExecution,
    ) -> bool {
        if let Err(error) = result {
            tracing::error!("startup task {name} failed: {error:#}");
            if self.failure.is_none() {
                self.failure = Some(DispatchError::Task {
                    name: name.to_string(),
                    error,
                });
            }
            return false;
        }

        self.completed += 1;
        self.diagnostics
            .execution_times
            .insert(name.to_string(), execution);

        for child in schedule.children_of(name) {
            if let Some(count) = self.pending.get_mut(child.as_str()) {
                *count -= 1;
                if *count == 0 {
                    self.unlocked.push_back(child.as_str());
                }
            }
        }

        true
    }
}

fn execute<T, F>(
    task: &T,
    run: &F,
    context: ExecutionContext,
    style: Option<&ProgressStyle>,
) -> (TaskResult, TaskExecution)
where
    T: StartupTask,
    F: Fn(&T) -> TaskResult,
{
    let span = match style {
        Some(style) => {
            let span = tracing::info_span!("task", name = task.name(), %context);
            span.pb_set_style(style);
            span.pb_set_message(&format!("Running {}", task.name()));
            span
        }
        None => Span::none(),
    };
    let _enter = span.enter();

    let start = Instant::now();

    // A panicking task only owns its own state; the scheduler state lives on
    // the dispatching thread.
    let result = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| run(task))) {
        Ok(result) => result,
        Err(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("Task panicked: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("Task panicked: {s}")
            } else {
                String::from("Task panicked with unknown payload")
            };

            Err(anyhow::anyhow!(msg))
        }
    };

    let execution = TaskExecution {
        start,
        duration: start.elapsed(),
        context,
    };

    (result, execution)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sort::sort;
    use crate::task::TaskDescriptor;
    use std::sync::Mutex;
    use std::thread::{self, ThreadId};

    fn dispatch(
        registry: &Registry,
        run: impl Fn(&TaskDescriptor) -> TaskResult + Sync,
    ) -> Result<Diagnostics, DispatchError> {
        let schedule = sort(registry).unwrap();
        Dispatcher::new().progress(false).run(registry, &schedule, run)
    }

    fn diamond() -> Registry {
        Registry::from_iter([
            TaskDescriptor::new("a").on_worker(),
            TaskDescriptor::new("b").depends_on(["a"]),
            TaskDescriptor::new("c").depends_on(["a"]).on_worker(),
            TaskDescriptor::new("d").depends_on(["b", "c"]).on_worker(),
            TaskDescriptor::new("e").depends_on(["d"]),
        ])
    }

    #[test]
    fn test_empty() {
        let registry = Registry::new();
        let diagnostics = dispatch(&registry, |_| Ok(())).unwrap();
        assert!(diagnostics.execution_times.is_empty());
    }

    #[test]
    fn test_respects_dependencies() {
        let registry = diamond();
        let log = Mutex::new(Vec::new());

        let diagnostics = dispatch(&registry, |task| {
            log.lock().unwrap().push(task.name.clone());
            Ok(())
        })
        .unwrap();

        let log = log.into_inner().unwrap();
        let at = |name: &str| log.iter().position(|n| n == name).unwrap();

        assert_eq!(log.len(), 5);
        for (_, task) in registry.iter() {
            let task = task.unwrap();
            for dep in &task.dependencies {
                assert!(at(dep) < at(&task.name), "{dep} ran after {}", task.name);
            }
        }
        assert_eq!(diagnostics.execution_times.len(), 5);
    }

    #[test]
    fn test_main_tasks_run_on_caller() {
        let registry = diamond();
        let caller = thread::current().id();
        let threads: Mutex<HashMap<String, ThreadId>> = Mutex::new(HashMap::new());

        let diagnostics = dispatch(&registry, |task| {
            threads
                .lock()
                .unwrap()
                .insert(task.name.clone(), thread::current().id());
            Ok(())
        })
        .unwrap();

        let threads = threads.into_inner().unwrap();
        assert_eq!(threads["b"], caller);
        assert_eq!(threads["e"], caller);
        assert_ne!(threads["a"], caller);
        assert_ne!(threads["d"], caller);

        assert_eq!(diagnostics.execution_times["b"].context, ExecutionContext::Main);
        assert_eq!(diagnostics.execution_times["c"].context, ExecutionContext::Worker);
    }

    #[test]
    fn test_error_stops_descendants() {
        let registry = diamond();
        let ran = Mutex::new(Vec::new());

        let err = dispatch(&registry, |task| {
            ran.lock().unwrap().push(task.name.clone());
            if task.name == "c" {
                anyhow::bail!("boom");
            }
            Ok(())
        })
        .unwrap_err();

        let DispatchError::Task { name, error } = err else {
            panic!("expected a task error");
        };
        assert_eq!(name, "c");
        assert_eq!(error.to_string(), "boom");

        let ran = ran.into_inner().unwrap();
        assert!(!ran.contains(&"d".to_string()));
        assert!(!ran.contains(&"e".to_string()));
    }

    #[test]
    fn test_panic_is_reported() {
        let registry = Registry::from_iter([TaskDescriptor::new("a").on_worker()]);

        let err = dispatch(&registry, |_| panic!("kaboom")).unwrap_err();
        assert_eq!(err.to_string(), "Task 'a':\nTask panicked: kaboom");
    }

    #[test]
    fn test_unknown_task() {
        let registry = diamond();
        let schedule = sort(&registry).unwrap();
        let other = Registry::from_iter([TaskDescriptor::new("a")]);

        let err = Dispatcher::new()
            .progress(false)
            .run(&other, &schedule, |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownTask(name) if name == "b"));
    }

    #[test]
    fn test_stalled_schedule() {
        let registry = Registry::from_iter([
            TaskDescriptor::new("a"),
            TaskDescriptor::new("b").depends_on(["a"]),
        ]);
        let mut schedule = sort(&registry).unwrap();
        schedule.children.insert("a".into(), Vec::new());

        let err = Dispatcher::new()
            .progress(false)
            .run(&registry, &schedule, |_| Ok(()))
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Stalled {
                completed: 0,
                total: 2
            }
        ));
    }

    #[test]
    fn test_schedule_with_extra_unlocks() {
        let registry = Registry::from_iter([TaskDescriptor::new("a"), TaskDescriptor::new("b")]);
        let schedule: StartupSortResult = serde_json::from_str(
            r#"{
                "rootTasks": ["a"],
                "children": {"a": ["b"], "b": []},
                "order": ["a", "b"],
                "mainCount": 2,
                "workerCount": 0
            }"#,
        )
        .unwrap();

        let ran = Mutex::new(Vec::new());
        let err = Dispatcher::new()
            .progress(false)
            .run(&registry, &schedule, |task| {
                ran.lock().unwrap().push(task.name.clone());
                Ok(())
            })
            .unwrap_err();

        assert!(matches!(
            err,
            DispatchError::Stalled {
                completed: 0,
                total: 2
            }
        ));
        assert!(ran.into_inner().unwrap().is_empty());
    }

    #[test]
    fn test_schedule_naming_unknown_child() {
        let registry = Registry::from_iter([TaskDescriptor::new("a")]);
        let mut schedule = sort(&registry).unwrap();
        schedule.children.insert("a".into(), vec!["ghost".into()]);

        let err = Dispatcher::new()
            .progress(false)
            .run(&registry, &schedule, |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownTask(name) if name == "ghost"));
    }

    #[test]
    fn test_progress_spans_without_subscriber() {
        let registry = diamond();
        let schedule = sort(&registry).unwrap();

        let diagnostics = Dispatcher::new()
            .run(&registry, &schedule, |_| Ok(()))
            .unwrap();
        assert_eq!(diagnostics.execution_times.len(), 5);
    }
}
