use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{InternalError, SortError};
use crate::task::{StartupTask, TaskDescriptor};

/// A single registry slot. `task` is `None` when the loader registered a
/// name but could not produce a descriptor for it.
#[derive(Debug)]
pub(crate) struct Entry<T> {
    pub key: String,
    pub task: Option<Arc<T>>,
}

impl<T> Clone for Entry<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            task: self.task.clone(),
        }
    }
}

/// The set of startup tasks known to one application.
///
/// Entries live in a flat arena and keep their insertion order, which is the
/// order the scheduler discovers root tasks in. Descriptors are shared via
/// [`Arc`], so registries derived with [`Registry::closure`] and
/// [`Registry::auto_start`] point at the same tasks as their source.
///
/// # Example
///
/// ```rust
/// use kidou::{Registry, TaskDescriptor};
///
/// let mut registry = Registry::new();
/// registry.insert(TaskDescriptor::new("config"));
/// registry.insert(TaskDescriptor::new("database").depends_on(["config"]));
///
/// assert_eq!(registry.len(), 2);
/// assert!(registry.contains("database"));
/// ```
#[derive(Debug)]
pub struct Registry<T = TaskDescriptor> {
    pub(crate) entries: Vec<Entry<T>>,
    index: HashMap<String, usize>,
}

impl<T> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            index: self.index.clone(),
        }
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Returns the descriptor registered under `key`. Unresolved entries
    /// read as absent.
    pub fn get(&self, key: &str) -> Option<&Arc<T>> {
        self.position(key)
            .and_then(|index| self.entries[index].task.as_ref())
    }

    /// Iterates over `(key, descriptor)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&Arc<T>>)> {
        self.entries
            .iter()
            .map(|entry| (entry.key.as_str(), entry.task.as_ref()))
    }

    /// Registers `task` under an explicit key, replacing any previous entry
    /// with that key in place.
    ///
    /// The key is expected to equal the task's name. A mismatch is kept as is
    /// and reported by the scheduler.
    pub fn insert_as(&mut self, key: impl Into<String>, task: impl Into<Arc<T>>) -> &mut Self {
        self.put(key.into(), Some(task.into()));
        self
    }

    /// Registers a key without a descriptor.
    pub fn insert_unresolved(&mut self, key: impl Into<String>) -> &mut Self {
        self.put(key.into(), None);
        self
    }

    pub(crate) fn position(&self, key: &str) -> Option<usize> {
        self.index.get(key).copied()
    }

    fn put(&mut self, key: String, task: Option<Arc<T>>) {
        match self.index.get(&key) {
            Some(&index) => self.entries[index].task = task,
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push(Entry { key, task });
            }
        }
    }
}

impl<T: StartupTask> Registry<T> {
    /// Registers `task` under its own name.
    pub fn insert(&mut self, task: impl Into<Arc<T>>) -> &mut Self {
        let task = task.into();
        self.put(task.name().to_string(), Some(task));
        self
    }

    /// Builds a registry holding the requested tasks and everything they
    /// transitively depend on.
    ///
    /// Requested tasks come first, in request order. Their dependencies
    /// follow in depth-first discovery order.
    pub fn closure<I, S>(&self, names: I) -> Result<Registry<T>, SortError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut selected = Registry::new();
        let mut pending = Vec::new();

        for name in names {
            let name = name.as_ref();
            if selected.contains(name) {
                continue;
            }

            let task = self.resolve(name, name)?;
            pending.extend(task.dependencies().iter().cloned().map(|dep| (name.to_string(), dep)));
            selected.put(name.to_string(), Some(task.clone()));
        }

        self.pull_dependencies(&mut selected, pending)?;

        Ok(selected)
    }

    /// Builds the registry of tasks which start without being asked for.
    ///
    /// This is every task not excluded from auto start, in registry order,
    /// followed by excluded tasks that something auto started depends on.
    pub fn auto_start(&self) -> Result<Registry<T>, SortError> {
        let mut selected = Registry::new();
        let mut pending = Vec::new();

        for entry in &self.entries {
            let Some(task) = &entry.task else {
                tracing::warn!("skipping unresolved task: {}", entry.key);
                continue;
            };
            if task.exclude_from_auto_start() {
                continue;
            }

            pending.extend(
                task.dependencies()
                    .iter()
                    .cloned()
                    .map(|dep| (entry.key.clone(), dep)),
            );
            selected.put(entry.key.clone(), Some(task.clone()));
        }

        tracing::debug!("matched auto start tasks: {}", selected.len());

        let matched = selected.len();
        self.pull_dependencies(&mut selected, pending)?;

        for (key, _) in selected.iter().skip(matched) {
            tracing::info!("added excludeFromAutoStart task: {key}");
        }

        Ok(selected)
    }

    /// Drains a stack of `(dependent, dependency)` pairs into `selected`.
    fn pull_dependencies(
        &self,
        selected: &mut Registry<T>,
        mut stack: Vec<(String, String)>,
    ) -> Result<(), SortError> {
        // Pop in declaration order.
        stack.reverse();

        while let Some((dependent, name)) = stack.pop() {
            if selected.contains(&name) {
                continue;
            }

            let task = self.resolve(&dependent, &name)?;
            for dep in task.dependencies().iter().rev() {
                if !selected.contains(dep) {
                    stack.push((name.clone(), dep.clone()));
                }
            }
            selected.put(name, Some(task.clone()));
        }

        Ok(())
    }

    fn resolve(&self, dependent: &str, name: &str) -> Result<&Arc<T>, SortError> {
        let Some(index) = self.position(name) else {
            tracing::error!("startup task not found: {name}");
            return Err(SortError::DependencyNotFound {
                task: dependent.to_string(),
                dependency: name.to_string(),
            });
        };

        self.entries[index].task.as_ref().ok_or_else(|| {
            tracing::error!("null task: {name}");
            InternalError::UnresolvedTask {
                key: name.to_string(),
            }
            .into()
        })
    }
}

impl<T: StartupTask> FromIterator<T> for Registry<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut registry = Registry::new();
        for task in iter {
            registry.insert(task);
        }
        registry
    }
}

impl<T: StartupTask> Extend<T> for Registry<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for task in iter {
            self.insert(task);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn keys<T>(registry: &Registry<T>) -> Vec<&str> {
        registry.iter().map(|(key, _)| key).collect()
    }

    fn sample() -> Registry {
        Registry::from_iter([
            TaskDescriptor::new("a"),
            TaskDescriptor::new("b").depends_on(["a"]),
            TaskDescriptor::new("c").depends_on(["b", "x"]),
            TaskDescriptor::new("x").exclude_from_auto_start(true),
            TaskDescriptor::new("y").exclude_from_auto_start(true),
        ])
    }

    #[test]
    fn test_insertion_order() {
        let registry = sample();
        assert_eq!(keys(&registry), ["a", "b", "c", "x", "y"]);
    }

    #[test]
    fn test_insert_replaces_in_place() {
        let mut registry = sample();
        registry.insert(TaskDescriptor::new("b").on_worker());

        assert_eq!(keys(&registry), ["a", "b", "c", "x", "y"]);
        assert!(!registry.get("b").unwrap().call_on_main_thread);
    }

    #[test]
    fn test_unresolved_reads_as_absent() {
        let mut registry = sample();
        registry.insert_unresolved("z");

        assert!(registry.contains("z"));
        assert!(registry.get("z").is_none());
        assert_eq!(registry.len(), 6);
    }

    #[test]
    fn test_closure_pulls_dependencies() {
        let registry = sample();
        let selected = registry.closure(["c"]).unwrap();
        assert_eq!(keys(&selected), ["c", "b", "a", "x"]);

        let task = selected.get("a").unwrap();
        assert!(Arc::ptr_eq(task, registry.get("a").unwrap()));
    }

    #[test]
    fn test_closure_skips_repeats() {
        let registry = sample();
        let selected = registry.closure(["b", "a", "b"]).unwrap();
        assert_eq!(keys(&selected), ["b", "a"]);
    }

    #[test]
    fn test_closure_missing() {
        let registry = sample();

        let err = registry.closure(["nope"]).unwrap_err();
        assert_eq!(
            err,
            SortError::DependencyNotFound {
                task: "nope".into(),
                dependency: "nope".into()
            }
        );

        let mut registry = sample();
        registry.insert(TaskDescriptor::new("d").depends_on(["ghost"]));
        let err = registry.closure(["d"]).unwrap_err();
        assert_eq!(
            err,
            SortError::DependencyNotFound {
                task: "d".into(),
                dependency: "ghost".into()
            }
        );
    }

    #[test]
    fn test_closure_unresolved() {
        let mut registry = sample();
        registry.insert_unresolved("x");

        let err = registry.closure(["c"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_auto_start_pulls_excluded_dependencies() {
        let registry = sample();
        let selected = registry.auto_start().unwrap();
        assert_eq!(keys(&selected), ["a", "b", "c", "x"]);
    }

    #[test]
    fn test_auto_start_skips_unresolved() {
        let mut registry = sample();
        registry.insert_unresolved("z");

        let selected = registry.auto_start().unwrap();
        assert_eq!(keys(&selected), ["a", "b", "c", "x"]);
        assert!(!selected.contains("z"));
    }

    #[test]
    fn test_auto_start_pulls_excluded_chain() {
        let mut registry = sample();
        registry.insert(
            TaskDescriptor::new("x")
                .depends_on(["y"])
                .exclude_from_auto_start(true),
        );

        let selected = registry.auto_start().unwrap();
        assert_eq!(keys(&selected), ["a", "b", "c", "x", "y"]);
    }
}
