use std::collections::HashMap;
use std::fmt::Write;
use std::time::Duration;

use crate::executor::TaskExecution;
use crate::sort::StartupSortResult;
use crate::task::ExecutionContext;

/// Timings collected while dispatching a schedule.
///
/// Returned by [`Dispatcher::run`](crate::Dispatcher::run). Only tasks that
/// finished successfully are recorded.
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// Task name to its execution metrics.
    pub execution_times: HashMap<String, TaskExecution>,
}

impl Diagnostics {
    pub fn get(&self, name: &str) -> Option<&TaskExecution> {
        self.execution_times.get(name)
    }

    /// Total time spent inside tasks of one context.
    pub fn busy(&self, context: ExecutionContext) -> Duration {
        self.execution_times
            .values()
            .filter(|exec| exec.context == context)
            .map(|exec| exec.duration)
            .sum()
    }

    /// Wall time from the first task start to the last task end.
    pub fn elapsed(&self) -> Duration {
        let start = self.execution_times.values().map(|exec| exec.start).min();
        let end = self
            .execution_times
            .values()
            .map(|exec| exec.start + exec.duration)
            .max();

        match (start, end) {
            (Some(start), Some(end)) => end.duration_since(start),
            _ => Duration::ZERO,
        }
    }

    /// Renders the schedule as a Mermaid diagram with every node tinted by
    /// how long its task took, from green for the fastest to red for the
    /// slowest. Tasks that never ran are light blue.
    pub fn render_mermaid(&self, schedule: &StartupSortResult) -> String {
        let mut f = String::new();
        writeln!(f, "graph LR").unwrap();

        let (min, max) = self
            .execution_times
            .values()
            .map(|exec| exec.duration.as_secs_f64())
            .fold(None, |acc, secs| match acc {
                None => Some((secs, secs)),
                Some((lo, hi)) => Some((f64::min(lo, secs), f64::max(hi, secs))),
            })
            .unwrap_or((0.0, 0.0));
        let span = if max - min > f64::EPSILON { max - min } else { 1.0 };

        let ids: HashMap<&str, usize> = schedule
            .order()
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();

        for (i, name) in schedule.order().iter().enumerate() {
            let label = name.replace('"', "\\\"");
            let (extra, fill) = match self.execution_times.get(name) {
                Some(exec) => {
                    let t = (exec.duration.as_secs_f64() - min) / span;
                    (
                        format!("{:.2?} on {}", exec.duration, exec.context),
                        heat(t),
                    )
                }
                None => ("not run".to_string(), "#ADD8E6".to_string()),
            };

            writeln!(f, "    {i}[\"{label}\\n{extra}\"]").unwrap();
            writeln!(f, "    style {i} fill:{fill}").unwrap();
        }

        for (i, name) in schedule.order().iter().enumerate() {
            for child in schedule.children_of(name) {
                if let Some(j) = ids.get(child.as_str()) {
                    writeln!(f, "    {i} --> {j}").unwrap();
                }
            }
        }

        f
    }
}

/// Maps `t` in `0.0..=1.0` onto green, yellow, red.
fn heat(t: f64) -> String {
    let t = t.clamp(0.0, 1.0);
    let (r, g) = if t < 0.5 {
        ((510.0 * t) as u8, 255)
    } else {
        (255, (510.0 * (1.0 - t)) as u8)
    };
    format!("#{r:02X}{g:02X}00")
}
