//! Tasks and weighted selection
//!
//! A [`Task`] is a named unit of load: an identifier used for stats
//! bucketing, a relative selection weight, and a zero-argument async effect.
//! Tasks are immutable after registration. A [`TaskSet`] picks among them by
//! weight; when every weight is zero, selection degrades to uniform.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;

type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// A named unit of load.
#[derive(Clone)]
pub struct Task {
    name: String,
    weight: u64,
    effect: TaskFn,
}

impl Task {
    /// Create a task. `weight` is the relative selection probability within
    /// a task set.
    pub fn new<F, Fut>(name: impl Into<String>, weight: u64, effect: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        Self {
            name: name.into(),
            weight,
            effect: Arc::new(move || effect().boxed()),
        }
    }

    /// The stats-bucketing identifier.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The relative selection weight.
    pub fn weight(&self) -> u64 {
        self.weight
    }

    /// Invoke the effect.
    pub fn run(&self) -> BoxFuture<'static, ()> {
        (self.effect)()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("weight", &self.weight)
            .finish()
    }
}

/// An immutable set of tasks with weighted random selection.
#[derive(Debug, Clone, Default)]
pub struct TaskSet {
    tasks: Vec<Task>,
    total_weight: u64,
}

impl TaskSet {
    /// Build a set from registered tasks.
    pub fn new(tasks: Vec<Task>) -> Self {
        let total_weight = tasks.iter().map(Task::weight).sum();
        Self {
            tasks,
            total_weight,
        }
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Iterate over the registered tasks in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    /// Pick a task: draw r uniformly in `[0, total_weight)` and return the
    /// first task whose cumulative weight exceeds r. All-zero weights fall
    /// back to a uniform draw.
    pub fn pick(&self) -> Option<&Task> {
        if self.tasks.is_empty() {
            return None;
        }
        if self.total_weight == 0 {
            let idx = rand::thread_rng().gen_range(0..self.tasks.len());
            return self.tasks.get(idx);
        }
        let r = rand::thread_rng().gen_range(0..self.total_weight);
        let mut cumulative = 0u64;
        for task in &self.tasks {
            cumulative += task.weight();
            if cumulative > r {
                return Some(task);
            }
        }
        self.tasks.last()
    }
}
