//! Task registry
//!
//! Built once during startup composition and then shared read-only behind
//! an `Arc`; nothing mutates it after the worker loops start.

use std::collections::HashMap;
use std::sync::Arc;

use crate::collect::{
    CrawlError, Fetcher, RootFn, Rule, RuleTree, ScriptEngine, Storager, Task, TaskModel,
};

/// Name to task map
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task, replacing any previous one of the same name
    pub fn add(&mut self, task: Task) -> Arc<Task> {
        let task = Arc::new(task);
        if self
            .tasks
            .insert(task.name().to_string(), task.clone())
            .is_some()
        {
            tracing::warn!(task = task.name(), "Replaced existing task definition");
        }
        task
    }

    /// Register a scripted task whose rules are evaluated by `engine`
    pub fn add_scripted(
        &mut self,
        model: TaskModel,
        engine: Arc<dyn ScriptEngine>,
        fetcher: Arc<dyn Fetcher>,
        storage: Arc<dyn Storager>,
    ) -> Result<Arc<Task>, CrawlError> {
        if model.options.name.is_empty() {
            return Err(CrawlError::Rule("scripted task has no name".into()));
        }

        let mut tree = RuleTree::new(RootFn::Scripted {
            source: model.root,
            engine: engine.clone(),
        });
        for rule in model.rules {
            tree = tree.with_rule(rule.name, Rule::scripted(rule.parse, engine.clone()));
        }

        Ok(self.add(Task::new(model.options, tree, fetcher, storage)))
    }

    pub fn get(&self, name: &str) -> Option<Arc<Task>> {
        self.tasks.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
