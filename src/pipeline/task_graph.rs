//! # Task Graphs
//!
//! A stage declares its work as a tree: task definitions are leaves and a
//! nested graph marks a loop, a group of tasks that a `REDIRECT` result sends
//! execution back to the start of. [`TaskGraph::flatten`] walks the tree
//! depth-first into the stage's flat task list.

use crate::models::Task;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDefinition {
    pub name: String,
    pub implementing_class: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskNode {
    Definition(TaskDefinition),
    Loop(TaskGraph),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskGraph {
    nodes: Vec<TaskNode>,
}

impl TaskGraph {
    pub fn builder() -> TaskGraphBuilder {
        TaskGraphBuilder::new()
    }

    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Flatten into stage tasks.
    ///
    /// Ids are sequential from `"1"`. The first and last task of the top-level
    /// graph carry `stage_start` / `stage_end`; the first and last task of
    /// every nested graph carry `loop_start` / `loop_end`.
    pub fn flatten(&self) -> Vec<Task> {
        let mut tasks = Vec::new();
        self.flatten_into(&mut tasks, false);
        if let Some(first) = tasks.first_mut() {
            first.stage_start = true;
        }
        if let Some(last) = tasks.last_mut() {
            last.stage_end = true;
        }
        tasks
    }

    fn flatten_into(&self, tasks: &mut Vec<Task>, nested: bool) {
        let start = tasks.len();
        for node in &self.nodes {
            match node {
                TaskNode::Definition(definition) => {
                    let id = (tasks.len() + 1).to_string();
                    tasks.push(Task::new(id, &definition.name, &definition.implementing_class));
                }
                TaskNode::Loop(graph) => graph.flatten_into(tasks, true),
            }
        }
        if nested && tasks.len() > start {
            tasks[start].loop_start = true;
            if let Some(last) = tasks.last_mut() {
                last.loop_end = true;
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct TaskGraphBuilder {
    nodes: Vec<TaskNode>,
}

impl TaskGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_task(mut self, name: impl Into<String>, implementing_class: impl Into<String>) -> Self {
        self.nodes.push(TaskNode::Definition(TaskDefinition {
            name: name.into(),
            implementing_class: implementing_class.into(),
        }));
        self
    }

    /// Append a nested loop built by `build`
    pub fn with_loop(mut self, build: impl FnOnce(TaskGraphBuilder) -> TaskGraphBuilder) -> Self {
        self.nodes.push(TaskNode::Loop(build(TaskGraphBuilder::new()).build()));
        self
    }

    pub fn build(self) -> TaskGraph {
        TaskGraph { nodes: self.nodes }
    }
}
