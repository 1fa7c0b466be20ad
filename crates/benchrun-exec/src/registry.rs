//! Task descriptors for code the UI can launch.
//!
//! A task is a function in a module somewhere on the kernel's path; the
//! registry holds what the UI needs to present it and to build the code
//! snippet that invokes it.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How a task expects to be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnableKind {
    /// Runs to completion inside the managed kernel.
    Script,
    /// Long-lived code that keeps the kernel occupied.
    Kernel,
    /// Launched as a separate GUI application.
    App,
}

impl std::fmt::Display for RunnableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunnableKind::Script => "script",
            RunnableKind::Kernel => "kernel",
            RunnableKind::App => "app",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for RunnableKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "script" => Ok(RunnableKind::Script),
            "kernel" => Ok(RunnableKind::Kernel),
            "app" => Ok(RunnableKind::App),
            other => Err(format!("unknown runnable kind '{}'", other)),
        }
    }
}

fn default_input_patterns() -> Vec<String> {
    vec!["Continue? [Y/n]".to_string(), "Abort? [Y/n]".to_string()]
}

/// One launchable task: a function in a module, plus how the UI should
/// present and run it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub name: String,
    pub module: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub kind: RunnableKind,
    /// Prompts the UI should treat as yes/no confirmations.
    #[serde(default = "default_input_patterns")]
    pub input_patterns: Vec<String>,
    #[serde(default)]
    pub icons: Vec<PathBuf>,
}

impl TaskDescriptor {
    pub fn new(module: &str, name: &str, kind: RunnableKind) -> Self {
        Self {
            name: name.to_string(),
            module: module.to_string(),
            display_name: None,
            description: None,
            kind,
            input_patterns: default_input_patterns(),
            icons: Vec::new(),
        }
    }

    /// Registry key, unique per function.
    pub fn key(&self) -> String {
        format!("{}.{}", self.module, self.name)
    }

    /// What the UI shows on the button.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

/// Tasks keyed by `module.name`, iterated in stable order.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: BTreeMap<String, TaskDescriptor>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; returns the previous descriptor if any.
    pub fn register(&mut self, task: TaskDescriptor) -> Option<TaskDescriptor> {
        self.tasks.insert(task.key(), task)
    }

    pub fn get(&self, key: &str) -> Option<&TaskDescriptor> {
        self.tasks.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskDescriptor> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
