//! Python snippet construction for launching a task in a kernel.
//!
//! The generated code imports the task's function, calls it inside a
//! `main()` wrapper and prints a non-`None` response. Every generated
//! snippet carries the marker so other tooling can recognize code that
//! came from this crate rather than from a human.

use crate::registry::TaskDescriptor;

/// First line of every generated snippet, and the suffix of its call line.
pub const SNIPPET_MARKER: &str = "# [3405691582]";

/// Build the code that runs `task` with already-rendered Python argument
/// expressions. With `call_func` false the snippet only defines `main()`,
/// for UIs that want to show the code before running it.
pub fn build_snippet(
    task: &TaskDescriptor,
    args: &[String],
    kwargs: &[(String, String)],
    call_func: bool,
) -> String {
    let mut call_args: Vec<String> = args.to_vec();
    call_args.extend(kwargs.iter().map(|(k, v)| format!("{}={}", k, v)));
    let call = format!("{}({})", task.name, call_args.join(", "));

    let mut lines = vec![
        SNIPPET_MARKER.to_string(),
        "from rich import print".to_string(),
        format!("from {} import {}", task.module, task.name),
        "from pathlib import Path, PurePath, PosixPath  # might be used by argument types"
            .to_string(),
        String::new(),
        "def main():".to_string(),
        format!("    response = {}  {}", call, SNIPPET_MARKER),
        "    if response is not None:".to_string(),
        "        print(response)".to_string(),
        "    return response".to_string(),
        String::new(),
    ];
    if call_func {
        lines.push("response = main()".to_string());
    }

    let mut snippet = lines.join("\n");
    snippet.push('\n');
    snippet
}
