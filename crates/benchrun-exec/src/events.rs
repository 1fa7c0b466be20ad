//! Event types crossing the worker/UI boundary.
//!
//! A run never hands an error object across the bridge; everything the
//! operator needs to see, including failures, arrives as one of these.

use jupyter_protocol::MediaType;
use serde::Serialize;

/// One classified unit of observable output from an execution.
#[derive(Debug, Clone, Serialize)]
pub enum OutputEvent {
    /// A chunk of plain text (stdout or a text/plain rendering).
    Text(String),
    /// A renderable payload richer than plain text (html, markdown, ...).
    Rich(MediaType),
    /// An encoded bitmap.
    Image { mime: String, data: String },
    /// A formatted traceback, ANSI escapes stripped.
    Error(String),
    /// A tolerated anomaly the operator should still see.
    Warning(String),
}

/// Notifications a single run delivers, in order, ending with `Finished`.
#[derive(Debug, Clone, Serialize)]
pub enum RunEvent {
    Output(OutputEvent),
    /// The kernel is blocked waiting for a line of operator input.
    InputRequested { prompt: String, password: bool },
    /// Terminal notification; nothing follows it for this run.
    Finished { success: bool },
}

/// A run event tagged with the id of the run that produced it.
///
/// Events from concurrent runs interleave on the bridge channel; the tag is
/// what keeps two runs' output from being merged.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeEvent {
    pub run_id: String,
    pub event: RunEvent,
}

impl RunEvent {
    /// True for the `Finished` notification.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunEvent::Finished { .. })
    }
}
