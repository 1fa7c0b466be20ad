//! Kernel process management and execution streaming over the Jupyter
//! wire protocol.
//!
//! The crate is organized around one flow: a [`manager::KernelProcess`]
//! launches a kernel and owns its lifetime, a [`client::ChannelClient`]
//! speaks to it over the four client channels, [`session::run_session`]
//! turns one submitted execution into an ordered stream of output events,
//! and the [`bridge::ExecutionBridge`] runs sessions on worker tasks and
//! fans their events out to whatever UI is listening.
//!
//! Everything a kernel does with an execution, including failing it, is
//! reported as events on the bridge's queue; errors only surface as
//! `Result`s for operations the caller invoked directly.

pub mod bridge;
pub mod classify;
pub mod client;
pub mod error;
pub mod events;
pub mod manager;
pub mod registry;
pub mod session;
pub mod snippet;

#[cfg(test)]
pub(crate) mod test_support;

pub use bridge::ExecutionBridge;
pub use classify::strip_ansi;
pub use client::{Channel, ChannelClient};
pub use error::{ChannelError, ChannelStartupError, KernelStartError, RunError, StartKernelError};
pub use events::{BridgeEvent, OutputEvent, RunEvent};
pub use manager::{
    check_kernel_alive, interrupt_kernel, list_specs, probe_kernel_info, read_connection_info,
    shutdown_kernel, KernelProcess, KernelspecSummary, CONNECTION_FILE_PREFIX,
};
pub use registry::{RunnableKind, TaskDescriptor, TaskRegistry};
pub use session::{run_session, ExecutionSession, SessionIo, SessionState, SessionTimeouts};
pub use snippet::{build_snippet, SNIPPET_MARKER};
