//! Channel client for a running kernel.
//!
//! One client owns one session identity and the four logical channels to a
//! kernel. Each channel is pumped by its own task into an in-process queue,
//! so callers get a uniform bounded `receive` over all of them and a test
//! can stand in for the kernel by writing to the queues directly.
//!
//! The client does not own the kernel process. Dropping it closes sockets
//! and nothing else.

use std::time::Duration;

use jupyter_protocol::{
    ConnectionInfo, ExecuteRequest, InputReply, JupyterMessage, JupyterMessageContent,
    KernelInfoRequest, ReplyStatus,
};
use log::{debug, error, info};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{ChannelError, ChannelStartupError};

const CHANNEL_BUFFER: usize = 100;

/// The four logical channels a client maintains to one kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Shell,
    Iopub,
    Stdin,
    Control,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Channel::Shell => "shell",
            Channel::Iopub => "iopub",
            Channel::Stdin => "stdin",
            Channel::Control => "control",
        };
        write!(f, "{}", name)
    }
}

pub struct ChannelClient {
    session_id: String,
    iopub_rx: mpsc::Receiver<JupyterMessage>,
    shell_rx: mpsc::Receiver<JupyterMessage>,
    stdin_rx: mpsc::Receiver<JupyterMessage>,
    control_rx: mpsc::Receiver<JupyterMessage>,
    shell_tx: mpsc::Sender<JupyterMessage>,
    stdin_tx: mpsc::Sender<JupyterMessage>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    in_flight: Option<String>,
    pending_input: Option<JupyterMessage>,
    disconnected: bool,
}

impl ChannelClient {
    /// Open all four channels and wait for the kernel to prove it is alive.
    ///
    /// The probe is a kernel_info request; any shell reply within
    /// `startup_timeout` counts. On failure every opened channel is dropped
    /// before returning, so a failed connect leaves nothing half-open.
    pub async fn connect(
        info: &ConnectionInfo,
        startup_timeout: Duration,
    ) -> Result<Self, ChannelStartupError> {
        let session_id = Uuid::new_v4().to_string();

        let mut iopub = runtimelib::create_client_iopub_connection(info, "", &session_id)
            .await
            .map_err(anyhow::Error::from)?;

        // Shell and stdin share one identity so input requests triggered by
        // our executions route back to this client.
        let identity =
            runtimelib::peer_identity_for_session(&session_id).map_err(anyhow::Error::from)?;
        let mut shell = runtimelib::create_client_shell_connection_with_identity(
            info,
            &session_id,
            identity.clone(),
        )
        .await
        .map_err(anyhow::Error::from)?;
        let mut stdin_conn =
            runtimelib::create_client_stdin_connection_with_identity(info, &session_id, identity)
                .await
                .map_err(anyhow::Error::from)?;
        let mut control = runtimelib::create_client_control_connection(info, &session_id)
            .await
            .map_err(anyhow::Error::from)?;

        let request: JupyterMessage = KernelInfoRequest::default().into();
        shell.send(request).await.map_err(anyhow::Error::from)?;
        match tokio::time::timeout(startup_timeout, shell.read()).await {
            Ok(Ok(reply)) => {
                debug!(
                    "[client] kernel answered startup probe with {}",
                    reply.header.msg_type
                );
            }
            Ok(Err(e)) => return Err(ChannelStartupError::Transport(e.into())),
            Err(_) => return Err(ChannelStartupError::Timeout(startup_timeout)),
        }

        let (iopub_tx, iopub_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (shell_in_tx, shell_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (stdin_in_tx, stdin_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (control_in_tx, control_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (shell_out_tx, mut shell_out_rx) = mpsc::channel::<JupyterMessage>(CHANNEL_BUFFER);
        let (stdin_out_tx, mut stdin_out_rx) = mpsc::channel::<JupyterMessage>(CHANNEL_BUFFER);

        let mut tasks = Vec::with_capacity(5);

        tasks.push(tokio::spawn(async move {
            loop {
                match iopub.read().await {
                    Ok(message) => {
                        if iopub_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("[client] iopub read ended: {}", e);
                        break;
                    }
                }
            }
        }));

        let (mut shell_writer, mut shell_reader) = shell.split();
        tasks.push(tokio::spawn(async move {
            while let Some(message) = shell_out_rx.recv().await {
                if let Err(e) = shell_writer.send(message).await {
                    error!("[client] shell send failed: {}", e);
                    break;
                }
            }
        }));
        tasks.push(tokio::spawn(async move {
            loop {
                match shell_reader.read().await {
                    Ok(message) => {
                        if shell_in_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("[client] shell read ended: {}", e);
                        break;
                    }
                }
            }
        }));

        // Stdin is bidirectional on a single connection: input requests come
        // in, input replies go out.
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    outbound = stdin_out_rx.recv() => match outbound {
                        Some(message) => {
                            if let Err(e) = stdin_conn.send(message).await {
                                error!("[client] stdin send failed: {}", e);
                                break;
                            }
                        }
                        None => break,
                    },
                    inbound = stdin_conn.read() => match inbound {
                        Ok(message) => {
                            if stdin_in_tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            debug!("[client] stdin read ended: {}", e);
                            break;
                        }
                    },
                }
            }
        }));

        tasks.push(tokio::spawn(async move {
            loop {
                match control.read().await {
                    Ok(message) => {
                        if control_in_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("[client] control read ended: {}", e);
                        break;
                    }
                }
            }
        }));

        info!("[client] connected, session {}", session_id);

        Ok(Self {
            session_id,
            iopub_rx,
            shell_rx,
            stdin_rx,
            control_rx,
            shell_tx: shell_out_tx,
            stdin_tx: stdin_out_tx,
            tasks,
            in_flight: None,
            pending_input: None,
            disconnected: false,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Correlation id of the execution awaiting its reply, if any.
    pub fn in_flight(&self) -> Option<&str> {
        self.in_flight.as_deref()
    }

    /// True while an input request awaits its answer.
    pub fn has_pending_input(&self) -> bool {
        self.pending_input.is_some()
    }

    /// Bounded receive on one channel.
    ///
    /// `Ok(None)` is the timeout sentinel, so callers can poll several
    /// channels in one loop without unwinding on every quiet window. An
    /// `Err` means the channel died underneath us. An input request
    /// belonging to the in-flight execution is remembered so a later
    /// `send_input` can frame its reply.
    pub async fn receive(
        &mut self,
        channel: Channel,
        timeout: Duration,
    ) -> Result<Option<JupyterMessage>, ChannelError> {
        if self.disconnected {
            return Err(ChannelError::Disconnected);
        }
        let rx = match channel {
            Channel::Shell => &mut self.shell_rx,
            Channel::Iopub => &mut self.iopub_rx,
            Channel::Stdin => &mut self.stdin_rx,
            Channel::Control => &mut self.control_rx,
        };
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(message)) => {
                if channel == Channel::Stdin && self.is_current_input_request(&message) {
                    self.pending_input = Some(message.clone());
                }
                Ok(Some(message))
            }
            Ok(None) => Err(ChannelError::Closed(channel)),
            Err(_) => Ok(None),
        }
    }

    fn is_current_input_request(&self, message: &JupyterMessage) -> bool {
        if !matches!(message.content, JupyterMessageContent::InputRequest(_)) {
            return false;
        }
        match (&self.in_flight, message.parent_header.as_ref()) {
            (Some(id), Some(parent)) => parent.msg_id == *id,
            _ => false,
        }
    }

    /// Throw away everything already buffered on a channel.
    ///
    /// Runs before a submission so chatter from another attached client or
    /// an abandoned run cannot bleed into the new session.
    pub fn drain(&mut self, channel: Channel) -> usize {
        let rx = match channel {
            Channel::Shell => &mut self.shell_rx,
            Channel::Iopub => &mut self.iopub_rx,
            Channel::Stdin => &mut self.stdin_rx,
            Channel::Control => &mut self.control_rx,
        };
        let mut drained = 0;
        while rx.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }

    /// Submit code; returns the correlation id future messages will carry.
    ///
    /// One execution per client at a time: the guard stays up until
    /// `complete_execution`.
    pub async fn execute(&mut self, code: &str, allow_stdin: bool) -> Result<String, ChannelError> {
        if self.disconnected {
            return Err(ChannelError::Disconnected);
        }
        if let Some(id) = &self.in_flight {
            return Err(ChannelError::ExecutionInFlight(id.clone()));
        }

        // Submitted code always carries a trailing newline.
        let mut request = ExecuteRequest::new(format!("{}\n", code));
        request.allow_stdin = allow_stdin;
        let message: JupyterMessage = request.into();
        let request_id = message.header.msg_id.clone();

        self.shell_tx
            .send(message)
            .await
            .map_err(|_| ChannelError::Closed(Channel::Shell))?;

        debug!("[client] sent execute_request: msg_id={}", request_id);
        self.in_flight = Some(request_id.clone());
        Ok(request_id)
    }

    /// Drop the in-flight guard and any unanswered input request.
    ///
    /// Called once a run reaches its terminal state, whether or not a reply
    /// ever arrived.
    pub fn complete_execution(&mut self) {
        self.in_flight = None;
        self.pending_input = None;
    }

    /// Answer the kernel's outstanding input request with one line.
    pub async fn send_input(&mut self, text: &str) -> Result<(), ChannelError> {
        if self.disconnected {
            return Err(ChannelError::Disconnected);
        }
        let request = self
            .pending_input
            .take()
            .ok_or(ChannelError::NoInputPending)?;
        let reply = InputReply {
            value: text.to_string(),
            status: ReplyStatus::Ok,
            error: None,
        };
        self.stdin_tx
            .send(reply.as_child_of(&request))
            .await
            .map_err(|_| ChannelError::Closed(Channel::Stdin))?;
        Ok(())
    }

    /// Close all channels. Safe to call more than once.
    pub fn disconnect(&mut self) {
        if self.disconnected {
            return;
        }
        self.disconnected = true;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        debug!("[client] disconnected session {}", self.session_id);
    }
}

impl Drop for ChannelClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// The kernel-facing ends of a scripted client.
#[cfg(test)]
pub(crate) struct ScriptedKernel {
    pub iopub: mpsc::Sender<JupyterMessage>,
    pub shell: mpsc::Sender<JupyterMessage>,
    pub stdin: mpsc::Sender<JupyterMessage>,
    pub control: mpsc::Sender<JupyterMessage>,
    pub shell_sent: mpsc::Receiver<JupyterMessage>,
    pub stdin_sent: mpsc::Receiver<JupyterMessage>,
}

#[cfg(test)]
impl ChannelClient {
    /// Client wired to in-memory endpoints so tests can play the kernel.
    pub(crate) fn scripted() -> (Self, ScriptedKernel) {
        let (iopub_tx, iopub_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (shell_in_tx, shell_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (stdin_in_tx, stdin_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (control_in_tx, control_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (shell_out_tx, shell_sent) = mpsc::channel(CHANNEL_BUFFER);
        let (stdin_out_tx, stdin_sent) = mpsc::channel(CHANNEL_BUFFER);

        let client = Self {
            session_id: "scripted".to_string(),
            iopub_rx,
            shell_rx,
            stdin_rx,
            control_rx,
            shell_tx: shell_out_tx,
            stdin_tx: stdin_out_tx,
            tasks: Vec::new(),
            in_flight: None,
            pending_input: None,
            disconnected: false,
        };
        let kernel = ScriptedKernel {
            iopub: iopub_tx,
            shell: shell_in_tx,
            stdin: stdin_in_tx,
            control: control_in_tx,
            shell_sent,
            stdin_sent,
        };
        (client, kernel)
    }
}
