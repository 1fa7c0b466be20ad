//! One execution from submission to its terminal event.
//!
//! `ExecutionSession` is the pure state machine: it consumes protocol
//! messages and decides what, if anything, the UI should hear about.
//! `run_session` drives it against a live `ChannelClient`, multiplexing
//! iopub streaming, stdin prompts and the final shell reply into a single
//! ordered event stream.
//!
//! States move strictly forward:
//!
//! ```text
//! Submitted -> Streaming <-> InputPending
//!                  |
//!                  v
//!          CollectingReply -> Done { success }
//! ```
//!
//! Once `Done` is reached no further event is emitted for the run except
//! the single `Finished` marker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use jupyter_protocol::{ExecutionState, JupyterMessage, JupyterMessageContent, ReplyStatus};
use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::classify::{classify, strip_ansi};
use crate::client::{Channel, ChannelClient};
use crate::error::ChannelError;
use crate::events::{BridgeEvent, OutputEvent, RunEvent};

const NO_REPLY_WARNING: &str = "no result received, likely interrupted";
const MISSING_TRACEBACK: &str = "An error occurred, no traceback was provided.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Submitted,
    Streaming,
    InputPending,
    CollectingReply,
    Done { success: bool },
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Done { .. })
    }
}

/// Poll windows for one run.
#[derive(Debug, Clone)]
pub struct SessionTimeouts {
    /// How long one iopub poll waits before checking stdin.
    pub iopub: Duration,
    /// How long the stdin poll waits inside an iopub quiet window.
    pub stdin_poll: Duration,
    /// How long to wait for the execute reply after the kernel goes idle.
    pub reply: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            iopub: Duration::from_secs(1),
            stdin_poll: Duration::from_millis(100),
            reply: Duration::from_secs(1),
        }
    }
}

/// State machine for a single execution, keyed by its request id.
pub struct ExecutionSession {
    request_id: String,
    state: SessionState,
    error_emitted: bool,
}

impl ExecutionSession {
    pub fn new(request_id: String) -> Self {
        Self {
            request_id,
            state: SessionState::Submitted,
            error_emitted: false,
        }
    }

    pub fn begin(&mut self) {
        self.state = SessionState::Streaming;
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    fn matches_request(&self, message: &JupyterMessage) -> bool {
        message.parent_header.as_ref().map(|h| h.msg_id.as_str())
            == Some(self.request_id.as_str())
    }

    /// Feed one iopub message through the session.
    ///
    /// Messages parented to another execution are dropped before their
    /// content is examined. Idle status moves the session on to reply
    /// collection.
    pub fn handle_iopub(&mut self, message: &JupyterMessage) -> Option<OutputEvent> {
        if !self.matches_request(message) {
            debug!(
                "[session] skipping {} for another execution",
                message.header.msg_type
            );
            return None;
        }
        match &message.content {
            JupyterMessageContent::Status(status) => {
                if status.execution_state == ExecutionState::Idle {
                    self.state = SessionState::CollectingReply;
                }
                None
            }
            JupyterMessageContent::StreamContent(_)
            | JupyterMessageContent::ExecuteResult(_)
            | JupyterMessageContent::DisplayData(_)
            | JupyterMessageContent::UpdateDisplayData(_)
            | JupyterMessageContent::ErrorOutput(_) => {
                let event = classify(&message.content);
                if matches!(event, Some(OutputEvent::Error(_))) {
                    self.error_emitted = true;
                }
                event
            }
            JupyterMessageContent::ExecuteInput(_)
            | JupyterMessageContent::ClearOutput(_)
            | JupyterMessageContent::CommOpen(_)
            | JupyterMessageContent::CommMsg(_)
            | JupyterMessageContent::CommClose(_) => None,
            _ => Some(OutputEvent::Error(format!(
                "Unexpected message on iopub: {}",
                message.header.msg_type
            ))),
        }
    }

    /// Feed one stdin message; a matching input request parks the session
    /// until an answer arrives. Returns the prompt and its password flag.
    pub fn handle_stdin(&mut self, message: &JupyterMessage) -> Option<(String, bool)> {
        if !self.matches_request(message) {
            return None;
        }
        match &message.content {
            JupyterMessageContent::InputRequest(request) => {
                self.state = SessionState::InputPending;
                Some((request.prompt.clone(), request.password))
            }
            _ => None,
        }
    }

    /// The answer went out on stdin; resume streaming.
    pub fn answer_sent(&mut self) {
        self.state = SessionState::Streaming;
    }

    /// Feed one shell message while collecting the reply.
    ///
    /// A failed reply produces an error event only if iopub never carried
    /// the traceback, so failures surface exactly once.
    pub fn handle_reply(&mut self, message: &JupyterMessage) -> Option<OutputEvent> {
        if !self.matches_request(message) {
            return None;
        }
        let reply = match &message.content {
            JupyterMessageContent::ExecuteReply(reply) => reply,
            _ => return None,
        };
        if matches!(reply.status, ReplyStatus::Ok) {
            self.state = SessionState::Done { success: true };
            return None;
        }
        self.state = SessionState::Done { success: false };
        if self.error_emitted {
            return None;
        }
        let traceback = reply
            .error
            .as_ref()
            .map(|error| strip_ansi(&error.traceback.join("\n")))
            .filter(|text| !text.is_empty())
            .unwrap_or_else(|| MISSING_TRACEBACK.to_string());
        Some(OutputEvent::Error(traceback))
    }

    /// Force the terminal state after a timeout or transport failure.
    pub fn fail(&mut self) {
        self.state = SessionState::Done { success: false };
    }
}

/// The run's side of the bridge: where events go and answers come from.
pub struct SessionIo {
    pub run_id: String,
    pub events: mpsc::UnboundedSender<BridgeEvent>,
    pub answers: mpsc::Receiver<String>,
    pub input_pending: Arc<AtomicBool>,
}

impl SessionIo {
    fn emit(&self, event: RunEvent) {
        // A reader that went away must never sink the run.
        let _ = self.events.send(BridgeEvent {
            run_id: self.run_id.clone(),
            event,
        });
    }
}

/// Drive one execution to completion, emitting tagged events as it goes.
///
/// Always terminates the stream with exactly one `Finished` event and
/// clears the input-pending flag on every exit path. Returns the run's
/// success.
pub async fn run_session(
    client: &mut ChannelClient,
    code: &str,
    timeouts: &SessionTimeouts,
    io: &mut SessionIo,
) -> bool {
    for channel in [Channel::Iopub, Channel::Shell, Channel::Stdin] {
        let drained = client.drain(channel);
        if drained > 0 {
            debug!("[session] dropped {} stale messages on {}", drained, channel);
        }
    }

    let request_id = match client.execute(code, true).await {
        Ok(id) => id,
        Err(e) => {
            io.emit(RunEvent::Output(OutputEvent::Error(format!(
                "Could not submit code to the kernel: {}",
                e
            ))));
            io.input_pending.store(false, Ordering::SeqCst);
            io.emit(RunEvent::Finished { success: false });
            return false;
        }
    };

    info!("[session] run {} submitted as {}", io.run_id, request_id);
    let mut session = ExecutionSession::new(request_id);

    let success = loop {
        match session.state() {
            SessionState::Submitted => session.begin(),
            SessionState::Streaming => {
                match client.receive(Channel::Iopub, timeouts.iopub).await {
                    Ok(Some(message)) => {
                        if let Some(event) = session.handle_iopub(&message) {
                            io.emit(RunEvent::Output(event));
                        }
                    }
                    // Quiet iopub window: look for an input request.
                    Ok(None) => match client.receive(Channel::Stdin, timeouts.stdin_poll).await {
                        Ok(Some(message)) => {
                            if let Some((prompt, password)) = session.handle_stdin(&message) {
                                io.input_pending.store(true, Ordering::SeqCst);
                                io.emit(RunEvent::InputRequested { prompt, password });
                            }
                        }
                        Ok(None) => {}
                        Err(e) => fail_transport(&mut session, io, &e),
                    },
                    Err(e) => fail_transport(&mut session, io, &e),
                }
            }
            SessionState::InputPending => match io.answers.recv().await {
                Some(answer) => {
                    io.input_pending.store(false, Ordering::SeqCst);
                    match client.send_input(&answer).await {
                        Ok(()) => session.answer_sent(),
                        Err(e) => fail_transport(&mut session, io, &e),
                    }
                }
                None => {
                    io.input_pending.store(false, Ordering::SeqCst);
                    io.emit(RunEvent::Output(OutputEvent::Error(
                        "Answer channel closed while input was pending".to_string(),
                    )));
                    session.fail();
                }
            },
            SessionState::CollectingReply => {
                let deadline = Instant::now() + timeouts.reply;
                loop {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        give_up_on_reply(&mut session, io);
                        break;
                    }
                    match client.receive(Channel::Shell, remaining).await {
                        Ok(Some(message)) => {
                            if let Some(event) = session.handle_reply(&message) {
                                io.emit(RunEvent::Output(event));
                            }
                            if session.state().is_terminal() {
                                break;
                            }
                        }
                        Ok(None) => {
                            give_up_on_reply(&mut session, io);
                            break;
                        }
                        Err(e) => {
                            fail_transport(&mut session, io, &e);
                            break;
                        }
                    }
                }
            }
            SessionState::Done { success } => break success,
        }
    };

    client.complete_execution();
    io.input_pending.store(false, Ordering::SeqCst);
    io.emit(RunEvent::Finished { success });
    success
}

fn fail_transport(session: &mut ExecutionSession, io: &SessionIo, error: &ChannelError) {
    io.emit(RunEvent::Output(OutputEvent::Error(format!(
        "Channel failed mid-run: {}",
        error
    ))));
    session.fail();
}

fn give_up_on_reply(session: &mut ExecutionSession, io: &SessionIo) {
    warn!("[session] {}", NO_REPLY_WARNING);
    io.emit(RunEvent::Output(OutputEvent::Warning(
        NO_REPLY_WARNING.to_string(),
    )));
    session.fail();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        busy, child_of, error_output, error_reply, execute_message, idle, input_request, ok_reply,
        stdout,
    };
    use jupyter_protocol::KernelInfoRequest;

    fn session_for(parent: &JupyterMessage) -> ExecutionSession {
        let mut session = ExecutionSession::new(parent.header.msg_id.clone());
        session.begin();
        session
    }

    fn expect_text(event: Option<OutputEvent>, want: &str) {
        match event {
            Some(OutputEvent::Text(text)) => assert_eq!(text, want),
            other => panic!("expected text output, got {:?}", other),
        }
    }

    #[test]
    fn test_streaming_collects_output_until_idle() {
        let request = execute_message("print(2)");
        let mut session = session_for(&request);

        assert!(session.handle_iopub(&busy(&request)).is_none());
        expect_text(session.handle_iopub(&stdout(&request, "2\n")), "2\n");
        assert_eq!(session.state(), SessionState::Streaming);

        assert!(session.handle_iopub(&idle(&request)).is_none());
        assert_eq!(session.state(), SessionState::CollectingReply);
    }

    #[test]
    fn test_messages_for_other_executions_are_dropped() {
        let request = execute_message("1+1");
        let stranger = execute_message("2+2");
        let mut session = session_for(&request);

        assert!(session.handle_iopub(&stdout(&stranger, "4\n")).is_none());
        assert!(session.handle_iopub(&idle(&stranger)).is_none());
        assert_eq!(session.state(), SessionState::Streaming);

        assert_eq!(session.handle_stdin(&input_request(&stranger, "? ", false)), None);
        assert_eq!(session.state(), SessionState::Streaming);

        assert!(session.handle_reply(&ok_reply(&stranger)).is_none());
        assert!(!session.state().is_terminal());
    }

    #[test]
    fn test_unexpected_iopub_kind_becomes_error_event() {
        let request = execute_message("1+1");
        let mut session = session_for(&request);
        let odd = child_of(
            &request,
            JupyterMessageContent::KernelInfoRequest(KernelInfoRequest::default()),
        );
        match session.handle_iopub(&odd) {
            Some(OutputEvent::Error(text)) => {
                assert!(text.contains("Unexpected message on iopub"))
            }
            other => panic!("expected error event, got {:?}", other),
        }
    }

    #[test]
    fn test_input_request_parks_the_session() {
        let request = execute_message("input('go? ')");
        let mut session = session_for(&request);

        let got = session.handle_stdin(&input_request(&request, "go? ", false));
        assert_eq!(got, Some(("go? ".to_string(), false)));
        assert_eq!(session.state(), SessionState::InputPending);

        session.answer_sent();
        assert_eq!(session.state(), SessionState::Streaming);
    }

    #[test]
    fn test_traceback_surfaces_once_via_iopub() {
        let request = execute_message("1/0");
        let mut session = session_for(&request);

        let lines = ["Traceback (most recent call last):", "ZeroDivisionError"];
        let event = session.handle_iopub(&error_output(
            &request,
            "ZeroDivisionError",
            "division by zero",
            &lines,
        ));
        assert!(matches!(event, Some(OutputEvent::Error(_))));

        session.handle_iopub(&idle(&request));
        // The failed reply must not repeat the traceback.
        assert!(session.handle_reply(&error_reply(&request, &lines)).is_none());
        assert_eq!(session.state(), SessionState::Done { success: false });
    }

    #[test]
    fn test_reply_error_without_iopub_traceback_is_reported() {
        let request = execute_message("raise SystemExit");
        let mut session = session_for(&request);
        session.handle_iopub(&idle(&request));

        let lines = ["RuntimeError: boom"];
        match session.handle_reply(&error_reply(&request, &lines)) {
            Some(OutputEvent::Error(text)) => assert_eq!(text, "RuntimeError: boom"),
            other => panic!("expected error event, got {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Done { success: false });
    }

    #[test]
    fn test_reply_error_with_empty_traceback_gets_placeholder() {
        let request = execute_message("raise");
        let mut session = session_for(&request);
        session.handle_iopub(&idle(&request));

        match session.handle_reply(&error_reply(&request, &[])) {
            Some(OutputEvent::Error(text)) => assert_eq!(text, MISSING_TRACEBACK),
            other => panic!("expected error event, got {:?}", other),
        }
    }

    #[test]
    fn test_ok_reply_finishes_successfully() {
        let request = execute_message("1+1");
        let mut session = session_for(&request);
        session.handle_iopub(&idle(&request));
        assert!(session.handle_reply(&ok_reply(&request)).is_none());
        assert_eq!(session.state(), SessionState::Done { success: true });
    }

    struct Harness {
        events: mpsc::UnboundedReceiver<BridgeEvent>,
        answers: mpsc::Sender<String>,
        input_pending: Arc<AtomicBool>,
        io: SessionIo,
    }

    fn harness(run_id: &str) -> Harness {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (answers, answers_rx) = mpsc::channel(1);
        let input_pending = Arc::new(AtomicBool::new(false));
        let io = SessionIo {
            run_id: run_id.to_string(),
            events: events_tx,
            answers: answers_rx,
            input_pending: input_pending.clone(),
        };
        Harness {
            events,
            answers,
            input_pending,
            io,
        }
    }

    fn quick_timeouts() -> SessionTimeouts {
        SessionTimeouts {
            iopub: Duration::from_millis(50),
            stdin_poll: Duration::from_millis(10),
            reply: Duration::from_millis(200),
        }
    }

    async fn collect_events(
        events: &mut mpsc::UnboundedReceiver<BridgeEvent>,
    ) -> Vec<RunEvent> {
        let mut out = Vec::new();
        while let Some(tagged) = events.recv().await {
            let terminal = tagged.event.is_terminal();
            out.push(tagged.event);
            if terminal {
                break;
            }
        }
        out
    }

    #[tokio::test]
    async fn test_run_streams_output_then_finishes() {
        let (mut client, mut kernel) = crate::client::ChannelClient::scripted();
        let mut h = harness("run-1");

        let feeder = tokio::spawn(async move {
            let request = kernel.shell_sent.recv().await.unwrap();
            kernel.iopub.send(busy(&request)).await.unwrap();
            kernel.iopub.send(stdout(&request, "2\n")).await.unwrap();
            kernel.iopub.send(idle(&request)).await.unwrap();
            kernel.shell.send(ok_reply(&request)).await.unwrap();
            kernel
        });

        let success = run_session(&mut client, "print(2)", &quick_timeouts(), &mut h.io).await;
        assert!(success);
        feeder.await.unwrap();

        let events = collect_events(&mut h.events).await;
        assert_eq!(events.len(), 2);
        match &events[0] {
            RunEvent::Output(OutputEvent::Text(text)) => assert_eq!(text, "2\n"),
            other => panic!("expected text output, got {:?}", other),
        }
        assert!(matches!(events[1], RunEvent::Finished { success: true }));
        assert!(client.in_flight().is_none());
    }

    #[tokio::test]
    async fn test_failed_run_reports_error_once() {
        let (mut client, mut kernel) = crate::client::ChannelClient::scripted();
        let mut h = harness("run-2");

        let feeder = tokio::spawn(async move {
            let request = kernel.shell_sent.recv().await.unwrap();
            let lines = ["Traceback (most recent call last):", "ZeroDivisionError"];
            kernel.iopub.send(busy(&request)).await.unwrap();
            kernel
                .iopub
                .send(error_output(&request, "ZeroDivisionError", "1/0", &lines))
                .await
                .unwrap();
            kernel.iopub.send(idle(&request)).await.unwrap();
            kernel.shell.send(error_reply(&request, &lines)).await.unwrap();
        });

        let success = run_session(&mut client, "1/0", &quick_timeouts(), &mut h.io).await;
        assert!(!success);
        feeder.await.unwrap();

        let events = collect_events(&mut h.events).await;
        let errors = events
            .iter()
            .filter(|e| matches!(e, RunEvent::Output(OutputEvent::Error(_))))
            .count();
        assert_eq!(errors, 1);
        assert!(matches!(
            events.last(),
            Some(RunEvent::Finished { success: false })
        ));
    }

    #[tokio::test]
    async fn test_input_request_pauses_until_answered() {
        let (mut client, mut kernel) = crate::client::ChannelClient::scripted();
        let mut h = harness("run-3");
        h.answers.send("Y".to_string()).await.unwrap();

        let feeder = tokio::spawn(async move {
            let request = kernel.shell_sent.recv().await.unwrap();
            kernel.iopub.send(busy(&request)).await.unwrap();
            kernel
                .stdin
                .send(input_request(&request, "Continue? [Y/n] ", false))
                .await
                .unwrap();
            // The kernel stays quiet until the answer arrives.
            let answer = kernel.stdin_sent.recv().await.unwrap();
            match &answer.content {
                JupyterMessageContent::InputReply(reply) => assert_eq!(reply.value, "Y"),
                other => panic!("expected input_reply, got {:?}", other),
            }
            kernel.iopub.send(stdout(&request, "continuing\n")).await.unwrap();
            kernel.iopub.send(idle(&request)).await.unwrap();
            kernel.shell.send(ok_reply(&request)).await.unwrap();
            kernel
        });

        let success = run_session(&mut client, "confirmed()", &quick_timeouts(), &mut h.io).await;
        assert!(success);
        let kernel = feeder.await.unwrap();
        drop(kernel);

        let events = collect_events(&mut h.events).await;
        assert_eq!(events.len(), 3);
        match &events[0] {
            RunEvent::InputRequested { prompt, password } => {
                assert_eq!(prompt, "Continue? [Y/n] ");
                assert!(!password);
            }
            other => panic!("expected input request, got {:?}", other),
        }
        match &events[1] {
            RunEvent::Output(OutputEvent::Text(text)) => assert_eq!(text, "continuing\n"),
            other => panic!("expected text output, got {:?}", other),
        }
        assert!(matches!(events[2], RunEvent::Finished { success: true }));
        assert!(!h.input_pending.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_missing_reply_becomes_warning() {
        let (mut client, mut kernel) = crate::client::ChannelClient::scripted();
        let mut h = harness("run-4");

        let feeder = tokio::spawn(async move {
            let request = kernel.shell_sent.recv().await.unwrap();
            kernel.iopub.send(busy(&request)).await.unwrap();
            kernel.iopub.send(idle(&request)).await.unwrap();
            // No reply ever arrives, as after an interrupt.
            kernel
        });

        let success = run_session(&mut client, "sleep(60)", &quick_timeouts(), &mut h.io).await;
        assert!(!success);
        let kernel = feeder.await.unwrap();
        drop(kernel);

        let events = collect_events(&mut h.events).await;
        assert_eq!(events.len(), 2);
        match &events[0] {
            RunEvent::Output(OutputEvent::Warning(text)) => assert_eq!(text, NO_REPLY_WARNING),
            other => panic!("expected warning, got {:?}", other),
        }
        assert!(matches!(events[1], RunEvent::Finished { success: false }));
    }

    #[tokio::test]
    async fn test_quiet_windows_keep_streaming() {
        let (mut client, mut kernel) = crate::client::ChannelClient::scripted();
        let mut h = harness("run-6");
        let mut io = h.io;

        let runner = tokio::spawn(async move {
            run_session(&mut client, "time.sleep(30)", &quick_timeouts(), &mut io).await
        });

        let request = kernel.shell_sent.recv().await.unwrap();
        kernel.iopub.send(busy(&request)).await.unwrap();

        // Both queues stay empty across several iopub and stdin poll windows.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!runner.is_finished(), "quiet windows must not end the run");
        assert!(
            h.events.try_recv().is_err(),
            "quiet windows must not emit events"
        );
        assert!(!h.input_pending.load(Ordering::SeqCst));

        // Output resumes and the run completes as usual.
        kernel.iopub.send(stdout(&request, "woke up\n")).await.unwrap();
        kernel.iopub.send(idle(&request)).await.unwrap();
        kernel.shell.send(ok_reply(&request)).await.unwrap();
        assert!(runner.await.unwrap());

        let events = collect_events(&mut h.events).await;
        assert_eq!(events.len(), 2);
        match &events[0] {
            RunEvent::Output(OutputEvent::Text(text)) => assert_eq!(text, "woke up\n"),
            other => panic!("expected text output, got {:?}", other),
        }
        assert!(matches!(events[1], RunEvent::Finished { success: true }));
    }

    #[tokio::test]
    async fn test_dead_channel_fails_the_run() {
        let (mut client, kernel) = crate::client::ChannelClient::scripted();
        let mut h = harness("run-5");
        drop(kernel);

        let success = run_session(&mut client, "1+1", &quick_timeouts(), &mut h.io).await;
        assert!(!success);

        let events = collect_events(&mut h.events).await;
        assert!(matches!(
            events.first(),
            Some(RunEvent::Output(OutputEvent::Error(_)))
        ));
        assert!(matches!(
            events.last(),
            Some(RunEvent::Finished { success: false })
        ));
    }
}
