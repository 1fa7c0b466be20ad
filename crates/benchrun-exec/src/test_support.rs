//! Message and fixture builders shared by tests that play the kernel side.

use jupyter_protocol::{
    ConnectionInfo, ErrorOutput, ExecuteReply, ExecuteRequest, JupyterMessage,
    JupyterMessageContent, ReplyStatus, Status, StreamContent,
};

use crate::manager::KernelProcess;

pub(crate) fn dummy_connection_info() -> ConnectionInfo {
    ConnectionInfo {
        transport: jupyter_protocol::connection_info::Transport::TCP,
        ip: "127.0.0.1".to_string(),
        stdin_port: 0,
        control_port: 0,
        hb_port: 0,
        shell_port: 0,
        iopub_port: 0,
        signature_scheme: "hmac-sha256".to_string(),
        key: "test-key".to_string(),
        kernel_name: Some("python3".to_string()),
    }
}

/// A harmless child process standing in for a kernel, with a connection
/// file in a throwaway runtime dir. Keep the `TempDir` alive for the test.
pub(crate) fn sleeper_process() -> (KernelProcess, tempfile::TempDir) {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let path = dir.path().join("benchrun-kernel-test.json");
    std::fs::write(&path, "{}").expect("write connection file");
    let mut cmd = tokio::process::Command::new("sleep");
    cmd.arg("30");
    let child = cmd.kill_on_drop(true).spawn().expect("spawn sleep");
    (
        KernelProcess::for_tests(child, path, dummy_connection_info()),
        dir,
    )
}

pub(crate) fn execute_message(code: &str) -> JupyterMessage {
    ExecuteRequest::new(code.to_string()).into()
}

/// A message from the kernel, parented to `parent` the way replies and
/// iopub traffic are on the wire.
pub(crate) fn child_of(parent: &JupyterMessage, content: JupyterMessageContent) -> JupyterMessage {
    let mut message = parent.clone();
    message.header.msg_id = uuid::Uuid::new_v4().to_string();
    message.parent_header = Some(parent.header.clone());
    message.content = content;
    message
}

pub(crate) fn busy(parent: &JupyterMessage) -> JupyterMessage {
    child_of(parent, JupyterMessageContent::Status(Status::busy()))
}

pub(crate) fn idle(parent: &JupyterMessage) -> JupyterMessage {
    child_of(parent, JupyterMessageContent::Status(Status::idle()))
}

pub(crate) fn stdout(parent: &JupyterMessage, text: &str) -> JupyterMessage {
    child_of(
        parent,
        JupyterMessageContent::StreamContent(StreamContent::stdout(text)),
    )
}

pub(crate) fn error_output(
    parent: &JupyterMessage,
    ename: &str,
    evalue: &str,
    traceback: &[&str],
) -> JupyterMessage {
    child_of(
        parent,
        JupyterMessageContent::ErrorOutput(ErrorOutput {
            ename: ename.to_string(),
            evalue: evalue.to_string(),
            traceback: traceback.iter().map(|line| line.to_string()).collect(),
        }),
    )
}

pub(crate) fn input_request(
    parent: &JupyterMessage,
    prompt: &str,
    password: bool,
) -> JupyterMessage {
    let content = JupyterMessageContent::from_type_and_content(
        "input_request",
        serde_json::json!({ "prompt": prompt, "password": password }),
    )
    .expect("valid input_request content");
    child_of(parent, content)
}

pub(crate) fn ok_reply(parent: &JupyterMessage) -> JupyterMessage {
    child_of(
        parent,
        JupyterMessageContent::ExecuteReply(ExecuteReply {
            status: ReplyStatus::Ok,
            execution_count: Default::default(),
            user_expressions: Default::default(),
            payload: Default::default(),
            error: None,
        }),
    )
}

/// An execute_reply carrying `status: error`, built from wire JSON so the
/// shape stays honest.
pub(crate) fn error_reply(parent: &JupyterMessage, traceback: &[&str]) -> JupyterMessage {
    let content = JupyterMessageContent::from_type_and_content(
        "execute_reply",
        serde_json::json!({
            "status": "error",
            "execution_count": 1,
            "ename": "RuntimeError",
            "evalue": "boom",
            "traceback": traceback,
            "payload": [],
            "user_expressions": {},
        }),
    )
    .expect("valid execute_reply content");
    child_of(parent, content)
}
