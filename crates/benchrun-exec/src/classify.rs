//! Classifies kernel message payloads into output events.
//!
//! A display payload can carry several representations of the same result at
//! once. Precedence here is image, then any other rich form, then plain
//! text, so plain text only wins when nothing better is available.

use jupyter_protocol::{JupyterMessageContent, MediaType, Stdio};
use regex::Regex;

use crate::events::OutputEvent;

static ANSI_ESCAPE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();

/// Map one iopub payload to at most one output event.
///
/// Stream messages only count when they come from stdout; kernels report
/// tracebacks through dedicated error messages, not stderr. Everything else
/// (status changes, execution echoes, comm traffic) maps to nothing.
pub fn classify(content: &JupyterMessageContent) -> Option<OutputEvent> {
    match content {
        JupyterMessageContent::ExecuteResult(result) => classify_media(&result.data.content),
        JupyterMessageContent::DisplayData(display) => classify_media(&display.data.content),
        JupyterMessageContent::UpdateDisplayData(display) => classify_media(&display.data.content),
        JupyterMessageContent::StreamContent(stream) => match stream.name {
            Stdio::Stdout => Some(OutputEvent::Text(stream.text.clone())),
            Stdio::Stderr => None,
        },
        JupyterMessageContent::ErrorOutput(error) => Some(OutputEvent::Error(strip_ansi(
            &error.traceback.join("\n"),
        ))),
        _ => None,
    }
}

fn classify_media(content: &[MediaType]) -> Option<OutputEvent> {
    if let Some(image) = content.iter().find_map(as_image) {
        return Some(image);
    }
    if let Some(rich) = content
        .iter()
        .find(|media| !matches!(media, MediaType::Plain(_)))
    {
        return Some(OutputEvent::Rich(rich.clone()));
    }
    content.iter().find_map(|media| {
        if let MediaType::Plain(text) = media {
            Some(OutputEvent::Text(text.clone()))
        } else {
            None
        }
    })
}

fn as_image(media: &MediaType) -> Option<OutputEvent> {
    match media {
        MediaType::Png(data) => Some(OutputEvent::Image {
            mime: "image/png".to_string(),
            data: data.clone(),
        }),
        MediaType::Jpeg(data) => Some(OutputEvent::Image {
            mime: "image/jpeg".to_string(),
            data: data.clone(),
        }),
        _ => None,
    }
}

/// Strip ANSI escape sequences (colors, cursor movement) from kernel text.
///
/// IPython colorizes tracebacks; the escapes are noise everywhere we show
/// them.
pub fn strip_ansi(text: &str) -> String {
    let re = ANSI_ESCAPE
        .get_or_init(|| Regex::new(r"(\x9B|\x1B\[)[0-?]*[ -/]*[@-~]").expect("valid regex"));
    re.replace_all(text, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use jupyter_protocol::{DisplayData, ErrorOutput, StreamContent};

    fn display(media: Vec<MediaType>) -> JupyterMessageContent {
        JupyterMessageContent::DisplayData(DisplayData::new(media.into()))
    }

    #[test]
    fn test_stdout_stream_is_text() {
        let content = JupyterMessageContent::StreamContent(StreamContent::stdout("2\n"));
        match classify(&content) {
            Some(OutputEvent::Text(text)) => assert_eq!(text, "2\n"),
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[test]
    fn test_stderr_stream_is_dropped() {
        let content = JupyterMessageContent::StreamContent(StreamContent {
            name: Stdio::Stderr,
            text: "warning: deprecated\n".to_string(),
        });
        assert!(classify(&content).is_none());
    }

    #[test]
    fn test_plain_only_display_is_text() {
        let content = display(vec![MediaType::Plain("hello".to_string())]);
        match classify(&content) {
            Some(OutputEvent::Text(text)) => assert_eq!(text, "hello"),
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[test]
    fn test_richer_form_beats_plain() {
        let content = display(vec![
            MediaType::Plain("a table".to_string()),
            MediaType::Html("<table></table>".to_string()),
        ]);
        match classify(&content) {
            Some(OutputEvent::Rich(MediaType::Html(html))) => {
                assert_eq!(html, "<table></table>")
            }
            other => panic!("expected rich html, got {:?}", other),
        }
    }

    #[test]
    fn test_image_beats_everything() {
        let content = display(vec![
            MediaType::Plain("<Figure 640x480>".to_string()),
            MediaType::Png("aWJiZXJpc2g=".to_string()),
        ]);
        match classify(&content) {
            Some(OutputEvent::Image { mime, data }) => {
                assert_eq!(mime, "image/png");
                assert_eq!(data, "aWJiZXJpc2g=");
            }
            other => panic!("expected image, got {:?}", other),
        }
    }

    #[test]
    fn test_execute_result_classifies_like_display() {
        let content = JupyterMessageContent::from_type_and_content(
            "execute_result",
            serde_json::json!({
                "execution_count": 1,
                "data": { "text/plain": "2" },
                "metadata": {}
            }),
        )
        .unwrap();
        match classify(&content) {
            Some(OutputEvent::Text(text)) => assert_eq!(text, "2"),
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[test]
    fn test_traceback_is_error_with_ansi_stripped() {
        let content = JupyterMessageContent::ErrorOutput(ErrorOutput {
            ename: "ZeroDivisionError".to_string(),
            evalue: "division by zero".to_string(),
            traceback: vec![
                "\u{1b}[0;31mZeroDivisionError\u{1b}[0m".to_string(),
                "division by zero".to_string(),
            ],
        });
        match classify(&content) {
            Some(OutputEvent::Error(text)) => {
                assert_eq!(text, "ZeroDivisionError\ndivision by zero");
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_traceback_wins_over_other_keys() {
        // An error message always classifies as an error even if a kernel
        // were to attach renderable data alongside.
        let content = JupyterMessageContent::from_type_and_content(
            "error",
            serde_json::json!({
                "ename": "ValueError",
                "evalue": "bad value",
                "traceback": ["ValueError: bad value"]
            }),
        )
        .unwrap();
        assert!(matches!(classify(&content), Some(OutputEvent::Error(_))));
    }

    #[test]
    fn test_status_is_ignored() {
        let content = JupyterMessageContent::Status(jupyter_protocol::Status::busy());
        assert!(classify(&content).is_none());
    }

    #[test]
    fn test_strip_ansi_passthrough() {
        assert_eq!(strip_ansi("no escapes here"), "no escapes here");
        assert_eq!(strip_ansi("\u{1b}[31mred\u{1b}[0m"), "red");
        assert_eq!(strip_ansi("\u{1b}[1;32mbold green\u{1b}[0m rest"), "bold green rest");
    }
}
