//! Text framing for the `text/event-stream` wire protocol.
//!
//! Every frame ends with exactly one blank line. Event payloads are JSON with
//! null-valued fields dropped; field order is whatever the payload carries.

use serde_json::Value;
use std::fmt::Write as _;
use std::time::Duration;

/// Comment frame used to keep idle proxies from closing the stream.
pub const HEARTBEAT_FRAME: &str = ": heartbeat\n\n";

/// Response headers every event stream must carry.
pub const STREAM_HEADERS: [(&str, &str); 4] = [
    ("content-type", "text/event-stream"),
    ("cache-control", "no-cache"),
    ("connection", "keep-alive"),
    ("x-accel-buffering", "no"),
];

/// Render one event frame.
///
/// The `id:` line is only written for a non-empty id and always precedes the
/// `event:` line. An empty `name` is passed through as `event: `.
pub fn format_event(name: &str, payload: &Value, id: Option<&str>) -> String {
    let json = without_nulls(payload).to_string();

    let mut frame = String::with_capacity(json.len() + name.len() + 32);
    if let Some(id) = id.filter(|id| !id.is_empty()) {
        let _ = writeln!(frame, "id: {id}");
    }
    let _ = writeln!(frame, "event: {name}");
    push_data_lines(&mut frame, &json);
    frame.push('\n');
    frame
}

/// One `data:` line per physical line of `body`.
fn push_data_lines(frame: &mut String, body: &str) {
    for line in body.lines() {
        let _ = writeln!(frame, "data: {line}");
    }
}

pub fn format_heartbeat() -> &'static str {
    HEARTBEAT_FRAME
}

/// Reconnection hint sent once at the head of every stream.
pub fn format_retry(interval: Duration) -> String {
    format!("retry: {}\n\n", interval.as_millis())
}

/// Copy of `value` with null-valued object fields removed at every depth.
/// A top-level null stays null.
fn without_nulls(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), without_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(without_nulls).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_event_with_id_matches_wire_grammar() {
        let frame = format_event(
            "task.completed",
            &json!({"taskId": "T1", "result": "ok"}),
            Some("evt_7"),
        );
        assert_eq!(
            frame,
            "id: evt_7\nevent: task.completed\ndata: {\"taskId\":\"T1\",\"result\":\"ok\"}\n\n"
        );
    }

    #[test]
    fn test_format_event_omits_id_line_when_absent_or_empty() {
        let none = format_event("x", &json!({"v": 1}), None);
        let empty = format_event("x", &json!({"v": 1}), Some(""));
        assert_eq!(none, "event: x\ndata: {\"v\":1}\n\n");
        assert_eq!(empty, none);
        assert!(!none.contains("id:"));
    }

    #[test]
    fn test_format_event_always_ends_with_a_single_blank_line() {
        for payload in [json!(null), json!([]), json!({"a": "b"}), json!("text")] {
            let frame = format_event("e", &payload, Some("1"));
            assert!(frame.ends_with("\n\n"));
            assert!(!frame.ends_with("\n\n\n"));
        }
    }

    #[test]
    fn test_null_payload_is_rendered_literally() {
        assert_eq!(format_event("e", &Value::Null, None), "event: e\ndata: null\n\n");
    }

    #[test]
    fn test_empty_event_name_is_passed_through() {
        assert_eq!(format_event("", &json!(1), None), "event: \ndata: 1\n\n");
    }

    #[test]
    fn test_null_fields_are_dropped_recursively() {
        let frame = format_event(
            "e",
            &json!({"a": null, "b": {"c": null, "d": 2}, "e": [null, {"f": null}]}),
            None,
        );
        assert_eq!(frame, "event: e\ndata: {\"b\":{\"d\":2},\"e\":[null,{}]}\n\n");
    }

    #[test]
    fn test_embedded_newlines_become_separate_data_lines() {
        // Compact JSON escapes newlines inside strings
        let frame = format_event("e", &json!("a\nb"), None);
        assert_eq!(frame, "event: e\ndata: \"a\\nb\"\n\n");

        let mut frame = String::new();
        push_data_lines(&mut frame, "{\n  \"a\": 1\n}");
        assert_eq!(frame, "data: {\ndata:   \"a\": 1\ndata: }\n");
    }

    #[test]
    fn test_heartbeat_is_a_comment_frame() {
        assert_eq!(format_heartbeat(), ": heartbeat\n\n");
        assert!(format_heartbeat().starts_with(':'));
    }

    #[test]
    fn test_retry_is_rendered_in_milliseconds() {
        assert_eq!(format_retry(Duration::from_secs(3)), "retry: 3000\n\n");
        assert_eq!(format_retry(Duration::from_millis(1500)), "retry: 1500\n\n");
    }
}
