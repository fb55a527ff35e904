//! Incremental parser for `text/event-stream` bodies.
//!
//! Network chunks can end anywhere, so every call hands back the unprocessed
//! tail as `remainder`; the caller prepends it to the next chunk.

use crate::constants::{SSE_DATA_PREFIX, SSE_DONE_MARKER};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedChunk {
    pub events: Vec<Value>,
    pub done: bool,
    pub remainder: String,
}

/// Parses every complete line of `buffer`. Never fails.
pub fn parse_event_source(buffer: &str) -> ParsedChunk {
    let mut parsed = ParsedChunk::default();

    let (complete, tail) = match buffer.rfind('\n') {
        Some(idx) => (&buffer[..idx], &buffer[idx + 1..]),
        None => {
            parsed.remainder = buffer.to_string();
            return parsed;
        }
    };

    let lines: Vec<&str> = complete.split('\n').collect();
    let last_index = lines.len() - 1;

    for (i, raw_line) in lines.iter().enumerate() {
        let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);
        if line.is_empty() || line.starts_with(':') {
            continue;
        }

        let payload = match line.strip_prefix(SSE_DATA_PREFIX) {
            Some(rest) => rest.trim_start(),
            None => {
                tracing::debug!(
                    "[SSE] Skipping non-data line: {}",
                    crate::str_utils::preview(line, 120)
                );
                continue;
            }
        };

        if payload.trim_end() == SSE_DONE_MARKER {
            parsed.done = true;
            continue;
        }

        match serde_json::from_str::<Value>(payload) {
            Ok(event) => parsed.events.push(event),
            // A fragment cut off before its object closed is retried with the next bytes.
            Err(e) if e.is_eof() && i == last_index && tail.is_empty() => {
                tracing::debug!(
                    "[SSE] Holding truncated payload ({} bytes) for the next chunk",
                    payload.len()
                );
                parsed.remainder = line.to_string();
            }
            Err(e) => {
                tracing::warn!(
                    "[SSE] Could not parse SSE JSON chunk ({}): {}",
                    e,
                    crate::str_utils::preview(payload, 200)
                );
            }
        }
    }

    if parsed.remainder.is_empty() {
        parsed.remainder = tail.to_string();
    }
    parsed
}

/// Text delta carried by one streamed completion event, if it has one.
pub fn delta_content(event: &Value) -> Option<&str> {
    event
        .get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_remainder_for_unterminated_line() {
        let first = parse_event_source("data: {\"a\":1}");
        assert!(first.events.is_empty());
        assert!(!first.done);
        assert_eq!(first.remainder, "data: {\"a\":1}");

        let second = parse_event_source(&format!("{}\n", first.remainder));
        assert_eq!(second.events, vec![json!({"a": 1})]);
        assert_eq!(second.remainder, "");
    }

    #[test]
    fn test_done_marker() {
        let parsed = parse_event_source("data: [DONE]\n");
        assert!(parsed.done);
        assert!(parsed.events.is_empty());
        assert_eq!(parsed.remainder, "");
    }

    #[test]
    fn test_done_marker_with_trailing_space() {
        let parsed = parse_event_source("data: [DONE] \t\r\n\r\n");
        assert!(parsed.done);
        assert!(parsed.events.is_empty());
    }

    #[test]
    fn test_comment_and_blank_lines_skipped() {
        let parsed = parse_event_source(":keepalive\n\n");
        assert!(parsed.events.is_empty());
        assert!(!parsed.done);
        assert_eq!(parsed.remainder, "");
    }

    #[test]
    fn test_data_prefix_without_space() {
        let parsed = parse_event_source("data:{\"x\":true}\r\n\r\n");
        assert_eq!(parsed.events, vec![json!({"x": true})]);
    }

    #[test]
    fn test_truncated_fragment_is_retried() {
        let first = parse_event_source("data: {\"choices\":[{\"delta\":\n");
        assert!(first.events.is_empty());
        assert_eq!(first.remainder, "data: {\"choices\":[{\"delta\":");

        let second =
            parse_event_source(&format!("{}{}", first.remainder, "{\"content\":\"Hi\"}}]}\n"));
        assert_eq!(second.events.len(), 1);
        assert_eq!(delta_content(&second.events[0]), Some("Hi"));
    }

    #[test]
    fn test_malformed_line_is_skipped() {
        let parsed = parse_event_source("data: not json\ndata: {\"ok\":1}\n");
        assert_eq!(parsed.events, vec![json!({"ok": 1})]);
        assert_eq!(parsed.remainder, "");
    }

    #[test]
    fn test_events_before_done_are_kept() {
        let parsed = parse_event_source("data: {\"n\":1}\n\ndata: [DONE]\n\n");
        assert!(parsed.done);
        assert_eq!(parsed.events, vec![json!({"n": 1})]);
    }

    #[test]
    fn test_split_parsing_matches_single_pass() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"He\"}}]}\n\n\
                    data: {\"choices\":[{\"delta\":{\"content\":\"llo\"}}]}\n\n\
                    data: [DONE]\n\n";
        let whole = parse_event_source(body);

        for split in 1..body.len() {
            let first = parse_event_source(&body[..split]);
            let second = parse_event_source(&format!("{}{}", first.remainder, &body[split..]));
            let mut events = first.events.clone();
            events.extend(second.events);
            assert_eq!(events, whole.events, "split at {}", split);
            assert_eq!(first.done || second.done, whole.done, "split at {}", split);
        }
    }

    #[test]
    fn test_delta_content_shapes() {
        assert_eq!(
            delta_content(&json!({"choices":[{"delta":{"content":"x"}}]})),
            Some("x")
        );
        assert_eq!(delta_content(&json!({"choices":[{"delta":{"role":"assistant"}}]})), None);
        assert_eq!(delta_content(&json!({"choices":[]})), None);
        assert_eq!(delta_content(&json!("text")), None);
    }
}
