use crate::constants::MAX_SSE_LINE_BYTES;
use crate::logging::StreamMetric;
use crate::session::GenerationSession;
use crate::sse::{delta_content, parse_event_source};
use crate::transport::{BodyReader, ResponseBody};
use crate::types::*;
use std::future::Future;

/// Reads `body` to the end, feeding each text increment to `on_delta`, and
/// returns the accumulated text. Stops early when the session stops generating
/// or its abort handle fires; neither is an error.
pub async fn drain<F, Fut>(body: &ResponseBody, session: &GenerationSession, on_delta: F) -> Result<String>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = ()>,
{
    let reader = body.lock()?;
    let outcome = read_all(reader, session, on_delta).await;
    // The reader is released by now; drop the stream so the connection closes.
    body.cancel();
    outcome
}

async fn read_all<F, Fut>(
    mut reader: BodyReader,
    session: &GenerationSession,
    mut on_delta: F,
) -> Result<String>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = ()>,
{
    let cancel = session.abort_token().unwrap_or_default();
    let mut metric = StreamMetric::new();
    let mut full_text = String::new();
    let mut remainder = String::new();
    let mut carry: Vec<u8> = Vec::new();

    while session.is_generating() {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("[STREAM] Abort signalled, stopping read");
                break;
            }
            chunk = reader.next_chunk() => chunk,
        };

        let bytes = match next {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                tracing::warn!("[STREAM] Read failed after {} chunks: {}", metric.chunks, e);
                return Err(e);
            }
            None => break,
        };
        if bytes.is_empty() {
            continue;
        }

        let decoded = decode_utf8(&mut carry, &bytes);
        remainder.push_str(&decoded);
        let parsed = parse_event_source(&remainder);
        remainder = parsed.remainder;
        metric.record_chunk(parsed.events.len());

        let increment: String = parsed.events.iter().filter_map(delta_content).collect();
        if !increment.is_empty() {
            metric.record_text(&increment);
            full_text.push_str(&increment);
            on_delta(increment).await;
        }

        if parsed.done {
            tracing::debug!("[STREAM] Provider sent [DONE]");
            break;
        }
        if remainder.len() > MAX_SSE_LINE_BYTES {
            tracing::warn!(
                "[STREAM] Unterminated SSE line grew past {} bytes after {} chunks",
                MAX_SSE_LINE_BYTES,
                metric.chunks
            );
            reader.release();
            return Err(ParleyError::Protocol(format!(
                "SSE line exceeds {} bytes",
                MAX_SSE_LINE_BYTES
            ))
            .into());
        }
    }

    metric.log_summary();
    reader.release();
    Ok(full_text)
}

/// Decodes `chunk` appended to `carry`, leaving an incomplete trailing
/// multi-byte sequence in `carry` for the next call.
pub fn decode_utf8(carry: &mut Vec<u8>, chunk: &[u8]) -> String {
    carry.extend_from_slice(chunk);
    let mut out = String::new();
    loop {
        match std::str::from_utf8(carry.as_slice()) {
            Ok(s) => {
                out.push_str(s);
                carry.clear();
                return out;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                out.push_str(std::str::from_utf8(&carry[..valid]).unwrap_or_default());
                match e.error_len() {
                    None => {
                        carry.drain(..valid);
                        return out;
                    }
                    Some(bad) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        carry.drain(..valid + bad);
                    }
                }
            }
        }
    }
}
