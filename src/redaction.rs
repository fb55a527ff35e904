use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum RedactionLevel {
    Strict,  // secrets + message text
    Normal,  // secrets + inline image payloads
    Minimal, // secrets only
}

impl Default for RedactionLevel {
    fn default() -> Self {
        match std::env::var("PARLEY_REDACTION_LEVEL")
            .unwrap_or_else(|_| "normal".to_string())
            .to_lowercase()
            .as_str()
        {
            "strict" => RedactionLevel::Strict,
            "minimal" => RedactionLevel::Minimal,
            _ => RedactionLevel::Normal,
        }
    }
}

lazy_static! {
    static ref SECRET_PATTERN: Regex =
        Regex::new(r"(?i)(sk-[A-Za-z0-9_\-]{16,}|Bearer\s+[^\s]+|api-key:\s*[^\s]+)")
            .expect("Invalid redaction regex");
}

fn is_secret_field(key: &str) -> bool {
    let k = key.to_lowercase();
    k.contains("key")
        || k.contains("secret")
        || k.contains("password")
        || k == "authorization"
        || k == "cookie"
        || k == "token"
}

pub fn redact_value(v: &mut Value, level: RedactionLevel) {
    match v {
        Value::Object(map) => {
            for (k, val) in map.iter_mut() {
                if is_secret_field(k) {
                    *val = Value::String("[REDACTED]".to_string());
                    continue;
                }

                match level {
                    RedactionLevel::Strict if k == "content" || k == "text" => {
                        *val = Value::String("[REDACTED-STRICT]".to_string());
                    }
                    RedactionLevel::Strict | RedactionLevel::Normal
                        if k == "url"
                            && val.as_str().is_some_and(|s| s.starts_with("data:") && s.len() > 100) =>
                    {
                        *val = Value::String("[REDACTED-IMAGE]".to_string());
                    }
                    _ => redact_value(val, level),
                }
            }
        }
        Value::Array(arr) => {
            for val in arr {
                redact_value(val, level);
            }
        }
        _ => {}
    }
}

/// Copy of `body` that is safe to write to logs.
pub fn redacted(body: &Value) -> Value {
    let mut copy = body.clone();
    redact_value(&mut copy, RedactionLevel::default());
    copy
}

/// Masks credentials that slip into free-form text.
pub fn redact_text(input: &str) -> std::borrow::Cow<'_, str> {
    SECRET_PATTERN.replace_all(input, "[REDACTED]")
}

/// Writer wrapper for the log file layer.
pub struct RedactingWriter<W: Write> {
    inner: W,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let input = String::from_utf8_lossy(buf);
        self.inner.write_all(redact_text(&input).as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
