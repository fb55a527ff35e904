use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChatId(pub String);

impl ChatId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 8)
    }
}

impl Default for ChatId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for ChatId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage quota exceeded ({needed} bytes needed, capacity {capacity} bytes)")]
    QuotaExceeded { needed: usize, capacity: usize },

    #[error("Storage backend failure: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, StorageError::QuotaExceeded { .. })
    }
}

#[derive(Error, Debug)]
pub enum ParleyError {
    #[error("No API key configured for the default endpoint")]
    MissingCredential,

    #[error("Upstream error (status {status}): {body}")]
    Transport {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("Endpoint or model not accessible (status {status}): {body}")]
    EndpointAccess {
        status: reqwest::StatusCode,
        body: String,
        model_not_found: bool,
    },

    #[error("Rate limited or quota exhausted (status {status}): {body}")]
    RateLimited {
        status: reqwest::StatusCode,
        body: String,
        insufficient_quota: bool,
    },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Response stream is already locked by another reader")]
    StreamLocked,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Messages exceed the token budget ({max_tokens} tokens for {model})")]
    Budget { max_tokens: u32, model: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Request cancelled")]
    Cancelled,

    #[error("{0}")]
    Title(String),

    #[error("Chat not found: {0}")]
    ChatNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: ParleyError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<ParleyError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

impl ObservedError {
    /// Renders the error with the captured span trace, for log files.
    pub fn with_trace(&self) -> String {
        format!("{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

/// --- CORE ROLES ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ImageDetail {
    #[default]
    Auto,
    Low,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageUrl {
    #[serde(default)]
    pub detail: ImageDetail,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(url: impl Into<String>, detail: ImageDetail) -> Self {
        Self::ImageUrl {
            image_url: ImageUrl {
                detail,
                url: url.into(),
            },
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, ContentPart::Text { .. })
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentPart::Text { text } => Some(text),
            ContentPart::ImageUrl { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentPart>,
}

impl Message {
    pub fn new(role: Role, content: Vec<ContentPart>) -> Self {
        Self { role, content }
    }

    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentPart::text(text)],
        }
    }

    /// The placeholder appended before a generation starts.
    pub fn assistant_placeholder() -> Self {
        Self::text(Role::Assistant, "")
    }

    pub fn text_parts(&self) -> impl Iterator<Item = &str> {
        self.content.iter().filter_map(ContentPart::as_text)
    }

    pub fn has_images(&self) -> bool {
        self.content.iter().any(|p| !p.is_text())
    }

    /// Appends `delta` to the first content part when it is text.
    /// Returns false when the first part is not text (nothing is written).
    pub fn append_to_first_text(&mut self, delta: &str) -> bool {
        match self.content.first_mut() {
            Some(ContentPart::Text { text }) => {
                text.push_str(delta);
                true
            }
            _ => false,
        }
    }
}

/// Per-chat completion parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub presence_penalty: f64,
    pub top_p: f64,
    pub frequency_penalty: f64,
    /// Keys dropped before the config is serialized into a request body.
    #[serde(default)]
    pub excluded_fields: Vec<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: crate::constants::DEFAULT_MODEL.to_string(),
            max_tokens: crate::constants::DEFAULT_MAX_TOKENS,
            temperature: 1.0,
            presence_penalty: 0.0,
            top_p: 1.0,
            frequency_penalty: 0.0,
            excluded_fields: Vec::new(),
        }
    }
}

impl ChatConfig {
    pub fn is_excluded(&self, key: &str) -> bool {
        self.excluded_fields.iter().any(|f| f == key)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chat {
    pub id: ChatId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub title_set: bool,
    pub messages: Vec<Message>,
    pub config: ChatConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_detail: Option<ImageDetail>,
}

impl Chat {
    pub fn new(config: ChatConfig) -> Self {
        Self {
            id: ChatId::new(),
            title: crate::constants::NEW_CHAT_TITLE.to_string(),
            title_set: false,
            messages: Vec::new(),
            config,
            image_detail: None,
        }
    }

    pub fn with_system_message(config: ChatConfig, system: &str) -> Self {
        let mut chat = Self::new(config);
        if !system.trim().is_empty() {
            chat.messages.push(Message::text(Role::System, system));
        }
        chat
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}

/// Level of a user-facing notice.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
    pub timestamp: String,
}

impl Notice {
    pub fn new(level: NoticeLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp: chrono::Local::now().format("%H:%M:%S").to_string(),
        }
    }
}

/// Events broadcast to whoever renders application state.
#[derive(Debug, Clone)]
pub enum AppEvent {
    Notice(Notice),
    Delta { chat_index: usize, text: String },
    StageCleared { chat_index: usize },
    GenerationFinished { chat_index: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_part_wire_shape() {
        let parts = vec![
            ContentPart::text("hi"),
            ContentPart::image("data:image/png;base64,AAAA", ImageDetail::High),
        ];
        let json = serde_json::to_value(&parts).unwrap();
        assert_eq!(json[0]["type"], "text");
        assert_eq!(json[0]["text"], "hi");
        assert_eq!(json[1]["type"], "image_url");
        assert_eq!(json[1]["image_url"]["detail"], "high");
        assert_eq!(json[1]["image_url"]["url"], "data:image/png;base64,AAAA");
    }

    #[test]
    fn test_append_to_first_text_skips_image_first() {
        let mut msg = Message::new(
            Role::User,
            vec![ContentPart::image("http://x/y.png", ImageDetail::Auto)],
        );
        assert!(!msg.append_to_first_text("nope"));

        let mut placeholder = Message::assistant_placeholder();
        assert!(placeholder.append_to_first_text("He"));
        assert!(placeholder.append_to_first_text("llo"));
        assert_eq!(placeholder.text_parts().collect::<Vec<_>>(), vec!["Hello"]);
    }

    #[test]
    fn test_storage_error_quota_kind() {
        let err = StorageError::QuotaExceeded {
            needed: 10,
            capacity: 5,
        };
        assert!(err.is_quota_exceeded());
        assert!(!StorageError::Backend("disk".into()).is_quota_exceeded());
    }

    #[test]
    fn test_observed_error_keeps_inner() {
        let err: ObservedError = ParleyError::StreamLocked.into();
        assert!(matches!(err.inner, ParleyError::StreamLocked));
        assert!(err.to_string().contains("locked"));
    }
}
