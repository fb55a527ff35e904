/// Well-known hosted endpoint. An empty key list is only an error against this one.
pub const DEFAULT_API_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_MAX_TOKENS: u32 = 4000;
pub const NEW_CHAT_TITLE: &str = "New Chat";

/// Azure OpenAI detection
pub const AZURE_ENDPOINT_MARKER: &str = "openai.azure.com";
pub const AZURE_API_VERSION_DEFAULT: &str = "2023-03-15-preview";
pub const AZURE_API_VERSION_LARGE: &str = "2023-07-01-preview";
pub const AZURE_LARGE_MODELS: &[&str] = &["gpt-4", "gpt-4-32k"];

/// Azure deployment names cannot contain dots.
pub const AZURE_MODEL_MAP: &[(&str, &str)] = &[
    ("gpt-3.5-turbo", "gpt-35-turbo"),
    ("gpt-3.5-turbo-16k", "gpt-35-turbo-16k"),
    ("gpt-3.5-turbo-1106", "gpt-35-turbo-1106"),
    ("gpt-3.5-turbo-0125", "gpt-35-turbo-0125"),
];

/// Markers in upstream error bodies
pub const MODEL_NOT_FOUND_MARKER: &str = "model_not_found";
pub const INSUFFICIENT_QUOTA_MARKER: &str = "insufficient_quota";

/// SSE framing
pub const SSE_DATA_PREFIX: &str = "data:";
pub const SSE_DONE_MARKER: &str = "[DONE]";
/// Longest unterminated line carried between chunks.
pub const MAX_SSE_LINE_BYTES: usize = 1024 * 1024;

/// Checker placeholders
pub const PLACEHOLDER_USER_REQUEST: &str = "{user-request}";
pub const PLACEHOLDER_LLM_RESPONSE: &str = "{llm-response}";
pub const PLACEHOLDER_LEGACY_RESPONSE: &str = "{first-llm-response}";

pub const DEFAULT_CHECKER_TEMPLATE: &str =
    "The user asked: {user-request}\nThe LLM answered: {llm-response}\nIs everything correct? Improve the answer.";

pub const AUTO_CHECK_ERROR_PREFIX: &str = "[Auto-Check Error]: ";

/// Persistence defaults
pub const DEFAULT_STORAGE_CAPACITY_BYTES: usize = 5 * 1024 * 1024;
pub const CHAT_STORE_KEY: &str = "chats";
pub const DB_PRAGMAS: &[&str] = &[
    "PRAGMA journal_mode = WAL",
    "PRAGMA synchronous = NORMAL",
    "PRAGMA busy_timeout = 5000",
];

/// Title generation
pub const TITLE_PROMPT: &str =
    "Generate a title in less than 6 words for the following conversation. Reply with the title only.";
