use crate::constants::*;
use crate::db::{init_db, SqlitePersistence};
use crate::engine::{EngineSettings, SubmissionEngine};
use crate::failover::{parse_keys, KeyRing};
use crate::i18n::{Catalog, Translator};
use crate::projections::RequestOverlay;
use crate::session::GenerationSession;
use crate::store::ChatStore;
use crate::transport::{HttpTransport, TransportSettings};
use crate::types::*;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Stream chat completions from the terminal", long_about = None)]
pub struct Args {
    /// Prompt to send. Read from stdin when omitted.
    pub prompt: Option<String>,

    #[arg(long, env = "PARLEY_ENDPOINT", default_value = DEFAULT_API_ENDPOINT)]
    pub endpoint: String,
    #[arg(long, env = "PARLEY_API_VERSION")]
    pub api_version: Option<String>,
    /// Comma, semicolon or whitespace separated list of keys.
    #[arg(long)]
    pub api_keys: Option<String>,

    #[arg(long, default_value = DEFAULT_MODEL)]
    pub model: String,
    #[arg(long, default_value_t = DEFAULT_MAX_TOKENS)]
    pub max_tokens: u32,
    #[arg(long, default_value_t = 1.0)]
    pub temperature: f64,
    #[arg(long, default_value_t = 1.0)]
    pub top_p: f64,
    #[arg(long, default_value_t = 0.0)]
    pub presence_penalty: f64,
    #[arg(long, default_value_t = 0.0)]
    pub frequency_penalty: f64,
    /// Config keys never sent upstream, e.g. `presence_penalty,frequency_penalty`.
    #[arg(long, value_delimiter = ',')]
    pub exclude_field: Vec<String>,
    /// JSON object merged into every request body.
    #[arg(long, env = "PARLEY_REQUEST_BODY")]
    pub request_body: Option<String>,
    #[arg(long)]
    pub system: Option<String>,

    #[arg(long, default_value_t = false)]
    pub auto_check: bool,
    #[arg(long, default_value_t = false)]
    pub stream_first: bool,
    #[arg(long)]
    pub checker_model: Option<String>,
    #[arg(long)]
    pub checker_temperature: Option<f64>,
    #[arg(long)]
    pub checker_max_tokens: Option<u32>,
    #[arg(long)]
    pub checker_template: Option<String>,

    #[arg(long)]
    pub title_model: Option<String>,
    #[arg(long, default_value_t = false)]
    pub auto_title: bool,

    #[arg(long, default_value = "parley.db")]
    pub database: String,
    #[arg(long, default_value_t = DEFAULT_STORAGE_CAPACITY_BYTES)]
    pub storage_capacity: usize,
    /// Continue an existing chat instead of starting a new one.
    #[arg(long)]
    pub chat_id: Option<String>,
    /// List stored chats and exit.
    #[arg(long, default_value_t = false)]
    pub list: bool,

    #[arg(long, default_value_t = 300)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,

    #[arg(long, default_value = ".")]
    pub log_dir: String,
    #[arg(long, default_value_t = false)]
    pub json_logs: bool,
}

impl Args {
    /// `--api-keys`, then `PARLEY_API_KEYS`, then `OPENAI_API_KEYS` / `OPENAI_API_KEY`.
    pub fn resolve_keys(&self) -> Vec<String> {
        let raw = self
            .api_keys
            .clone()
            .or_else(|| std::env::var("PARLEY_API_KEYS").ok())
            .or_else(|| std::env::var("OPENAI_API_KEYS").ok())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_default();
        parse_keys(&raw)
    }

    pub fn chat_config(&self) -> ChatConfig {
        ChatConfig {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            presence_penalty: self.presence_penalty,
            top_p: self.top_p,
            frequency_penalty: self.frequency_penalty,
            excluded_fields: self.exclude_field.clone(),
        }
    }

    pub fn checker_config(&self) -> ChatConfig {
        let mut config = self.chat_config();
        if let Some(model) = &self.checker_model {
            config.model = model.clone();
        }
        if let Some(t) = self.checker_temperature {
            config.temperature = t;
        }
        if let Some(m) = self.checker_max_tokens {
            config.max_tokens = m;
        }
        config
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            endpoint: self.endpoint.clone(),
            api_version: self.api_version.clone(),
            auto_check: self.auto_check,
            stream_first: self.stream_first,
            checker_config: self.checker_config(),
            checker_template: self.checker_template.clone(),
            title_model: self.title_model.clone(),
            auto_title: self.auto_title,
        }
    }

    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub args: Arc<Args>,
    pub persistence: Arc<SqlitePersistence>,
    pub store: Arc<ChatStore>,
    pub session: Arc<GenerationSession>,
    pub keys: Arc<KeyRing>,
    pub engine: Arc<SubmissionEngine>,
}

impl AppState {
    pub async fn build(args: Args) -> Result<Self> {
        let pool = init_db(&args.database).await?;
        let persistence = Arc::new(SqlitePersistence::new(pool, args.storage_capacity));
        let chats = persistence.load_chats().await?;
        tracing::info!("Loaded {} chats from {}", chats.len(), args.database);

        let translator: Arc<dyn Translator> = Arc::new(Catalog::english());
        let store = Arc::new(ChatStore::new(
            chats,
            persistence.clone(),
            translator.clone(),
        ));
        let session = Arc::new(GenerationSession::new());
        let keys = Arc::new(KeyRing::new(args.resolve_keys()));

        let overlay = RequestOverlay::parse(args.request_body.as_deref().unwrap_or_default());
        let transport = Arc::new(HttpTransport::new(&args.transport_settings(), overlay)?);

        let engine = Arc::new(SubmissionEngine::new(
            store.clone(),
            session.clone(),
            keys.clone(),
            transport,
            translator,
            args.engine_settings(),
        ));

        Ok(Self {
            args: Arc::new(args),
            persistence,
            store,
            session,
            keys,
            engine,
        })
    }
}
