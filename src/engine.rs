use crate::checker::{build_checker_prompt, last_user_request};
use crate::constants::{AUTO_CHECK_ERROR_PREFIX, DEFAULT_API_ENDPOINT, TITLE_PROMPT};
use crate::failover::KeyRing;
use crate::history_pruning::{HeuristicBudget, TokenBudget};
use crate::i18n::Translator;
use crate::session::GenerationSession;
use crate::specs::openai::CompletionResponse;
use crate::store::ChatStore;
use crate::streaming::drain;
use crate::transport::{CompletionApi, CompletionRequest, ResponseBody};
use crate::types::*;
use reqwest::StatusCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub endpoint: String,
    pub api_version: Option<String>,
    pub auto_check: bool,
    /// Show stage-1 output live while auto-check runs.
    pub stream_first: bool,
    pub checker_config: ChatConfig,
    pub checker_template: Option<String>,
    pub title_model: Option<String>,
    pub auto_title: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_API_ENDPOINT.to_string(),
            api_version: None,
            auto_check: false,
            stream_first: false,
            checker_config: ChatConfig::default(),
            checker_template: None,
            title_model: None,
            auto_title: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// A generation was already running; nothing happened.
    Rejected,
    Completed,
    Cancelled,
    /// The recorded, user-facing error text.
    Failed(String),
}

pub struct SubmissionEngine {
    store: Arc<ChatStore>,
    session: Arc<GenerationSession>,
    keys: Arc<KeyRing>,
    transport: Arc<dyn CompletionApi>,
    budget: Arc<dyn TokenBudget>,
    translator: Arc<dyn Translator>,
    settings: EngineSettings,
}

impl SubmissionEngine {
    pub fn new(
        store: Arc<ChatStore>,
        session: Arc<GenerationSession>,
        keys: Arc<KeyRing>,
        transport: Arc<dyn CompletionApi>,
        translator: Arc<dyn Translator>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            session,
            keys,
            transport,
            budget: Arc::new(HeuristicBudget),
            translator,
            settings,
        }
    }

    pub fn with_budget(mut self, budget: Arc<dyn TokenBudget>) -> Self {
        self.budget = budget;
        self
    }

    pub fn store(&self) -> &Arc<ChatStore> {
        &self.store
    }

    pub fn session(&self) -> &Arc<GenerationSession> {
        &self.session
    }

    pub fn keys(&self) -> &Arc<KeyRing> {
        &self.keys
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Aborts the in-flight request, if any.
    pub fn cancel(&self) {
        self.session.cancel_generation();
    }

    /// Generates a reply into the current chat.
    pub async fn submit(&self) -> SubmitOutcome {
        let Some(cancel) = self.session.try_begin() else {
            tracing::debug!("[SUBMIT] Ignored: a generation is already running");
            return SubmitOutcome::Rejected;
        };

        let chat_index = self.store.current_chat_index().await;
        let mode = if self.settings.auto_check {
            "auto-check"
        } else {
            "standard"
        };
        let span = tracing::info_span!("submit", chat = chat_index, mode = mode);

        let result = async {
            let appended = self
                .store
                .update(|chats| match chats.get_mut(chat_index) {
                    Some(chat) => {
                        chat.messages.push(Message::assistant_placeholder());
                        true
                    }
                    None => false,
                })
                .await;
            if !appended {
                return Err(ParleyError::Internal(
                    format!("No chat at index {}", chat_index),
                    tracing_error::SpanTrace::capture(),
                )
                .into());
            }

            if self.settings.auto_check {
                self.auto_check_submit(chat_index, &cancel).await
            } else {
                self.standard_submit(chat_index, &cancel).await
            }
        }
        .instrument(span)
        .await;

        let cancelled = cancel.is_cancelled() || !self.session.is_generating();
        self.session.set_generating(false);

        let outcome = match result {
            Err(e) if matches!(e.inner, ParleyError::Cancelled) => {
                tracing::info!("[SUBMIT] Cancelled before the response arrived");
                SubmitOutcome::Cancelled
            }
            Err(e) => {
                let mut message = self.describe_error(&e);
                if self.settings.auto_check {
                    message = format!("{}{}", AUTO_CHECK_ERROR_PREFIX, message);
                }
                tracing::error!("[SUBMIT] {}", message);
                tracing::debug!("[SUBMIT] {}", e.with_trace());
                self.session.set_error(message.clone());
                SubmitOutcome::Failed(message)
            }
            Ok(()) if cancelled => SubmitOutcome::Cancelled,
            Ok(()) => {
                if self.settings.auto_title {
                    self.auto_title(chat_index).await;
                }
                SubmitOutcome::Completed
            }
        };

        // Title notices land before listeners stop on this.
        self.store
            .emit(AppEvent::GenerationFinished { chat_index });
        outcome
    }

    async fn standard_submit(&self, chat_index: usize, cancel: &CancellationToken) -> Result<()> {
        let (messages, config) = self.prepare(chat_index).await?;

        tracing::info!("[SUBMIT] Calling {} with {} messages", config.model, messages.len());
        let body = self.open_stream(messages, config, cancel).await?;
        self.drain_into_chat(&body, chat_index, cancel).await?;
        tracing::info!("[SUBMIT] Streaming complete");
        Ok(())
    }

    async fn auto_check_submit(&self, chat_index: usize, cancel: &CancellationToken) -> Result<()> {
        let (messages, config) = self.prepare(chat_index).await?;

        tracing::info!(
            "[AUTO-CHECK] Stage 1: calling primary model {} with {} messages",
            config.model,
            messages.len()
        );
        let first = self.open_stream(messages.clone(), config, cancel).await?;
        let first_text = if self.settings.stream_first {
            self.drain_into_chat(&first, chat_index, cancel).await?
        } else {
            drain(&first, &self.session, |_| async {}).await?
        };
        drop(first);
        tracing::info!("[AUTO-CHECK] Stage 1: {} chars received", first_text.chars().count());

        if !self.session.is_generating() || cancel.is_cancelled() {
            tracing::info!("[AUTO-CHECK] Cancelled after stage 1; skipping stage 2");
            return Ok(());
        }
        if first_text.trim().is_empty() {
            tracing::info!("[AUTO-CHECK] Stage 1 produced no text; skipping stage 2");
            return Ok(());
        }

        self.store
            .update(|chats| match last_message_mut(chats, chat_index) {
                Some(last) => {
                    last.content = vec![ContentPart::text("")];
                    true
                }
                None => false,
            })
            .await;
        self.store.emit(AppEvent::StageCleared { chat_index });

        let user_request = last_user_request(&messages);
        let prompt = build_checker_prompt(
            self.settings.checker_template.as_deref(),
            &user_request,
            &first_text,
        );
        let checker_messages = vec![Message::text(Role::User, prompt)];

        tracing::info!(
            "[AUTO-CHECK] Stage 2: calling checker model {}",
            self.settings.checker_config.model
        );
        let second = self
            .open_stream(checker_messages, self.settings.checker_config.clone(), cancel)
            .await?;

        if !self.session.is_generating() || cancel.is_cancelled() {
            tracing::info!("[AUTO-CHECK] Cancelled before stage 2 streamed");
            return Ok(());
        }

        self.drain_into_chat(&second, chat_index, cancel).await?;
        tracing::info!("[AUTO-CHECK] Stage 2: checker streaming complete");
        Ok(())
    }

    /// History before the placeholder, trimmed to the chat's budget.
    async fn prepare(&self, chat_index: usize) -> Result<(Vec<Message>, ChatConfig)> {
        let chat = self.store.chat(chat_index).await.ok_or_else(|| {
            ParleyError::Internal(
                format!("No chat at index {}", chat_index),
                tracing_error::SpanTrace::capture(),
            )
        })?;

        let prior = &chat.messages[..chat.messages.len().saturating_sub(1)];
        let messages = self
            .budget
            .trim(prior, chat.config.max_tokens, &chat.config.model);
        if messages.is_empty() {
            return Err(ParleyError::Budget {
                max_tokens: chat.config.max_tokens,
                model: chat.config.model.clone(),
            }
            .into());
        }
        Ok((messages, chat.config))
    }

    async fn open_stream(
        &self,
        messages: Vec<Message>,
        config: ChatConfig,
        cancel: &CancellationToken,
    ) -> Result<ResponseBody> {
        let failover = self
            .keys
            .with_failover(&self.settings.endpoint, |key| {
                let request = self.request(messages.clone(), config.clone(), key);
                self.transport.open_stream(request, cancel.clone())
            })
            .await?;
        Ok(failover.result)
    }

    fn request(&self, messages: Vec<Message>, config: ChatConfig, key: Option<String>) -> CompletionRequest {
        CompletionRequest::new(self.settings.endpoint.clone(), messages, config)
            .with_credential(key)
            .with_api_version(self.settings.api_version.clone())
    }

    async fn drain_into_chat(
        &self,
        body: &ResponseBody,
        chat_index: usize,
        cancel: &CancellationToken,
    ) -> Result<String> {
        drain(body, &self.session, move |delta| {
            self.apply_delta(chat_index, delta, cancel)
        })
        .await
    }

    async fn apply_delta(&self, chat_index: usize, delta: String, cancel: &CancellationToken) {
        if !self.session.is_generating() || cancel.is_cancelled() {
            return;
        }
        let applied = self
            .store
            .update(|chats| match last_message_mut(chats, chat_index) {
                Some(last) => last.append_to_first_text(&delta),
                None => false,
            })
            .await;
        if applied {
            self.store.emit(AppEvent::Delta {
                chat_index,
                text: delta,
            });
        }
    }

    /// One-shot completion asking for a short title.
    pub async fn generate_title(&self, messages: Vec<Message>, config: &ChatConfig) -> Result<String> {
        let mut title_config = config.clone();
        if let Some(model) = &self.settings.title_model {
            title_config.model = model.clone();
        }
        let cancel = CancellationToken::new();

        let outcome = self
            .keys
            .with_failover(&self.settings.endpoint, |key| {
                let request = self.request(messages.clone(), title_config.clone(), key);
                self.transport.complete_once(request, cancel.clone())
            })
            .await
            .and_then(|f| {
                let response: CompletionResponse = serde_json::from_value(f.result)?;
                response
                    .first_content()
                    .map(str::to_string)
                    .ok_or_else(|| ParleyError::Protocol("completion has no message content".into()).into())
            });

        outcome.map_err(|e| {
            ParleyError::Title(format!(
                "{}\n{}",
                self.translator.translate("errors.errorGeneratingTitle", None),
                self.describe_error(&e)
            ))
            .into()
        })
    }

    async fn auto_title(&self, chat_index: usize) {
        let Some(chat) = self.store.chat(chat_index).await else {
            return;
        };
        if chat.title_set {
            return;
        }

        let user = last_user_request(&chat.messages);
        let assistant = chat
            .last_message()
            .filter(|m| m.role == Role::Assistant)
            .map(|m| m.text_parts().collect::<Vec<_>>().join("\n\n"))
            .unwrap_or_default();
        let prompt = format!(
            "{}\n\"\"\"\nUser:\n{}\n\nAssistant:\n{}\n\"\"\"",
            TITLE_PROMPT, user, assistant
        );

        match self
            .generate_title(vec![Message::text(Role::User, prompt)], &chat.config)
            .await
        {
            Ok(title) => {
                let title = title.trim().trim_matches('"').trim().to_string();
                tracing::info!("[SUBMIT] Chat titled \"{}\"", title);
                self.store
                    .update(|chats| match chats.get_mut(chat_index) {
                        Some(c) => {
                            c.title = title;
                            c.title_set = true;
                            true
                        }
                        None => false,
                    })
                    .await;
            }
            Err(e) => self.store.notify(NoticeLevel::Error, e.to_string()),
        }
    }

    /// The text shown to the user for a failed submission.
    pub fn describe_error(&self, error: &ObservedError) -> String {
        let t = |key: &str| self.translator.translate(key, None);
        match &error.inner {
            ParleyError::MissingCredential => t("noApiKeyWarning"),
            ParleyError::Budget { .. } => t("errors.messageExceedMaxToken"),
            ParleyError::StreamLocked => t("errors.streamLocked"),
            ParleyError::EndpointAccess {
                body,
                model_not_found: true,
                ..
            } => format!("{}\n{}", body, t("errors.modelAccess")),
            ParleyError::EndpointAccess { .. } => t("errors.invalidEndpoint"),
            ParleyError::RateLimited {
                body,
                insufficient_quota: true,
                ..
            } => format!("{}\n{}", body, t("errors.insufficientQuota")),
            ParleyError::RateLimited { status, body, .. } if *status == StatusCode::TOO_MANY_REQUESTS => {
                format!("{}\n{}", body, t("errors.rateLimited"))
            }
            ParleyError::RateLimited { body, .. } | ParleyError::Transport { body, .. } => body.clone(),
            other => other.to_string(),
        }
    }
}

fn last_message_mut(chats: &mut [Chat], chat_index: usize) -> Option<&mut Message> {
    chats.get_mut(chat_index)?.messages.last_mut()
}
