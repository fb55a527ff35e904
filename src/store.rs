//! Application-wide chat list with quota-aware commits.

use crate::i18n::{Translator, NS_IMPORT};
use crate::types::*;
use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Durable home of the chat list.
pub trait ChatPersistence: Send + Sync {
    fn commit<'a>(&'a self, chats: &'a [Chat]) -> BoxFuture<'a, StorageResult<()>>;
}

/// Bytes a chat list occupies once serialized.
pub fn serialized_size(chats: &[Chat]) -> StorageResult<usize> {
    serde_json::to_vec(chats)
        .map(|v| v.len())
        .map_err(|e| StorageError::Backend(e.to_string()))
}

/// In-process persistence with an optional byte capacity.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    capacity: Option<usize>,
    committed: std::sync::Mutex<Vec<Chat>>,
    commits: AtomicUsize,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    pub fn committed(&self) -> Vec<Chat> {
        self.committed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

impl ChatPersistence for MemoryPersistence {
    fn commit<'a>(&'a self, chats: &'a [Chat]) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            if let Some(capacity) = self.capacity {
                let needed = serialized_size(chats)?;
                if needed > capacity {
                    return Err(StorageError::QuotaExceeded { needed, capacity });
                }
            }
            *self.committed.lock().unwrap_or_else(|e| e.into_inner()) = chats.to_vec();
            self.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// How a message is written into a chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageEdit {
    /// Push a new message with this role.
    Append(Role),
    /// Overwrite the content of the message at this index.
    Replace(usize),
    /// Overwrite the message at this index and drop everything after it.
    ReplaceAndTruncate(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// Quota forced the images out; only text parts were kept.
    TextOnly,
    Failed,
}

struct StoreState {
    chats: Vec<Chat>,
    current_chat_index: usize,
    last_failure: Option<StorageError>,
}

pub struct ChatStore {
    state: Mutex<StoreState>,
    persistence: Arc<dyn ChatPersistence>,
    translator: Arc<dyn Translator>,
    events: broadcast::Sender<AppEvent>,
}

impl ChatStore {
    pub fn new(
        chats: Vec<Chat>,
        persistence: Arc<dyn ChatPersistence>,
        translator: Arc<dyn Translator>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(StoreState {
                chats,
                current_chat_index: 0,
                last_failure: None,
            }),
            persistence,
            translator,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: AppEvent) {
        let _ = self.events.send(event);
    }

    pub fn notify(&self, level: NoticeLevel, message: impl Into<String>) {
        let notice = Notice::new(level, message);
        match level {
            NoticeLevel::Info => tracing::info!("[STORE] {}", notice.message),
            NoticeLevel::Error => tracing::warn!("[STORE] {}", notice.message),
        }
        self.emit(AppEvent::Notice(notice));
    }

    pub async fn snapshot(&self) -> Vec<Chat> {
        self.state.lock().await.chats.clone()
    }

    pub async fn chat(&self, index: usize) -> Option<Chat> {
        self.state.lock().await.chats.get(index).cloned()
    }

    pub async fn current_chat_index(&self) -> usize {
        self.state.lock().await.current_chat_index
    }

    pub async fn set_current_chat_index(&self, index: usize) {
        self.state.lock().await.current_chat_index = index;
    }

    /// Replaces the whole list and persists it. The in-memory list is replaced
    /// even when persisting fails.
    pub async fn set_chats(&self, chats: Vec<Chat>) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        state.chats = chats;
        self.persistence.commit(&state.chats).await
    }

    /// Applies `f` to the list and persists the result. Failures are reported
    /// as notices (once per distinct error) and never returned.
    pub async fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut Vec<Chat>) -> bool,
    {
        let mut state = self.state.lock().await;
        if !f(&mut state.chats) {
            return false;
        }
        match self.persistence.commit(&state.chats).await {
            Ok(()) => {
                state.last_failure = None;
            }
            Err(e) => {
                if state.last_failure.as_ref() != Some(&e) {
                    self.notify(NoticeLevel::Error, e.to_string());
                }
                state.last_failure = Some(e);
            }
        }
        true
    }

    /// Writes `content` as described by `edit`. On a quota failure the list is
    /// rolled back and the write retried with text parts only.
    pub async fn save_message(
        &self,
        chat_index: usize,
        edit: MessageEdit,
        content: Vec<ContentPart>,
    ) -> SaveOutcome {
        let mut state = self.state.lock().await;
        let original = state.chats.clone();

        let mut updated = original.clone();
        if let Err(reason) = apply_edit(&mut updated, chat_index, edit, content.clone()) {
            self.notify(NoticeLevel::Error, reason);
            return SaveOutcome::Failed;
        }
        state.chats = updated;

        let error = match self.persistence.commit(&state.chats).await {
            Ok(()) => return SaveOutcome::Saved,
            Err(e) => e,
        };

        state.chats = original.clone();
        if let Err(e) = self.persistence.commit(&state.chats).await {
            tracing::warn!("[STORE] Rollback commit failed: {}", e);
        }

        if !error.is_quota_exceeded() {
            self.notify(NoticeLevel::Error, error.to_string());
            return SaveOutcome::Failed;
        }

        self.notify(
            NoticeLevel::Error,
            self.translator
                .translate("notifications.quotaExceeded", Some(NS_IMPORT)),
        );

        let text_only: Vec<ContentPart> = content.into_iter().filter(ContentPart::is_text).collect();
        if text_only.is_empty() {
            return SaveOutcome::Failed;
        }

        let mut fallback = original.clone();
        if let Err(reason) = apply_edit(&mut fallback, chat_index, edit, text_only) {
            self.notify(NoticeLevel::Error, reason);
            return SaveOutcome::Failed;
        }
        state.chats = fallback;

        match self.persistence.commit(&state.chats).await {
            Ok(()) => {
                self.notify(
                    NoticeLevel::Info,
                    self.translator
                        .translate("notifications.textSavedOnly", Some(NS_IMPORT)),
                );
                SaveOutcome::TextOnly
            }
            Err(e) => {
                state.chats = original;
                self.notify(NoticeLevel::Error, e.to_string());
                SaveOutcome::Failed
            }
        }
    }
}

fn apply_edit(
    chats: &mut [Chat],
    chat_index: usize,
    edit: MessageEdit,
    content: Vec<ContentPart>,
) -> std::result::Result<(), String> {
    let chat = chats
        .get_mut(chat_index)
        .ok_or_else(|| format!("No chat at index {}", chat_index))?;

    match edit {
        MessageEdit::Append(role) => chat.messages.push(Message::new(role, content)),
        MessageEdit::Replace(index) | MessageEdit::ReplaceAndTruncate(index) => {
            let message = chat
                .messages
                .get_mut(index)
                .ok_or_else(|| format!("No message at index {}", index))?;
            message.content = content;
            if matches!(edit, MessageEdit::ReplaceAndTruncate(_)) {
                chat.messages.truncate(index + 1);
            }
        }
    }
    Ok(())
}
