use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// The single in-flight generation: its flag, its abort handle and the last error.
#[derive(Debug, Default)]
pub struct GenerationSession {
    generating: AtomicBool,
    abort: Mutex<Option<CancellationToken>>,
    error: Mutex<String>,
}

impl GenerationSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the session for a new submission. Returns `None` if one is running.
    pub fn try_begin(&self) -> Option<CancellationToken> {
        if self
            .generating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        let token = CancellationToken::new();
        *self.abort.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.clone());
        self.clear_error();
        Some(token)
    }

    pub fn is_generating(&self) -> bool {
        self.generating.load(Ordering::SeqCst)
    }

    /// Turning generation off also aborts whatever request is still live.
    pub fn set_generating(&self, generating: bool) {
        if !generating {
            let handle = self.abort.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(token) = handle {
                if !token.is_cancelled() {
                    token.cancel();
                }
            }
        }
        self.generating.store(generating, Ordering::SeqCst);
    }

    pub fn cancel_generation(&self) {
        if self.is_generating() {
            tracing::info!("[SUBMIT] Generation cancelled");
        }
        self.set_generating(false);
    }

    pub fn abort_token(&self) -> Option<CancellationToken> {
        self.abort.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn error(&self) -> String {
        self.error.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_error(&self, message: impl Into<String>) {
        *self.error.lock().unwrap_or_else(|e| e.into_inner()) = message.into();
    }

    pub fn clear_error(&self) {
        self.error.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
