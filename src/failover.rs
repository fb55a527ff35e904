//! Rotating credential list shared by every outbound call.

use crate::constants::DEFAULT_API_ENDPOINT;
use crate::str_utils::mask_secret;
use crate::types::*;
use lazy_static::lazy_static;
use regex::Regex;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

lazy_static! {
    static ref KEY_SEPARATORS: Regex = Regex::new(r"[,\n;\s]+").expect("Invalid key separator regex");
}

/// Splits a free-form credential string into trimmed, non-empty keys.
pub fn parse_keys(input: &str) -> Vec<String> {
    KEY_SEPARATORS
        .split(input)
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(String::from)
        .collect()
}

/// Result of an operation that ran under failover.
#[derive(Debug)]
pub struct Failover<T> {
    pub result: T,
    /// `None` when the call went out without a credential.
    pub index_used: Option<usize>,
}

#[derive(Debug, Default)]
pub struct KeyRing {
    keys: RwLock<Vec<String>>,
    active: AtomicUsize,
}

impl KeyRing {
    pub fn new(keys: Vec<String>) -> Self {
        Self {
            keys: RwLock::new(keys.into_iter().filter(|k| !k.trim().is_empty()).collect()),
            active: AtomicUsize::new(0),
        }
    }

    pub fn from_raw(raw: &str) -> Self {
        Self::new(parse_keys(raw))
    }

    /// Swaps the credential list and starts rotation over from the first key.
    pub fn replace_keys(&self, raw: &str) {
        let parsed = parse_keys(raw);
        tracing::info!("[FAILOVER] Key list replaced ({} keys)", parsed.len());
        let mut keys = self.keys.write().unwrap_or_else(|e| e.into_inner());
        *keys = parsed;
        self.active.store(0, Ordering::SeqCst);
    }

    pub fn keys(&self) -> Vec<String> {
        self.keys.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.keys.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_index(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn set_active_index(&self, index: usize) {
        self.active.store(index, Ordering::SeqCst);
    }

    /// Runs `op` with each credential in turn, starting at the remembered index,
    /// until one succeeds. The winning index is remembered for the next call.
    pub async fn with_failover<T, F, Fut>(&self, endpoint: &str, mut op: F) -> Result<Failover<T>>
    where
        F: FnMut(Option<String>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let keys = self.keys();

        if keys.is_empty() {
            if endpoint == DEFAULT_API_ENDPOINT {
                return Err(ParleyError::MissingCredential.into());
            }
            let result = op(None).await?;
            return Ok(Failover {
                result,
                index_used: None,
            });
        }

        let n = keys.len();
        let start = self.active_index() % n;
        let mut last_error: Option<ObservedError> = None;

        for attempt in 0..n {
            let idx = (start + attempt) % n;
            let key = &keys[idx];
            match op(Some(key.clone())).await {
                Ok(result) => {
                    if idx != start {
                        tracing::info!(
                            "[FAILOVER] Switched to key #{} ({})",
                            idx,
                            mask_secret(key)
                        );
                    }
                    self.set_active_index(idx);
                    return Ok(Failover {
                        result,
                        index_used: Some(idx),
                    });
                }
                Err(e) if matches!(e.inner, ParleyError::Cancelled) => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        "[FAILOVER] Key #{} ({}) failed (attempt {}/{}): {}",
                        idx,
                        mask_secret(key),
                        attempt + 1,
                        n,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ParleyError::Internal(
                "All API keys failed".to_string(),
                tracing_error::SpanTrace::capture(),
            )
            .into()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keys_mixed_separators() {
        let keys = parse_keys(" a, b;c\n d  e ,, ");
        assert_eq!(keys, vec!["a", "b", "c", "d", "e"]);
        assert!(parse_keys("  ").is_empty());
    }

    #[test]
    fn test_replace_keys_resets_index() {
        let ring = KeyRing::from_raw("a,b,c");
        ring.set_active_index(2);
        ring.replace_keys("x y");
        assert_eq!(ring.active_index(), 0);
        assert_eq!(ring.keys(), vec!["x", "y"]);
    }

    #[tokio::test]
    async fn test_cancellation_does_not_rotate() {
        let ring = KeyRing::from_raw("a,b");
        let mut calls = 0;
        let res: Result<Failover<()>> = ring
            .with_failover("https://custom/v1", |_| {
                calls += 1;
                async { Err(ParleyError::Cancelled.into()) }
            })
            .await;
        assert!(matches!(res.unwrap_err().inner, ParleyError::Cancelled));
        assert_eq!(calls, 1);
    }
}
