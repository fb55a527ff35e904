//! User-facing strings. Lookups that miss fall back to the key itself.

use std::collections::HashMap;

pub const NS_API: &str = "api";
pub const NS_IMPORT: &str = "import";

pub trait Translator: Send + Sync {
    fn translate(&self, key: &str, namespace: Option<&str>) -> String;
}

pub struct Catalog {
    entries: HashMap<(String, String), String>,
    default_namespace: String,
}

const ENGLISH: &[(&str, &str, &str)] = &[
    (
        NS_API,
        "noApiKeyWarning",
        "No API key supplied! Please add an API key for the default endpoint.",
    ),
    (
        NS_API,
        "errors.messageExceedMaxToken",
        "Message exceeds max token!",
    ),
    (
        NS_API,
        "errors.streamLocked",
        "Oops, the stream is locked!",
    ),
    (
        NS_API,
        "errors.errorGeneratingTitle",
        "Error generating title!",
    ),
    (
        NS_API,
        "errors.invalidEndpoint",
        "Invalid API endpoint! We recommend you to check your API endpoint.",
    ),
    (
        NS_API,
        "errors.modelAccess",
        "Please ensure that you have access to this model!",
    ),
    (
        NS_API,
        "errors.insufficientQuota",
        "We recommend changing your API endpoint or API key",
    ),
    (NS_API, "errors.rateLimited", "Rate limited!"),
    (
        NS_IMPORT,
        "notifications.quotaExceeded",
        "Storage quota exceeded! Images were not saved.",
    ),
    (
        NS_IMPORT,
        "notifications.textSavedOnly",
        "Only the text of the message was saved.",
    ),
];

impl Catalog {
    pub fn english() -> Self {
        let entries = ENGLISH
            .iter()
            .map(|(ns, key, text)| ((ns.to_string(), key.to_string()), text.to_string()))
            .collect();
        Self {
            entries,
            default_namespace: NS_API.to_string(),
        }
    }

    pub fn insert(&mut self, namespace: &str, key: &str, text: &str) {
        self.entries
            .insert((namespace.to_string(), key.to_string()), text.to_string());
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::english()
    }
}

impl Translator for Catalog {
    fn translate(&self, key: &str, namespace: Option<&str>) -> String {
        let ns = namespace.unwrap_or(&self.default_namespace);
        match self.entries.get(&(ns.to_string(), key.to_string())) {
            Some(text) => text.clone(),
            None => key.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_and_fallback() {
        let catalog = Catalog::english();
        assert_eq!(
            catalog.translate("errors.rateLimited", None),
            "Rate limited!"
        );
        assert_eq!(
            catalog.translate("notifications.textSavedOnly", Some(NS_IMPORT)),
            "Only the text of the message was saved."
        );
        assert_eq!(catalog.translate("missing.key", None), "missing.key");
        assert_eq!(
            catalog.translate("errors.rateLimited", Some(NS_IMPORT)),
            "errors.rateLimited"
        );
    }

    #[test]
    fn test_override_entry() {
        let mut catalog = Catalog::english();
        catalog.insert(NS_API, "errors.rateLimited", "Slow down");
        assert_eq!(catalog.translate("errors.rateLimited", None), "Slow down");
    }
}
