use crate::constants::*;
use crate::specs::openai::{WireContent, WireMessage};
use crate::types::*;
use serde_json::{Map, Value};

/// How a given endpoint wants to be addressed and authenticated.
pub trait EndpointFlavor: Send + Sync {
    fn name(&self) -> &'static str;
    fn resolve_url(&self, endpoint: &str, model: &str, api_version: Option<&str>) -> String;
    fn auth_headers(&self, credential: &str) -> Vec<(String, String)> {
        vec![("Authorization".to_string(), format!("Bearer {}", credential))]
    }
}

pub struct StandardFlavor;
impl EndpointFlavor for StandardFlavor {
    fn name(&self) -> &'static str {
        "standard"
    }
    fn resolve_url(&self, endpoint: &str, _model: &str, _api_version: Option<&str>) -> String {
        endpoint.trim().to_string()
    }
}

pub struct AzureFlavor;
impl AzureFlavor {
    pub fn deployment_name(model: &str) -> &str {
        AZURE_MODEL_MAP
            .iter()
            .find(|(from, _)| *from == model)
            .map(|(_, to)| *to)
            .unwrap_or(model)
    }

    pub fn default_api_version(deployment: &str) -> &'static str {
        if AZURE_LARGE_MODELS.contains(&deployment) {
            AZURE_API_VERSION_LARGE
        } else {
            AZURE_API_VERSION_DEFAULT
        }
    }
}

impl EndpointFlavor for AzureFlavor {
    fn name(&self) -> &'static str {
        "azure"
    }

    fn resolve_url(&self, endpoint: &str, model: &str, api_version: Option<&str>) -> String {
        let deployment = Self::deployment_name(model);
        let version = match api_version {
            Some(v) if !v.trim().is_empty() => v.trim(),
            _ => Self::default_api_version(deployment),
        };
        let path = format!(
            "openai/deployments/{}/chat/completions?api-version={}",
            deployment, version
        );

        let mut url = endpoint.to_string();
        if !url.ends_with(&path) {
            if !url.ends_with('/') {
                url.push('/');
            }
            url.push_str(&path);
        }
        url.trim().to_string()
    }

    fn auth_headers(&self, credential: &str) -> Vec<(String, String)> {
        vec![
            ("Authorization".to_string(), format!("Bearer {}", credential)),
            ("api-key".to_string(), credential.to_string()),
        ]
    }
}

pub fn is_azure_endpoint(endpoint: &str) -> bool {
    endpoint.contains(AZURE_ENDPOINT_MARKER)
}

/// Azure addressing only applies when there is a key to put in `api-key`.
pub fn flavor_for(endpoint: &str, has_credential: bool) -> Box<dyn EndpointFlavor> {
    if has_credential && is_azure_endpoint(endpoint) {
        Box::new(AzureFlavor)
    } else {
        Box::new(StandardFlavor)
    }
}

/// Free-form fields merged last into every request body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOverlay(Map<String, Value>);

impl RequestOverlay {
    /// Invalid JSON degrades to an empty overlay.
    pub fn parse(raw: &str) -> Self {
        if raw.trim().is_empty() {
            return Self::default();
        }
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Self(map),
            Ok(other) => {
                tracing::warn!(
                    "Custom request body is not a JSON object ({}), ignoring it",
                    json_kind(&other)
                );
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Invalid JSON in custom request body, ignoring it: {}", e);
                Self::default()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Collapses all-text content into one string; mixed content keeps its parts.
pub fn normalize_messages(messages: &[Message]) -> Vec<WireMessage> {
    messages
        .iter()
        .map(|m| {
            let all_text = !m.content.is_empty() && m.content.iter().all(ContentPart::is_text);
            let content = if all_text {
                WireContent::String(m.text_parts().collect::<Vec<_>>().join("\n\n"))
            } else {
                WireContent::Parts(m.content.clone())
            };
            WireMessage {
                role: m.role,
                content,
            }
        })
        .collect()
}

/// The config keys that may reach the wire, in a fixed order.
pub fn config_fields(config: &ChatConfig) -> Vec<(&'static str, Value)> {
    vec![
        ("model", Value::from(config.model.clone())),
        ("max_tokens", Value::from(config.max_tokens)),
        ("temperature", Value::from(config.temperature)),
        ("presence_penalty", Value::from(config.presence_penalty)),
        ("top_p", Value::from(config.top_p)),
        ("frequency_penalty", Value::from(config.frequency_penalty)),
    ]
}

/// messages → config (minus excluded) → overlay → drop `max_tokens` → `stream`.
pub fn build_body(
    messages: &[Message],
    config: &ChatConfig,
    overlay: &RequestOverlay,
    stream: bool,
) -> Result<Map<String, Value>> {
    let mut body = Map::new();
    body.insert(
        "messages".to_string(),
        serde_json::to_value(normalize_messages(messages))?,
    );

    for (key, value) in config_fields(config) {
        if config.is_excluded(key) {
            continue;
        }
        body.insert(key.to_string(), value);
    }

    for (key, value) in overlay.fields() {
        body.insert(key.clone(), value.clone());
    }

    body.remove("max_tokens");

    if stream {
        body.insert("stream".to_string(), Value::Bool(true));
    }
    Ok(body)
}
