use crate::constants::{INSUFFICIENT_QUOTA_MARKER, MODEL_NOT_FOUND_MARKER};
use crate::projections::{build_body, flavor_for, RequestOverlay};
use crate::types::*;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{Stream, StreamExt};
use reqwest::StatusCode;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Everything needed to address one completion call.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub endpoint: String,
    pub messages: Vec<Message>,
    pub config: ChatConfig,
    pub credential: Option<String>,
    pub extra_headers: Vec<(String, String)>,
    pub api_version: Option<String>,
}

impl CompletionRequest {
    pub fn new(endpoint: impl Into<String>, messages: Vec<Message>, config: ChatConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            messages,
            config,
            credential: None,
            extra_headers: Vec::new(),
            api_version: None,
        }
    }

    pub fn with_credential(mut self, credential: Option<String>) -> Self {
        self.credential = credential;
        self
    }

    pub fn with_api_version(mut self, api_version: Option<String>) -> Self {
        self.api_version = api_version;
        self
    }
}

/// The URL, headers and JSON body a request resolves to.
#[derive(Debug, Clone)]
pub struct ProjectedRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: serde_json::Map<String, serde_json::Value>,
}

pub fn project(
    request: &CompletionRequest,
    overlay: &RequestOverlay,
    stream: bool,
) -> Result<ProjectedRequest> {
    let credential = request.credential.as_deref().filter(|c| !c.is_empty());
    let flavor = flavor_for(&request.endpoint, credential.is_some());

    let url = flavor.resolve_url(
        &request.endpoint,
        &request.config.model,
        request.api_version.as_deref(),
    );

    let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
    headers.extend(request.extra_headers.iter().cloned());
    if let Some(key) = credential {
        headers.extend(flavor.auth_headers(key));
    }

    let body = build_body(&request.messages, &request.config, overlay, stream)?;
    tracing::debug!(
        "[TRANSPORT] {} request to {} (model {})",
        flavor.name(),
        url,
        request.config.model
    );

    Ok(ProjectedRequest { url, headers, body })
}

/// The seam between the orchestrator and the network.
pub trait CompletionApi: Send + Sync {
    fn complete_once(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<serde_json::Value>>;

    fn open_stream(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<ResponseBody>>;
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

pub struct HttpTransport {
    client: reqwest::Client,
    overlay: RequestOverlay,
}

impl HttpTransport {
    pub fn new(settings: &TransportSettings, overlay: RequestOverlay) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .connect_timeout(settings.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Duration::from_secs(60))
            .build()?;
        Ok(Self { client, overlay })
    }

    pub fn with_client(client: reqwest::Client, overlay: RequestOverlay) -> Self {
        Self { client, overlay }
    }

    async fn send(
        &self,
        request: &CompletionRequest,
        stream: bool,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response> {
        let projected = project(request, &self.overlay, stream)?;
        tracing::trace!(
            "[TRANSPORT] Body: {}",
            crate::redaction::redacted(&serde_json::Value::Object(projected.body.clone()))
        );

        let mut builder = self.client.post(&projected.url);
        for (name, value) in &projected.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let pending = builder.json(&projected.body).send();

        tokio::select! {
            _ = cancel.cancelled() => Err(ParleyError::Cancelled.into()),
            res = pending => Ok(res?),
        }
    }
}

impl CompletionApi for HttpTransport {
    fn complete_once(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            let response = self.send(&request, false, &cancel).await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ParleyError::Transport { status, body }.into());
            }
            tokio::select! {
                _ = cancel.cancelled() => Err(ParleyError::Cancelled.into()),
                value = response.json::<serde_json::Value>() => Ok(value?),
            }
        })
    }

    fn open_stream(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<ResponseBody>> {
        Box::pin(async move {
            let response = self.send(&request, true, &cancel).await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(classify_stream_failure(status, body).into());
            }
            Ok(ResponseBody::from_response(response))
        })
    }
}

/// Maps a non-2xx status on the streaming path to an error kind.
pub fn classify_stream_failure(status: StatusCode, body: String) -> ParleyError {
    match status {
        StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED => ParleyError::EndpointAccess {
            status,
            model_not_found: body.contains(MODEL_NOT_FOUND_MARKER),
            body,
        },
        _ => ParleyError::RateLimited {
            status,
            insufficient_quota: body.contains(INSUFFICIENT_QUOTA_MARKER),
            body,
        },
    }
}

/// An unbuffered response body that one reader at a time may hold.
pub struct ResponseBody {
    slot: Arc<Mutex<Option<ByteStream>>>,
    releases: Arc<AtomicUsize>,
}

impl ResponseBody {
    pub fn new(stream: ByteStream) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(stream))),
            releases: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn from_response(response: reqwest::Response) -> Self {
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(ObservedError::from));
        Self::new(Box::pin(stream))
    }

    pub fn from_chunks<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let items: Vec<Result<Bytes>> = chunks.into_iter().map(|c| Ok(c.into())).collect();
        Self::new(Box::pin(futures_util::stream::iter(items)))
    }

    /// Takes the exclusive reader. Fails while another reader holds it.
    pub fn lock(&self) -> Result<BodyReader> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        match slot.take() {
            Some(stream) => Ok(BodyReader {
                stream: Some(stream),
                slot: Arc::clone(&self.slot),
                releases: Arc::clone(&self.releases),
            }),
            None => Err(ParleyError::StreamLocked.into()),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }

    /// How many times a reader has handed the stream back.
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Drops the underlying stream, closing the connection.
    pub fn cancel(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.take();
    }
}

pub struct BodyReader {
    stream: Option<ByteStream>,
    slot: Arc<Mutex<Option<ByteStream>>>,
    releases: Arc<AtomicUsize>,
}

impl BodyReader {
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        self.stream.as_mut()?.next().await
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(stream) = self.stream.take() {
            let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
            *slot = Some(stream);
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for BodyReader {
    fn drop(&mut self) {
        self.release_inner();
    }
}
