use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::Stream;
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, error};

use crate::config::ClientConfig;
use crate::errors::ChatError;
use crate::models::{
    ChatMessage, ChatRequest, ChatSession, ErrorBody, FallbackResponse, MessagesResponse,
    ModelsResponse, NewChatResponse, SessionsResponse,
};

const STREAM_PATH: &str = "/api/chat/stream";
const SEND_PATH: &str = "/api/chat/send";
const SESSIONS_PATH: &str = "/api/chat/sessions";
const NEW_CHAT_PATH: &str = "/api/chat/new";
const MODELS_PATH: &str = "/api/models";

/// Raw body of an open streaming response.
pub type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Thin wrapper over the chat backend's REST endpoints.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    config: Arc<ClientConfig>,
}

impl ApiClient {
    pub fn new(config: ClientConfig) -> Result<Self, ChatError> {
        // No overall timeout on the client itself: it would cut long streams short.
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(ChatError::NetworkUnavailable)?;
        Ok(Self { http, config: Arc::new(config) })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.config.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Opens the streaming endpoint. Any non-success status is a `StreamOpenFailure`;
    /// response headers that take longer than the idle timeout are a `StreamOpenTimeout`.
    pub async fn open_stream(&self, request: &ChatRequest) -> Result<ByteStream, ChatError> {
        let url = self.config.endpoint(STREAM_PATH);
        let wait = self.config.stream_idle_timeout;
        // Only the wait for headers is bounded here; the body is timed per read.
        let sent = self
            .authorized(self.http.post(&url))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(request)
            .send();
        let resp = tokio::time::timeout(wait, sent)
            .await
            .map_err(|_| {
                error!("Streaming endpoint at {url} sent no response within {wait:?}");
                ChatError::StreamOpenTimeout { after: wait }
            })?
            .map_err(|e| {
                error!("Failed to open stream at {url}: {e}");
                ChatError::NetworkUnavailable(e)
            })?;

        let status = resp.status();
        if !status.is_success() {
            let message = tokio::time::timeout(wait, error_message(resp)).await.ok().flatten();
            error!("Streaming endpoint returned {status}");
            return Err(ChatError::StreamOpenFailure { status: status.as_u16(), message });
        }

        debug!("Stream opened ({status})");
        Ok(Box::pin(resp.bytes_stream()))
    }

    /// Sends the turn to the non-streaming endpoint and waits for the whole reply.
    pub async fn send_fallback(&self, request: &ChatRequest) -> Result<FallbackResponse, ChatError> {
        let url = self.config.endpoint(SEND_PATH);
        let resp = self
            .authorized(self.http.post(&url))
            .timeout(self.config.request_timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                error!("Fallback request to {url} failed: {e}");
                ChatError::NetworkUnavailable(e)
            })?;

        let status = resp.status();
        if !status.is_success() {
            let message = error_message(resp)
                .await
                .unwrap_or_else(|| "Failed to send message".to_string());
            error!("Fallback endpoint returned {status}: {message}");
            return Err(ChatError::FallbackFailure { status: status.as_u16(), message });
        }

        resp.json::<FallbackResponse>()
            .await
            .map_err(|e| ChatError::decode(SEND_PATH, e))
    }

    /// Fetches the session list (the history refresh after a completed turn).
    pub async fn fetch_sessions(&self) -> Result<Vec<ChatSession>, ChatError> {
        let body: SessionsResponse = self.get_json(SESSIONS_PATH.to_string()).await?;
        Ok(body.sessions)
    }

    /// Fetches all messages of one session, oldest first.
    pub async fn fetch_messages(&self, session_id: &str) -> Result<Vec<ChatMessage>, ChatError> {
        let body: MessagesResponse = self.get_json(format!("/api/chat/messages/{session_id}")).await?;
        Ok(body.messages)
    }

    pub async fn fetch_models(&self) -> Result<Vec<String>, ChatError> {
        let body: ModelsResponse = self.get_json(MODELS_PATH.to_string()).await?;
        Ok(body.models)
    }

    /// Creates an empty session on the backend and returns its id.
    pub async fn new_chat(&self) -> Result<String, ChatError> {
        let resp = self
            .authorized(self.http.post(self.config.endpoint(NEW_CHAT_PATH)))
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(ChatError::NetworkUnavailable)?;
        let body: NewChatResponse = read_json(NEW_CHAT_PATH, resp).await?;
        Ok(body.session_id)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: String) -> Result<T, ChatError> {
        let resp = self
            .authorized(self.http.get(self.config.endpoint(&path)))
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| {
                error!("GET {path} failed: {e}");
                ChatError::NetworkUnavailable(e)
            })?;
        read_json(&path, resp).await
    }
}

async fn read_json<T: DeserializeOwned>(endpoint: &str, resp: Response) -> Result<T, ChatError> {
    let status = resp.status();
    if !status.is_success() {
        return Err(ChatError::RequestFailed {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
        });
    }
    resp.json::<T>().await.map_err(|e| ChatError::decode(endpoint, e))
}

/// Pulls the `error` field out of a failed response, if the body has one.
async fn error_message(resp: Response) -> Option<String> {
    let body = resp.text().await.ok()?;
    serde_json::from_str::<ErrorBody>(&body)
        .map(|b| b.error)
        .ok()
        .or_else(|| Some(body.trim().to_string()).filter(|s| !s.is_empty()))
}
