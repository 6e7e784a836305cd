use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::ChatError;

pub const DEFAULT_MODEL: &str = "Gemini 2.5 Flash";

// ── Turn state ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Pending,
    Streaming,
    /// The streaming path was abandoned and the one-shot fallback is in flight.
    FailedFallback,
    Completed,
    Failed,
}

impl TurnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnStatus::Pending => "pending",
            TurnStatus::Streaming => "streaming",
            TurnStatus::FailedFallback => "failed_fallback",
            TurnStatus::Completed => "completed",
            TurnStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnStatus::Completed | TurnStatus::Failed)
    }

    /// Submission stays disabled while a turn is in one of these states.
    pub fn is_active(&self) -> bool {
        matches!(self, TurnStatus::Pending | TurnStatus::Streaming)
    }

    pub fn can_transition_to(&self, next: TurnStatus) -> bool {
        use TurnStatus::*;
        matches!(
            (self, next),
            (Pending, Streaming | FailedFallback | Failed)
                | (Streaming, Completed | FailedFallback | Failed)
                | (FailedFallback, Completed | Failed)
        )
    }
}

impl std::fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the final text of a completed turn reached the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Streamed,
    Fallback,
}

/// One user prompt and its evolving AI response.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatTurn {
    prompt_text: String,
    model: String,
    session_id: Option<String>,
    attachment_ids: Vec<String>,
    status: TurnStatus,
    accumulated_text: String,
    final_message_id: Option<String>,
    completed_at: Option<DateTime<Utc>>,
}

impl ChatTurn {
    pub fn new(
        prompt: impl Into<String>,
        attachment_ids: Vec<String>,
        session_id: Option<String>,
        model: impl Into<String>,
    ) -> Result<Self, ChatError> {
        let prompt_text = prompt.into();
        if prompt_text.trim().is_empty() && attachment_ids.is_empty() {
            return Err(ChatError::EmptyPrompt);
        }
        Ok(Self {
            prompt_text,
            model: model.into(),
            session_id,
            attachment_ids,
            status: TurnStatus::Pending,
            accumulated_text: String::new(),
            final_message_id: None,
            completed_at: None,
        })
    }

    pub fn prompt_text(&self) -> &str {
        &self.prompt_text
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn attachment_ids(&self) -> &[String] {
        &self.attachment_ids
    }

    pub fn status(&self) -> TurnStatus {
        self.status
    }

    pub fn accumulated_text(&self) -> &str {
        &self.accumulated_text
    }

    pub fn final_message_id(&self) -> Option<&str> {
        self.final_message_id.as_deref()
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Builds the request body shared by the streaming and fallback endpoints.
    pub fn request(&self) -> ChatRequest {
        ChatRequest {
            message: self.prompt_text.trim().to_string(),
            model: self.model.clone(),
            session_id: self.session_id.clone(),
            attachment_ids: self.attachment_ids.clone(),
        }
    }

    fn transition(&mut self, next: TurnStatus) -> Result<(), ChatError> {
        if !self.status.can_transition_to(next) {
            return Err(ChatError::InvalidTransition { from: self.status, to: next });
        }
        self.status = next;
        Ok(())
    }

    pub fn begin_streaming(&mut self) -> Result<(), ChatError> {
        self.transition(TurnStatus::Streaming)
    }

    /// Appends a delta. Only valid while streaming; the text never shrinks here.
    pub fn append_delta(&mut self, delta: &str) -> Result<(), ChatError> {
        if self.status != TurnStatus::Streaming {
            return Err(ChatError::InvalidTransition {
                from: self.status,
                to: TurnStatus::Streaming,
            });
        }
        self.accumulated_text.push_str(delta);
        Ok(())
    }

    /// Finishes a streamed turn. A missing message id gets a local one.
    pub fn complete(
        &mut self,
        message_id: Option<String>,
        session_id: Option<String>,
    ) -> Result<(), ChatError> {
        self.transition(TurnStatus::Completed)?;
        self.final_message_id = Some(message_id.unwrap_or_else(local_message_id));
        if session_id.is_some() {
            self.session_id = session_id;
        }
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn begin_fallback(&mut self) -> Result<(), ChatError> {
        self.transition(TurnStatus::FailedFallback)
    }

    /// Finishes the turn from the non-streaming reply. Any partial text left
    /// over from an abandoned stream is replaced by the reply.
    pub fn complete_from_fallback(&mut self, reply: FallbackResponse) -> Result<(), ChatError> {
        if self.status != TurnStatus::FailedFallback {
            return Err(ChatError::InvalidTransition {
                from: self.status,
                to: TurnStatus::Completed,
            });
        }
        self.transition(TurnStatus::Completed)?;
        self.completed_at = Some(
            reply
                .ai_message
                .timestamp
                .as_deref()
                .and_then(parse_timestamp)
                .unwrap_or_else(Utc::now),
        );
        self.accumulated_text = reply.ai_message.text;
        self.final_message_id = Some(reply.ai_message.id);
        if reply.session_id.is_some() {
            self.session_id = reply.session_id;
        }
        Ok(())
    }

    pub fn fail(&mut self) -> Result<(), ChatError> {
        self.transition(TurnStatus::Failed)
    }
}

fn local_message_id() -> String {
    format!("local-{}", uuid::Uuid::new_v4())
}

/// Parses the server's ISO-8601 timestamps; naive values are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

// ── Wire types ───────────────────────────────────────────────────────────────

/// Request body for both the streaming and the fallback endpoint.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChatRequest {
    pub message: String,
    pub model: String,
    pub session_id: Option<String>,
    pub attachment_ids: Vec<String>,
}

/// A stored chat message as returned by the backend.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ChatMessage {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Response from the non-streaming fallback endpoint.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct FallbackResponse {
    #[serde(default, alias = "sessionId", deserialize_with = "deserialize_opt_id")]
    pub session_id: Option<String>,
    #[serde(alias = "aiMessage")]
    pub ai_message: ChatMessage,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ChatSession {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub message_count: usize,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SessionsResponse {
    #[serde(default)]
    pub sessions: Vec<ChatSession>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessagesResponse {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ModelsResponse {
    #[serde(default)]
    pub models: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct NewChatResponse {
    #[serde(alias = "sessionId", deserialize_with = "deserialize_id")]
    pub session_id: String,
}

/// `{"error": "..."}` body the backend returns on failures.
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    pub error: String,
}

// ── Id normalization ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(serde_json::Number),
}

impl From<RawId> for String {
    fn from(raw: RawId) -> Self {
        match raw {
            RawId::Text(s) => s,
            RawId::Number(n) => n.to_string(),
        }
    }
}

/// Ids arrive as strings or numbers depending on the backend table.
pub(crate) fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    RawId::deserialize(deserializer).map(String::from)
}

pub(crate) fn deserialize_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<RawId>::deserialize(deserializer)?.map(String::from))
}
