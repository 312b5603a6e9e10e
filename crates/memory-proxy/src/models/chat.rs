use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque conversation key
pub type ThreadId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// One stored turn of a thread. Immutable once saved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

// ===== REQUEST MODELS =====

/// Body of `POST /v1/responses`
#[derive(Debug, Clone, Deserialize)]
pub struct ResponsesRequest {
    #[serde(default)]
    pub thread_id: Option<ThreadId>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub stream: bool,
}

/// Payload sent to `{upstream}/v1/chat/completions`
#[derive(Debug, Serialize)]
pub struct ChatCompletionRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [Message],
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
}

// ===== UPSTREAM RESPONSE MODELS =====
// Every field is optional: providers disagree on shape and a missing field
// must not fail the whole parse.

#[derive(Debug, Default, Deserialize)]
pub struct ChatCompletionEnvelope {
    #[serde(default)]
    pub choices: Vec<CompletionChoice>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CompletionChoice {
    #[serde(default)]
    pub message: Option<ChoiceText>,
    #[serde(default)]
    pub delta: Option<ChoiceText>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChoiceText {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

fn first_non_empty<'a>(candidates: &[Option<&'a str>]) -> Option<&'a str> {
    candidates
        .iter()
        .flatten()
        .copied()
        .find(|text| !text.is_empty())
}

impl ChatCompletionEnvelope {
    /// Full reply of a buffered completion:
    /// `message.content`, then `message.text`, then flat `text`.
    pub fn message_text(&self) -> Option<&str> {
        let choice = self.choices.first()?;
        let message = choice.message.as_ref();
        first_non_empty(&[
            message.and_then(|m| m.content.as_deref()),
            message.and_then(|m| m.text.as_deref()),
            choice.text.as_deref(),
        ])
    }

    /// Incremental fragment of a streamed completion:
    /// `delta.content`, then `delta.text`, then flat `text`.
    pub fn delta_text(&self) -> Option<&str> {
        let choice = self.choices.first()?;
        let delta = choice.delta.as_ref();
        first_non_empty(&[
            delta.and_then(|d| d.content.as_deref()),
            delta.and_then(|d| d.text.as_deref()),
            choice.text.as_deref(),
        ])
    }
}
