//! Chat request types shared by every backend.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Per-request generation options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatOptions {
    /// Ask the backend for structured JSON output.
    #[serde(default)]
    pub json: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl ChatOptions {
    pub fn json() -> Self {
        Self {
            json: true,
            temperature: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// One request inside a batch. `id` is echoed back in the matching result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub id: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub options: ChatOptions,
}

impl BatchRequest {
    pub fn new(id: impl Into<String>, messages: Vec<ChatMessage>, options: ChatOptions) -> Self {
        Self {
            id: id.into(),
            messages,
            options,
        }
    }

    /// A system + user prompt pair.
    pub fn prompt(
        id: impl Into<String>,
        system: &str,
        user: impl Into<String>,
        options: ChatOptions,
    ) -> Self {
        Self::new(
            id,
            vec![ChatMessage::system(system), ChatMessage::user(user)],
            options,
        )
    }
}
