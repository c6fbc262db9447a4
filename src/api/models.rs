//! API request and response models (OpenAI compatible)

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::backend::{Capabilities, ChatMessage, GenerationRequest, SamplingParams, Usage};
use crate::error::{AppError, Result};
use crate::gateway::{BackendHealthState, HealthSummary};
use crate::queue::AdmissionStats;

const ALLOWED_ROLES: [&str; 4] = ["system", "user", "assistant", "tool"];
const MAX_STOP_SEQUENCES: usize = 4;

/// Stop sequences, either a single string or a list
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, ToSchema)]
#[serde(untagged)]
pub enum StopSequences {
    Single(String),
    Many(Vec<String>),
}

impl StopSequences {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            StopSequences::Single(stop) => vec![stop],
            StopSequences::Many(stops) => stops,
        }
    }
}

/// Chat completion request (OpenAI compatible)
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct ApiChatCompletionRequest {
    /// Model id or alias; also used to pick the backend
    #[serde(default)]
    pub model: Option<String>,

    pub messages: Vec<ChatMessage>,

    #[serde(default)]
    pub temperature: Option<f32>,

    #[serde(default)]
    pub top_p: Option<f32>,

    #[serde(default)]
    pub max_tokens: Option<u32>,

    #[serde(default)]
    pub stream: bool,

    #[serde(default)]
    pub stop: Option<StopSequences>,

    /// Specific backend to use (extension, takes precedence over `model`)
    #[serde(default)]
    pub backend: Option<String>,
}

impl ApiChatCompletionRequest {
    /// Check the request and turn it into the gateway-internal form
    pub fn into_generation_request(self) -> Result<GenerationRequest> {
        let invalid = |message: String| Err(AppError::InvalidRequest(message));

        if self.messages.is_empty() {
            return invalid("messages must not be empty".to_string());
        }
        if let Some(message) = self
            .messages
            .iter()
            .find(|m| !ALLOWED_ROLES.contains(&m.role.as_str()))
        {
            return invalid(format!(
                "unsupported message role '{}', expected one of {}",
                message.role,
                ALLOWED_ROLES.join(", ")
            ));
        }
        if let Some(temperature) = self.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return invalid(format!("temperature must be within [0, 2], got {}", temperature));
            }
        }
        if let Some(top_p) = self.top_p {
            if !(top_p > 0.0 && top_p <= 1.0) {
                return invalid(format!("top_p must be within (0, 1], got {}", top_p));
            }
        }
        if self.max_tokens == Some(0) {
            return invalid("max_tokens must be at least 1".to_string());
        }

        let stop = self.stop.map(StopSequences::into_vec).unwrap_or_default();
        if stop.len() > MAX_STOP_SEQUENCES {
            return invalid(format!(
                "at most {} stop sequences are allowed, got {}",
                MAX_STOP_SEQUENCES,
                stop.len()
            ));
        }
        if stop.iter().any(String::is_empty) {
            return invalid("stop sequences must not be empty".to_string());
        }

        Ok(GenerationRequest {
            messages: self.messages,
            sampling: SamplingParams {
                temperature: self.temperature,
                top_p: self.top_p,
                max_tokens: self.max_tokens,
                stop,
            },
            stream: self.stream,
            model: self.model,
            backend: self.backend,
        })
    }
}

/// Chat completion response (OpenAI compatible)
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: Option<String>,
}

/// One streamed chunk (OpenAI compatible)
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, ToSchema)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Model entry for `/v1/models`
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct ModelsResponse {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

/// Backend information for the management API
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BackendInfo {
    pub name: String,
    pub protocol: String,
    pub endpoint: String,
    pub aliases: Vec<String>,
    pub capabilities: Capabilities,
    pub health: BackendHealthState,
    pub admission: AdmissionStats,
}

/// Backend list response
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BackendListResponse {
    pub default_backend: Option<String>,
    pub backends: Vec<BackendInfo>,
}

/// Health check response
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub in_flight: usize,
    pub backends: HealthSummary,
}

/// Result of a configuration reload
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct ReloadResponse {
    pub success: bool,
    pub backends: Vec<String>,
    pub default_backend: Option<String>,
}
