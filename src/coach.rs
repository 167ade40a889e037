//! Training suggestions from a hosted generative model.
//!
//! The prompt embeds the five most recent trainings together with the
//! practitioner's belt and academy. The model answers with free text that is
//! expected to hold one JSON object, possibly wrapped in a markdown fence.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, instrument};

use crate::config::AppConfig;
use crate::models::Training;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const RECENT_TRAININGS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiSuggestion {
    pub focus: String,
    pub reasoning: String,
    pub suggested_techniques: Vec<String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SuggestionError {
    #[error("AI coach is not configured: {0}")]
    Configuration(String),

    #[error("AI quota exceeded: {0}")]
    RateLimited(String),

    #[error("AI model not found: {0}")]
    ModelNotFound(String),

    #[error("AI response could not be parsed: {0}")]
    InvalidResponse(String),

    #[error("AI request failed: {0}")]
    Failed(String),
}

impl SuggestionError {
    /// Buckets a raw upstream error message for display purposes.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if message.contains("API key") || message.contains("Invalid") {
            SuggestionError::Configuration(message.to_string())
        } else if lower.contains("quota") {
            SuggestionError::RateLimited(message.to_string())
        } else if message.contains("404") || lower.contains("not found") {
            SuggestionError::ModelNotFound(message.to_string())
        } else {
            SuggestionError::Failed(message.to_string())
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SuggestionError::Configuration(_) => "configuration",
            SuggestionError::RateLimited(_) => "rate_limited",
            SuggestionError::ModelNotFound(_) => "model_not_found",
            SuggestionError::InvalidResponse(_) => "invalid_response",
            SuggestionError::Failed(_) => "failed",
        }
    }

    /// Copy shown to the user, in Portuguese unless the language is English.
    pub fn user_message(&self, language: &str) -> String {
        let english = language.to_lowercase().starts_with("en");
        match (self, english) {
            (SuggestionError::Configuration(_), false) => {
                "Chave da API Gemini inválida. Verifique sua configuração.".to_string()
            }
            (SuggestionError::Configuration(_), true) => {
                "Invalid Gemini API key. Check your configuration.".to_string()
            }
            (SuggestionError::RateLimited(_), false) => {
                "Cota da API Gemini excedida. Tente novamente mais tarde.".to_string()
            }
            (SuggestionError::RateLimited(_), true) => {
                "Gemini API quota exceeded. Try again later.".to_string()
            }
            (SuggestionError::ModelNotFound(_), false) => {
                "Modelo Gemini não encontrado. Verifique a configuração da API.".to_string()
            }
            (SuggestionError::ModelNotFound(_), true) => {
                "Gemini model not found. Check the API configuration.".to_string()
            }
            (SuggestionError::InvalidResponse(msg) | SuggestionError::Failed(msg), false) => {
                format!("Erro ao gerar sugestão: {}", msg)
            }
            (SuggestionError::InvalidResponse(msg) | SuggestionError::Failed(msg), true) => {
                format!("Error generating suggestion: {}", msg)
            }
        }
    }
}

pub fn build_prompt(trainings: &[Training], belt: &str, academy: &str) -> String {
    let recent = trainings
        .iter()
        .take(RECENT_TRAININGS)
        .map(|t| {
            format!(
                "{}: {} ({}min) - Focus: {}",
                t.date,
                t.kind.as_deref().unwrap_or("training"),
                t.duration,
                t.technique
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let recent = if recent.is_empty() {
        "No recent trainings recorded.".to_string()
    } else {
        recent
    };

    format!(
        r#"You are an expert Brazilian Jiu-Jitsu coach.

My Profile:
- Belt: {belt}
- Academy: {academy}

My Recent Trainings:
{recent}

Based on this history and my belt level, suggest a specific training focus for my next session.
If I haven't trained recently, motivate me.
If I've been training a lot of one thing (e.g. Gi), maybe suggest No-Gi or specific complementary techniques.

Format the response strictly as JSON with the following structure:
{{
    "focus": "Short title of the focus area (e.g. 'Guard Retention')",
    "reasoning": "One or two sentences explaining why this is good for me now.",
    "suggestedTechniques": ["Technique 1", "Technique 2", "Technique 3"]
}}"#
    )
}

/// Strips markdown fences and parses the suggestion object.
pub fn parse_suggestion(text: &str) -> Result<AiSuggestion, SuggestionError> {
    let json = text.replace("```json", "").replace("```", "");
    serde_json::from_str(json.trim())
        .map_err(|e| SuggestionError::InvalidResponse(e.to_string()))
}

#[async_trait]
pub trait SuggestionProvider: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, SuggestionError>;
}

/// Single request, no retry.
#[instrument(skip_all, fields(trainings = trainings.len(), belt = %belt))]
pub async fn get_training_suggestion(
    provider: &dyn SuggestionProvider,
    trainings: &[Training],
    belt: &str,
    academy: &str,
) -> Result<AiSuggestion, SuggestionError> {
    let prompt = build_prompt(trainings, belt, academy);
    let text = provider.generate(&prompt).await?;
    debug!(preview = %text.chars().take(200).collect::<String>(), "Model response");
    parse_suggestion(&text)
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<RequestContent<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestContent<'a> {
    parts: Vec<RequestPart<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    candidates: Option<Vec<Candidate>>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

pub struct GeminiClient {
    api_key: Option<String>,
    model: String,
    base_url: String,
    client: Client,
}

impl GeminiClient {
    pub fn new(api_key: Option<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.filter(|key| !key.is_empty() && !key.contains("placeholder")),
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            client: Client::new(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let client = Self::new(config.gemini_api_key.clone(), config.gemini_model.clone());
        match &config.gemini_base_url {
            Some(url) => client.with_base_url(url),
            None => client,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    fn map_api_error(status: u16, body: &str) -> SuggestionError {
        let message = serde_json::from_str::<GenerateResponse>(body)
            .ok()
            .and_then(|r| r.error)
            .map_or_else(|| body.to_string(), |e| e.message);

        match status {
            429 => SuggestionError::RateLimited(message),
            404 => SuggestionError::ModelNotFound(message),
            _ => SuggestionError::classify(&format!("{} {}", status, message)),
        }
    }
}

#[async_trait]
impl SuggestionProvider for GeminiClient {
    #[instrument(skip(self, prompt), fields(model = %self.model))]
    async fn generate(&self, prompt: &str) -> Result<String, SuggestionError> {
        let Some(api_key) = &self.api_key else {
            return Err(SuggestionError::Configuration(
                "Gemini API key not configured".to_string(),
            ));
        };

        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let request = GenerateRequest {
            contents: vec![RequestContent {
                parts: vec![RequestPart { text: prompt }],
            }],
        };

        info!("Requesting training suggestion");
        let response = self
            .client
            .post(&url)
            .query(&[("key", api_key.as_str())])
            .json(&request)
            .send()
            .await
            .map_err(|e| SuggestionError::classify(&e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SuggestionError::Failed(format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            error!(status = %status, "Gemini API error");
            return Err(Self::map_api_error(status.as_u16(), &body));
        }

        let parsed: GenerateResponse = serde_json::from_str(&body)
            .map_err(|e| SuggestionError::InvalidResponse(e.to_string()))?;

        if let Some(err) = parsed.error {
            return Err(SuggestionError::classify(&err.message));
        }

        parsed
            .candidates
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.content)
            .and_then(|c| c.parts.into_iter().find_map(|p| p.text))
            .ok_or_else(|| SuggestionError::InvalidResponse("No content in response".to_string()))
    }
}
