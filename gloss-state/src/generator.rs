//! The downstream explanation generator: costly, possibly failing, and
//! hidden behind a trait so the metering core never touches the vendor.

use axum::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::StateError;

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

const SYSTEM_PROMPT: &str = r#"You are a mathematics professor who excels at making complex concepts accessible to students.

Provide a pedagogically-sound explanation using this structure:

**What it means:**
One clear, jargon-free sentence explaining what this does conceptually.

**Breaking it down:**
List each symbol/component with its meaning (1 line each).

**Why it matters:**
The key insight or intuition that makes it click (1-2 sentences).

**Example:**
A concrete, fully worked example with actual numbers.

FORMATTING RULES:
- ONLY use inline LaTeX with \( ... \) - never display math delimiters
- Keep LaTeX expressions simple; break complex formulas into smaller inline pieces
- Aim for 100-250 words and always complete your sentences
- Use plain English between math expressions and focus on conceptual understanding"#;

/// A generated explanation, also the cached value type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Explanation {
    pub symbol: String,
    pub explanation: String,
    pub category: String,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait ExplanationGenerator: Send + Sync {
    async fn generate(
        &self,
        symbol: &str,
        context: Option<&str>,
    ) -> Result<Explanation, StateError>;
}

/// Rough notation class for a symbol, used to label responses.
pub fn infer_category(symbol: &str) -> &'static str {
    if symbol
        .chars()
        .any(|c| ('α'..='ω').contains(&c) || ('Α'..='Ω').contains(&c))
    {
        "Greek Letter"
    } else if symbol.chars().any(|c| matches!(c, '∫' | '∂' | '∇' | '∮')) {
        "Calculus"
    } else if symbol
        .chars()
        .any(|c| matches!(c, '∈' | '∉' | '⊂' | '⊆' | '∪' | '∩'))
    {
        "Set Theory"
    } else {
        "Mathematics"
    }
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

pub struct OpenAiGenerator {
    client: reqwest::Client,
    api_key: String,
    model: String,
    api_base: String,
}

impl OpenAiGenerator {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            api_base: OPENAI_API_BASE.to_string(),
        }
    }
}

#[async_trait]
impl ExplanationGenerator for OpenAiGenerator {
    async fn generate(
        &self,
        symbol: &str,
        context: Option<&str>,
    ) -> Result<Explanation, StateError> {
        let user_content = match context {
            Some(context) => format!("Explain \"{}\" in context: \"{}\"", symbol, context),
            None => format!("Explain the mathematical content: \"{}\"", symbol),
        };

        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: user_content,
                },
            ],
            max_tokens: 800,
            temperature: 0.3,
        };

        let response: ChatResponse = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| StateError::Upstream(e.to_string()))?
            .error_for_status()
            .map_err(|e| StateError::Upstream(e.to_string()))?
            .json()
            .await
            .map_err(|e| StateError::Upstream(e.to_string()))?;

        let explanation = response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.trim().to_string())
            .ok_or_else(|| StateError::Upstream("generator returned no choices".to_string()))?;

        Ok(Explanation {
            symbol: symbol.to_string(),
            explanation,
            category: infer_category(symbol).to_string(),
            timestamp: Utc::now(),
        })
    }
}
