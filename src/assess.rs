//! Assessment engine — one LLM call that classifies a task.
//!
//! A fixed model at temperature 0 turns {title, description, parent
//! context} into {complexity, recommended model, optional decomposition,
//! optional reviewer comment}. Parse failures are errors — retry policy
//! belongs to the scheduler, not here.

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::time::{timeout, Duration};

/// Per-call deadline for the assessment service.
const ASSESS_TIMEOUT: Duration = Duration::from_secs(60);

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

/// What the engine is asked about.
#[derive(Debug, Clone)]
pub struct AssessmentInput {
    pub title: String,
    pub description: String,
    /// Title of the parent task, when assessing a subtask.
    pub parent_title: Option<String>,
}

/// Parsed assessment response.
#[derive(Debug, Clone, Deserialize)]
pub struct Assessment {
    pub complexity: String,
    pub recommended_model: String,
    #[serde(default)]
    pub should_decompose: bool,
    #[serde(default)]
    pub subtasks: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Classification seam — tests substitute a scripted fake.
#[async_trait]
pub trait Assessor: Send + Sync {
    async fn assess(&self, input: &AssessmentInput) -> anyhow::Result<Assessment>;
}

/// Real assessor backed by the Anthropic Messages API.
pub struct AnthropicAssessor {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl AnthropicAssessor {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
        }
    }
}

#[async_trait]
impl Assessor for AnthropicAssessor {
    async fn assess(&self, input: &AssessmentInput) -> anyhow::Result<Assessment> {
        if self.api_key.is_empty() {
            anyhow::bail!("assessment API key not configured");
        }

        let body = json!({
            "model": self.model,
            "max_tokens": 2000,
            "temperature": 0.0,
            "messages": [{"role": "user", "content": build_prompt(input)}],
        });

        let response = timeout(
            ASSESS_TIMEOUT,
            self.client
                .post(API_URL)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", API_VERSION)
                .json(&body)
                .send(),
        )
        .await
        .context("assessment call timed out")?
        .context("assessment request failed")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("assessment API returned {status}: {text}");
        }

        let envelope: serde_json::Value = response.json().await?;
        let text = envelope["content"][0]["text"]
            .as_str()
            .context("assessment response has no text content")?;

        parse_assessment(text)
    }
}

fn build_prompt(input: &AssessmentInput) -> String {
    let parent = input
        .parent_title
        .as_deref()
        .map(|t| format!("\nThis is a subtask of: {t}\n"))
        .unwrap_or_default();

    format!(
        r#"Analyze this coding task and provide an assessment.

Task Title: {title}
{parent}
Task Description:
{description}

Respond with a JSON object containing:
1. complexity: "simple", "medium", or "complex"
2. recommended_model: "haiku" (simple tasks), "sonnet" (most tasks), or "opus" (complex tasks)
3. should_decompose: boolean - whether this should be broken into subtasks
4. subtasks: array of strings - if decomposition recommended, list subtask titles
5. reasoning: string explaining your assessment
6. comment: optional string - only if you have concrete advice for whoever executes this

Consider:
- Well-specified tasks are simpler than vague ones
- Multi-file changes with testing are usually "medium"
- Architecture changes or new systems are usually "complex"
- Recommend decomposition ONLY for clearly independent multi-session work

Respond ONLY with valid JSON, no additional text:"#,
        title = input.title,
        parent = parent,
        description = input.description,
    )
}

/// Parse the model's response text. Tolerates a markdown code fence; any
/// other deviation from the schema is an error.
pub fn parse_assessment(text: &str) -> anyhow::Result<Assessment> {
    let trimmed = strip_code_fence(text.trim());
    serde_json::from_str(trimmed).context("assessment response is not valid JSON")
}

fn strip_code_fence(text: &str) -> &str {
    let text = text
        .strip_prefix("```json")
        .or_else(|| text.strip_prefix("```"))
        .unwrap_or(text);
    text.strip_suffix("```").unwrap_or(text).trim()
}
