//! Plan and test generation boundary.
//!
//! The orchestrator treats generation as an external service: given the
//! feature and suggestion context it receives back a plan document and a set
//! of failing-first test files. The production implementation talks to an
//! OpenAI-style chat completions endpoint in JSON mode; tests plug in their
//! own implementation of the trait. Generation failures are never retried,
//! they fail the run where they happen.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::config::Settings;
use crate::models::{FeatureDescriptor, SuggestionDescriptor, TestFile};

/// Output of the test-generation phase.
#[derive(Debug, Clone)]
pub struct GeneratedTests {
    pub test_files: Vec<TestFile>,
    pub self_review: Option<String>,
}

#[async_trait]
pub trait PlanGenerator: Send + Sync {
    /// Produce the implementation plan document (markdown).
    async fn generate_plan(
        &self,
        feature: &FeatureDescriptor,
        suggestion: &SuggestionDescriptor,
    ) -> Result<String>;

    /// Produce test files for the plan, plus an optional self-review note
    /// about their coverage.
    async fn generate_tests(
        &self,
        feature: &FeatureDescriptor,
        suggestion: &SuggestionDescriptor,
        plan_text: &str,
    ) -> Result<GeneratedTests>;
}

pub struct OpenAiGenerator {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct PlanPayload {
    plan: String,
}

#[derive(Debug, Deserialize)]
struct TestsPayload {
    #[serde(default)]
    test_files: Vec<TestFile>,
    #[serde(default)]
    self_review: Option<String>,
}

impl OpenAiGenerator {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let api_key = settings
            .llm_api_key
            .clone()
            .ok_or_else(|| anyhow!("OPENAI_API_KEY is not set"))?;
        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model: settings.llm_model.clone(),
            base_url: settings.llm_base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "response_format": { "type": "json_object" },
                "messages": [
                    { "role": "system", "content": system },
                    { "role": "user", "content": user },
                ],
            }))
            .send()
            .await
            .context("Chat completion request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("chat completion returned {}: {}", status, body);
        }
        let parsed: ChatResponse = response
            .json()
            .await
            .context("Failed to decode chat completion response")?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow!("chat completion returned no choices"))
    }
}

#[async_trait]
impl PlanGenerator for OpenAiGenerator {
    async fn generate_plan(
        &self,
        feature: &FeatureDescriptor,
        suggestion: &SuggestionDescriptor,
    ) -> Result<String> {
        let content = self
            .chat(
                "You are a senior engineer writing a concise implementation plan \
                 for a coding agent. Respond with a JSON object: \
                 {\"plan\": \"<markdown plan document>\"}. The plan starts with a \
                 one-line title heading, then numbered implementation steps.",
                &plan_request(feature, suggestion),
            )
            .await?;
        let payload: PlanPayload =
            serde_json::from_str(&content).context("Generator returned malformed plan JSON")?;
        if payload.plan.trim().is_empty() {
            anyhow::bail!("generator returned an empty plan");
        }
        Ok(payload.plan)
    }

    async fn generate_tests(
        &self,
        feature: &FeatureDescriptor,
        suggestion: &SuggestionDescriptor,
        plan_text: &str,
    ) -> Result<GeneratedTests> {
        let content = self
            .chat(
                "You write automated tests for a plan that has not been implemented \
                 yet; the tests should fail until the implementation lands. Respond \
                 with a JSON object: {\"test_files\": [{\"path\": \"<relative path>\", \
                 \"content\": \"<file content>\"}], \"self_review\": \"<one-paragraph \
                 note on what the tests do and do not cover>\"}.",
                &tests_request(feature, suggestion, plan_text),
            )
            .await?;
        let payload: TestsPayload =
            serde_json::from_str(&content).context("Generator returned malformed tests JSON")?;
        Ok(GeneratedTests {
            test_files: payload.test_files,
            self_review: payload.self_review,
        })
    }
}

fn plan_request(feature: &FeatureDescriptor, suggestion: &SuggestionDescriptor) -> String {
    format!(
        "Feature: {}\n{}\n\nApproved suggestion: {}\nRationale: {}\nComplexity: {}\n\
         \nWrite the implementation plan for this suggestion.",
        feature.name, feature.description, suggestion.name, suggestion.rationale,
        suggestion.complexity,
    )
}

fn tests_request(
    feature: &FeatureDescriptor,
    suggestion: &SuggestionDescriptor,
    plan_text: &str,
) -> String {
    let cases = if suggestion.test_cases.is_empty() {
        String::from("(none provided; derive cases from the plan)")
    } else {
        suggestion
            .test_cases
            .iter()
            .map(|c| format!("- {}", c))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        "Feature: {}\nSuggestion: {}\n\nPlan:\n{}\n\nRequested test cases:\n{}",
        feature.name, suggestion.name, plan_text, cases,
    )
}
