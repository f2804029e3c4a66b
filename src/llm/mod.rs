//! LLM provider contracts and the chat-completion client used by the
//! orchestrator. Providers are registered statically at startup.

use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::{Duration, Instant};

use crate::config::LlmConfig;
use crate::retrieval::ScoredDocument;
use crate::shared::error::{AppError, AppResult};
use crate::shared::models::MessageLog;

const MAX_RETRIES: u32 = 2;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(1_500);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub turns: Vec<ChatTurn>,
    pub max_tokens: Option<u32>,
    pub deadline: Duration,
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub provider: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub latency_ms: u64,
}

impl CompletionResponse {
    /// Metadata block persisted on the outbound message log.
    pub fn metadata(&self) -> serde_json::Value {
        json!({
            "provider": self.provider,
            "model": self.model,
            "prompt_tokens": self.prompt_tokens,
            "completion_tokens": self.completion_tokens,
            "latency_ms": self.latency_ms,
        })
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn health_check(&self) -> bool;
    async fn generate(&self, request: &CompletionRequest) -> AppResult<CompletionResponse>;
}

/// OpenAI-compatible chat completion client with a per-request deadline,
/// bounded retries on 429/5xx, and a fallback model.
pub struct ChatLlmClient {
    http: reqwest::Client,
    config: LlmConfig,
}

impl ChatLlmClient {
    pub fn new(http: reqwest::Client, config: LlmConfig) -> Self {
        Self { http, config }
    }

    async fn call_model(
        &self,
        model: &str,
        request: &CompletionRequest,
        deadline: Instant,
    ) -> AppResult<CompletionResponse> {
        let mut messages = vec![json!({"role": "system", "content": request.system})];
        for turn in &request.turns {
            messages.push(json!({"role": turn.role, "content": turn.content}));
        }
        let mut body = json!({
            "model": model,
            "messages": messages,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }

        let mut attempt = 0u32;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(AppError::Transient("llm deadline exceeded".into()));
            }

            let started = Instant::now();
            let url = format!(
                "{}/chat/completions",
                self.config.provider_url.trim_end_matches('/')
            );
            let mut builder = self.http.post(&url).timeout(remaining).json(&body);
            if !self.config.api_key.is_empty() {
                builder = builder.bearer_auth(&self.config.api_key);
            }

            let outcome = builder.send().await;
            match outcome {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let parsed: ChatCompletionResponse = response.json().await.map_err(|e| {
                            AppError::Transient(format!("llm response unreadable: {}", e))
                        })?;
                        let content = parsed
                            .choices
                            .into_iter()
                            .next()
                            .map(|c| c.message.content)
                            .unwrap_or_default();
                        let usage = parsed.usage.unwrap_or_default();
                        return Ok(CompletionResponse {
                            content,
                            provider: self.name().to_string(),
                            model: model.to_string(),
                            prompt_tokens: usage.prompt_tokens,
                            completion_tokens: usage.completion_tokens,
                            latency_ms: started.elapsed().as_millis() as u64,
                        });
                    }

                    let retryable = status.as_u16() == 429 || status.is_server_error();
                    if !retryable || attempt >= MAX_RETRIES {
                        let message = format!("llm returned {}", status);
                        return Err(if retryable {
                            AppError::Transient(message)
                        } else {
                            AppError::Permanent(message)
                        });
                    }
                }
                Err(e) => {
                    if attempt >= MAX_RETRIES {
                        return Err(AppError::Transient(format!("llm request failed: {}", e)));
                    }
                }
            }

            attempt += 1;
            let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
            warn!(
                "llm call to {} failed, retrying in {:?} (attempt {}/{})",
                model, delay, attempt, MAX_RETRIES
            );
            tokio::time::sleep(delay.min(deadline.saturating_duration_since(Instant::now()))).await;
        }
    }
}

#[async_trait]
impl LlmProvider for ChatLlmClient {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/models", self.config.provider_url.trim_end_matches('/'));
        let mut builder = self.http.get(&url).timeout(Duration::from_secs(5));
        if !self.config.api_key.is_empty() {
            builder = builder.bearer_auth(&self.config.api_key);
        }
        matches!(builder.send().await, Ok(r) if r.status().is_success())
    }

    async fn generate(&self, request: &CompletionRequest) -> AppResult<CompletionResponse> {
        let deadline = Instant::now() + request.deadline;
        match self.call_model(&self.config.model, request, deadline).await {
            Ok(response) => Ok(response),
            Err(primary_err) if primary_err.is_retryable() => {
                let Some(ref fallback) = self.config.fallback_model else {
                    return Err(primary_err);
                };
                info!(
                    "primary model {} exhausted ({}), trying fallback {}",
                    self.config.model, primary_err, fallback
                );
                self.call_model(fallback, request, deadline).await
            }
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Debug, Default, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Assemble the grounded prompt: persona directive, numbered context
/// snippets, the last N transcript turns, then the current user message.
pub fn assemble_prompt(
    persona: &str,
    context: &[ScoredDocument],
    history: &[MessageLog],
    history_turns: usize,
    user_message: &str,
    deadline: Duration,
) -> CompletionRequest {
    let mut system = persona.trim().to_string();
    if !context.is_empty() {
        system.push_str("\n\nRelevant knowledge:\n");
        for (i, doc) in context.iter().enumerate() {
            system.push_str(&format!("[{}] {}\n", i + 1, doc.text.trim()));
        }
        system.push_str("\nGround your answer in the numbered snippets when they apply.");
    }

    let start = history.len().saturating_sub(history_turns);
    let mut turns: Vec<ChatTurn> = history[start..]
        .iter()
        .map(|log| ChatTurn {
            role: if log.direction == "in" {
                "user".to_string()
            } else {
                "assistant".to_string()
            },
            content: log.content.clone(),
        })
        .collect();
    turns.push(ChatTurn {
        role: "user".to_string(),
        content: user_message.to_string(),
    });

    CompletionRequest {
        system,
        turns,
        max_tokens: None,
        deadline,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn log_entry(direction: &str, content: &str) -> MessageLog {
        MessageLog {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            direction: direction.to_string(),
            content: content.to_string(),
            metadata: serde_json::json!({}),
            correlation_id: "test".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn prompt_numbers_context_snippets() {
        let context = vec![
            ScoredDocument {
                id: "1".into(),
                text: "Hold the button for 5 seconds.".into(),
                dense_score: 0.9,
                lexical_score: 0.5,
                final_score: 0.8,
                payload: serde_json::json!({}),
            },
            ScoredDocument {
                id: "2".into(),
                text: "Warranty lasts two years.".into(),
                dense_score: 0.5,
                lexical_score: 0.2,
                final_score: 0.4,
                payload: serde_json::json!({}),
            },
        ];
        let request = assemble_prompt(
            "You are a support agent.",
            &context,
            &[],
            6,
            "how do I reset?",
            Duration::from_secs(30),
        );
        assert!(request.system.contains("[1] Hold the button"));
        assert!(request.system.contains("[2] Warranty"));
        assert_eq!(request.turns.last().unwrap().content, "how do I reset?");
    }

    #[test]
    fn history_window_keeps_last_n_turns() {
        let history: Vec<MessageLog> = (0..10)
            .map(|i| log_entry(if i % 2 == 0 { "in" } else { "out" }, &format!("m{}", i)))
            .collect();
        let request = assemble_prompt(
            "persona",
            &[],
            &history,
            4,
            "latest",
            Duration::from_secs(30),
        );
        // 4 history turns plus the current user message.
        assert_eq!(request.turns.len(), 5);
        assert_eq!(request.turns[0].content, "m6");
        assert_eq!(request.turns[0].role, "user");
        assert_eq!(request.turns[1].role, "assistant");
    }

    #[test]
    fn empty_context_omits_knowledge_block() {
        let request = assemble_prompt(
            "persona",
            &[],
            &[],
            6,
            "hello",
            Duration::from_secs(30),
        );
        assert!(!request.system.contains("Relevant knowledge"));
    }
}
