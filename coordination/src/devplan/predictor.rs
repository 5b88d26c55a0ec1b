//! File-scope prediction (§4.2): for each task, ask an LLM for a JSON array
//! of path patterns it is likely to touch. A parse failure yields `vec![]`
//! (no predicted locks — the task runs freely).

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

#[async_trait]
pub trait FileScopePredictor: Send + Sync {
    async fn predict(&self, task_text: &str, tree: &str) -> Vec<String>;
}

/// Always predicts an empty scope. Used for devplans ingested without file
/// scope prediction configured, and by tests.
pub struct NullPredictor;

#[async_trait]
impl FileScopePredictor for NullPredictor {
    async fn predict(&self, _task_text: &str, _tree: &str) -> Vec<String> {
        Vec::new()
    }
}

/// Predicts file scope via an OpenAI-chat-completions-shaped endpoint.
pub struct LlmPredictor {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl LlmPredictor {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    fn prompt(task_text: &str, tree: &str) -> String {
        format!(
            "Given this project file tree:\n\n{tree}\n\n\
             Predict which file paths the following task is likely to touch. \
             Respond with ONLY a JSON array of path patterns (globs allowed), \
             nothing else.\n\nTask: {task_text}"
        )
    }
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

/// Extract the first JSON array of strings found in `text`, tolerating
/// surrounding prose or a fenced code block.
fn extract_string_array(text: &str) -> Option<Vec<String>> {
    let trimmed = text.trim();
    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(trimmed) {
        return Some(
            items
                .into_iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect(),
        );
    }
    let start = trimmed.find('[')?;
    let end = trimmed.rfind(']')?;
    if end <= start {
        return None;
    }
    let slice = &trimmed[start..=end];
    match serde_json::from_str::<Value>(slice) {
        Ok(Value::Array(items)) => Some(
            items
                .into_iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect(),
        ),
        _ => None,
    }
}

#[async_trait]
impl FileScopePredictor for LlmPredictor {
    async fn predict(&self, task_text: &str, tree: &str) -> Vec<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "user", "content": Self::prompt(task_text, tree)}
            ],
            "temperature": 0.0,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "file scope prediction request failed");
                return Vec::new();
            }
        };

        let parsed: Result<ChatResponse, _> = response.json().await;
        let Ok(parsed) = parsed else {
            warn!("file scope prediction response was not valid JSON");
            return Vec::new();
        };

        let Some(content) = parsed.choices.first().map(|c| c.message.content.clone()) else {
            return Vec::new();
        };

        extract_string_array(&content).unwrap_or_default()
    }
}
