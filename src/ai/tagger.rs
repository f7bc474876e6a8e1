use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

const CLAUDE_API_URL: &str = "https://api.anthropic.com/v1/messages";
const CLAUDE_MODEL: &str = "claude-3-5-haiku-20241022";
const MAX_INPUT_CHARS: usize = 10_000;
const MAX_TAGS: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TagSuggestion {
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// Optional tagging/summary collaborator called once per extraction.
#[async_trait]
pub trait ArticleTagger: Send + Sync {
    async fn suggest(&self, title: &str, text: &str) -> Result<TagSuggestion>;
}

#[derive(Debug, Serialize)]
struct MessageRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<Message>,
    system: Option<String>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    text: Option<String>,
}

pub struct ClaudeTagger {
    client: Client,
    api_key: String,
}

impl ClaudeTagger {
    pub fn new(api_key: String) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(Self { client, api_key })
    }
}

#[async_trait]
impl ArticleTagger for ClaudeTagger {
    async fn suggest(&self, title: &str, text: &str) -> Result<TagSuggestion> {
        let system_prompt = r#"You label saved web articles.
Reply with a single JSON object and nothing else:
{"tags": ["up to five short lowercase topic tags"], "summary": "two or three sentences"}"#;

        let content = match text.char_indices().nth(MAX_INPUT_CHARS) {
            Some((idx, _)) => &text[..idx],
            None => text,
        };

        let request = MessageRequest {
            model: CLAUDE_MODEL.to_string(),
            max_tokens: 512,
            messages: vec![Message {
                role: "user".to_string(),
                content: format!("Title: {title}\n\nContent:\n{content}"),
            }],
            system: Some(system_prompt.to_string()),
        };

        let response = self
            .client
            .post(CLAUDE_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(AppError::ClaudeApi(format!("API error: {}", error_text)));
        }

        let message_response: MessageResponse = response.json().await?;
        let reply = message_response
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("\n");

        parse_suggestion(&reply)
    }
}

/// Pull the JSON object out of a model reply, tolerating prose or code
/// fences around it.
fn parse_suggestion(reply: &str) -> Result<TagSuggestion> {
    let start = reply.find('{');
    let end = reply.rfind('}');
    let json = match (start, end) {
        (Some(start), Some(end)) if start < end => &reply[start..=end],
        _ => {
            return Err(AppError::ClaudeApi(format!(
                "reply did not contain a JSON object: {reply}"
            )))
        }
    };
    let mut suggestion: TagSuggestion = serde_json::from_str(json)?;
    suggestion.tags.truncate(MAX_TAGS);
    suggestion.summary = suggestion
        .summary
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    Ok(suggestion)
}
