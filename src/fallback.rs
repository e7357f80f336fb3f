//! Request/response fallback conversation
//!
//! Used when a live session cannot be established or sustained. Each turn is
//! one `generateContent` call carrying the same grounding instruction as the
//! live handshake, plus the conversation so far.

use serde::{Deserialize, Serialize};

use crate::config::FallbackConfig;
use crate::session::SessionContext;
use crate::{Error, Result};

/// Speaker of a fallback turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// One completed turn of the fallback conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    #[must_use]
    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            text: text.into(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    system_instruction: Instruction<'a>,
    contents: Vec<RequestContent<'a>>,
}

#[derive(Debug, Serialize)]
struct Instruction<'a> {
    parts: [RequestPart<'a>; 1],
}

#[derive(Debug, Serialize)]
struct RequestContent<'a> {
    role: Role,
    parts: [RequestPart<'a>; 1],
}

#[derive(Debug, Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<ResponseContent>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

/// Non-streaming conversation client
#[derive(Debug)]
pub struct FallbackClient {
    client: reqwest::Client,
    config: FallbackConfig,
    instruction: String,
}

impl FallbackClient {
    /// Create a client grounded in `context`
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if no API key is configured, or an HTTP error
    /// if the client cannot be built
    pub fn new(config: FallbackConfig, context: &SessionContext) -> Result<Self> {
        if config.api_key.as_deref().is_none_or(|k| k.trim().is_empty()) {
            return Err(Error::Config("fallback API key not set".to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            config,
            instruction: context.system_instruction(),
        })
    }

    /// Ask for the next model turn
    ///
    /// # Errors
    ///
    /// Returns error if the request fails, the backend rejects it, or the
    /// response carries no text
    pub async fn reply(&self, history: &[Turn], user_text: &str) -> Result<String> {
        let url = format!(
            "{}/{}:generateContent",
            self.config.rest_base.trim_end_matches('/'),
            self.config.model
        );
        let body = build_request(&self.instruction, history, user_text);

        tracing::debug!(
            url = %url,
            turns = history.len(),
            "sending fallback request"
        );

        let response = self
            .client
            .post(&url)
            .query(&[("key", self.config.api_key.as_deref().unwrap_or_default())])
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Fallback(format!("request failed: {status} - {body}")));
        }

        let parsed: GenerateResponse = response.json().await?;
        let text = response_text(parsed)
            .ok_or_else(|| Error::Fallback("response carried no text".to_string()))?;

        tracing::debug!(chars = text.len(), "fallback reply received");
        Ok(text)
    }
}

fn build_request<'a>(
    instruction: &'a str,
    history: &'a [Turn],
    user_text: &'a str,
) -> GenerateRequest<'a> {
    let mut contents: Vec<RequestContent<'a>> = history
        .iter()
        .map(|turn| RequestContent {
            role: turn.role,
            parts: [RequestPart { text: &turn.text }],
        })
        .collect();
    contents.push(RequestContent {
        role: Role::User,
        parts: [RequestPart { text: user_text }],
    });

    GenerateRequest {
        system_instruction: Instruction {
            parts: [RequestPart { text: instruction }],
        },
        contents,
    }
}

fn response_text(response: GenerateResponse) -> Option<String> {
    let text: String = response
        .candidates
        .into_iter()
        .next()?
        .content?
        .parts
        .into_iter()
        .filter_map(|part| part.text)
        .collect();

    (!text.trim().is_empty()).then_some(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        let history = vec![Turn::user("Hello"), Turn::model("Hi Joe")];
        let body = build_request("be kind", &history, "Who is Anna?");
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "be kind");
        assert_eq!(json["contents"].as_array().unwrap().len(), 3);
        assert_eq!(json["contents"][1]["role"], "model");
        assert_eq!(json["contents"][2]["role"], "user");
        assert_eq!(json["contents"][2]["parts"][0]["text"], "Who is Anna?");
    }

    #[test]
    fn test_response_text_concatenates_parts() {
        let json = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Anna is "},{"text":"your wife."}]}}]}"#;
        let parsed: GenerateResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response_text(parsed).as_deref(), Some("Anna is your wife."));
    }

    #[test]
    fn test_response_without_text() {
        let parsed: GenerateResponse = serde_json::from_str(r#"{"candidates":[]}"#).unwrap();
        assert!(response_text(parsed).is_none());

        let parsed: GenerateResponse =
            serde_json::from_str(r#"{"candidates":[{"finishReason":"SAFETY"}]}"#).unwrap();
        assert!(response_text(parsed).is_none());
    }

    #[test]
    fn test_missing_key_rejected() {
        let result = FallbackClient::new(FallbackConfig::default(), &SessionContext::default());
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
