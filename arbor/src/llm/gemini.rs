//! Gemini-backed decider: JSON-mode generateContent call over REST with one
//! strict retry when the text does not parse as an agent decision.

use std::time::Duration;

use serde_json::{json, Value};

use super::{parse_decision, DecideError, DecideResult, Decider, LlmUsage};

const GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const DEFAULT_MODEL: &str = "gemini-2.5-flash";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Decider backed by the Gemini generateContent API. Thinking is disabled and
/// `application/json` output is requested so the model emits the decision
/// envelope directly.
pub struct GeminiDecider {
    api_key: String,
    default_model: String,
    client: reqwest::blocking::Client,
}

impl GeminiDecider {
    /// Builds a decider from `GEMINI_API_KEY` / `GEMINI_MODEL`. A missing key
    /// is a configuration error, fatal to the request.
    pub fn from_env() -> Result<Self, DecideError> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| DecideError::NotConfigured("GEMINI_API_KEY not set".to_string()))?;
        let default_model =
            std::env::var("GEMINI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| DecideError::Request(e.to_string()))?;
        Ok(Self {
            api_key,
            default_model,
            client,
        })
    }

    /// The model this decider uses when the request carries none.
    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Plain-text completion (no JSON mode). Used by the connectivity probe
    /// endpoint, not by the engine.
    pub fn complete(&self, prompt: &str, model: Option<&str>) -> Result<String, DecideError> {
        let (text, _) = self.request(prompt, model, false)?;
        Ok(text)
    }

    fn call(&self, prompt: &str, model: Option<&str>) -> Result<(String, Value), DecideError> {
        self.request(prompt, model, true)
    }

    fn request(
        &self,
        prompt: &str,
        model: Option<&str>,
        json_mode: bool,
    ) -> Result<(String, Value), DecideError> {
        let model = model.unwrap_or(&self.default_model);
        let url = format!("{GEMINI_ENDPOINT}/{model}:generateContent");
        let mut generation_config = json!({
            "thinkingConfig": {"thinkingBudget": 0},
        });
        if json_mode {
            generation_config["responseMimeType"] = json!("application/json");
        }
        let body = json!({
            "contents": [{"parts": [{"text": prompt}]}],
            "generationConfig": generation_config,
        });
        let response = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .map_err(|e| DecideError::Request(e.to_string()))?;
        let status = response.status();
        let payload: Value = response
            .json()
            .map_err(|e| DecideError::Request(e.to_string()))?;
        if !status.is_success() {
            return Err(DecideError::Request(format!(
                "gemini returned {status}: {payload}"
            )));
        }
        let text = payload["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        Ok((text, payload))
    }
}

fn usage_from_payload(payload: &Value) -> Option<LlmUsage> {
    let meta = payload.get("usageMetadata")?;
    Some(LlmUsage {
        prompt_tokens: meta["promptTokenCount"].as_u64().unwrap_or(0),
        response_tokens: meta["candidatesTokenCount"].as_u64().unwrap_or(0),
        total_tokens: meta["totalTokenCount"].as_u64().unwrap_or(0),
    })
}

impl Decider for GeminiDecider {
    fn decide(&self, prompt: &str, model: Option<&str>) -> Result<DecideResult, DecideError> {
        let (text, payload) = self.call(prompt, model)?;
        let usage = usage_from_payload(&payload);

        match parse_decision(&text) {
            Ok(decision) => Ok(DecideResult {
                text,
                parsed: Some(decision),
                usage,
                usage_raw: payload.get("usageMetadata").cloned(),
                response_payload: Some(payload),
            }),
            Err(first_err) => {
                tracing::debug!("decision parse failed, retrying strict: {first_err}");
                let retry_prompt = format!(
                    "{prompt}\n\nIMPORTANT: Return only raw JSON (no markdown, no backticks), nothing else."
                );
                let (text2, payload2) = self.call(&retry_prompt, model)?;
                let usage2 = usage_from_payload(&payload2);
                let combined = match (usage, usage2) {
                    (Some(a), Some(b)) => Some(a.combined(&b)),
                    (a, b) => a.or(b),
                };
                let decision = parse_decision(&text2).map_err(DecideError::Parse)?;
                Ok(DecideResult {
                    text: text2,
                    parsed: Some(decision),
                    usage: combined,
                    usage_raw: payload2.get("usageMetadata").cloned(),
                    response_payload: Some(payload2),
                })
            }
        }
    }
}
