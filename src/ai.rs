//! Filename synthesis: asks the language model to derive a canonical name
//! from the OCR text, then validates the reply before it can touch the
//! filesystem.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequest,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::error::TaskError;
use crate::pipeline::{ExtractedText, NameSynthesizer, NamingResult};
use crate::ratelimit::RateGate;
use crate::retry::{with_retries, RetryPolicy};

const MODEL: &str = "gpt-4o";
const MAX_COMPLETION_TOKENS: u32 = 100;
const TEMPERATURE: f32 = 0.3;
const MAX_CANDIDATE_LEN: usize = 200;

/// Characters the filesystem (or Windows) reserves; a candidate containing
/// any of them never reaches the rename stage.
pub(crate) const RESERVED_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

#[derive(Debug)]
enum LlmCallError {
    Timeout,
    Empty,
    Api(OpenAIError),
}

impl fmt::Display for LlmCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "request timed out"),
            Self::Empty => write!(f, "response carried no content"),
            Self::Api(err) => write!(f, "{err}"),
        }
    }
}

fn is_transient(err: &LlmCallError) -> bool {
    match err {
        LlmCallError::Timeout | LlmCallError::Empty => true,
        LlmCallError::Api(OpenAIError::Reqwest(err)) => err.is_timeout() || err.is_connect(),
        LlmCallError::Api(OpenAIError::ApiError(api)) => {
            let kind = api.r#type.as_deref().unwrap_or("");
            kind == "server_error"
                || kind == "rate_limit_exceeded"
                || api.message.to_lowercase().contains("rate limit")
                || api.message.to_lowercase().contains("overloaded")
        }
        LlmCallError::Api(_) => false,
    }
}

/// OpenAI-backed synthesizer. One chat completion per video: the fixed
/// instruction template as the system message, the aggregated OCR text as
/// the user message.
pub struct OpenAiSynthesizer {
    client: Client<OpenAIConfig>,
    instruction_template: String,
    gate: Arc<RateGate>,
    retry: RetryPolicy,
    request_timeout: Duration,
}

impl OpenAiSynthesizer {
    pub fn new(
        api_key: &str,
        instruction_template: String,
        gate: Arc<RateGate>,
        retry: RetryPolicy,
        request_timeout: Duration,
    ) -> Self {
        Self {
            client: Client::with_config(OpenAIConfig::new().with_api_key(api_key)),
            instruction_template,
            gate,
            retry,
            request_timeout,
        }
    }

    fn build_request(&self, ocr_text: &str) -> Result<CreateChatCompletionRequest, OpenAIError> {
        CreateChatCompletionRequestArgs::default()
            .model(MODEL)
            .temperature(TEMPERATURE)
            .max_tokens(MAX_COMPLETION_TOKENS)
            .messages([
                ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(self.instruction_template.as_str())
                        .build()?,
                ),
                ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(ocr_text)
                        .build()?,
                ),
            ])
            .build()
    }
}

#[async_trait]
impl NameSynthesizer for OpenAiSynthesizer {
    async fn synthesize(&self, extracted: &ExtractedText) -> Result<NamingResult, TaskError> {
        let request = self
            .build_request(&extracted.joined())
            .map_err(|err| TaskError::LlmService(err.to_string()))?;

        let raw = with_retries(self.retry, "synthesis request", is_transient, || {
            let request = request.clone();
            async move {
                self.gate.acquire().await;
                let response =
                    tokio::time::timeout(self.request_timeout, self.client.chat().create(request))
                        .await
                        .map_err(|_| LlmCallError::Timeout)?
                        .map_err(LlmCallError::Api)?;
                response
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|choice| choice.message.content)
                    .ok_or(LlmCallError::Empty)
            }
        })
        .await
        .map_err(|err| match err {
            LlmCallError::Empty => TaskError::UnparseableResponse(err.to_string()),
            other => TaskError::LlmService(other.to_string()),
        })?;

        let candidate = parse_candidate(&raw)?;
        Ok(NamingResult {
            candidate,
            raw_response: raw,
        })
    }
}

/// Strict validating transform from free model text to a filename
/// candidate: trim, strip one matching layer of surrounding quotes, then
/// reject anything the filesystem would choke on.
pub(crate) fn parse_candidate(raw: &str) -> Result<String, TaskError> {
    let mut candidate = raw.trim();
    for quote in ['"', '\'', '`'] {
        if candidate.len() >= 2 && candidate.starts_with(quote) && candidate.ends_with(quote) {
            candidate = candidate[1..candidate.len() - 1].trim();
            break;
        }
    }

    let reject = |reason: &str| {
        Err(TaskError::UnparseableResponse(format!(
            "{reason}: {raw:?}"
        )))
    };
    if candidate.is_empty() {
        return reject("empty candidate");
    }
    if candidate.contains('\n') {
        return reject("candidate spans multiple lines");
    }
    if candidate.chars().any(|c| RESERVED_CHARS.contains(&c)) {
        return reject("candidate contains a reserved character");
    }
    if candidate.chars().any(char::is_control) {
        return reject("candidate contains a control character");
    }
    if candidate == "." || candidate == ".." {
        return reject("candidate is a relative path component");
    }
    if candidate.len() > MAX_CANDIDATE_LEN {
        return reject("candidate is too long");
    }
    Ok(candidate.to_string())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn strips_whitespace_and_quotes() {
        assert_eq!(
            parse_candidate("  \"101동 101호 급수\"  ").unwrap(),
            "101동 101호 급수"
        );
        assert_eq!(parse_candidate("`BLDG 3 DRAIN`").unwrap(), "BLDG 3 DRAIN");
        assert_eq!(parse_candidate("'unit 5'").unwrap(), "unit 5");
    }

    #[test]
    fn keeps_interior_quotes() {
        assert_eq!(parse_candidate("it's fine").unwrap(), "it's fine");
    }

    #[test]
    fn rejects_path_separators() {
        assert!(parse_candidate("a/b").is_err());
        assert!(parse_candidate("a\\b").is_err());
        assert!(parse_candidate("../escape").is_err());
    }

    #[test]
    fn rejects_reserved_characters() {
        for raw in ["what?", "a:b", "x*y", "<tag>", "pipe|name", "say \" this"] {
            assert!(
                matches!(
                    parse_candidate(raw),
                    Err(TaskError::UnparseableResponse(_))
                ),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_empty_and_quote_only_responses() {
        assert!(parse_candidate("").is_err());
        assert!(parse_candidate("   ").is_err());
        assert!(parse_candidate("\"\"").is_err());
    }

    #[test]
    fn rejects_multiline_responses() {
        assert!(parse_candidate("first line\nsecond line").is_err());
    }

    #[test]
    fn rejects_dot_components_and_control_chars() {
        assert!(parse_candidate(".").is_err());
        assert!(parse_candidate("..").is_err());
        assert!(parse_candidate("tab\there").is_err());
    }

    #[test]
    fn rejects_overlong_candidates() {
        let raw = "x".repeat(MAX_CANDIDATE_LEN + 1);
        assert!(parse_candidate(&raw).is_err());
    }
}
