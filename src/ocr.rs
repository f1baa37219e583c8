//! Text extraction via the Google Vision `images:annotate` REST API.
//!
//! Authenticates with the service-account JWT-bearer grant; the access
//! token is cached until shortly before expiry.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::capture::SampledFrame;
use crate::credentials::ServiceAccountKey;
use crate::error::TaskError;
use crate::pipeline::{ExtractedText, TextExtractor, TextFragment};
use crate::ratelimit::RateGate;
use crate::retry::{with_retries, RetryPolicy};

const VISION_ENDPOINT: &str = "https://vision.googleapis.com/v1/images:annotate";
const OAUTH_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug)]
enum OcrCallError {
    Timeout,
    Transport(reqwest::Error),
    Status(StatusCode, String),
    Service { code: i64, message: String },
    Auth(String),
}

impl fmt::Display for OcrCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "request timed out"),
            Self::Transport(err) => write!(f, "transport error: {err}"),
            Self::Status(status, body) => write!(f, "HTTP {status}: {body}"),
            Self::Service { code, message } => write!(f, "service error {code}: {message}"),
            Self::Auth(message) => write!(f, "authentication failed: {message}"),
        }
    }
}

// gRPC codes DEADLINE_EXCEEDED (4), RESOURCE_EXHAUSTED (8) and
// UNAVAILABLE (14) come back inside an otherwise-successful annotate body.
fn is_transient(err: &OcrCallError) -> bool {
    match err {
        OcrCallError::Timeout => true,
        OcrCallError::Transport(err) => err.is_timeout() || err.is_connect(),
        OcrCallError::Status(status, _) => {
            status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
        }
        OcrCallError::Service { code, .. } => matches!(*code, 4 | 8 | 14),
        OcrCallError::Auth(_) => false,
    }
}

#[derive(Serialize)]
struct AnnotateRequest {
    requests: Vec<AnnotateImageRequest>,
}

#[derive(Serialize)]
struct AnnotateImageRequest {
    image: ImagePayload,
    features: Vec<Feature>,
}

#[derive(Serialize)]
struct ImagePayload {
    content: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Feature {
    r#type: &'static str,
    max_results: u32,
}

#[derive(Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<AnnotateImageResponse>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageResponse {
    #[serde(default)]
    text_annotations: Vec<TextAnnotation>,
    error: Option<RpcStatus>,
}

#[derive(Deserialize)]
struct TextAnnotation {
    #[serde(default)]
    description: String,
}

#[derive(Deserialize)]
struct RpcStatus {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

enum Auth {
    ServiceAccount {
        key: ServiceAccountKey,
        cached: Mutex<Option<CachedToken>>,
    },
    #[cfg(test)]
    Static(String),
}

/// Google Vision OCR client. One TEXT_DETECTION request per frame, each
/// paced by the shared gate and retried per the batch policy.
pub struct VisionOcr {
    http: reqwest::Client,
    auth: Auth,
    endpoint: String,
    gate: Arc<RateGate>,
    retry: RetryPolicy,
    request_timeout: Duration,
}

impl VisionOcr {
    pub fn new(
        key: ServiceAccountKey,
        gate: Arc<RateGate>,
        retry: RetryPolicy,
        request_timeout: Duration,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            auth: Auth::ServiceAccount {
                key,
                cached: Mutex::new(None),
            },
            endpoint: VISION_ENDPOINT.to_string(),
            gate,
            retry,
            request_timeout,
        }
    }

    #[cfg(test)]
    fn with_static_token(
        token: &str,
        endpoint: String,
        gate: Arc<RateGate>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            auth: Auth::Static(token.to_string()),
            endpoint,
            gate,
            retry,
            request_timeout: Duration::from_secs(5),
        }
    }

    async fn access_token(&self) -> Result<String, OcrCallError> {
        let (key, cached) = match &self.auth {
            Auth::ServiceAccount { key, cached } => (key, cached),
            #[cfg(test)]
            Auth::Static(token) => return Ok(token.clone()),
        };

        let mut cached = cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at.saturating_duration_since(Instant::now()) > TOKEN_REFRESH_MARGIN {
                return Ok(token.token.clone());
            }
        }

        let now_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let claims = Claims {
            iss: &key.client_email,
            scope: OAUTH_SCOPE,
            aud: &key.token_uri,
            iat: now_unix,
            exp: now_unix + 3600,
        };
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|err| OcrCallError::Auth(format!("invalid private key: {err}")))?;
        let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &encoding_key)
            .map_err(|err| OcrCallError::Auth(format!("cannot sign assertion: {err}")))?;

        let response = self
            .http
            .post(&key.token_uri)
            .form(&[
                ("grant_type", JWT_BEARER_GRANT),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(OcrCallError::Transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OcrCallError::Status(status, format!("token exchange: {body}")));
        }
        let token: TokenResponse = response.json().await.map_err(OcrCallError::Transport)?;
        debug!(expires_in = token.expires_in, "refreshed Vision access token");

        let access = token.access_token.clone();
        *cached = Some(CachedToken {
            token: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        });
        Ok(access)
    }

    /// The first annotation in a TEXT_DETECTION response is the full
    /// recognized text block; the rest are per-word boxes.
    async fn annotate_frame(&self, jpeg: &[u8]) -> Result<Option<String>, OcrCallError> {
        let token = self.access_token().await?;
        let request = AnnotateRequest {
            requests: vec![AnnotateImageRequest {
                image: ImagePayload {
                    content: BASE64_STANDARD.encode(jpeg),
                },
                features: vec![Feature {
                    r#type: "TEXT_DETECTION",
                    max_results: 1,
                }],
            }],
        };

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&token)
            .json(&request)
            .send()
            .await
            .map_err(OcrCallError::Transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OcrCallError::Status(status, body));
        }

        let parsed: AnnotateResponse = response.json().await.map_err(OcrCallError::Transport)?;
        let Some(result) = parsed.responses.into_iter().next() else {
            return Ok(None);
        };
        if let Some(error) = result.error {
            if error.code != 0 {
                return Err(OcrCallError::Service {
                    code: error.code,
                    message: error.message,
                });
            }
        }
        Ok(result
            .text_annotations
            .into_iter()
            .next()
            .map(|annotation| annotation.description))
    }
}

#[async_trait]
impl TextExtractor for VisionOcr {
    async fn extract(&self, frames: &[SampledFrame]) -> Result<ExtractedText, TaskError> {
        let mut fragments = Vec::new();
        for frame in frames {
            let text = with_retries(self.retry, "OCR request", is_transient, || {
                let jpeg = &frame.jpeg;
                async move {
                    self.gate.acquire().await;
                    match tokio::time::timeout(self.request_timeout, self.annotate_frame(jpeg))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(OcrCallError::Timeout),
                    }
                }
            })
            .await
            .map_err(|err| TaskError::OcrService(err.to_string()))?;

            // A frame with no recognizable text is not an error.
            if let Some(text) = text {
                if !text.trim().is_empty() {
                    fragments.push(TextFragment {
                        timestamp_ms: frame.timestamp_ms,
                        text,
                    });
                }
            }
        }
        Ok(ExtractedText { fragments })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn test_client(server: &MockServer) -> VisionOcr {
        VisionOcr::with_static_token(
            "test-token",
            format!("{}/v1/images:annotate", server.uri()),
            Arc::new(RateGate::new(Duration::from_millis(1))),
            RetryPolicy::new(3, Duration::from_millis(1)),
        )
    }

    fn frame(timestamp_ms: i64) -> SampledFrame {
        SampledFrame {
            jpeg: vec![0xff, 0xd8, 0xff],
            timestamp_ms,
        }
    }

    #[tokio::test]
    async fn aggregates_fragments_in_frame_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/images:annotate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "responses": [{
                    "textAnnotations": [
                        {"description": "BLDG 101 UNIT 202 WATER"},
                        {"description": "BLDG"}
                    ]
                }]
            })))
            .mount(&server)
            .await;

        let ocr = test_client(&server);
        let extracted = ocr.extract(&[frame(0), frame(5000)]).await.unwrap();
        assert_eq!(extracted.fragments.len(), 2);
        assert_eq!(extracted.fragments[0].timestamp_ms, 0);
        assert_eq!(extracted.fragments[1].timestamp_ms, 5000);
        assert_eq!(extracted.fragments[0].text, "BLDG 101 UNIT 202 WATER");
    }

    #[tokio::test]
    async fn retries_throttling_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/images:annotate"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/images:annotate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "responses": [{"textAnnotations": [{"description": "PIPE A"}]}]
            })))
            .mount(&server)
            .await;

        let ocr = test_client(&server);
        let extracted = ocr.extract(&[frame(0)]).await.unwrap();
        assert_eq!(extracted.fragments.len(), 1);
        assert_eq!(extracted.fragments[0].text, "PIPE A");
    }

    #[tokio::test]
    async fn blank_frames_contribute_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/images:annotate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"responses": [{}]})))
            .mount(&server)
            .await;

        let ocr = test_client(&server);
        let extracted = ocr.extract(&[frame(0), frame(1000)]).await.unwrap();
        assert!(extracted.fragments.is_empty());
    }

    #[tokio::test]
    async fn auth_failures_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/images:annotate"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let ocr = test_client(&server);
        let err = ocr.extract(&[frame(0)]).await.unwrap_err();
        assert!(matches!(err, TaskError::OcrService(_)));
    }

    #[tokio::test]
    async fn in_body_service_errors_are_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/images:annotate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "responses": [{"error": {"code": 7, "message": "permission denied"}}]
            })))
            .mount(&server)
            .await;

        let ocr = test_client(&server);
        let err = ocr.extract(&[frame(0)]).await.unwrap_err();
        match err {
            TaskError::OcrService(message) => assert!(message.contains("permission denied")),
            other => panic!("expected OcrService, got {other:?}"),
        }
    }
}
