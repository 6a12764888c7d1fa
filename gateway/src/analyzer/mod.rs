mod proto;

use async_trait::async_trait;
use proto::content_analyzer_client::ContentAnalyzerClient;
use proto::health_check_response::ServingStatus as ProtoServingStatus;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tonic::transport::Channel;
use tonic::Code;
use tracing::warn;

/// Domain-level mirror of the wire enum in spec.md §6.2, kept separate from
/// the generated `proto::IssueKind` so callers never depend on `tonic`
/// types directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueKind {
    Unknown,
    ApiKey,
    Email,
    Phone,
    Ssn,
    CreditCard,
    IpAddress,
    Person,
    Location,
    Url,
    Password,
    PromptInjection,
    Jailbreak,
    ExcessiveSpecialChars,
    EncodedPayload,
}

impl IssueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IssueKind::Unknown => "UNKNOWN",
            IssueKind::ApiKey => "API_KEY",
            IssueKind::Email => "EMAIL",
            IssueKind::Phone => "PHONE",
            IssueKind::Ssn => "SSN",
            IssueKind::CreditCard => "CREDIT_CARD",
            IssueKind::IpAddress => "IP_ADDRESS",
            IssueKind::Person => "PERSON",
            IssueKind::Location => "LOCATION",
            IssueKind::Url => "URL",
            IssueKind::Password => "PASSWORD",
            IssueKind::PromptInjection => "PROMPT_INJECTION",
            IssueKind::Jailbreak => "JAILBREAK",
            IssueKind::ExcessiveSpecialChars => "EXCESSIVE_SPECIAL_CHARS",
            IssueKind::EncodedPayload => "ENCODED_PAYLOAD",
        }
    }

    fn from_proto(value: i32) -> Self {
        match proto::IssueKind::try_from(value).unwrap_or(proto::IssueKind::Unknown) {
            proto::IssueKind::Unknown => IssueKind::Unknown,
            proto::IssueKind::ApiKey => IssueKind::ApiKey,
            proto::IssueKind::Email => IssueKind::Email,
            proto::IssueKind::Phone => IssueKind::Phone,
            proto::IssueKind::Ssn => IssueKind::Ssn,
            proto::IssueKind::CreditCard => IssueKind::CreditCard,
            proto::IssueKind::IpAddress => IssueKind::IpAddress,
            proto::IssueKind::Person => IssueKind::Person,
            proto::IssueKind::Location => IssueKind::Location,
            proto::IssueKind::Url => IssueKind::Url,
            proto::IssueKind::Password => IssueKind::Password,
            proto::IssueKind::PromptInjection => IssueKind::PromptInjection,
            proto::IssueKind::Jailbreak => IssueKind::Jailbreak,
            proto::IssueKind::ExcessiveSpecialChars => IssueKind::ExcessiveSpecialChars,
            proto::IssueKind::EncodedPayload => IssueKind::EncodedPayload,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectedIssue {
    pub kind: IssueKind,
    pub text: String,
    pub start: i32,
    pub end: i32,
    pub confidence: f32,
    pub replacement: String,
}

/// Immutable RPC response, per spec.md §3.1 "Analyzer verdict".
#[derive(Debug, Clone)]
pub struct Verdict {
    pub is_safe: bool,
    pub redacted_preview: Option<String>,
    pub issues: Vec<DetectedIssue>,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServingStatus {
    Unknown,
    Serving,
    NotServing,
    ServiceUnknown,
}

#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub serving: ServingStatus,
    pub version: String,
    pub uptime_seconds: i64,
}

#[derive(thiserror::Error, Debug)]
pub enum AnalyzerError {
    #[error("analyzer rejected the request: {0}")]
    InvalidArgument(String),
    #[error("analyzer unreachable after retries: {0}")]
    Unavailable(String),
}

/// The one primary operation spec.md §4.4 names, plus health-check for the
/// `/ready` probe. A trait seam so the admission pipeline and its tests can
/// substitute a fake without a live gRPC server, mirroring the teacher's
/// `RateLimiterEngine` substitution pattern.
#[async_trait]
pub trait ContentAnalyzer: Send + Sync {
    async fn check_content(
        &self,
        text: &str,
        request_id: &str,
        metadata: HashMap<String, String>,
    ) -> Result<Verdict, AnalyzerError>;

    async fn health_check(&self) -> Result<HealthStatus, AnalyzerError>;

    /// Drops the underlying channel. Called once, last, during the shutdown
    /// coordinator's ordered drain (spec.md §4.10 step 4). Default no-op;
    /// `GrpcAnalyzerClient`'s channel is reclaimed on `Drop` regardless, this
    /// just makes the ordering explicit and observable.
    async fn shutdown(&self) {}
}

/// Reliable gRPC client: per-attempt deadline, bounded retries with
/// exponential backoff, and a forced reconnect after every transport
/// failure. Reconnects are serialized behind the channel mutex so only one
/// is ever in flight (spec.md §5 "reconnect is exclusive").
pub struct GrpcAnalyzerClient {
    endpoint: String,
    channel: Arc<Mutex<Channel>>,
    per_attempt_timeout: Duration,
    max_retries: u32,
}

const KEEPALIVE_IDLE: Duration = Duration::from_secs(10);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

impl GrpcAnalyzerClient {
    pub async fn connect(endpoint: String, per_attempt_timeout: Duration, max_retries: u32) -> Result<Self, AnalyzerError> {
        let channel = Self::build_channel(&endpoint, per_attempt_timeout)
            .await
            .map_err(|e| AnalyzerError::Unavailable(e.to_string()))?;
        Ok(Self { endpoint, channel: Arc::new(Mutex::new(channel)), per_attempt_timeout, max_retries })
    }

    async fn build_channel(endpoint: &str, per_attempt_timeout: Duration) -> anyhow::Result<Channel> {
        let channel = Channel::from_shared(endpoint.to_string())?
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(per_attempt_timeout)
            .tcp_keepalive(Some(KEEPALIVE_IDLE))
            .keep_alive_timeout(KEEPALIVE_TIMEOUT)
            .connect()
            .await?;
        Ok(channel)
    }

    /// Holds the channel mutex across the connect attempt itself (not just
    /// the swap), so concurrent callers serialize behind one in-flight
    /// reconnect instead of each independently dialing a fresh connection.
    async fn reconnect(&self) {
        let mut guard = self.channel.lock().await;
        match Self::build_channel(&self.endpoint, self.per_attempt_timeout).await {
            Ok(fresh) => {
                *guard = fresh;
            }
            Err(err) => {
                warn!(?err, "analyzer reconnect failed, will retry on next attempt");
            }
        }
    }

    async fn client(&self) -> ContentAnalyzerClient<Channel> {
        let channel = self.channel.lock().await.clone();
        ContentAnalyzerClient::new(channel)
            .max_decoding_message_size(MAX_MESSAGE_BYTES)
            .max_encoding_message_size(MAX_MESSAGE_BYTES)
    }
}

#[async_trait]
impl ContentAnalyzer for GrpcAnalyzerClient {
    async fn check_content(
        &self,
        text: &str,
        request_id: &str,
        metadata: HashMap<String, String>,
    ) -> Result<Verdict, AnalyzerError> {
        let request = proto::CheckContentRequest {
            content: text.to_string(),
            request_id: request_id.to_string(),
            metadata,
        };

        let mut attempt: u32 = 0;
        loop {
            let mut client = self.client().await;
            let result = client.check_content(request.clone()).await;
            match result {
                Ok(response) => {
                    let body = response.into_inner();
                    return Ok(Verdict {
                        is_safe: body.is_safe,
                        redacted_preview: if body.redacted_text.is_empty() { None } else { Some(body.redacted_text) },
                        issues: body
                            .detected_issues
                            .into_iter()
                            .map(|i| DetectedIssue {
                                kind: IssueKind::from_proto(i.r#type),
                                text: i.text,
                                start: i.start,
                                end: i.end,
                                confidence: i.confidence,
                                replacement: i.replacement,
                            })
                            .collect(),
                        confidence: body.confidence_score,
                    });
                }
                Err(status) => {
                    if status.code() == Code::InvalidArgument {
                        // Surfaced immediately; retrying a bad request can't help.
                        return Err(AnalyzerError::InvalidArgument(status.message().to_string()));
                    }
                    let retryable = matches!(status.code(), Code::Unavailable | Code::DeadlineExceeded);
                    if !retryable || attempt >= self.max_retries {
                        return Err(AnalyzerError::Unavailable(status.message().to_string()));
                    }
                    self.reconnect().await;
                    let backoff = Duration::from_secs(1) * 2u32.pow(attempt);
                    warn!(attempt, ?backoff, code = ?status.code(), "analyzer call failed, retrying");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn health_check(&self) -> Result<HealthStatus, AnalyzerError> {
        let mut client = self.client().await;
        let response = client
            .health_check(proto::HealthCheckRequest {})
            .await
            .map_err(|status| AnalyzerError::Unavailable(status.message().to_string()))?
            .into_inner();

        let serving = match ProtoServingStatus::try_from(response.status).unwrap_or(ProtoServingStatus::Unknown) {
            ProtoServingStatus::Unknown => ServingStatus::Unknown,
            ProtoServingStatus::Serving => ServingStatus::Serving,
            ProtoServingStatus::NotServing => ServingStatus::NotServing,
            ProtoServingStatus::ServiceUnknown => ServingStatus::ServiceUnknown,
        };

        Ok(HealthStatus { serving, version: response.version, uptime_seconds: response.uptime_seconds })
    }

    async fn shutdown(&self) {
        tracing::info!(endpoint = %self.endpoint, "closing analyzer channel");
    }
}

/// Exercised by this crate's own tests and by `tests/` integration tests
/// that need a content analyzer without a live gRPC server.
pub mod fakes {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Always-unavailable analyzer, used to exercise the fail-closed 503 path
    /// (spec.md §8 testable property 4) without standing up a gRPC server.
    pub struct AlwaysUnavailableAnalyzer {
        pub attempts: AtomicUsize,
    }

    impl Default for AlwaysUnavailableAnalyzer {
        fn default() -> Self {
            Self { attempts: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl ContentAnalyzer for AlwaysUnavailableAnalyzer {
        async fn check_content(
            &self,
            _text: &str,
            _request_id: &str,
            _metadata: HashMap<String, String>,
        ) -> Result<Verdict, AnalyzerError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(AnalyzerError::Unavailable("simulated outage".into()))
        }

        async fn health_check(&self) -> Result<HealthStatus, AnalyzerError> {
            Err(AnalyzerError::Unavailable("simulated outage".into()))
        }
    }

    pub struct ScriptedAnalyzer {
        pub verdict: Verdict,
    }

    #[async_trait]
    impl ContentAnalyzer for ScriptedAnalyzer {
        async fn check_content(
            &self,
            _text: &str,
            _request_id: &str,
            _metadata: HashMap<String, String>,
        ) -> Result<Verdict, AnalyzerError> {
            Ok(self.verdict.clone())
        }

        async fn health_check(&self) -> Result<HealthStatus, AnalyzerError> {
            Ok(HealthStatus { serving: ServingStatus::Serving, version: "test".into(), uptime_seconds: 1 })
        }
    }
}
