//! Prompt-based content classification client for listing moderation.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use remm_core::{ContentModerator, ModerationError, ModerationResult};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "remm-classifier";

const SYSTEM_INSTRUCTION: &str = "You are a content moderator for a real estate marketplace. \
Evaluate each listing strictly against the platform rules and answer with a single JSON object and nothing else.";

const DEFAULT_RULES: &[&str] = &[
    "The listing must describe real estate offered for sale or rent.",
    "No spam, filler text, keyword stuffing or unrelated advertising.",
    "No scams or requests for payment outside the platform.",
    "No phone numbers, email addresses, messenger handles or external links.",
    "No profanity, hate speech or discriminatory requirements.",
    "Title and description must be descriptive and not spammy.",
];

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// When false every listing is approved without calling out.
    pub enabled: bool,
    /// When true any transport or parse failure approves instead of rejecting.
    pub fail_open: bool,
    pub timeout: Duration,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub rules_path: Option<PathBuf>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fail_open: false,
            timeout: Duration::from_secs(30),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            rules_path: None,
        }
    }
}

impl ClassifierConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env_flag("REMM_MODERATION_ENABLED").unwrap_or(defaults.enabled),
            fail_open: env_flag("REMM_MODERATION_FAIL_OPEN").unwrap_or(defaults.fail_open),
            timeout: std::env::var("REMM_CLASSIFIER_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            base_url: std::env::var("REMM_CLASSIFIER_BASE_URL").unwrap_or(defaults.base_url),
            api_key: std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.trim().is_empty()),
            model: std::env::var("REMM_CLASSIFIER_MODEL").unwrap_or(defaults.model),
            rules_path: std::env::var("REMM_RULES_PATH").ok().map(PathBuf::from),
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    let parsed = parse_flag(&raw);
    if parsed.is_none() {
        warn!(variable = name, value = %raw, "unrecognised boolean; using default");
    }
    parsed
}

/// Case-insensitive `1/true/yes/on` or `0/false/no/off`; anything else is `None`.
fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<String>,
}

/// Platform rules embedded in every classification prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentRules {
    rules: Vec<String>,
}

impl Default for ContentRules {
    fn default() -> Self {
        Self {
            rules: DEFAULT_RULES.iter().map(|r| r.to_string()).collect(),
        }
    }
}

impl ContentRules {
    pub fn new(rules: Vec<String>) -> Self {
        Self { rules }
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let parsed: RulesFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        if parsed.rules.is_empty() {
            anyhow::bail!("{} defines no moderation rules", path.display());
        }
        Ok(Self::new(parsed.rules))
    }

    pub fn rules(&self) -> &[String] {
        &self.rules
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
}

/// Builds the system instruction + user prompt pair. Output depends only on
/// the inputs, so identical listings always produce identical requests.
pub fn build_prompt(model: &str, rules: &ContentRules, title: &str, description: &str) -> ChatRequest {
    let mut prompt = String::from("Review the following property listing against these rules:\n");
    for (idx, rule) in rules.rules().iter().enumerate() {
        let _ = writeln!(prompt, "{}. {}", idx + 1, rule);
    }
    prompt.push_str(
        "\nRespond with a JSON object of exactly this shape:\n\
         {\"approved\": true or false, \"reason\": string or null, \"suggestions\": array of strings or null}\n\
         Only fill \"reason\" and \"suggestions\" when the listing is rejected.\n\n",
    );
    let _ = writeln!(prompt, "Title: {}", title.trim());
    let _ = write!(prompt, "Description: {}", description.trim());

    ChatRequest {
        model: model.to_string(),
        messages: vec![ChatMessage::system(SYSTEM_INSTRUCTION), ChatMessage::user(prompt)],
        temperature: 0.0,
    }
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    approved: bool,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    suggestions: Option<Vec<String>>,
}

/// Parses the substring between the first `{` and the last `}` of a raw
/// classifier answer, tolerating prose around the JSON.
pub fn extract_verdict(raw: &str) -> Result<ModerationResult, ModerationError> {
    let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) else {
        return Err(ModerationError::parse("classifier answer contains no JSON object"));
    };
    if end < start {
        return Err(ModerationError::parse("classifier answer contains no JSON object"));
    }
    let verdict: RawVerdict = serde_json::from_str(&raw[start..=end])
        .map_err(|err| ModerationError::parse(format!("invalid verdict JSON: {err}")))?;
    Ok(ModerationResult::from_verdict(
        verdict.approved,
        verdict.reason,
        verdict.suggestions,
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Sends a chat request to the external classifier and returns its raw text.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<String, ModerationError>;
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible `POST {base_url}/chat/completions` transport.
#[derive(Debug, Clone)]
pub struct OpenAiChatTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiChatTransport {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building classifier http client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl ChatTransport for OpenAiChatTransport {
    async fn complete(&self, request: &ChatRequest) -> Result<String, ModerationError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|err| {
                let retryable = classify_reqwest_error(&err) == RetryDisposition::Retryable;
                ModerationError::transport(format!("request to classifier failed: {err}"))
                    .with_retryable(retryable)
            })?;

        let status = response.status();
        if !status.is_success() {
            let retryable = classify_status(status) == RetryDisposition::Retryable;
            return Err(
                ModerationError::transport(format!("classifier returned http status {status}"))
                    .with_retryable(retryable),
            );
        }

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|err| ModerationError::parse(format!("decoding classifier response: {err}")))?;

        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ModerationError::parse("classifier response has no message content"))
    }
}

/// Content moderation client: prompt construction, verdict parsing and the
/// enabled / fail-open policy around a [`ChatTransport`].
#[derive(Clone)]
pub struct ModerationClient {
    config: ClassifierConfig,
    rules: ContentRules,
    transport: Arc<dyn ChatTransport>,
}

impl ModerationClient {
    pub fn new(config: ClassifierConfig, rules: ContentRules, transport: Arc<dyn ChatTransport>) -> Self {
        Self {
            config,
            rules,
            transport,
        }
    }

    /// Builds the client with the OpenAI transport and the configured rules file.
    pub fn from_config(config: ClassifierConfig) -> Result<Self> {
        let rules = match &config.rules_path {
            Some(path) => ContentRules::from_yaml_file(path)?,
            None => ContentRules::default(),
        };
        let api_key = match (&config.api_key, config.enabled) {
            (Some(key), _) => key.clone(),
            (None, false) => String::new(),
            (None, true) => anyhow::bail!("OPENAI_API_KEY must be set when moderation is enabled"),
        };
        let transport = OpenAiChatTransport::new(config.base_url.clone(), api_key, config.timeout)?;
        Ok(Self::new(config, rules, Arc::new(transport)))
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Classifies the pair and surfaces transport and parse failures as typed errors.
    pub async fn classify(&self, title: &str, description: &str) -> Result<ModerationResult, ModerationError> {
        if !self.config.enabled {
            debug!("moderation disabled; auto-approving");
            return Ok(ModerationResult::approved());
        }

        let request = build_prompt(&self.config.model, &self.rules, title, description);
        let raw = self.transport.complete(&request).await?;
        let result = extract_verdict(&raw)?;
        debug!(approved = result.is_approved, "classifier verdict");
        Ok(result)
    }

    /// Never fails: failures become a diagnostic rejection, or an approval
    /// when the client is configured fail-open.
    pub async fn moderate(&self, title: &str, description: &str) -> ModerationResult {
        match self.classify(title, description).await {
            Ok(result) => result,
            Err(err) if self.config.fail_open => {
                warn!(error = %err, "classification failed; failing open");
                ModerationResult::approved()
            }
            Err(err) => {
                warn!(error = %err, "classification failed; rejecting");
                ModerationResult::from_verdict(
                    false,
                    Some(format!("Automatic moderation could not be completed: {err}")),
                    None,
                )
            }
        }
    }
}

#[async_trait]
impl ContentModerator for ModerationClient {
    async fn check_content(&self, title: &str, description: &str) -> Result<ModerationResult, ModerationError> {
        match self.classify(title, description).await {
            Err(err) if self.config.fail_open => {
                warn!(error = %err, "classification failed; failing open");
                Ok(ModerationResult::approved())
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode as AxumStatus, routing::post, Json, Router};
    use remm_core::{ModerationErrorKind, DEFAULT_SUGGESTION};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedTransport {
        answer: Result<String, ModerationError>,
        calls: AtomicUsize,
        last_request: Mutex<Option<ChatRequest>>,
    }

    impl ScriptedTransport {
        fn answering(text: &str) -> Arc<Self> {
            Arc::new(Self {
                answer: Ok(text.to_string()),
                calls: AtomicUsize::new(0),
                last_request: Mutex::new(None),
            })
        }

        fn failing(err: ModerationError) -> Arc<Self> {
            Arc::new(Self {
                answer: Err(err),
                calls: AtomicUsize::new(0),
                last_request: Mutex::new(None),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn complete(&self, request: &ChatRequest) -> Result<String, ModerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock().unwrap() = Some(request.clone());
            self.answer.clone()
        }
    }

    fn client_with(transport: Arc<ScriptedTransport>, fail_open: bool) -> ModerationClient {
        let config = ClassifierConfig {
            fail_open,
            ..Default::default()
        };
        ModerationClient::new(config, ContentRules::default(), transport)
    }

    #[test]
    fn prompt_is_deterministic_and_embeds_listing() {
        let rules = ContentRules::default();
        let a = build_prompt("m", &rules, "Nice flat", "Spacious 2-room apartment");
        let b = build_prompt("m", &rules, "Nice flat", "Spacious 2-room apartment");
        assert_eq!(a, b);
        assert_eq!(a.messages.len(), 2);
        assert_eq!(a.messages[0].role, "system");
        let user = &a.messages[1].content;
        assert!(user.contains("Title: Nice flat"));
        assert!(user.contains("Description: Spacious 2-room apartment"));
        assert!(user.contains("1. The listing must describe real estate"));
        assert!(user.contains("\"approved\""));
    }

    #[test]
    fn verdict_is_extracted_from_prose() {
        let raw = "Sure! Here is my answer:\n{\"approved\": true, \"reason\": null}\nHope that helps.";
        assert_eq!(extract_verdict(raw).unwrap(), ModerationResult::approved());
    }

    #[test]
    fn missing_braces_is_a_parse_error() {
        let err = extract_verdict("I cannot help with that").unwrap_err();
        assert_eq!(err.kind, ModerationErrorKind::ClassificationParse);
        let err = extract_verdict("} backwards {").unwrap_err();
        assert_eq!(err.kind, ModerationErrorKind::ClassificationParse);
    }

    #[test]
    fn rules_load_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("moderation.yaml");
        std::fs::write(&path, "version: 1\nrules:\n  - Only houses.\n  - No pets.\n").unwrap();
        let rules = ContentRules::from_yaml_file(&path).unwrap();
        assert_eq!(rules.rules(), &["Only houses.".to_string(), "No pets.".to_string()]);

        std::fs::write(&path, "version: 1\nrules: []\n").unwrap();
        assert!(ContentRules::from_yaml_file(&path).is_err());
    }

    #[tokio::test]
    async fn rejection_without_suggestions_gets_default() {
        let transport =
            ScriptedTransport::answering(r#"{"approved": false, "reason": "spam", "suggestions": null}"#);
        let client = client_with(transport, false);
        let result = client.moderate("Nice flat", "BUY NOW BUY NOW").await;
        assert!(!result.is_approved);
        assert_eq!(result.rejection_reason.as_deref(), Some("spam"));
        assert_eq!(result.suggestions, Some(vec![DEFAULT_SUGGESTION.to_string()]));
    }

    #[tokio::test]
    async fn fail_closed_by_default_on_transport_error() {
        let transport = ScriptedTransport::failing(ModerationError::transport("connection refused"));
        let client = client_with(transport, false);
        let result = client.moderate("Nice flat", "Spacious 2-room apartment").await;
        assert!(!result.is_approved);
        assert!(result.rejection_reason.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn fail_open_approves_on_transport_error() {
        let transport = ScriptedTransport::failing(ModerationError::transport("connection refused"));
        let client = client_with(transport.clone(), true);
        let result = client.moderate("Nice flat", "Spacious 2-room apartment").await;
        assert!(result.is_approved);
        assert!(result.rejection_reason.is_none());

        let checked = client.check_content("Nice flat", "Spacious").await.unwrap();
        assert!(checked.is_approved);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn unparseable_answer_fails_closed_or_open() {
        let closed = client_with(ScriptedTransport::answering("no idea"), false);
        assert!(!closed.moderate("t", "d").await.is_approved);

        let open = client_with(ScriptedTransport::answering("no idea"), true);
        assert!(open.moderate("t", "d").await.is_approved);
    }

    #[tokio::test]
    async fn check_content_propagates_errors_when_fail_closed() {
        let transport = ScriptedTransport::failing(ModerationError::transport("timeout"));
        let client = client_with(transport, false);
        let err = client.check_content("t", "d").await.unwrap_err();
        assert_eq!(err.kind, ModerationErrorKind::ClassificationTransport);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn disabled_client_approves_without_calling_out() {
        let transport = ScriptedTransport::failing(ModerationError::transport("unreachable"));
        let config = ClassifierConfig {
            enabled: false,
            ..Default::default()
        };
        let client = ModerationClient::new(config, ContentRules::default(), transport.clone());
        assert!(client.moderate("t", "d").await.is_approved);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn classifier_receives_listing_prompt() {
        let transport = ScriptedTransport::answering(r#"{"approved": true}"#);
        let client = client_with(transport.clone(), false);
        client.classify("Nice flat", "Spacious 2-room apartment").await.unwrap();
        let request = transport.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.model, "gpt-4o-mini");
        assert!(request.messages[1].content.contains("Nice flat"));
    }

    async fn spawn_classifier(status: AxumStatus, body: serde_json::Value) -> String {
        let app = Router::new().route(
            "/chat/completions",
            post(move || {
                let body = body.clone();
                async move { (status, Json(body)) }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn openai_transport_returns_first_choice_content() {
        let base = spawn_classifier(
            AxumStatus::OK,
            serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "{\"approved\": true}"}}]
            }),
        )
        .await;
        let transport = OpenAiChatTransport::new(base, "test-key", Duration::from_secs(5)).unwrap();
        let request = build_prompt("m", &ContentRules::default(), "t", "d");
        let text = transport.complete(&request).await.unwrap();
        assert_eq!(text, "{\"approved\": true}");
    }

    #[tokio::test]
    async fn openai_transport_tags_status_retryability() {
        let request = build_prompt("m", &ContentRules::default(), "t", "d");

        let base = spawn_classifier(AxumStatus::SERVICE_UNAVAILABLE, serde_json::json!({})).await;
        let transport = OpenAiChatTransport::new(base, "k", Duration::from_secs(5)).unwrap();
        let err = transport.complete(&request).await.unwrap_err();
        assert_eq!(err.kind, ModerationErrorKind::ClassificationTransport);
        assert!(err.is_retryable());

        let base = spawn_classifier(AxumStatus::UNAUTHORIZED, serde_json::json!({})).await;
        let transport = OpenAiChatTransport::new(base, "k", Duration::from_secs(5)).unwrap();
        let err = transport.complete(&request).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn openai_transport_without_choices_is_parse_error() {
        let base = spawn_classifier(AxumStatus::OK, serde_json::json!({"choices": []})).await;
        let transport = OpenAiChatTransport::new(base, "k", Duration::from_secs(5)).unwrap();
        let request = build_prompt("m", &ContentRules::default(), "t", "d");
        let err = transport.complete(&request).await.unwrap_err();
        assert_eq!(err.kind, ModerationErrorKind::ClassificationParse);
    }

    #[test]
    fn boolean_flags_fall_back_on_unknown_values() {
        assert_eq!(parse_flag("on"), Some(true));
        assert_eq!(parse_flag(" Yes "), Some(true));
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag("Off"), Some(false));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("enable"), None);
        assert_eq!(parse_flag(""), None);
        assert!(parse_flag("enable").unwrap_or(ClassifierConfig::default().enabled));
    }

    #[test]
    fn status_classification_matches_retry_policy() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), RetryDisposition::NonRetryable);
    }
}
