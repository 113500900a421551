//! LLM judge backed by an OpenAI-compatible chat completions API
//!
//! Transient failures (timeouts, connection resets, 5xx) are retried with
//! exponential backoff; schema failures get exactly one repair re-prompt.
//! Anything that still fails surfaces as an error the engine converts to an
//! INDETERMINATE decision.

use crate::judge::{build_prompt, JudgeOutcome, JudgeVerdict, PolicyJudge};
use aegis_core::{DecisionContext, Error, Result, TokenUsage};
use aegis_policy::{ClarityCheck, ClarityVerdict, Policy};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// LLM judge configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Base URL of the chat completions API
    pub base_url: String,

    /// Model identifier
    pub model: String,

    /// Bearer token for the API
    pub api_key: String,

    /// Sampling temperature; kept low for judgment consistency
    pub temperature: f32,

    /// Maximum attempts for transient failures
    pub max_attempts: u32,

    /// First backoff delay
    pub initial_delay: Duration,

    /// Backoff multiplier per attempt
    pub backoff_factor: f64,

    /// Per-call request timeout
    pub request_timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: String::new(),
            temperature: 0.1,
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            backoff_factor: 2.0,
            request_timeout: Duration::from_secs(20),
        }
    }
}

/// One round trip to the model
#[async_trait]
pub(crate) trait ChatTransport: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<(String, TokenUsage)>;
}

/// Chat completions wire types (the subset the judge reads)
#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
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
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

struct HttpTransport {
    client: reqwest::Client,
    config: LlmConfig,
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn complete(&self, prompt: &str) -> Result<(String, TokenUsage)> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.config.model,
            "temperature": self.config.temperature,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(Error::LlmTransient(format!("api returned {}", status)));
        }
        if !status.is_success() {
            return Err(Error::internal(format!("llm api returned {}", status)));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::LlmSchema(format!("malformed api response: {}", e)))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::LlmSchema("response carried no choices".to_string()))?;
        let tokens = parsed
            .usage
            .map(|u| TokenUsage {
                prompt: u.prompt_tokens,
                completion: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok((content, tokens))
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> Error {
    if e.is_timeout() || e.is_connect() {
        Error::LlmTransient(e.to_string())
    } else {
        Error::internal(format!("llm request failed: {}", e))
    }
}

/// Judge implementation calling a chat completions API
pub struct LlmJudge {
    transport: Box<dyn ChatTransport>,
    config: LlmConfig,
}

impl LlmJudge {
    /// Create a judge over HTTP
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::config(format!("failed to build llm client: {}", e)))?;
        Ok(Self {
            transport: Box::new(HttpTransport {
                client,
                config: config.clone(),
            }),
            config,
        })
    }

    pub(crate) fn with_transport(config: LlmConfig, transport: Box<dyn ChatTransport>) -> Self {
        Self { transport, config }
    }

    /// Call the model, retrying transient failures with exponential backoff
    async fn complete_with_retry(
        &self,
        prompt: &str,
        attempts: &mut u32,
        tokens: &mut TokenUsage,
    ) -> Result<String> {
        let mut delay = self.config.initial_delay;

        loop {
            *attempts += 1;
            match self.transport.complete(prompt).await {
                Ok((content, usage)) => {
                    tokens.prompt += usage.prompt;
                    tokens.completion += usage.completion;
                    return Ok(content);
                }
                Err(e) if e.is_transient() && *attempts < self.config.max_attempts => {
                    warn!(attempt = *attempts, "transient llm failure, backing off: {}", e);
                    tokio::time::sleep(delay).await;
                    delay = Duration::from_millis(
                        (delay.as_millis() as f64 * self.config.backoff_factor) as u64,
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl PolicyJudge for LlmJudge {
    async fn judge(&self, policy: &Policy, ctx: &DecisionContext) -> Result<JudgeOutcome> {
        let prompt = build_prompt(policy, ctx);
        let mut attempts = 0;
        let mut tokens = TokenUsage::default();

        let content = self
            .complete_with_retry(&prompt, &mut attempts, &mut tokens)
            .await?;

        let verdict = match parse_verdict(&content) {
            Ok(v) => v,
            Err(parse_err) => {
                // One repair re-prompt carrying the parse error, never more.
                debug!("judge response failed to parse, attempting repair: {}", parse_err);
                let repair = format!(
                    "{}\n\nYour previous response could not be parsed: {}\n\
                     Respond again with only the JSON object.",
                    prompt, parse_err
                );
                let content = self
                    .complete_with_retry(&repair, &mut attempts, &mut tokens)
                    .await?;
                parse_verdict(&content).map_err(Error::LlmSchema)?
            }
        };

        Ok(JudgeOutcome {
            verdict,
            model: self.config.model.clone(),
            attempts,
            tokens,
        })
    }
}

#[async_trait]
impl ClarityCheck for LlmJudge {
    async fn check(&self, policy: &Policy) -> Result<ClarityVerdict> {
        let prompt = format!(
            "Review this access-control policy for ambiguity. A policy is clear \
             when two reasonable readers would enforce it the same way.\n\n\
             POLICY \"{}\":\n{}\n\n\
             Respond with only a JSON object: {{\"clear\": <bool>, \"notes\": \"<string>\"}}",
            policy.name,
            policy.text.as_deref().unwrap_or_default(),
        );

        let mut attempts = 0;
        let mut tokens = TokenUsage::default();
        let content = self
            .complete_with_retry(&prompt, &mut attempts, &mut tokens)
            .await?;

        #[derive(Deserialize)]
        struct Clarity {
            clear: bool,
            #[serde(default)]
            notes: Option<String>,
        }

        let parsed: Clarity = serde_json::from_str(extract_json(&content))
            .map_err(|e| Error::LlmSchema(format!("clarity verdict unparseable: {}", e)))?;
        Ok(ClarityVerdict {
            clear: parsed.clear,
            notes: parsed.notes,
        })
    }
}

/// Trim markdown fences and surrounding prose down to the JSON object
fn extract_json(content: &str) -> &str {
    let start = content.find('{');
    let end = content.rfind('}');
    match (start, end) {
        (Some(s), Some(e)) if e >= s => &content[s..=e],
        _ => content,
    }
}

/// Parse a judge response into a verdict
fn parse_verdict(content: &str) -> std::result::Result<JudgeVerdict, String> {
    let mut verdict: JudgeVerdict =
        serde_json::from_str(extract_json(content)).map_err(|e| e.to_string())?;
    verdict.confidence = verdict.confidence.clamp(0.0, 1.0);
    Ok(verdict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_core::DecisionOutcome;
    use aegis_policy::PolicyDraft;
    use parking_lot::Mutex;
    use std::collections::BTreeSet;

    fn policy() -> Policy {
        PolicyDraft {
            name: "nl-policy".to_string(),
            description: String::new(),
            text: Some("Research agents may read internal data.".to_string()),
            rules: None,
            priority: 0,
            tags: BTreeSet::new(),
            created_by: "tests".to_string(),
            applicable: Default::default(),
        }
        .into_policy()
    }

    /// Transport replaying a scripted sequence of results
    struct Scripted {
        responses: Mutex<Vec<Result<String>>>,
    }

    impl Scripted {
        fn new(responses: Vec<Result<String>>) -> Self {
            Self {
                responses: Mutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl ChatTransport for Scripted {
        async fn complete(&self, _prompt: &str) -> Result<(String, TokenUsage)> {
            let next = self.responses.lock().remove(0);
            next.map(|content| {
                (
                    content,
                    TokenUsage {
                        prompt: 100,
                        completion: 20,
                    },
                )
            })
        }
    }

    fn judge_with(responses: Vec<Result<String>>) -> LlmJudge {
        LlmJudge::with_transport(LlmConfig::default(), Box::new(Scripted::new(responses)))
    }

    const PERMIT_JSON: &str =
        r#"{"decision": "PERMIT", "reason": "trusted research agent", "confidence": 0.9}"#;

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_on_third_attempt() {
        let judge = judge_with(vec![
            Err(Error::LlmTransient("connection reset".into())),
            Err(Error::LlmTransient("timeout".into())),
            Ok(PERMIT_JSON.to_string()),
        ]);

        let ctx = DecisionContext::new("a", "tools/call", "r");
        let outcome = judge.judge(&policy(), &ctx).await.unwrap();

        assert_eq!(outcome.verdict.decision, DecisionOutcome::Permit);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.tokens.prompt, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_exhaust_retries() {
        let judge = judge_with(vec![
            Err(Error::LlmTransient("reset".into())),
            Err(Error::LlmTransient("reset".into())),
            Err(Error::LlmTransient("reset".into())),
        ]);

        let ctx = DecisionContext::new("a", "tools/call", "r");
        let err = judge.judge(&policy(), &ctx).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_non_transient_error_not_retried() {
        let judge = judge_with(vec![Err(Error::internal("401 unauthorized"))]);

        let ctx = DecisionContext::new("a", "tools/call", "r");
        assert!(judge.judge(&policy(), &ctx).await.is_err());
        // a second scripted response would have panicked the mock if consumed
    }

    #[tokio::test]
    async fn test_repair_reprompt_recovers() {
        let judge = judge_with(vec![
            Ok("the policy clearly permits this".to_string()),
            Ok(format!("```json\n{}\n```", PERMIT_JSON)),
        ]);

        let ctx = DecisionContext::new("a", "tools/call", "r");
        let outcome = judge.judge(&policy(), &ctx).await.unwrap();
        assert_eq!(outcome.verdict.decision, DecisionOutcome::Permit);
        assert_eq!(outcome.attempts, 2);
        // usage accumulated across both calls
        assert_eq!(outcome.tokens.completion, 40);
    }

    #[tokio::test]
    async fn test_repair_fails_once_then_schema_error() {
        let judge = judge_with(vec![
            Ok("not json".to_string()),
            Ok("still not json".to_string()),
        ]);

        let ctx = DecisionContext::new("a", "tools/call", "r");
        let err = judge.judge(&policy(), &ctx).await.unwrap_err();
        assert!(matches!(err, Error::LlmSchema(_)));
    }

    #[test]
    fn test_extract_json_strips_fences() {
        let fenced = "```json\n{\"a\": 1}\n```";
        assert_eq!(extract_json(fenced), "{\"a\": 1}");
        assert_eq!(extract_json("{\"a\": 1}"), "{\"a\": 1}");
        assert_eq!(extract_json("no json here"), "no json here");
    }

    #[test]
    fn test_parse_verdict_clamps_confidence() {
        let verdict =
            parse_verdict(r#"{"decision": "DENY", "reason": "x", "confidence": 3.5}"#).unwrap();
        assert_eq!(verdict.confidence, 1.0);
    }

    #[tokio::test]
    async fn test_clarity_check_parses_verdict() {
        let judge = judge_with(vec![Ok(
            r#"{"clear": false, "notes": "ambiguous scope"}"#.to_string()
        )]);
        let verdict = judge.check(&policy()).await.unwrap();
        assert!(!verdict.clear);
        assert_eq!(verdict.notes.as_deref(), Some("ambiguous scope"));
    }
}
