//! Tier 3: external critic.
//!
//! A `Critic` returns a structured verdict or an error. `CriticTier` turns
//! either into a `TierOutcome`; errors become a failing 0.0 score with the
//! error text as justification.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use vantage_state::{Candidate, TierOutcome};

use crate::backend::{call_with_timeout, CompletionRequest, GenerationBackend};
use crate::error::BackendError;

const CRITIC_SYSTEM_PROMPT: &str = "You are a strict code reviewer. Rate the candidate for \
correctness, clarity and safety. Reply with JSON only: \
{\"score\": <number between 0 and 1>, \"justification\": \"<one sentence>\"}";

/// Structured critic response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CriticVerdict {
    pub score: f64,
    #[serde(default)]
    pub justification: String,
}

#[async_trait]
pub trait Critic: Send + Sync {
    async fn critique(&self, candidate: &Candidate) -> Result<CriticVerdict, BackendError>;
}

/// Critic backed by a generation model that answers in JSON.
pub struct LlmCritic {
    backend: Arc<dyn GenerationBackend>,
    model: String,
    timeout: Duration,
}

impl LlmCritic {
    pub fn new(backend: Arc<dyn GenerationBackend>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            backend,
            model: model.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Critic for LlmCritic {
    async fn critique(&self, candidate: &Candidate) -> Result<CriticVerdict, BackendError> {
        let request = CompletionRequest::new(&self.model)
            .system(CRITIC_SYSTEM_PROMPT)
            .user(format!("Candidate:\n{}", candidate.payload))
            .temperature(0.0);
        let completion = call_with_timeout(self.backend.as_ref(), request, self.timeout).await?;
        parse_verdict(&completion.text)
    }
}

/// Parse a `{score, justification}` object, tolerating surrounding prose or
/// a markdown code fence.
pub fn parse_verdict(text: &str) -> Result<CriticVerdict, BackendError> {
    let start = text.find('{');
    let end = text.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &text[s..=e],
        _ => {
            return Err(BackendError::MalformedResponse(format!(
                "no JSON object in critic reply: {:?}",
                text.chars().take(80).collect::<String>()
            )))
        }
    };
    let verdict: CriticVerdict = serde_json::from_str(json)
        .map_err(|e| BackendError::MalformedResponse(format!("bad critic JSON: {e}")))?;
    if !verdict.score.is_finite() {
        return Err(BackendError::MalformedResponse(
            "critic score is not a finite number".into(),
        ));
    }
    Ok(verdict)
}

/// Tier 3 wrapper. Pass iff the (clamped) score reaches the threshold.
#[derive(Clone)]
pub struct CriticTier {
    critic: Arc<dyn Critic>,
    pass_threshold: f64,
}

impl CriticTier {
    pub fn new(critic: Arc<dyn Critic>, pass_threshold: f64) -> Self {
        Self {
            critic,
            pass_threshold,
        }
    }

    pub async fn run(&self, candidate: &Candidate) -> TierOutcome {
        match self.critic.critique(candidate).await {
            Ok(verdict) => {
                let score = verdict.score.clamp(0.0, 1.0);
                TierOutcome::ran(score >= self.pass_threshold, score, verdict.justification)
            }
            Err(e) => TierOutcome::ran(false, 0.0, format!("critic error: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::ScriptedBackend;

    fn critic_with(reply: &str) -> CriticTier {
        let backend = Arc::new(ScriptedBackend::constant(reply));
        let critic = LlmCritic::new(backend, "critic-model", Duration::from_secs(5));
        CriticTier::new(Arc::new(critic), 0.5)
    }

    #[test]
    fn parses_fenced_json() {
        let reply = "Here you go:\n```json\n{\"score\": 0.8, \"justification\": \"solid\"}\n```";
        let verdict = parse_verdict(reply).unwrap();
        assert_eq!(verdict.score, 0.8);
        assert_eq!(verdict.justification, "solid");
    }

    #[test]
    fn rejects_missing_object() {
        assert!(matches!(
            parse_verdict("looks fine to me"),
            Err(BackendError::MalformedResponse(_))
        ));
    }

    #[tokio::test]
    async fn threshold_decides_pass() {
        let out = critic_with(r#"{"score": 0.5, "justification": "ok"}"#)
            .run(&Candidate::new("x = 1", 0))
            .await;
        assert_eq!(out.passed(), Some(true));

        let out = critic_with(r#"{"score": 0.49, "justification": "meh"}"#)
            .run(&Candidate::new("x = 1", 0))
            .await;
        assert_eq!(out.passed(), Some(false));
        assert_eq!(out.score(), Some(0.49));
    }

    #[tokio::test]
    async fn out_of_range_scores_are_clamped() {
        let out = critic_with(r#"{"score": 7, "justification": "wow"}"#)
            .run(&Candidate::new("x = 1", 0))
            .await;
        assert_eq!(out.score(), Some(1.0));
    }

    #[tokio::test]
    async fn malformed_reply_becomes_failing_zero() {
        let out = critic_with("not json at all")
            .run(&Candidate::new("x = 1", 0))
            .await;
        assert_eq!(out.score(), Some(0.0));
        assert_eq!(out.passed(), Some(false));
        assert!(out.detail().starts_with("critic error:"));
    }

    #[tokio::test]
    async fn backend_failure_becomes_failing_zero() {
        let backend = Arc::new(ScriptedBackend::failing("quota exceeded"));
        let critic = LlmCritic::new(backend, "critic-model", Duration::from_secs(5));
        let out = CriticTier::new(Arc::new(critic), 0.5)
            .run(&Candidate::new("x = 1", 0))
            .await;
        assert_eq!(out.score(), Some(0.0));
        assert!(out.detail().contains("quota exceeded"));
    }
}
