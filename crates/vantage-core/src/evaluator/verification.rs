//! Tier 2: behavioral verification against an oracle.
//!
//! Only `PayloadKind::Code` candidates are verified; text payloads are
//! recorded as skipped, which is not a failure.

use std::io::Write;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::debug;
use vantage_state::{Candidate, PayloadKind, TierOutcome};

/// Decides whether a candidate behaves correctly. Implementations absorb
/// their own errors into a failing outcome.
#[async_trait]
pub trait BehaviorOracle: Send + Sync {
    async fn verify(&self, candidate: &Candidate) -> TierOutcome;
}

/// Simulated oracle: fails when the payload mentions a failure marker
/// (case-insensitive). Score is 1.0 on pass, 0.0 on fail.
#[derive(Debug, Clone)]
pub struct MarkerOracle {
    markers: Vec<String>,
}

impl MarkerOracle {
    pub fn new(markers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            markers: markers
                .into_iter()
                .map(|m| m.into().to_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }
}

impl Default for MarkerOracle {
    fn default() -> Self {
        Self::new(["error"])
    }
}

#[async_trait]
impl BehaviorOracle for MarkerOracle {
    async fn verify(&self, candidate: &Candidate) -> TierOutcome {
        let lowered = candidate.payload.to_lowercase();
        match self.markers.iter().find(|m| lowered.contains(m.as_str())) {
            Some(marker) => TierOutcome::ran(false, 0.0, format!("failure marker `{marker}` found")),
            None => TierOutcome::ran(true, 1.0, "no failure markers"),
        }
    }
}

/// Runs an external command against the payload.
///
/// The payload is written to a temp file whose path is appended as the last
/// argument. Exit status 0 passes; anything else, a spawn error or a timeout
/// fails with score 0.0.
#[derive(Debug, Clone)]
pub struct CommandOracle {
    command: Vec<String>,
    timeout: Duration,
}

/// Write the payload to a fresh temp file that is removed on drop.
fn write_payload(payload: &str) -> std::io::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("vantage-candidate-")
        .tempfile()?;
    file.write_all(payload.as_bytes())?;
    file.flush()?;
    Ok(file)
}

impl CommandOracle {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }

    async fn run(&self, candidate: &Candidate) -> Result<TierOutcome, String> {
        let (exe, args) = self
            .command
            .split_first()
            .ok_or_else(|| "verification command is empty".to_string())?;

        let payload = candidate.payload.clone();
        let file = tokio::task::spawn_blocking(move || write_payload(&payload))
            .await
            .map_err(|e| format!("payload writer failed: {e}"))?
            .map_err(|e| format!("failed to write payload file: {e}"))?;

        let child = Command::new(exe)
            .args(args)
            .arg(file.path())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to spawn `{exe}`: {e}"))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| format!("timed out after {}s", self.timeout.as_secs()))?
            .map_err(|e| format!("failed to wait for `{exe}`: {e}"))?;

        debug!(
            candidate = %candidate.id.short(),
            status = ?output.status.code(),
            "verification command finished"
        );

        if output.status.success() {
            return Ok(TierOutcome::ran(true, 1.0, "verification command exited 0"));
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: String = stderr.trim().chars().take(200).collect();
        Ok(TierOutcome::ran(
            false,
            0.0,
            format!(
                "verification command exited {}: {tail}",
                output.status.code().unwrap_or(-1)
            ),
        ))
    }
}

#[async_trait]
impl BehaviorOracle for CommandOracle {
    async fn verify(&self, candidate: &Candidate) -> TierOutcome {
        self.run(candidate)
            .await
            .unwrap_or_else(|reason| TierOutcome::ran(false, 0.0, reason))
    }
}

/// Tier 2 wrapper: skips non-code payloads, otherwise asks the oracle.
#[derive(Clone)]
pub struct VerificationTier {
    oracle: Arc<dyn BehaviorOracle>,
}

impl VerificationTier {
    pub fn new(oracle: Arc<dyn BehaviorOracle>) -> Self {
        Self { oracle }
    }

    pub async fn run(&self, candidate: &Candidate) -> TierOutcome {
        match candidate.kind {
            PayloadKind::Text => TierOutcome::skipped("payload is not executable code"),
            PayloadKind::Code => self.oracle.verify(candidate).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(payload: &str) -> Candidate {
        Candidate::new(payload, 0).with_kind(PayloadKind::Code)
    }

    #[tokio::test]
    async fn marker_oracle_is_case_insensitive() {
        let oracle = MarkerOracle::default();
        let out = oracle.verify(&code("raise ValueError('bad')")).await;
        assert_eq!(out.passed(), Some(false));
        assert_eq!(out.score(), Some(0.0));

        let out = oracle.verify(&code("def add(a, b): return a + b")).await;
        assert_eq!(out.passed(), Some(true));
        assert_eq!(out.score(), Some(1.0));
    }

    #[tokio::test]
    async fn text_payloads_are_skipped() {
        let tier = VerificationTier::new(Arc::new(MarkerOracle::default()));
        let prose = Candidate::new("An error-free essay about calculators.", 0);
        assert_eq!(prose.kind, PayloadKind::Text);

        let out = tier.run(&prose).await;
        assert!(matches!(out, TierOutcome::Skipped { .. }));
        assert!(!out.is_failure());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_oracle_uses_exit_status() {
        let pass = CommandOracle::new(vec!["true".into()], Duration::from_secs(5));
        assert_eq!(pass.verify(&code("x = 1")).await.passed(), Some(true));

        let fail = CommandOracle::new(vec!["false".into()], Duration::from_secs(5));
        let out = fail.verify(&code("x = 1")).await;
        assert_eq!(out.passed(), Some(false));
        assert!(out.detail().contains("exited 1"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_oracle_receives_payload_path() {
        let oracle = CommandOracle::new(
            vec!["sh".into(), "-c".into(), "grep -q 'return a + b' \"$0\"".into()],
            Duration::from_secs(5),
        );
        let out = oracle.verify(&code("def add(a, b):\n    return a + b")).await;
        assert_eq!(out.passed(), Some(true), "{}", out.detail());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "current_thread")]
    async fn concurrent_verifications_each_see_their_own_payload() {
        let oracle = Arc::new(CommandOracle::new(
            vec!["sh".into(), "-c".into(), "grep -q 'value = 7' \"$0\"".into()],
            Duration::from_secs(5),
        ));
        let payloads = ["value = 7", "value = 8", "x = 1\nvalue = 7", "value = 9"];
        let outcomes = futures::future::join_all(payloads.iter().map(|p| {
            let oracle = Arc::clone(&oracle);
            let candidate = code(p);
            async move { oracle.verify(&candidate).await.passed() }
        }))
        .await;
        assert_eq!(outcomes, vec![Some(true), Some(false), Some(true), Some(false)]);
    }

    #[test]
    fn payload_file_holds_exact_bytes() {
        let file = write_payload("line one\nline two").unwrap();
        let written = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(written, "line one\nline two");
        let path = file.path().to_path_buf();
        drop(file);
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_oracle_times_out() {
        let oracle = CommandOracle::new(
            vec!["sh".into(), "-c".into(), "sleep 5".into()],
            Duration::from_millis(100),
        );
        let out = oracle.verify(&code("x = 1")).await;
        assert_eq!(out.passed(), Some(false));
        assert!(out.detail().contains("timed out"));
    }

    #[tokio::test]
    async fn missing_executable_fails_without_panicking() {
        let oracle = CommandOracle::new(
            vec!["vantage-definitely-not-a-binary".into()],
            Duration::from_secs(1),
        );
        let out = oracle.verify(&code("x = 1")).await;
        assert_eq!(out.passed(), Some(false));
        assert!(out.detail().contains("failed to spawn"));
    }
}
