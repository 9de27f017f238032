//! Tier 1: static heuristics over the raw payload.

use std::sync::LazyLock;

use regex::Regex;
use vantage_state::TierOutcome;

const MARKER_PENALTY: f64 = 0.1;
const UNSAFE_PENALTY: f64 = 0.5;

static UNRESOLVED_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(TODO|FIXME|XXX)\b").expect("invalid marker regex"));

/// Unsafe system-call shapes, by display name.
static UNSAFE_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("os.system", r"\bos\.system\s*\("),
        ("subprocess shell=True", r"\bsubprocess\.\w+\([^)]*shell\s*=\s*True"),
        ("eval/exec", r"\b(eval|exec)\s*\("),
        ("rm -rf", r"\brm\s+-(rf|fr)\b"),
        ("std::process::Command", r"\bprocess::Command\b"),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).expect("invalid unsafe-call regex")))
    .collect()
});

/// Fast static checks. Starts from 1.0, subtracts 0.1 per distinct kind of
/// unresolved marker and 0.5 (plus a fail) if any unsafe call shape appears.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTier;

impl HeuristicTier {
    pub fn check(&self, payload: &str) -> TierOutcome {
        let mut score = 1.0;
        let mut findings = Vec::new();

        let mut markers: Vec<&str> = UNRESOLVED_MARKER
            .find_iter(payload)
            .map(|m| m.as_str())
            .collect();
        markers.sort_unstable();
        markers.dedup();
        if !markers.is_empty() {
            score -= MARKER_PENALTY * markers.len() as f64;
            findings.push(format!("unresolved markers: {}", markers.join(", ")));
        }

        let unsafe_hits: Vec<&str> = UNSAFE_PATTERNS
            .iter()
            .filter(|(_, re)| re.is_match(payload))
            .map(|(name, _)| *name)
            .collect();
        let passed = unsafe_hits.is_empty();
        if !passed {
            score -= UNSAFE_PENALTY;
            findings.push(format!("unsafe system calls: {}", unsafe_hits.join(", ")));
        }

        let justification = if findings.is_empty() {
            "no heuristic findings".to_string()
        } else {
            findings.join("; ")
        };
        TierOutcome::ran(passed, score, justification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_payload_scores_full() {
        let out = HeuristicTier.check("def add(a, b):\n    return a + b\n");
        assert_eq!(out.score(), Some(1.0));
        assert_eq!(out.passed(), Some(true));
    }

    #[test]
    fn markers_penalize_without_failing() {
        let out = HeuristicTier.check("# TODO: handle overflow\n# FIXME\n# TODO again\nx = 1");
        assert!((out.score().unwrap() - 0.8).abs() < 1e-9);
        assert_eq!(out.passed(), Some(true));
        assert!(out.detail().contains("FIXME, TODO"));
    }

    #[test]
    fn unsafe_calls_fail() {
        for payload in [
            "import os\nos.system('ls')",
            "subprocess.run(cmd, shell=True)",
            "result = eval(user_input)",
            "rm -rf /tmp/build",
            "let out = std::process::Command::new(\"sh\");",
        ] {
            let out = HeuristicTier.check(payload);
            assert_eq!(out.passed(), Some(false), "{payload}");
            assert!((out.score().unwrap() - 0.5).abs() < 1e-9, "{payload}");
        }
    }

    #[test]
    fn penalties_stack_once_per_kind() {
        let out = HeuristicTier.check("TODO FIXME XXX\nos.system('x')\neval(y)");
        assert!((out.score().unwrap() - 0.2).abs() < 1e-9);
        assert!(out.detail().contains("os.system, eval/exec"));
    }

    #[test]
    fn identifiers_containing_eval_are_not_flagged() {
        let out = HeuristicTier.check("def evaluate(x):\n    return x");
        assert_eq!(out.passed(), Some(true));
    }
}
