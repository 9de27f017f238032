//! Data model shared by the evolution loop and its stores.
//!
//! - `Candidate`: an immutable proposed artifact (code or text)
//! - `EvaluationResult`: the cascade's verdict on one candidate, produced once
//! - `PopulationEntry`: a promoted candidate with its latest result
//! - `ArchiveRecord`: a rejected candidate kept for post-mortem analysis
//! - `AuditRecord`: flattened, timestamped snapshot of an `EvaluationResult`

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Opaque, unique candidate identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateId(pub String);

impl CandidateId {
    /// Allocate a fresh random id.
    pub fn generate() -> Self {
        CandidateId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 8 chars) for log lines.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl std::fmt::Display for CandidateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CandidateId {
    fn from(s: &str) -> Self {
        CandidateId(s.to_string())
    }
}

impl From<String> for CandidateId {
    fn from(s: String) -> Self {
        CandidateId(s)
    }
}

/// Whether a payload can be run against a behavioral oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Code,
    Text,
}

const CODE_LINE_PREFIXES: &[&str] = &[
    "def ",
    "class ",
    "import ",
    "fn ",
    "pub fn ",
    "impl ",
    "struct ",
    "function ",
    "#include",
];

/// Keywords that open a block when the line ends in `:`.
const BLOCK_KEYWORDS: &[&str] = &[
    "if", "elif", "else", "for", "while", "try", "except", "finally", "with", "async",
];

const FLOW_KEYWORDS: &[&str] = &["return", "raise", "yield"];

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

/// `if n < 2:`, `else:`, `for i in range(3):`
fn is_block_header(line: &str) -> bool {
    line.ends_with(':')
        && BLOCK_KEYWORDS.iter().any(|k| {
            line.strip_prefix(k)
                .is_some_and(|rest| rest.starts_with(&[' ', ':', '('][..]))
        })
}

/// `return a + b`, `raise ValueError(...)`, bare `yield`
fn is_flow_statement(line: &str) -> bool {
    FLOW_KEYWORDS.iter().any(|k| {
        line.strip_prefix(k)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with(&[' ', '('][..]))
    })
}

/// `x = 1`, `self.total = 0`; comparisons like `a == b` do not count.
fn is_assignment(line: &str) -> bool {
    let Some((target, value)) = line.split_once('=') else {
        return false;
    };
    !value.starts_with('=') && !value.trim().is_empty() && is_identifier(target.trim_end())
}

/// `print(x + 1)`, `main()`
fn is_call(line: &str) -> bool {
    match line.split_once('(') {
        Some((callee, _)) => line.ends_with(')') && is_identifier(callee),
        None => false,
    }
}

impl PayloadKind {
    /// Classify a payload by looking for source-code line shapes.
    ///
    /// A declaration keyword, a statement/block delimiter, a block header,
    /// a flow statement, an assignment or a bare call on any line marks the
    /// payload as code.
    pub fn infer(payload: &str) -> Self {
        let looks_like_code = payload.lines().map(str::trim).any(|line| {
            CODE_LINE_PREFIXES.iter().any(|p| line.starts_with(p))
                || (line.starts_with("from ") && line.contains(" import "))
                || (line.len() > 1 && (line.ends_with(';') || line.ends_with('{')))
                || (line.starts_with('}') && line.len() <= 2)
                || is_block_header(line)
                || is_flow_statement(line)
                || is_assignment(line)
                || is_call(line)
        });
        if looks_like_code {
            PayloadKind::Code
        } else {
            PayloadKind::Text
        }
    }
}

/// A proposed solution. The payload is never modified after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: CandidateId,
    pub payload: String,
    /// Iteration that produced this candidate.
    pub generation: u64,
    /// Lineage: the candidate this one was derived from, if any.
    pub parent_id: Option<CandidateId>,
    pub kind: PayloadKind,
    /// Mutation strategy that produced the payload.
    pub strategy: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Candidate {
    /// Create a candidate with a freshly allocated id.
    pub fn new(payload: impl Into<String>, generation: u64) -> Self {
        Self::with_id(CandidateId::generate(), payload, generation)
    }

    /// Create a candidate with a caller-chosen id.
    pub fn with_id(id: impl Into<CandidateId>, payload: impl Into<String>, generation: u64) -> Self {
        let payload = payload.into();
        Self {
            id: id.into(),
            kind: PayloadKind::infer(&payload),
            payload,
            generation,
            parent_id: None,
            strategy: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_parent(mut self, parent_id: CandidateId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = Some(strategy.into());
        self
    }

    /// Override the inferred payload kind.
    pub fn with_kind(mut self, kind: PayloadKind) -> Self {
        self.kind = kind;
        self
    }

    /// SHA-256 hex digest of the payload.
    pub fn payload_digest(&self) -> String {
        hex::encode(Sha256::digest(self.payload.as_bytes()))
    }
}

/// Evaluation tiers, in cascade order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Heuristics,
    Verification,
    Critic,
    HumanReview,
}

impl Tier {
    /// Scoring tiers in the order the cascade runs them.
    pub const SCORED: [Tier; 3] = [Tier::Heuristics, Tier::Verification, Tier::Critic];

    /// 1-based position in the cascade.
    pub fn number(self) -> u8 {
        match self {
            Tier::Heuristics => 1,
            Tier::Verification => 2,
            Tier::Critic => 3,
            Tier::HumanReview => 4,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Tier::Heuristics => "heuristics",
            Tier::Verification => "verification",
            Tier::Critic => "critic",
            Tier::HumanReview => "human_review",
        };
        write!(f, "tier{}:{}", self.number(), name)
    }
}

/// What happened when a tier was reached.
///
/// A tier that was never reached (the cascade halted earlier) has no outcome
/// at all; `Skipped` means the tier was reached but chose not to score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TierOutcome {
    Passed { score: f64, justification: String },
    Failed { score: f64, justification: String },
    Skipped { reason: String },
}

impl TierOutcome {
    /// Build a ran-pass or ran-fail outcome; the score is clamped to [0, 1].
    pub fn ran(passed: bool, score: f64, justification: impl Into<String>) -> Self {
        let score = if score.is_finite() {
            score.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let justification = justification.into();
        if passed {
            TierOutcome::Passed {
                score,
                justification,
            }
        } else {
            TierOutcome::Failed {
                score,
                justification,
            }
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        TierOutcome::Skipped {
            reason: reason.into(),
        }
    }

    pub fn score(&self) -> Option<f64> {
        match self {
            TierOutcome::Passed { score, .. } | TierOutcome::Failed { score, .. } => Some(*score),
            TierOutcome::Skipped { .. } => None,
        }
    }

    pub fn passed(&self) -> Option<bool> {
        match self {
            TierOutcome::Passed { .. } => Some(true),
            TierOutcome::Failed { .. } => Some(false),
            TierOutcome::Skipped { .. } => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, TierOutcome::Failed { .. })
    }

    pub fn detail(&self) -> &str {
        match self {
            TierOutcome::Passed { justification, .. }
            | TierOutcome::Failed { justification, .. } => justification,
            TierOutcome::Skipped { reason } => reason,
        }
    }
}

/// The cascade's verdict on one candidate. Produced once per evaluation pass;
/// a re-evaluation yields a new result rather than an update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub candidate_id: CandidateId,
    pub generation: u64,
    /// SHA-256 of the evaluated payload.
    pub payload_digest: String,
    /// Outcomes of the scoring tiers that were reached.
    pub tiers: BTreeMap<Tier, TierOutcome>,
    /// Weighted composite, rounded to 3 decimals, within [0, 1].
    pub final_fitness_score: f64,
    pub requires_human_review: bool,
    /// Why the candidate was flagged for review, if it was.
    pub review_reason: Option<String>,
    /// Tier whose failure stopped the cascade early.
    pub halted_at: Option<Tier>,
    pub evaluated_at: DateTime<Utc>,
}

impl EvaluationResult {
    pub fn outcome(&self, tier: Tier) -> Option<&TierOutcome> {
        self.tiers.get(&tier)
    }

    /// Score of a tier; `None` when the tier was skipped or never reached.
    pub fn score(&self, tier: Tier) -> Option<f64> {
        self.tiers.get(&tier).and_then(TierOutcome::score)
    }

    /// Pass flag of a tier; `None` when the tier was skipped or never reached.
    pub fn passed(&self, tier: Tier) -> Option<bool> {
        self.tiers.get(&tier).and_then(TierOutcome::passed)
    }

    pub fn justification(&self, tier: Tier) -> Option<&str> {
        self.tiers.get(&tier).map(TierOutcome::detail)
    }

    /// Whether the cascade halted before running every tier.
    pub fn stopped_early(&self) -> bool {
        self.halted_at.is_some()
    }

    /// Population ordering: higher fitness first, then lower generation,
    /// then id. Fitness uses IEEE total ordering so NaN can never panic a sort.
    pub fn rank_cmp(&self, other: &Self) -> Ordering {
        other
            .final_fitness_score
            .total_cmp(&self.final_fitness_score)
            .then_with(|| self.generation.cmp(&other.generation))
            .then_with(|| self.candidate_id.cmp(&other.candidate_id))
    }
}

/// A promoted candidate and its latest evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopulationEntry {
    pub candidate: Candidate,
    pub result: EvaluationResult,
    pub promoted_at: DateTime<Utc>,
}

impl PopulationEntry {
    pub fn new(candidate: Candidate, result: EvaluationResult) -> Self {
        Self {
            candidate,
            result,
            promoted_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &CandidateId {
        &self.candidate.id
    }

    pub fn fitness(&self) -> f64 {
        self.result.final_fitness_score
    }
}

/// Sort a population in place by the ranking invariant.
pub fn sort_population(entries: &mut [PopulationEntry]) {
    entries.sort_by(|a, b| a.result.rank_cmp(&b.result));
}

/// A rejected candidate kept outside the ranked population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub candidate: Candidate,
    pub reason: String,
    /// Present when the candidate was evaluated before being rejected.
    pub result: Option<EvaluationResult>,
    pub archived_at: DateTime<Utc>,
}

impl ArchiveRecord {
    pub fn new(candidate: Candidate, reason: impl Into<String>) -> Self {
        Self {
            candidate,
            reason: reason.into(),
            result: None,
            archived_at: Utc::now(),
        }
    }

    pub fn with_result(mut self, result: EvaluationResult) -> Self {
        self.result = Some(result);
        self
    }

    pub fn requires_human_review(&self) -> bool {
        self.result
            .as_ref()
            .map(|r| r.requires_human_review)
            .unwrap_or(false)
    }
}

/// Where a review-flagged candidate currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewLocation {
    Population,
    Archive,
}

/// A candidate awaiting manual inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    pub candidate: Candidate,
    pub result: EvaluationResult,
    pub location: ReviewLocation,
}

/// Flattened, timestamped snapshot of an `EvaluationResult` as written to
/// the audit log. One JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Monotonic sequence number within a registry.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub candidate_id: CandidateId,
    pub generation: u64,
    pub payload_digest: String,
    pub score_t1: Option<f64>,
    pub passed_t1: Option<bool>,
    pub details_t1: Option<String>,
    pub score_t2: Option<f64>,
    pub passed_t2: Option<bool>,
    pub details_t2: Option<String>,
    pub score_t3: Option<f64>,
    pub passed_t3: Option<bool>,
    pub details_t3: Option<String>,
    pub details_t4: Option<String>,
    pub final_fitness_score: f64,
    pub requires_human_review: bool,
    pub halted_at: Option<Tier>,
    pub evaluated_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn from_result(seq: u64, timestamp: DateTime<Utc>, result: &EvaluationResult) -> Self {
        let detail = |tier| result.justification(tier).map(str::to_string);
        Self {
            seq,
            timestamp,
            candidate_id: result.candidate_id.clone(),
            generation: result.generation,
            payload_digest: result.payload_digest.clone(),
            score_t1: result.score(Tier::Heuristics),
            passed_t1: result.passed(Tier::Heuristics),
            details_t1: detail(Tier::Heuristics),
            score_t2: result.score(Tier::Verification),
            passed_t2: result.passed(Tier::Verification),
            details_t2: detail(Tier::Verification),
            score_t3: result.score(Tier::Critic),
            passed_t3: result.passed(Tier::Critic),
            details_t3: detail(Tier::Critic),
            details_t4: result.review_reason.clone(),
            final_fitness_score: result.final_fitness_score,
            requires_human_review: result.requires_human_review,
            halted_at: result.halted_at,
            evaluated_at: result.evaluated_at,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Result with a fixed fitness and a single passing heuristics tier.
    pub fn result_for(candidate: &Candidate, fitness: f64) -> EvaluationResult {
        let mut tiers = BTreeMap::new();
        tiers.insert(Tier::Heuristics, TierOutcome::ran(true, fitness, "ok"));
        EvaluationResult {
            candidate_id: candidate.id.clone(),
            generation: candidate.generation,
            payload_digest: candidate.payload_digest(),
            tiers,
            final_fitness_score: fitness,
            requires_human_review: false,
            review_reason: None,
            halted_at: None,
            evaluated_at: Utc::now(),
        }
    }

    pub fn entry(id: &str, generation: u64, fitness: f64) -> PopulationEntry {
        let candidate = Candidate::with_id(id, format!("payload {id}"), generation);
        let result = result_for(&candidate, fitness);
        PopulationEntry::new(candidate, result)
    }
}
