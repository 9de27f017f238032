//! ProgramDb ranking and ScoreRegistry ordering guarantees.

use std::sync::Arc;

use chrono::Utc;
use vantage_core::fakes::scored_result;
use vantage_core::{ProgramDb, ScoreRegistry};
use vantage_state::{Candidate, EvaluationResult, JsonlScoreSink};

fn pair(id: &str, generation: u64, fitness: f64) -> (Candidate, EvaluationResult) {
    let candidate = Candidate::with_id(id, format!("payload {id}"), generation);
    let result = scored_result(&candidate, fitness);
    (candidate, result)
}

#[tokio::test]
async fn population_is_ranked_after_every_promotion() {
    let db = ProgramDb::in_memory();
    db.promote(vec![pair("a", 0, 0.2), pair("b", 0, 0.7)]).await.unwrap();
    db.promote(vec![pair("c", 1, 0.7), pair("d", 1, 0.9)]).await.unwrap();

    let best = db.get_best(10).await.unwrap();
    let ids: Vec<&str> = best.iter().map(|e| e.id().as_str()).collect();
    // ties break on lower generation first
    assert_eq!(ids, vec!["d", "b", "c", "a"]);
    assert!(db.get_best(0).await.unwrap().is_empty());
    assert_eq!(db.get_best(2).await.unwrap().len(), 2);
}

#[tokio::test]
async fn repromotion_replaces_by_id() {
    let db = ProgramDb::in_memory();
    db.promote(vec![pair("a", 0, 0.9)]).await.unwrap();
    db.promote(vec![pair("a", 1, 0.1), pair("b", 1, 0.5)]).await.unwrap();

    assert_eq!(db.len().await.unwrap(), 2);
    let best = db.get_best(2).await.unwrap();
    assert_eq!(best[0].id().as_str(), "b");
    assert_eq!(best[1].fitness(), 0.1);
    assert_eq!(best[1].candidate.generation, 1);
}

#[tokio::test]
async fn seeding_twice_is_idempotent() {
    let db = ProgramDb::in_memory();
    let baseline = vec![pair("x", 0, 0.3), pair("y", 0, 0.6)];
    assert_eq!(db.seed_or_load(Some(baseline.clone())).await.unwrap(), 2);
    assert_eq!(db.seed_or_load(Some(baseline)).await.unwrap(), 2);
    assert_eq!(db.get_best(1).await.unwrap()[0].id().as_str(), "y");
}

#[tokio::test]
async fn archive_keeps_reason_and_result() {
    let db = ProgramDb::in_memory();
    let (candidate, result) = pair("loser", 0, 0.1);
    db.archive_evaluated(candidate.clone(), result.clone(), "not selected")
        .await
        .unwrap();
    db.archive_failure(Candidate::with_id("empty", " ", 0), "invalid candidate: empty")
        .await
        .unwrap();

    let archived = db.archived().await.unwrap();
    assert_eq!(archived.len(), 2);
    assert_eq!(archived[0].result.as_ref(), Some(&result));
    assert!(archived[1].result.is_none());
    assert!(db.is_empty().await.unwrap());
}

#[tokio::test]
async fn log_scores_writes_one_record_per_result() {
    let registry = ScoreRegistry::in_memory();
    let before = Utc::now();
    let results: Vec<EvaluationResult> = (0..4).map(|i| pair(&format!("c{i}"), 0, 0.1).1).collect();

    assert_eq!(registry.log_scores(&results).await.unwrap(), 4);
    let records = registry.records().await.unwrap();
    assert_eq!(records.len(), 4);
    for (record, result) in records.iter().zip(&results) {
        assert_eq!(record.candidate_id, result.candidate_id);
        assert!(record.timestamp >= before);
    }
    // one timestamp per call
    assert!(records.iter().all(|r| r.timestamp == records[0].timestamp));
}

#[tokio::test]
async fn sequence_and_time_never_go_backwards() {
    let registry = ScoreRegistry::in_memory();
    for batch in 0..5 {
        let results: Vec<EvaluationResult> = (0..3)
            .map(|i| pair(&format!("b{batch}-{i}"), batch, 0.5).1)
            .collect();
        registry.log_scores(&results).await.unwrap();
    }
    let records = registry.records().await.unwrap();
    assert_eq!(records.len(), 15);
    assert!(records.windows(2).all(|w| w[0].seq + 1 == w[1].seq));
    assert!(records.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[tokio::test]
async fn concurrent_callers_get_contiguous_sequences() {
    let registry = Arc::new(ScoreRegistry::in_memory());
    let mut tasks = Vec::new();
    for caller in 0..6 {
        let registry = Arc::clone(&registry);
        tasks.push(tokio::spawn(async move {
            let results: Vec<EvaluationResult> = (0..4)
                .map(|i| pair(&format!("t{caller}-{i}"), 0, 0.5).1)
                .collect();
            registry.log_scores(&results).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let records = registry.records().await.unwrap();
    assert_eq!(records.len(), 24);
    for chunk in records.chunks(4) {
        let prefix = chunk[0].candidate_id.as_str().split('-').next().unwrap();
        assert!(chunk
            .iter()
            .all(|r| r.candidate_id.as_str().starts_with(&format!("{prefix}-"))));
    }
}

#[tokio::test]
async fn jsonl_registry_resumes_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scores.jsonl");

    let first = ScoreRegistry::open_jsonl(&path).await.unwrap();
    first
        .log_scores(&[pair("a", 0, 0.1).1, pair("b", 0, 0.2).1])
        .await
        .unwrap();

    let second = ScoreRegistry::open_jsonl(&path).await.unwrap();
    second.log_scores(&[pair("c", 1, 0.3).1]).await.unwrap();

    let records = ScoreRegistry::resume(Arc::new(JsonlScoreSink::new(&path)))
        .await
        .unwrap()
        .records()
        .await
        .unwrap();
    let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
    assert_eq!(seqs, vec![0, 1, 2]);
    assert!(records[1].timestamp <= records[2].timestamp);

    let raw = std::fs::read_to_string(&path).unwrap();
    assert_eq!(raw.lines().count(), 3);
}
