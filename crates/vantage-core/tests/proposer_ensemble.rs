//! Proposer ensemble: pass shapes, lineage, failure isolation, concurrency.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use vantage_core::fakes::ScriptedBackend;
use vantage_core::{
    BackendError, Completion, CompletionRequest, GenerationBackend, MutationStrategies, Proposer,
    ProposerEnsemble, ProposerSettings, Seed, StrategyClass,
};
use vantage_state::CandidateId;

fn settings(refine: usize, concurrency: usize) -> ProposerSettings {
    ProposerSettings {
        breadth_model: "fast".into(),
        depth_model: "slow".into(),
        pro_refinement_count: refine,
        max_concurrent_requests: concurrency,
        timeout: Duration::from_secs(5),
    }
}

fn strategies(breadth: &[&str], depth: &[&str]) -> MutationStrategies {
    let mut s = MutationStrategies::new();
    s.insert(StrategyClass::Breadth, breadth.iter().map(|x| x.to_string()).collect());
    s.insert(StrategyClass::Depth, depth.iter().map(|x| x.to_string()).collect());
    s
}

/// Answers with the model name and prompt so outputs are traceable.
fn echoing_backend() -> ScriptedBackend {
    ScriptedBackend::from_fn(|req| {
        Ok(format!(
            "[{}] {}",
            req.model,
            req.last_user().unwrap_or_default()
        ))
    })
}

#[tokio::test]
async fn breadth_then_depth_over_selected_outputs() {
    let backend = Arc::new(echoing_backend());
    let ensemble = ProposerEnsemble::new(backend.clone(), settings(2, 4));
    let seeds = vec![Seed::from("sum"), Seed::from("product")];

    let out = ensemble
        .generate_candidates(&seeds, &strategies(&["mutate", "combine"], &["polish"]), 10, 3)
        .await
        .unwrap();

    // 2 seeds x 2 breadth strategies, then 2 selected x 1 depth strategy
    assert_eq!(out.len(), 6);
    assert_eq!(backend.call_count(), 6);
    assert!(out.iter().all(|c| c.generation == 3));

    let (breadth, depth) = out.split_at(4);
    assert!(breadth.iter().all(|c| c.payload.starts_with("[fast]")));
    assert!(breadth.iter().all(|c| c.parent_id.is_none()));
    assert_eq!(breadth[0].strategy.as_deref(), Some("mutate"));
    assert_eq!(breadth[1].strategy.as_deref(), Some("combine"));
    assert!(breadth[2].payload.contains("product"));

    assert!(depth.iter().all(|c| c.payload.starts_with("[slow]")));
    assert_eq!(depth[0].parent_id.as_ref(), Some(&breadth[0].id));
    assert_eq!(depth[1].parent_id.as_ref(), Some(&breadth[1].id));
    assert_eq!(depth[0].strategy.as_deref(), Some("polish"));
}

#[tokio::test]
async fn output_is_capped_at_n() {
    let backend = Arc::new(echoing_backend());
    let ensemble = ProposerEnsemble::new(backend.clone(), settings(2, 4));
    let seeds = vec![Seed::from("a"), Seed::from("b")];

    let out = ensemble
        .generate_candidates(&seeds, &strategies(&["s1", "s2"], &["d1"]), 3, 0)
        .await
        .unwrap();

    assert_eq!(out.len(), 3);
    assert!(out.iter().all(|c| c.payload.starts_with("[fast]")));
}

#[tokio::test]
async fn failed_calls_are_skipped_not_fatal() {
    let backend = Arc::new(ScriptedBackend::from_fn(|req| {
        let prompt = req.last_user().unwrap_or_default();
        if prompt.contains("broken") {
            Err(BackendError::Request("connection reset".into()))
        } else {
            Ok(format!("ok: {prompt}"))
        }
    }));
    let ensemble = ProposerEnsemble::new(backend, settings(0, 2));
    let seeds = vec![Seed::from("fine"), Seed::from("broken"), Seed::from("also fine")];

    let out = ensemble
        .generate_candidates(&seeds, &strategies(&["s"], &[]), 10, 0)
        .await
        .unwrap();

    assert_eq!(out.len(), 2);
    assert!(out[0].payload.contains("fine"));
    assert!(out[1].payload.contains("also fine"));
}

#[tokio::test]
async fn empty_completions_are_dropped() {
    let backend = Arc::new(ScriptedBackend::constant("   "));
    let ensemble = ProposerEnsemble::new(backend, settings(1, 2));
    let out = ensemble
        .generate_candidates(&["a".into()], &strategies(&["s"], &["d"]), 5, 0)
        .await
        .unwrap();
    assert!(out.is_empty());
}

#[tokio::test(start_paused = true)]
async fn slow_calls_time_out_and_are_skipped() {
    let backend = Arc::new(ScriptedBackend::constant("late").with_delay(Duration::from_secs(60)));
    let mut s = settings(0, 2);
    s.timeout = Duration::from_secs(1);
    let ensemble = ProposerEnsemble::new(backend.clone(), s);

    let out = ensemble
        .generate_candidates(&["a".into(), "b".into()], &strategies(&["s"], &[]), 5, 0)
        .await
        .unwrap();

    assert!(out.is_empty());
    assert_eq!(backend.call_count(), 2);
}

#[tokio::test]
async fn separate_backends_serve_each_pass() {
    let fast = Arc::new(ScriptedBackend::constant("draft"));
    let slow = Arc::new(ScriptedBackend::constant("refined"));
    let ensemble = ProposerEnsemble::with_backends(fast.clone(), slow.clone(), settings(1, 2));

    let out = ensemble
        .generate_candidates(&["a".into()], &strategies(&["s"], &["d1", "d2"]), 5, 0)
        .await
        .unwrap();

    let payloads: Vec<&str> = out.iter().map(|c| c.payload.as_str()).collect();
    assert_eq!(payloads, vec!["draft", "refined", "refined"]);
    assert_eq!(fast.call_count(), 1);
    assert_eq!(slow.call_count(), 2);
    assert!(slow.calls().iter().all(|r| r.model == "slow"));
}

#[tokio::test]
async fn elite_seeds_carry_lineage() {
    let backend = Arc::new(ScriptedBackend::constant("child"));
    let ensemble = ProposerEnsemble::new(backend, settings(0, 2));
    let parent = CandidateId::from("elite-1");
    let seeds = vec![Seed::refine("def f(): return 1", parent.clone())];

    let out = ensemble
        .generate_candidates(&seeds, &strategies(&["s"], &[]), 5, 4)
        .await
        .unwrap();

    assert_eq!(out.len(), 1);
    assert_eq!(out[0].parent_id, Some(parent));
}

/// Tracks how many calls are in flight at once.
struct GaugedBackend {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl GenerationBackend for GaugedBackend {
    async fn complete(&self, _request: CompletionRequest) -> Result<Completion, BackendError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(Completion::text("x = 1"))
    }
}

#[tokio::test(start_paused = true)]
async fn concurrency_is_bounded_by_semaphore() {
    let backend = Arc::new(GaugedBackend {
        in_flight: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let ensemble = ProposerEnsemble::new(backend.clone(), settings(0, 2));
    let seeds: Vec<Seed> = (0..6).map(|i| Seed::from(format!("seed {i}"))).collect();

    let out = ensemble
        .generate_candidates(&seeds, &strategies(&["s"], &[]), 6, 0)
        .await
        .unwrap();

    assert_eq!(out.len(), 6);
    let peak = backend.peak.load(Ordering::SeqCst);
    assert!(peak >= 1 && peak <= 2, "peak concurrency {peak}");
}
