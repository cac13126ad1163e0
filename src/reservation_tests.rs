//! Reservation engine tests.
//!
//! These cover the reserve → wait → release lifecycle against a fixed
//! in-memory catalog, with no MySQL or Redis required:
//!
//! - **Immediate path** — highest-weight idle assignment wins; the full GPU
//!   set is held as a group.
//! - **Queue path** — exhausted assignments enqueue; a release wakes the
//!   oldest waiter and `get_reserved` reports which assignment it was given.
//! - **Ordering** — strict FIFO within a model's queue.
//! - **Cleanup** — release drops every hold; a timed-out waiter leaves the
//!   hold table untouched; stale jobs whose waiters vanished are rolled back
//!   by the sweep instead of leaking GPUs.
//! - **Concurrency** — a multi-task reserve/release hammer asserting that no
//!   GPU is ever held by two requests at once.

use std::collections::HashMap;

use crate::catalog::{Assignment, AssignmentCatalog};
use crate::scheduler::{Engine, Reservation};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn assignment(name: &str, port: u16, gpu_ids: &[&str], weight: f64) -> Assignment {
    Assignment {
        name: name.to_string(),
        ip_addr: "10.0.0.1".to_string(),
        port,
        gpu_ids: gpu_ids.iter().map(|s| s.to_string()).collect(),
        weight,
    }
}

fn engine_with(models: Vec<(&str, Vec<Assignment>)>) -> Engine {
    let map: HashMap<String, Vec<Assignment>> = models
        .into_iter()
        .map(|(name, assignments)| (name.to_string(), assignments))
        .collect();
    Engine::new(AssignmentCatalog::fixed(map))
}

/// The catalog from the reference scenarios: one two-GPU assignment preferred
/// over one single-GPU assignment.
fn llama_engine() -> Engine {
    engine_with(vec![(
        "llama",
        vec![
            assignment("a", 4001, &["0", "1"], 2.0),
            assignment("b", 4002, &["2"], 1.0),
        ],
    )])
}

/// One model, one assignment, one GPU. The tightest queueing setup.
fn solo_engine() -> Engine {
    engine_with(vec![("solo", vec![assignment("only", 4001, &["0"], 1.0)])])
}

async fn expect_ready(engine: &Engine, model: &str, request_id: &str) -> Assignment {
    match engine.reserve(model, request_id).await.unwrap() {
        Reservation::Ready(a) => a,
        Reservation::Queued(_) => panic!("expected immediate reservation for {request_id}"),
    }
}

async fn expect_queued(
    engine: &Engine,
    model: &str,
    request_id: &str,
) -> tokio::sync::oneshot::Receiver<()> {
    match engine.reserve(model, request_id).await.unwrap() {
        Reservation::Queued(rx) => rx,
        Reservation::Ready(a) => panic!("expected {request_id} to queue, got {}", a.name),
    }
}

// ---------------------------------------------------------------------------
// Immediate path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn immediate_reserve_takes_highest_weight() {
    let engine = llama_engine();

    let a = expect_ready(&engine, "llama", "req-1").await;
    assert_eq!(a.name, "a");

    let snapshot = engine.compute().snapshot().await;
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot["0"], "req-1");
    assert_eq!(snapshot["1"], "req-1");
}

#[tokio::test]
async fn second_reserve_falls_back_to_lighter_assignment() {
    let engine = llama_engine();

    expect_ready(&engine, "llama", "req-1").await;
    let b = expect_ready(&engine, "llama", "req-2").await;
    assert_eq!(b.name, "b");

    let snapshot = engine.compute().snapshot().await;
    assert_eq!(snapshot["2"], "req-2");
    assert_eq!(snapshot.len(), 3);
}

#[tokio::test]
async fn empty_request_id_is_rejected() {
    let engine = llama_engine();
    assert!(engine.reserve("llama", "").await.is_err());
}

#[tokio::test]
async fn unknown_model_queues_instead_of_failing() {
    let engine = llama_engine();

    let _rx = expect_queued(&engine, "ghost", "req-1").await;
    assert_eq!(engine.queue_depth("ghost").await, 1);

    engine.abandon("ghost", "req-1").await;
    assert_eq!(engine.queue_depth("ghost").await, 0);
}

// ---------------------------------------------------------------------------
// Queue path and wake-on-release
// ---------------------------------------------------------------------------

#[tokio::test]
async fn release_wakes_waiter_onto_freed_assignment() {
    let engine = llama_engine();

    expect_ready(&engine, "llama", "req-1").await; // holds a (0,1)
    expect_ready(&engine, "llama", "req-2").await; // holds b (2)
    let rx3 = expect_queued(&engine, "llama", "req-3").await;

    let freed = engine.release("req-1").await;
    assert_eq!(freed, vec!["0", "1"]);

    // The sweep fired the signal before release returned.
    rx3.await.expect("waiter should have been woken");

    let a = engine.get_reserved("llama", "req-3").await.unwrap();
    assert_eq!(a.name, "a");

    let snapshot = engine.compute().snapshot().await;
    assert_eq!(snapshot["0"], "req-3");
    assert_eq!(snapshot["1"], "req-3");
    assert_eq!(snapshot["2"], "req-2");
    assert_eq!(engine.queue_depth("llama").await, 0);
}

#[tokio::test]
async fn waiters_are_served_in_arrival_order() {
    let engine = solo_engine();

    expect_ready(&engine, "solo", "req-1").await;
    let rx2 = expect_queued(&engine, "solo", "req-2").await;
    let mut rx3 = expect_queued(&engine, "solo", "req-3").await;

    engine.release("req-1").await;

    rx2.await.expect("oldest waiter wakes first");
    assert!(
        rx3.try_recv().is_err(),
        "younger waiter must not be woken by the same release"
    );
    let got = engine.get_reserved("solo", "req-2").await.unwrap();
    assert_eq!(got.name, "only");

    engine.release("req-2").await;
    rx3.await.expect("next release serves the next waiter");
    assert!(engine.get_reserved("solo", "req-3").await.is_ok());
}

#[tokio::test]
async fn one_release_wakes_at_most_one_waiter_per_model() {
    let engine = solo_engine();

    expect_ready(&engine, "solo", "req-1").await;
    let rx2 = expect_queued(&engine, "solo", "req-2").await;
    let _rx3 = expect_queued(&engine, "solo", "req-3").await;

    engine.release("req-1").await;
    rx2.await.unwrap();

    // req-3 is still waiting, and the single GPU belongs to req-2.
    assert_eq!(engine.queue_depth("solo").await, 1);
    let snapshot = engine.compute().snapshot().await;
    assert_eq!(snapshot["0"], "req-2");
}

// ---------------------------------------------------------------------------
// Cleanup paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn release_clears_every_hold_for_the_request() {
    let engine = llama_engine();

    expect_ready(&engine, "llama", "req-1").await;
    let freed = engine.release("req-1").await;

    assert_eq!(freed, vec!["0", "1"]);
    assert!(engine.compute().snapshot().await.is_empty());
}

#[tokio::test]
async fn abandoned_waiter_leaves_holds_unchanged() {
    let engine = solo_engine();

    expect_ready(&engine, "solo", "req-1").await;
    let rx2 = expect_queued(&engine, "solo", "req-2").await;
    drop(rx2); // deadline expiry drops the receiver

    let freed = engine.abandon("solo", "req-2").await;
    assert!(freed.is_empty());
    assert_eq!(engine.queue_depth("solo").await, 0);

    let snapshot = engine.compute().snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot["0"], "req-1");

    // Later releases find a clean queue and leak nothing.
    engine.release("req-1").await;
    assert!(engine.compute().snapshot().await.is_empty());
}

#[tokio::test]
async fn sweep_rolls_back_stale_job_and_serves_next() {
    let engine = solo_engine();

    expect_ready(&engine, "solo", "req-1").await;

    // req-2's waiter disappears without removing its job from the queue.
    let rx2 = expect_queued(&engine, "solo", "req-2").await;
    drop(rx2);
    let rx3 = expect_queued(&engine, "solo", "req-3").await;

    engine.release("req-1").await;

    // The sweep could not deliver to req-2, rolled its marks back, and served
    // req-3 instead.
    rx3.await.expect("live waiter should be served");
    let snapshot = engine.compute().snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot["0"], "req-3");
    assert_eq!(engine.queue_depth("solo").await, 0);
}

// ---------------------------------------------------------------------------
// get_reserved identity
// ---------------------------------------------------------------------------

#[tokio::test]
async fn get_reserved_requires_full_set_match() {
    // Two assignments sharing GPU "1": the holder of {0,1} must resolve to
    // the two-GPU assignment, not the one-GPU assignment it overlaps.
    let engine = engine_with(vec![(
        "overlap",
        vec![
            assignment("wide", 4001, &["0", "1"], 2.0),
            assignment("narrow", 4002, &["1"], 1.0),
        ],
    )]);

    let got = expect_ready(&engine, "overlap", "req-1").await;
    assert_eq!(got.name, "wide");

    let resolved = engine.get_reserved("overlap", "req-1").await.unwrap();
    assert_eq!(resolved.name, "wide");
}

#[tokio::test]
async fn get_reserved_without_hold_is_an_error() {
    let engine = llama_engine();
    let err = engine.get_reserved("llama", "req-1").await.unwrap_err();
    assert!(err.to_string().contains("no reservation"));
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reserve_release_never_double_books() {
    let engine = engine_with(vec![(
        "m",
        vec![
            assignment("a", 4001, &["g0", "g1"], 2.0),
            assignment("b", 4002, &["g2"], 1.0),
        ],
    )]);

    let mut handles = Vec::new();
    for task in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            for round in 0..10 {
                let request_id = format!("req-{task}-{round}");

                let got = match engine.reserve("m", &request_id).await.unwrap() {
                    Reservation::Ready(a) => a,
                    Reservation::Queued(rx) => {
                        tokio::time::timeout(std::time::Duration::from_secs(5), rx)
                            .await
                            .expect("waiter starved")
                            .expect("waker dropped");
                        engine.get_reserved("m", &request_id).await.unwrap()
                    }
                };

                // Every GPU of the granted set belongs to this request and
                // nobody else, for as long as it is held.
                let snapshot = engine.compute().snapshot().await;
                for gpu in &got.gpu_ids {
                    assert_eq!(snapshot[gpu], request_id, "GPU {gpu} double-booked");
                }

                tokio::task::yield_now().await;
                let freed = engine.release(&request_id).await;
                assert_eq!(freed.len(), got.gpu_ids.len());
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    assert!(engine.compute().snapshot().await.is_empty());
    assert_eq!(engine.queue_depth("m").await, 0);
}
