//! Scheduler behaviour over whole task trees.
//!
//! These tests verify dispatch order, fan-out/fan-in, the worker bound,
//! and how failures travel up the tree.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::StreamExt;

use phasepool::core::TaskId;
use phasepool::orchestration::{Scheduler, SchedulerEvent};

use crate::fixtures::{
    entries, journal, position, Fan, Fault, Gauge, Node, SchedulerHarness, Steps,
};

/// Test: Phases run in order, one per dispatch
/// Given a task with 3 phases and no children
/// When it runs to completion
/// Then exactly 3 dispatches happen with phases 0, 1, 2
#[tokio::test]
async fn test_phases_dispatch_in_order() {
    let mut harness = SchedulerHarness::new(2);
    harness.scheduler.submit([Steps { ran: Vec::new() }]);

    let resolved = harness.scheduler.next().await.unwrap();
    assert!(harness.scheduler.next().await.is_none());
    assert_eq!(resolved.task::<Steps>().unwrap().ran, vec![0, 1, 2]);
    assert_eq!(harness.scheduler.dispatched(), 3);

    let phases: Vec<usize> = harness
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            SchedulerEvent::PhaseDispatched { task, phase, .. } if task == resolved.id => {
                Some(phase)
            }
            _ => None,
        })
        .collect();
    assert_eq!(phases, vec![0, 1, 2]);
}

/// Test: Three independent roots on one worker
/// Given 3 two-phase roots and a pool of 1
/// When the scheduler drains
/// Then 6 dispatches happen and each root is yielded exactly once
#[tokio::test]
async fn test_three_roots_single_worker() {
    let log = journal();
    let mut harness = SchedulerHarness::new(1);
    harness.scheduler.submit_boxed(
        ["r1", "r2", "r3"]
            .into_iter()
            .map(|name| Node::Fan(name, Vec::new()).build(&log)),
    );

    let mut seen = HashSet::new();
    while let Some(resolved) = harness.scheduler.next().await {
        assert!(!resolved.is_failed());
        assert!(seen.insert(resolved.id), "root yielded twice");
    }
    assert_eq!(seen.len(), 3);
    assert_eq!(harness.scheduler.dispatched(), 6);
    // Continuations go to the queue front, so each root finishes first.
    assert_eq!(
        entries(&log),
        vec!["r1:0", "r1:1", "r2:0", "r2:1", "r3:0", "r3:1"]
    );
}

/// Test: Root resumes only after both children
/// Given a root that spawns 2 single-phase children of different length
/// When it runs on 2 workers
/// Then the root's second phase runs last and sees both children in
/// completion order
#[tokio::test]
async fn test_fan_out_fan_in() {
    let log = journal();
    let mut harness = SchedulerHarness::new(2);
    harness.scheduler.submit_boxed([Node::Fan(
        "root",
        vec![Node::Leaf("slow", 80), Node::Leaf("fast", 5)],
    )
    .build(&log)]);

    let resolved = harness.scheduler.next().await.unwrap();
    let root = resolved.task::<Fan>().unwrap();
    assert_eq!(root.collected, vec!["fast", "slow"]);
    assert_eq!(entries(&log), vec!["root:0", "fast", "slow", "root:1"]);
    assert_eq!(harness.scheduler.dispatched(), 4);

    // Phase 1 of the root is dispatched only after the last fan-in.
    let events = harness.drain_events();
    let fanned_in: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, SchedulerEvent::FannedIn { .. }))
        .map(|(i, _)| i)
        .collect();
    let resumed = events
        .iter()
        .position(|e| {
            matches!(e, SchedulerEvent::PhaseDispatched { task, phase: 1, .. } if *task == resolved.id)
        })
        .unwrap();
    assert_eq!(fanned_in.len(), 2);
    assert!(fanned_in.iter().all(|&i| i < resumed));
    assert!(events.iter().any(|e| matches!(
        e,
        SchedulerEvent::FannedIn { remaining: 0, .. }
    )));
}

/// Test: Three-level tree resolves bottom-up
/// Given root -> 2 mids -> 2 leaves each
/// When the scheduler drains
/// Then every leaf finishes before its mid resumes, and both mids before
/// the root resumes
#[tokio::test]
async fn test_three_level_tree() {
    let log = journal();
    let mut harness = SchedulerHarness::new(3);
    harness.scheduler.submit_boxed([Node::Fan(
        "root",
        vec![
            Node::Fan("left", vec![Node::Leaf("l1", 20), Node::Leaf("l2", 5)]),
            Node::Fan("right", vec![Node::Leaf("r1", 5), Node::Leaf("r2", 20)]),
        ],
    )
    .build(&log)]);

    let resolved = harness.scheduler.next().await.unwrap();
    assert!(harness.scheduler.next().await.is_none());
    assert_eq!(resolved.task::<Fan>().unwrap().collected.len(), 2);

    let log = entries(&log);
    assert_eq!(log.len(), 10);
    for (leaf, mid) in [("l1", "left"), ("l2", "left"), ("r1", "right"), ("r2", "right")] {
        assert!(position(&log, leaf) < position(&log, &format!("{}:1", mid)));
        assert!(position(&log, &format!("{}:0", mid)) < position(&log, leaf));
    }
    assert_eq!(log.last().unwrap(), "root:1");
    assert_eq!(harness.scheduler.waiting(), 0);
}

/// Test: In-flight never exceeds the worker count
/// Given 10 sleeping tasks and a pool of 3
/// When the scheduler drains
/// Then at most 3 run at any moment
#[tokio::test]
async fn test_in_flight_bounded_by_pool() {
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut scheduler = Scheduler::new(3).unwrap();
    scheduler.submit((0..10).map(|_| Gauge {
        current: Arc::clone(&current),
        peak: Arc::clone(&peak),
        ms: 30,
    }));
    assert_eq!(scheduler.in_flight(), 3);
    assert_eq!(scheduler.queued(), 7);

    let mut resolved = 0;
    while scheduler.next().await.is_some() {
        assert!(scheduler.in_flight() <= 3);
        resolved += 1;
    }
    assert_eq!(resolved, 10);
    assert_eq!(peak.load(Ordering::SeqCst), 3);
    scheduler.shutdown().await;
}

/// Test: Empty submission
/// Given a scheduler with nothing submitted
/// When the stream is polled
/// Then it is exhausted immediately
#[tokio::test]
async fn test_empty_stream() {
    let scheduler = Scheduler::new(4).unwrap();
    let all: Vec<_> = scheduler.into_stream().collect().await;
    assert!(all.is_empty());
}

/// Test: Failures reconcile with submissions
/// Given one root that errors, one that panics, and one healthy root
/// When the scheduler drains
/// Then all 3 are yielded, the broken ones carry their failure, and the
/// children they spawned never run
#[tokio::test]
async fn test_failures_reconcile() {
    let log = journal();
    let mut harness = SchedulerHarness::new(2);
    harness.scheduler.submit_boxed([
        Node::Faulty("refuser", Fault::Error).build(&log),
        Node::Faulty("bomb", Fault::Panic).build(&log),
        Node::Fan("healthy", vec![Node::Leaf("leaf", 0)]).build(&log),
    ]);

    let mut failures = Vec::new();
    let mut total = 0;
    while let Some(resolved) = harness.scheduler.next().await {
        total += 1;
        if let Some(failure) = resolved.failure() {
            assert_eq!(failure.phase, 0);
            failures.push((resolved.label.clone(), failure.message.clone()));
        }
    }
    assert_eq!(total, 3);
    failures.sort();
    assert_eq!(failures.len(), 2);
    assert_eq!(failures[0].0, "bomb");
    assert!(failures[0].1.contains("bomb exploded"));
    assert_eq!(failures[1].0, "refuser");
    assert!(failures[1].1.contains("refuser refused"));

    let log = entries(&log);
    assert!(!log.contains(&"orphan".to_string()));
    assert!(!log.contains(&"refuser:1".to_string()));
    assert!(!log.contains(&"bomb:1".to_string()));

    let failed_events = harness
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, SchedulerEvent::PhaseFailed { .. }))
        .count();
    assert_eq!(failed_events, 2);
}

/// Test: Parents see failed children
/// Given a root whose children include a failing task and a zero-phase task
/// When the scheduler drains
/// Then the root still resumes, sees all three children and counts one
/// failure
#[tokio::test]
async fn test_parent_sees_failed_child() {
    let log = journal();
    let mut scheduler = Scheduler::new(2).unwrap();
    scheduler.submit_boxed([Node::Fan(
        "parent",
        vec![
            Node::Faulty("child", Fault::Error),
            Node::Leaf("ok", 0),
            Node::Empty,
        ],
    )
    .build(&log)]);

    let resolved = scheduler.next().await.unwrap();
    assert!(!resolved.is_failed());
    let parent = resolved.task::<Fan>().unwrap();
    assert_eq!(parent.collected.len(), 3);
    assert_eq!(parent.failed_children, 1);
    assert_eq!(entries(&log).last().unwrap(), "parent:1");
    scheduler.shutdown().await;
}

/// Test: Roots added while consuming
/// Given a scheduler that already yielded its only root
/// When more roots are added between next() calls
/// Then they are yielded by the same scheduler
#[tokio::test]
async fn test_add_more_while_consuming() {
    let mut scheduler = Scheduler::new(1).unwrap();
    scheduler.submit([Steps { ran: Vec::new() }]);
    let first: TaskId = scheduler.next().await.unwrap().id;

    scheduler.add_more([Steps { ran: Vec::new() }, Steps { ran: Vec::new() }]);
    let rest: Vec<TaskId> = scheduler.into_stream().map(|r| r.id).collect().await;
    assert_eq!(rest.len(), 2);
    assert!(!rest.contains(&first));
}
