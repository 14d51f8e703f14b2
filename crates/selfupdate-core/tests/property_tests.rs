//! Property-based tests for the update gate

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use proptest::prelude::*;
use selfupdate_core::coordinator::{Coordinator, GateGuard, GateState};

#[derive(Debug, Clone, Copy)]
enum Op {
    EnterDownload,
    EnterApply,
    ReleaseOldest,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::EnterDownload),
        Just(Op::EnterApply),
        Just(Op::ReleaseOldest),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_at_most_one_holder(ops in prop::collection::vec(arb_op(), 1..64)) {
        let coordinator = Coordinator::new();
        let mut held: Vec<GateGuard<'_>> = Vec::new();

        for op in ops {
            match op {
                Op::EnterDownload => {
                    let was_idle = coordinator.is_idle();
                    let guard = coordinator.try_enter_download();
                    prop_assert_eq!(guard.is_some(), was_idle);
                    held.extend(guard);
                }
                Op::EnterApply => {
                    let was_idle = coordinator.is_idle();
                    let guard = coordinator.try_enter_apply();
                    prop_assert_eq!(guard.is_some(), was_idle);
                    held.extend(guard);
                }
                Op::ReleaseOldest => {
                    if !held.is_empty() {
                        drop(held.remove(0));
                    }
                }
            }

            prop_assert!(held.len() <= 1);
            let expected = held.first().map(|g| g.held()).unwrap_or(GateState::Idle);
            prop_assert_eq!(coordinator.state(), expected);
        }

        drop(held);
        prop_assert!(coordinator.is_idle());
    }

    #[test]
    fn prop_concurrent_entry_never_overlaps(
        tasks in 2usize..16,
        rounds in 1usize..20,
    ) {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))?;

        let max_seen = rt.block_on(async {
            let coordinator = Coordinator::shared();
            let inside = Arc::new(AtomicUsize::new(0));
            let max_seen = Arc::new(AtomicUsize::new(0));

            let handles: Vec<_> = (0..tasks)
                .map(|i| {
                    let coordinator = coordinator.clone();
                    let inside = inside.clone();
                    let max_seen = max_seen.clone();
                    tokio::spawn(async move {
                        for _ in 0..rounds {
                            let guard = if i % 2 == 0 {
                                coordinator.try_enter_download()
                            } else {
                                coordinator.try_enter_apply()
                            };
                            if let Some(_guard) = guard {
                                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                                max_seen.fetch_max(now, Ordering::SeqCst);
                                tokio::task::yield_now().await;
                                inside.fetch_sub(1, Ordering::SeqCst);
                            } else {
                                tokio::task::yield_now().await;
                            }
                        }
                    })
                })
                .collect();

            for result in futures::future::join_all(handles).await {
                assert!(result.is_ok(), "entry task panicked");
            }
            assert!(coordinator.is_idle());
            max_seen.load(Ordering::SeqCst)
        });

        prop_assert!(max_seen <= 1, "{} holders at once", max_seen);
    }
}

#[test]
fn test_thread_stress_mutual_exclusion() {
    let coordinator = Coordinator::shared();
    let inside = Arc::new(AtomicUsize::new(0));
    let violations = Arc::new(AtomicUsize::new(0));
    let entries = Arc::new(AtomicUsize::new(0));

    let threads: Vec<_> = (0..8)
        .map(|i| {
            let coordinator = coordinator.clone();
            let inside = inside.clone();
            let violations = violations.clone();
            let entries = entries.clone();
            std::thread::spawn(move || {
                for _ in 0..2_000 {
                    let guard = if i % 2 == 0 {
                        coordinator.try_enter_download()
                    } else {
                        coordinator.try_enter_apply()
                    };
                    if let Some(_guard) = guard {
                        entries.fetch_add(1, Ordering::SeqCst);
                        if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                            violations.fetch_add(1, Ordering::SeqCst);
                        }
                        std::thread::sleep(Duration::from_micros(1));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                }
            })
        })
        .collect();

    for thread in threads {
        assert!(thread.join().is_ok());
    }

    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert!(entries.load(Ordering::SeqCst) > 0);
    assert!(coordinator.is_idle());
}
