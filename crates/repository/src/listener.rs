//! Completion primitives for work fanned out across tasks.
//!
//! Two primitives: a single-shot [`Completion`] and a fan-in
//! [`GroupedCompletion`] that fires once all children have completed.
//! Both forward the first failure and never complete twice; sequencing is
//! native `async` and needs no primitive of its own.

use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::error::{RepositoryError, Result};

/// Completing side of a single-shot completion. Cloneable; the first
/// `complete` wins and later calls are ignored.
#[derive(Debug, Clone)]
pub struct Completion<T> {
    tx: Arc<Mutex<Option<oneshot::Sender<Result<T>>>>>,
}

/// Waiting side of a single-shot completion.
#[derive(Debug)]
pub struct CompletionFuture<T> {
    rx: oneshot::Receiver<Result<T>>,
}

/// Create a linked completion pair.
pub fn completion<T>() -> (Completion<T>, CompletionFuture<T>) {
    let (tx, rx) = oneshot::channel();
    (
        Completion {
            tx: Arc::new(Mutex::new(Some(tx))),
        },
        CompletionFuture { rx },
    )
}

impl<T> Completion<T> {
    /// Deliver the result. Returns false if the completion already fired.
    pub fn complete(&self, result: Result<T>) -> bool {
        let sender = self.tx.lock().expect("completion lock poisoned").take();
        match sender {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }
}

impl<T> CompletionFuture<T> {
    pub async fn wait(self) -> Result<T> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(RepositoryError::Fatal("completion dropped".into())))
    }
}

/// Fan-in completion: fires once `expected` children completed successfully,
/// or immediately with the first failure. Results are delivered in
/// completion order.
#[derive(Debug, Clone)]
pub struct GroupedCompletion<T> {
    state: Arc<Mutex<GroupState<T>>>,
}

#[derive(Debug)]
struct GroupState<T> {
    expected: usize,
    results: Vec<T>,
    done: Option<Completion<Vec<T>>>,
}

/// Create a fan-in completion expecting `expected` children.
pub fn grouped<T>(expected: usize) -> (GroupedCompletion<T>, CompletionFuture<Vec<T>>) {
    let (done, future) = completion();
    if expected == 0 {
        done.complete(Ok(Vec::new()));
    }
    (
        GroupedCompletion {
            state: Arc::new(Mutex::new(GroupState {
                expected,
                results: Vec::new(),
                done: Some(done),
            })),
        },
        future,
    )
}

impl<T> GroupedCompletion<T> {
    /// Deliver one child's result. Late responses after the group fired are
    /// ignored.
    pub fn on_response(&self, result: Result<T>) {
        let mut state = self.state.lock().expect("group lock poisoned");
        if state.done.is_none() {
            return;
        }
        match result {
            Err(e) => {
                let Some(done) = state.done.take() else { return };
                drop(state);
                done.complete(Err(e));
            }
            Ok(value) => {
                state.results.push(value);
                if state.results.len() == state.expected {
                    let results = std::mem::take(&mut state.results);
                    let Some(done) = state.done.take() else { return };
                    drop(state);
                    done.complete(Ok(results));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completion_fires_once() {
        let (tx, rx) = completion::<u32>();
        assert!(tx.complete(Ok(1)));
        assert!(!tx.complete(Ok(2)));
        assert_eq!(rx.wait().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dropped_completion_is_an_error() {
        let (tx, rx) = completion::<u32>();
        drop(tx.tx.lock().unwrap().take());
        assert!(rx.wait().await.is_err());
    }

    #[tokio::test]
    async fn test_grouped_collects_all() {
        let (group, future) = grouped::<u32>(3);
        for i in 0..3 {
            let group = group.clone();
            tokio::spawn(async move { group.on_response(Ok(i)) });
        }
        let mut results = future.wait().await.unwrap();
        results.sort_unstable();
        assert_eq!(results, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_grouped_forwards_first_failure() {
        let (group, future) = grouped::<u32>(3);
        group.on_response(Ok(1));
        group.on_response(Err(RepositoryError::Aborted));
        // Late responses are ignored, including further failures.
        group.on_response(Err(RepositoryError::Fatal("late".into())));
        group.on_response(Ok(2));
        assert!(matches!(
            future.wait().await,
            Err(RepositoryError::Aborted)
        ));
    }

    #[tokio::test]
    async fn test_grouped_with_zero_children() {
        let (_group, future) = grouped::<u32>(0);
        assert!(future.wait().await.unwrap().is_empty());
    }
}
