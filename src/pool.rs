//! Bounded worker pool feeding a single consumer.
//!
//! Workers run the per-item step in parallel on a rayon pool and send each
//! result over one channel. The calling thread is the only consumer, so
//! everything done in `consume` (store writes, progress callbacks) is
//! serialized and happens in completion order. With `concurrency <= 1` the
//! items are processed strictly in order on the calling thread.

use std::ops::ControlFlow;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use rayon::prelude::*;
use tracing::warn;

/// Level-triggered cooperative cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress<'a> {
    pub completed: usize,
    pub total: usize,
    pub path: &'a Path,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PoolExit<B> {
    /// Every item was processed and consumed.
    Drained,
    /// Cancellation was observed before every item was consumed.
    Canceled,
    /// The consumer stopped the run.
    Broke(B),
}

pub fn run_pool<T, R, B, W, C>(
    items: &[T],
    concurrency: usize,
    cancel: &CancelToken,
    work: W,
    consume: C,
) -> PoolExit<B>
where
    T: Sync,
    R: Send,
    W: Fn(&T) -> R + Sync,
    C: FnMut(&T, R) -> ControlFlow<B>,
{
    if concurrency <= 1 || items.len() <= 1 {
        return run_sequential(items, cancel, work, consume);
    }

    match rayon::ThreadPoolBuilder::new()
        .num_threads(concurrency)
        .thread_name(|i| format!("picindex-worker-{i}"))
        .build()
    {
        Ok(pool) => run_parallel(pool, items, cancel, work, consume),
        Err(err) => {
            warn!(error = %err, concurrency, "worker pool unavailable, running sequentially");
            run_sequential(items, cancel, work, consume)
        }
    }
}

fn run_sequential<T, R, B, W, C>(
    items: &[T],
    cancel: &CancelToken,
    work: W,
    mut consume: C,
) -> PoolExit<B>
where
    W: Fn(&T) -> R,
    C: FnMut(&T, R) -> ControlFlow<B>,
{
    for item in items {
        if cancel.is_canceled() {
            return PoolExit::Canceled;
        }
        let result = work(item);
        if let ControlFlow::Break(b) = consume(item, result) {
            return PoolExit::Broke(b);
        }
    }
    PoolExit::Drained
}

fn run_parallel<T, R, B, W, C>(
    pool: rayon::ThreadPool,
    items: &[T],
    cancel: &CancelToken,
    work: W,
    mut consume: C,
) -> PoolExit<B>
where
    T: Sync,
    R: Send,
    W: Fn(&T) -> R + Sync,
    C: FnMut(&T, R) -> ControlFlow<B>,
{
    let stop = AtomicBool::new(false);
    let (tx, rx) = mpsc::channel::<(usize, R)>();

    std::thread::scope(|scope| {
        let work = &work;
        let stop = &stop;
        scope.spawn(move || {
            pool.install(|| {
                items
                    .par_iter()
                    .enumerate()
                    .for_each_with(tx, |tx, (idx, item)| {
                        if stop.load(Ordering::Acquire) || cancel.is_canceled() {
                            return;
                        }
                        let result = work(item);
                        let _ = tx.send((idx, result));
                    });
            });
        });

        let mut received = 0usize;
        let mut exit = PoolExit::Drained;
        for (idx, result) in rx.iter() {
            if cancel.is_canceled() {
                exit = PoolExit::Canceled;
                break;
            }
            received += 1;
            if let ControlFlow::Break(b) = consume(&items[idx], result) {
                exit = PoolExit::Broke(b);
                break;
            }
        }
        stop.store(true, Ordering::Release);
        drop(rx);

        // Workers that saw the flag skip their items and close the channel
        // without the consumer ever observing it.
        if matches!(exit, PoolExit::Drained) && received < items.len() {
            exit = PoolExit::Canceled;
        }
        exit
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn sequential_preserves_order() {
        let items: Vec<u32> = (0..10).collect();
        let mut seen = Vec::new();
        let exit = run_pool(
            &items,
            1,
            &CancelToken::new(),
            |n| n * 2,
            |item, doubled| {
                seen.push((*item, doubled));
                ControlFlow::<()>::Continue(())
            },
        );

        assert_eq!(exit, PoolExit::Drained);
        let expected: Vec<(u32, u32)> = (0..10).map(|n| (n, n * 2)).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn parallel_delivers_every_item_once() {
        let items: Vec<u32> = (0..200).collect();
        let mut seen = Vec::new();
        let exit = run_pool(
            &items,
            8,
            &CancelToken::new(),
            |n| n + 1,
            |item, next| {
                assert_eq!(*item + 1, next);
                seen.push(*item);
                ControlFlow::<()>::Continue(())
            },
        );

        assert_eq!(exit, PoolExit::Drained);
        seen.sort_unstable();
        assert_eq!(seen, items);
    }

    #[test]
    fn consumer_break_stops_the_run() {
        let items: Vec<u32> = (0..50).collect();
        let mut consumed = 0;
        let exit = run_pool(
            &items,
            4,
            &CancelToken::new(),
            |n| *n,
            |_, n| {
                consumed += 1;
                if consumed == 3 {
                    ControlFlow::Break(n)
                } else {
                    ControlFlow::Continue(())
                }
            },
        );

        assert!(matches!(exit, PoolExit::Broke(_)));
        assert_eq!(consumed, 3);
    }

    #[test]
    fn cancel_is_observed_between_units() {
        for concurrency in [1, 4] {
            let cancel = CancelToken::new();
            let items: Vec<u32> = (0..100).collect();
            let mut consumed = 0usize;
            let exit = run_pool(
                &items,
                concurrency,
                &cancel,
                |n| {
                    std::thread::sleep(Duration::from_millis(1));
                    *n
                },
                |_, _| {
                    consumed += 1;
                    if consumed == 5 {
                        cancel.cancel();
                    }
                    ControlFlow::<()>::Continue(())
                },
            );

            assert_eq!(exit, PoolExit::Canceled, "concurrency={concurrency}");
            assert_eq!(consumed, 5, "concurrency={concurrency}");
        }
    }

    #[test]
    fn cancel_before_start_consumes_nothing() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let items = vec![1, 2, 3];
        let mut consumed = 0;
        let exit = run_pool(&items, 2, &cancel, |n| *n, |_, _| {
            consumed += 1;
            ControlFlow::<()>::Continue(())
        });

        assert_eq!(exit, PoolExit::Canceled);
        assert_eq!(consumed, 0);
    }
}
