//! Bounded retry with fixed delays.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// Retries an operation after each failure until a total time budget is spent.
#[derive(Debug, Clone)]
pub struct Retrier {
    delays: Vec<Duration>,
    budget: Duration,
}

impl Retrier {
    /// `delays` are used in order, the last one repeating. No delays means
    /// a single attempt.
    pub fn new(delays: Vec<Duration>, budget: Duration) -> Self {
        Self { delays, budget }
    }

    pub fn fixed(delay: Duration, budget: Duration) -> Self {
        Self::new(vec![delay], budget)
    }

    /// Run `op` until `accept` approves its result or the budget would be
    /// exceeded by the next delay. Returns the last result.
    pub async fn run_until<T, F, Fut, A>(&self, mut op: F, accept: A) -> T
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = T>,
        A: Fn(&T) -> bool,
    {
        let started = Instant::now();
        let mut attempt = 0usize;
        loop {
            let result = op().await;
            if accept(&result) {
                return result;
            }
            let delay = match self.delays.get(attempt).or(self.delays.last()) {
                Some(delay) => *delay,
                None => return result,
            };
            if started.elapsed() + delay > self.budget {
                return result;
            }
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Retry a boolean operation until it returns `true`.
    pub async fn run<F, Fut>(&self, op: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        self.run_until(op, |ok| *ok).await
    }
}
