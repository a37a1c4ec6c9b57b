//! Rate scheduler.
//!
//! Time is cut into 100 ms ticks. A load shape becomes a request-count
//! vector with one entry per tick; the dispatch loop then starts that many
//! iterations on each tick until the vector runs out or the test is
//! cancelled.

use crate::model::{LoadShape, Segment, TICK, TICKS_PER_SECOND};
use std::future::Future;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// How the dispatch loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Stopped,
}

/// Build the request-count vector for `n` iterations over `d` seconds.
/// The result has `d * TICKS_PER_SECOND` entries summing to `n`.
pub fn build_vector(n: u64, d: u64, shape: &LoadShape) -> Vec<u64> {
    let per_second = match shape {
        LoadShape::Linear => spread_head(n, d),
        LoadShape::Incremental => incremental(n, d),
        LoadShape::Waved => waved(n, d),
        LoadShape::Explicit(segments) => explicit(segments),
    };
    flatten(&per_second)
}

/// Split `n` evenly over `parts`, the remainder going to the first ones.
fn spread_head(n: u64, parts: u64) -> Vec<u64> {
    if parts == 0 {
        return Vec::new();
    }
    let base = n / parts;
    let remainder = n % parts;
    (0..parts).map(|i| base + u64::from(i < remainder)).collect()
}

/// Split `n` evenly over `parts`, the remainder going to the last ones.
fn spread_tail(n: u64, parts: u64) -> Vec<u64> {
    let mut out = spread_head(n, parts);
    out.reverse();
    out
}

/// Spread each second's count over its ticks.
fn flatten(per_second: &[u64]) -> Vec<u64> {
    per_second
        .iter()
        .flat_map(|&count| spread_head(count, TICKS_PER_SECOND as u64))
        .collect()
}

/// A rising staircase over `d` seconds rescaled to sum to `n`.
fn incremental(n: u64, d: u64) -> Vec<u64> {
    if d == 0 {
        return Vec::new();
    }
    if n == 0 {
        return vec![0; d as usize];
    }

    let sum = d * (d + 1) / 2;
    let step = sum.div_ceil(n);
    let mut stairs = Vec::with_capacity(d as usize);
    let mut level = 1u64;
    for i in 0..d {
        if i > 0 && i % step == 0 {
            level += 1;
        }
        stairs.push(level);
    }

    let total: u64 = stairs.iter().sum();
    let factor = n / total;
    let mut out: Vec<u64> = stairs.iter().map(|s| s * factor).collect();
    let remainder = n - out.iter().sum::<u64>();
    let len = out.len() as u64;
    for i in 0..remainder {
        out[(len - 1 - (i % len)) as usize] += 1;
    }
    out
}

/// Alternating rising and falling staircases, `floor(log2 d)` of them.
fn waved(n: u64, d: u64) -> Vec<u64> {
    if d == 0 {
        return Vec::new();
    }
    let quarters = u64::from(d.ilog2()).max(1);
    let quarter_len = d / quarters;
    let quarter_count = n / quarters;

    let mut out = Vec::with_capacity(d as usize);
    for q in 0..quarters {
        let last = q == quarters - 1;
        let len = if last {
            d - quarter_len * (quarters - 1)
        } else {
            quarter_len
        };
        let count = if last {
            n - quarter_count * (quarters - 1)
        } else {
            quarter_count
        };
        let mut wave = incremental(count, len);
        if q % 2 == 1 {
            wave.reverse();
        }
        out.extend(wave);
    }
    out
}

fn explicit(segments: &[Segment]) -> Vec<u64> {
    segments
        .iter()
        .flat_map(|s| spread_tail(s.count, s.duration))
        .collect()
}

/// Drives the request-count vector against the clock.
#[derive(Debug, Clone)]
pub struct Scheduler {
    vector: Vec<u64>,
}

impl Scheduler {
    pub fn new(vector: Vec<u64>) -> Self {
        Self { vector }
    }

    pub fn vector(&self) -> &[u64] {
        &self.vector
    }

    /// Total iterations the vector schedules.
    pub fn total(&self) -> u64 {
        self.vector.iter().sum()
    }

    /// Start `launch(index)` on `tracker` for every scheduled iteration,
    /// `vector[i]` of them on tick `i`. Indices run from zero across the
    /// whole test. Returns as soon as cancellation is seen; in-flight
    /// iterations are left to the caller to await.
    pub async fn run<F, Fut>(
        &self,
        cancel: &CancellationToken,
        tracker: &TaskTracker,
        mut launch: F,
    ) -> Outcome
    where
        F: FnMut(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut ticker = interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
        let mut next = 0u64;

        for (tick, &count) in self.vector.iter().enumerate() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Scheduler stopped at tick {} after {} iterations", tick, next);
                    return Outcome::Stopped;
                }
                _ = ticker.tick() => {}
            }
            for _ in 0..count {
                tracker.spawn(launch(next));
                next += 1;
            }
            if count > 0 {
                debug!(tick, count, "dispatched");
            }
        }
        Outcome::Done
    }
}
