//! Ranked candidate buffer keyed by symbol

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::common::types::Candidate;

/// Bounded map of symbol to its latest candidate
#[derive(Debug)]
pub struct RankedBuffer {
    entries: HashMap<String, Candidate>,
    capacity: usize,
    max_age: Duration,
}

impl RankedBuffer {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            max_age,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.entries.contains_key(symbol)
    }

    /// Insert or replace. When full, a new symbol evicts the lowest-ranked
    /// entry only if it outranks it; returns whether the candidate was kept.
    pub fn push(&mut self, candidate: Candidate) -> bool {
        if self.entries.contains_key(&candidate.symbol) || self.entries.len() < self.capacity {
            self.entries.insert(candidate.symbol.clone(), candidate);
            return true;
        }

        let lowest = self
            .entries
            .values()
            .min_by(|a, b| a.rank_score.cmp(&b.rank_score))
            .map(|c| (c.symbol.clone(), c.rank_score));
        match lowest {
            Some((symbol, score)) if candidate.rank_score > score => {
                self.entries.remove(&symbol);
                self.entries.insert(candidate.symbol.clone(), candidate);
                true
            }
            _ => false,
        }
    }

    /// Remove and return up to `n` of the highest-ranked fresh candidates.
    ///
    /// Stale candidates and those in `exclude` are purged from the buffer;
    /// an excluded symbol must be re-signalled before it is considered again.
    pub fn drain_top_n(
        &mut self,
        n: usize,
        now: DateTime<Utc>,
        exclude: &HashSet<String>,
    ) -> Vec<Candidate> {
        let cutoff = now - self.max_age;
        let before = self.entries.len();
        self.entries
            .retain(|symbol, c| c.arrived_at >= cutoff && !exclude.contains(symbol));
        let purged = before - self.entries.len();
        if purged > 0 {
            debug!(purged, "Dropped stale or excluded candidates");
        }

        let mut ranked: Vec<&Candidate> = self.entries.values().collect();
        ranked.sort_by(|a, b| {
            b.rank_score
                .cmp(&a.rank_score)
                .then_with(|| b.arrived_at.cmp(&a.arrived_at))
                .then_with(|| a.symbol.cmp(&b.symbol))
        });
        let chosen: Vec<String> = ranked.into_iter().take(n).map(|c| c.symbol.clone()).collect();

        chosen
            .iter()
            .filter_map(|symbol| self.entries.remove(symbol))
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Shared handle to a [`RankedBuffer`]; the feed writes, the engine drains.
#[derive(Debug, Clone)]
pub struct CandidateBuffer {
    inner: Arc<Mutex<RankedBuffer>>,
}

impl CandidateBuffer {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RankedBuffer::new(capacity, max_age))),
        }
    }

    pub async fn push(&self, candidate: Candidate) -> bool {
        self.inner.lock().await.push(candidate)
    }

    /// Push a batch; returns how many were kept.
    pub async fn extend(&self, candidates: impl IntoIterator<Item = Candidate>) -> usize {
        let mut buffer = self.inner.lock().await;
        candidates.into_iter().filter(|c| buffer.push(c.clone())).count()
    }

    pub async fn drain_top_n(
        &self,
        n: usize,
        now: DateTime<Utc>,
        exclude: &HashSet<String>,
    ) -> Vec<Candidate> {
        if n == 0 {
            return Vec::new();
        }
        self.inner.lock().await.drain_top_n(n, now, exclude)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    pub async fn clear(&self) {
        self.inner.lock().await.clear()
    }
}
