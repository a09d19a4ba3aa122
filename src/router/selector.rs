//! Instance selection strategies for read-write splitting

use std::sync::atomic::{AtomicUsize, Ordering};

use super::{Endpoint, EndpointId};

/// Strategy for selecting an endpoint from a list
pub trait InstanceSelector: Send + Sync {
    /// Select an endpoint from the given candidates
    ///
    /// Returns None if the list is empty
    fn select(&self, candidates: &[&Endpoint]) -> Option<EndpointId>;
}

/// Select the first endpoint (strategy for primaries)
#[derive(Debug, Default)]
pub struct FirstSelector;

impl InstanceSelector for FirstSelector {
    fn select(&self, candidates: &[&Endpoint]) -> Option<EndpointId> {
        candidates.first().map(|e| e.id)
    }
}

/// Weighted round-robin (strategy for replicas)
///
/// An endpoint with weight `w` is picked `w` times per cycle. Weight zero
/// endpoints are only used when every candidate has weight zero.
#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    counter: AtomicUsize,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl InstanceSelector for WeightedRoundRobin {
    fn select(&self, candidates: &[&Endpoint]) -> Option<EndpointId> {
        if candidates.is_empty() {
            return None;
        }

        let total: usize = candidates.iter().map(|e| e.weight() as usize).sum();
        let tick = self.counter.fetch_add(1, Ordering::Relaxed);
        if total == 0 {
            return Some(candidates[tick % candidates.len()].id);
        }

        let mut slot = tick % total;
        for endpoint in candidates {
            let weight = endpoint.weight() as usize;
            if slot < weight {
                return Some(endpoint.id);
            }
            slot -= weight;
        }
        candidates.last().map(|e| e.id)
    }
}
