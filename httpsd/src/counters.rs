//! Per-backend request counters
//!
//! One monotonically increasing count per backend category. The registry is
//! owned by whoever builds the [`Router`](crate::router::Router) and shared
//! with the admin listener through an `Arc`.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::router::Category;

/// Thread-safe request counters, one per backend category
#[derive(Debug, Default)]
pub struct RequestCounters {
    cgi: AtomicU64,
    plack: AtomicU64,
    default: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub cgi: u64,
    pub plack: u64,
    pub default: u64,
}

impl RequestCounters {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, category: Category) -> &AtomicU64 {
        match category {
            Category::Cgi => &self.cgi,
            Category::Plack => &self.plack,
            Category::Default => &self.default,
        }
    }

    /// Count one request for `category`
    pub fn increment(&self, category: Category) {
        self.slot(category).fetch_add(1, Ordering::Relaxed);
    }

    /// Current count for `category`
    pub fn get(&self, category: Category) -> u64 {
        self.slot(category).load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            cgi: self.get(Category::Cgi),
            plack: self.get(Category::Plack),
            default: self.get(Category::Default),
        }
    }
}

impl CounterSnapshot {
    /// Sum over all categories
    pub fn total(&self) -> u64 {
        self.cgi + self.plack + self.default
    }
}
