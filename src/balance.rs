//! A fixed-size pool which always selects its least-loaded item.

use crate::slot::{Load, Resource, Slot};

use std::sync::Arc;
use tracing::{event, instrument, Level};

/// A fixed, ordered collection of items, selected by minimum load.
///
/// No state is kept between selections: each one samples the current load
/// of every item. Under concurrency this balances on a best-effort basis,
/// as the loads may change between sampling and use.
#[derive(Debug)]
pub struct LoadBalancedPool<T> {
    items: Vec<Arc<T>>,
}

impl<T: Load> LoadBalancedPool<T> {
    /// Creates a pool over `items`.
    ///
    /// # Panics
    ///
    /// Panics if `items` is empty.
    pub fn new(items: Vec<T>) -> Self {
        assert!(!items.is_empty(), "At least one item is required");
        Self {
            items: items.into_iter().map(Arc::new).collect(),
        }
    }

    /// Returns the item with the lowest load right now.
    ///
    /// Ties go to the item which was listed first.
    pub fn select(&self) -> &Arc<T> {
        // "min_by_key" returns the first of several equally minimum items.
        self.items
            .iter()
            .min_by_key(|item| item.load())
            .expect("The pool is never empty")
    }

    /// Returns an endless iterator of selections.
    ///
    /// Every call to `next` performs a fresh [Self::select].
    pub fn selector(&self) -> Selector<'_, T> {
        Selector { pool: self }
    }

    /// Sums the load of every item.
    pub fn total_load(&self) -> usize {
        self.items.iter().map(|item| item.load()).sum()
    }

    pub fn items(&self) -> &[Arc<T>] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<R: Resource> LoadBalancedPool<Slot<R>> {
    /// Creates a pool of `count` empty slots.
    pub fn with_empty_slots(kind: &'static str, count: usize) -> Self {
        Self::new((0..count).map(|index| Slot::new(kind, index)).collect())
    }

    /// Returns the number of slots currently holding a live resource.
    pub fn healthy_count(&self) -> usize {
        self.items.iter().filter(|slot| slot.health()).count()
    }

    /// Invalidates every slot.
    ///
    /// Slots never fail to invalidate, so one slot's teardown trouble cannot
    /// stop the others from being closed.
    #[instrument(level = "debug", skip(self), fields(len = self.items.len()))]
    pub async fn close_all(&self) {
        let mut closed = 0;
        for slot in &self.items {
            if slot.invalidate().await {
                closed += 1;
            }
        }
        event!(Level::DEBUG, closed, "Closed all slots");
    }
}

/// An endless sequence of least-loaded selections from a [LoadBalancedPool].
pub struct Selector<'a, T> {
    pool: &'a LoadBalancedPool<T>,
}

impl<'a, T: Load> Iterator for Selector<'a, T> {
    type Item = &'a Arc<T>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.pool.select())
    }
}
