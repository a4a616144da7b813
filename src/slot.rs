//! A holder for at most one lazily-created resource.

use crate::native;

use async_trait::async_trait;
use derive_where::derive_where;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{event, instrument, Level};

/// Reports how many borrowed descendants an item currently has.
pub trait Load {
    fn load(&self) -> usize;
}

/// Something a [Slot] can hold.
#[async_trait]
pub trait Resource: Load + Send + Sync + 'static {
    /// Releases every native object owned by this resource.
    ///
    /// Called at most once, while the owning slot's lock is held.
    async fn teardown(&self) -> Result<(), native::Error>;
}

/// Uniquely identifies a resource created by the pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    pub(crate) fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A slot holds at most one live resource.
///
/// The resource is created on first use by [Slot::get_or_create], and
/// destroyed by [Slot::invalidate], after which the slot is empty and the
/// next caller builds a fresh one.
///
/// Creation and teardown are serialized by an async lock, which is held
/// across the (potentially slow) native call. The current value is mirrored
/// behind a short synchronous lock so that health and load can be sampled
/// without waiting behind a creation in progress.
#[derive_where(Debug)]
pub struct Slot<T: Resource> {
    kind: &'static str,
    index: usize,

    #[derive_where(skip)]
    lock: tokio::sync::Mutex<()>,

    #[derive_where(skip)]
    value: Mutex<Option<Arc<T>>>,
}

impl<T: Resource> Slot<T> {
    /// Creates an empty slot.
    ///
    /// `kind` and `index` only identify the slot in logs.
    pub fn new(kind: &'static str, index: usize) -> Self {
        Self {
            kind,
            index,
            lock: tokio::sync::Mutex::new(()),
            value: Mutex::new(None),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the live resource, if there is one.
    pub fn current(&self) -> Option<Arc<T>> {
        self.value.lock().unwrap().clone()
    }

    /// Returns true if the slot currently holds a live resource.
    pub fn health(&self) -> bool {
        self.value.lock().unwrap().is_some()
    }

    /// Returns the live resource, creating it with `factory` if the slot is
    /// empty.
    pub async fn get_or_create<F, Fut>(&self, factory: F) -> Result<Arc<T>, native::Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, native::Error>>,
    {
        self.get_or_create_then(factory, |_| ()).await
    }

    /// Like [Self::get_or_create], but calls `acquire` on the resource before
    /// returning it.
    ///
    /// `acquire` runs under the same lock that guards removal of the
    /// resource, so a concurrent [Self::invalidate_if] either removes the
    /// resource before `acquire` observes it, or observes whatever `acquire`
    /// did to it.
    pub async fn get_or_create_then<F, Fut, A>(
        &self,
        factory: F,
        acquire: A,
    ) -> Result<Arc<T>, native::Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, native::Error>>,
        A: Fn(&T),
    {
        if let Some(value) = self.acquire_current(&acquire) {
            return Ok(value);
        }

        let _guard = self.lock.lock().await;

        // Another caller may have built the resource while we were waiting
        // on the lock.
        if let Some(value) = self.acquire_current(&acquire) {
            return Ok(value);
        }

        event!(Level::DEBUG, kind = self.kind, index = self.index, "Creating resource");
        let value = Arc::new(factory().await?);

        let mut slot = self.value.lock().unwrap();
        acquire(&value);
        *slot = Some(value.clone());
        Ok(value)
    }

    fn acquire_current<A: Fn(&T)>(&self, acquire: &A) -> Option<Arc<T>> {
        let slot = self.value.lock().unwrap();
        let value = slot.as_ref()?;
        acquire(value);
        Some(value.clone())
    }

    /// Tears down the resource, if any, leaving the slot empty.
    ///
    /// Returns true if a resource was torn down. Failures reported by the
    /// resource are logged rather than returned: from the slot's point of
    /// view, invalidation always succeeds.
    pub async fn invalidate(&self) -> bool {
        self.invalidate_if(|_| true).await
    }

    /// Tears down the resource only if `predicate` holds for it.
    ///
    /// The predicate is evaluated under the lock which guards both creation
    /// and teardown.
    #[instrument(level = "trace", skip(self, predicate), fields(kind = self.kind, index = self.index))]
    pub async fn invalidate_if<P>(&self, predicate: P) -> bool
    where
        P: Fn(&T) -> bool + Send,
    {
        let _guard = self.lock.lock().await;

        let taken = {
            let mut slot = self.value.lock().unwrap();
            if slot.as_deref().is_some_and(&predicate) {
                slot.take()
            } else {
                None
            }
        };
        let Some(value) = taken else {
            return false;
        };

        event!(Level::DEBUG, kind = self.kind, index = self.index, "Tearing down resource");
        if let Err(err) = value.teardown().await {
            event!(
                Level::WARN,
                kind = self.kind,
                index = self.index,
                err = ?err,
                "Failed to tear down resource"
            );
        }
        true
    }
}

impl<T: Resource> Load for Slot<T> {
    fn load(&self) -> usize {
        self.value
            .lock()
            .unwrap()
            .as_ref()
            .map_or(0, |value| value.load())
    }
}
