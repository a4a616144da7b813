//! A capacity-limited cache which closes the entries it evicts.

use futures::future::BoxFuture;
use moka::future::Cache;
use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{event, Level};

/// Closes an entry which has left the cache.
pub type Closer<V> = Arc<dyn Fn(Arc<V>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Why [BoundedCache::get] returned no value.
#[derive(Debug)]
pub enum GetError<E> {
    /// The cache has been discarded.
    Discarded,

    /// Creating the value failed.
    Create(Arc<E>),
}

/// Maps keys to lazily-created values, keeping at most `capacity` of them.
///
/// When an insertion pushes the cache over capacity, the least recently used
/// entry is evicted and handed to the closer. Entries which remain when the
/// cache is [discarded](BoundedCache::discard) are closed as well.
///
/// A cache belongs to a single owner, which must discard it when the owner
/// itself is torn down. A discarded cache creates nothing further.
pub struct BoundedCache<K, V> {
    entries: Cache<K, Arc<V>>,

    // Set by "discard". Readers hold the lock across creation, so that no
    // entry can be inserted after "discard" has closed the rest.
    discarded: RwLock<bool>,

    // Entries evicted by the cache, waiting to be closed.
    evicted: Arc<Mutex<Vec<Arc<V>>>>,

    closer: Closer<V>,
}

impl<K, V> BoundedCache<K, V>
where
    K: Hash + Eq + Clone + std::fmt::Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new(capacity: usize, closer: Closer<V>) -> Self {
        let evicted = Arc::new(Mutex::new(vec![]));
        let entries = Cache::builder()
            .max_capacity(capacity as u64)
            .eviction_policy(EvictionPolicy::lru())
            .eviction_listener({
                let evicted = evicted.clone();
                move |key: Arc<K>, value: Arc<V>, cause| {
                    // Explicit removals are closed by "discard" itself.
                    if matches!(cause, RemovalCause::Size) {
                        event!(Level::DEBUG, key = ?key, "Evicting cache entry over capacity");
                        evicted.lock().unwrap().push(value);
                    }
                }
            })
            .build();

        Self {
            entries,
            discarded: RwLock::new(false),
            evicted,
            closer,
        }
    }

    /// Returns the value for `key`, creating it with `factory` on first
    /// request.
    ///
    /// Concurrent requests for the same missing key share one creation.
    pub async fn get<F, E>(&self, key: &K, factory: F) -> Result<Arc<V>, GetError<E>>
    where
        F: std::future::Future<Output = Result<V, E>>,
        E: Send + Sync + 'static,
    {
        let discarded = self.discarded.read().await;
        if *discarded {
            return Err(GetError::Discarded);
        }
        if let Some(value) = self.entries.get(key).await {
            return Ok(value);
        }

        let value = self
            .entries
            .try_get_with(key.clone(), async { factory.await.map(Arc::new) })
            .await
            .map_err(GetError::Create)?;

        // Apply the capacity limit now, rather than at some later point.
        self.entries.run_pending_tasks().await;
        self.close_evicted().await;
        Ok(value)
    }

    async fn close_evicted(&self) {
        let evicted = std::mem::take(&mut *self.evicted.lock().unwrap());
        for value in evicted {
            (self.closer)(value).await;
        }
    }

    /// Returns the number of cached entries.
    pub fn len(&self) -> u64 {
        self.entries.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and closes every entry.
    ///
    /// Afterwards, [Self::get] fails with [GetError::Discarded].
    pub async fn discard(&self) {
        let mut discarded = self.discarded.write().await;
        if *discarded {
            return;
        }
        *discarded = true;

        let remaining: Vec<Arc<V>> = self.entries.iter().map(|(_key, value)| value).collect();
        self.entries.invalidate_all();
        self.entries.run_pending_tasks().await;
        self.close_evicted().await;

        event!(Level::DEBUG, count = remaining.len(), "Discarding cache entries");
        for value in remaining {
            (self.closer)(value).await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Entry {
        name: &'static str,
        closed: AtomicBool,
    }

    impl Entry {
        fn closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    fn cache(capacity: usize) -> BoundedCache<&'static str, Entry> {
        BoundedCache::new(
            capacity,
            Arc::new(|entry: Arc<Entry>| {
                async move {
                    assert!(
                        !entry.closed.swap(true, Ordering::SeqCst),
                        "Entry {} closed twice",
                        entry.name
                    );
                }
                .boxed()
            }),
        )
    }

    async fn get(
        cache: &BoundedCache<&'static str, Entry>,
        name: &'static str,
        created: &AtomicUsize,
    ) -> Arc<Entry> {
        cache
            .get(&name, async {
                created.fetch_add(1, Ordering::SeqCst);
                Ok::<_, std::io::Error>(Entry {
                    name,
                    closed: AtomicBool::new(false),
                })
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_values_are_cached_by_key() {
        let cache = cache(10);
        let created = AtomicUsize::new(0);

        let a1 = get(&cache, "a", &created).await;
        let a2 = get(&cache, "a", &created).await;
        let b = get(&cache, "b", &created).await;

        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_overflow_evicts_and_closes_oldest() {
        let cache = cache(2);
        let created = AtomicUsize::new(0);

        let a = get(&cache, "a", &created).await;
        let b = get(&cache, "b", &created).await;
        assert!(!a.closed());

        let c = get(&cache, "c", &created).await;
        assert!(a.closed());
        assert!(!b.closed());
        assert!(!c.closed());
        assert_eq!(cache.len(), 2);

        // Asking for "a" again builds a new value
        let a2 = get(&cache, "a", &created).await;
        assert!(!Arc::ptr_eq(&a, &a2));
        assert_eq!(created.load(Ordering::SeqCst), 4);
        assert!(b.closed());
    }

    #[tokio::test]
    async fn test_recently_used_entries_survive_overflow() {
        let cache = cache(2);
        let created = AtomicUsize::new(0);

        let a = get(&cache, "a", &created).await;
        let b = get(&cache, "b", &created).await;
        get(&cache, "a", &created).await;
        get(&cache, "c", &created).await;

        assert!(!a.closed());
        assert!(b.closed());
    }

    #[tokio::test]
    async fn test_failed_creation_is_not_cached() {
        let cache = cache(2);

        let err = cache
            .get(&"a", async { Err::<Entry, _>(std::io::Error::other("refused")) })
            .await
            .map(|_| ())
            .expect_err("Creation should have failed");
        let GetError::Create(err) = err else {
            panic!("Expected a creation failure");
        };
        assert_eq!(err.to_string(), "refused");
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_discard_closes_everything() {
        let cache = cache(3);
        let created = AtomicUsize::new(0);

        let entries = vec![
            get(&cache, "a", &created).await,
            get(&cache, "b", &created).await,
            get(&cache, "c", &created).await,
        ];
        cache.discard().await;

        assert!(entries.iter().all(|entry| entry.closed()));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_discarded_cache_creates_nothing() {
        let cache = cache(3);
        let created = AtomicUsize::new(0);
        let a = get(&cache, "a", &created).await;
        cache.discard().await;
        assert!(a.closed());

        let err = cache
            .get(&"b", async {
                created.fetch_add(1, Ordering::SeqCst);
                Ok::<_, std::io::Error>(Entry {
                    name: "b",
                    closed: AtomicBool::new(false),
                })
            })
            .await
            .map(|_| ())
            .expect_err("A discarded cache should refuse new entries");
        assert!(matches!(err, GetError::Discarded));
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(cache.is_empty());

        // Discarding again closes nothing twice
        cache.discard().await;
    }
}
