//! Pooled sessions, and the producers they cache.

use crate::cache::{BoundedCache, GetError};
use crate::idle::{ActivityTracker, Tracked};
use crate::native::{self, Destination, ProducerOf, Session, SessionMode};
use crate::pool::{Error, Shared};
#[cfg(feature = "probes")]
use crate::probes;
use crate::slot::{Load, Resource, ResourceId};

use async_trait::async_trait;
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{event, instrument, Level};

/// A native session owned by a session slot.
///
/// The session counts as loaded (1) while borrowed, and unloaded (0)
/// otherwise. Producers are cached per destination and closed with the
/// session.
pub struct SessionResource<S: Session> {
    id: ResourceId,
    native: S,
    tracker: ActivityTracker,
    producers: BoundedCache<Destination, ProducerOf<S>>,
    torn_down: AtomicBool,
    shared: Arc<Shared>,
}

impl<S: Session> SessionResource<S> {
    /// Opens a new native session on `connection`.
    pub(crate) async fn open<C>(
        connection: &C,
        connection_id: ResourceId,
        mode: SessionMode,
        shared: Arc<Shared>,
    ) -> Result<Self, native::Error>
    where
        C: native::Connection<Session = S>,
    {
        #[cfg(feature = "probes")]
        probes::session__create__start!(|| (shared.name.as_str(), connection_id.as_u64()));

        let native = match connection.create_session(mode).await {
            Ok(native) => native,
            Err(err) => {
                event!(Level::WARN, connection_id = %connection_id, err = ?err, "Failed to create session");
                #[cfg(feature = "probes")]
                {
                    let reason = err.to_string();
                    probes::session__create__failed!(|| (
                        shared.name.as_str(),
                        connection_id.as_u64(),
                        reason.as_str()
                    ));
                }
                return Err(err);
            }
        };

        let id = ResourceId::new();
        event!(Level::DEBUG, connection_id = %connection_id, session_id = %id, "Created session");
        #[cfg(feature = "probes")]
        probes::session__create__done!(|| (
            shared.name.as_str(),
            connection_id.as_u64(),
            id.as_u64()
        ));

        let producers: BoundedCache<Destination, ProducerOf<S>> = BoundedCache::new(
            shared.max_producers,
            Arc::new(move |producer: Arc<ProducerOf<S>>| {
                async move {
                    if let Err(err) = native::Producer::close(&*producer).await {
                        event!(Level::WARN, session_id = %id, err = ?err, "Failed to close producer");
                    }
                }
                .boxed()
            }),
        );

        Ok(Self {
            id,
            native,
            tracker: ActivityTracker::new(),
            producers,
            torn_down: AtomicBool::new(false),
            shared,
        })
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Returns true once the session has been closed by the pool.
    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }
}

impl<S: Session> Load for SessionResource<S> {
    fn load(&self) -> usize {
        usize::from(self.tracker.is_active())
    }
}

impl<S: Session> Tracked for SessionResource<S> {
    fn tracker(&self) -> &ActivityTracker {
        &self.tracker
    }
}

#[async_trait]
impl<S: Session> Resource for SessionResource<S> {
    async fn teardown(&self) -> Result<(), native::Error> {
        event!(Level::DEBUG, session_id = %self.id, "Closing session");
        self.torn_down.store(true, Ordering::SeqCst);
        self.producers.discard().await;
        self.native.close().await
    }
}

/// A session borrowed from the pool.
///
/// Closing (or dropping) the handle returns the session to the pool rather
/// than closing the native session.
///
/// When every session is borrowed, the pool hands the least loaded one out
/// again, so two handles may share a session. It only counts as returned
/// once both are.
///
/// If the pool closes the session while the handle is held (the connection
/// failed, or the pool was closed), the handle can no longer create
/// producers.
pub struct PooledSession<S: Session> {
    resource: Arc<SessionResource<S>>,
}

impl<S: Session> PooledSession<S> {
    pub(crate) fn new(resource: Arc<SessionResource<S>>) -> Self {
        event!(Level::TRACE, session_id = %resource.id, "Session borrowed");
        #[cfg(feature = "probes")]
        probes::session__borrowed!(|| (resource.shared.name.as_str(), resource.id.as_u64()));
        Self { resource }
    }

    pub fn id(&self) -> ResourceId {
        self.resource.id
    }

    /// Returns a producer for `destination`, reusing a cached one if the
    /// session has already created it.
    ///
    /// Fails with [Error::Invalidated] once the pool has closed the session.
    #[instrument(level = "trace", skip(self), fields(session_id = %self.resource.id))]
    pub async fn create_producer(
        &self,
        destination: &Destination,
    ) -> Result<PooledProducer<ProducerOf<S>>, Error> {
        if self.resource.is_torn_down() {
            return Err(Error::Invalidated);
        }
        let producer = self
            .resource
            .producers
            .get(destination, self.resource.native.create_producer(destination))
            .await
            .map_err(|err| match err {
                GetError::Discarded => Error::Invalidated,
                GetError::Create(err) => Error::Native(err),
            })?;
        Ok(PooledProducer { producer })
    }

    /// Returns the number of producers the session keeps open.
    pub fn cached_producers(&self) -> u64 {
        self.resource.producers.len()
    }

    /// Returns true once the pool has closed the session.
    pub fn is_invalidated(&self) -> bool {
        self.resource.is_torn_down()
    }

    /// Returns the native session.
    pub fn native(&self) -> &S {
        &self.resource.native
    }

    /// Returns the session to the pool.
    pub fn close(self) {}
}

impl<S: Session> std::fmt::Debug for PooledSession<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession")
            .field("id", &self.resource.id)
            .finish_non_exhaustive()
    }
}

impl<S: Session> Drop for PooledSession<S> {
    fn drop(&mut self) {
        self.resource.tracker.deactivate();
        event!(Level::TRACE, session_id = %self.resource.id, "Session returned");
        #[cfg(feature = "probes")]
        probes::session__returned!(|| (
            self.resource.shared.name.as_str(),
            self.resource.id.as_u64()
        ));
    }
}

/// A producer cached by a pooled session.
///
/// The session owns the native producer: closing this handle does nothing,
/// and the producer stays open until it is evicted from the session's cache
/// or the session itself is closed.
pub struct PooledProducer<P> {
    producer: Arc<P>,
}

impl<P> PooledProducer<P> {
    /// Returns the native producer.
    pub fn native(&self) -> &P {
        &self.producer
    }

    /// Returns true if both handles refer to the same native producer.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.producer, &other.producer)
    }

    pub fn close(self) {}
}
