//! Pooled connections, each owning a fixed set of session slots.

use crate::balance::LoadBalancedPool;
use crate::idle::{Idle, Tracked};
use crate::native::{
    self, AckMode, Connection, ConnectionFactory, Credentials, FailureListener, SessionOf,
};
use crate::pool::{Error, Shared};
#[cfg(feature = "probes")]
use crate::probes;
use crate::session::{PooledSession, SessionResource};
use crate::slot::{Load, Resource, ResourceId, Slot};

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{event, instrument, Level};

type SessionSlots<C> = LoadBalancedPool<Slot<SessionResource<SessionOf<C>>>>;

/// A native connection owned by a connection slot.
///
/// The load of a connection is the number of its sessions which are
/// currently borrowed.
pub struct ConnectionResource<C: Connection> {
    id: ResourceId,
    native: C,
    sessions: SessionSlots<C>,
    torn_down: AtomicBool,
    shared: Arc<Shared>,
}

impl<C: Connection> ConnectionResource<C> {
    /// Opens a new native connection on behalf of `slot`.
    ///
    /// If the connection later reports a failure, `slot` is invalidated,
    /// unless it has moved on to another connection by then.
    pub(crate) async fn open(
        factory: &dyn ConnectionFactory<Connection = C>,
        credentials: Option<&Credentials>,
        slot: Weak<Slot<Self>>,
        slot_index: usize,
        shared: Arc<Shared>,
    ) -> Result<Self, native::Error> {
        #[cfg(feature = "probes")]
        probes::connect__start!(|| (shared.name.as_str(), slot_index as u64));

        let native = match factory.connect(credentials).await {
            Ok(native) => native,
            Err(err) => {
                event!(Level::WARN, slot_index, err = ?err, "Failed to connect");
                #[cfg(feature = "probes")]
                {
                    let reason = err.to_string();
                    probes::connect__failed!(|| (
                        shared.name.as_str(),
                        slot_index as u64,
                        reason.as_str()
                    ));
                }
                return Err(err);
            }
        };

        let id = ResourceId::new();
        native.set_failure_listener(failure_listener(id, slot, shared.clone()));

        event!(Level::DEBUG, slot_index, connection_id = %id, "Connected");
        #[cfg(feature = "probes")]
        probes::connect__done!(|| (shared.name.as_str(), slot_index as u64, id.as_u64()));

        Ok(Self {
            id,
            native,
            sessions: LoadBalancedPool::with_empty_slots("session", shared.max_sessions),
            torn_down: AtomicBool::new(false),
            shared,
        })
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Returns true once the connection has been closed by the pool.
    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    pub(crate) fn sessions(&self) -> &SessionSlots<C> {
        &self.sessions
    }

    /// Returns the session slots of this connection, for idle scanning.
    pub(crate) fn idle_items(&self) -> Vec<Arc<dyn Idle>> {
        self.sessions
            .items()
            .iter()
            .map(|slot| slot.clone() as Arc<dyn Idle>)
            .collect()
    }
}

// Invalidation needs the slot lock, which may be held by whoever is calling
// into the native connection. The listener is synchronous, so the work is
// handed to the runtime the connection was opened on.
fn failure_listener<C: Connection>(
    id: ResourceId,
    slot: Weak<Slot<ConnectionResource<C>>>,
    shared: Arc<Shared>,
) -> FailureListener {
    let runtime = tokio::runtime::Handle::current();
    FailureListener::new(move |err: Option<native::Error>| {
        event!(Level::ERROR, connection_id = %id, err = ?err, "Connection failed");
        shared.connection_failures.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "probes")]
        {
            let reason = err.as_ref().map(|err| err.to_string()).unwrap_or_default();
            probes::connection__failed!(|| (shared.name.as_str(), id.as_u64(), reason.as_str()));
        }

        let Some(slot) = slot.upgrade() else {
            return;
        };
        runtime.spawn(async move {
            // A stale signal must not tear down a replacement connection.
            if slot.invalidate_if(|connection| connection.id == id).await {
                event!(Level::DEBUG, connection_id = %id, "Invalidated failed connection");
            }
        });
    })
}

impl<C: Connection> Load for ConnectionResource<C> {
    fn load(&self) -> usize {
        self.sessions.total_load()
    }
}

#[async_trait]
impl<C: Connection> Resource for ConnectionResource<C> {
    async fn teardown(&self) -> Result<(), native::Error> {
        event!(Level::DEBUG, connection_id = %self.id, "Closing connection");
        // Set before the sessions are closed: a session created after this
        // point is closed by whoever created it.
        self.torn_down.store(true, Ordering::SeqCst);
        // Sessions (and their producers) go first.
        self.sessions.close_all().await;
        self.native.close().await
    }
}

/// A connection handed out by the pool.
///
/// Connections are never returned explicitly: the pool reuses them based on
/// the load of their sessions. Once the pool has closed the connection,
/// after a failure or on [crate::pool::Pool::close], the handle can no
/// longer borrow sessions.
pub struct PooledConnection<C: Connection> {
    resource: Arc<ConnectionResource<C>>,
}

impl<C: Connection> PooledConnection<C> {
    pub(crate) fn new(resource: Arc<ConnectionResource<C>>) -> Self {
        Self { resource }
    }

    pub fn id(&self) -> ResourceId {
        self.resource.id
    }

    /// Borrows a session with the given mode.
    ///
    /// The mode must be the one the pool was configured with. The least
    /// loaded session of this connection is reused, or created if its slot
    /// is empty.
    ///
    /// Fails with [Error::Invalidated] once the pool has closed this
    /// connection.
    #[instrument(
        level = "debug",
        skip(self),
        fields(connection_id = %self.resource.id),
        err,
        name = "PooledConnection::create_session"
    )]
    pub async fn create_session(
        &self,
        transacted: bool,
        ack_mode: AckMode,
    ) -> Result<PooledSession<SessionOf<C>>, Error> {
        let shared = &self.resource.shared;
        let requested = native::SessionMode {
            transacted,
            ack_mode,
        };
        if requested != shared.mode {
            return Err(Error::ModeMismatch {
                requested,
                expected: shared.mode,
            });
        }
        if shared.is_closed() {
            return Err(Error::Terminated);
        }
        if self.resource.is_torn_down() {
            return Err(Error::Invalidated);
        }

        let slot = self.resource.sessions.select();
        let session = slot
            .get_or_create_then(
                || {
                    SessionResource::open(
                        &self.resource.native,
                        self.resource.id,
                        requested,
                        shared.clone(),
                    )
                },
                |session| session.tracker().activate(),
            )
            .await?;

        // Teardown may have swept this slot before the session landed in it.
        if self.resource.is_torn_down() {
            slot.invalidate_if(|current| current.id() == session.id())
                .await;
            return Err(Error::Invalidated);
        }
        Ok(PooledSession::new(session))
    }

    /// Borrows a session with the pool's configured mode.
    pub async fn create_default_session(&self) -> Result<PooledSession<SessionOf<C>>, Error> {
        let mode = self.resource.shared.mode;
        self.create_session(mode.transacted, mode.ack_mode).await
    }

    /// Returns the number of sessions currently open on this connection.
    pub fn session_count(&self) -> usize {
        self.resource.sessions.healthy_count()
    }

    /// Returns the number of sessions currently borrowed from this
    /// connection.
    pub fn load(&self) -> usize {
        self.resource.load()
    }

    /// Returns the native connection.
    pub fn native(&self) -> &C {
        &self.resource.native
    }

    /// Does nothing: the connection stays open for reuse.
    pub fn close(self) {}
}

impl<C: Connection> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.resource.id)
            .finish_non_exhaustive()
    }
}
