//! A pool which shares a few native connections, and their sessions, among
//! many callers.

use crate::balance::LoadBalancedPool;
use crate::connection::{ConnectionResource, PooledConnection};
use crate::idle::{IdleEvictor, ItemSupplier};
use crate::native::{self, Connection, Credentials, SessionMode, SessionOf, SharedFactory};
use crate::policy::Policy;
use crate::session::PooledSession;
use crate::slot::Slot;

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{event, instrument, Level};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Session mode ({requested}) does not match the pool's mode ({expected})")]
    ModeMismatch {
        requested: SessionMode,
        expected: SessionMode,
    },

    #[error("Operation not supported by the pool: {0}")]
    Unsupported(&'static str),

    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("Pool terminated")]
    Terminated,

    #[error("Resource was closed by the pool")]
    Invalidated,

    #[error("Native client error")]
    Native(#[source] Arc<native::Error>),
}

impl From<native::Error> for Error {
    fn from(err: native::Error) -> Self {
        Error::Native(Arc::new(err))
    }
}

/// The name of the pool
#[derive(Clone, Debug)]
pub(crate) struct Name(Arc<str>);

impl Name {
    pub(crate) fn new<S: Into<Arc<str>>>(name: S) -> Self {
        Self(name.into())
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// State shared by the pool and every resource it creates.
pub(crate) struct Shared {
    pub(crate) name: Name,
    pub(crate) mode: SessionMode,
    pub(crate) max_sessions: usize,
    pub(crate) max_producers: usize,
    pub(crate) connection_failures: AtomicU64,
    closed: AtomicBool,
}

impl Shared {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// A point-in-time sample of the pool's gauges and counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Stats {
    /// Live native connections.
    pub connections: usize,

    /// Live native sessions, across all connections.
    pub sessions: usize,

    /// Sessions which are currently borrowed.
    pub active_sessions: usize,

    /// Sessions closed for being idle, since the pool was created.
    pub idle_evicted_sessions: u64,

    /// Asynchronous connection failures, since the pool was created.
    pub connection_failures: u64,
}

type ConnectionSlots<C> = LoadBalancedPool<Slot<ConnectionResource<C>>>;

/// Shares a fixed number of native connections among many callers.
///
/// Each connection carries a fixed number of sessions, and each session
/// caches the producers created through it. Nothing is opened until it is
/// first needed, and sessions left unused for longer than
/// [Policy::max_idle_session_time] are closed in the background.
pub struct Pool<C: Connection> {
    shared: Arc<Shared>,
    policy: Policy,
    factory: SharedFactory<C>,
    connections: Arc<ConnectionSlots<C>>,
    evictor: IdleEvictor,
}

impl<C: Connection> Pool<C> {
    /// Creates a new pool.
    ///
    /// - name: The name of this pool, for instrumentation.
    /// - factory: Describes how native connections should be opened.
    /// - policy: The limits of the pool, and the one session mode it serves.
    ///
    /// Must be called from within a tokio runtime, which runs the idle
    /// eviction task.
    ///
    /// # DTrace probe registration
    ///
    /// With the `"probes"` feature, this also registers the USDT probes of
    /// the crate. Registration failure is logged, and leaves a working pool
    /// without probes.
    #[instrument(skip(factory), name = "Pool::new")]
    pub fn new(name: String, factory: SharedFactory<C>, policy: Policy) -> Result<Self, Error> {
        policy.validate().map_err(Error::InvalidPolicy)?;

        let shared = Arc::new(Shared {
            name: Name::new(name),
            mode: policy.session_mode(),
            max_sessions: policy.max_sessions_per_connection,
            max_producers: policy.max_cached_producers_per_session,
            connection_failures: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        let connections: Arc<ConnectionSlots<C>> = Arc::new(LoadBalancedPool::with_empty_slots(
            "connection",
            policy.max_connections,
        ));

        // Only sessions are evicted for idleness. The set of session slots
        // changes as connections come and go, so it is gathered anew on
        // every scan.
        let items: ItemSupplier = {
            let connections = connections.clone();
            Arc::new(move || {
                connections
                    .items()
                    .iter()
                    .filter_map(|slot| slot.current())
                    .flat_map(|connection| connection.idle_items())
                    .collect::<Vec<_>>()
            })
        };
        let evictor = IdleEvictor::new(
            format!("{}-sessions", shared.name),
            policy.max_idle_session_time,
            Some(policy.idle_check_period()),
            items,
        );

        #[cfg(feature = "probes")]
        if let Err(err) = usdt::register_probes() {
            event!(Level::WARN, err = ?err, "Failed to register USDT probes");
        }

        Ok(Self {
            shared,
            policy,
            factory,
            connections,
            evictor,
        })
    }

    pub fn name(&self) -> &str {
        self.shared.name.as_str()
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Returns a connection, opening it if needed.
    ///
    /// The connection with the fewest borrowed sessions is returned.
    pub async fn create_connection(&self) -> Result<PooledConnection<C>, Error> {
        self.connect(None).await
    }

    /// Like [Self::create_connection], supplying credentials.
    ///
    /// Credentials are only used if a new native connection must be opened.
    /// A live connection is reused no matter which credentials opened it.
    pub async fn create_connection_with(
        &self,
        credentials: &Credentials,
    ) -> Result<PooledConnection<C>, Error> {
        let credentials = (!credentials.is_empty()).then_some(credentials);
        self.connect(credentials).await
    }

    #[instrument(level = "debug", skip(self), err, name = "Pool::connect")]
    async fn connect(
        &self,
        credentials: Option<&Credentials>,
    ) -> Result<PooledConnection<C>, Error> {
        if self.shared.is_closed() {
            return Err(Error::Terminated);
        }

        let slot = self.connections.select();
        let connection = slot
            .get_or_create(|| {
                ConnectionResource::open(
                    self.factory.as_ref(),
                    credentials,
                    Arc::downgrade(slot),
                    slot.index(),
                    self.shared.clone(),
                )
            })
            .await?;

        // "close" may have swept this slot before the connection landed in it.
        if self.shared.is_closed() {
            slot.invalidate_if(|current| current.id() == connection.id())
                .await;
            return Err(Error::Terminated);
        }
        Ok(PooledConnection::new(connection))
    }

    /// Context-style creation is not offered by the pool.
    pub fn create_context(&self) -> Result<(), Error> {
        Err(Error::Unsupported("create_context"))
    }

    /// Borrows a session in the pool's mode, and passes it to `f`.
    ///
    /// The session returns to the pool once `f` is done with it.
    pub async fn with_session<F, Fut, T>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce(PooledSession<SessionOf<C>>) -> Fut,
        Fut: Future<Output = T>,
    {
        let session = self
            .create_connection()
            .await?
            .create_default_session()
            .await?;
        Ok(f(session).await)
    }

    /// Samples the pool's gauges and counters.
    pub fn stats(&self) -> Stats {
        let mut stats = Stats {
            idle_evicted_sessions: self.evictor.evicted(),
            connection_failures: self.shared.connection_failures.load(Ordering::Relaxed),
            ..Default::default()
        };
        for connection in self
            .connections
            .items()
            .iter()
            .filter_map(|slot| slot.current())
        {
            stats.connections += 1;
            stats.sessions += connection.sessions().healthy_count();
            stats.active_sessions += connection.sessions().total_load();
        }
        stats
    }

    /// Closes every connection, session and producer the pool has open.
    ///
    /// Afterwards, borrowing fails with [Error::Terminated]. Closing an
    /// already closed pool does nothing.
    #[instrument(skip(self), fields(name = %self.shared.name), name = "Pool::close")]
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Stop evicting first, so that eviction never races with teardown.
        self.evictor.stop();
        self.connections.close_all().await;
        event!(Level::INFO, "Pool closed");
    }
}

impl<C: Connection> std::fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.shared.name)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
