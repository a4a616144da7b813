//! Utilities to help with testing the pool

use crate::native::{self, Credentials, Destination, FailureListener, SessionMode};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

pub fn setup_tracing_subscriber() {
    use tracing_subscriber::fmt::format::FmtSpan;
    // Several tests share a process: only the first one installs the
    // subscriber.
    let _ = tracing_subscriber::fmt()
        .with_thread_names(true)
        .with_span_events(FmtSpan::ENTER)
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

fn refused(what: &str) -> native::Error {
    native::Error::Other(anyhow::anyhow!("{what} refused"))
}

#[derive(Default)]
struct FactoryState {
    connections: Mutex<Vec<FakeConnection>>,
    credentials: Mutex<Vec<Option<Credentials>>>,
    refuse: AtomicBool,
    delay_ms: AtomicU64,
}

/// A test-only connection factory, which records every connection it opens.
#[derive(Clone, Default)]
pub struct FakeConnectionFactory {
    inner: Arc<FactoryState>,
}

impl FakeConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every connection attempt take `delay`.
    pub fn set_delay(&self, delay: Duration) {
        self.inner
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Makes future connection attempts fail (or succeed again).
    pub fn refuse(&self, refuse: bool) {
        self.inner.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Returns every connection opened so far, in order.
    pub fn connections(&self) -> Vec<FakeConnection> {
        self.inner.connections.lock().unwrap().clone()
    }

    /// Returns the credentials passed to each connection attempt.
    pub fn credentials(&self) -> Vec<Option<Credentials>> {
        self.inner.credentials.lock().unwrap().clone()
    }
}

#[async_trait]
impl native::ConnectionFactory for FakeConnectionFactory {
    type Connection = FakeConnection;

    async fn connect(
        &self,
        credentials: Option<&Credentials>,
    ) -> Result<Self::Connection, native::Error> {
        self.inner
            .credentials
            .lock()
            .unwrap()
            .push(credentials.cloned());

        let delay_ms = self.inner.delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        if self.inner.refuse.load(Ordering::SeqCst) {
            return Err(refused("connection"));
        }

        let mut connections = self.inner.connections.lock().unwrap();
        let connection = FakeConnection::new(connections.len());
        connections.push(connection.clone());
        Ok(connection)
    }
}

struct ConnectionState {
    id: usize,
    closed: AtomicBool,
    refuse_sessions: AtomicBool,
    listener: Mutex<Option<FailureListener>>,
    sessions: Mutex<Vec<FakeSession>>,
}

/// A connection handed out by [FakeConnectionFactory].
#[derive(Clone)]
pub struct FakeConnection {
    inner: Arc<ConnectionState>,
}

impl FakeConnection {
    fn new(id: usize) -> Self {
        Self {
            inner: Arc::new(ConnectionState {
                id,
                closed: AtomicBool::new(false),
                refuse_sessions: AtomicBool::new(false),
                listener: Mutex::new(None),
                sessions: Mutex::new(vec![]),
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn has_listener(&self) -> bool {
        self.inner.listener.lock().unwrap().is_some()
    }

    /// Makes future session creation fail (or succeed again).
    pub fn refuse_sessions(&self, refuse: bool) {
        self.inner.refuse_sessions.store(refuse, Ordering::SeqCst);
    }

    /// Returns every session created on this connection, in order.
    pub fn sessions(&self) -> Vec<FakeSession> {
        self.inner.sessions.lock().unwrap().clone()
    }

    /// Signals an asynchronous failure through the registered listener.
    pub fn fail(&self) {
        let listener = self.inner.listener.lock().unwrap().clone();
        if let Some(listener) = listener {
            listener.notify(Some(native::Error::Other(anyhow::anyhow!(
                "connection lost"
            ))));
        }
    }
}

#[async_trait]
impl native::Connection for FakeConnection {
    type Session = FakeSession;

    async fn create_session(&self, mode: SessionMode) -> Result<Self::Session, native::Error> {
        if self.inner.refuse_sessions.load(Ordering::SeqCst) {
            return Err(refused("session"));
        }
        let session = FakeSession::new(mode);
        self.inner.sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }

    fn set_failure_listener(&self, listener: FailureListener) {
        *self.inner.listener.lock().unwrap() = Some(listener);
    }

    async fn close(&self) -> Result<(), native::Error> {
        assert!(
            !self.inner.closed.swap(true, Ordering::SeqCst),
            "Connection {} closed twice",
            self.inner.id
        );
        Ok(())
    }
}

struct SessionState {
    mode: SessionMode,
    closed: AtomicBool,
    producers: Mutex<Vec<FakeProducer>>,
}

/// A session created by a [FakeConnection].
#[derive(Clone)]
pub struct FakeSession {
    inner: Arc<SessionState>,
}

impl FakeSession {
    fn new(mode: SessionMode) -> Self {
        Self {
            inner: Arc::new(SessionState {
                mode,
                closed: AtomicBool::new(false),
                producers: Mutex::new(vec![]),
            }),
        }
    }

    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn mode(&self) -> SessionMode {
        self.inner.mode
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Returns every producer created on this session, in order.
    pub fn producers(&self) -> Vec<FakeProducer> {
        self.inner.producers.lock().unwrap().clone()
    }
}

#[async_trait]
impl native::Session for FakeSession {
    type Producer = FakeProducer;

    async fn create_producer(
        &self,
        destination: &Destination,
    ) -> Result<Self::Producer, native::Error> {
        let producer = FakeProducer::new(destination.clone());
        self.inner.producers.lock().unwrap().push(producer.clone());
        Ok(producer)
    }

    async fn close(&self) -> Result<(), native::Error> {
        assert!(
            !self.inner.closed.swap(true, Ordering::SeqCst),
            "Session closed twice"
        );
        Ok(())
    }
}

struct ProducerState {
    destination: Destination,
    closed: AtomicBool,
}

/// A producer created by a [FakeSession].
#[derive(Clone)]
pub struct FakeProducer {
    inner: Arc<ProducerState>,
}

impl FakeProducer {
    fn new(destination: Destination) -> Self {
        Self {
            inner: Arc::new(ProducerState {
                destination,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.inner.destination
    }

    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl native::Producer for FakeProducer {
    async fn close(&self) -> Result<(), native::Error> {
        assert!(
            !self.inner.closed.swap(true, Ordering::SeqCst),
            "Producer for {} closed twice",
            self.inner.destination
        );
        Ok(())
    }
}
