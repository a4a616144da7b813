//! The interface to the native messaging client which the pool wraps.
//!
//! The pool never sends or receives messages itself. It only needs to be
//! able to create, and later close, the three kinds of objects a messaging
//! client hands out: connections, sessions, and producers.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(anyhow::Error),
}

/// Credentials used when opening a new native connection.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(username: impl ToString, password: impl ToString) -> Self {
        Self {
            username: Some(username.to_string()),
            password: Some(password.to_string()),
        }
    }

    /// Returns true if neither a username nor a password was supplied.
    pub fn is_empty(&self) -> bool {
        self.username.is_none() && self.password.is_none()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// How messages consumed through a session are acknowledged.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum AckMode {
    #[default]
    Auto,
    Client,
    DupsOk,
}

/// The full mode a session is created with.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct SessionMode {
    pub transacted: bool,
    pub ack_mode: AckMode,
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "transacted={} ack_mode={:?}", self.transacted, self.ack_mode)
    }
}

/// The address messages are sent to.
#[derive(Clone, PartialEq, Eq, Ord, PartialOrd, Debug, Hash)]
pub struct Destination(pub Arc<str>);

impl Destination {
    pub fn new(name: impl ToString) -> Self {
        Self(name.to_string().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for Destination {
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

impl From<&'_ str> for Destination {
    fn from(s: &'_ str) -> Self {
        Self(s.into())
    }
}

/// A callback which a native connection invokes when it has failed
/// asynchronously and can no longer be used.
///
/// A connection holds at most one listener. It may be invoked from any
/// thread, with an optional description of the failure.
#[derive(Clone)]
pub struct FailureListener(Arc<dyn Fn(Option<Error>) + Send + Sync>);

impl FailureListener {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Option<Error>) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Reports that the connection has failed.
    pub fn notify(&self, err: Option<Error>) {
        (self.0)(err)
    }
}

impl std::fmt::Debug for FailureListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureListener").finish_non_exhaustive()
    }
}

/// Describes how native connections should be opened.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Connection;

    /// Opens a new native connection.
    ///
    /// `credentials` is `None` when the caller did not supply any.
    async fn connect(&self, credentials: Option<&Credentials>)
        -> Result<Self::Connection, Error>;
}

/// A native connection, from which sessions are created.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    type Session: Session;

    /// Creates a new native session on this connection.
    async fn create_session(&self, mode: SessionMode) -> Result<Self::Session, Error>;

    /// Registers the listener to be invoked if this connection fails.
    ///
    /// Replaces any previously registered listener.
    fn set_failure_listener(&self, listener: FailureListener);

    /// Closes the connection.
    async fn close(&self) -> Result<(), Error>;
}

/// A native session, from which producers are created.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    type Producer: Producer;

    /// Creates a new native producer for `destination`.
    async fn create_producer(&self, destination: &Destination) -> Result<Self::Producer, Error>;

    /// Closes the session.
    async fn close(&self) -> Result<(), Error>;
}

/// A native message producer.
#[async_trait]
pub trait Producer: Send + Sync + 'static {
    /// Closes the producer.
    async fn close(&self) -> Result<(), Error>;
}

/// The session type created by connections of `C`.
pub type SessionOf<C> = <C as Connection>::Session;

/// The producer type created by sessions of `S`.
pub type ProducerOf<S> = <S as Session>::Producer;

pub type SharedFactory<Conn> = Arc<dyn ConnectionFactory<Connection = Conn>>;
