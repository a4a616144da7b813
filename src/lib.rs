//! msgpool is a pooling crate for messaging clients.
//!
//! Opening a connection to a message broker is expensive, and so is opening
//! a session on it. msgpool shares a fixed number of each among many callers.
//!
//! It uses the following terminology:
//! * A connection is a native connection to the broker. Each one carries a
//!   fixed number of sessions.
//! * A session is borrowed by one caller at a time, and caches the producers
//!   created through it, by destination.
//! * The load of a connection is the number of its sessions currently
//!   borrowed. Connections and sessions are always selected by lowest load.
//!
//! # Usage
//!
//! * The main interface for this crate is [pool::Pool].
//! * To construct a pool, you must supply a [native::ConnectionFactory],
//!   which describes how native connections are opened, and a
//!   [policy::Policy].
//! * Borrowed sessions are returned to the pool when closed or dropped.
//!   Sessions which stay unborrowed for too long are closed in the
//!   background, and connections which report a failure are closed along
//!   with everything created on them. Either way, they are recreated on
//!   next use.
//!
//! # DTrace probes
//!
//! msgpool contains a number of DTrace USDT probes, which fire as the pool
//! manages its connections and sessions. The full list of probes is:
//!
//! - `connect-start`: Fires before opening a native connection.
//! - `connect-done`: Fires after successfully opening a connection.
//! - `connect-failed`: Fires after failing to open a connection.
//! - `connection-failed`: Fires when an open connection reports a failure.
//! - `session-create-start`: Fires before creating a native session.
//! - `session-create-done`: Fires after successfully creating a session.
//! - `session-create-failed`: Fires after failing to create a session.
//! - `session-borrowed`: Fires before handing a session out to a caller.
//! - `session-returned`: Fires when a session is returned to the pool.
//! - `idle-evicted`: Fires when idle items have been closed.
//!
//! The existence of the probes is behind the `"probes"` feature, which is
//! enabled by default. Probes are zero-cost unless they are explicitly enabled,
//! by tracing the program with the `dtrace(1)` command-line tool.

// Public API
pub mod connection;
pub mod native;
pub mod policy;
pub mod pool;
pub mod session;

// Building blocks of the pool
pub mod balance;
pub mod cache;
pub mod idle;
pub mod slot;

#[cfg(test)]
mod test_utils;

/// USDT probes for tracing how msgpool opens and hands out resources.
#[cfg(feature = "probes")]
#[usdt::provider(provider = "msgpool")]
mod probes {
    /// Fires right before attempting to open a connection, for a slot.
    fn connect__start(pool: &str, slot_index: u64) {}

    /// Fires just after successfully opening a connection.
    fn connect__done(pool: &str, slot_index: u64, connection_id: u64) {}

    /// Fires just after failing to open a connection, with a string
    /// identifying the reason.
    fn connect__failed(pool: &str, slot_index: u64, reason: &str) {}

    /// Fires when a connection reports an asynchronous failure.
    ///
    /// The reason is empty if the connection did not describe the failure.
    fn connection__failed(pool: &str, connection_id: u64, reason: &str) {}

    /// Fires right before attempting to create a session on a connection.
    fn session__create__start(pool: &str, connection_id: u64) {}

    /// Fires just after successfully creating a session.
    fn session__create__done(pool: &str, connection_id: u64, session_id: u64) {}

    /// Fires just after failing to create a session, with a string
    /// identifying the reason.
    fn session__create__failed(pool: &str, connection_id: u64, reason: &str) {}

    /// Fires when a session is handed out to a caller.
    fn session__borrowed(pool: &str, session_id: u64) {}

    /// Fires when a session is returned to the pool, usually when it is
    /// dropped.
    fn session__returned(pool: &str, session_id: u64) {}

    /// Fires after an idle scan closed at least one item.
    fn idle__evicted(name: &str, count: u64) {}
}
