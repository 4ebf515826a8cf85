//! Error types for portfwd
//!
//! Two severities exist. Per-connection failures never surface here: the
//! affected slot is torn down and the loop carries on. Everything in
//! [`ForwardError`] is process-fatal and ends [`crate::Forwarder::run`].

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::backlog::BacklogOverflow;

/// Invalid start-up configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Remote endpoint is not `HOST:PORT`
    #[error("invalid remote endpoint '{0}', expected HOST:PORT")]
    InvalidRemote(String),

    /// A port of zero where a real port is required
    #[error("'{0}' is a silly port to use")]
    InvalidPort(String),

    /// Connection limit outside 1..=65535
    #[error("'{0}' is a silly maximum, expected 1..=65535 connections")]
    InvalidCapacity(usize),

    /// Backlog capacity of zero bytes
    #[error("backlog size must be at least one byte")]
    InvalidBacklogSize,

    /// Name resolution for the remote host failed
    #[error("could not resolve {endpoint}: {source}")]
    Resolve {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// Name resolution succeeded but produced nothing to connect to
    #[error("{0} resolved to no addresses")]
    NoAddresses(String),
}

/// Process-fatal conditions
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Slot table or backlog allocation failed at start-up
    #[error(
        "can't allocate backlogs for {slots} connections of {backlog_size} bytes each, \
         try decreasing the number of maximum connections"
    )]
    Allocation { slots: usize, backlog_size: usize },

    #[error("problem binding incoming socket to {addr}: you need to be root to bind to a port under 1024")]
    BindPrivileged {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("problem binding incoming socket to {addr}, maybe it's already in use? ({source})")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("problem listening on incoming socket: {0}")]
    Listen(#[source] io::Error),

    #[error("could not take inherited listening socket: {0}")]
    SocketActivation(#[source] io::Error),

    #[error("could not install signal handlers: {0}")]
    Signal(#[source] io::Error),

    /// Admission found no free slot although the table was not full
    #[error("couldn't enqueue connection: no free slot with {occupied} of {capacity} occupied")]
    NoFreeSlot { occupied: usize, capacity: usize },

    /// Internal consistency violation in the slot table
    #[error("internal inconsistency in slot {slot}: {reason}")]
    Inconsistent { slot: usize, reason: &'static str },

    #[error("readiness wait without timeout returned no ready descriptors")]
    SpuriousWakeup,

    #[error("readiness poll failed: {0}")]
    Poll(#[source] io::Error),

    /// Remote connect failure, fatal only in fail-fast mode
    #[error("problem connecting outgoing socket to {remote}: {source}")]
    Connect {
        remote: String,
        #[source]
        source: io::Error,
    },

    /// Backlog overflow, fatal only in fail-fast mode
    #[error("slot {slot}: {source}")]
    Overflow {
        slot: usize,
        #[source]
        source: BacklogOverflow,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T, E = ForwardError> = std::result::Result<T, E>;
