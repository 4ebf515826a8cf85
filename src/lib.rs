//! Single-threaded TCP port forwarder.
//!
//! Every connection accepted on the local port is paired with a fresh
//! connection to one fixed remote endpoint, and bytes are relayed both ways
//! until either side closes. All connections are driven from one thread by a
//! `poll(2)` readiness loop; per-connection backlogs absorb partial writes so
//! a slow peer never blocks the others.
//!
//! ```no_run
//! use portfwd::{Config, Forwarder, RemoteEndpoint};
//!
//! let config = Config::new("0.0.0.0:8080".parse()?, RemoteEndpoint::new("10.0.0.2", 80));
//! let forwarder = Forwarder::new(&config)?;
//! forwarder.install_signal_handlers()?;
//! let report = forwarder.run()?;
//! println!("closed {} sockets", report.sockets_closed);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod admission;
pub mod backlog;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod poller;
pub mod relay;
pub mod scheduler;
pub mod slots;
mod sys;
#[cfg(test)]
mod testing;

pub use backlog::{Backlog, BacklogOverflow, Direction, DEFAULT_BACKLOG_SIZE};
pub use config::{Cli, Config, RemoteEndpoint};
pub use error::{ConfigError, ForwardError};
pub use lifecycle::{Forwarder, ShutdownHandle, ShutdownReport};
pub use scheduler::Tick;
pub use slots::{Side, SlotTable};
