//! Admission control: accept one inbound connection and pair it with a fresh
//! outbound connection to the remote endpoint.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{ConfigError, ForwardError};
use crate::slots::SlotTable;

/// Result of one admission attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Admitted {
    /// The pair now lives in this slot.
    Slot(usize),
    /// Nothing was pending on the listener.
    Idle,
    /// The inbound connection was accepted and closed again.
    Rejected(Rejection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    AtCapacity,
    ConnectFailed,
}

#[derive(Debug)]
pub struct Admission {
    remote: String,
    addrs: Vec<SocketAddr>,
    connect_timeout: Option<Duration>,
    fail_fast: bool,
}

impl Admission {
    /// Resolves the remote endpoint once; it is never looked up again.
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            remote: config.remote.to_string(),
            addrs: config.remote.resolve()?,
            connect_timeout: config.connect_timeout,
            fail_fast: config.fail_fast,
        })
    }

    #[must_use]
    pub fn remote_addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    pub fn accept_incoming(
        &self,
        listener: &TcpListener,
        table: &mut SlotTable<TcpStream>,
    ) -> Result<Admitted, ForwardError> {
        let (incoming, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Admitted::Idle),
            Err(e) => {
                warn!("accept() failed: {e}");
                return Ok(Admitted::Idle);
            }
        };

        if table.is_full() {
            warn!(
                %peer,
                active = table.occupied(),
                "maximum connection limit reached while accepting, this should not happen"
            );
            drop(incoming);
            return Ok(Admitted::Rejected(Rejection::AtCapacity));
        }
        debug!(%peer, active = table.occupied() + 1, "got a connection");

        let index = table.find_free_slot().ok_or(ForwardError::NoFreeSlot {
            occupied: table.occupied(),
            capacity: table.capacity(),
        })?;

        let outgoing = match self.connect() {
            Ok(stream) => stream,
            Err(source) => {
                if self.fail_fast {
                    return Err(ForwardError::Connect {
                        remote: self.remote.clone(),
                        source,
                    });
                }
                debug!(%peer, remote = %self.remote, "problem connecting outgoing socket: {source}");
                return Ok(Admitted::Rejected(Rejection::ConnectFailed));
            }
        };

        if let Err(e) = incoming
            .set_nonblocking(true)
            .and_then(|()| outgoing.set_nonblocking(true))
        {
            debug!(%peer, "could not make connection non-blocking: {e}");
            return Ok(Admitted::Rejected(Rejection::ConnectFailed));
        }

        table.occupy(index, incoming, outgoing)?;
        debug!(slot = index, %peer, active = table.occupied(), "connection established");
        Ok(Admitted::Slot(index))
    }

    /// Synchronous connect, trying each resolved address in turn.
    fn connect(&self) -> io::Result<TcpStream> {
        let Some(timeout) = self.connect_timeout else {
            return TcpStream::connect(&self.addrs[..]);
        };

        let mut last_err = None;
        for addr in &self.addrs {
            match TcpStream::connect_timeout(addr, timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no addresses to connect to")
        }))
    }
}
