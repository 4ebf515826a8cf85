//! Start-up and shutdown of the forwarder.
//!
//! [`Forwarder::new`] allocates the slot table, resolves the remote and
//! obtains the listening socket. [`Forwarder::run`] drives the loop until a
//! shutdown is requested, then releases every socket and backlog exactly once
//! through [`Forwarder::shutdown`].
//!
//! Termination signals never touch forwarder state. The handler only writes a
//! byte to a pipe that the loop always has in its wait set.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use listenfd::ListenFd;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info};

use crate::admission::Admission;
use crate::config::Config;
use crate::error::ForwardError;
use crate::poller::PollSet;
use crate::relay::RelayEngine;
use crate::scheduler::Tick;
use crate::slots::SlotTable;
use crate::sys;

/// Read end of the shutdown pipe, watched by the loop.
#[derive(Debug)]
pub(crate) struct ShutdownSignal {
    reader: OwnedFd,
    writer: Arc<OwnedFd>,
}

impl ShutdownSignal {
    fn new() -> io::Result<Self> {
        let (reader, writer) = sys::pipe()?;
        Ok(Self {
            reader,
            writer: Arc::new(writer),
        })
    }

    fn handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            writer: Arc::clone(&self.writer),
        }
    }
}

impl AsRawFd for ShutdownSignal {
    fn as_raw_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }
}

impl Drop for ShutdownSignal {
    fn drop(&mut self) {
        sys::release_termination_fd(self.writer.as_raw_fd());
    }
}

/// Requests a shutdown from outside the loop, the same way a termination
/// signal does.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    writer: Arc<OwnedFd>,
}

impl ShutdownHandle {
    pub fn trigger(&self) -> io::Result<()> {
        sys::wake(self.writer.as_raw_fd())
    }
}

/// What was released by [`Forwarder::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub slots_released: usize,
    pub sockets_closed: usize,
}

pub struct Forwarder {
    pub(crate) listener: TcpListener,
    pub(crate) table: SlotTable<TcpStream>,
    pub(crate) admission: Admission,
    pub(crate) engine: RelayEngine,
    pub(crate) shutdown: ShutdownSignal,
    pub(crate) probe: PollSet,
    pub(crate) wait: PollSet,
}

impl Forwarder {
    pub fn new(config: &Config) -> Result<Self, ForwardError> {
        config.validate()?;

        let table = SlotTable::new(config.max_connections, config.backlog_size)?;
        let admission = Admission::new(config)?;
        let listener = take_or_bind_listener(config.listen, config.max_connections)?;
        let shutdown = ShutdownSignal::new()?;

        debug!(
            slots = config.max_connections,
            backlog_size = config.backlog_size,
            remote = ?admission.remote_addrs(),
            "forwarder initialised"
        );

        // Every slot contributes two descriptors; plus listener and shutdown pipe.
        let fds = 2 * config.max_connections + 2;
        Ok(Self {
            listener,
            table,
            admission,
            engine: RelayEngine::new(config.backlog_size, config.fail_fast),
            shutdown,
            probe: PollSet::with_capacity(fds),
            wait: PollSet::with_capacity(fds),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Number of occupied slots
    #[must_use]
    pub fn active(&self) -> usize {
        self.table.occupied()
    }

    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.handle()
    }

    /// Turn SIGTERM and SIGINT into shutdown requests for this forwarder and
    /// ignore SIGPIPE.
    pub fn install_signal_handlers(&self) -> Result<(), ForwardError> {
        sys::install_termination_handlers(self.shutdown.writer.as_raw_fd()).map_err(ForwardError::Signal)
    }

    /// Relay until a shutdown is requested or a fatal error occurs.
    pub fn run(mut self) -> Result<ShutdownReport, ForwardError> {
        info!(
            local = ?self.local_addr().ok(),
            capacity = self.table.capacity(),
            "waiting for connections"
        );
        loop {
            match self.poll_once()? {
                Tick::Continue => {}
                Tick::Shutdown => return Ok(self.shutdown()),
            }
        }
    }

    /// Close every connection and the listener, and free all backlogs.
    pub fn shutdown(self) -> ShutdownReport {
        let Self {
            listener,
            mut table,
            ..
        } = self;

        info!(active = table.occupied(), "shutting down");
        let slots_released = table.close_all();
        drop(table);
        drop(listener);

        let report = ShutdownReport {
            slots_released,
            sockets_closed: slots_released * 2,
        };
        debug!(?report, "shutdown complete");
        report
    }
}

/// Use a listening socket handed over by the service manager, or bind one.
fn take_or_bind_listener(addr: SocketAddr, backlog: usize) -> Result<TcpListener, ForwardError> {
    let mut listenfd = ListenFd::from_env();
    let listener = match listenfd
        .take_tcp_listener(0)
        .map_err(ForwardError::SocketActivation)?
    {
        Some(listener) => {
            info!("using inherited listening socket");
            listener
        }
        None => bind_listener(addr, backlog)?,
    };
    listener
        .set_nonblocking(true)
        .map_err(ForwardError::Listen)?;
    Ok(listener)
}

fn bind_listener(addr: SocketAddr, backlog: usize) -> Result<TcpListener, ForwardError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(ForwardError::Listen)?;
    socket
        .set_reuse_address(true)
        .map_err(ForwardError::Listen)?;

    if let Err(source) = socket.bind(&addr.into()) {
        let privileged = addr.port() != 0 && addr.port() < 1024 && unsafe { libc::geteuid() } != 0;
        return Err(if privileged {
            ForwardError::BindPrivileged { addr, source }
        } else {
            ForwardError::Bind { addr, source }
        });
    }

    let backlog = i32::try_from(backlog).unwrap_or(i32::MAX);
    socket.listen(backlog).map_err(ForwardError::Listen)?;
    Ok(socket.into())
}
