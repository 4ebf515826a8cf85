//! Relay engine: one read-then-forward per call, plus backlog flushing.
//!
//! [`forward`] and [`flush`] work on anything that implements `Read`/`Write`
//! and report what happened. [`RelayEngine`] applies those outcomes to the
//! slot table, tearing the slot down when a connection has ended.

use std::io::{self, Read, Write};

use thiserror::Error;
use tracing::debug;

use crate::backlog::{Backlog, BacklogOverflow, Direction};
use crate::error::ForwardError;
use crate::slots::SlotTable;

/// Why a slot has to be torn down.
#[derive(Debug, Error)]
pub enum Teardown {
    #[error("peer closed the connection")]
    PeerClosed,

    #[error("recv failed: {0}")]
    ReadFailed(#[source] io::Error),

    #[error("send accepted no bytes")]
    WriteZero,

    #[error("send failed: {0}")]
    WriteFailed(#[source] io::Error),

    #[error(transparent)]
    Overflow(#[from] BacklogOverflow),
}

#[derive(Debug)]
pub enum RelayOutcome {
    /// Nothing to do after all (spurious readiness).
    Idle,
    /// `read` bytes taken from the source, `sent` of them delivered, the rest backlogged.
    Forwarded { read: usize, sent: usize },
    Teardown(Teardown),
}

#[derive(Debug)]
pub enum FlushOutcome {
    Idle,
    Flushed { sent: usize, remaining: usize },
    Teardown(Teardown),
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Read once from `source` into `scratch` and send what was read to `dest`.
/// Whatever `dest` does not take is appended to `backlog`.
pub fn forward<R, W>(
    source: &mut R,
    dest: &mut W,
    scratch: &mut [u8],
    backlog: &mut Backlog,
) -> RelayOutcome
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let read = match source.read(scratch) {
        Ok(0) => return RelayOutcome::Teardown(Teardown::PeerClosed),
        Ok(n) => n,
        Err(e) if is_transient(&e) => return RelayOutcome::Idle,
        Err(e) => return RelayOutcome::Teardown(Teardown::ReadFailed(e)),
    };

    let sent = match dest.write(&scratch[..read]) {
        Ok(0) => return RelayOutcome::Teardown(Teardown::WriteZero),
        Ok(n) => n,
        // The data is already out of the source, so it has to be kept.
        Err(e) if is_transient(&e) => 0,
        Err(e) => return RelayOutcome::Teardown(Teardown::WriteFailed(e)),
    };

    if sent < read {
        if let Err(overflow) = backlog.append(&scratch[sent..read]) {
            return RelayOutcome::Teardown(Teardown::Overflow(overflow));
        }
    }

    RelayOutcome::Forwarded { read, sent }
}

/// Try to send everything pending in `backlog` to `dest`.
pub fn flush<W>(dest: &mut W, backlog: &mut Backlog) -> FlushOutcome
where
    W: Write + ?Sized,
{
    if backlog.is_empty() {
        return FlushOutcome::Idle;
    }

    match dest.write(backlog.pending()) {
        Ok(0) => FlushOutcome::Teardown(Teardown::WriteZero),
        Ok(sent) => {
            backlog.consume(sent);
            FlushOutcome::Flushed {
                sent,
                remaining: backlog.len(),
            }
        }
        Err(e) if is_transient(&e) => FlushOutcome::Idle,
        Err(e) => FlushOutcome::Teardown(Teardown::WriteFailed(e)),
    }
}

/// Drives [`forward`] and [`flush`] against the slot table.
#[derive(Debug)]
pub struct RelayEngine {
    scratch: Vec<u8>,
    fail_fast: bool,
}

impl RelayEngine {
    /// `scratch_size` must match the backlog capacity so a single read can
    /// always be backlogged in full.
    pub fn new(scratch_size: usize, fail_fast: bool) -> Self {
        Self {
            scratch: vec![0u8; scratch_size],
            fail_fast,
        }
    }

    /// One relay in `direction` for slot `index`.
    pub fn relay<S>(
        &mut self,
        table: &mut SlotTable<S>,
        index: usize,
        direction: Direction,
    ) -> Result<RelayOutcome, ForwardError>
    where
        S: Read + Write,
    {
        let Some(route) = table.route_mut(index, direction) else {
            return Ok(RelayOutcome::Idle);
        };

        let outcome = forward(route.source, route.dest, &mut self.scratch, route.backlog);
        match outcome {
            RelayOutcome::Forwarded { read, sent } => {
                let active = table.occupied();
                if sent < read {
                    debug!(
                        slot = index,
                        ?direction,
                        read,
                        sent,
                        backlog = table.backlog(index, direction).len(),
                        active,
                        "partial send, backlogged remainder"
                    );
                } else {
                    debug!(slot = index, ?direction, read, active, "relayed");
                }
                Ok(RelayOutcome::Forwarded { read, sent })
            }
            RelayOutcome::Teardown(reason) => {
                self.teardown(table, index, direction, reason)?;
                Ok(RelayOutcome::Idle)
            }
            RelayOutcome::Idle => Ok(RelayOutcome::Idle),
        }
    }

    /// Flush the backlog for `direction` of slot `index` towards its destination.
    pub fn drain_attempt<S>(
        &mut self,
        table: &mut SlotTable<S>,
        index: usize,
        direction: Direction,
    ) -> Result<FlushOutcome, ForwardError>
    where
        S: Read + Write,
    {
        let Some(route) = table.route_mut(index, direction) else {
            return Ok(FlushOutcome::Idle);
        };

        match flush(route.dest, route.backlog) {
            FlushOutcome::Flushed { sent, remaining } => {
                debug!(
                    slot = index,
                    ?direction,
                    sent,
                    remaining,
                    active = table.occupied(),
                    "flushed backlog"
                );
                Ok(FlushOutcome::Flushed { sent, remaining })
            }
            FlushOutcome::Teardown(reason) => {
                self.teardown(table, index, direction, reason)?;
                Ok(FlushOutcome::Idle)
            }
            FlushOutcome::Idle => Ok(FlushOutcome::Idle),
        }
    }

    fn teardown<S>(
        &self,
        table: &mut SlotTable<S>,
        index: usize,
        direction: Direction,
        reason: Teardown,
    ) -> Result<(), ForwardError> {
        table.vacate(index);
        let active = table.occupied();

        match reason {
            Teardown::Overflow(source) => {
                if self.fail_fast {
                    return Err(ForwardError::Overflow {
                        slot: index,
                        source,
                    });
                }
                debug!(slot = index, ?direction, active, "{source}, connection dropped");
            }
            reason => debug!(slot = index, ?direction, active, "connection closed: {reason}"),
        }
        Ok(())
    }
}
