//! The multiplexing loop.
//!
//! Each iteration runs a two-phase readiness probe:
//!
//! 1. **Snapshot.** Every live socket is polled for read and write with a
//!    zero timeout. Nothing is acted on yet.
//! 2. **Selective wait.** A second, smaller interest set is built from the
//!    snapshot and the backlogs, then polled without a timeout.
//!
//! Polling every socket for write unconditionally would wake the loop
//! continuously, since idle sockets are almost always writable. Instead a
//! socket is only watched for read when its peer can take the data, and only
//! watched for write when there is something to send to it.
//!
//! Dispatch after the wait: admission first, then backlog flushes, then fresh
//! relays. A flush consumes its destination's write-readiness for the rest of
//! the iteration so new data can never overtake backlogged data.

use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use tracing::trace;

use crate::backlog::Direction;
use crate::error::ForwardError;
use crate::lifecycle::Forwarder;
use crate::poller::{Interest, PollSet, Readiness, Token};
use crate::relay::RelayEngine;
use crate::slots::{Side, SlotTable};

/// What the loop should do after an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Continue,
    Shutdown,
}

#[inline]
fn token(index: usize, side: Side) -> Token {
    Token::Slot(index, side)
}

/// Phase 1 interest: both sockets of every occupied slot, read and write.
pub fn plan_snapshot<S: AsRawFd>(table: &SlotTable<S>, set: &mut PollSet) {
    set.clear();
    for index in table.occupied_indices() {
        let Some(conn) = table.connection(index) else {
            continue;
        };
        set.register(token(index, Side::Inbound), conn.inbound.as_raw_fd(), Interest::BOTH);
        set.register(token(index, Side::Outbound), conn.outbound.as_raw_fd(), Interest::BOTH);
    }
}

/// Phase 2 interest, derived from the snapshot and the backlogs.
///
/// `listener` is only registered while the table has room.
pub fn plan_wait<S: AsRawFd>(
    table: &SlotTable<S>,
    snapshot: &Readiness,
    listener: RawFd,
    shutdown: RawFd,
    set: &mut PollSet,
) {
    set.clear();
    set.register(Token::Shutdown, shutdown, Interest::READ);
    if !table.is_full() {
        set.register(Token::Listener, listener, Interest::READ);
    }

    for index in table.occupied_indices() {
        let Some(conn) = table.connection(index) else {
            continue;
        };

        for direction in Direction::BOTH {
            let source = direction.source();
            let dest = direction.dest();
            let backlog_empty = table.backlog(index, direction).is_empty();

            // Pending backlog: wait until the destination can take more.
            if !backlog_empty {
                set.register(token(index, dest), conn.side(dest).as_raw_fd(), Interest::WRITE);
            }
            // Destination writable and nothing queued: worth looking for new data.
            if backlog_empty && snapshot.is_writable(token(index, dest)) {
                set.register(token(index, source), conn.side(source).as_raw_fd(), Interest::READ);
            }
            // Source has data: wait for the destination to accept it.
            if snapshot.is_readable(token(index, source)) {
                set.register(token(index, dest), conn.side(dest).as_raw_fd(), Interest::WRITE);
            }
        }
    }
}

impl Forwarder {
    /// Run one iteration of the loop. Blocks until there is work.
    pub fn poll_once(&mut self) -> Result<Tick, ForwardError> {
        plan_snapshot(&self.table, &mut self.probe);
        let snapshot = if self.probe.is_empty() {
            Readiness::default()
        } else {
            self.probe
                .poll(Some(Duration::ZERO))
                .map_err(ForwardError::Poll)?
        };

        plan_wait(
            &self.table,
            &snapshot,
            self.listener.as_raw_fd(),
            self.shutdown.as_raw_fd(),
            &mut self.wait,
        );
        trace!(
            snapshot_fds = self.probe.len(),
            wait_fds = self.wait.len(),
            active = self.table.occupied(),
            "waiting for readiness"
        );

        let mut ready = self.wait.poll(None).map_err(ForwardError::Poll)?;
        if ready.is_empty() {
            return Err(ForwardError::SpuriousWakeup);
        }
        if ready.is_readable(Token::Shutdown) {
            return Ok(Tick::Shutdown);
        }

        if ready.is_readable(Token::Listener) {
            self.admission
                .accept_incoming(&self.listener, &mut self.table)?;
        }

        ready.merge(&snapshot);
        dispatch(&mut self.table, &mut self.engine, &mut ready)?;
        Ok(Tick::Continue)
    }
}

/// Act on `ready` for every slot: backlog flushes first, then fresh relays.
///
/// A flush takes its destination's write-readiness out of `ready`, so no
/// relay in that direction runs until a later iteration.
pub fn dispatch<S: Read + Write>(
    table: &mut SlotTable<S>,
    engine: &mut RelayEngine,
    ready: &mut Readiness,
) -> Result<(), ForwardError> {
    for index in 0..table.capacity() {
        for direction in Direction::BOTH {
            if !table.is_occupied(index) || table.backlog(index, direction).is_empty() {
                continue;
            }
            if ready.take_writable(token(index, direction.dest())) {
                engine.drain_attempt(table, index, direction)?;
            }
        }

        for direction in Direction::BOTH {
            if table.is_occupied(index)
                && ready.is_readable(token(index, direction.source()))
                && ready.is_writable(token(index, direction.dest()))
            {
                engine.relay(table, index, direction)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    struct Fixture {
        table: SlotTable<UnixStream>,
        // Far ends of the slot sockets, kept alive for the duration of a test.
        peers: Vec<UnixStream>,
        listener: UnixStream,
        shutdown: UnixStream,
    }

    fn fixture(capacity: usize, occupied: usize) -> Fixture {
        let mut table = SlotTable::new(capacity, 64).unwrap();
        let mut peers = Vec::new();
        for index in 0..occupied {
            let (inbound, inbound_peer) = UnixStream::pair().unwrap();
            let (outbound, outbound_peer) = UnixStream::pair().unwrap();
            table.occupy(index, inbound, outbound).unwrap();
            peers.push(inbound_peer);
            peers.push(outbound_peer);
        }
        let (listener, _) = UnixStream::pair().unwrap();
        let (shutdown, _) = UnixStream::pair().unwrap();
        Fixture {
            table,
            peers,
            listener,
            shutdown,
        }
    }

    fn wait_set(fx: &Fixture, snapshot: &Readiness) -> PollSet {
        let mut set = PollSet::default();
        plan_wait(
            &fx.table,
            snapshot,
            fx.listener.as_raw_fd(),
            fx.shutdown.as_raw_fd(),
            &mut set,
        );
        set
    }

    #[test]
    fn test_listener_only_polled_below_capacity() {
        let fx = fixture(2, 1);
        let set = wait_set(&fx, &Readiness::default());
        assert_eq!(set.interest(Token::Listener), Some(Interest::READ));

        let fx = fixture(1, 1);
        let set = wait_set(&fx, &Readiness::default());
        assert_eq!(set.interest(Token::Listener), None);
        assert_eq!(set.interest(Token::Shutdown), Some(Interest::READ));
    }

    #[test]
    fn test_idle_slot_not_polled() {
        // Nothing writable or readable in the snapshot: the slot is left out.
        let fx = fixture(1, 1);
        let set = wait_set(&fx, &Readiness::default());
        assert_eq!(set.interest(token(0, Side::Inbound)), None);
        assert_eq!(set.interest(token(0, Side::Outbound)), None);
    }

    #[test]
    fn test_writable_peer_enables_read_interest() {
        let fx = fixture(1, 1);
        let mut snapshot = Readiness::default();
        snapshot.set_writable(token(0, Side::Inbound));
        snapshot.set_writable(token(0, Side::Outbound));

        let set = wait_set(&fx, &snapshot);
        assert_eq!(set.interest(token(0, Side::Inbound)), Some(Interest::READ));
        assert_eq!(set.interest(token(0, Side::Outbound)), Some(Interest::READ));
    }

    #[test]
    fn test_backlog_suppresses_read_and_requests_write() {
        let mut fx = fixture(1, 1);
        fx.table
            .route_mut(0, Direction::Upstream)
            .unwrap()
            .backlog
            .append(b"queued")
            .unwrap();

        let mut snapshot = Readiness::default();
        snapshot.set_writable(token(0, Side::Outbound));

        let set = wait_set(&fx, &snapshot);
        // Outbound is watched for write to flush; inbound is not read while
        // upstream data is still queued.
        assert_eq!(set.interest(token(0, Side::Outbound)), Some(Interest::WRITE));
        assert_eq!(set.interest(token(0, Side::Inbound)), None);
    }

    #[test]
    fn test_readable_source_requests_dest_write() {
        let fx = fixture(1, 1);
        let mut snapshot = Readiness::default();
        snapshot.set_readable(token(0, Side::Outbound));

        let set = wait_set(&fx, &snapshot);
        assert_eq!(set.interest(token(0, Side::Inbound)), Some(Interest::WRITE));
    }

    #[test]
    fn test_snapshot_covers_every_live_socket() {
        let fx = fixture(3, 2);
        let mut set = PollSet::default();
        plan_snapshot(&fx.table, &mut set);
        assert_eq!(set.len(), 4);
        for index in 0..2 {
            assert_eq!(set.interest(token(index, Side::Inbound)), Some(Interest::BOTH));
            assert_eq!(set.interest(token(index, Side::Outbound)), Some(Interest::BOTH));
        }
    }

    #[test]
    fn test_snapshot_against_real_sockets() {
        let mut fx = fixture(1, 1);
        // Client side of slot 0 sends something.
        fx.peers[0].write_all(b"hello").unwrap();

        let mut probe = PollSet::default();
        plan_snapshot(&fx.table, &mut probe);
        let snapshot = probe.poll(Some(Duration::ZERO)).unwrap();
        assert!(snapshot.is_readable(token(0, Side::Inbound)));
        assert!(snapshot.is_writable(token(0, Side::Outbound)));

        let set = wait_set(&fx, &snapshot);
        let outbound = set.interest(token(0, Side::Outbound)).unwrap();
        assert!(outbound.write);
        assert!(outbound.read);
    }

    #[test]
    fn test_flush_holds_back_fresh_relay_until_next_iteration() {
        let mut fx = fixture(1, 1);
        let mut engine = RelayEngine::new(64, false);
        fx.table
            .route_mut(0, Direction::Upstream)
            .unwrap()
            .backlog
            .append(b"queued")
            .unwrap();
        // Client sends new data while older bytes are still backlogged.
        fx.peers[0].write_all(b"fresh").unwrap();
        fx.peers[1].set_nonblocking(true).unwrap();

        let ready = || {
            let mut ready = Readiness::default();
            ready.set_readable(token(0, Side::Inbound));
            ready.set_writable(token(0, Side::Outbound));
            ready
        };

        dispatch(&mut fx.table, &mut engine, &mut ready()).unwrap();
        assert!(fx.table.backlog(0, Direction::Upstream).is_empty());
        let mut buf = [0u8; 32];
        let n = fx.peers[1].read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"queued");
        // The fresh bytes were not read from the client in the same pass.
        let err = fx.peers[1].read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);

        dispatch(&mut fx.table, &mut engine, &mut ready()).unwrap();
        let n = fx.peers[1].read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"fresh");
    }
}
