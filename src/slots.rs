//! Fixed-capacity connection slot table.
//!
//! Slots are addressed by index and allocated once. A slot holds either a
//! complete inbound/outbound pair or nothing at all; there is no way to store
//! one side without the other. Both backlogs live for the lifetime of the
//! table and are reset rather than freed when a slot is vacated.

use std::net::{Shutdown, TcpStream};

use crate::backlog::{Backlog, Direction};
use crate::error::ForwardError;

/// One end of a slot's socket pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Accepted from the listener
    Inbound,
    /// Connected to the remote endpoint
    Outbound,
}

impl Direction {
    /// Side the bytes are read from
    #[must_use]
    pub const fn source(self) -> Side {
        match self {
            Direction::Upstream => Side::Inbound,
            Direction::Downstream => Side::Outbound,
        }
    }

    /// Side the bytes are written to
    #[must_use]
    pub const fn dest(self) -> Side {
        match self {
            Direction::Upstream => Side::Outbound,
            Direction::Downstream => Side::Inbound,
        }
    }
}

#[derive(Debug)]
pub struct Connection<S> {
    pub inbound: S,
    pub outbound: S,
}

impl<S> Connection<S> {
    pub fn side(&self, side: Side) -> &S {
        match side {
            Side::Inbound => &self.inbound,
            Side::Outbound => &self.outbound,
        }
    }
}

/// Mutable view of one direction of an occupied slot.
pub struct Route<'a, S> {
    pub source: &'a mut S,
    pub dest: &'a mut S,
    pub backlog: &'a mut Backlog,
}

#[derive(Debug)]
struct Slot<S> {
    conn: Option<Connection<S>>,
    upstream: Backlog,
    downstream: Backlog,
}

#[derive(Debug)]
pub struct SlotTable<S> {
    slots: Vec<Slot<S>>,
    occupied: usize,
}

impl<S> SlotTable<S> {
    /// Allocate `capacity` empty slots, each with two backlogs of `backlog_size` bytes.
    pub fn new(capacity: usize, backlog_size: usize) -> Result<Self, ForwardError> {
        let alloc_err = || ForwardError::Allocation {
            slots: capacity,
            backlog_size,
        };

        let mut slots = Vec::new();
        slots.try_reserve_exact(capacity).map_err(|_| alloc_err())?;
        for _ in 0..capacity {
            slots.push(Slot {
                conn: None,
                upstream: Backlog::with_capacity(backlog_size).map_err(|_| alloc_err())?,
                downstream: Backlog::with_capacity(backlog_size).map_err(|_| alloc_err())?,
            });
        }

        Ok(Self {
            slots,
            occupied: 0,
        })
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots
    #[must_use]
    pub const fn occupied(&self) -> usize {
        self.occupied
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.occupied >= self.slots.len()
    }

    #[must_use]
    pub fn is_occupied(&self, index: usize) -> bool {
        self.slots
            .get(index)
            .map_or(false, |slot| slot.conn.is_some())
    }

    /// Lowest free index, or `None` when every slot is taken.
    #[must_use]
    pub fn find_free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|slot| slot.conn.is_none())
    }

    pub fn occupied_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.conn.is_some())
            .map(|(index, _)| index)
    }

    /// Install a socket pair into an empty slot with both backlogs reset.
    pub fn occupy(&mut self, index: usize, inbound: S, outbound: S) -> Result<(), ForwardError> {
        let slot = self.slots.get_mut(index).ok_or(ForwardError::Inconsistent {
            slot: index,
            reason: "slot index out of range",
        })?;
        if slot.conn.is_some() {
            return Err(ForwardError::Inconsistent {
                slot: index,
                reason: "occupying a slot that is already in use",
            });
        }

        slot.upstream.clear();
        slot.downstream.clear();
        slot.conn = Some(Connection { inbound, outbound });
        self.occupied += 1;
        Ok(())
    }

    /// Empty the slot. The sockets are dropped, which closes them; returns
    /// `false` if the slot was already empty.
    pub fn vacate(&mut self, index: usize) -> bool {
        let Some(slot) = self.slots.get_mut(index) else {
            return false;
        };
        let Some(conn) = slot.conn.take() else {
            return false;
        };
        drop(conn);

        slot.upstream.clear();
        slot.downstream.clear();
        self.occupied -= 1;
        true
    }

    #[must_use]
    pub fn connection(&self, index: usize) -> Option<&Connection<S>> {
        self.slots.get(index)?.conn.as_ref()
    }

    /// Backlog holding bytes that travel in `direction`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    #[must_use]
    pub fn backlog(&self, index: usize, direction: Direction) -> &Backlog {
        let slot = &self.slots[index];
        match direction {
            Direction::Upstream => &slot.upstream,
            Direction::Downstream => &slot.downstream,
        }
    }

    /// Source, destination and backlog for one direction of an occupied slot.
    pub fn route_mut(&mut self, index: usize, direction: Direction) -> Option<Route<'_, S>> {
        let Slot {
            conn,
            upstream,
            downstream,
        } = self.slots.get_mut(index)?;
        let conn = conn.as_mut()?;

        Some(match direction {
            Direction::Upstream => Route {
                source: &mut conn.inbound,
                dest: &mut conn.outbound,
                backlog: upstream,
            },
            Direction::Downstream => Route {
                source: &mut conn.outbound,
                dest: &mut conn.inbound,
                backlog: downstream,
            },
        })
    }

    /// Vacate every slot, returning how many were occupied.
    pub fn clear(&mut self) -> usize {
        let mut released = 0;
        for index in 0..self.slots.len() {
            if self.vacate(index) {
                released += 1;
            }
        }
        released
    }
}

impl SlotTable<TcpStream> {
    /// Shut down both directions of every live socket, then vacate all slots.
    /// Returns the number of slots released.
    pub fn close_all(&mut self) -> usize {
        for slot in &self.slots {
            if let Some(conn) = &slot.conn {
                let _ = conn.inbound.shutdown(Shutdown::Both);
                let _ = conn.outbound.shutdown(Shutdown::Both);
            }
        }
        self.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::Cell;
    use std::rc::Rc;

    /// Counts how many handles have been dropped.
    struct Handle(Rc<Cell<usize>>);

    impl Drop for Handle {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    fn assert_pairs_consistent<S>(table: &SlotTable<S>) {
        let mut occupied = 0;
        for index in 0..table.capacity() {
            match table.connection(index) {
                Some(_) => {
                    assert!(table.is_occupied(index));
                    occupied += 1;
                }
                None => assert!(!table.is_occupied(index)),
            }
        }
        assert_eq!(occupied, table.occupied());
    }

    #[test]
    fn test_new_table_is_empty() {
        let table: SlotTable<u8> = SlotTable::new(4, 64).unwrap();
        assert_eq!(table.capacity(), 4);
        assert_eq!(table.occupied(), 0);
        assert_eq!(table.find_free_slot(), Some(0));
        assert!(!table.is_full());
        assert_pairs_consistent(&table);
    }

    #[test]
    fn test_occupy_and_vacate() {
        let mut table = SlotTable::new(2, 64).unwrap();
        table.occupy(0, 10u8, 11u8).unwrap();
        assert!(table.is_occupied(0));
        assert_eq!(table.find_free_slot(), Some(1));
        assert_pairs_consistent(&table);

        table.occupy(1, 20u8, 21u8).unwrap();
        assert!(table.is_full());
        assert_eq!(table.find_free_slot(), None);
        assert_pairs_consistent(&table);

        assert!(table.vacate(0));
        assert!(!table.vacate(0));
        assert_eq!(table.occupied(), 1);
        assert_eq!(table.find_free_slot(), Some(0));
        assert_pairs_consistent(&table);
    }

    #[test]
    fn test_occupy_taken_slot_is_inconsistent() {
        let mut table = SlotTable::new(1, 64).unwrap();
        table.occupy(0, 1u8, 2u8).unwrap();
        let err = table.occupy(0, 3u8, 4u8).unwrap_err();
        assert!(matches!(err, ForwardError::Inconsistent { slot: 0, .. }));
        assert_eq!(table.occupied(), 1);
    }

    #[test]
    fn test_vacate_closes_both_sides_and_resets_backlogs() {
        let drops = Rc::new(Cell::new(0));
        let mut table = SlotTable::new(1, 64).unwrap();
        table
            .occupy(0, Handle(drops.clone()), Handle(drops.clone()))
            .unwrap();

        {
            let route = table.route_mut(0, Direction::Upstream).unwrap();
            route.backlog.append(b"stuck").unwrap();
            route.backlog.consume(2);
        }
        table
            .route_mut(0, Direction::Downstream)
            .unwrap()
            .backlog
            .append(b"also stuck")
            .unwrap();

        assert!(table.vacate(0));
        assert_eq!(drops.get(), 2);
        for direction in Direction::BOTH {
            assert!(table.backlog(0, direction).is_empty());
            assert_eq!(table.backlog(0, direction).offset(), 0);
        }
    }

    #[test]
    fn test_route_mut_picks_sides() {
        let mut table = SlotTable::new(1, 64).unwrap();
        table.occupy(0, 'i', 'o').unwrap();

        let up = table.route_mut(0, Direction::Upstream).unwrap();
        assert_eq!((*up.source, *up.dest), ('i', 'o'));
        let down = table.route_mut(0, Direction::Downstream).unwrap();
        assert_eq!((*down.source, *down.dest), ('o', 'i'));

        table.vacate(0);
        assert!(table.route_mut(0, Direction::Upstream).is_none());
    }

    #[test]
    fn test_clear_releases_everything() {
        let drops = Rc::new(Cell::new(0));
        let mut table = SlotTable::new(4, 16).unwrap();
        for index in 0..3 {
            table
                .occupy(index, Handle(drops.clone()), Handle(drops.clone()))
                .unwrap();
        }
        assert_eq!(table.clear(), 3);
        assert_eq!(drops.get(), 6);
        assert_eq!(table.occupied(), 0);
        assert_pairs_consistent(&table);
    }

    #[test]
    fn test_direction_sides() {
        assert_eq!(Direction::Upstream.source(), Side::Inbound);
        assert_eq!(Direction::Upstream.dest(), Side::Outbound);
        assert_eq!(Direction::Downstream.source(), Side::Outbound);
        assert_eq!(Direction::Downstream.dest(), Side::Inbound);
    }
}
