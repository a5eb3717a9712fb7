// src/slab.rs
use crate::conn::{Conn, SlotState};
use crate::error::{ServerError, ServerResult};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Instant;

/// A slot index paired with the generation it had when the reference was made.
///
/// Packed into the 64-bit epoll token as `generation << 32 | index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnRef {
    pub index: u32,
    pub generation: u32,
}

impl ConnRef {
    #[inline(always)]
    pub fn token(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    #[inline(always)]
    pub fn from_token(token: u64) -> Self {
        Self {
            index: token as u32,
            generation: (token >> 32) as u32,
        }
    }

    /// Whether `conn` is still the connection this reference was made for.
    #[inline]
    pub fn matches(self, conn: &Conn) -> bool {
        conn.generation == self.generation && conn.state != SlotState::Free
    }
}

/// Fixed-capacity table of connection slots, shared by the reactor and workers.
///
/// Slots are allocated once up front and recycled through a LIFO free list.
/// Each slot has its own mutex; the free list has another. A thread never
/// takes the free-list lock and then waits on a slot lock.
pub struct ConnectionTable {
    slots: Box<[Mutex<Conn>]>,
    free: Mutex<Vec<u32>>,
}

impl ConnectionTable {
    pub fn new(capacity: usize, read_buffer: usize, max_body: usize) -> ServerResult<Self> {
        if capacity == 0 || capacity > u32::MAX as usize {
            return Err(ServerError::Config(format!(
                "connection table capacity {capacity} out of range"
            )));
        }

        let slots = (0..capacity)
            .map(|_| Mutex::new(Conn::new(read_buffer, max_body)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        // Lowest index on top.
        let free = (0..capacity as u32).rev().collect();

        Ok(Self {
            slots,
            free: Mutex::new(free),
        })
    }

    /// Lock a slot. Slot state is re-validated by every caller, so a lock
    /// poisoned by a panicking holder is still usable.
    #[inline]
    pub fn lock(&self, index: u32) -> Option<MutexGuard<'_, Conn>> {
        self.slots
            .get(index as usize)
            .map(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Lock a slot only if nobody holds it.
    #[inline]
    pub fn try_lock(&self, index: u32) -> Option<MutexGuard<'_, Conn>> {
        match self.slots.get(index as usize)?.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Place `stream` in a free slot, ready for reading.
    pub fn allocate(&self, stream: TcpStream, peer: SocketAddr, now: Instant) -> ServerResult<ConnRef> {
        let index = {
            let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
            free.pop().ok_or(ServerError::TableFull)?
        };

        let Some(mut conn) = self.lock(index) else {
            return Err(ServerError::TableFull);
        };
        conn.open(stream, peer, now);
        Ok(ConnRef {
            index,
            generation: conn.generation,
        })
    }

    /// Close the connection held in `conn` (locked from slot `index`) and
    /// return the slot to the free list. Returns the socket so the caller can
    /// deregister it before it is dropped.
    pub fn release(&self, index: u32, conn: &mut Conn) -> Option<TcpStream> {
        if conn.state == SlotState::Free {
            return None; // already released
        }
        let stream = conn.close();
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(index);
        stream
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slots currently holding a connection.
    pub fn active(&self) -> usize {
        let free = self.free.lock().unwrap_or_else(PoisonError::into_inner).len();
        self.capacity() - free
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn pair(listener: &TcpListener) -> (TcpStream, TcpStream, SocketAddr) {
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        (client, server, peer)
    }

    #[test]
    fn tokens_round_trip_index_and_generation() {
        let r = ConnRef {
            index: 42,
            generation: 7,
        };
        assert_eq!(r.token(), (7u64 << 32) | 42);
        assert_eq!(ConnRef::from_token(r.token()), r);
        assert_ne!(r.token(), u64::MAX);
    }

    #[test]
    fn test_table_operations() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let table = ConnectionTable::new(2, 64, 64).unwrap();
        assert_eq!(table.capacity(), 2);
        assert_eq!(table.active(), 0);

        let (_c1, s1, p1) = pair(&listener);
        let (_c2, s2, p2) = pair(&listener);
        let (_c3, s3, p3) = pair(&listener);

        let first = table.allocate(s1, p1, Instant::now()).unwrap();
        assert_eq!(first.index, 0);
        let second = table.allocate(s2, p2, Instant::now()).unwrap();
        assert_eq!(second.index, 1);
        assert!(matches!(
            table.allocate(s3, p3, Instant::now()),
            Err(ServerError::TableFull)
        ));

        {
            let mut conn = table.lock(first.index).unwrap();
            assert!(first.matches(&conn));
            assert!(table.release(first.index, &mut conn).is_some());
            assert!(!first.matches(&conn));
            // Double release is a no-op.
            assert!(table.release(first.index, &mut conn).is_none());
        }
        assert_eq!(table.active(), 1);

        // Index 0 is reused under a new generation.
        let (_c4, s4, p4) = pair(&listener);
        let reused = table.allocate(s4, p4, Instant::now()).unwrap();
        assert_eq!(reused.index, 0);
        assert_ne!(reused.generation, first.generation);
        assert!(!first.matches(&table.lock(0).unwrap()));
    }

    #[test]
    fn try_lock_skips_busy_slots() {
        let table = ConnectionTable::new(1, 16, 16).unwrap();
        let held = table.lock(0).unwrap();
        assert!(table.try_lock(0).is_none());
        drop(held);
        assert!(table.try_lock(0).is_some());
        assert!(table.lock(5).is_none());
    }

    #[test]
    fn zero_capacity_is_a_config_error() {
        assert!(matches!(
            ConnectionTable::new(0, 16, 16),
            Err(ServerError::Config(_))
        ));
    }
}
