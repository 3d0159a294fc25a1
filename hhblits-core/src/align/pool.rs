//! Fixed set of reusable DP matrices ("bins").
//!
//! A batch leases every slot it needs up front. A lease owns its matrix until
//! it is dropped, so two concurrent alignments can never share storage, and a
//! matrix is reused only after the alignment that held it has finished.

use crate::error::{SearchError, SearchResult};
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};

struct PoolState<M> {
    slots: Vec<Option<M>>,
    free: Vec<usize>,
}

pub struct MatrixPool<M> {
    state: Mutex<PoolState<M>>,
    capacity: usize,
}

impl<M: Default> MatrixPool<M> {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| Some(M::default())).collect();
        // lowest slot index is handed out first
        let free = (0..capacity).rev().collect();
        Self {
            state: Mutex::new(PoolState { slots, free }),
            capacity,
        }
    }
}

impl<M> MatrixPool<M> {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Lease `n` bins at once, or none at all.
    pub fn lease(&self, n: usize) -> SearchResult<Vec<BinLease<'_, M>>> {
        let mut state = self.state.lock();
        if state.free.len() < n {
            return Err(SearchError::ResourceExhausted {
                requested: n,
                available: state.free.len(),
            });
        }
        let mut leases = Vec::with_capacity(n);
        for _ in 0..n {
            let Some(slot) = state.free.pop() else {
                break;
            };
            let matrix = state.slots[slot].take();
            leases.push(BinLease {
                pool: self,
                slot,
                matrix,
            });
        }
        Ok(leases)
    }

    fn release(&self, slot: usize, matrix: M) {
        let mut state = self.state.lock();
        state.slots[slot] = Some(matrix);
        state.free.push(slot);
    }
}

/// Exclusive access to one bin for the lifetime of one alignment.
pub struct BinLease<'p, M> {
    pool: &'p MatrixPool<M>,
    slot: usize,
    matrix: Option<M>,
}

impl<M> BinLease<'_, M> {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl<M: std::fmt::Debug> std::fmt::Debug for BinLease<'_, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinLease")
            .field("slot", &self.slot)
            .field("matrix", &self.matrix)
            .finish()
    }
}

impl<M> Deref for BinLease<'_, M> {
    type Target = M;

    fn deref(&self) -> &M {
        match &self.matrix {
            Some(m) => m,
            None => unreachable!("bin lease without matrix"),
        }
    }
}

impl<M> DerefMut for BinLease<'_, M> {
    fn deref_mut(&mut self) -> &mut M {
        match &mut self.matrix {
            Some(m) => m,
            None => unreachable!("bin lease without matrix"),
        }
    }
}

impl<M> Drop for BinLease<'_, M> {
    fn drop(&mut self) {
        if let Some(matrix) = self.matrix.take() {
            self.pool.release(self.slot, matrix);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_is_all_or_nothing() {
        let pool: MatrixPool<Vec<u8>> = MatrixPool::new(3);
        let held = pool.lease(2).unwrap();
        assert_eq!(pool.available(), 1);
        let err = pool.lease(2).unwrap_err();
        assert!(matches!(
            err,
            SearchError::ResourceExhausted {
                requested: 2,
                available: 1
            }
        ));
        assert_eq!(pool.available(), 1);
        drop(held);
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn storage_survives_release() {
        let pool: MatrixPool<Vec<u8>> = MatrixPool::new(1);
        {
            let mut lease = pool.lease(1).unwrap().pop().unwrap();
            lease.resize(100, 7);
        }
        let lease = pool.lease(1).unwrap().pop().unwrap();
        assert_eq!(lease.len(), 100);
        assert_eq!(lease.slot(), 0);
    }

    #[test]
    fn concurrent_leases_never_share_a_slot() {
        let pool: MatrixPool<Vec<u8>> = MatrixPool::new(4);
        let leases = pool.lease(4).unwrap();
        let mut slots: Vec<usize> = leases.iter().map(|l| l.slot()).collect();
        slots.sort_unstable();
        slots.dedup();
        assert_eq!(slots.len(), 4);
    }
}
