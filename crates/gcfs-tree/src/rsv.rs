//! Metadata space accounting and block reservations.
//!
//! A [`BlockRsv`] holds bytes set aside from [`SpaceInfo`] so that a
//! transaction can COW the tree paths it touches without discovering
//! `ENOSPC` halfway through. Mutations consume reserved bytes; the consumed
//! bytes stay *pinned* until the running transaction commits.
//!
//! Refilling a reservation tops it back up to its `size`. A fail-fast
//! reservation gives up immediately when free space is short; any other
//! reservation first unpins space (a forced commit) and tries again.
//!
//! Reservations release whatever they still hold when dropped.

use gcfs_error::{GcfsError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RsvKind {
    /// Default budget every transaction falls back to.
    Trans,
    /// Short-lived budget owned by a single caller (GC worker, eviction).
    Temp,
}

#[derive(Debug, Default)]
struct RsvState {
    size: u64,
    reserved: u64,
    failfast: bool,
}

/// A metadata reservation carved out of a [`SpaceInfo`].
#[derive(Debug)]
pub struct BlockRsv {
    id: u64,
    kind: RsvKind,
    space: Arc<SpaceInfo>,
    state: Mutex<RsvState>,
}

impl BlockRsv {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> RsvKind {
        self.kind
    }

    /// Target size that [`SpaceInfo::refill`] tops the reservation up to.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    pub fn set_size(&self, size: u64) {
        self.state.lock().size = size;
    }

    /// Bytes currently held.
    #[must_use]
    pub fn reserved(&self) -> u64 {
        self.state.lock().reserved
    }

    #[must_use]
    pub fn failfast(&self) -> bool {
        self.state.lock().failfast
    }

    pub fn set_failfast(&self, failfast: bool) {
        self.state.lock().failfast = failfast;
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        let state = self.state.lock();
        state.reserved >= state.size
    }
}

impl Drop for BlockRsv {
    fn drop(&mut self) {
        let reserved = std::mem::take(&mut self.state.get_mut().reserved);
        self.space.release_reserved(reserved);
        if self.kind == RsvKind::Temp {
            self.space.temp_slot_freed();
        }
        trace!(rsv = self.id, released = reserved, "block_rsv: freed");
    }
}

#[derive(Debug, Default)]
struct SpaceState {
    reserved: u64,
    pinned: u64,
    temp_outstanding: usize,
}

/// Metadata space pool shared by every reservation of one filesystem.
#[derive(Debug)]
pub struct SpaceInfo {
    total: u64,
    max_temp_rsvs: usize,
    next_rsv_id: AtomicU64,
    state: Mutex<SpaceState>,
}

/// Point-in-time view of the pool for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceSnapshot {
    pub total: u64,
    pub reserved: u64,
    pub pinned: u64,
    pub free: u64,
    pub temp_outstanding: usize,
}

impl SpaceInfo {
    #[must_use]
    pub fn new(total: u64, max_temp_rsvs: usize) -> Arc<Self> {
        Arc::new(Self {
            total,
            max_temp_rsvs,
            next_rsv_id: AtomicU64::new(1),
            state: Mutex::new(SpaceState::default()),
        })
    }

    /// Allocate an empty reservation.
    ///
    /// Temporary reservations draw from a bounded pool of slots and fail with
    /// `NoMemory` when none is left.
    pub fn alloc_block_rsv(self: &Arc<Self>, kind: RsvKind) -> Result<Arc<BlockRsv>> {
        if kind == RsvKind::Temp {
            let mut state = self.state.lock();
            if state.temp_outstanding >= self.max_temp_rsvs {
                debug!(
                    outstanding = state.temp_outstanding,
                    max = self.max_temp_rsvs,
                    "block_rsv: temporary slots exhausted"
                );
                return Err(GcfsError::NoMemory);
            }
            state.temp_outstanding += 1;
        }
        let id = self.next_rsv_id.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(BlockRsv {
            id,
            kind,
            space: Arc::clone(self),
            state: Mutex::new(RsvState::default()),
        }))
    }

    /// Give a reservation back; remaining bytes return to the pool once the
    /// last handle is gone.
    pub fn free_block_rsv(&self, rsv: Arc<BlockRsv>) {
        trace!(rsv = rsv.id, "block_rsv: release requested");
        drop(rsv);
    }

    /// Top `rsv` up to its target size.
    pub fn refill(&self, rsv: &BlockRsv) -> Result<()> {
        let (need, failfast) = {
            let state = rsv.state.lock();
            (state.size.saturating_sub(state.reserved), state.failfast)
        };
        if need == 0 {
            return Ok(());
        }
        self.reserve_bytes(rsv, need, !failfast)
    }

    /// Move `bytes` of free space into `rsv`.
    ///
    /// With `flush`, pinned space is released before giving up.
    pub fn reserve_bytes(&self, rsv: &BlockRsv, bytes: u64, flush: bool) -> Result<()> {
        let mut state = self.state.lock();
        if self.free_locked(&state) < bytes {
            if !flush || state.pinned == 0 {
                debug!(rsv = rsv.id, bytes, flush, "block_rsv: reservation failed");
                return Err(GcfsError::NoSpace);
            }
            debug!(rsv = rsv.id, pinned = state.pinned, "block_rsv: flushing pinned space");
            state.pinned = 0;
            if self.free_locked(&state) < bytes {
                return Err(GcfsError::NoSpace);
            }
        }
        state.reserved += bytes;
        drop(state);
        rsv.state.lock().reserved += bytes;
        Ok(())
    }

    /// Consume `bytes` from `rsv` for a tree modification.
    pub fn use_bytes(&self, rsv: &BlockRsv, bytes: u64) -> Result<()> {
        {
            let mut rstate = rsv.state.lock();
            if rstate.reserved < bytes {
                trace!(
                    rsv = rsv.id,
                    reserved = rstate.reserved,
                    bytes,
                    "block_rsv: exhausted"
                );
                return Err(GcfsError::NoSpace);
            }
            rstate.reserved -= bytes;
        }
        let mut state = self.state.lock();
        state.reserved = state.reserved.saturating_sub(bytes);
        state.pinned += bytes;
        Ok(())
    }

    /// Return everything `rsv` still holds to the pool.
    pub fn release_unused(&self, rsv: &BlockRsv) -> u64 {
        let bytes = std::mem::take(&mut rsv.state.lock().reserved);
        self.release_reserved(bytes);
        bytes
    }

    /// Release all pinned space; called when a transaction commits.
    pub fn unpin_all(&self) {
        let mut state = self.state.lock();
        if state.pinned > 0 {
            trace!(pinned = state.pinned, "space: unpinned on commit");
            state.pinned = 0;
        }
    }

    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.free_locked(&self.state.lock())
    }

    #[must_use]
    pub fn snapshot(&self) -> SpaceSnapshot {
        let state = self.state.lock();
        SpaceSnapshot {
            total: self.total,
            reserved: state.reserved,
            pinned: state.pinned,
            free: self.free_locked(&state),
            temp_outstanding: state.temp_outstanding,
        }
    }

    fn free_locked(&self, state: &SpaceState) -> u64 {
        self.total
            .saturating_sub(state.reserved)
            .saturating_sub(state.pinned)
    }

    fn release_reserved(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let mut state = self.state.lock();
        state.reserved = state.reserved.saturating_sub(bytes);
    }

    fn temp_slot_freed(&self) {
        let mut state = self.state.lock();
        state.temp_outstanding = state.temp_outstanding.saturating_sub(1);
    }
}
