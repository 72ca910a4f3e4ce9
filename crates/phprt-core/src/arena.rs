// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Generational arena backing the record tables.
//!
//! Slots are recycled through an intrusive free list. Generations come
//! from a per-arena counter that never goes backwards, so `reset()` only
//! has to remember where the current script started (`epoch_floor`) to
//! classify handles from earlier scripts as expired.

use crate::id::Handle;

/// Slots kept after a reset; anything beyond is released back to the allocator.
const RETAINED_SLOTS: usize = 256;

/// Why a handle no longer resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stale {
    /// Record was released during the current script.
    Released,
    /// Handle was issued before the last reset.
    Expired,
    /// Handle was never issued by this arena.
    Unknown,
}

struct Slot<T> {
    generation: u64,
    value: Option<T>,
    next_free: Option<u32>,
}

pub(crate) struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
    next_generation: u64,
    epoch_floor: u64,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            len: 0,
            next_generation: 1,
            epoch_floor: 1,
        }
    }

    pub fn insert(&mut self, value: T) -> Handle {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.len += 1;

        if let Some(slot) = self.free_head {
            let entry = &mut self.slots[slot as usize];
            self.free_head = entry.next_free.take();
            entry.generation = generation;
            entry.value = Some(value);
            return Handle { slot, generation };
        }

        let slot = u32::try_from(self.slots.len()).expect("arena slot index overflow");
        self.slots.push(Slot {
            generation,
            value: Some(value),
            next_free: None,
        });
        Handle { slot, generation }
    }

    fn classify(&self, handle: Handle) -> Stale {
        if handle.generation < self.epoch_floor {
            Stale::Expired
        } else if handle.generation >= self.next_generation {
            Stale::Unknown
        } else {
            Stale::Released
        }
    }

    fn live_slot(&self, handle: Handle) -> Option<&Slot<T>> {
        self.slots
            .get(handle.slot as usize)
            .filter(|s| s.generation == handle.generation && s.value.is_some())
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.live_slot(handle).is_some()
    }

    pub fn get(&self, handle: Handle) -> Result<&T, Stale> {
        match self.live_slot(handle) {
            Some(slot) => Ok(slot.value.as_ref().expect("live slot holds a value")),
            None => Err(self.classify(handle)),
        }
    }

    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut T, Stale> {
        if self.live_slot(handle).is_none() {
            return Err(self.classify(handle));
        }
        Ok(self.slots[handle.slot as usize]
            .value
            .as_mut()
            .expect("live slot holds a value"))
    }

    pub fn remove(&mut self, handle: Handle) -> Result<T, Stale> {
        if self.live_slot(handle).is_none() {
            return Err(self.classify(handle));
        }
        let entry = &mut self.slots[handle.slot as usize];
        let value = entry.value.take().expect("live slot holds a value");
        entry.next_free = self.free_head;
        self.free_head = Some(handle.slot);
        self.len -= 1;
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(i, s)| {
            let generation = s.generation;
            s.value.as_mut().map(|v| {
                (
                    Handle {
                        slot: i as u32,
                        generation,
                    },
                    v,
                )
            })
        })
    }

    /// Drop every record and start a new epoch. Returns the removed values
    /// so the caller can drop them outside of any borrow.
    pub fn reset(&mut self) -> Vec<T> {
        let drained: Vec<T> = self.slots.drain(..).filter_map(|s| s.value).collect();
        self.slots.shrink_to(RETAINED_SLOTS);
        self.free_head = None;
        self.len = 0;
        self.epoch_floor = self.next_generation;
        drained
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}
