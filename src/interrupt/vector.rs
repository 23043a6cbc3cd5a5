// Copyright 2026 The pcie-irq Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-function storage of interrupt vector slots.
//!
//! Most functions only ever use a single vector, so every function owns one pre-allocated slot
//! and only multi-vector MSI allocations hit the heap.

use std::ops::Index;
use std::sync::Arc;

use spin::{Mutex, MutexGuard};

use super::{Error, InterruptIndex, IrqHandler, Result};
use crate::bus::PciAddress;

pub(crate) struct SlotState {
    pub(crate) handler: Option<Arc<dyn IrqHandler>>,
    pub(crate) masked: bool,
}

/// Bookkeeping of one interrupt vector of a function.
pub struct VectorSlot {
    device: PciAddress,
    index: InterruptIndex,
    state: Mutex<SlotState>,
}

impl VectorSlot {
    pub(crate) fn new(device: PciAddress, index: InterruptIndex) -> Self {
        VectorSlot {
            device,
            index,
            state: Mutex::new(SlotState {
                handler: None,
                masked: false,
            }),
        }
    }

    /// Address of the function owning this vector.
    pub fn device(&self) -> PciAddress {
        self.device
    }

    /// Index of this vector within the function's allocation.
    pub fn index(&self) -> InterruptIndex {
        self.index
    }

    /// Whether the vector is currently masked.
    pub fn is_masked(&self) -> bool {
        self.state.lock().masked
    }

    /// Whether a handler is installed.
    pub fn has_handler(&self) -> bool {
        self.state.lock().handler.is_some()
    }

    // Innermost lock of the hierarchy. Nothing else may be acquired while it is held, and it is
    // held across handler invocation.
    pub(crate) fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock()
    }

    fn clear(&self) {
        let mut state = self.state.lock();
        state.handler = None;
        state.masked = false;
    }
}

enum VectorStorage {
    Inline(Arc<VectorSlot>),
    Heap(Vec<Arc<VectorSlot>>),
}

/// The vector slots of a function in its current interrupt mode.
///
/// The table is empty while interrupts are disabled.
pub struct VectorTable {
    inline: Arc<VectorSlot>,
    storage: Option<VectorStorage>,
    registered: u32,
}

impl VectorTable {
    pub(crate) fn new(inline: Arc<VectorSlot>) -> Self {
        debug_assert_eq!(inline.index(), 0);
        VectorTable {
            inline,
            storage: None,
            registered: 0,
        }
    }

    /// Allocate `count` slots. Either every slot is allocated or none is.
    pub(crate) fn allocate(&mut self, count: u32) -> Result<()> {
        debug_assert!(count >= 1);
        debug_assert!(self.storage.is_none());

        if count == 1 {
            self.inline.clear();
            self.storage = Some(VectorStorage::Inline(self.inline.clone()));
            return Ok(());
        }

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(count as usize)
            .map_err(|_| Error::OutOfMemory)?;
        let device = self.inline.device();
        slots.extend((0..count).map(|index| Arc::new(VectorSlot::new(device, index))));
        self.storage = Some(VectorStorage::Heap(slots));
        Ok(())
    }

    /// Release the slots and zero the counters. Safe to call on an empty table.
    pub(crate) fn reset(&mut self) {
        if let Some(VectorStorage::Heap(slots)) = self.storage.take() {
            debug_assert!(slots.iter().all(|slot| !Arc::ptr_eq(slot, &self.inline)));
        }
        self.inline.clear();
        self.registered = 0;
    }

    /// Install (`Some`) or remove (`None`) the handler of vector `index`.
    ///
    /// The swap happens under the slot lock, so a concurrent dispatch observes either the old or
    /// the new handler, and removal waits for an in-flight invocation to return.
    pub(crate) fn set_handler(
        &mut self,
        index: InterruptIndex,
        handler: Option<Arc<dyn IrqHandler>>,
    ) -> Result<()> {
        let slot = self.get(index).cloned().ok_or(Error::InvalidArgs)?;
        let mut state = slot.lock();

        match (state.handler.is_some(), handler.is_some()) {
            (true, false) => {
                debug_assert!(self.registered > 0);
                self.registered -= 1;
            }
            (false, true) => self.registered += 1,
            _ => {}
        }
        debug_assert!(self.registered <= self.len());

        state.handler = handler;
        Ok(())
    }

    /// Number of slots.
    pub fn len(&self) -> u32 {
        self.slots().len() as u32
    }

    /// Whether no slots are allocated.
    pub fn is_empty(&self) -> bool {
        self.storage.is_none()
    }

    /// Number of slots with an installed handler.
    pub fn registered(&self) -> u32 {
        self.registered
    }

    /// Return the slot at `index`, or `None` if the index is out of bounds.
    pub fn get(&self, index: InterruptIndex) -> Option<&Arc<VectorSlot>> {
        self.slots().get(index as usize)
    }

    /// Iterate over the slots in index order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<VectorSlot>> {
        self.slots().iter()
    }

    fn slots(&self) -> &[Arc<VectorSlot>] {
        match self.storage {
            Some(VectorStorage::Inline(ref slot)) => std::slice::from_ref(slot),
            Some(VectorStorage::Heap(ref slots)) => slots,
            None => &[],
        }
    }
}

impl Index<InterruptIndex> for VectorTable {
    type Output = Arc<VectorSlot>;
    fn index(&self, index: InterruptIndex) -> &Self::Output {
        &self.slots()[index as usize]
    }
}
