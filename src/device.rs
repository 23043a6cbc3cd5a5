// Copyright 2026 The pcie-irq Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! PCI functions and their interrupt mode state machine.
//!
//! A [`PciDevice`] is created by the bus driver when a function is discovered (see
//! [`PciBus::add_device`](../bus/struct.PciBus.html#method.add_device)) and starts with
//! interrupts disabled. Drivers then move it between the following modes:
//!
//! ```text
//!            +----------+
//!     +----->| Disabled |<-----+
//!     |      +----------+      |
//!     |        |      |        |
//!     |        v      v        |
//!  +--------+           +-----+
//!  | Legacy |           | Msi |
//!  +--------+           +-----+
//! ```
//!
//! An active mode can only be left for `Disabled`; switching directly between two active modes
//! is refused. While a mode is active, the dispatch path of the function (its legacy line or its
//! MSI vectors) holds a reference to it, so dropping the last driver handle does not tear
//! anything down. [`PciBus::remove_device`](../bus/struct.PciBus.html#method.remove_device) or
//! returning to `Disabled` does.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;

use crate::bus::PciAddress;
use crate::config::{self, Command, ConfigSpace, Status, PCI_CFG_COMMAND, PCI_CFG_STATUS};
use crate::interrupt::legacy::{self, LegacyIrq, SharedLegacyLine};
use crate::interrupt::msi::{self, MsiCapability, MsiController};
use crate::interrupt::{
    Error, InterruptIndex, IrqHandler, IrqMode, IrqModeCaps, IrqModeInfo, Result, VectorSlot,
    VectorTable,
};
use crate::platform::Platform;

// Everything guarded by the device primary lock.
pub(crate) struct IrqState {
    pub(crate) plugged_in: bool,
    pub(crate) disabled: bool,
    pub(crate) mode: IrqMode,
    pub(crate) vectors: VectorTable,
    pub(crate) msi: Option<Arc<MsiController>>,
}

impl IrqState {
    fn is_live(&self) -> bool {
        self.plugged_in && !self.disabled
    }

    /// Release the vector table and return to the disabled mode.
    pub(crate) fn reset_bookkeeping(&mut self) {
        self.vectors.reset();
        self.mode = IrqMode::Disabled;
    }

    fn check_invariants(&self) {
        debug_assert_eq!(self.vectors.is_empty(), self.mode == IrqMode::Disabled);
        debug_assert!(self.vectors.registered() <= self.vectors.len());
        debug_assert_eq!(self.msi.is_some(), self.mode == IrqMode::Msi);
    }
}

/// A PCI/PCIe function, as seen by the interrupt core.
pub struct PciDevice {
    address: PciAddress,
    config: Arc<dyn ConfigSpace>,
    platform: Arc<dyn Platform>,
    legacy: Option<LegacyIrq>,
    msi: Option<MsiCapability>,
    inline_slot: Arc<VectorSlot>,
    // Guards the command/status registers. Taken from interrupt context.
    reg_lock: spin::Mutex<()>,
    state: Mutex<IrqState>,
}

impl PciDevice {
    pub(crate) fn new(
        address: PciAddress,
        config: Arc<dyn ConfigSpace>,
        platform: Arc<dyn Platform>,
        legacy: Option<LegacyIrq>,
        msi: Option<MsiCapability>,
    ) -> Self {
        let inline_slot = Arc::new(VectorSlot::new(address, 0));
        PciDevice {
            address,
            config,
            platform,
            legacy,
            msi,
            inline_slot: inline_slot.clone(),
            reg_lock: spin::Mutex::new(()),
            state: Mutex::new(IrqState {
                plugged_in: true,
                disabled: false,
                mode: IrqMode::Disabled,
                vectors: VectorTable::new(inline_slot),
                msi: None,
            }),
        }
    }

    /// Return the bus/device/function address of the function.
    pub fn address(&self) -> PciAddress {
        self.address
    }

    /// Return the legacy interrupt pin (1 = INTA), or 0 if the function has none.
    pub fn legacy_pin(&self) -> u8 {
        self.legacy.as_ref().map_or(0, |legacy| legacy.pin())
    }

    /// Return the shared legacy line the function's pin is routed to.
    pub fn legacy_line(&self) -> Option<&Arc<SharedLegacyLine>> {
        self.legacy.as_ref().map(|legacy| legacy.line())
    }

    /// Return the parsed MSI capability, if the function has one.
    pub fn msi_capability(&self) -> Option<&MsiCapability> {
        self.msi.as_ref()
    }

    pub(crate) fn config(&self) -> &dyn ConfigSpace {
        &*self.config
    }

    pub(crate) fn config_handle(&self) -> Arc<dyn ConfigSpace> {
        self.config.clone()
    }

    pub(crate) fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    pub(crate) fn legacy(&self) -> Option<&LegacyIrq> {
        self.legacy.as_ref()
    }

    // Vector 0 in legacy mode always lives in the inline slot.
    pub(crate) fn legacy_slot(&self) -> &Arc<VectorSlot> {
        &self.inline_slot
    }

    /// Read the command and status registers under the register lock.
    pub(crate) fn read_command_status(&self) -> (Command, Status) {
        let _guard = self.reg_lock.lock();
        (
            Command::from_bits_truncate(self.config.read16(PCI_CFG_COMMAND)),
            Status::from_bits_truncate(self.config.read16(PCI_CFG_STATUS)),
        )
    }

    /// Update the command register under the register lock.
    pub(crate) fn modify_command(&self, clear: Command, set: Command) {
        let _guard = self.reg_lock.lock();
        config::modify_command(&*self.config, clear, set);
    }

    fn lock_state(&self) -> MutexGuard<'_, IrqState> {
        // Safe to unwrap because there's no legal way to break the mutex.
        self.state.lock().unwrap()
    }

    fn lock_live_state(&self) -> Result<MutexGuard<'_, IrqState>> {
        let state = self.lock_state();
        if state.is_live() {
            Ok(state)
        } else {
            Err(Error::BadState)
        }
    }

    /// Query what `mode` can offer on this function and platform.
    ///
    /// MSI-X is never supported.
    pub fn query_irq_mode_capabilities(&self, mode: IrqMode) -> Result<IrqModeCaps> {
        let _state = self.lock_live_state()?;

        match mode {
            IrqMode::Legacy => {
                if self.legacy.is_none() {
                    return Err(Error::NotSupported);
                }
                Ok(IrqModeCaps {
                    max_vectors: 1,
                    per_vector_masking_supported: true,
                })
            }
            IrqMode::Msi => {
                // No MSI on the platform means no MSI at all, even if the function has it.
                if !self.platform.supports_msi() {
                    return Err(Error::NotSupported);
                }
                let cap = self.msi.as_ref().ok_or(Error::NotSupported)?;
                Ok(IrqModeCaps {
                    max_vectors: cap.max_vectors(),
                    per_vector_masking_supported: cap.mask_reg().is_some()
                        || self.platform.supports_msi_masking(),
                })
            }
            IrqMode::MsiX => Err(Error::NotSupported),
            IrqMode::Disabled => Err(Error::InvalidArgs),
        }
    }

    /// Return the current mode together with the allocated and registered vector counts.
    pub fn get_irq_mode(&self) -> Result<IrqModeInfo> {
        let state = self.lock_live_state()?;
        Ok(IrqModeInfo {
            mode: state.mode,
            max_handlers: state.vectors.len(),
            registered_handlers: state.vectors.registered(),
        })
    }

    /// Select the interrupt mode of the function.
    ///
    /// Switching to [`IrqMode::Disabled`] always succeeds, even on an unplugged function, and
    /// tears down the active mode. Entering an active mode requires interrupts to be disabled
    /// first and at least one vector.
    ///
    /// # Arguments
    /// * `mode`: the mode to enter
    /// * `requested`: number of vectors; ignored when disabling
    pub fn set_irq_mode(self: &Arc<Self>, mode: IrqMode, requested: u32) -> Result<()> {
        let mut state = self.lock_state();

        if mode == IrqMode::Disabled {
            self.disable_irqs_locked(&mut state);
            return Ok(());
        }

        if !state.is_live() {
            return Err(Error::BadState);
        }
        if requested < 1 {
            return Err(Error::InvalidArgs);
        }
        if state.mode != IrqMode::Disabled {
            return Err(Error::BadState);
        }

        let res = match mode {
            IrqMode::Legacy => legacy::enter(self, &mut state, requested),
            IrqMode::Msi => msi::enter(self, &mut state, requested),
            IrqMode::MsiX => Err(Error::NotSupported),
            IrqMode::Disabled => Err(Error::Internal),
        };
        state.check_invariants();

        if res.is_ok() {
            debug!(
                "{}: entered {:?} IRQ mode with {} vector(s)",
                self.address, mode, requested
            );
        }
        res
    }

    fn disable_irqs_locked(&self, state: &mut IrqState) {
        match state.mode {
            IrqMode::Disabled => {
                debug_assert!(state.vectors.is_empty());
                return;
            }
            IrqMode::Legacy => legacy::leave(self, state),
            IrqMode::Msi => msi::leave(self, state),
            // There is no way to enter MSI-X.
            IrqMode::MsiX => {
                debug_assert!(false, "device {} in MSI-X mode", self.address);
                state.reset_bookkeeping();
            }
        }
        debug_assert_eq!(state.vectors.registered(), 0);
        state.check_invariants();
        debug!("{}: IRQs disabled", self.address);
    }

    /// Install (`Some`) or remove (`None`) the handler of `vector`.
    ///
    /// Removing a handler waits for an in-flight invocation of it to return. Mask the vector
    /// first to make sure no new invocation starts.
    pub fn register_irq_handler(
        &self,
        vector: InterruptIndex,
        handler: Option<Arc<dyn IrqHandler>>,
    ) -> Result<()> {
        let mut state = self.lock_live_state()?;

        if state.mode == IrqMode::Disabled {
            return Err(Error::BadState);
        }
        if vector >= state.vectors.len() {
            return Err(Error::InvalidArgs);
        }

        state.vectors.set_handler(vector, handler)
    }

    /// Mask or unmask `vector`.
    ///
    /// Masking is allowed on a function being torn down. Unmasking requires a registered
    /// handler, so an enabled vector always has someone to service it.
    pub fn mask_unmask_irq(&self, vector: InterruptIndex, mask: bool) -> Result<()> {
        let state = self.lock_state();

        if !mask && !state.is_live() {
            return Err(Error::BadState);
        }
        if state.mode == IrqMode::Disabled {
            return Err(Error::BadState);
        }
        let slot = state.vectors.get(vector).ok_or(Error::InvalidArgs)?;
        if !mask && !slot.has_handler() {
            return Err(Error::BadState);
        }

        match state.mode {
            IrqMode::Legacy => legacy::mask_unmask(self, &state, mask),
            IrqMode::Msi => msi::mask_unmask(self, &state, vector, mask).map(|_| ()),
            IrqMode::MsiX => Err(Error::NotSupported),
            IrqMode::Disabled => Err(Error::Internal),
        }
    }

    /// Whether the function is still present on the bus.
    pub fn is_plugged_in(&self) -> bool {
        self.lock_state().plugged_in
    }

    /// Tear down interrupts and mark the function as removed from the bus.
    ///
    /// Every later API call except disabling interrupts or masking fails with
    /// [`Error::BadState`].
    pub fn unplug(&self) {
        let mut state = self.lock_state();
        self.disable_irqs_locked(&mut state);
        state.plugged_in = false;
    }

    /// Mark the function as disabled by the driver framework.
    ///
    /// The interrupt mode is left untouched; the owner is expected to disable it.
    pub fn disable(&self) {
        self.lock_state().disabled = true;
    }
}

impl fmt::Debug for PciDevice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // No locks: this may be called while the state lock is held.
        f.debug_struct("PciDevice")
            .field("address", &self.address)
            .field("legacy_pin", &self.legacy_pin())
            .field("msi", &self.msi)
            .finish()
    }
}
