// Copyright 2026 The pcie-irq Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Traits and Structs to manage the interrupts of PCI/PCIe functions.
//!
//! A PCI function may signal interrupts in several ways:
//! * Legacy Irq: one INTx pin per function, wired (through bridges and the platform interrupt
//!   controller) to a system interrupt line which is usually shared with other functions.
//! * PCI MSI Irq: the function writes a message to a platform provided address. A function may
//!   own 1, 2, 4, 8, 16 or 32 vectors, granted as a power of two block.
//! * PCI MSIx Irq: not supported, it is reported as such by every query.
//!
//! A driver first picks one of those delivery modes for its function with
//! [`PciDevice::set_irq_mode`](../device/struct.PciDevice.html#method.set_irq_mode), then
//! installs one [`IrqHandler`] per vector and unmasks the vectors it wants to receive. Handlers
//! run in interrupt context, concurrently with the driver thread and with each other.
//!
//! The interrupt core keeps every delivery path safe against concurrent API calls with the
//! following lock hierarchy, outermost first:
//! 1. the bus wide legacy line registry lock (never held together with a device lock),
//! 2. the device primary lock, taken by every public entry point,
//! 3. the list/dispatch lock of a shared legacy line,
//! 4. the device register lock guarding the command/status registers,
//! 5. the per-vector slot lock, held across handler invocation.
//!
//! Because the slot lock is held while a handler runs, a handler must never (un)register a
//! handler for its own vector. Drivers must mask a vector before unregistering its handler if they
//! want to be sure no late invocation is in flight.

use std::convert::TryFrom;
use std::fmt::{self, Display};
use std::result;

use bitflags::bitflags;
use vmm_sys_util::errno;

use crate::device::PciDevice;

pub mod legacy;
pub mod msi;
mod vector;

pub use self::vector::{VectorSlot, VectorTable};

/// Errors associated with PCI interrupt management.
#[derive(Debug, Eq, PartialEq)]
pub enum Error {
    /// An argument (vector index, mode, ...) is not valid.
    InvalidArgs,

    /// The operation is not supported by this device and platform pairing.
    NotSupported,

    /// The device is not in a state where the operation is allowed.
    BadState,

    /// The platform ran out of interrupt resources.
    NoResources,

    /// Failed to allocate bookkeeping memory.
    OutOfMemory,

    /// An internal inconsistency was detected.
    Internal,
}

/// Specialized result type for PCI interrupt management.
pub type Result<T> = result::Result<T, Error>;

impl Error {
    /// Return the errno value reported to errno speaking callers.
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidArgs => libc::EINVAL,
            Error::NotSupported => libc::ENOTSUP,
            Error::BadState => libc::EBUSY,
            Error::NoResources => libc::ENOSPC,
            Error::OutOfMemory => libc::ENOMEM,
            Error::Internal => libc::EIO,
        }
    }
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PCI interrupt error: ")?;
        match self {
            Error::InvalidArgs => write!(f, "invalid arguments"),
            Error::NotSupported => write!(f, "operation not supported"),
            Error::BadState => write!(f, "device is in the wrong state"),
            Error::NoResources => write!(f, "out of interrupt resources"),
            Error::OutOfMemory => write!(f, "out of memory"),
            Error::Internal => write!(f, "internal error"),
        }
    }
}

impl From<Error> for errno::Error {
    fn from(e: Error) -> errno::Error {
        errno::Error::new(e.errno())
    }
}

/// Data type to store the index of a vector within a function's allocation.
pub type InterruptIndex = u32;

/// Interrupt delivery modes of a PCI function.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IrqMode {
    /// No interrupts are delivered.
    Disabled = 0,
    /// Shared legacy INTx line.
    Legacy = 1,
    /// Message signaled interrupts.
    Msi = 2,
    /// Extended message signaled interrupts. Never supported.
    MsiX = 3,
}

impl TryFrom<u32> for IrqMode {
    type Error = Error;

    fn try_from(mode: u32) -> Result<Self> {
        match mode {
            0 => Ok(IrqMode::Disabled),
            1 => Ok(IrqMode::Legacy),
            2 => Ok(IrqMode::Msi),
            3 => Ok(IrqMode::MsiX),
            _ => Err(Error::InvalidArgs),
        }
    }
}

/// Capabilities of one interrupt mode on a given function.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IrqModeCaps {
    /// Maximum number of vectors which may be requested in this mode.
    pub max_vectors: u32,
    /// Whether individual vectors can be masked.
    pub per_vector_masking_supported: bool,
}

/// Snapshot of the interrupt mode of a function.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IrqModeInfo {
    /// Current mode.
    pub mode: IrqMode,
    /// Number of vectors allocated in the current mode.
    pub max_handlers: u32,
    /// Number of vectors with a registered handler.
    pub registered_handlers: u32,
}

bitflags! {
    /// Value returned by an [`IrqHandler`].
    ///
    /// The two bits are independent and may be combined freely.
    pub struct IrqReturn: u32 {
        /// Leave the vector masked after the handler returns.
        const MASK = 1 << 0;
        /// Ask the platform to reschedule on the way out of the interrupt.
        const RESCHEDULE = 1 << 1;
    }
}

/// Driver supplied interrupt handler, invoked in interrupt context.
///
/// Any driver context is carried by the implementing object itself.
///
/// # Example
/// ```
/// # use std::sync::atomic::{AtomicU32, Ordering};
/// # use pcie_irq::device::PciDevice;
/// # use pcie_irq::interrupt::{InterruptIndex, IrqHandler, IrqReturn};
/// struct Counter {
///     hits: AtomicU32,
/// }
///
/// impl IrqHandler for Counter {
///     fn handle(&self, _device: &PciDevice, _vector: InterruptIndex) -> IrqReturn {
///         self.hits.fetch_add(1, Ordering::SeqCst);
///         IrqReturn::RESCHEDULE
///     }
/// }
/// ```
pub trait IrqHandler: Send + Sync {
    /// Service an interrupt raised by `vector` of `device`.
    fn handle(&self, device: &PciDevice, vector: InterruptIndex) -> IrqReturn;
}

impl<F> IrqHandler for F
where
    F: Fn(&PciDevice, InterruptIndex) -> IrqReturn + Send + Sync,
{
    fn handle(&self, device: &PciDevice, vector: InterruptIndex) -> IrqReturn {
        self(device, vector)
    }
}
