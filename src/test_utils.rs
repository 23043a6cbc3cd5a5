// Copyright 2026 The pcie-irq Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

// Test doubles shared by the unit tests of the crate.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::bus::{PciAddress, PciBus};
use crate::config::{ConfigSpace, PCI_CFG_COMMAND, PCI_CFG_INTERRUPT_PIN, PCI_CFG_STATUS};
use crate::device::PciDevice;
use crate::interrupt::msi::PCI_CAP_ID_MSI;
use crate::interrupt::{Error, InterruptIndex, IrqHandler, IrqReturn, Result};
use crate::platform::{InterruptDispatch, MsiBlock, Platform};

pub(crate) const MSI_CAP_OFFSET: u16 = 0x50;

const MSI_TARGET_ADDR: u64 = 0xfee0_0000;

/// Message control value of an MSI capability. `max_vectors` must be a power of two.
pub(crate) fn msi_ctrl(max_vectors: u32, is_64bit: bool, pvm: bool) -> u16 {
    assert!(max_vectors.is_power_of_two() && max_vectors <= 32);
    let mut ctrl = (max_vectors.trailing_zeros() as u16) << 1;
    if is_64bit {
        ctrl |= 1 << 7;
    }
    if pvm {
        ctrl |= 1 << 8;
    }
    ctrl
}

pub(crate) struct MockConfig {
    bytes: Mutex<[u8; 256]>,
    msi_offset: Option<u16>,
}

impl MockConfig {
    pub(crate) fn new() -> Self {
        MockConfig {
            bytes: Mutex::new([0; 256]),
            msi_offset: None,
        }
    }

    pub(crate) fn with_pin(self, pin: u8) -> Self {
        self.bytes.lock().unwrap()[PCI_CFG_INTERRUPT_PIN as usize] = pin;
        self
    }

    pub(crate) fn with_msi(mut self, offset: u16, ctrl: u16) -> Self {
        self.bytes.lock().unwrap()[offset as usize] = PCI_CAP_ID_MSI;
        self.write16(offset + 2, ctrl);
        self.msi_offset = Some(offset);
        self
    }

    pub(crate) fn msi_offset(&self) -> Option<u16> {
        self.msi_offset
    }

    pub(crate) fn command(&self) -> u16 {
        self.read16(PCI_CFG_COMMAND)
    }

    pub(crate) fn set_command(&self, value: u16) {
        self.write16(PCI_CFG_COMMAND, value);
    }

    pub(crate) fn set_int_status(&self, asserted: bool) {
        self.write16(PCI_CFG_STATUS, if asserted { 1 << 3 } else { 0 });
    }
}

impl ConfigSpace for MockConfig {
    fn config_read(&self, offset: u16, data: &mut [u8]) {
        let start = offset as usize;
        data.copy_from_slice(&self.bytes.lock().unwrap()[start..start + data.len()]);
    }

    fn config_write(&self, offset: u16, data: &[u8]) {
        let start = offset as usize;
        self.bytes.lock().unwrap()[start..start + data.len()].copy_from_slice(data);
    }
}

pub(crate) struct CountingHandler {
    pub(crate) hits: AtomicU32,
    ret: IrqReturn,
    order: Option<Arc<Mutex<Vec<PciAddress>>>>,
}

impl CountingHandler {
    pub(crate) fn new(ret: IrqReturn) -> Self {
        CountingHandler {
            hits: AtomicU32::new(0),
            ret,
            order: None,
        }
    }

    /// Also append the address of the interrupting function to `order`.
    pub(crate) fn recording(ret: IrqReturn, order: Arc<Mutex<Vec<PciAddress>>>) -> Self {
        CountingHandler {
            order: Some(order),
            ..Self::new(ret)
        }
    }
}

impl IrqHandler for CountingHandler {
    fn handle(&self, device: &PciDevice, _vector: InterruptIndex) -> IrqReturn {
        self.hits.fetch_add(1, Ordering::SeqCst);
        if let Some(order) = self.order.as_ref() {
            order.lock().unwrap().push(device.address());
        }
        self.ret
    }
}

/// Handler that spins inside its first invocation until [`release`](#method.release) is called.
pub(crate) struct ParkedHandler {
    pub(crate) hits: AtomicU32,
    entered: AtomicBool,
    released: AtomicBool,
}

impl ParkedHandler {
    pub(crate) fn new() -> Self {
        ParkedHandler {
            hits: AtomicU32::new(0),
            entered: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }
    }

    pub(crate) fn wait_until_entered(&self) {
        while !self.entered.load(Ordering::SeqCst) {
            thread::yield_now();
        }
    }

    pub(crate) fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

impl IrqHandler for ParkedHandler {
    fn handle(&self, _device: &PciDevice, _vector: InterruptIndex) -> IrqReturn {
        self.hits.fetch_add(1, Ordering::SeqCst);
        self.entered.store(true, Ordering::SeqCst);
        while !self.released.load(Ordering::SeqCst) {
            thread::yield_now();
        }
        IrqReturn::empty()
    }
}

#[derive(Default)]
struct MockPlatformState {
    fail_irq_registration: bool,
    fail_msi_alloc: bool,
    irq_handlers: HashMap<u32, Arc<dyn InterruptDispatch>>,
    masked_irqs: HashSet<u32>,
    next_msi_base: u32,
    blocks: Vec<MsiBlock>,
    last_alloc_64bit: bool,
    live_blocks: u32,
    msi_handlers: HashMap<(u32, InterruptIndex), Arc<dyn InterruptDispatch>>,
    masked_msi: HashSet<(u32, InterruptIndex)>,
}

/// Platform recording every request of the interrupt core.
///
/// INTx pins are swizzled onto system IRQs 32 to 35, and MSI blocks are rounded up to the next
/// power of two.
pub(crate) struct MockPlatform {
    msi: bool,
    msi_masking: bool,
    state: Mutex<MockPlatformState>,
}

impl MockPlatform {
    pub(crate) fn new(msi: bool, msi_masking: bool) -> Self {
        MockPlatform {
            msi,
            msi_masking,
            state: Mutex::new(MockPlatformState {
                next_msi_base: 64,
                ..Default::default()
            }),
        }
    }

    pub(crate) fn fail_irq_registration(&self, fail: bool) {
        self.state.lock().unwrap().fail_irq_registration = fail;
    }

    pub(crate) fn fail_msi_alloc(&self, fail: bool) {
        self.state.lock().unwrap().fail_msi_alloc = fail;
    }

    pub(crate) fn has_irq_handler(&self, irq: u32) -> bool {
        self.state.lock().unwrap().irq_handlers.contains_key(&irq)
    }

    pub(crate) fn is_irq_masked(&self, irq: u32) -> bool {
        self.state.lock().unwrap().masked_irqs.contains(&irq)
    }

    /// Deliver system IRQ `irq`. Returns `None` if nothing is registered for it.
    pub(crate) fn fire_irq(&self, irq: u32) -> Option<bool> {
        let handler = self.state.lock().unwrap().irq_handlers.get(&irq).cloned();
        handler.map(|handler| handler.dispatch())
    }

    /// Deliver vector `index` of `block`. Returns `None` if nothing is registered for it.
    pub(crate) fn fire_msi(&self, block: &MsiBlock, index: InterruptIndex) -> Option<bool> {
        let handler = self
            .state
            .lock()
            .unwrap()
            .msi_handlers
            .get(&(block.base_irq, index))
            .cloned();
        handler.map(|handler| handler.dispatch())
    }

    pub(crate) fn is_msi_masked(&self, block: &MsiBlock, index: InterruptIndex) -> bool {
        self.state
            .lock()
            .unwrap()
            .masked_msi
            .contains(&(block.base_irq, index))
    }

    pub(crate) fn msi_handler_count(&self) -> usize {
        self.state.lock().unwrap().msi_handlers.len()
    }

    pub(crate) fn live_blocks(&self) -> u32 {
        self.state.lock().unwrap().live_blocks
    }

    pub(crate) fn last_block(&self) -> Option<MsiBlock> {
        self.state.lock().unwrap().blocks.last().copied()
    }

    pub(crate) fn last_alloc_was_64bit(&self) -> bool {
        self.state.lock().unwrap().last_alloc_64bit
    }
}

impl Platform for MockPlatform {
    fn supports_msi(&self) -> bool {
        self.msi
    }

    fn supports_msi_masking(&self) -> bool {
        self.msi_masking
    }

    fn alloc_msi_block(&self, count: u32, is_64bit: bool, is_msix: bool) -> Result<MsiBlock> {
        assert!(!is_msix);
        let mut state = self.state.lock().unwrap();
        if state.fail_msi_alloc || !self.msi {
            return Err(Error::NoResources);
        }

        let num_irq = count.next_power_of_two();
        let base_irq = state.next_msi_base;
        state.next_msi_base += num_irq;
        let target_addr = if is_64bit {
            MSI_TARGET_ADDR | (1 << 32)
        } else {
            MSI_TARGET_ADDR
        };
        let block = MsiBlock {
            target_addr,
            target_data: base_irq & 0xffff,
            base_irq,
            num_irq,
            allocated: true,
        };
        state.blocks.push(block);
        state.last_alloc_64bit = is_64bit;
        state.live_blocks += 1;
        Ok(block)
    }

    fn free_msi_block(&self, block: &mut MsiBlock) {
        assert!(block.allocated);
        let mut state = self.state.lock().unwrap();
        assert!(!state
            .msi_handlers
            .keys()
            .any(|&(base, _)| base == block.base_irq));
        state.live_blocks -= 1;
        block.allocated = false;
    }

    fn register_msi_handler(
        &self,
        block: &MsiBlock,
        index: InterruptIndex,
        handler: Option<Arc<dyn InterruptDispatch>>,
    ) {
        assert!(index < block.num_irq);
        let mut state = self.state.lock().unwrap();
        match handler {
            Some(handler) => {
                state.msi_handlers.insert((block.base_irq, index), handler);
            }
            None => {
                state.msi_handlers.remove(&(block.base_irq, index));
            }
        }
    }

    fn mask_unmask_msi(&self, block: &MsiBlock, index: InterruptIndex, mask: bool) {
        assert!(self.msi_masking);
        let mut state = self.state.lock().unwrap();
        if mask {
            state.masked_msi.insert((block.base_irq, index));
        } else {
            state.masked_msi.remove(&(block.base_irq, index));
        }
    }

    fn map_pin_to_irq(&self, address: PciAddress, pin: u8) -> u32 {
        32 + (u32::from(address.device()) + u32::from(pin) - 1) % 4
    }

    fn register_interrupt_handler(
        &self,
        irq: u32,
        handler: Option<Arc<dyn InterruptDispatch>>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match handler {
            Some(handler) => {
                if state.fail_irq_registration {
                    return Err(Error::NoResources);
                }
                state.irq_handlers.insert(irq, handler);
            }
            None => {
                state.irq_handlers.remove(&irq);
            }
        }
        Ok(())
    }

    fn mask_interrupt(&self, irq: u32) {
        self.state.lock().unwrap().masked_irqs.insert(irq);
    }

    fn unmask_interrupt(&self, irq: u32) {
        self.state.lock().unwrap().masked_irqs.remove(&irq);
    }
}

/// A bus backed by a [`MockPlatform`], keeping track of the configuration space of every
/// function added to it.
pub(crate) struct TestBus {
    pub(crate) bus: PciBus,
    pub(crate) platform: Arc<MockPlatform>,
    configs: Mutex<BTreeMap<PciAddress, Arc<MockConfig>>>,
}

impl TestBus {
    pub(crate) fn new(platform: MockPlatform) -> Self {
        let platform = Arc::new(platform);
        TestBus {
            bus: PciBus::new(platform.clone()),
            platform,
            configs: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn add(&self, bus: u8, device: u8, function: u8, config: MockConfig) -> Arc<PciDevice> {
        let address = PciAddress::new(bus, device, function).unwrap();
        let msi_offset = config.msi_offset();
        let config = Arc::new(config);

        let device = self
            .bus
            .add_device(address, config.clone(), msi_offset)
            .unwrap();
        self.configs.lock().unwrap().insert(address, config);
        device
    }

    pub(crate) fn config(&self, device: &PciDevice) -> Arc<MockConfig> {
        self.configs.lock().unwrap()[&device.address()].clone()
    }
}
