// Copyright (C) Dragonball Team. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Black-box lifecycle and listener-integration tests against the public
//! surface, using in-memory fakes for every collaborator trait instead of
//! a real kernel accelerator.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use dbs_vhost_accel::collaborators::{
    AddressSpaceFramework, AddressSpaceId, DeviceBinding, EmulatedVirtqueue, GuestMemoryMapper,
    ListenerTag, MappedRegion, MemorySection, RegionId, RegistrationHandle,
};
use dbs_vhost_accel::control::{AccelControlChannel, VhostMemoryRegion, VhostVringAddr};
use dbs_vhost_accel::error::{Error, Result};
use dbs_vhost_accel::listener::Notification;
use dbs_vhost_accel::DeviceHandle;

#[derive(Default)]
struct ChannelCalls {
    set_mem_table: u32,
    set_log_base: Vec<u64>,
    set_features: Vec<u64>,
}

struct FakeChannel {
    calls: Rc<RefCell<ChannelCalls>>,
    vring_base: Cell<u32>,
}

impl AccelControlChannel for FakeChannel {
    fn set_owner(&self) -> Result<()> {
        Ok(())
    }
    fn get_features(&self) -> Result<u64> {
        Ok(0xFFFF_FFFF)
    }
    fn set_features(&self, features: u64) -> Result<()> {
        self.calls.borrow_mut().set_features.push(features);
        Ok(())
    }
    fn set_mem_table(&self, _regions: &[VhostMemoryRegion]) -> Result<()> {
        self.calls.borrow_mut().set_mem_table += 1;
        Ok(())
    }
    fn set_log_base(&self, base: u64) -> Result<()> {
        self.calls.borrow_mut().set_log_base.push(base);
        Ok(())
    }
    fn set_vring_num(&self, _index: u32, _num: u32) -> Result<()> {
        Ok(())
    }
    fn set_vring_addr(&self, _addr: &VhostVringAddr) -> Result<()> {
        Ok(())
    }
    fn set_vring_base(&self, _index: u32, _num: u32) -> Result<()> {
        Ok(())
    }
    fn get_vring_base(&self, _index: u32) -> Result<u32> {
        Ok(self.vring_base.get())
    }
    fn set_vring_kick(&self, _index: u32, _fd: i32) -> Result<()> {
        Ok(())
    }
    fn set_vring_call(&self, _index: u32, _fd: i32) -> Result<()> {
        Ok(())
    }
}

struct FakeMapper {
    fail_at: Option<u64>,
}

impl GuestMemoryMapper for FakeMapper {
    fn map(&self, guest_phys: u64, len: u64, _writable: bool) -> Result<MappedRegion> {
        if Some(guest_phys) == self.fail_at {
            return Err(Error::NoMemory);
        }
        Ok(MappedRegion { host_ptr: 0x5000_0000 + guest_phys, len })
    }
    fn unmap(&self, _mapping: &MappedRegion, _dirty_len: u64) {}
}

struct FakeVq {
    num: u32,
    desc: u64,
    avail: u64,
    used: u64,
    ring: u64,
    ring_size: u64,
    last_avail_idx: Cell<u16>,
}

impl FakeVq {
    fn new(slot: u64) -> Self {
        FakeVq {
            num: 256,
            desc: 0x1000 + slot * 0x1_0000,
            avail: 0x2000 + slot * 0x1_0000,
            used: 0x3000 + slot * 0x1_0000,
            ring: 0x1000 + slot * 0x1_0000,
            ring_size: 0x2000,
            last_avail_idx: Cell::new(0),
        }
    }
}

impl EmulatedVirtqueue for FakeVq {
    fn num(&self) -> u32 {
        self.num
    }
    fn desc_addr(&self) -> u64 {
        self.desc
    }
    fn avail_addr(&self) -> u64 {
        self.avail
    }
    fn used_addr(&self) -> u64 {
        self.used
    }
    fn ring_addr(&self) -> u64 {
        self.ring
    }
    fn ring_size(&self) -> u64 {
        self.ring_size
    }
    fn last_avail_idx(&self) -> u16 {
        self.last_avail_idx.get()
    }
    fn set_last_avail_idx(&self, idx: u16) {
        self.last_avail_idx.set(idx);
    }
    fn host_notifier_fd(&self) -> i32 {
        20
    }
    fn guest_notifier_fd(&self) -> i32 {
        21
    }
}

struct FakeBinding {
    host_notifiers: Rc<RefCell<Vec<bool>>>,
    guest_notifiers: Rc<Cell<bool>>,
    supports_guest_notifiers: bool,
}

impl DeviceBinding for FakeBinding {
    fn set_host_notifier(&self, idx: u16, on: bool) -> Result<()> {
        self.host_notifiers.borrow_mut()[idx as usize] = on;
        Ok(())
    }
    fn set_guest_notifiers(&self, on: bool) -> Result<()> {
        self.guest_notifiers.set(on);
        Ok(())
    }
    fn query_guest_notifiers(&self) -> bool {
        self.supports_guest_notifiers
    }
}

struct FakeFramework {
    ram_ptrs: HashMap<u64, u64>,
    dirty: RefCell<Vec<(u64, u64, u64)>>,
}

impl AddressSpaceFramework for FakeFramework {
    fn is_system_memory(&self, _space: AddressSpaceId) -> bool {
        true
    }
    fn is_ram(&self, _region: RegionId) -> bool {
        true
    }
    fn is_logging(&self, _region: RegionId) -> bool {
        false
    }
    fn get_ram_ptr(&self, region: RegionId) -> Option<u64> {
        self.ram_ptrs.get(&region.0).copied()
    }
    fn mark_dirty(&self, region: RegionId, offset: u64, len: u64) {
        self.dirty.borrow_mut().push((region.0, offset, len));
    }
    fn register_listener(&self, tag: ListenerTag) -> RegistrationHandle {
        RegistrationHandle(tag.0)
    }
    fn deregister_listener(&self, _handle: RegistrationHandle) {}
}

fn section(offset: u64, size: u64) -> MemorySection {
    MemorySection {
        address_space: AddressSpaceId(0),
        memory_region: RegionId(0),
        offset_within_address_space: offset,
        offset_within_region: offset,
        size,
    }
}

fn make_device(
    nvqs: usize,
    vring_base: u32,
    mapper_fail_at: Option<u64>,
    supports_guest_notifiers: bool,
) -> (DeviceHandle, Rc<RefCell<ChannelCalls>>, Rc<RefCell<Vec<bool>>>) {
    let calls = Rc::new(RefCell::new(ChannelCalls::default()));
    let host_notifiers = Rc::new(RefCell::new(vec![false; nvqs]));

    let channel = FakeChannel { calls: calls.clone(), vring_base: Cell::new(vring_base) };
    let mapper = FakeMapper { fail_at: mapper_fail_at };
    let binding = FakeBinding {
        host_notifiers: host_notifiers.clone(),
        guest_notifiers: Rc::new(Cell::new(false)),
        supports_guest_notifiers,
    };
    let framework = FakeFramework {
        ram_ptrs: HashMap::from([(0, 0x5000_0000)]),
        dirty: RefCell::new(Vec::new()),
    };

    let vqs: Vec<Box<dyn EmulatedVirtqueue>> =
        (0..nvqs).map(|i| Box::new(FakeVq::new(i as u64)) as Box<dyn EmulatedVirtqueue>).collect();

    let dev = DeviceHandle::init(
        Box::new(channel),
        Box::new(mapper),
        Box::new(binding),
        Box::new(framework),
        vqs,
        ListenerTag(7),
        false,
        4,
    )
    .expect("init should succeed");

    (dev, calls, host_notifiers)
}

#[test]
fn full_lifecycle_start_log_stop_cleanup() {
    let (mut dev, calls, _) = make_device(2, 0, None, true);

    dev.query().expect("query should succeed when binding supports guest notifiers");
    dev.set_acked_features(dev.avail_features());
    dev.start().expect("start should succeed");
    assert!(dev.is_started());

    dev.dispatch(Notification::RegionAdd(section(0, 0x10000))).unwrap();
    assert_eq!(dev.memory_table().len(), 1);

    dev.dispatch(Notification::LogGlobalStart).unwrap();
    assert!(dev.is_log_enabled());
    assert!(!calls.borrow().set_log_base.is_empty());

    dev.dispatch(Notification::RegionAdd(section(0x10000, 0x10000))).unwrap();
    assert_eq!(dev.memory_table().len(), 1, "adjacent additions should merge");

    dev.dispatch(Notification::LogGlobalStop).unwrap();
    assert!(!dev.is_log_enabled());

    dev.dispatch(Notification::RegionDel(section(0, 0x20000))).unwrap();
    assert!(dev.memory_table().is_empty());

    dev.stop().expect("stop should succeed");
    assert!(!dev.is_started());
    dev.cleanup().expect("cleanup should succeed once stopped");
}

#[test]
fn start_stop_restores_avail_idx_via_get_vring_base() {
    let (mut dev, _, _) = make_device(1, 42, None, true);
    dev.start().unwrap();
    dev.stop().unwrap();
    // Nothing observable from outside about the emulated queue's
    // last_avail_idx here (it lives in the fake owned by `make_device`),
    // but `stop` must succeed, which only happens if GET_VRING_BASE's
    // value was accepted and written back without erroring the unwind
    // path.
    assert!(!dev.is_started());
}

#[test]
fn start_unwinds_host_notifiers_on_virtqueue_mapping_failure() {
    // vq[1]'s `used` ring lives at 0x3000 + 1*0x10000 = 0x13000; fail that
    // mapping so `start` must unwind vq[0]'s bind and both host notifiers.
    let (mut dev, _, host_notifiers) = make_device(2, 0, Some(0x1_3000), true);
    let result = dev.start();
    assert!(result.is_err());
    assert!(!dev.is_started());
    assert!(host_notifiers.borrow().iter().all(|&on| !on), "all host notifiers must be unwound");
}

#[test]
fn query_fails_without_force_when_binding_lacks_guest_notifiers() {
    let (dev, _, _) = make_device(1, 0, None, false);
    assert!(matches!(dev.query(), Err(Error::NotSupported(_))));
}

#[test]
fn query_succeeds_forced_despite_missing_guest_notifier_support() {
    let calls = Rc::new(RefCell::new(ChannelCalls::default()));
    let host_notifiers = Rc::new(RefCell::new(vec![false; 1]));
    let channel = FakeChannel { calls: calls.clone(), vring_base: Cell::new(0) };
    let mapper = FakeMapper { fail_at: None };
    let binding = FakeBinding {
        host_notifiers: host_notifiers.clone(),
        guest_notifiers: Rc::new(Cell::new(false)),
        supports_guest_notifiers: false,
    };
    let framework =
        FakeFramework { ram_ptrs: HashMap::from([(0, 0x5000_0000)]), dirty: RefCell::new(Vec::new()) };
    let vqs: Vec<Box<dyn EmulatedVirtqueue>> = vec![Box::new(FakeVq::new(0))];

    let dev = DeviceHandle::init(
        Box::new(channel),
        Box::new(mapper),
        Box::new(binding),
        Box::new(framework),
        vqs,
        ListenerTag(8),
        true,
        4,
    )
    .unwrap();

    assert!(dev.query().is_ok());
}

#[test]
fn repeated_identical_add_performs_no_extra_publish() {
    let (mut dev, calls, _) = make_device(0, 0, None, true);
    dev.dispatch(Notification::RegionAdd(section(0, 0x1000))).unwrap();
    let after_first = calls.borrow().set_mem_table;
    dev.dispatch(Notification::RegionAdd(section(0, 0x1000))).unwrap();
    let after_second = calls.borrow().set_mem_table;
    assert_eq!(after_first, after_second, "identical add must short-circuit before publishing");
}

#[test]
fn region_del_of_unknown_range_is_a_noop() {
    let (mut dev, calls, _) = make_device(0, 0, None, true);
    dev.dispatch(Notification::RegionDel(section(0, 0x1000))).unwrap();
    assert_eq!(calls.borrow().set_mem_table, 0);
}
