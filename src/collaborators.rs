// Copyright (C) Dragonball Team. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Narrow trait boundaries for everything this crate treats as an external
//! collaborator: the guest-physical memory-map publisher, the
//! address-space mapping primitive, the emulated virtio queue, and the
//! device binding that owns host/guest notifier wiring.
//!
//! None of these are implemented here. Production code wires them to the
//! VMM's real address-space framework; tests wire them to small in-memory
//! fakes (see `tests/`).

use crate::error::Result;

/// A guest-memory section as delivered by a topology notification:
/// `{address_space, memory_region, offset_within_address_space,
/// offset_within_region, size}` in the wire contract's terms.
#[derive(Debug, Clone, Copy)]
pub struct MemorySection {
    /// Opaque tag identifying the owning address space; sections outside
    /// system memory are filtered before reaching the table.
    pub address_space: AddressSpaceId,
    /// Opaque tag identifying the backing memory region (for `is_ram`,
    /// `is_logging`, `get_ram_ptr` lookups and for the section-cache
    /// removal-by-region-and-offset match).
    pub memory_region: RegionId,
    pub offset_within_address_space: u64,
    pub offset_within_region: u64,
    pub size: u64,
}

/// Opaque address-space tag. System memory is the one address space whose
/// sections this core tracks; all others are filtered by the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressSpaceId(pub u64);

/// Opaque memory-region tag, stable for the lifetime of the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(pub u64);

/// The address-space framework: publishes topology notifications (handled
/// by [`crate::listener::TopologyListener`]) and answers queries about a
/// region's backing memory.
pub trait AddressSpaceFramework {
    /// Whether `region` is system memory, i.e. should be tracked at all.
    fn is_system_memory(&self, space: AddressSpaceId) -> bool;

    /// Whether `region` is RAM-backed (as opposed to MMIO or similar).
    fn is_ram(&self, region: RegionId) -> bool;

    /// Whether `region` is currently flagged as being dirty-tracked by
    /// another consumer; such sections are treated as removes (§4.3).
    fn is_logging(&self, region: RegionId) -> bool;

    /// The region's backing host pointer, used to derive a section's
    /// host-user-virtual address as `get_ram_ptr(region) +
    /// offset_within_region`.
    fn get_ram_ptr(&self, region: RegionId) -> Option<u64>;

    /// Mark `len` bytes dirty starting at `offset` within `region`, called
    /// while draining the dirty log.
    fn mark_dirty(&self, region: RegionId, offset: u64, len: u64);

    /// Register a listener tag with the framework's process-wide registry;
    /// returns a handle whose `Drop` (or explicit deregister) undoes it.
    fn register_listener(&self, tag: ListenerTag) -> RegistrationHandle;

    fn deregister_listener(&self, handle: RegistrationHandle);
}

/// Stable tag identifying one device's listener registration, used by the
/// framework to route notifications back without an embedded back-pointer
/// cycle (see the design notes on cyclic references).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerTag(pub u64);

/// Opaque token returned by [`AddressSpaceFramework::register_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationHandle(pub u64);

/// The guest-physical mapping primitive: pins guest pages into host virtual
/// address space and reports the resulting host pointer.
pub trait GuestMemoryMapper {
    /// Map `len` bytes of guest-physical memory starting at `guest_phys`.
    /// Returns the host-virtual pointer on success; `Ok(None)` signals a
    /// null/zero-length mapping (a meaningful, non-error outcome when
    /// `len == 0`). A mapping shorter than requested is the caller's
    /// responsibility to detect by comparing `len` before and after.
    fn map(&self, guest_phys: u64, len: u64, writable: bool) -> Result<MappedRegion>;

    /// Unmap a previously mapped region. `dirty_len` marks that many bytes
    /// from the start of the mapping dirty before the mapping ends, used
    /// by the virtqueue binder's teardown to preserve in-flight
    /// accelerator writes (§4.5 `cleanup`).
    fn unmap(&self, mapping: &MappedRegion, dirty_len: u64);
}

/// A single mapped host-virtual window, with the length actually granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRegion {
    pub host_ptr: u64,
    pub len: u64,
}

/// The emulated virtio queue this core front-ends: exposes ring geometry,
/// the guest-visible consumer index, and the two notifier file
/// descriptors.
pub trait EmulatedVirtqueue {
    fn num(&self) -> u32;
    fn desc_addr(&self) -> u64;
    fn avail_addr(&self) -> u64;
    fn used_addr(&self) -> u64;
    fn ring_addr(&self) -> u64;
    fn ring_size(&self) -> u64;
    fn last_avail_idx(&self) -> u16;
    fn set_last_avail_idx(&self, idx: u16);
    fn host_notifier_fd(&self) -> i32;
    fn guest_notifier_fd(&self) -> i32;
}

/// The device binding: owns host/guest notifier wiring external to the
/// virtqueue rings themselves.
pub trait DeviceBinding {
    fn set_host_notifier(&self, idx: u16, on: bool) -> Result<()>;
    fn set_guest_notifiers(&self, on: bool) -> Result<()>;
    fn query_guest_notifiers(&self) -> bool;
}
