// Copyright (C) Dragonball Team. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The virtqueue binder: maps a queue's four ring areas into host-virtual
//! address space, publishes them to the accelerator, and re-verifies them
//! whenever guest memory topology moves under a running device.

use log::{debug, trace, warn};

use crate::collaborators::{DeviceBinding, EmulatedVirtqueue, GuestMemoryMapper, MappedRegion};
use crate::control::{AccelControlChannel, VhostVringAddr, VHOST_VRING_F_LOG};
use crate::error::{Error, Result};
use crate::range::Range;

/// Descriptor-table bytes for `num` descriptors (16 bytes each).
fn desc_table_size(num: u32) -> u64 {
    16 * num as u64
}

/// Available-ring bytes: a 4-byte header, `num` 2-byte entries, and a
/// trailing 2-byte used-event index.
fn avail_ring_size(num: u32) -> u64 {
    6 + 2 * num as u64
}

/// Used-ring bytes: a 4-byte header, `num` 8-byte entries, and a trailing
/// 2-byte avail-event index.
fn used_ring_size(num: u32) -> u64 {
    6 + 8 * num as u64
}

/// Live state for one bound virtqueue: the four mapped ring areas plus the
/// guest-physical windows the dirty-log and re-verification logic need.
pub struct Virtqueue {
    pub index: u16,
    desc: MappedRegion,
    avail: MappedRegion,
    used: MappedRegion,
    ring: MappedRegion,
    pub used_phys: Range,
    pub ring_phys: Range,
}

impl Virtqueue {
    pub fn desc_host_addr(&self) -> u64 {
        self.desc.host_ptr
    }

    pub fn avail_host_addr(&self) -> u64 {
        self.avail.host_ptr
    }

    pub fn used_host_addr(&self) -> u64 {
        self.used.host_ptr
    }

    /// Map all four ring areas for `vq` at `index`, publish them to the
    /// accelerator, and bind its notifier descriptors.
    ///
    /// Any failure unwinds earlier maps in reverse order before returning;
    /// mapping failures surface as [`Error::NoMemory`], ioctl failures as
    /// [`Error::Io`].
    pub fn init(
        mapper: &dyn GuestMemoryMapper,
        vq: &dyn EmulatedVirtqueue,
        channel: &dyn AccelControlChannel,
        index: u16,
        log_enabled: bool,
    ) -> Result<Virtqueue> {
        let num = vq.num();
        channel.set_vring_num(index as u32, num)?;
        channel.set_vring_base(index as u32, vq.last_avail_idx() as u32)?;

        let desc = map_exact(mapper, vq.desc_addr(), desc_table_size(num), false)?;
        let avail = match map_exact(mapper, vq.avail_addr(), avail_ring_size(num), false) {
            Ok(m) => m,
            Err(e) => {
                mapper.unmap(&desc, 0);
                return Err(e);
            }
        };
        let used = match map_exact(mapper, vq.used_addr(), used_ring_size(num), true) {
            Ok(m) => m,
            Err(e) => {
                mapper.unmap(&avail, 0);
                mapper.unmap(&desc, 0);
                return Err(e);
            }
        };
        let ring = match map_exact(mapper, vq.ring_addr(), vq.ring_size(), true) {
            Ok(m) => m,
            Err(e) => {
                mapper.unmap(&used, 0);
                mapper.unmap(&avail, 0);
                mapper.unmap(&desc, 0);
                return Err(e);
            }
        };

        let used_phys = Range::new(vq.used_addr(), used_ring_size(num));
        let ring_phys = Range::new(vq.ring_addr(), vq.ring_size());

        let addr = VhostVringAddr {
            index: index as u32,
            flags: if log_enabled { VHOST_VRING_F_LOG } else { 0 },
            desc_user_addr: desc.host_ptr,
            used_user_addr: used.host_ptr,
            avail_user_addr: avail.host_ptr,
            log_guest_addr: if log_enabled { used_phys.start } else { 0 },
        };

        if let Err(e) = channel.set_vring_addr(&addr) {
            mapper.unmap(&ring, 0);
            mapper.unmap(&used, 0);
            mapper.unmap(&avail, 0);
            mapper.unmap(&desc, 0);
            return Err(e);
        }
        if let Err(e) = channel.set_vring_kick(index as u32, vq.host_notifier_fd()) {
            mapper.unmap(&ring, 0);
            mapper.unmap(&used, 0);
            mapper.unmap(&avail, 0);
            mapper.unmap(&desc, 0);
            return Err(e);
        }
        if let Err(e) = channel.set_vring_call(index as u32, vq.guest_notifier_fd()) {
            mapper.unmap(&ring, 0);
            mapper.unmap(&used, 0);
            mapper.unmap(&avail, 0);
            mapper.unmap(&desc, 0);
            return Err(e);
        }

        debug!("virtqueue[{}]: bound num={} used_phys={:?} ring_phys={:?}", index, num, used_phys, ring_phys);

        Ok(Virtqueue {
            index,
            desc,
            avail,
            used,
            ring,
            used_phys,
            ring_phys,
        })
    }

    /// Re-map the ring area and compare the returned host pointer against
    /// the stored one. Called on every memory-table mutation while the
    /// device is started, for every queue whose `ring_phys` overlaps the
    /// changed range.
    pub fn verify_mapping(&self, mapper: &dyn GuestMemoryMapper) -> Result<()> {
        let remapped = mapper.map(self.ring_phys.start, self.ring_phys.size, true)?;
        let result = if remapped.len != self.ring_phys.size {
            Err(Error::NoMemory)
        } else if remapped.host_ptr != self.ring.host_ptr {
            Err(Error::Relocated(self.index))
        } else {
            Ok(())
        };
        mapper.unmap(&remapped, 0);
        result
    }

    /// Read back the last-used index, write it to the emulated queue, and
    /// unmap all four ring areas. The `used` and `ring` unmaps pass their
    /// full length as dirty so any residual accelerator writes survive the
    /// mapping's end.
    pub fn cleanup(
        self,
        mapper: &dyn GuestMemoryMapper,
        vq: &dyn EmulatedVirtqueue,
        channel: &dyn AccelControlChannel,
    ) -> Result<()> {
        let base = channel.get_vring_base(self.index as u32)?;
        vq.set_last_avail_idx(base as u16);

        mapper.unmap(&self.desc, 0);
        mapper.unmap(&self.avail, 0);
        mapper.unmap(&self.used, self.used.len);
        mapper.unmap(&self.ring, self.ring.len);
        trace!("virtqueue[{}]: unbound, last_avail_idx={}", self.index, base);
        Ok(())
    }
}

fn map_exact(mapper: &dyn GuestMemoryMapper, gpa: u64, len: u64, writable: bool) -> Result<MappedRegion> {
    let mapped = mapper.map(gpa, len, writable)?;
    if mapped.len != len {
        mapper.unmap(&mapped, 0);
        return Err(Error::NoMemory);
    }
    Ok(mapped)
}

/// Toggle the per-queue host-notifier binding for `idx` on `binding`,
/// unwinding previously enabled queues on failure.
pub fn enable_notifiers(binding: &dyn DeviceBinding, count: u16) -> Result<()> {
    for idx in 0..count {
        if let Err(e) = binding.set_host_notifier(idx, true) {
            for done in (0..idx).rev() {
                if let Err(unwind_err) = binding.set_host_notifier(done, false) {
                    warn!("enable_notifiers: unwind of queue {} failed: {:?}", done, unwind_err);
                }
            }
            return Err(e);
        }
    }
    Ok(())
}

/// Best-effort disable of every queue's host notifier; errors are logged,
/// never propagated, since teardown must never fail partway through.
pub fn disable_notifiers(binding: &dyn DeviceBinding, count: u16) {
    for idx in 0..count {
        if let Err(e) = binding.set_host_notifier(idx, false) {
            warn!("disable_notifiers: queue {} failed: {:?}", idx, e);
        }
    }
}
