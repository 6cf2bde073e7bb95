// Copyright (C) Dragonball Team. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The device lifecycle state machine: feature negotiation, virtqueue
//! setup/teardown, notifier rewiring, and the topology-listener dispatch
//! that keeps the accelerator's view of guest memory in sync.
//!
//! [`DeviceHandle`] is the one object a VMM embedder touches. Everything
//! else in this crate (the memory table, the dirty log, the virtqueue
//! binder) is plumbing it drives.

use log::{debug, info, trace, warn};

use crate::collaborators::{
    AddressSpaceFramework, DeviceBinding, EmulatedVirtqueue, GuestMemoryMapper, ListenerTag,
    MemorySection, RegistrationHandle,
};
use crate::control::{AccelControlChannel, VhostMemoryRegion, VhostVringAddr, VHOST_F_LOG_ALL, VHOST_VRING_F_LOG};
use crate::dirty_log::{DirtyLog, ScanWindow};
use crate::error::{Error, Result};
use crate::listener::{Notification, SectionCache};
use crate::mem_table::MemoryTable;
use crate::range::Range;
use crate::virtqueue::{self, Virtqueue};

/// One accelerator instance's full control-plane state.
///
/// Holds the control channel, the negotiated/acknowledged feature bitmasks,
/// the fixed-length virtqueue array (emulated side owned by the caller,
/// bound side owned here once [`DeviceHandle::start`] succeeds), the
/// growable memory table, the memory-section cache, the dirty-log buffer,
/// and the `started` / `log_enabled` / `force` flags named in the data
/// model.
pub struct DeviceHandle {
    channel: Box<dyn AccelControlChannel>,
    mapper: Box<dyn GuestMemoryMapper>,
    binding: Box<dyn DeviceBinding>,
    framework: Box<dyn AddressSpaceFramework>,

    vqs: Vec<Box<dyn EmulatedVirtqueue>>,
    bound_vqs: Vec<Option<Virtqueue>>,

    avail_features: u64,
    acked_features: u64,

    table: MemoryTable,
    sections: SectionCache,

    log: DirtyLog,
    log_margin_words: u64,

    started: bool,
    log_enabled: bool,
    force: bool,

    registration: Option<RegistrationHandle>,
}

impl DeviceHandle {
    /// `init`: open the control channel (already opened by the caller and
    /// handed in as `channel`), take ownership (`SET_OWNER`), query
    /// available features (`GET_FEATURES`), and register the topology
    /// listener under `tag`.
    ///
    /// `nvqs` fixes the virtqueue array length for the lifetime of this
    /// handle, per the data model's "virtqueue array of fixed length N".
    #[allow(clippy::too_many_arguments)]
    pub fn init(
        channel: Box<dyn AccelControlChannel>,
        mapper: Box<dyn GuestMemoryMapper>,
        binding: Box<dyn DeviceBinding>,
        framework: Box<dyn AddressSpaceFramework>,
        vqs: Vec<Box<dyn EmulatedVirtqueue>>,
        tag: ListenerTag,
        force: bool,
        log_margin_words: u64,
    ) -> Result<Self> {
        channel.set_owner()?;
        let avail_features = channel.get_features()?;
        let registration = framework.register_listener(tag);

        let nvqs = vqs.len();
        info!(
            "device: initialised, {} virtqueue(s), avail_features={:#x}, force={}",
            nvqs, avail_features, force
        );

        Ok(DeviceHandle {
            channel,
            mapper,
            binding,
            framework,
            bound_vqs: (0..nvqs).map(|_| None).collect(),
            vqs,
            avail_features,
            acked_features: 0,
            table: MemoryTable::new(),
            sections: SectionCache::new(),
            log: DirtyLog::empty(),
            log_margin_words,
            started: false,
            log_enabled: false,
            force,
            registration: Some(registration),
        })
    }

    /// Features the accelerator reported support for at `init`.
    pub fn avail_features(&self) -> u64 {
        self.avail_features
    }

    /// Record the subset of `avail_features` the VMM negotiated with the
    /// guest and wants the accelerator to acknowledge. Masked against
    /// `avail_features` defensively; the mask is not re-queried.
    pub fn set_acked_features(&mut self, features: u64) {
        self.acked_features = features & self.avail_features;
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_log_enabled(&self) -> bool {
        self.log_enabled
    }

    pub fn memory_table(&self) -> &MemoryTable {
        &self.table
    }

    /// Whether this platform/binding combination can usably run: either the
    /// device binding reports guest-notifier support, or the `force` flag
    /// was set at `init` to proceed without it anyway.
    pub fn query(&self) -> Result<()> {
        if self.force || self.binding.query_guest_notifiers() {
            Ok(())
        } else {
            Err(Error::NotSupported("guest notifiers"))
        }
    }

    /// `cleanup`: unregister the topology listener, free the table and
    /// section cache, and drop the control channel (closing the fd).
    ///
    /// Refuses while started: the caller must `stop` first, matching the
    /// state machine's `Registered --cleanup--> Cleaned` edge.
    pub fn cleanup(mut self) -> Result<()> {
        if self.started {
            return Err(Error::Inconsistent("cleanup called while device is started"));
        }
        if let Some(reg) = self.registration.take() {
            self.framework.deregister_listener(reg);
        }
        self.table = MemoryTable::new();
        self.sections.clear();
        info!("device: cleaned up");
        Ok(())
    }

    /// Enable host notifiers on every queue, unwinding previously enabled
    /// queues on failure.
    pub fn enable_notifiers(&mut self) -> Result<()> {
        virtqueue::enable_notifiers(self.binding.as_ref(), self.vqs.len() as u16)
    }

    /// Best-effort disable of host notifiers on every queue; never fails.
    pub fn disable_notifiers(&mut self) {
        virtqueue::disable_notifiers(self.binding.as_ref(), self.vqs.len() as u16)
    }

    /// `start`: enable host notifiers, set guest notifiers, push the
    /// acknowledged feature set and memory table, then bind every
    /// virtqueue. Any failed step unwinds every earlier successful one, in
    /// exactly the reverse order of acquisition.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(Error::Inconsistent("start called while device already started"));
        }

        let nvqs = self.vqs.len() as u16;
        virtqueue::enable_notifiers(self.binding.as_ref(), nvqs)?;

        if let Err(e) = self.binding.set_guest_notifiers(true) {
            virtqueue::disable_notifiers(self.binding.as_ref(), nvqs);
            return Err(e);
        }

        if let Err(e) = self.channel.set_features(self.acked_features) {
            self.binding.set_guest_notifiers(false).ok();
            virtqueue::disable_notifiers(self.binding.as_ref(), nvqs);
            return Err(e);
        }

        if let Err(e) = self.publish_mem_table() {
            self.binding.set_guest_notifiers(false).ok();
            virtqueue::disable_notifiers(self.binding.as_ref(), nvqs);
            return Err(e);
        }

        let mut bound: Vec<Option<Virtqueue>> = Vec::with_capacity(self.vqs.len());
        for (idx, vq) in self.vqs.iter().enumerate() {
            match Virtqueue::init(
                self.mapper.as_ref(),
                vq.as_ref(),
                self.channel.as_ref(),
                idx as u16,
                self.log_enabled,
            ) {
                Ok(bound_vq) => bound.push(Some(bound_vq)),
                Err(e) => {
                    for (j, maybe_vq) in bound.into_iter().enumerate().rev() {
                        if let Some(bound_vq) = maybe_vq {
                            if let Err(unwind_err) =
                                bound_vq.cleanup(self.mapper.as_ref(), self.vqs[j].as_ref(), self.channel.as_ref())
                            {
                                warn!("start: unwind cleanup of queue {} failed: {:?}", j, unwind_err);
                            }
                        }
                    }
                    self.binding.set_guest_notifiers(false).ok();
                    virtqueue::disable_notifiers(self.binding.as_ref(), nvqs);
                    return Err(e);
                }
            }
        }

        self.bound_vqs = bound;
        self.started = true;
        info!("device: started, {} virtqueue(s) bound", nvqs);
        Ok(())
    }

    /// `stop`: for each bound virtqueue, read back the last-used index
    /// (writing it to the emulated queue), unmap the rings, and mark the
    /// used-ring pages dirty; then drain the log over every cached
    /// section, clear guest notifiers, and free the log. `StartedLogging`
    /// collapses into `Registered`, not-logging, so `log_enabled` is reset
    /// here too: a later `start` must not rebind vrings with `VHOST_VRING_F_LOG`
    /// against a freed log base.
    pub fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Err(Error::Inconsistent("stop called while device not started"));
        }

        for (idx, maybe_vq) in std::mem::take(&mut self.bound_vqs).into_iter().enumerate() {
            if let Some(vq) = maybe_vq {
                vq.cleanup(self.mapper.as_ref(), self.vqs[idx].as_ref(), self.channel.as_ref())?;
            }
        }

        if !self.log.is_empty() {
            for section in self.sections.iter() {
                let window = ScanWindow {
                    region_offset: section.offset_within_region,
                    guest_phys: Range::new(section.offset_within_address_space, section.size),
                };
                let region = section.memory_region;
                self.log.sync_region(&window, |offset, len| self.framework.mark_dirty(region, offset, len));
            }
        }

        self.binding.set_guest_notifiers(false).ok();
        virtqueue::disable_notifiers(self.binding.as_ref(), self.vqs.len() as u16);

        self.log = DirtyLog::empty();
        self.log_enabled = false;
        self.started = false;
        info!("device: stopped");
        Ok(())
    }

    /// Dispatch one topology notification. Only sections whose address
    /// space is system memory and whose region is RAM-backed are handled;
    /// everything else is dropped on the floor (§4.3 filter).
    pub fn dispatch(&mut self, notification: Notification) -> Result<()> {
        match notification {
            Notification::RegionAdd(section) => {
                if !self.accept(&section) {
                    return Ok(());
                }
                let res = self.set_memory(&section, true);
                if res.is_ok() {
                    self.sections.push(section);
                }
                res
            }
            Notification::RegionDel(section) => {
                if !self.accept(&section) {
                    return Ok(());
                }
                let res = self.set_memory(&section, false);
                self.sections.remove_matching(&section);
                res
            }
            Notification::RegionNop => Ok(()),
            Notification::LogSync(section) => {
                if self.accept(&section) {
                    self.sync_section(&section);
                }
                Ok(())
            }
            Notification::LogGlobalStart => {
                if let Err(e) = self.log_global_start() {
                    log::error!("log_global_start failed, tracking contract cannot be honoured: {:?}", e);
                    std::process::abort();
                }
                Ok(())
            }
            Notification::LogGlobalStop => {
                if let Err(e) = self.log_global_stop() {
                    log::error!("log_global_stop failed, tracking contract cannot be honoured: {:?}", e);
                    std::process::abort();
                }
                Ok(())
            }
            // Per-section fine-grained logging defers to the global flag;
            // no independent semantics yet.
            Notification::LogStart(_) | Notification::LogStop(_) => Ok(()),
            // The accelerator re-reads event descriptors on virtqueue setup.
            Notification::EventFdAdd | Notification::EventFdDel => Ok(()),
        }
    }

    fn accept(&self, section: &MemorySection) -> bool {
        self.framework.is_system_memory(section.address_space) && self.framework.is_ram(section.memory_region)
    }

    /// `set_memory`: the core of `region_add` / `region_del` handling.
    ///
    /// A section flagged `is_logging` by the framework is always treated as
    /// a remove regardless of the caller's `add` (reproduced as-is from
    /// the source behaviour this crate is modelled on; see DESIGN.md's
    /// "Resolved open questions" entry).
    fn set_memory(&mut self, section: &MemorySection, add: bool) -> Result<()> {
        self.table.reserve_for_mutation();

        let add = add && !self.framework.is_logging(section.memory_region);
        let start = section.offset_within_address_space;
        let size = section.size;

        if add {
            let ram_ptr = self.framework.get_ram_ptr(section.memory_region).ok_or(Error::NoMemory)?;
            let uaddr = ram_ptr + section.offset_within_region;
            if self.table.covers_unchanged(start, size, uaddr) {
                trace!("mem_table: add gpa={:#x} size={:#x} unchanged, skipping ioctl", start, size);
                return Ok(());
            }
            self.table.unassign(start, size);
            self.table.assign(start, size, uaddr);
            debug!("mem_table: added gpa={:#x} size={:#x} uaddr={:#x}", start, size, uaddr);
        } else {
            if self.table.find(start, size).is_none() {
                trace!("mem_table: remove gpa={:#x} size={:#x} unknown, skipping", start, size);
                return Ok(());
            }
            self.table.unassign(start, size);
            debug!("mem_table: removed gpa={:#x} size={:#x}", start, size);
        }

        if self.started {
            self.verify_ring_mappings(start, size)?;
        }

        if self.log_enabled {
            self.maybe_grow_log()?;
        }

        self.publish_mem_table()?;

        if self.log_enabled {
            self.maybe_shrink_log()?;
        }

        Ok(())
    }

    fn sync_section(&self, section: &MemorySection) {
        if self.log.is_empty() {
            return;
        }
        let window = ScanWindow {
            region_offset: section.offset_within_region,
            guest_phys: Range::new(section.offset_within_address_space, section.size),
        };
        let region = section.memory_region;
        self.log.sync_region(&window, |offset, len| self.framework.mark_dirty(region, offset, len));
    }

    fn verify_ring_mappings(&self, start: u64, size: u64) -> Result<()> {
        let changed = Range::new(start, size);
        for vq in self.bound_vqs.iter().flatten() {
            if vq.ring_phys.overlaps(&changed) {
                vq.verify_mapping(self.mapper.as_ref())?;
            }
        }
        Ok(())
    }

    fn publish_mem_table(&self) -> Result<()> {
        let regions: Vec<VhostMemoryRegion> = self
            .table
            .regions()
            .iter()
            .map(|r| VhostMemoryRegion {
                guest_phys_addr: r.guest_phys_addr,
                memory_size: r.memory_size,
                userspace_addr: r.userspace_addr,
                flags_padding: 0,
            })
            .collect();
        self.channel.set_mem_table(&regions)
    }

    fn current_log_needed_words(&self) -> u64 {
        let region_ranges = self.table.regions().iter().map(|r| Range::new(r.guest_phys_addr, r.memory_size));
        let vq_ranges = self.bound_vqs.iter().flatten().map(|vq| vq.used_phys);
        DirtyLog::compute_log_size_words(region_ranges.chain(vq_ranges))
    }

    fn maybe_grow_log(&mut self) -> Result<()> {
        let needed = self.current_log_needed_words();
        if let Some(new_size) = DirtyLog::next_log_size(self.log.size_words(), needed, self.log_margin_words) {
            if new_size > self.log.size_words() {
                self.resize_log_to(new_size)?;
            }
        }
        Ok(())
    }

    fn maybe_shrink_log(&mut self) -> Result<()> {
        let needed = self.current_log_needed_words();
        if let Some(new_size) = DirtyLog::next_log_size(self.log.size_words(), needed, self.log_margin_words) {
            if new_size < self.log.size_words() {
                self.resize_log_to(new_size)?;
            }
        }
        Ok(())
    }

    /// Resize protocol (§4.2): publish the new base before the table grows,
    /// after it shrinks; drain the outgoing log over every cached section
    /// before dropping it.
    fn resize_log_to(&mut self, new_size_words: u64) -> Result<()> {
        let old_size = self.log.size_words();
        if new_size_words == old_size {
            return Ok(());
        }
        let growing = new_size_words > old_size;
        let new_log = DirtyLog::allocate(new_size_words);

        if growing {
            self.channel.set_log_base(new_log.base_ptr())?;
        }

        if old_size > 0 {
            for section in self.sections.iter() {
                let window = ScanWindow {
                    region_offset: section.offset_within_region,
                    guest_phys: Range::new(section.offset_within_address_space, section.size),
                };
                let region = section.memory_region;
                self.log.sync_region(&window, |offset, len| self.framework.mark_dirty(region, offset, len));
            }
        }

        self.log = new_log;

        if !growing {
            self.channel.set_log_base(self.log.base_ptr())?;
        }

        debug!("dirty_log: resized {} -> {} words", old_size, new_size_words);
        Ok(())
    }

    /// `log_global_start`: allocate a log sized to the current table plus
    /// the hysteresis margin, turn on `F_LOG_ALL`, and flip `VRING_F_LOG`
    /// on every bound queue.
    fn log_global_start(&mut self) -> Result<()> {
        if self.log_enabled {
            return Err(Error::Inconsistent("log_global_start called while already logging"));
        }
        let needed = self.current_log_needed_words();
        let size = needed.saturating_add(self.log_margin_words);
        self.resize_log_to(size)?;

        if let Err(e) = self.set_log(true) {
            self.log = DirtyLog::empty();
            return Err(e);
        }
        self.log_enabled = true;
        info!("device: global logging enabled, log size {} words", self.log.size_words());
        Ok(())
    }

    /// `log_global_stop`: turn off `F_LOG_ALL` and `VRING_F_LOG`, then free
    /// the log.
    fn log_global_stop(&mut self) -> Result<()> {
        if !self.log_enabled {
            return Err(Error::Inconsistent("log_global_stop called while not logging"));
        }
        self.set_log(false)?;
        self.log_enabled = false;
        self.log = DirtyLog::empty();
        info!("device: global logging disabled");
        Ok(())
    }

    /// Two-phase `set_log` with unwind (§4.4): `SET_FEATURES` first, then
    /// `SET_VRING_ADDR` per bound queue; on any per-queue failure, walk back
    /// every already-updated queue before restoring features.
    fn set_log(&mut self, enable: bool) -> Result<()> {
        let new_features = if enable {
            self.acked_features | VHOST_F_LOG_ALL
        } else {
            self.acked_features & !VHOST_F_LOG_ALL
        };
        self.channel.set_features(new_features)?;

        let bound_indices: Vec<u16> = self
            .bound_vqs
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.as_ref().map(|_| i as u16))
            .collect();

        for (pos, &idx) in bound_indices.iter().enumerate() {
            let vq = self.bound_vqs[idx as usize].as_ref().unwrap();
            let addr = vring_addr_for(vq, idx, enable);
            if let Err(e) = self.channel.set_vring_addr(&addr) {
                for &done in &bound_indices[..pos] {
                    let vq2 = self.bound_vqs[done as usize].as_ref().unwrap();
                    let restore = vring_addr_for(vq2, done, !enable);
                    if let Err(unwind_err) = self.channel.set_vring_addr(&restore) {
                        warn!("set_log: unwind of queue {} failed: {:?}", done, unwind_err);
                    }
                }
                if let Err(feat_err) = self.channel.set_features(self.acked_features) {
                    warn!("set_log: feature unwind failed: {:?}", feat_err);
                }
                return Err(e);
            }
        }

        self.acked_features = new_features;
        Ok(())
    }
}

fn vring_addr_for(vq: &Virtqueue, index: u16, log_enabled: bool) -> VhostVringAddr {
    VhostVringAddr {
        index: index as u32,
        flags: if log_enabled { VHOST_VRING_F_LOG } else { 0 },
        desc_user_addr: vq.desc_host_addr(),
        used_user_addr: vq.used_host_addr(),
        avail_user_addr: vq.avail_host_addr(),
        log_guest_addr: if log_enabled { vq.used_phys.start } else { 0 },
    }
}

impl Drop for DeviceHandle {
    /// Best-effort teardown if the caller drops the handle without calling
    /// `stop`/`cleanup` explicitly: unmap whatever is still bound and
    /// deregister the listener, so the accelerator fd and mapped pages
    /// never leak. Errors here are logged, not propagated, since there is no
    /// one left to return them to.
    fn drop(&mut self) {
        if self.started {
            warn!("device: handle dropped while started, running best-effort stop");
            if let Err(e) = self.stop() {
                warn!("device: best-effort stop on drop failed: {:?}", e);
            }
        }
        if let Some(reg) = self.registration.take() {
            self.framework.deregister_listener(reg);
        }
    }
}
