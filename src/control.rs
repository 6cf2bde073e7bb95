// Copyright (C) Dragonball Team. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The accelerator control channel: the vhost-kernel ioctl wire contract,
//! bit-compatible with the kernel ABI, plus the trait the rest of the core
//! programs against so tests can substitute an in-memory fake.
//!
//! This module is a thin binding: it owns struct layouts and ioctl numbers,
//! never business logic. The state machine in [`crate::device`] decides
//! *when* to call these; this module only decides *how*.

use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};

use vmm_sys_util::ioctl::{ioctl, ioctl_with_mut_ref, ioctl_with_ptr, ioctl_with_ref};
use vmm_sys_util::{ioctl_io_nr, ioctl_ior_nr, ioctl_iow_nr, ioctl_iowr_nr};

use crate::error::{Error, Result};

/// `F_LOG_ALL`: the feature bit that turns on whole-device dirty logging.
pub const VHOST_F_LOG_ALL: u64 = 1 << 26;

/// `VRING_F_LOG`: the per-queue vring-address flag that enables logging for
/// that queue's writes.
pub const VHOST_VRING_F_LOG: u32 = 1 << 0;

const VHOST_VIRTIO: u32 = 0xAF;

ioctl_io_nr!(VHOST_SET_OWNER, VHOST_VIRTIO, 0x01);
ioctl_ior_nr!(VHOST_GET_FEATURES, VHOST_VIRTIO, 0x00, u64);
ioctl_iow_nr!(VHOST_SET_FEATURES, VHOST_VIRTIO, 0x00, u64);
ioctl_iow_nr!(VHOST_SET_MEM_TABLE, VHOST_VIRTIO, 0x03, VhostMemory);
ioctl_iow_nr!(VHOST_SET_LOG_BASE, VHOST_VIRTIO, 0x04, u64);
ioctl_iow_nr!(VHOST_SET_VRING_NUM, VHOST_VIRTIO, 0x10, VhostVringState);
ioctl_iow_nr!(VHOST_SET_VRING_ADDR, VHOST_VIRTIO, 0x11, VhostVringAddr);
ioctl_iow_nr!(VHOST_SET_VRING_BASE, VHOST_VIRTIO, 0x12, VhostVringState);
ioctl_iowr_nr!(VHOST_GET_VRING_BASE, VHOST_VIRTIO, 0x12, VhostVringState);
ioctl_iow_nr!(VHOST_SET_VRING_KICK, VHOST_VIRTIO, 0x20, VhostVringFile);
ioctl_iow_nr!(VHOST_SET_VRING_CALL, VHOST_VIRTIO, 0x21, VhostVringFile);

/// Header of the `SET_MEM_TABLE` payload; `regions` follows inline as a
/// variable-length tail the caller builds by hand (see
/// [`AccelControlChannel::set_mem_table`] implementations).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VhostMemory {
    pub nregions: u32,
    pub padding: u32,
}

/// One region entry in the `SET_MEM_TABLE` payload.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VhostMemoryRegion {
    pub guest_phys_addr: u64,
    pub memory_size: u64,
    pub userspace_addr: u64,
    pub flags_padding: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VhostVringState {
    pub index: u32,
    pub num: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VhostVringAddr {
    pub index: u32,
    pub flags: u32,
    pub desc_user_addr: u64,
    pub used_user_addr: u64,
    pub avail_user_addr: u64,
    pub log_guest_addr: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VhostVringFile {
    pub index: u32,
    pub fd: RawFd,
}

/// The operations the device-lifecycle state machine needs from the
/// accelerator, abstracted so tests can substitute an in-memory fake
/// instead of a real `/dev/vhost-*` node.
pub trait AccelControlChannel {
    fn set_owner(&self) -> Result<()>;
    fn get_features(&self) -> Result<u64>;
    fn set_features(&self, features: u64) -> Result<()>;
    fn set_mem_table(&self, regions: &[VhostMemoryRegion]) -> Result<()>;
    fn set_log_base(&self, base: u64) -> Result<()>;
    fn set_vring_num(&self, index: u32, num: u32) -> Result<()>;
    fn set_vring_addr(&self, addr: &VhostVringAddr) -> Result<()>;
    fn set_vring_base(&self, index: u32, num: u32) -> Result<()>;
    fn get_vring_base(&self, index: u32) -> Result<u32>;
    fn set_vring_kick(&self, index: u32, fd: RawFd) -> Result<()>;
    fn set_vring_call(&self, index: u32, fd: RawFd) -> Result<()>;
}

/// The real binding, issuing ioctls against an open `/dev/vhost-*` file
/// descriptor.
pub struct VhostKernelChannel {
    file: File,
}

impl VhostKernelChannel {
    pub fn new(file: File) -> Self {
        VhostKernelChannel { file }
    }

    fn ioctl_err(op: &'static str) -> Error {
        Error::Io(op, std::io::Error::last_os_error())
    }
}

impl AsRawFd for VhostKernelChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl AccelControlChannel for VhostKernelChannel {
    fn set_owner(&self) -> Result<()> {
        // SAFETY: VHOST_SET_OWNER takes no payload; `self` is a valid fd for
        // the lifetime of the call.
        let ret = unsafe { ioctl(self, VHOST_SET_OWNER()) };
        if ret < 0 {
            return Err(Self::ioctl_err("SET_OWNER"));
        }
        Ok(())
    }

    fn get_features(&self) -> Result<u64> {
        let mut features: u64 = 0;
        // SAFETY: `features` outlives the call and is sized for the ioctl.
        let ret = unsafe { ioctl_with_mut_ref(self, VHOST_GET_FEATURES(), &mut features) };
        if ret < 0 {
            return Err(Self::ioctl_err("GET_FEATURES"));
        }
        Ok(features)
    }

    fn set_features(&self, features: u64) -> Result<()> {
        // SAFETY: `features` outlives the call and is sized for the ioctl.
        let ret = unsafe { ioctl_with_ref(self, VHOST_SET_FEATURES(), &features) };
        if ret < 0 {
            return Err(Self::ioctl_err("SET_FEATURES"));
        }
        Ok(())
    }

    fn set_mem_table(&self, regions: &[VhostMemoryRegion]) -> Result<()> {
        let header_size = std::mem::size_of::<VhostMemory>();
        let region_size = std::mem::size_of::<VhostMemoryRegion>();
        let mut bytes = vec![0u8; header_size + region_size * regions.len()];

        // SAFETY: `bytes` was sized to hold exactly one `VhostMemory`
        // header followed by `regions.len()` entries.
        unsafe {
            let header = &mut *(bytes.as_mut_ptr() as *mut VhostMemory);
            header.nregions = regions.len() as u32;
            header.padding = 0;
            if !regions.is_empty() {
                let dst = bytes.as_mut_ptr().add(header_size) as *mut VhostMemoryRegion;
                std::ptr::copy_nonoverlapping(regions.as_ptr(), dst, regions.len());
            }
        }

        // SAFETY: the kernel reads exactly `header.nregions` entries past
        // the header, matching how `bytes` was sized above.
        let ret = unsafe { ioctl_with_ptr(self, VHOST_SET_MEM_TABLE(), bytes.as_ptr()) };
        if ret < 0 {
            return Err(Self::ioctl_err("SET_MEM_TABLE"));
        }
        Ok(())
    }

    fn set_log_base(&self, base: u64) -> Result<()> {
        // SAFETY: `base` outlives the call and is sized for the ioctl.
        let ret = unsafe { ioctl_with_ref(self, VHOST_SET_LOG_BASE(), &base) };
        if ret < 0 {
            return Err(Self::ioctl_err("SET_LOG_BASE"));
        }
        Ok(())
    }

    fn set_vring_num(&self, index: u32, num: u32) -> Result<()> {
        let state = VhostVringState { index, num };
        // SAFETY: `state` outlives the call and is sized for the ioctl.
        let ret = unsafe { ioctl_with_ref(self, VHOST_SET_VRING_NUM(), &state) };
        if ret < 0 {
            return Err(Self::ioctl_err("SET_VRING_NUM"));
        }
        Ok(())
    }

    fn set_vring_addr(&self, addr: &VhostVringAddr) -> Result<()> {
        // SAFETY: `addr` outlives the call and is sized for the ioctl.
        let ret = unsafe { ioctl_with_ref(self, VHOST_SET_VRING_ADDR(), addr) };
        if ret < 0 {
            return Err(Self::ioctl_err("SET_VRING_ADDR"));
        }
        Ok(())
    }

    fn set_vring_base(&self, index: u32, num: u32) -> Result<()> {
        let state = VhostVringState { index, num };
        // SAFETY: `state` outlives the call and is sized for the ioctl.
        let ret = unsafe { ioctl_with_ref(self, VHOST_SET_VRING_BASE(), &state) };
        if ret < 0 {
            return Err(Self::ioctl_err("SET_VRING_BASE"));
        }
        Ok(())
    }

    fn get_vring_base(&self, index: u32) -> Result<u32> {
        let mut state = VhostVringState { index, num: 0 };
        // SAFETY: `state` outlives the call and is sized for the ioctl;
        // the kernel both reads `index` and writes back `num`.
        let ret = unsafe { ioctl_with_mut_ref(self, VHOST_GET_VRING_BASE(), &mut state) };
        if ret < 0 {
            return Err(Self::ioctl_err("GET_VRING_BASE"));
        }
        Ok(state.num)
    }

    fn set_vring_kick(&self, index: u32, fd: RawFd) -> Result<()> {
        let file = VhostVringFile { index, fd };
        // SAFETY: `file` outlives the call and is sized for the ioctl.
        let ret = unsafe { ioctl_with_ref(self, VHOST_SET_VRING_KICK(), &file) };
        if ret < 0 {
            return Err(Self::ioctl_err("SET_VRING_KICK"));
        }
        Ok(())
    }

    fn set_vring_call(&self, index: u32, fd: RawFd) -> Result<()> {
        let file = VhostVringFile { index, fd };
        // SAFETY: `file` outlives the call and is sized for the ioctl.
        let ret = unsafe { ioctl_with_ref(self, VHOST_SET_VRING_CALL(), &file) };
        if ret < 0 {
            return Err(Self::ioctl_err("SET_VRING_CALL"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_region_layout_matches_kernel_abi() {
        assert_eq!(std::mem::size_of::<VhostMemoryRegion>(), 32);
        assert_eq!(std::mem::size_of::<VhostMemory>(), 8);
    }

    #[test]
    fn log_all_bit_is_26() {
        assert_eq!(VHOST_F_LOG_ALL, 1 << 26);
    }
}
