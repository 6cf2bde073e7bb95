// Copyright (C) Dragonball Team. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Userspace control plane coupling a VMM to an in-kernel virtio device
//! accelerator.
//!
//! A VMM emulates virtio devices but delegates the fast path (reading
//! descriptor rings and signalling notifications) to an in-kernel
//! accelerator reachable through a vhost-kernel-shaped ioctl channel. This
//! crate keeps the accelerator's view of guest memory, its virtqueue
//! addresses, its event descriptors, and its dirty-page tracking in sync
//! with the VMM's own view as guest memory topology, logging state, and
//! device lifecycle evolve.
//!
//! # Layout
//!
//! - [`range`]: half-open range arithmetic shared by the table and the log.
//! - [`mem_table`]: the memory-region table (assign/unassign/merge).
//! - [`dirty_log`]: the shared dirty-page bitmap (resize, scan, drain).
//! - [`control`]: the vhost-kernel ioctl wire contract.
//! - [`virtqueue`]: per-queue ring mapping, binding, and re-verification.
//! - [`listener`]: the topology-notification vocabulary and section cache.
//! - [`collaborators`]: trait boundaries for everything this crate treats
//!   as an external dependency (address-space framework, guest-memory
//!   mapper, emulated virtqueue, device binding).
//! - [`device`]: [`device::DeviceHandle`], the public lifecycle state
//!   machine that ties the above together.
//!
//! None of the collaborator traits have a production implementation in
//! this crate; wiring them to a real VMM's address-space framework and
//! accelerator device node is the embedder's job. See `tests/` for
//! in-memory fakes exercising the public surface end to end.

pub mod collaborators;
pub mod control;
pub mod device;
pub mod dirty_log;
pub mod error;
pub mod listener;
pub mod mem_table;
pub mod range;
pub mod virtqueue;

pub use device::DeviceHandle;
pub use error::{Error, Result};
