// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interface to the Wave6 hardware transport.
//!
//! Register access, interrupt delivery, power management and DMA allocation live behind
//! [`VpuTransport`]. The session only ever talks to the hardware through a [`Wave6Device`],
//! whose mutex is the per-device lock serializing all sessions sharing the codec.

pub mod params;

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use thiserror::Error;

use crate::hw::params::AuxBufferEntry;
use crate::hw::params::AuxBufferSizeInfo;
use crate::hw::params::AuxBufferType;
use crate::hw::params::EncCommand;
use crate::hw::params::EncOpenParam;
use crate::hw::params::EncParam;
use crate::hw::params::FrameBuffer;
use crate::hw::params::InitialInfo;
use crate::hw::params::OutputInfo;
use crate::worker::CompletionNotifier;

/// Bounded wait for sequence initialization and sequence change.
pub const VPU_TIMEOUT: Duration = Duration::from_millis(6000);

#[derive(Debug, Error)]
pub enum HwError {
    #[error("timed out after {0:?} waiting for the VPU")]
    Timeout(Duration),
    #[error("VPU rejected the command, reason {reason:#x}")]
    Rejected { reason: u32 },
    #[error("failed to allocate {0} bytes of DMA memory")]
    OutOfMemory(usize),
    #[error("unknown DMA buffer {0:#x}")]
    UnknownBuffer(u64),
    #[error("unknown instance {0:?}")]
    UnknownInstance(InstanceHandle),
    #[error("device lock poisoned")]
    LockPoisoned,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type HwResult<T> = Result<T, HwError>;

/// Identifier of an encoder channel opened on the device.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceHandle(pub u32);

/// A DMA-coherent allocation. `daddr` is the device address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DmaBuffer {
    pub daddr: u64,
    pub size: usize,
}

/// Low-level access to a Wave6 codec.
///
/// Jobs started with [`submit_frame`] complete asynchronously: the transport reports the end
/// of each job through the [`CompletionNotifier`] given to [`open`], after which the owner
/// fetches the result with [`output_info`] and releases the slot with [`finish_job`].
///
/// [`submit_frame`]: VpuTransport::submit_frame
/// [`open`]: VpuTransport::open
/// [`output_info`]: VpuTransport::output_info
/// [`finish_job`]: VpuTransport::finish_job
pub trait VpuTransport: Send {
    /// Takes a power reference and resumes the device.
    fn power_on(&mut self) -> HwResult<()>;
    /// Drops a power reference taken with [`VpuTransport::power_on`].
    fn power_off(&mut self);

    fn alloc_dma(&mut self, size: usize) -> HwResult<DmaBuffer>;
    fn free_dma(&mut self, buf: DmaBuffer);
    /// Copies `data` to the start of `buf`.
    fn write_dma(&mut self, buf: &DmaBuffer, data: &[u8]) -> HwResult<()>;
    fn sync_for_device(&mut self, daddr: u64, size: usize);
    fn sync_for_cpu(&mut self, daddr: u64, size: usize);

    fn open(
        &mut self,
        params: &EncOpenParam,
        notifier: CompletionNotifier,
    ) -> HwResult<InstanceHandle>;
    fn close(&mut self, handle: InstanceHandle) -> HwResult<()>;
    fn give_command(&mut self, handle: InstanceHandle, cmd: EncCommand) -> HwResult<()>;

    fn issue_seq_init(&mut self, handle: InstanceHandle) -> HwResult<()>;
    fn complete_seq_init(&mut self, handle: InstanceHandle) -> HwResult<InitialInfo>;
    /// Pushes pending parameter changes. Returns `true` if the firmware started a sequence
    /// change that must be waited for and completed.
    fn issue_seq_change(&mut self, handle: InstanceHandle) -> HwResult<bool>;
    /// Blocks for at most `timeout` until the last issued command completes.
    fn wait_for_completion(&mut self, handle: InstanceHandle, timeout: Duration) -> HwResult<()>;

    fn aux_buffer_size(
        &mut self,
        handle: InstanceHandle,
        info: &AuxBufferSizeInfo,
    ) -> HwResult<usize>;
    fn register_aux_buffers(
        &mut self,
        handle: InstanceHandle,
        ty: AuxBufferType,
        bufs: &[AuxBufferEntry],
    ) -> HwResult<()>;
    fn register_frame_buffers(
        &mut self,
        handle: InstanceHandle,
        frames: &[FrameBuffer],
        stride: u32,
        height: u32,
        map_type: u32,
    ) -> HwResult<()>;

    fn submit_frame(&mut self, handle: InstanceHandle, param: &EncParam) -> HwResult<()>;
    fn output_info(&mut self, handle: InstanceHandle) -> HwResult<OutputInfo>;
    /// Releases the job slot of `handle` so another instance may run.
    fn finish_job(&mut self, handle: InstanceHandle);

    fn cycle_to_nanos(&self, cycles: u64) -> u64;
}

/// A physical codec shared by every session opened on it.
pub struct Wave6Device<T: VpuTransport> {
    transport: Mutex<T>,
}

impl<T: VpuTransport> Wave6Device<T> {
    pub fn new(transport: T) -> Arc<Self> {
        Arc::new(Self { transport: Mutex::new(transport) })
    }

    /// Takes the per-device lock.
    pub fn lock(&self) -> HwResult<MutexGuard<'_, T>> {
        self.transport.lock().map_err(|_| HwError::LockPoisoned)
    }
}
