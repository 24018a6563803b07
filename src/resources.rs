// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reconstructed frame buffers and the auxiliary buffers the codec needs alongside them.

use std::collections::BTreeMap;

use anyhow::anyhow;

use crate::align_up;
use crate::hw::params::AuxBufferEntry;
use crate::hw::params::AuxBufferSizeInfo;
use crate::hw::params::AuxBufferType;
use crate::hw::params::FrameBuffer;
use crate::hw::params::InitialInfo;
use crate::hw::params::COMPRESSED_FRAME_MAP;
use crate::hw::params::FBC_BUF_ALIGNMENT;
use crate::hw::params::WAVE6_MAX_FBS;
use crate::hw::DmaBuffer;
use crate::hw::HwError;
use crate::hw::HwResult;
use crate::hw::InstanceHandle;
use crate::hw::VpuTransport;
use crate::Rect;

/// Layout of the compressed reconstruction buffers for a given encode window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameBufferLayout {
    pub stride: u32,
    pub height: u32,
    pub luma_size: usize,
    pub chroma_size: usize,
}

impl FrameBufferLayout {
    pub fn new(codec_rect: &Rect) -> Self {
        let stride = align_up(codec_rect.width, FBC_BUF_ALIGNMENT);
        let height = align_up(codec_rect.height, FBC_BUF_ALIGNMENT);

        Self {
            stride,
            height,
            luma_size: stride as usize * height as usize,
            chroma_size: align_up(stride / 2, FBC_BUF_ALIGNMENT) as usize * height as usize,
        }
    }
}

/// Options that change the size of auxiliary buffers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AuxGeometry {
    pub width: u32,
    pub height: u32,
    pub mirror_direction: u32,
    pub rotation_angle: u32,
}

/// Arena owning every DMA allocation tied to the registered frame buffers of an instance.
#[derive(Debug, Default)]
pub struct ResourceArena {
    frame_mem: Vec<DmaBuffer>,
    frames: Vec<FrameBuffer>,
    aux: BTreeMap<AuxBufferType, Vec<DmaBuffer>>,
}

impl ResourceArena {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn frames(&self) -> &[FrameBuffer] {
        &self.frames
    }

    pub fn aux(&self, ty: AuxBufferType) -> &[DmaBuffer] {
        self.aux.get(&ty).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.frame_mem.is_empty() && self.aux.values().all(Vec::is_empty)
    }

    /// Allocates and registers `count` auxiliary buffers of type `ty`.
    ///
    /// On failure only the buffers allocated by this call are freed.
    pub fn allocate_aux<T: VpuTransport>(
        &mut self,
        vpu: &mut T,
        handle: InstanceHandle,
        ty: AuxBufferType,
        count: usize,
        geometry: &AuxGeometry,
    ) -> HwResult<()> {
        if count > WAVE6_MAX_FBS {
            return Err(HwError::Other(anyhow!(
                "{} {:?} buffers requested, at most {} supported",
                count,
                ty,
                WAVE6_MAX_FBS
            )));
        }

        let info = AuxBufferSizeInfo {
            width: geometry.width,
            height: geometry.height,
            ty: Some(ty),
            mirror_direction: geometry.mirror_direction,
            rotation_angle: geometry.rotation_angle,
        };
        let size = vpu.aux_buffer_size(handle, &info).map_err(|e| {
            log::error!("failed to get aux buffer size ty={:?}: {}", ty, e);
            e
        })?;

        let mut bufs = Vec::with_capacity(count);
        let res = (|| {
            for _ in 0..count {
                bufs.push(vpu.alloc_dma(size)?);
            }

            let entries: Vec<AuxBufferEntry> = bufs
                .iter()
                .enumerate()
                .map(|(index, buf)| AuxBufferEntry { index, addr: buf.daddr, size: buf.size })
                .collect();
            vpu.register_aux_buffers(handle, ty, &entries)
        })();

        if let Err(e) = res {
            log::error!("failed to set up {} aux buffers ty={:?}: {}", count, ty, e);
            for buf in bufs {
                vpu.free_dma(buf);
            }
            return Err(e);
        }

        log::debug!("allocated {} aux buffers ty={:?} size={}", count, ty, size);
        if let Some(old) = self.aux.insert(ty, bufs) {
            for buf in old {
                vpu.free_dma(buf);
            }
        }

        Ok(())
    }

    /// Allocates the reconstruction buffers and all their auxiliary tables, then registers
    /// them with the instance. Any failure releases everything.
    pub fn prepare_frame_buffers<T: VpuTransport>(
        &mut self,
        vpu: &mut T,
        handle: InstanceHandle,
        info: &InitialInfo,
        geometry: &AuxGeometry,
    ) -> HwResult<()> {
        let res = self.try_prepare_frame_buffers(vpu, handle, info, geometry);
        if res.is_err() {
            self.release_all(vpu);
        }

        res
    }

    fn try_prepare_frame_buffers<T: VpuTransport>(
        &mut self,
        vpu: &mut T,
        handle: InstanceHandle,
        info: &InitialInfo,
        geometry: &AuxGeometry,
    ) -> HwResult<()> {
        let fb_num = info.min_frame_buffer_count as usize;
        let mv_num = info.req_mv_buffer_count as usize;
        if fb_num > WAVE6_MAX_FBS {
            return Err(HwError::Other(anyhow!(
                "{} frame buffers requested, at most {} supported",
                fb_num,
                WAVE6_MAX_FBS
            )));
        }

        let layout = FrameBufferLayout::new(&Rect::new(0, 0, geometry.width, geometry.height));

        for _ in 0..fb_num {
            let mem = vpu.alloc_dma(layout.luma_size + layout.chroma_size).map_err(|e| {
                log::error!(
                    "failed to allocate frame buffer size={}",
                    layout.luma_size + layout.chroma_size
                );
                e
            })?;

            self.frame_mem.push(mem);
            self.frames.push(FrameBuffer {
                buf_y: mem.daddr,
                buf_cb: mem.daddr + layout.luma_size as u64,
                buf_cr: u64::MAX,
                stride: layout.stride,
                height: layout.height,
                map_type: COMPRESSED_FRAME_MAP,
            });
        }

        for ty in AuxBufferType::ALL {
            let count = match ty {
                AuxBufferType::MvCol => mv_num,
                _ => fb_num,
            };
            self.allocate_aux(vpu, handle, ty, count, geometry)?;
        }

        vpu.register_frame_buffers(
            handle,
            &self.frames,
            layout.stride,
            layout.height,
            COMPRESSED_FRAME_MAP,
        )
        .map_err(|e| {
            log::error!("failed to register frame buffers: {}", e);
            e
        })
    }

    /// Frees every frame and auxiliary buffer. Calling it on an empty arena does nothing.
    pub fn release_all<T: VpuTransport>(&mut self, vpu: &mut T) {
        for buf in self.frame_mem.drain(..) {
            vpu.free_dma(buf);
        }
        self.frames.clear();

        for (_, bufs) in std::mem::take(&mut self.aux) {
            for buf in bufs {
                vpu.free_dma(buf);
            }
        }
    }
}
