// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A software stand-in for the Wave6 firmware, whose only purpose is to let encoder sessions
//! run so we can test them in isolation.
//!
//! Jobs complete synchronously: [`VpuTransport::submit_frame`] records the job and signals its
//! completion right away, so the result is available as soon as the session drains its
//! notifier. The produced bitstream is a recognizable fake written into the destination
//! buffer.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::anyhow;

use crate::hw::params::AuxBufferEntry;
use crate::hw::params::AuxBufferSizeInfo;
use crate::hw::params::AuxBufferType;
use crate::hw::params::EncCommand;
use crate::hw::params::EncOpenParam;
use crate::hw::params::EncParam;
use crate::hw::params::ForcePicType;
use crate::hw::params::FrameBuffer;
use crate::hw::params::InitialInfo;
use crate::hw::params::OutputInfo;
use crate::hw::params::PicType;
use crate::hw::params::RECON_IDX_FLAG_ENC_END;
use crate::hw::DmaBuffer;
use crate::hw::HwError;
use crate::hw::HwResult;
use crate::hw::InstanceHandle;
use crate::hw::VpuTransport;
use crate::worker::CompletionNotifier;
use crate::worker::JobEvent;

/// Simulated core clock, used to turn cycle counts into time.
const DUMMY_CLOCK_HZ: u64 = 500_000_000;
const DUMMY_FRAME_CYCLES: u64 = 250_000;
const DMA_PAGE_SIZE: usize = 4096;
/// First device address handed out, so that a zero address is never valid.
const DMA_BASE: u64 = 0x1000_0000;

const KEY_FRAME_PAYLOAD: usize = 96;
const INTER_FRAME_PAYLOAD: usize = 48;

struct DummyInstance {
    params: EncOpenParam,
    notifier: CompletionNotifier,
    commands: Vec<EncCommand>,
    seq_initialized: bool,
    aux: BTreeMap<AuxBufferType, usize>,
    frame_buffers: usize,
    submitted: Vec<EncParam>,
    frames_encoded: usize,
    pending_output: Option<OutputInfo>,
    job_running: bool,
}

/// Simulated codec. The knobs allow tests to inject the failures a real device may report.
pub struct DummyVpu {
    next_daddr: u64,
    live: BTreeMap<u64, usize>,
    contents: BTreeMap<u64, Vec<u8>>,
    power_refs: u32,
    next_handle: u32,
    instances: BTreeMap<InstanceHandle, DummyInstance>,
    finished_jobs: usize,
    seq_inits: usize,
    cpu_syncs: Vec<(u64, usize)>,

    initial_info: InitialInfo,
    alloc_budget: Option<usize>,
    fail_open: bool,
    fail_submit: bool,
    fail_next_job: bool,
    seq_init_timeout: bool,
    seq_change_pending: bool,
    fail_seq_change: bool,
    encoding_success: bool,
    pic_types: Vec<PicType>,
}

impl Default for DummyVpu {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyVpu {
    pub fn new() -> Self {
        Self {
            next_daddr: DMA_BASE,
            live: Default::default(),
            contents: Default::default(),
            power_refs: 0,
            next_handle: 0,
            instances: Default::default(),
            finished_jobs: 0,
            seq_inits: 0,
            cpu_syncs: Vec::new(),
            initial_info: InitialInfo {
                min_frame_buffer_count: 2,
                min_src_frame_count: 2,
                req_mv_buffer_count: 2,
            },
            alloc_budget: None,
            fail_open: false,
            fail_submit: false,
            fail_next_job: false,
            seq_init_timeout: false,
            seq_change_pending: false,
            fail_seq_change: false,
            encoding_success: true,
            pic_types: Vec::new(),
        }
    }

    /// Requirements reported by the next sequence initializations.
    pub fn set_initial_info(&mut self, info: InitialInfo) {
        self.initial_info = info;
    }

    /// Lets `count` more allocations succeed, then fails all of them. `None` removes the limit.
    pub fn fail_allocations_after(&mut self, count: Option<usize>) {
        self.alloc_budget = count;
    }

    pub fn fail_open(&mut self, fail: bool) {
        self.fail_open = fail;
    }

    /// Makes every submission get rejected.
    pub fn fail_submit(&mut self, fail: bool) {
        self.fail_submit = fail;
    }

    /// Reports a fatal error instead of the completion of the next job.
    pub fn fail_next_job(&mut self) {
        self.fail_next_job = true;
    }

    pub fn seq_init_timeout(&mut self, timeout: bool) {
        self.seq_init_timeout = timeout;
    }

    /// Makes the next parameter update start a sequence change.
    pub fn trigger_seq_change(&mut self) {
        self.seq_change_pending = true;
    }

    /// Makes parameter updates get rejected.
    pub fn fail_seq_change(&mut self, fail: bool) {
        self.fail_seq_change = fail;
    }

    pub fn set_encoding_success(&mut self, success: bool) {
        self.encoding_success = success;
    }

    /// Picture types reported for successive frames, cycled over. When empty, the first frame
    /// is an IDR and the others are P frames.
    pub fn set_pic_types(&mut self, pic_types: Vec<PicType>) {
        self.pic_types = pic_types;
    }

    pub fn live_allocations(&self) -> usize {
        self.live.len()
    }

    pub fn power_refs(&self) -> u32 {
        self.power_refs
    }

    pub fn open_instances(&self) -> usize {
        self.instances.len()
    }

    pub fn finished_jobs(&self) -> usize {
        self.finished_jobs
    }

    /// Number of completed sequence initializations and sequence changes.
    pub fn seq_inits(&self) -> usize {
        self.seq_inits
    }

    /// Address and length of every range synchronized for the CPU, oldest first.
    pub fn cpu_syncs(&self) -> &[(u64, usize)] {
        &self.cpu_syncs
    }

    /// Data last written to the allocation starting at `daddr`.
    pub fn read_dma(&self, daddr: u64) -> Option<&[u8]> {
        self.contents.get(&daddr).map(Vec::as_slice)
    }

    pub fn open_params(&self, handle: InstanceHandle) -> Option<&EncOpenParam> {
        self.instances.get(&handle).map(|inst| &inst.params)
    }

    pub fn commands(&self, handle: InstanceHandle) -> &[EncCommand] {
        self.instances.get(&handle).map(|inst| inst.commands.as_slice()).unwrap_or(&[])
    }

    pub fn registered_frame_buffers(&self, handle: InstanceHandle) -> usize {
        self.instances.get(&handle).map(|inst| inst.frame_buffers).unwrap_or(0)
    }

    pub fn registered_aux_buffers(&self, handle: InstanceHandle, ty: AuxBufferType) -> usize {
        self.instances
            .get(&handle)
            .and_then(|inst| inst.aux.get(&ty).copied())
            .unwrap_or(0)
    }

    /// Every job submitted to `handle`, oldest first.
    pub fn submitted(&self, handle: InstanceHandle) -> &[EncParam] {
        self.instances.get(&handle).map(|inst| inst.submitted.as_slice()).unwrap_or(&[])
    }

    fn instance(&mut self, handle: InstanceHandle) -> HwResult<&mut DummyInstance> {
        self.instances.get_mut(&handle).ok_or(HwError::UnknownInstance(handle))
    }

    fn check_live(&self, daddr: u64) -> HwResult<()> {
        let contains = self
            .live
            .range(..=daddr)
            .next_back()
            .map(|(start, size)| daddr < start + (*size).max(1) as u64)
            .unwrap_or(false);

        if contains {
            Ok(())
        } else {
            Err(HwError::UnknownBuffer(daddr))
        }
    }

    fn next_pic_type(&self, param: &EncParam, frame: usize) -> PicType {
        if param.force_pic_type_enable {
            match param.force_pic_type {
                ForcePicType::I => return PicType::I,
                ForcePicType::P => return PicType::P,
                ForcePicType::B => return PicType::B,
                ForcePicType::Idr => return PicType::Idr,
                ForcePicType::Disabled => (),
            }
        }

        if !self.pic_types.is_empty() {
            self.pic_types[frame % self.pic_types.len()]
        } else if frame == 0 {
            PicType::Idr
        } else {
            PicType::P
        }
    }
}

fn fake_bitstream(pic_type: PicType, frame: usize, src_idx: usize) -> Vec<u8> {
    let len = match pic_type {
        PicType::I | PicType::Idr => KEY_FRAME_PAYLOAD,
        PicType::P | PicType::B => INTER_FRAME_PAYLOAD,
    };

    let mut data = vec![0, 0, 0, 1, pic_type as u8];
    data.extend_from_slice(&(frame as u32).to_le_bytes());
    data.extend_from_slice(&(src_idx as u32).to_le_bytes());
    data.resize(len, 0xa5);
    data
}

impl VpuTransport for DummyVpu {
    fn power_on(&mut self) -> HwResult<()> {
        self.power_refs += 1;
        Ok(())
    }

    fn power_off(&mut self) {
        if self.power_refs == 0 {
            log::warn!("unbalanced power off");
        }
        self.power_refs = self.power_refs.saturating_sub(1);
    }

    fn alloc_dma(&mut self, size: usize) -> HwResult<DmaBuffer> {
        match &mut self.alloc_budget {
            Some(0) => return Err(HwError::OutOfMemory(size)),
            Some(budget) => *budget -= 1,
            None => (),
        }

        let daddr = self.next_daddr;
        self.next_daddr += (size.max(1).next_multiple_of(DMA_PAGE_SIZE) + DMA_PAGE_SIZE) as u64;
        self.live.insert(daddr, size);

        Ok(DmaBuffer { daddr, size })
    }

    fn free_dma(&mut self, buf: DmaBuffer) {
        if self.live.remove(&buf.daddr).is_none() {
            log::error!("freeing unknown DMA buffer {:#x}", buf.daddr);
        }
        self.contents.remove(&buf.daddr);
    }

    fn write_dma(&mut self, buf: &DmaBuffer, data: &[u8]) -> HwResult<()> {
        match self.live.get(&buf.daddr) {
            Some(size) if data.len() <= *size => {
                self.contents.insert(buf.daddr, data.to_vec());
                Ok(())
            }
            Some(size) => Err(HwError::Other(anyhow!(
                "writing {} bytes into a {} bytes buffer",
                data.len(),
                size
            ))),
            None => Err(HwError::UnknownBuffer(buf.daddr)),
        }
    }

    fn sync_for_device(&mut self, _: u64, _: usize) {}

    fn sync_for_cpu(&mut self, daddr: u64, size: usize) {
        self.cpu_syncs.push((daddr, size));
    }

    fn open(
        &mut self,
        params: &EncOpenParam,
        notifier: CompletionNotifier,
    ) -> HwResult<InstanceHandle> {
        if self.fail_open {
            return Err(HwError::Rejected { reason: 0x1 });
        }
        if params.ar_base != 0 {
            self.check_live(params.ar_base)?;
        }

        let handle = InstanceHandle(self.next_handle);
        self.next_handle += 1;
        self.instances.insert(
            handle,
            DummyInstance {
                params: params.clone(),
                notifier,
                commands: Vec::new(),
                seq_initialized: false,
                aux: Default::default(),
                frame_buffers: 0,
                submitted: Vec::new(),
                frames_encoded: 0,
                pending_output: None,
                job_running: false,
            },
        );

        Ok(handle)
    }

    fn close(&mut self, handle: InstanceHandle) -> HwResult<()> {
        match self.instances.remove(&handle) {
            Some(_) => Ok(()),
            None => Err(HwError::UnknownInstance(handle)),
        }
    }

    fn give_command(&mut self, handle: InstanceHandle, cmd: EncCommand) -> HwResult<()> {
        self.instance(handle)?.commands.push(cmd);
        Ok(())
    }

    fn issue_seq_init(&mut self, handle: InstanceHandle) -> HwResult<()> {
        self.instance(handle)?;
        Ok(())
    }

    fn complete_seq_init(&mut self, handle: InstanceHandle) -> HwResult<InitialInfo> {
        let info = self.initial_info;
        self.instance(handle)?.seq_initialized = true;
        self.seq_inits += 1;
        Ok(info)
    }

    fn issue_seq_change(&mut self, handle: InstanceHandle) -> HwResult<bool> {
        self.instance(handle)?;
        if self.fail_seq_change {
            return Err(HwError::Rejected { reason: 0x10 });
        }
        Ok(std::mem::take(&mut self.seq_change_pending))
    }

    fn wait_for_completion(&mut self, handle: InstanceHandle, timeout: Duration) -> HwResult<()> {
        self.instance(handle)?;
        if self.seq_init_timeout {
            return Err(HwError::Timeout(timeout));
        }
        Ok(())
    }

    fn aux_buffer_size(
        &mut self,
        handle: InstanceHandle,
        info: &AuxBufferSizeInfo,
    ) -> HwResult<usize> {
        self.instance(handle)?;

        let (width, height) = match info.rotation_angle {
            90 | 270 => (info.height, info.width),
            _ => (info.width, info.height),
        };
        let (width, height) = (width as usize, height as usize);

        match info.ty {
            Some(AuxBufferType::FbcYTbl) => {
                Ok(width.next_multiple_of(16) * height.next_multiple_of(4) / 32)
            }
            Some(AuxBufferType::FbcCTbl) => {
                Ok((width / 2).next_multiple_of(16) * height.next_multiple_of(4) / 32)
            }
            Some(AuxBufferType::MvCol) => {
                Ok(width.div_ceil(64) * height.div_ceil(64) * 512)
            }
            Some(AuxBufferType::SubSample) => {
                Ok((width / 4).next_multiple_of(16) * (height / 4).next_multiple_of(8))
            }
            None => Err(HwError::Other(anyhow!("no aux buffer type given"))),
        }
    }

    fn register_aux_buffers(
        &mut self,
        handle: InstanceHandle,
        ty: AuxBufferType,
        bufs: &[AuxBufferEntry],
    ) -> HwResult<()> {
        for buf in bufs {
            self.check_live(buf.addr)?;
        }
        self.instance(handle)?.aux.insert(ty, bufs.len());
        Ok(())
    }

    fn register_frame_buffers(
        &mut self,
        handle: InstanceHandle,
        frames: &[FrameBuffer],
        _: u32,
        _: u32,
        _: u32,
    ) -> HwResult<()> {
        for frame in frames {
            self.check_live(frame.buf_y)?;
            self.check_live(frame.buf_cb)?;
        }
        self.instance(handle)?.frame_buffers = frames.len();
        Ok(())
    }

    fn submit_frame(&mut self, handle: InstanceHandle, param: &EncParam) -> HwResult<()> {
        if self.fail_submit {
            return Err(HwError::Rejected { reason: 0x20 });
        }

        let inst = self.instances.get(&handle).ok_or(HwError::UnknownInstance(handle))?;
        if !inst.seq_initialized || inst.frame_buffers == 0 {
            return Err(HwError::Rejected { reason: 0x2 });
        }
        if inst.job_running {
            return Err(HwError::Rejected { reason: 0x4 });
        }
        let frame = inst.frames_encoded;

        let output = if param.src_end {
            OutputInfo {
                bitstream_buffer: param.pic_stream_buffer_addr,
                recon_frame_index: RECON_IDX_FLAG_ENC_END,
                enc_src_idx: -1,
                encoding_success: true,
                ..Default::default()
            }
        } else {
            let pic_type = self.next_pic_type(param, frame);
            let data = fake_bitstream(pic_type, frame, param.src_idx);
            let size = data.len().min(param.pic_stream_buffer_size);
            if self.live.contains_key(&param.pic_stream_buffer_addr) {
                self.contents.insert(param.pic_stream_buffer_addr, data[..size].to_vec());
            }

            let avg_ctu_qp = if param.force_pic_qp_enable {
                match pic_type {
                    PicType::I | PicType::Idr => param.force_pic_qp_i,
                    PicType::P => param.force_pic_qp_p,
                    PicType::B => param.force_pic_qp_b,
                }
            } else {
                26 + (frame % 6) as u32
            };

            OutputInfo {
                bitstream_buffer: param.pic_stream_buffer_addr,
                bitstream_size: size,
                pic_type: pic_type as i32,
                recon_frame_index: (frame % 2) as i32,
                enc_src_idx: param.src_idx as i32,
                avg_ctu_qp,
                encoding_success: self.encoding_success,
                frame_cycle: DUMMY_FRAME_CYCLES,
            }
        };

        let fatal = std::mem::take(&mut self.fail_next_job);
        let inst = self.instance(handle)?;
        inst.submitted.push(param.clone());
        if !param.src_end {
            inst.frames_encoded += 1;
        }
        inst.pending_output = Some(output);
        inst.job_running = true;

        inst.notifier.notify(if fatal { JobEvent::Fatal } else { JobEvent::Completed });

        Ok(())
    }

    fn output_info(&mut self, handle: InstanceHandle) -> HwResult<OutputInfo> {
        self.instance(handle)?.pending_output.take().ok_or(HwError::Rejected { reason: 0x8 })
    }

    fn finish_job(&mut self, handle: InstanceHandle) {
        match self.instances.get_mut(&handle) {
            Some(inst) => {
                inst.job_running = false;
                inst.pending_output = None;
                self.finished_jobs += 1;
            }
            None => log::warn!("finishing job of unknown instance {:?}", handle),
        }
    }

    fn cycle_to_nanos(&self, cycles: u64) -> u64 {
        cycles * 1_000_000_000 / DUMMY_CLOCK_HZ
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations() {
        let mut vpu = DummyVpu::new();

        let a = vpu.alloc_dma(100).unwrap();
        let b = vpu.alloc_dma(5000).unwrap();
        assert_ne!(a.daddr, 0);
        assert!(b.daddr >= a.daddr + 100);
        assert_eq!(vpu.live_allocations(), 2);

        vpu.write_dma(&a, &[1, 2, 3]).unwrap();
        assert_eq!(vpu.read_dma(a.daddr), Some(&[1u8, 2, 3][..]));
        assert!(vpu.write_dma(&a, &[0; 101]).is_err());

        vpu.free_dma(a);
        assert_eq!(vpu.read_dma(a.daddr), None);
        assert!(matches!(vpu.write_dma(&a, &[0]), Err(HwError::UnknownBuffer(_))));

        vpu.fail_allocations_after(Some(1));
        let c = vpu.alloc_dma(10).unwrap();
        assert!(matches!(vpu.alloc_dma(10), Err(HwError::OutOfMemory(10))));

        vpu.free_dma(b);
        vpu.free_dma(c);
        assert_eq!(vpu.live_allocations(), 0);
    }

    #[test]
    fn submit_signals_completion() {
        let mut vpu = DummyVpu::new();
        let notifier = CompletionNotifier::new().unwrap();
        let handle = vpu.open(&EncOpenParam::default(), notifier.clone()).unwrap();
        let param = EncParam { pic_stream_buffer_size: 4096, ..Default::default() };

        // Not ready to encode yet.
        assert!(vpu.submit_frame(handle, &param).is_err());

        vpu.issue_seq_init(handle).unwrap();
        vpu.complete_seq_init(handle).unwrap();
        let fb = vpu.alloc_dma(4096).unwrap();
        let frame =
            FrameBuffer { buf_y: fb.daddr, buf_cb: fb.daddr + 2048, ..Default::default() };
        vpu.register_frame_buffers(handle, &[frame], 0, 0, 0).unwrap();

        vpu.submit_frame(handle, &param).unwrap();
        let notices = notifier.drain();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].event, JobEvent::Completed);
        // One job at a time.
        assert!(vpu.submit_frame(handle, &param).is_err());

        let info = vpu.output_info(handle).unwrap();
        assert_eq!(info.pic_type, PicType::Idr as i32);
        assert_eq!(info.bitstream_size, KEY_FRAME_PAYLOAD);
        vpu.finish_job(handle);

        let end = EncParam { src_end: true, ..param };
        vpu.submit_frame(handle, &end).unwrap();
        assert_eq!(vpu.output_info(handle).unwrap().recon_frame_index, RECON_IDX_FLAG_ENC_END);
        vpu.finish_job(handle);

        assert_eq!(vpu.finished_jobs(), 2);
        assert_eq!(vpu.submitted(handle).len(), 2);
        vpu.close(handle).unwrap();
        assert!(vpu.close(handle).is_err());
    }
}
