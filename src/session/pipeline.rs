// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Building of encode jobs and handling of their completions.

use std::time::Instant;

use crate::color::derive_csc;
use crate::controls::RoiMode;
use crate::format::find_by_pixel_format;
use crate::format::FormatKind;
use crate::format::PixFormat;
use crate::geometry::layout_offsets;
use crate::hw::params::EncParam;
use crate::hw::params::ForcePicType;
use crate::hw::params::FrameBuffer;
use crate::hw::params::OutputInfo;
use crate::hw::params::PicType;
use crate::hw::params::RECON_IDX_FLAG_ENC_END;
use crate::hw::InstanceHandle;
use crate::hw::VpuTransport;
use crate::hw::VPU_TIMEOUT;
use crate::queue::copy_metadata;
use crate::queue::BufferFlags;
use crate::queue::BufferQueue;
use crate::queue::BufferState;
use crate::queue::QueueDirection;
use crate::queue::VpuBuffer;
use crate::session::EncoderSession;
use crate::session::InstanceState;
use crate::session::SessionError;
use crate::session::SessionResult;
use crate::Rect;

/// Addresses of the part of `src` covered by `codec_rect`.
pub(super) fn source_frame(fmt: &PixFormat, codec_rect: &Rect, src: &VpuBuffer) -> FrameBuffer {
    let stride = fmt.planes[0].bytesperline;
    let luma_size = stride as u64 * fmt.height as u64;
    let chroma_size = match &<[u8; 4]>::from(fmt.fourcc) {
        b"YU12" | b"YM12" => (stride / 2) as u64 * (fmt.height / 2) as u64,
        b"422P" | b"YM16" => stride as u64 * (fmt.height / 2) as u64,
        _ => 0,
    };

    let (mut buf_y, mut buf_cb, mut buf_cr) = match fmt.num_planes {
        1 => {
            let y = src.plane_daddr(0);
            (y, y + luma_size, y + luma_size + chroma_size)
        }
        2 => {
            let cb = src.plane_daddr(1);
            (src.plane_daddr(0), cb, cb + chroma_size)
        }
        _ => (src.plane_daddr(0), src.plane_daddr(1), src.plane_daddr(2)),
    };

    if let Some(desc) = find_by_pixel_format(fmt.fourcc, FormatKind::Raw) {
        let offsets = layout_offsets(stride, &desc.layout, codec_rect);
        buf_y += offsets.luma;
        buf_cb += offsets.chroma;
        buf_cr += offsets.chroma;
    }

    FrameBuffer { buf_y, buf_cb, buf_cr, stride, ..Default::default() }
}

impl<T: VpuTransport, Q: BufferQueue> EncoderSession<T, Q> {
    fn set_csc(&self, param: &mut EncParam) {
        let desc = match find_by_pixel_format(self.src_fmt.fourcc, FormatKind::Raw) {
            Some(desc) if desc.is_rgb() => desc,
            _ => return,
        };

        derive_csc(
            self.colorimetry.ycbcr_enc,
            self.colorimetry.quantization,
            desc.is_10bit,
            desc.csc_order,
            &mut param.csc,
        );
    }

    /// Lets the firmware apply parameter changes before the next picture.
    fn update_seq_param(&mut self, vpu: &mut T, handle: InstanceHandle) -> SessionResult<()> {
        let changed = vpu.issue_seq_change(handle).map_err(|e| {
            log::error!("failed to issue sequence change: {}", e);
            e
        })?;
        if !changed {
            return Ok(());
        }

        if let Err(e) = vpu.wait_for_completion(handle, VPU_TIMEOUT) {
            log::warn!("sequence change did not complete: {}", e);
            return Ok(());
        }
        if let Err(e) = vpu.complete_seq_init(handle) {
            log::warn!("failed to complete sequence change: {}", e);
        }

        Ok(())
    }

    /// Submits the next job to the hardware.
    ///
    /// Returns `Ok(false)` when there is nothing to encode yet. A job the hardware refuses
    /// errors out its buffers, stops the session and returns [`SessionError::Submit`].
    pub(super) fn start_encode(&mut self, vpu: &mut T) -> SessionResult<bool> {
        let handle = self.handle.ok_or(SessionError::NoInstance)?;
        self.update_seq_param(vpu, handle)?;

        let dst_pos = match self.queues.next_unconsumed(QueueDirection::Capture) {
            Some(pos) => pos,
            None => {
                log::error!("no capture buffer to encode into");
                return Ok(false);
            }
        };

        let mut param = EncParam::default();
        match self.queues.get(QueueDirection::Capture, dst_pos) {
            Some(dst) => {
                param.pic_stream_buffer_addr = dst.plane_daddr(0);
                param.pic_stream_buffer_size = dst.plane_size(0);
            }
            None => return Ok(false),
        }

        let src_pos = self.queues.next_unconsumed(QueueDirection::Output);
        match src_pos.and_then(|pos| self.queues.get(QueueDirection::Output, pos)) {
            None if self.state == InstanceState::Stop => param.src_end = true,
            None => {
                log::debug!("no source frame ready");
                return Ok(false);
            }
            Some(src) => {
                param.source_frame = source_frame(&self.src_fmt, &self.region.codec_rect, src);
                for (plane, fmt) in src.planes.iter().zip(self.src_fmt.planes.iter()) {
                    vpu.sync_for_device(plane.mem.daddr, fmt.sizeimage as usize);
                }
                param.src_idx = src.index as usize;

                if src.force_key_frame || self.error_recovery {
                    param.force_pic_type_enable = true;
                    param.force_pic_type = ForcePicType::Idr;
                    self.error_recovery = false;
                }

                if self.controls.roi_mode == RoiMode::MapDeltaQp {
                    if let Some(map) = src.custom_map {
                        param.custom_roi_map_enable = true;
                        param.custom_map_addr = map.daddr;
                    }
                }

                if src.force_frame_qp {
                    param.force_pic_qp_enable = true;
                    param.force_pic_qp_i = src.force_i_frame_qp;
                    param.force_pic_qp_p = src.force_p_frame_qp;
                    param.force_pic_qp_b = src.force_b_frame_qp;
                }
            }
        }

        self.set_csc(&mut param);

        let now = Instant::now();
        let src = src_pos.and_then(|pos| self.queues.get_mut(QueueDirection::Output, pos));
        if let Some(src) = src {
            src.consumed = true;
            src.ts_start = Some(now);
        }
        if let Some(dst) = self.queues.get_mut(QueueDirection::Capture, dst_pos) {
            dst.consumed = true;
            dst.used = true;
        }

        log::debug!(
            "submitting job src_idx={:?} dst={:#x} src_end={} force_idr={}",
            src_pos.map(|_| param.src_idx),
            param.pic_stream_buffer_addr,
            param.src_end,
            param.force_pic_type_enable
        );

        if let Err(e) = vpu.submit_frame(handle, &param) {
            log::error!("failed to submit frame: {}", e);
            if let Err(e) = self.transition(InstanceState::Stop) {
                log::error!("{}", e);
            }

            if let Some(mut dst) = self.queues.remove_at(QueueDirection::Capture, dst_pos) {
                dst.sequence = self.counters.sequence;
                self.queues.buf_done(QueueDirection::Capture, dst, BufferState::Error);
            }
            let src = src_pos.and_then(|pos| self.queues.remove_at(QueueDirection::Output, pos));
            if let Some(src) = src {
                self.queues.buf_done(QueueDirection::Output, src, BufferState::Error);
                self.counters.sequence += 1;
                self.counters.processed += 1;
                self.counters.error += 1;
            }

            return Err(SessionError::Submit(e));
        }

        Ok(true)
    }

    /// Handles the end of the job in flight. `error` is set when the hardware reported a
    /// fatal condition instead of a result.
    pub(super) fn finish_encode(&mut self, vpu: &mut T, handle: InstanceHandle, error: bool) {
        if error {
            log::error!("fatal hardware error, stopping the session");
            self.queues.queue_error(QueueDirection::Output);
            self.queues.queue_error(QueueDirection::Capture);
            if let Err(e) = self.transition(InstanceState::Stop) {
                log::error!("{}", e);
            }
            self.eos = true;
        } else {
            match vpu.output_info(handle) {
                Ok(info) if info.enc_src_idx >= 0 && info.recon_frame_index >= 0 => {
                    self.handle_encoded_frame(vpu, &info)
                }
                Ok(info) if info.recon_frame_index == RECON_IDX_FLAG_ENC_END => {
                    self.handle_last_frame(info.bitstream_buffer)
                }
                Ok(info) => log::debug!(
                    "job produced no frame recon_idx={} src_idx={}",
                    info.recon_frame_index,
                    info.enc_src_idx
                ),
                Err(e) => log::error!("failed to get output info: {}", e),
            }
        }

        self.finish_job(vpu, handle);
    }

    fn handle_encoded_frame(&mut self, vpu: &mut T, info: &OutputInfo) {
        let state = if info.encoding_success {
            BufferState::Done
        } else {
            log::error!("encoding failed src_idx={}", info.enc_src_idx);
            BufferState::Error
        };

        let src_idx = info.enc_src_idx as u32;
        let src_pos = self.queues.position_by_index(QueueDirection::Output, src_idx);
        let dst_pos = self.queues.position_by_addr(QueueDirection::Capture, info.bitstream_buffer);
        let (src_pos, dst_pos) = match (src_pos, dst_pos) {
            (Some(src_pos), Some(dst_pos)) => (src_pos, dst_pos),
            _ => {
                log::error!(
                    "no buffers for completed frame src_idx={} bitstream={:#x}",
                    info.enc_src_idx,
                    info.bitstream_buffer
                );
                return;
            }
        };
        let consumed = self.queues.get(QueueDirection::Output, src_pos).is_some_and(|b| b.consumed);
        if !consumed {
            log::error!("source buffer {} completed but was never submitted", info.enc_src_idx);
            return;
        }

        let (src, mut dst) = match (
            self.queues.remove_at(QueueDirection::Output, src_pos),
            self.queues.remove_at(QueueDirection::Capture, dst_pos),
        ) {
            (Some(src), Some(dst)) => (src, dst),
            _ => {
                log::error!("completed buffers vanished from their queues");
                return;
            }
        };

        let now = Instant::now();
        dst.average_qp = info.avg_ctu_qp;
        dst.ts_input = src.ts_input;
        dst.ts_start = src.ts_start;
        dst.ts_finish = Some(now);
        dst.ts_output = Some(now);
        dst.hw_time = vpu.cycle_to_nanos(info.frame_cycle);
        self.perf.update(&dst);

        copy_metadata(&src, &mut dst);
        self.queues.buf_done(QueueDirection::Output, src, state);

        dst.set_payload(0, info.bitstream_size);
        dst.sequence = self.counters.sequence;
        self.counters.sequence += 1;

        dst.flags.remove(BufferFlags::FRAME_TYPE);
        match PicType::n(info.pic_type) {
            Some(PicType::I | PicType::Idr) => dst.flags |= BufferFlags::KEYFRAME,
            Some(PicType::P) => dst.flags |= BufferFlags::PFRAME,
            Some(PicType::B) => dst.flags |= BufferFlags::BFRAME,
            None => log::warn!("unknown picture type {}", info.pic_type),
        }

        if state == BufferState::Error {
            self.error_recovery = true;
            self.counters.error += 1;
        }

        vpu.sync_for_cpu(dst.plane_daddr(0), info.bitstream_size);
        self.controls.average_qp = info.avg_ctu_qp;

        log::trace!(
            "frame done seq={} pic_type={} size={} avg_qp={}",
            dst.sequence,
            info.pic_type,
            info.bitstream_size,
            info.avg_ctu_qp
        );
        self.queues.buf_done(QueueDirection::Capture, dst, state);
        self.counters.processed += 1;
    }

    fn handle_last_frame(&mut self, bitstream_buffer: u64) {
        let pos = match self.queues.position_by_addr(QueueDirection::Capture, bitstream_buffer) {
            Some(pos) => pos,
            None => {
                log::error!("no capture buffer at {:#x} for the end of stream", bitstream_buffer);
                return;
            }
        };

        if let Some(mut dst) = self.queues.remove_at(QueueDirection::Capture, pos) {
            dst.set_payload(0, 0);
            dst.flags |= BufferFlags::LAST;
            self.queues.buf_done(QueueDirection::Capture, dst, BufferState::Done);
        }

        if let Err(e) = self.transition(InstanceState::PicRun) {
            log::error!("{}", e);
        }
        self.eos = true;
        self.queues.set_src_buffered(false);
        log::debug!("end of stream reached");
    }

    /// Frees the job slot.
    pub(super) fn finish_job(&mut self, vpu: &mut T, handle: InstanceHandle) {
        self.job_running = false;
        vpu.finish_job(handle);
    }
}
