// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Encoding sessions.
//!
//! An [`EncoderSession`] owns one hardware instance of a [`Wave6Device`] together with the
//! two buffer queues feeding it. It negotiates formats and controls with the client, brings
//! the instance up when both queues stream, and then keeps the single job slot of the
//! instance busy as long as there are frames and bitstream buffers to process.
//!
//! Hardware completions arrive through the session's [`CompletionNotifier`]. They are handled
//! either by calling [`EncoderSession::process_completions`], or from a thread started with
//! [`EncoderSession::spawn_completion_worker`]. Locks are always taken in the session, then
//! device order.

mod params;
mod pipeline;
pub mod state;

use std::collections::BTreeMap;
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use anyhow::anyhow;
use thiserror::Error;

use crate::align_down;
use crate::align_up;
use crate::color::Colorimetry;
use crate::controls::validate_roi_map;
use crate::controls::ControlError;
use crate::controls::ControlId;
use crate::controls::EncControls;
use crate::controls::RoiMode;
use crate::format::find_by_index;
use crate::format::find_by_pixel_format;
use crate::format::frame_size_range;
use crate::format::FormatKind;
use crate::format::FrameSizeRange;
use crate::format::PixFormat;
use crate::format::DEFAULT_ENC_PIC_HEIGHT;
use crate::format::DEFAULT_ENC_PIC_WIDTH;
use crate::format::MAX_ENC_PIC_HEIGHT;
use crate::format::MAX_ENC_PIC_WIDTH;
use crate::format::MIN_ENC_PIC_HEIGHT;
use crate::format::MIN_ENC_PIC_WIDTH;
use crate::geometry::EncodeRegion;
use crate::geometry::ENC_CROP_STEP;
use crate::hw::params::CodecStd;
use crate::hw::params::EncCommand;
use crate::hw::params::InitialInfo;
use crate::hw::params::AR_BUFFER_SIZE;
use crate::hw::DmaBuffer;
use crate::hw::HwError;
use crate::hw::InstanceHandle;
use crate::hw::VpuTransport;
use crate::hw::Wave6Device;
use crate::hw::VPU_TIMEOUT;
use crate::perf::PerformanceInfo;
use crate::queue::BufferQueue;
use crate::queue::BufferState;
use crate::queue::QueueDirection;
use crate::queue::QueueError;
use crate::queue::VpuBuffer;
use crate::resources::AuxGeometry;
use crate::resources::ResourceArena;
use crate::roi::internal_ctu_count;
use crate::roi::remap_user_map;
use crate::roi::roi_grid;
use crate::roi::RoiMapInfo;
use crate::worker::CompletionNotifier;
use crate::worker::CompletionWorker;
use crate::worker::JobEvent;
use crate::worker::JobNotice;
use crate::worker::WorkerError;
use crate::Fourcc;
use crate::Rect;
use crate::Resolution;
use params::enc_open_param;
use params::OpenConfig;
pub use state::InstanceState;

/// Step of the instance bring-up that failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BringUpStage {
    CreateInstance,
    InitializeInstance,
    PrepareFrameBuffers,
}

impl fmt::Display for BringUpStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BringUpStage::CreateInstance => "create instance",
            BringUpStage::InitializeInstance => "initialize sequence",
            BringUpStage::PrepareFrameBuffers => "prepare frame buffers",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid instance state transition {from} -> {to}")]
    InvalidTransition { from: InstanceState, to: InstanceState },
    #[error("unsupported format {0}")]
    InvalidFormat(Fourcc),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("no hardware instance is open")]
    NoInstance,
    #[error("failed to {stage}: {source}")]
    BringUp {
        stage: BringUpStage,
        #[source]
        source: HwError,
    },
    #[error("failed to submit frame: {0}")]
    Submit(#[source] HwError),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Hw(#[from] HwError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectionTarget {
    Crop,
    CropDefault,
    CropBounds,
}

/// Rounding constraints of a selection request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SelectionFlags(pub u32);

impl SelectionFlags {
    /// Round the rectangle outwards.
    pub const GE: Self = Self(1 << 0);
    /// Round the rectangle inwards.
    pub const LE: Self = Self(1 << 1);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for SelectionFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeperframe {
    pub numerator: u32,
    pub denominator: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncoderCommand {
    Stop,
    Start,
}

/// Buffer count and plane sizes negotiated for a queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueSetup {
    pub num_buffers: u32,
    pub sizes: Vec<u32>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionCounters {
    /// Sequence number of the next bitstream buffer.
    pub sequence: u32,
    pub processed: u32,
    pub error: u32,
    pub queued_src: u32,
    pub queued_dst: u32,
}

fn codec_std(fourcc: Fourcc) -> Option<CodecStd> {
    match &<[u8; 4]>::from(fourcc) {
        b"HEVC" => Some(CodecStd::HevcEnc),
        b"H264" => Some(CodecStd::AvcEnc),
        _ => None,
    }
}

pub struct EncoderSession<T: VpuTransport, Q: BufferQueue> {
    device: Arc<Wave6Device<T>>,
    queues: Q,
    notifier: CompletionNotifier,
    handle: Option<InstanceHandle>,
    state: InstanceState,
    std: CodecStd,

    src_fmt: PixFormat,
    dst_fmt: PixFormat,
    colorimetry: Colorimetry,
    frame_rate: u32,
    region: EncodeRegion,
    roi_info: RoiMapInfo,
    controls: EncControls,
    initial_info: InitialInfo,

    /// Delta-QP map set by the client, in the hardware layout.
    custom_qp_map: Vec<u8>,
    /// Per source buffer copies of `custom_qp_map`, keyed by buffer index.
    qp_maps: BTreeMap<u32, DmaBuffer>,
    resources: ResourceArena,
    ar_buffer: Option<DmaBuffer>,
    powered: bool,

    counters: SessionCounters,
    eos: bool,
    error_recovery: bool,
    job_running: bool,
    perf: PerformanceInfo,
}

impl<T: VpuTransport, Q: BufferQueue> EncoderSession<T, Q> {
    pub fn new(device: Arc<Wave6Device<T>>, queues: Q) -> SessionResult<Self> {
        let raw = find_by_index(0, FormatKind::Raw).ok_or_else(|| anyhow!("no raw format"))?;
        let codec =
            find_by_index(0, FormatKind::Codec).ok_or_else(|| anyhow!("no codec format"))?;
        let (width, height) = (DEFAULT_ENC_PIC_WIDTH, DEFAULT_ENC_PIC_HEIGHT);

        let mut session = Self {
            device,
            queues,
            notifier: CompletionNotifier::new()?,
            handle: None,
            state: InstanceState::None,
            std: codec_std(codec.fourcc).unwrap_or_default(),
            src_fmt: PixFormat::new(raw, width, height),
            dst_fmt: PixFormat::new(codec, width, height),
            colorimetry: Default::default(),
            frame_rate: 30,
            region: EncodeRegion::new(Rect::new(0, 0, width, height)),
            roi_info: Default::default(),
            controls: Default::default(),
            initial_info: Default::default(),
            custom_qp_map: vec![
                0;
                internal_ctu_count(CodecStd::AvcEnc, MAX_ENC_PIC_WIDTH, MAX_ENC_PIC_HEIGHT)
            ],
            qp_maps: Default::default(),
            resources: ResourceArena::new(),
            ar_buffer: None,
            powered: false,
            counters: Default::default(),
            eos: false,
            error_recovery: false,
            job_running: false,
            perf: Default::default(),
        };
        session.set_roi_info();

        log::debug!(
            "new session src={:?} dst={:?}",
            session.src_fmt.fourcc,
            session.dst_fmt.fourcc
        );
        Ok(session)
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn instance(&self) -> Option<InstanceHandle> {
        self.handle
    }

    pub fn queues(&self) -> &Q {
        &self.queues
    }

    pub fn queues_mut(&mut self) -> &mut Q {
        &mut self.queues
    }

    pub fn notifier(&self) -> &CompletionNotifier {
        &self.notifier
    }

    pub fn counters(&self) -> SessionCounters {
        self.counters
    }

    /// Whether the last bitstream buffer of the stream has been returned.
    pub fn is_eos(&self) -> bool {
        self.eos
    }

    pub fn performance(&self) -> &PerformanceInfo {
        &self.perf
    }

    pub fn encode_region(&self) -> &EncodeRegion {
        &self.region
    }

    fn transition(&mut self, to: InstanceState) -> SessionResult<()> {
        if !self.state.can_transition_to(to) {
            return Err(SessionError::InvalidTransition { from: self.state, to });
        }

        if self.state != to {
            log::debug!("instance state {} -> {}", self.state, to);
        }
        self.state = to;
        Ok(())
    }

    fn set_roi_info(&mut self) {
        let codec_rect = &self.region.codec_rect;
        let roi_info = roi_grid(self.std, codec_rect.width, codec_rect.height);
        if roi_info == self.roi_info {
            return;
        }

        log::debug!(
            "ROI grid {}x{} ctu={:?} map_size={}",
            roi_info.num_ctu_col,
            roi_info.num_ctu_row,
            roi_info.ctu,
            roi_info.custom_map_size
        );
        self.roi_info = roi_info;
        self.custom_qp_map.fill(0);
    }

    pub fn enum_fmt(&self, kind: FormatKind, index: usize) -> SessionResult<Fourcc> {
        find_by_index(index, kind)
            .map(|desc| desc.fourcc)
            .ok_or(SessionError::InvalidArgument("format index out of range"))
    }

    pub fn enum_framesizes(&self, index: u32, fourcc: Fourcc) -> SessionResult<FrameSizeRange> {
        if index != 0 {
            return Err(SessionError::InvalidArgument("frame size index out of range"));
        }
        frame_size_range(fourcc).ok_or(SessionError::InvalidFormat(fourcc))
    }

    /// Adjusts `fmt` to what the queue `dir` would accept, without applying it.
    pub fn try_fmt(&self, dir: QueueDirection, fmt: &PixFormat) -> PixFormat {
        match dir {
            QueueDirection::Capture => {
                let mut out = match find_by_pixel_format(fmt.fourcc, FormatKind::Codec) {
                    Some(desc) => PixFormat::new(
                        desc,
                        fmt.width.clamp(desc.min_width, desc.max_width),
                        fmt.height.clamp(desc.min_height, desc.max_height),
                    ),
                    None => self.dst_fmt,
                };
                out.colorimetry = self.colorimetry;
                out
            }
            QueueDirection::Output => {
                let mut out = match find_by_pixel_format(fmt.fourcc, FormatKind::Raw) {
                    Some(desc) => PixFormat::new(
                        desc,
                        fmt.width.clamp(desc.min_width, desc.max_width),
                        fmt.height.clamp(desc.min_height, desc.max_height),
                    ),
                    None => self.src_fmt,
                };
                out.colorimetry = fmt.colorimetry.normalized();
                out
            }
        }
    }

    pub fn s_fmt(&mut self, dir: QueueDirection, fmt: &PixFormat) -> SessionResult<PixFormat> {
        let out = self.try_fmt(dir, fmt);

        match dir {
            QueueDirection::Capture => {
                self.std = codec_std(out.fourcc).ok_or(SessionError::InvalidFormat(out.fourcc))?;
                self.dst_fmt = out;
            }
            QueueDirection::Output => {
                if find_by_pixel_format(out.fourcc, FormatKind::Raw).is_none() {
                    return Err(SessionError::InvalidFormat(out.fourcc));
                }
                self.src_fmt = out;
                self.colorimetry = out.colorimetry;
                self.dst_fmt.update(out.width, out.height);
                self.region = EncodeRegion::new(Rect::new(0, 0, out.width, out.height));
            }
        }
        self.set_roi_info();

        log::debug!(
            "set format dir={:?} fourcc={:?} size={}x{}",
            dir,
            out.fourcc,
            out.width,
            out.height
        );
        Ok(out)
    }

    pub fn g_fmt(&self, dir: QueueDirection) -> PixFormat {
        let mut fmt = match dir {
            QueueDirection::Output => self.src_fmt,
            QueueDirection::Capture => self.dst_fmt,
        };
        fmt.colorimetry = self.colorimetry;
        fmt
    }

    pub fn g_selection(
        &self,
        dir: QueueDirection,
        target: SelectionTarget,
    ) -> SessionResult<Rect> {
        if dir != QueueDirection::Output {
            return Err(SessionError::InvalidArgument("selection is only valid on output"));
        }

        match target {
            SelectionTarget::CropDefault | SelectionTarget::CropBounds => {
                Ok(Rect::new(0, 0, self.src_fmt.width, self.src_fmt.height))
            }
            SelectionTarget::Crop => Ok(self.region.crop),
        }
    }

    /// Sets the encoded region of the source frames and returns the rectangle retained.
    ///
    /// Requests leaving less than the minimum picture size to the right or below the origin
    /// are ignored and only get rounded.
    pub fn s_selection(
        &mut self,
        dir: QueueDirection,
        target: SelectionTarget,
        flags: SelectionFlags,
        rect: Rect,
    ) -> SessionResult<Rect> {
        if dir != QueueDirection::Output || target != SelectionTarget::Crop {
            return Err(SessionError::InvalidArgument("only the output crop can be set"));
        }

        let mut flags = flags;
        if !flags.contains(SelectionFlags::GE) && !flags.contains(SelectionFlags::LE) {
            flags = SelectionFlags::LE;
        }

        // Nothing past the largest picture can be selected.
        let mut r = Rect {
            left: rect.left.min(MAX_ENC_PIC_WIDTH),
            top: rect.top.min(MAX_ENC_PIC_HEIGHT),
            width: rect.width.min(MAX_ENC_PIC_WIDTH),
            height: rect.height.min(MAX_ENC_PIC_HEIGHT),
        };
        if flags.contains(SelectionFlags::GE) {
            r.left = align_up(r.left, ENC_CROP_STEP);
            r.top = align_up(r.top, ENC_CROP_STEP);
            r.width = align_up(r.width, ENC_CROP_STEP);
            r.height = align_up(r.height, ENC_CROP_STEP);
        }
        if flags.contains(SelectionFlags::LE) {
            r.left = align_down(r.left, ENC_CROP_STEP);
            r.top = align_down(r.top, ENC_CROP_STEP);
            r.width = align_down(r.width, ENC_CROP_STEP);
            r.height = align_down(r.height, ENC_CROP_STEP);
        }

        let max_width = self.src_fmt.width.saturating_sub(r.left);
        let max_height = self.src_fmt.height.saturating_sub(r.top);
        if r.width == 0
            || r.height == 0
            || max_width < MIN_ENC_PIC_WIDTH
            || max_height < MIN_ENC_PIC_HEIGHT
        {
            log::debug!("ignoring crop {:?}, max size {}x{}", r, max_width, max_height);
            return Ok(r);
        }

        r.width = r.width.clamp(MIN_ENC_PIC_WIDTH, max_width);
        r.height = r.height.clamp(MIN_ENC_PIC_HEIGHT, max_height);

        self.dst_fmt.update(r.width, r.height);
        self.region = EncodeRegion::new(r);
        self.set_roi_info();

        log::debug!("crop={:?} codec_rect={:?}", self.region.crop, self.region.codec_rect);
        Ok(r)
    }

    pub fn g_parm(&self, dir: QueueDirection) -> SessionResult<Timeperframe> {
        if dir != QueueDirection::Output {
            return Err(SessionError::InvalidArgument("frame rate is set on the output queue"));
        }

        Ok(Timeperframe { numerator: 1, denominator: self.frame_rate })
    }

    pub fn s_parm(
        &mut self,
        dir: QueueDirection,
        tpf: Timeperframe,
    ) -> SessionResult<Timeperframe> {
        if dir != QueueDirection::Output {
            return Err(SessionError::InvalidArgument("frame rate is set on the output queue"));
        }

        if tpf.numerator == 0 || tpf.denominator == 0 {
            return self.g_parm(dir);
        }

        self.frame_rate = (tpf.denominator / tpf.numerator).max(1);
        log::debug!("frame_rate={}", self.frame_rate);
        Ok(tpf)
    }

    pub fn set_control(&mut self, id: ControlId, value: i32) -> SessionResult<()> {
        self.controls.set(id, value)?;
        Ok(())
    }

    pub fn get_control(&self, id: ControlId) -> i32 {
        self.controls.get(id)
    }

    pub fn controls(&self) -> &EncControls {
        &self.controls
    }

    /// Loads a delta-QP map, one value per block of [`Self::roi_block_size`] in raster order.
    ///
    /// Maps whose size does not match the current grid are accepted and ignored.
    pub fn set_roi_map(&mut self, map: &[i32]) -> SessionResult<()> {
        validate_roi_map(map)?;
        remap_user_map(map, &self.roi_info, &mut self.custom_qp_map);
        Ok(())
    }

    pub fn roi_block_size(&self) -> Resolution {
        self.roi_info.ctu
    }

    /// Average QP of the last encoded frame.
    pub fn average_qp(&self) -> u32 {
        self.controls.average_qp
    }

    pub fn encoder_cmd(&mut self, cmd: EncoderCommand) -> SessionResult<()> {
        if !self.queues.is_streaming(QueueDirection::Output)
            || !self.queues.is_streaming(QueueDirection::Capture)
        {
            log::debug!("ignoring {:?}, not streaming", cmd);
            return Ok(());
        }

        match cmd {
            EncoderCommand::Stop => {
                self.transition(InstanceState::Stop)?;
                self.queues.set_src_buffered(true);
                self.try_schedule()
            }
            EncoderCommand::Start => Ok(()),
        }
    }

    pub fn queue_setup(
        &self,
        dir: QueueDirection,
        num_buffers: u32,
        sizes: &[u32],
    ) -> SessionResult<QueueSetup> {
        let fmt = match dir {
            QueueDirection::Output => &self.src_fmt,
            QueueDirection::Capture => &self.dst_fmt,
        };

        if !sizes.is_empty() {
            if sizes.len() != fmt.num_planes {
                return Err(SessionError::InvalidArgument("wrong number of planes"));
            }
            if sizes.iter().zip(fmt.planes.iter()).any(|(size, plane)| *size < plane.sizeimage) {
                return Err(SessionError::InvalidArgument("plane too small for the format"));
            }
            return Ok(QueueSetup { num_buffers, sizes: sizes.to_vec() });
        }

        let num_buffers = match dir {
            QueueDirection::Output => num_buffers.max(self.controls.min_buffers_for_output),
            QueueDirection::Capture => num_buffers,
        };
        let sizes = fmt.planes.iter().take(fmt.num_planes).map(|p| p.sizeimage).collect();

        Ok(QueueSetup { num_buffers, sizes })
    }

    /// Hands `buf` to the session and starts a job if possible.
    pub fn queue_buffer(&mut self, dir: QueueDirection, mut buf: VpuBuffer) -> SessionResult<()> {
        if self.queues.is_errored(dir) {
            return Err(QueueError::Errored { dir }.into());
        }
        if self.queues.position_by_index(dir, buf.index).is_some() {
            return Err(QueueError::DuplicateIndex { dir, index: buf.index }.into());
        }
        log::trace!("queue buffer dir={:?} index={}", dir, buf.index);

        match dir {
            QueueDirection::Output => {
                buf.sequence = self.counters.queued_src;
                self.counters.queued_src += 1;
                buf.ts_input = Some(Instant::now());

                buf.force_key_frame = std::mem::take(&mut self.controls.force_key_frame);
                buf.force_frame_qp = !self.controls.frame_rc_enable;
                if buf.force_frame_qp {
                    let (i, p, b) = match self.std {
                        CodecStd::AvcEnc => {
                            let h264 = &self.controls.h264;
                            (h264.i_frame_qp, h264.p_frame_qp, h264.b_frame_qp)
                        }
                        CodecStd::HevcEnc => {
                            let hevc = &self.controls.hevc;
                            (hevc.i_frame_qp, hevc.p_frame_qp, hevc.b_frame_qp)
                        }
                    };
                    buf.force_i_frame_qp = i;
                    buf.force_p_frame_qp = p;
                    buf.force_b_frame_qp = b;
                }

                buf.custom_map = None;
                if self.controls.roi_mode == RoiMode::MapDeltaQp {
                    match self.load_qp_map(buf.index) {
                        Ok(map) => buf.custom_map = Some(map),
                        Err(e) => log::error!("failed to load QP map index={}: {}", buf.index, e),
                    }
                }
            }
            QueueDirection::Capture => self.counters.queued_dst += 1,
        }

        buf.consumed = false;
        buf.used = false;
        self.queues.push(dir, buf)?;

        self.try_schedule()
    }

    /// Copies the current QP map into the map of source buffer `index`.
    fn load_qp_map(&mut self, index: u32) -> SessionResult<DmaBuffer> {
        let size = self.roi_info.custom_map_size;
        let data = self
            .custom_qp_map
            .get(..size)
            .ok_or_else(|| anyhow!("QP map of {} bytes exceeds the scratch map", size))?;

        let device = self.device.clone();
        let mut vpu = device.lock()?;
        let map = match self.qp_maps.get(&index) {
            Some(map) if map.size >= size => *map,
            _ => {
                let map = vpu.alloc_dma(size)?;
                if let Some(old) = self.qp_maps.insert(index, map) {
                    vpu.free_dma(old);
                }
                map
            }
        };
        vpu.write_dma(&map, data)?;

        Ok(map)
    }

    fn release_qp_maps(&mut self, vpu: &mut T) {
        for (_, map) in std::mem::take(&mut self.qp_maps) {
            vpu.free_dma(map);
        }
    }

    /// Called by the client when it takes back a buffer returned by the session.
    pub fn buf_finish(&mut self, dir: QueueDirection, buf: &VpuBuffer) {
        if dir == QueueDirection::Capture {
            self.controls.average_qp = buf.average_qp;
        }
    }

    pub fn stream_on(&mut self, dir: QueueDirection) -> SessionResult<()> {
        if self.queues.is_streaming(dir) {
            return Ok(());
        }
        log::debug!("stream on dir={:?} state={}", dir, self.state);

        if let Err(e) = self.start_streaming(dir) {
            log::error!("failed to start streaming dir={:?}: {}", dir, e);
            self.queues.return_buffers(dir, BufferState::Queued);
            return Err(e);
        }
        self.queues.set_streaming(dir, true);

        self.try_schedule()
    }

    fn start_streaming(&mut self, dir: QueueDirection) -> SessionResult<()> {
        if !self.queues.is_streaming(dir.peer()) {
            return Ok(());
        }

        let device = self.device.clone();
        let mut vpu = device.lock()?;

        if self.state == InstanceState::None {
            self.create_instance(&mut vpu)?;
        }
        if self.state == InstanceState::Open {
            if let Err(e) = self.initialize_instance(&mut vpu) {
                self.destroy_instance(&mut vpu);
                return Err(e);
            }
        }
        if self.state == InstanceState::InitSeq {
            if let Err(e) = self.prepare_fb(&mut vpu) {
                self.destroy_instance(&mut vpu);
                return Err(e);
            }
        }

        Ok(())
    }

    pub fn stream_off(&mut self, dir: QueueDirection) -> SessionResult<()> {
        log::debug!("stream off dir={:?} state={}", dir, self.state);

        let res = self.stop_streaming(dir);
        self.queues.return_buffers(dir, BufferState::Error);
        self.queues.set_streaming(dir, false);

        res
    }

    fn stop_streaming(&mut self, dir: QueueDirection) -> SessionResult<()> {
        let device = self.device.clone();
        let mut vpu = device.lock()?;

        if self.state != InstanceState::None {
            self.quiesce(&mut vpu);

            if self.queues.is_streaming(QueueDirection::Output)
                && self.queues.is_streaming(QueueDirection::Capture)
            {
                if let Err(e) = self.transition(InstanceState::Stop) {
                    log::error!("{}", e);
                }
            }

            match dir {
                QueueDirection::Output => {
                    self.perf.reset();
                    self.counters.queued_src = 0;
                    self.counters.processed = 0;
                    self.counters.error = 0;
                    self.counters.sequence = 0;
                    self.queues.set_src_buffered(false);
                }
                QueueDirection::Capture => {
                    self.eos = false;
                    self.counters.queued_dst = 0;
                }
            }

            if !self.queues.is_streaming(dir.peer()) {
                self.destroy_instance(&mut vpu);
            }
        }

        if dir == QueueDirection::Output {
            self.release_qp_maps(&mut vpu);
        }

        Ok(())
    }

    /// Handles the completions already signalled, then abandons the job still in flight, if
    /// any, erroring out every queued buffer. Completions signalled before this point are
    /// ignored from then on.
    fn quiesce(&mut self, vpu: &mut T) {
        for notice in self.notifier.drain() {
            if self.job_running && self.notifier.is_current(&notice) {
                self.complete_job(vpu, notice.event);
            }
        }

        if self.job_running {
            log::warn!("abandoning the job in flight");
            self.queues.return_buffers(QueueDirection::Output, BufferState::Error);
            self.queues.return_buffers(QueueDirection::Capture, BufferState::Error);
            match self.handle {
                Some(handle) => self.finish_job(vpu, handle),
                None => self.job_running = false,
            }
        }

        self.notifier.new_generation();
    }

    fn create_instance(&mut self, vpu: &mut T) -> SessionResult<()> {
        let bring_up =
            |source| SessionError::BringUp { stage: BringUpStage::CreateInstance, source };
        let src_desc = find_by_pixel_format(self.src_fmt.fourcc, FormatKind::Raw)
            .ok_or(SessionError::InvalidFormat(self.src_fmt.fourcc))?;

        vpu.power_on().map_err(bring_up)?;
        let ar_buffer = match vpu.alloc_dma(AR_BUFFER_SIZE) {
            Ok(buf) => buf,
            Err(e) => {
                log::error!("failed to allocate AR buffer: {}", e);
                vpu.power_off();
                return Err(bring_up(e));
            }
        };

        let open_param = enc_open_param(&OpenConfig {
            std: self.std,
            src_desc,
            src_height: self.src_fmt.height,
            dst_sizeimage: self.dst_fmt.planes[0].sizeimage,
            region: &self.region,
            colorimetry: &self.colorimetry,
            frame_rate: self.frame_rate,
            controls: &self.controls,
            ar_base: ar_buffer.daddr,
        });

        match vpu.open(&open_param, self.notifier.clone()) {
            Ok(handle) => {
                log::debug!("opened instance handle={:?} std={:?}", handle, self.std);
                self.handle = Some(handle);
                self.ar_buffer = Some(ar_buffer);
                self.powered = true;
                self.transition(InstanceState::Open)
            }
            Err(e) => {
                log::error!("failed to open instance: {}", e);
                vpu.free_dma(ar_buffer);
                vpu.power_off();
                Err(bring_up(e))
            }
        }
    }

    fn initialize_instance(&mut self, vpu: &mut T) -> SessionResult<()> {
        let bring_up =
            |source| SessionError::BringUp { stage: BringUpStage::InitializeInstance, source };
        let handle = self.handle.ok_or(SessionError::NoInstance)?;

        let mut commands = Vec::new();
        if self.controls.mirror_direction != 0 {
            commands.push(EncCommand::EnableMirroring);
            commands.push(EncCommand::SetMirrorDirection(self.controls.mirror_direction));
        }
        if self.controls.rot_angle != 0 {
            commands.push(EncCommand::EnableRotation);
            commands.push(EncCommand::SetRotationAngle(self.controls.rot_angle));
        }
        for cmd in commands {
            if let Err(e) = vpu.give_command(handle, cmd) {
                log::warn!("command {:?} failed: {}", cmd, e);
            }
        }

        vpu.issue_seq_init(handle).map_err(bring_up)?;
        vpu.wait_for_completion(handle, VPU_TIMEOUT).map_err(|e| {
            log::error!("sequence init did not complete: {}", e);
            bring_up(e)
        })?;
        let info = vpu.complete_seq_init(handle).map_err(bring_up)?;

        log::debug!(
            "sequence initialized min_fb={} min_src={} mv={}",
            info.min_frame_buffer_count,
            info.min_src_frame_count,
            info.req_mv_buffer_count
        );
        self.controls.min_buffers_for_output = info.min_src_frame_count;
        self.initial_info = info;

        self.transition(InstanceState::InitSeq)
    }

    fn prepare_fb(&mut self, vpu: &mut T) -> SessionResult<()> {
        let handle = self.handle.ok_or(SessionError::NoInstance)?;
        let geometry = AuxGeometry {
            width: self.region.codec_rect.width,
            height: self.region.codec_rect.height,
            mirror_direction: self.controls.mirror_direction,
            rotation_angle: self.controls.rot_angle,
        };

        self.resources
            .prepare_frame_buffers(vpu, handle, &self.initial_info, &geometry)
            .map_err(|source| SessionError::BringUp {
                stage: BringUpStage::PrepareFrameBuffers,
                source,
            })?;

        self.transition(InstanceState::PicRun)
    }

    /// Closes the instance and frees all its memory. Also used to roll back a failed
    /// bring-up.
    fn destroy_instance(&mut self, vpu: &mut T) {
        log::debug!("destroying instance handle={:?} state={}", self.handle, self.state);
        self.quiesce(vpu);

        if let Some(handle) = self.handle.take() {
            if let Err(e) = vpu.close(handle) {
                log::warn!("failed to close instance {:?}: {}", handle, e);
            }
        }
        self.resources.release_all(vpu);
        if let Some(ar_buffer) = self.ar_buffer.take() {
            vpu.free_dma(ar_buffer);
        }

        self.state = InstanceState::None;
        if self.powered {
            vpu.power_off();
            self.powered = false;
        }
    }

    /// Handles every completion signalled so far, scheduling new jobs as slots free up.
    /// Returns the number of events handled. A failure while handling one event is logged and
    /// does not prevent the following ones from being handled.
    pub fn process_completions(&mut self) -> SessionResult<usize> {
        let mut handled = 0;

        loop {
            let notices = self.notifier.drain();
            if notices.is_empty() {
                return Ok(handled);
            }

            for notice in notices {
                if let Err(e) = self.handle_job_event(notice) {
                    log::error!("failed to handle event={:?}: {}", notice.event, e);
                }
                handled += 1;
            }
        }
    }

    /// Completes the job in flight with `notice`, then schedules the next one. Notices raised
    /// before the session last abandoned its jobs are ignored.
    pub fn handle_job_event(&mut self, notice: JobNotice) -> SessionResult<()> {
        if !self.notifier.is_current(&notice) {
            log::debug!("ignoring stale notice={:?}", notice);
            return Ok(());
        }
        if !self.job_running {
            log::debug!("ignoring event={:?}, no job in flight", notice.event);
            return Ok(());
        }

        {
            let device = self.device.clone();
            let mut vpu = device.lock()?;
            self.complete_job(&mut vpu, notice.event);
        }

        self.try_schedule()
    }

    fn complete_job(&mut self, vpu: &mut T, event: JobEvent) {
        match self.handle {
            Some(handle) => self.finish_encode(vpu, handle, event == JobEvent::Fatal),
            None => self.job_running = false,
        }
    }

    fn job_ready(&self) -> bool {
        self.handle.is_some()
            && !self.job_running
            && matches!(self.state, InstanceState::PicRun | InstanceState::Stop)
            && self.queues.is_streaming(QueueDirection::Output)
            && self.queues.is_streaming(QueueDirection::Capture)
            && !self.queues.is_errored(QueueDirection::Output)
            && !self.queues.is_errored(QueueDirection::Capture)
            && self.queues.next_unconsumed(QueueDirection::Capture).is_some()
            && (self.queues.next_unconsumed(QueueDirection::Output).is_some()
                || self.queues.src_buffered())
    }

    fn try_schedule(&mut self) -> SessionResult<()> {
        while self.job_ready() {
            let device = self.device.clone();
            let mut vpu = device.lock()?;

            match self.start_encode(&mut vpu) {
                Ok(true) => {
                    self.job_running = true;
                    return Ok(());
                }
                Ok(false) => return Ok(()),
                Err(SessionError::Submit(e)) => {
                    log::warn!("dropped frame after failed submission: {}", e);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }
}

impl<T, Q> EncoderSession<T, Q>
where
    T: VpuTransport + 'static,
    Q: BufferQueue + 'static,
{
    /// Starts a thread handling the completions of `session` as they are signalled.
    pub fn spawn_completion_worker(
        session: &Arc<Mutex<Self>>,
    ) -> SessionResult<CompletionWorker> {
        let notifier = match session.lock() {
            Ok(session) => session.notifier.clone(),
            Err(_) => return Err(anyhow!("session lock poisoned").into()),
        };
        let session = Arc::downgrade(session);

        let worker = CompletionWorker::spawn(notifier, move |notice: JobNotice| {
            let session = match session.upgrade() {
                Some(session) => session,
                None => return,
            };
            let mut session = match session.lock() {
                Ok(session) => session,
                Err(_) => {
                    log::error!("session lock poisoned, dropping event={:?}", notice.event);
                    return;
                }
            };

            if let Err(e) = session.handle_job_event(notice) {
                log::error!("failed to handle event={:?}: {}", notice.event, e);
            }
        })?;

        Ok(worker)
    }
}

impl<T: VpuTransport, Q: BufferQueue> Drop for EncoderSession<T, Q> {
    fn drop(&mut self) {
        let device = self.device.clone();
        let mut vpu = match device.lock() {
            Ok(vpu) => vpu,
            Err(e) => {
                log::error!("cannot release session: {}", e);
                return;
            }
        };

        if self.state != InstanceState::None {
            self.destroy_instance(&mut vpu);
        }
        self.release_qp_maps(&mut vpu);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::backend::dummy::DummyVpu;
    use crate::color::Colorspace;
    use crate::color::Quantization;
    use crate::color::YcbcrEncoding;
    use crate::hw::params::AuxBufferType;
    use crate::hw::params::CscParams;
    use crate::hw::params::EncParam;
    use crate::hw::params::ForcePicType;
    use crate::hw::params::PicType;
    use crate::queue::BufferFlags;
    use crate::queue::BufferPlane;
    use crate::queue::M2mQueues;
    use crate::roi::raster_from_map;

    type TestSession = EncoderSession<DummyVpu, M2mQueues>;

    const OUTPUT: QueueDirection = QueueDirection::Output;
    const CAPTURE: QueueDirection = QueueDirection::Capture;

    fn setup_with(vpu: DummyVpu) -> (Arc<Wave6Device<DummyVpu>>, TestSession) {
        let _ = env_logger::builder().is_test(true).try_init();

        let device = Wave6Device::new(vpu);
        let session = EncoderSession::new(device.clone(), M2mQueues::new()).unwrap();
        (device, session)
    }

    fn setup() -> (Arc<Wave6Device<DummyVpu>>, TestSession) {
        setup_with(DummyVpu::new())
    }

    fn buffers(
        device: &Wave6Device<DummyVpu>,
        fmt: &PixFormat,
        indices: std::ops::Range<u32>,
    ) -> Vec<VpuBuffer> {
        let mut vpu = device.lock().unwrap();

        indices
            .map(|index| {
                let planes = fmt.planes[..fmt.num_planes]
                    .iter()
                    .map(|p| BufferPlane {
                        mem: vpu.alloc_dma(p.sizeimage as usize).unwrap(),
                        bytesused: 0,
                    })
                    .collect();
                VpuBuffer::new(index, planes)
            })
            .collect()
    }

    fn start(session: &mut TestSession) {
        session.stream_on(OUTPUT).unwrap();
        session.stream_on(CAPTURE).unwrap();
        assert_eq!(session.state(), InstanceState::PicRun);
    }

    /// Queues `count` pairs of source and bitstream buffers, starting at index `first`.
    fn queue_frames(
        device: &Wave6Device<DummyVpu>,
        session: &mut TestSession,
        first: u32,
        count: u32,
    ) {
        let srcs = buffers(device, &session.g_fmt(OUTPUT), first..first + count);
        let dsts = buffers(device, &session.g_fmt(CAPTURE), first..first + count);

        for (mut src, dst) in srcs.into_iter().zip(dsts) {
            src.timestamp = 1000 * src.index as u64;
            session.queue_buffer(OUTPUT, src).unwrap();
            session.queue_buffer(CAPTURE, dst).unwrap();
        }
    }

    fn submitted(device: &Wave6Device<DummyVpu>, session: &TestSession) -> Vec<EncParam> {
        let handle = session.instance().unwrap();
        device.lock().unwrap().submitted(handle).to_vec()
    }

    #[test]
    fn defaults() {
        let (_, session) = setup();

        assert_eq!(session.state(), InstanceState::None);
        assert_eq!(session.g_fmt(OUTPUT).fourcc, Fourcc::from(b"YU12"));
        assert_eq!(session.g_fmt(CAPTURE).fourcc, Fourcc::from(b"HEVC"));
        assert_eq!(session.g_fmt(CAPTURE).planes[0].sizeimage, 416 * 240 * 3 / 2);
        assert_eq!(
            session.g_selection(OUTPUT, SelectionTarget::Crop).unwrap(),
            Rect::new(0, 0, 416, 240)
        );
        assert!(session.g_selection(CAPTURE, SelectionTarget::Crop).is_err());
        assert_eq!(
            session.g_parm(OUTPUT).unwrap(),
            Timeperframe { numerator: 1, denominator: 30 }
        );
        assert_eq!(session.roi_block_size(), Resolution { width: 32, height: 32 });
        assert_eq!(session.enum_fmt(FormatKind::Codec, 1).unwrap(), Fourcc::from(b"H264"));
        assert!(session.enum_fmt(FormatKind::Codec, 2).is_err());
        assert!(session.enum_framesizes(0, Fourcc::from(b"NV12")).is_ok());
        assert!(session.enum_framesizes(1, Fourcc::from(b"NV12")).is_err());
    }

    #[test]
    fn try_fmt_output_clamps_and_normalizes() {
        let (_, session) = setup();

        let request = PixFormat {
            fourcc: Fourcc::from(b"NV12"),
            width: 8000,
            height: 16,
            colorimetry: Colorimetry {
                colorspace: Colorspace::Bt2020,
                ycbcr_enc: YcbcrEncoding::Bt2020ConstLum,
                quantization: Quantization::FullRange,
                ..Default::default()
            },
            ..Default::default()
        };
        let fmt = session.try_fmt(OUTPUT, &request);
        assert_eq!(fmt.fourcc, Fourcc::from(b"NV12"));
        assert_eq!((fmt.width, fmt.height), (MAX_ENC_PIC_WIDTH, MIN_ENC_PIC_HEIGHT));
        assert_eq!(fmt.colorimetry.ycbcr_enc, YcbcrEncoding::Bt2020);
        assert_eq!(fmt.colorimetry.quantization, Quantization::FullRange);

        let unknown = PixFormat { fourcc: Fourcc::from(b"ZZZZ"), width: 640, ..request };
        let fmt = session.try_fmt(OUTPUT, &unknown);
        assert_eq!(fmt.fourcc, Fourcc::from(b"YU12"));
        assert_eq!((fmt.width, fmt.height), (416, 240));
    }

    #[test]
    fn try_fmt_capture() {
        let (_, session) = setup();

        let request = PixFormat {
            fourcc: Fourcc::from(b"H264"),
            width: 1920,
            height: 1080,
            ..Default::default()
        };
        let fmt = session.try_fmt(CAPTURE, &request);
        assert_eq!((fmt.width, fmt.height), (1920, 1080));
        assert_eq!(fmt.planes[0].sizeimage, 1920 * 1080 * 3 / 2);

        let unknown = PixFormat { fourcc: Fourcc::from(b"VP80"), ..request };
        let fmt = session.try_fmt(CAPTURE, &unknown);
        assert_eq!(fmt.fourcc, Fourcc::from(b"HEVC"));
        assert_eq!((fmt.width, fmt.height), (416, 240));
    }

    #[test]
    fn s_fmt_resets_region() {
        let (_, mut session) = setup();

        let request = PixFormat {
            fourcc: Fourcc::from(b"NM12"),
            width: 1280,
            height: 720,
            ..Default::default()
        };
        let fmt = session.s_fmt(OUTPUT, &request).unwrap();
        assert_eq!(fmt.num_planes, 2);
        assert_eq!(session.encode_region().crop, Rect::new(0, 0, 1280, 720));
        assert_eq!(session.encode_region().codec_rect, Rect::new(0, 0, 1280, 720));
        assert_eq!(session.g_fmt(CAPTURE).width, 1280);
        assert_eq!(session.g_fmt(CAPTURE).height, 720);

        let h264 = PixFormat { fourcc: Fourcc::from(b"H264"), ..session.g_fmt(CAPTURE) };
        session.s_fmt(CAPTURE, &h264).unwrap();
        assert_eq!(session.roi_block_size(), Resolution { width: 16, height: 16 });
    }

    #[test]
    fn selection_rounding_and_clamping() {
        let (_, mut session) = setup();
        let crop = SelectionTarget::Crop;
        let none = SelectionFlags::default();

        let r = session.s_selection(OUTPUT, crop, none, Rect::new(3, 5, 301, 201));
        assert_eq!(r.unwrap(), Rect::new(2, 4, 300, 200));
        assert_eq!(session.g_selection(OUTPUT, crop).unwrap(), Rect::new(2, 4, 300, 200));
        assert_eq!((session.g_fmt(CAPTURE).width, session.g_fmt(CAPTURE).height), (300, 200));

        let r = session.s_selection(OUTPUT, crop, SelectionFlags::GE, Rect::new(3, 5, 301, 201));
        assert_eq!(r.unwrap(), Rect::new(4, 6, 302, 202));

        let both = SelectionFlags::GE | SelectionFlags::LE;
        let r = session.s_selection(OUTPUT, crop, both, Rect::new(3, 5, 301, 201));
        assert_eq!(r.unwrap(), Rect::new(4, 6, 302, 202));

        let r = session.s_selection(OUTPUT, crop, none, Rect::new(0, 0, 1000, 1000));
        assert_eq!(r.unwrap(), Rect::new(0, 0, 416, 240));

        let r = session.s_selection(OUTPUT, crop, none, Rect::new(0, 0, 100, 100));
        assert_eq!(r.unwrap(), Rect::new(0, 0, MIN_ENC_PIC_WIDTH, MIN_ENC_PIC_HEIGHT));

        // Not enough room right of the origin: rounded, not applied.
        let r = session.s_selection(OUTPUT, crop, none, Rect::new(201, 0, 300, 200));
        assert_eq!(r.unwrap(), Rect::new(200, 0, 300, 200));
        assert_eq!(
            session.g_selection(OUTPUT, crop).unwrap(),
            Rect::new(0, 0, MIN_ENC_PIC_WIDTH, MIN_ENC_PIC_HEIGHT)
        );

        let r = Rect::new(0, 0, 320, 240);
        assert!(session.s_selection(OUTPUT, SelectionTarget::CropDefault, both, r).is_err());
        assert!(session.s_selection(CAPTURE, crop, both, r).is_err());
    }

    #[test]
    fn frame_rate() {
        let (_, mut session) = setup();

        let tpf = Timeperframe { numerator: 1, denominator: 60 };
        assert_eq!(session.s_parm(OUTPUT, tpf).unwrap(), tpf);
        assert_eq!(session.g_parm(OUTPUT).unwrap(), tpf);

        let invalid = Timeperframe { numerator: 0, denominator: 25 };
        assert_eq!(session.s_parm(OUTPUT, invalid).unwrap(), tpf);
        assert!(session.s_parm(CAPTURE, tpf).is_err());
    }

    #[test]
    fn buffer_negotiation() {
        let (_, mut session) = setup();
        let sizeimage = session.g_fmt(OUTPUT).planes[0].sizeimage;

        let negotiated = session.queue_setup(OUTPUT, 1, &[]).unwrap();
        assert_eq!(negotiated, QueueSetup { num_buffers: 1, sizes: vec![sizeimage] });
        assert!(session.queue_setup(OUTPUT, 4, &[sizeimage - 1]).is_err());
        assert!(session.queue_setup(OUTPUT, 4, &[sizeimage, sizeimage]).is_err());
        assert!(session.queue_setup(OUTPUT, 4, &[sizeimage + 64]).is_ok());

        start(&mut session);
        assert_eq!(session.get_control(ControlId::MinBuffersForOutput), 2);
        assert_eq!(session.queue_setup(OUTPUT, 1, &[]).unwrap().num_buffers, 2);
        assert_eq!(session.queue_setup(CAPTURE, 1, &[]).unwrap().num_buffers, 1);
    }

    #[test]
    fn encodes_frames() {
        let (device, mut session) = setup();
        start(&mut session);

        queue_frames(&device, &mut session, 0, 3);
        assert_eq!(session.process_completions().unwrap(), 3);

        let done = session.queues_mut().take_done(CAPTURE);
        assert_eq!(done.len(), 3);
        for (i, (buf, state)) in done.iter().enumerate() {
            assert_eq!(*state, BufferState::Done);
            assert_eq!(buf.sequence, i as u32);
            assert_eq!(buf.timestamp, 1000 * i as u64);
            assert_eq!(buf.flags.frame_type_count(), 1);
            assert!(buf.payload(0) > 0);
            assert!(buf.ts_output.is_some());
            assert!(buf.hw_time > 0);
        }
        assert!(done[0].0.flags.contains(BufferFlags::KEYFRAME));
        assert!(done[1].0.flags.contains(BufferFlags::PFRAME));
        assert!(done[2].0.flags.contains(BufferFlags::PFRAME));

        let sources = session.queues_mut().take_done(OUTPUT);
        assert_eq!(sources.len(), 3);
        assert!(sources.iter().all(|(_, state)| *state == BufferState::Done));

        let counters = session.counters();
        assert_eq!((counters.processed, counters.error, counters.sequence), (3, 0, 3));
        assert_eq!(session.performance().frames, 3);
        assert_eq!(session.average_qp(), done[2].0.average_qp);
        assert_eq!(session.get_control(ControlId::AverageQp), done[2].0.average_qp as i32);

        let handle = session.instance().unwrap();
        assert_eq!(device.lock().unwrap().finished_jobs(), 3);
        assert_eq!(device.lock().unwrap().submitted(handle).len(), 3);
    }

    #[test]
    fn syncs_only_the_bitstream() {
        let (device, mut session) = setup();
        start(&mut session);

        queue_frames(&device, &mut session, 0, 2);
        session.process_completions().unwrap();

        let done = session.queues_mut().take_done(CAPTURE);
        let expected: Vec<_> =
            done.iter().map(|(buf, _)| (buf.plane_daddr(0), buf.payload(0))).collect();
        assert!(done[0].0.payload(0) < done[0].0.plane_size(0));
        assert_eq!(device.lock().unwrap().cpu_syncs(), expected.as_slice());
    }

    #[test]
    fn reports_b_frames() {
        let mut vpu = DummyVpu::new();
        vpu.set_pic_types(vec![PicType::I, PicType::B, PicType::P]);
        let (device, mut session) = setup_with(vpu);
        start(&mut session);

        queue_frames(&device, &mut session, 0, 3);
        assert_eq!(session.process_completions().unwrap(), 3);

        let done = session.queues_mut().take_done(CAPTURE);
        assert_eq!(done.len(), 3);
        let expected = [BufferFlags::KEYFRAME, BufferFlags::BFRAME, BufferFlags::PFRAME];
        for ((buf, state), flag) in done.iter().zip(expected) {
            assert_eq!(*state, BufferState::Done);
            assert!(buf.flags.contains(flag));
            assert_eq!(buf.flags.frame_type_count(), 1);
        }
    }

    #[test]
    fn encodes_hevc_1080p() {
        let mut vpu = DummyVpu::new();
        vpu.set_initial_info(InitialInfo {
            min_frame_buffer_count: 3,
            min_src_frame_count: 4,
            req_mv_buffer_count: 5,
        });
        let (device, mut session) = setup_with(vpu);

        let src = PixFormat {
            fourcc: Fourcc::from(b"YU12"),
            width: 1920,
            height: 1080,
            ..Default::default()
        };
        session.s_fmt(OUTPUT, &src).unwrap();
        let dst = PixFormat { fourcc: Fourcc::from(b"HEVC"), ..src };
        session.s_fmt(CAPTURE, &dst).unwrap();
        session.set_control(ControlId::GopSize, 30).unwrap();
        session.set_control(ControlId::Bitrate, 4_000_000).unwrap();
        start(&mut session);

        assert_eq!(session.get_control(ControlId::MinBuffersForOutput), 4);
        assert_eq!(session.queue_setup(OUTPUT, 1, &[]).unwrap().num_buffers, 4);

        let handle = session.instance().unwrap();
        {
            let vpu = device.lock().unwrap();
            let open = vpu.open_params(handle).unwrap();
            assert_eq!((open.pic_width, open.pic_height), (1920, 1080));
            assert_eq!(open.codec_param.bitrate, 4_000_000);
            assert_eq!(open.codec_param.intra_period, 30);
            assert_eq!(open.codec_param.idr_period, 0);
            assert_eq!(vpu.registered_frame_buffers(handle), 3);
            assert_eq!(vpu.registered_aux_buffers(handle, AuxBufferType::MvCol), 5);
            assert_eq!(vpu.registered_aux_buffers(handle, AuxBufferType::SubSample), 3);
        }

        queue_frames(&device, &mut session, 0, 4);
        assert_eq!(session.process_completions().unwrap(), 4);

        let done = session.queues_mut().take_done(CAPTURE);
        let sequences: Vec<_> = done.iter().map(|(buf, _)| buf.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3]);
        assert!(done.iter().all(|(_, state)| *state == BufferState::Done));
        assert!(done.iter().all(|(buf, _)| buf.flags.frame_type_count() == 1));
        assert!(done[0].0.flags.contains(BufferFlags::KEYFRAME));
        assert!(done[1..].iter().all(|(buf, _)| !buf.flags.contains(BufferFlags::KEYFRAME)));
    }

    #[test]
    fn rgb_source_gets_color_conversion() {
        let (device, mut session) = setup();
        let src = PixFormat {
            fourcc: Fourcc::from(b"RGB3"),
            width: 416,
            height: 240,
            colorimetry: Colorimetry {
                colorspace: Colorspace::Rec709,
                ycbcr_enc: YcbcrEncoding::Rec709,
                quantization: Quantization::LimRange,
                ..Default::default()
            },
            ..Default::default()
        };
        session.s_fmt(OUTPUT, &src).unwrap();
        start(&mut session);

        queue_frames(&device, &mut session, 0, 1);
        assert_eq!(session.process_completions().unwrap(), 1);

        let params = submitted(&device, &session);
        assert_eq!(params[0].csc.coef_ry, 0x05e);
        assert_eq!((params[0].csc.offset_y, params[0].csc.offset_cb), (0x10, 0x80));
        assert_eq!(session.queues_mut().take_done(CAPTURE)[0].1, BufferState::Done);
    }

    #[test]
    fn yuv_source_skips_color_conversion() {
        let (device, mut session) = setup();
        let src = PixFormat {
            fourcc: Fourcc::from(b"NV12"),
            width: 416,
            height: 240,
            colorimetry: Colorimetry {
                colorspace: Colorspace::Rec709,
                ycbcr_enc: YcbcrEncoding::Rec709,
                quantization: Quantization::LimRange,
                ..Default::default()
            },
            ..Default::default()
        };
        session.s_fmt(OUTPUT, &src).unwrap();
        start(&mut session);

        queue_frames(&device, &mut session, 0, 1);
        assert_eq!(submitted(&device, &session)[0].csc, CscParams::default());
    }

    #[test]
    fn sequence_change_before_frame() {
        let (device, mut session) = setup();
        start(&mut session);
        assert_eq!(device.lock().unwrap().seq_inits(), 1);

        device.lock().unwrap().trigger_seq_change();
        queue_frames(&device, &mut session, 0, 1);
        assert_eq!(session.process_completions().unwrap(), 1);

        assert_eq!(device.lock().unwrap().seq_inits(), 2);
        let done = session.queues_mut().take_done(CAPTURE);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].1, BufferState::Done);
    }

    #[test]
    fn sequence_change_timeout_still_encodes() {
        let (device, mut session) = setup();
        start(&mut session);
        {
            let mut vpu = device.lock().unwrap();
            vpu.trigger_seq_change();
            vpu.seq_init_timeout(true);
        }

        queue_frames(&device, &mut session, 0, 1);
        assert_eq!(session.process_completions().unwrap(), 1);

        assert_eq!(device.lock().unwrap().seq_inits(), 1);
        assert_eq!(submitted(&device, &session).len(), 1);
        let done = session.queues_mut().take_done(CAPTURE);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].1, BufferState::Done);
        assert_eq!(session.state(), InstanceState::PicRun);
    }

    #[test]
    fn drain_returns_last_buffer() {
        let (device, mut session) = setup();
        start(&mut session);

        queue_frames(&device, &mut session, 0, 1);
        let spare = buffers(&device, &session.g_fmt(CAPTURE), 1..2);
        session.queue_buffer(CAPTURE, spare[0].clone()).unwrap();
        assert_eq!(session.process_completions().unwrap(), 1);
        assert!(!session.is_eos());

        session.encoder_cmd(EncoderCommand::Stop).unwrap();
        assert_eq!(session.process_completions().unwrap(), 1);

        let done = session.queues_mut().take_done(CAPTURE);
        assert_eq!(done.len(), 2);
        let (last, state) = &done[1];
        assert_eq!(*state, BufferState::Done);
        assert_eq!(last.index, 1);
        assert!(last.flags.contains(BufferFlags::LAST));
        assert_eq!(last.payload(0), 0);

        assert!(session.is_eos());
        assert_eq!(session.state(), InstanceState::PicRun);
        assert!(!session.queues().src_buffered());
        assert!(submitted(&device, &session)[1].src_end);
    }

    #[test]
    fn encoder_cmd_needs_both_queues() {
        let (_, mut session) = setup();
        session.stream_on(OUTPUT).unwrap();

        session.encoder_cmd(EncoderCommand::Stop).unwrap();
        assert_eq!(session.state(), InstanceState::None);
        assert!(!session.queues().src_buffered());
    }

    #[test]
    fn submit_failure_errors_buffers() {
        let (device, mut session) = setup();
        start(&mut session);
        device.lock().unwrap().fail_submit(true);

        queue_frames(&device, &mut session, 0, 1);
        assert_eq!(session.state(), InstanceState::Stop);

        let dst = session.queues_mut().take_done(CAPTURE);
        assert_eq!(dst.len(), 1);
        assert_eq!(dst[0].1, BufferState::Error);
        assert_eq!(dst[0].0.sequence, 0);

        let src = session.queues_mut().take_done(OUTPUT);
        assert_eq!(src.len(), 1);
        assert_eq!(src[0].1, BufferState::Error);

        let counters = session.counters();
        assert_eq!((counters.sequence, counters.processed, counters.error), (1, 1, 1));
    }

    #[test]
    fn fatal_error_stops_session() {
        let (device, mut session) = setup();
        start(&mut session);
        device.lock().unwrap().fail_next_job();

        queue_frames(&device, &mut session, 0, 1);
        let extra = buffers(&device, &session.g_fmt(OUTPUT), 1..2);
        session.queue_buffer(OUTPUT, extra[0].clone()).unwrap();
        assert_eq!(session.process_completions().unwrap(), 1);

        assert_eq!(session.state(), InstanceState::Stop);
        assert!(session.is_eos());

        let src = session.queues_mut().take_done(OUTPUT);
        let dst = session.queues_mut().take_done(CAPTURE);
        assert_eq!(src.len(), 2);
        assert_eq!(dst.len(), 1);
        assert!(src.iter().chain(dst.iter()).all(|(_, state)| *state == BufferState::Error));
        assert_eq!(device.lock().unwrap().finished_jobs(), 1);
    }

    #[test]
    fn fatal_error_latches_queues_until_stream_off() {
        let (device, mut session) = setup();
        start(&mut session);
        device.lock().unwrap().fail_next_job();

        queue_frames(&device, &mut session, 0, 1);
        assert_eq!(session.process_completions().unwrap(), 1);
        session.queues_mut().take_done(OUTPUT);
        session.queues_mut().take_done(CAPTURE);

        let src = buffers(&device, &session.g_fmt(OUTPUT), 5..6);
        let dst = buffers(&device, &session.g_fmt(CAPTURE), 5..6);
        assert!(matches!(
            session.queue_buffer(OUTPUT, src[0].clone()),
            Err(SessionError::Queue(QueueError::Errored { dir: QueueDirection::Output }))
        ));
        assert!(matches!(
            session.queue_buffer(CAPTURE, dst[0].clone()),
            Err(SessionError::Queue(QueueError::Errored { dir: QueueDirection::Capture }))
        ));
        assert_eq!(session.process_completions().unwrap(), 0);
        assert_eq!(submitted(&device, &session).len(), 1);
        assert!(session.queues_mut().take_done(CAPTURE).is_empty());

        session.stream_off(OUTPUT).unwrap();
        session.stream_off(CAPTURE).unwrap();
        start(&mut session);

        session.queue_buffer(OUTPUT, src[0].clone()).unwrap();
        session.queue_buffer(CAPTURE, dst[0].clone()).unwrap();
        assert_eq!(session.process_completions().unwrap(), 1);
        let done = session.queues_mut().take_done(CAPTURE);
        assert_eq!(done.len(), 1);
        assert_eq!((done[0].0.index, done[0].1), (5, BufferState::Done));
    }

    #[test]
    fn failed_frame_forces_idr() {
        let (device, mut session) = setup();
        start(&mut session);
        device.lock().unwrap().set_encoding_success(false);

        queue_frames(&device, &mut session, 0, 1);
        session.process_completions().unwrap();
        let dst = session.queues_mut().take_done(CAPTURE);
        assert_eq!(dst[0].1, BufferState::Error);
        assert_eq!(session.queues_mut().take_done(OUTPUT)[0].1, BufferState::Error);
        assert_eq!(session.counters().error, 1);

        device.lock().unwrap().set_encoding_success(true);
        queue_frames(&device, &mut session, 1, 1);
        session.process_completions().unwrap();

        let params = submitted(&device, &session);
        assert!(!params[0].force_pic_type_enable);
        assert!(params[1].force_pic_type_enable);
        assert_eq!(params[1].force_pic_type, ForcePicType::Idr);

        let dst = session.queues_mut().take_done(CAPTURE);
        assert_eq!(dst[0].1, BufferState::Done);
        assert!(dst[0].0.flags.contains(BufferFlags::KEYFRAME));
    }

    #[test]
    fn forced_qp_and_key_frame() {
        let (device, mut session) = setup();
        session.set_control(ControlId::FrameRcEnable, 0).unwrap();
        session.set_control(ControlId::HevcIFrameQp, 20).unwrap();
        session.set_control(ControlId::HevcPFrameQp, 25).unwrap();
        session.set_control(ControlId::HevcBFrameQp, 28).unwrap();
        start(&mut session);

        queue_frames(&device, &mut session, 0, 1);
        session.set_control(ControlId::ForceKeyFrame, 0).unwrap();
        queue_frames(&device, &mut session, 1, 1);
        assert!(!session.controls().force_key_frame);
        session.process_completions().unwrap();

        let params = submitted(&device, &session);
        assert_eq!(params.len(), 2);
        for param in &params {
            assert!(param.force_pic_qp_enable);
            assert_eq!(
                (param.force_pic_qp_i, param.force_pic_qp_p, param.force_pic_qp_b),
                (20, 25, 28)
            );
        }
        assert!(!params[0].force_pic_type_enable);
        assert!(params[1].force_pic_type_enable);
        assert_eq!(params[1].force_pic_type, ForcePicType::Idr);
        assert_eq!(session.average_qp(), 20);
    }

    #[test]
    fn roi_map_reaches_hardware() {
        let (device, mut session) = setup();
        session.set_control(ControlId::RoiMode, 1).unwrap();
        start(&mut session);

        let roi = roi_grid(CodecStd::HevcEnc, 416, 240);
        let map: Vec<i32> = (0..roi.num_ctu as i32).map(|i| i % 11 - 5).collect();
        session.set_roi_map(&map).unwrap();
        assert!(session.set_roi_map(&[100]).is_err());

        queue_frames(&device, &mut session, 0, 1);

        let params = submitted(&device, &session);
        assert!(params[0].custom_roi_map_enable);
        let vpu = device.lock().unwrap();
        let hw_map = vpu.read_dma(params[0].custom_map_addr).unwrap();
        assert_eq!(hw_map.len(), roi.custom_map_size);
        assert_eq!(raster_from_map(hw_map, &roi), map);
    }

    #[test]
    fn mirror_and_rotation_commands() {
        let (device, mut session) = setup();
        session.set_control(ControlId::HFlip, 1).unwrap();
        session.set_control(ControlId::Rotate, 90).unwrap();
        start(&mut session);

        let handle = session.instance().unwrap();
        let direction = session.controls().mirror_direction;
        assert_ne!(direction, 0);
        assert_eq!(
            device.lock().unwrap().commands(handle),
            &[
                EncCommand::EnableMirroring,
                EncCommand::SetMirrorDirection(direction),
                EncCommand::EnableRotation,
                EncCommand::SetRotationAngle(90),
            ]
        );
    }

    #[test]
    fn open_failure_rolls_back() {
        let mut vpu = DummyVpu::new();
        vpu.fail_open(true);
        let (device, mut session) = setup_with(vpu);

        session.stream_on(OUTPUT).unwrap();
        let err = session.stream_on(CAPTURE).unwrap_err();
        assert!(matches!(err, SessionError::BringUp { stage: BringUpStage::CreateInstance, .. }));

        assert_eq!(session.state(), InstanceState::None);
        let vpu = device.lock().unwrap();
        assert_eq!((vpu.live_allocations(), vpu.power_refs()), (0, 0));
    }

    #[test]
    fn seq_init_timeout_rolls_back() {
        let mut vpu = DummyVpu::new();
        vpu.seq_init_timeout(true);
        let (device, mut session) = setup_with(vpu);

        session.stream_on(OUTPUT).unwrap();
        let dst = buffers(&device, &session.g_fmt(CAPTURE), 0..1);
        session.queue_buffer(CAPTURE, dst[0].clone()).unwrap();

        let err = session.stream_on(CAPTURE).unwrap_err();
        assert!(matches!(
            err,
            SessionError::BringUp {
                stage: BringUpStage::InitializeInstance,
                source: HwError::Timeout(_),
            }
        ));
        assert_eq!(session.state(), InstanceState::None);
        assert!(!session.queues().is_streaming(CAPTURE));

        let returned = session.queues_mut().take_done(CAPTURE);
        assert_eq!(returned.len(), 1);
        assert_eq!(returned[0].1, BufferState::Queued);

        let vpu = device.lock().unwrap();
        assert_eq!(vpu.live_allocations(), 1);
        assert_eq!((vpu.power_refs(), vpu.open_instances()), (0, 0));
    }

    #[test]
    fn teardown_releases_everything() {
        let (device, mut session) = setup();
        session.set_control(ControlId::RoiMode, 1).unwrap();
        start(&mut session);
        assert_eq!(device.lock().unwrap().power_refs(), 1);
        assert_eq!(device.lock().unwrap().open_instances(), 1);

        queue_frames(&device, &mut session, 0, 2);
        session.process_completions().unwrap();

        session.stream_off(OUTPUT).unwrap();
        assert_eq!(session.state(), InstanceState::Stop);
        session.stream_off(CAPTURE).unwrap();
        assert_eq!(session.state(), InstanceState::None);
        assert_eq!(session.instance(), None);

        let vpu = device.lock().unwrap();
        // Only the client buffers are left.
        assert_eq!(vpu.live_allocations(), 4);
        assert_eq!((vpu.power_refs(), vpu.open_instances()), (0, 0));
    }

    #[test]
    fn stream_off_handles_signalled_completion() {
        let (device, mut session) = setup();
        start(&mut session);

        queue_frames(&device, &mut session, 0, 1);
        session.stream_off(CAPTURE).unwrap();

        assert_eq!(session.state(), InstanceState::Stop);
        let dst = session.queues_mut().take_done(CAPTURE);
        assert_eq!(dst.len(), 1);
        assert_eq!(dst[0].1, BufferState::Done);
        assert_eq!(device.lock().unwrap().finished_jobs(), 1);
        assert_eq!(session.queues_mut().take_done(OUTPUT)[0].1, BufferState::Done);

        session.stream_off(OUTPUT).unwrap();
        assert_eq!(session.state(), InstanceState::None);
        assert_eq!(device.lock().unwrap().open_instances(), 0);
    }

    #[test]
    fn stream_off_abandons_job_in_flight() {
        let (device, mut session) = setup();
        start(&mut session);

        queue_frames(&device, &mut session, 0, 1);
        // Lose the completion, the job never finishes.
        session.notifier().drain();
        session.stream_off(OUTPUT).unwrap();

        let src = session.queues_mut().take_done(OUTPUT);
        let dst = session.queues_mut().take_done(CAPTURE);
        assert_eq!((src.len(), dst.len()), (1, 1));
        assert_eq!((src[0].1, dst[0].1), (BufferState::Error, BufferState::Error));
        assert_eq!(device.lock().unwrap().finished_jobs(), 1);
        assert_eq!(session.state(), InstanceState::Stop);
    }

    #[test]
    fn stale_completion_ignored_after_restart() {
        let (device, mut session) = setup();
        start(&mut session);

        queue_frames(&device, &mut session, 0, 1);
        // Taken by a completion thread that has not locked the session yet.
        let stale = session.notifier().drain();
        assert_eq!(stale.len(), 1);

        session.stream_off(OUTPUT).unwrap();
        session.stream_off(CAPTURE).unwrap();
        session.queues_mut().take_done(OUTPUT);
        session.queues_mut().take_done(CAPTURE);
        start(&mut session);
        queue_frames(&device, &mut session, 1, 1);

        let finished = device.lock().unwrap().finished_jobs();
        session.handle_job_event(stale[0]).unwrap();
        assert!(session.queues_mut().take_done(CAPTURE).is_empty());
        assert_eq!(device.lock().unwrap().finished_jobs(), finished);

        assert_eq!(session.process_completions().unwrap(), 1);
        let done = session.queues_mut().take_done(CAPTURE);
        assert_eq!(done.len(), 1);
        assert_eq!((done[0].0.index, done[0].1), (1, BufferState::Done));
    }

    #[test]
    fn completion_failure_does_not_stop_processing() {
        let (device, mut session) = setup();
        start(&mut session);

        queue_frames(&device, &mut session, 0, 2);
        device.lock().unwrap().fail_seq_change(true);
        session.notifier().notify(JobEvent::Completed);

        // Scheduling the second frame fails after the first event.
        assert_eq!(session.process_completions().unwrap(), 2);
        assert!(session.notifier().is_empty());
        let done = session.queues_mut().take_done(CAPTURE);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].1, BufferState::Done);

        device.lock().unwrap().fail_seq_change(false);
        let dst = buffers(&device, &session.g_fmt(CAPTURE), 2..3);
        session.queue_buffer(CAPTURE, dst[0].clone()).unwrap();
        assert_eq!(session.process_completions().unwrap(), 1);
        assert_eq!(session.queues_mut().take_done(CAPTURE).len(), 1);
    }

    #[test]
    fn drop_destroys_instance() {
        let (device, mut session) = setup();
        start(&mut session);
        drop(session);

        let vpu = device.lock().unwrap();
        assert_eq!((vpu.live_allocations(), vpu.power_refs(), vpu.open_instances()), (0, 0, 0));
    }

    #[test]
    fn worker_delivers_completions() {
        let (device, mut session) = setup();
        start(&mut session);
        let session = Arc::new(Mutex::new(session));
        let _worker = EncoderSession::spawn_completion_worker(&session).unwrap();

        queue_frames(&device, &mut session.lock().unwrap(), 0, 2);

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut done = Vec::new();
        while done.len() < 2 && Instant::now() < deadline {
            done.extend(session.lock().unwrap().queues_mut().take_done(CAPTURE));
            std::thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(done.len(), 2);
        assert!(done.iter().all(|(_, state)| *state == BufferState::Done));
        assert_eq!(session.lock().unwrap().counters().processed, 2);
    }
}
