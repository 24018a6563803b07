// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Input/output buffer queues of an encoding session.
//!
//! A session consumes raw frames from its `Output` queue and fills bitstream buffers from its
//! `Capture` queue, following the V4L2 mem-to-mem naming. Buffers stay in the ready list of
//! their queue until the session returns them with [`BufferQueue::buf_done`].

use std::collections::VecDeque;
use std::ops::BitOr;
use std::ops::BitOrAssign;
use std::time::Instant;

use thiserror::Error;

use crate::hw::DmaBuffer;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("buffer {index} is already queued on the {dir:?} queue")]
    DuplicateIndex { dir: QueueDirection, index: u32 },
    #[error("the {dir:?} queue is in error, it must be stopped first")]
    Errored { dir: QueueDirection },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueDirection {
    /// Raw frames going into the encoder.
    Output,
    /// Encoded bitstream coming out of the encoder.
    Capture,
}

impl QueueDirection {
    pub fn peer(self) -> Self {
        match self {
            QueueDirection::Output => QueueDirection::Capture,
            QueueDirection::Capture => QueueDirection::Output,
        }
    }
}

/// State in which a buffer is handed back to its owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferState {
    /// Returned unprocessed, e.g. after a failed stream start.
    Queued,
    Done,
    Error,
}

#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BufferFlags(pub u32);

impl BufferFlags {
    pub const KEYFRAME: Self = Self(0x0008);
    pub const PFRAME: Self = Self(0x0010);
    pub const BFRAME: Self = Self(0x0020);
    pub const TIMECODE: Self = Self(0x0100);
    pub const LAST: Self = Self(0x0010_0000);

    /// Flags carried over from a source buffer to its bitstream.
    const METADATA: Self = Self(Self::TIMECODE.0);
    pub const FRAME_TYPE: Self = Self(Self::KEYFRAME.0 | Self::PFRAME.0 | Self::BFRAME.0);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Number of frame type flags set.
    pub fn frame_type_count(self) -> u32 {
        (self.0 & Self::FRAME_TYPE.0).count_ones()
    }
}

impl BitOr for BufferFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for BufferFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferPlane {
    pub mem: DmaBuffer,
    pub bytesused: usize,
}

/// A buffer queued to one of the session queues, with the bookkeeping the encoder attaches
/// to it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VpuBuffer {
    pub index: u32,
    pub planes: Vec<BufferPlane>,
    pub sequence: u32,
    /// Client timestamp, in nanoseconds.
    pub timestamp: u64,
    pub flags: BufferFlags,

    /// Handed to the hardware.
    pub consumed: bool,
    /// Referenced by the hardware as a source of the current job.
    pub used: bool,

    pub force_key_frame: bool,
    pub force_frame_qp: bool,
    pub force_i_frame_qp: u32,
    pub force_p_frame_qp: u32,
    pub force_b_frame_qp: u32,

    pub ts_input: Option<Instant>,
    pub ts_start: Option<Instant>,
    pub ts_finish: Option<Instant>,
    pub ts_output: Option<Instant>,
    /// Hardware processing time, in nanoseconds.
    pub hw_time: u64,
    pub average_qp: u32,

    /// Delta-QP map used to encode this frame, in the hardware layout.
    pub custom_map: Option<DmaBuffer>,
}

impl VpuBuffer {
    pub fn new(index: u32, planes: Vec<BufferPlane>) -> Self {
        Self { index, planes, ..Default::default() }
    }

    /// Device address of the first plane.
    pub fn daddr(&self) -> u64 {
        self.planes.first().map(|p| p.mem.daddr).unwrap_or(0)
    }

    pub fn plane_daddr(&self, plane: usize) -> u64 {
        self.planes.get(plane).map(|p| p.mem.daddr).unwrap_or(0)
    }

    pub fn plane_size(&self, plane: usize) -> usize {
        self.planes.get(plane).map(|p| p.mem.size).unwrap_or(0)
    }

    pub fn set_payload(&mut self, plane: usize, bytesused: usize) {
        if let Some(p) = self.planes.get_mut(plane) {
            p.bytesused = bytesused.min(p.mem.size);
        }
    }

    pub fn payload(&self, plane: usize) -> usize {
        self.planes.get(plane).map(|p| p.bytesused).unwrap_or(0)
    }
}

/// Copies the timestamp and timecode of a source frame to the bitstream encoded from it.
pub fn copy_metadata(src: &VpuBuffer, dst: &mut VpuBuffer) {
    dst.timestamp = src.timestamp;
    dst.flags.remove(BufferFlags::METADATA);
    dst.flags |= BufferFlags(src.flags.0 & BufferFlags::METADATA.0);
}

/// A double queue of buffers shared between the client and the encoder.
///
/// Positions returned by the lookup methods index the ready list of the queue and stay
/// valid until a buffer of that queue is removed.
pub trait BufferQueue: Send {
    fn is_streaming(&self, dir: QueueDirection) -> bool;
    /// Stopping a queue also clears its error state.
    fn set_streaming(&mut self, dir: QueueDirection, streaming: bool);

    /// Whether `dir` refuses buffers until it is stopped, see [`BufferQueue::queue_error`].
    fn is_errored(&self, dir: QueueDirection) -> bool;
    fn set_errored(&mut self, dir: QueueDirection);

    /// Appends `buf` to the ready list of `dir`. Fails while the queue is errored.
    fn push(&mut self, dir: QueueDirection, buf: VpuBuffer) -> QueueResult<()>;

    /// Position of the oldest ready buffer not yet handed to the hardware.
    fn next_unconsumed(&self, dir: QueueDirection) -> Option<usize>;
    fn position_by_index(&self, dir: QueueDirection, index: u32) -> Option<usize>;
    fn position_by_addr(&self, dir: QueueDirection, daddr: u64) -> Option<usize>;
    fn get(&self, dir: QueueDirection, pos: usize) -> Option<&VpuBuffer>;
    fn get_mut(&mut self, dir: QueueDirection, pos: usize) -> Option<&mut VpuBuffer>;

    fn remove_at(&mut self, dir: QueueDirection, pos: usize) -> Option<VpuBuffer>;
    fn remove_head(&mut self, dir: QueueDirection) -> Option<VpuBuffer>;

    /// Hands `buf` back to the client.
    fn buf_done(&mut self, dir: QueueDirection, buf: VpuBuffer, state: BufferState);

    /// Lets jobs run without any ready source buffer, to drain the encoder.
    fn set_src_buffered(&mut self, buffered: bool);
    fn src_buffered(&self) -> bool;

    fn num_ready(&self, dir: QueueDirection) -> usize;

    /// Returns every ready buffer of `dir` in `state`.
    fn return_buffers(&mut self, dir: QueueDirection, state: BufferState) {
        while let Some(buf) = self.remove_head(dir) {
            self.buf_done(dir, buf, state);
        }
    }

    /// Fails every ready buffer of `dir` and refuses new ones until the queue is stopped.
    fn queue_error(&mut self, dir: QueueDirection) {
        self.set_errored(dir);
        self.return_buffers(dir, BufferState::Error);
    }
}

#[derive(Default)]
struct Queue {
    ready: VecDeque<VpuBuffer>,
    done: Vec<(VpuBuffer, BufferState)>,
    streaming: bool,
    errored: bool,
}

/// In-memory [`BufferQueue`]. Buffers returned by the session are kept until the client
/// collects them with [`M2mQueues::take_done`].
#[derive(Default)]
pub struct M2mQueues {
    output: Queue,
    capture: Queue,
    src_buffered: bool,
}

impl M2mQueues {
    pub fn new() -> Self {
        Default::default()
    }

    fn queue(&self, dir: QueueDirection) -> &Queue {
        match dir {
            QueueDirection::Output => &self.output,
            QueueDirection::Capture => &self.capture,
        }
    }

    fn queue_mut(&mut self, dir: QueueDirection) -> &mut Queue {
        match dir {
            QueueDirection::Output => &mut self.output,
            QueueDirection::Capture => &mut self.capture,
        }
    }

    /// Drains the buffers returned on `dir`, oldest first.
    pub fn take_done(&mut self, dir: QueueDirection) -> Vec<(VpuBuffer, BufferState)> {
        std::mem::take(&mut self.queue_mut(dir).done)
    }
}

impl BufferQueue for M2mQueues {
    fn is_streaming(&self, dir: QueueDirection) -> bool {
        self.queue(dir).streaming
    }

    fn set_streaming(&mut self, dir: QueueDirection, streaming: bool) {
        let queue = self.queue_mut(dir);
        queue.streaming = streaming;
        if !streaming {
            queue.errored = false;
        }
    }

    fn is_errored(&self, dir: QueueDirection) -> bool {
        self.queue(dir).errored
    }

    fn set_errored(&mut self, dir: QueueDirection) {
        log::debug!("queue dir={:?} in error", dir);
        self.queue_mut(dir).errored = true;
    }

    fn push(&mut self, dir: QueueDirection, buf: VpuBuffer) -> QueueResult<()> {
        let queue = self.queue_mut(dir);
        if queue.errored {
            return Err(QueueError::Errored { dir });
        }
        if queue.ready.iter().any(|b| b.index == buf.index) {
            return Err(QueueError::DuplicateIndex { dir, index: buf.index });
        }

        log::trace!("queued buffer index={} dir={:?}", buf.index, dir);
        queue.ready.push_back(buf);
        Ok(())
    }

    fn next_unconsumed(&self, dir: QueueDirection) -> Option<usize> {
        self.queue(dir).ready.iter().position(|b| !b.consumed)
    }

    fn position_by_index(&self, dir: QueueDirection, index: u32) -> Option<usize> {
        self.queue(dir).ready.iter().position(|b| b.index == index)
    }

    fn position_by_addr(&self, dir: QueueDirection, daddr: u64) -> Option<usize> {
        self.queue(dir).ready.iter().position(|b| b.daddr() == daddr)
    }

    fn get(&self, dir: QueueDirection, pos: usize) -> Option<&VpuBuffer> {
        self.queue(dir).ready.get(pos)
    }

    fn get_mut(&mut self, dir: QueueDirection, pos: usize) -> Option<&mut VpuBuffer> {
        self.queue_mut(dir).ready.get_mut(pos)
    }

    fn remove_at(&mut self, dir: QueueDirection, pos: usize) -> Option<VpuBuffer> {
        self.queue_mut(dir).ready.remove(pos)
    }

    fn remove_head(&mut self, dir: QueueDirection) -> Option<VpuBuffer> {
        self.queue_mut(dir).ready.pop_front()
    }

    fn buf_done(&mut self, dir: QueueDirection, buf: VpuBuffer, state: BufferState) {
        log::trace!("buffer done index={} dir={:?} state={:?}", buf.index, dir, state);
        self.queue_mut(dir).done.push((buf, state));
    }

    fn set_src_buffered(&mut self, buffered: bool) {
        self.src_buffered = buffered;
    }

    fn src_buffered(&self) -> bool {
        self.src_buffered
    }

    fn num_ready(&self, dir: QueueDirection) -> usize {
        self.queue(dir).ready.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(index: u32, daddr: u64) -> VpuBuffer {
        VpuBuffer::new(
            index,
            vec![BufferPlane { mem: DmaBuffer { daddr, size: 4096 }, bytesused: 0 }],
        )
    }

    #[test]
    fn lookups() {
        let mut queues = M2mQueues::new();
        queues.push(QueueDirection::Capture, buffer(0, 0x1000)).unwrap();
        queues.push(QueueDirection::Capture, buffer(1, 0x2000)).unwrap();

        assert_eq!(queues.position_by_index(QueueDirection::Capture, 1), Some(1));
        assert_eq!(queues.position_by_addr(QueueDirection::Capture, 0x1000), Some(0));
        assert_eq!(queues.position_by_addr(QueueDirection::Capture, 0x3000), None);
        assert_eq!(queues.num_ready(QueueDirection::Output), 0);

        queues.get_mut(QueueDirection::Capture, 0).unwrap().consumed = true;
        assert_eq!(queues.next_unconsumed(QueueDirection::Capture), Some(1));
    }

    #[test]
    fn duplicate_index() {
        let mut queues = M2mQueues::new();
        queues.push(QueueDirection::Output, buffer(3, 0x1000)).unwrap();

        assert!(matches!(
            queues.push(QueueDirection::Output, buffer(3, 0x2000)),
            Err(QueueError::DuplicateIndex { index: 3, .. })
        ));
    }

    #[test]
    fn queue_error_returns_all() {
        let mut queues = M2mQueues::new();
        for i in 0..3 {
            queues.push(QueueDirection::Output, buffer(i, 0x1000 * (i as u64 + 1))).unwrap();
        }

        queues.queue_error(QueueDirection::Output);

        let done = queues.take_done(QueueDirection::Output);
        assert_eq!(done.len(), 3);
        assert!(done.iter().all(|(_, state)| *state == BufferState::Error));
        assert_eq!(done[0].0.index, 0);
        assert_eq!(queues.num_ready(QueueDirection::Output), 0);
    }

    #[test]
    fn errored_queue_refuses_buffers_until_stopped() {
        let mut queues = M2mQueues::new();
        queues.set_streaming(QueueDirection::Capture, true);
        queues.queue_error(QueueDirection::Capture);

        assert!(queues.is_errored(QueueDirection::Capture));
        assert!(!queues.is_errored(QueueDirection::Output));
        assert!(matches!(
            queues.push(QueueDirection::Capture, buffer(0, 0x1000)),
            Err(QueueError::Errored { dir: QueueDirection::Capture })
        ));
        assert_eq!(queues.num_ready(QueueDirection::Capture), 0);

        queues.set_streaming(QueueDirection::Capture, false);
        assert!(!queues.is_errored(QueueDirection::Capture));
        queues.push(QueueDirection::Capture, buffer(0, 0x1000)).unwrap();
    }

    #[test]
    fn metadata_copy() {
        let mut src = buffer(0, 0x1000);
        src.timestamp = 42;
        src.flags = BufferFlags::TIMECODE | BufferFlags::KEYFRAME;
        let mut dst = buffer(1, 0x2000);
        dst.flags = BufferFlags::LAST;

        copy_metadata(&src, &mut dst);

        assert_eq!(dst.timestamp, 42);
        assert!(dst.flags.contains(BufferFlags::TIMECODE));
        assert!(dst.flags.contains(BufferFlags::LAST));
        assert!(!dst.flags.contains(BufferFlags::KEYFRAME));
    }

    #[test]
    fn payload_is_bounded() {
        let mut buf = buffer(0, 0x1000);
        buf.set_payload(0, 1 << 20);
        assert_eq!(buf.payload(0), 4096);
        buf.set_payload(5, 10);
        assert_eq!(buf.payload(5), 0);
    }
}
