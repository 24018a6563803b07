// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-session encoding performance counters.

use std::time::Duration;
use std::time::Instant;

use crate::queue::VpuBuffer;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PerformanceInfo {
    /// Output time of the first frame since the last reset.
    pub ts_first: Option<Instant>,
    pub ts_last: Option<Instant>,
    /// Queue-to-output latency of the first frame.
    pub latency_first: Duration,
    pub latency_max: Duration,
    /// Bounds of the start-to-finish time of a job.
    pub min_process_time: Option<Duration>,
    pub max_process_time: Duration,
    pub total_sw_time: Duration,
    pub total_hw_time: Duration,
    pub frames: u64,
}

fn elapsed(from: Option<Instant>, to: Option<Instant>) -> Duration {
    match (from, to) {
        (Some(from), Some(to)) => to.saturating_duration_since(from),
        _ => Duration::ZERO,
    }
}

impl PerformanceInfo {
    pub fn reset(&mut self) {
        *self = Default::default();
    }

    /// Accounts for the completed bitstream buffer `buf`.
    pub fn update(&mut self, buf: &VpuBuffer) {
        let latency = elapsed(buf.ts_input, buf.ts_output);
        let process_time = elapsed(buf.ts_start, buf.ts_finish);

        if self.ts_first.is_none() {
            self.ts_first = buf.ts_output;
            self.latency_first = latency;
        }
        self.ts_last = buf.ts_output;
        self.latency_max = self.latency_max.max(latency);

        self.min_process_time =
            Some(self.min_process_time.map_or(process_time, |t| t.min(process_time)));
        self.max_process_time = self.max_process_time.max(process_time);

        self.total_sw_time += process_time;
        self.total_hw_time += Duration::from_nanos(buf.hw_time);
        self.frames += 1;
    }

    /// Average output rate between the first and the last frame.
    pub fn fps(&self) -> Option<f64> {
        let span = elapsed(self.ts_first, self.ts_last);
        if self.frames < 2 || span.is_zero() {
            return None;
        }

        Some((self.frames - 1) as f64 / span.as_secs_f64())
    }
}
