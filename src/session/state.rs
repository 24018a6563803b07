// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;

/// Lifecycle state of the hardware instance backing a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InstanceState {
    /// No instance is open.
    #[default]
    None,
    /// The channel is open but the sequence is not initialized.
    Open,
    /// The sequence is initialized, frame buffers are not registered yet.
    InitSeq,
    /// Encoding pictures.
    PicRun,
    /// Draining, or stopped after an error.
    Stop,
}

impl InstanceState {
    /// Whether the instance may move from `self` to `to`.
    pub fn can_transition_to(self, to: InstanceState) -> bool {
        use InstanceState::*;

        if self == to {
            return true;
        }

        matches!(
            (self, to),
            (_, None)
                | (None, Open)
                | (Open, InitSeq)
                | (InitSeq, PicRun)
                | (PicRun, Stop)
                | (Stop, PicRun)
        )
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::None => "none",
            InstanceState::Open => "open",
            InstanceState::InitSeq => "init_seq",
            InstanceState::PicRun => "pic_run",
            InstanceState::Stop => "stop",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::InstanceState::*;
    use super::*;

    #[test]
    fn transitions() {
        let all = [None, Open, InitSeq, PicRun, Stop];
        let allowed = [
            (None, Open),
            (Open, InitSeq),
            (InitSeq, PicRun),
            (PicRun, Stop),
            (Stop, PicRun),
        ];

        for from in all {
            for to in all {
                let expected = from == to || to == None || allowed.contains(&(from, to));
                assert_eq!(from.can_transition_to(to), expected, "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn no_skipping_bring_up() {
        assert!(!None.can_transition_to(PicRun));
        assert!(!Open.can_transition_to(PicRun));
        assert!(!Stop.can_transition_to(InitSeq));
    }
}
