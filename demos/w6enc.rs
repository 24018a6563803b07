// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Encodes raw frames through an encoder session backed by the dummy codec, and writes the
//! produced bitstream to a file.

use std::fs::File;
use std::io::Read;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;

use argh::FromArgs;
use wave6_enc::backend::dummy::DummyVpu;
use wave6_enc::controls::ControlId;
use wave6_enc::format::PixFormat;
use wave6_enc::hw::VpuTransport;
use wave6_enc::hw::Wave6Device;
use wave6_enc::queue::BufferFlags;
use wave6_enc::queue::BufferPlane;
use wave6_enc::queue::BufferState;
use wave6_enc::queue::M2mQueues;
use wave6_enc::queue::QueueDirection;
use wave6_enc::queue::VpuBuffer;
use wave6_enc::session::EncoderCommand;
use wave6_enc::session::EncoderSession;
use wave6_enc::session::Timeperframe;
use wave6_enc::Fourcc;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Codec {
    H264,
    #[default]
    H265,
}

impl FromStr for Codec {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "h264" | "H264" => Ok(Self::H264),
            "h265" | "H265" | "hevc" | "HEVC" => Ok(Self::H265),
            _ => Err("unrecognized codec. Valid values: h264, h265"),
        }
    }
}

impl Codec {
    fn fourcc(self) -> Fourcc {
        match self {
            Codec::H264 => Fourcc::from(b"H264"),
            Codec::H265 => Fourcc::from(b"HEVC"),
        }
    }
}

/// Simple Wave6 encoder
#[derive(Debug, FromArgs)]
struct Args {
    /// input file, with frames laid out in the negotiated source format
    #[argh(positional)]
    input: PathBuf,

    /// input frames width
    #[argh(option)]
    width: u32,

    /// input frames height
    #[argh(option)]
    height: u32,

    /// input frames count
    #[argh(option)]
    count: usize,

    /// fourcc of the input frames
    #[argh(option, default = "String::from(\"NV12\")")]
    fourcc: String,

    /// codec to encode into. Possible values: h264, h265
    #[argh(option, default = "Codec::default()")]
    codec: Codec,

    /// framerate
    #[argh(option, default = "30")]
    framerate: u32,

    /// target bitrate in bits per second
    #[argh(option, default = "2097152")]
    bitrate: i32,

    /// number of buffers to allocate on each queue
    #[argh(option, default = "4")]
    buffers: u32,

    /// output file to write the encoded bitstream to
    #[argh(option)]
    output: Option<PathBuf>,
}

fn allocate_buffers(
    device: &Wave6Device<DummyVpu>,
    sizes: &[u32],
    count: u32,
) -> Vec<VpuBuffer> {
    let mut vpu = device.lock().expect("failed to lock the device");

    (0..count)
        .map(|index| {
            let planes = sizes
                .iter()
                .map(|size| BufferPlane {
                    mem: vpu.alloc_dma(*size as usize).expect("failed to allocate buffer"),
                    bytesused: 0,
                })
                .collect();
            VpuBuffer::new(index, planes)
        })
        .collect()
}

/// Copies one frame from `data` to the planes of `buf`.
fn upload_frame(device: &Wave6Device<DummyVpu>, buf: &mut VpuBuffer, data: &[u8]) {
    let mut vpu = device.lock().expect("failed to lock the device");
    let mut data = data;

    for plane in 0..buf.planes.len() {
        let mem = buf.planes[plane].mem;
        let (chunk, rest) = data.split_at(mem.size.min(data.len()));
        vpu.write_dma(&mem, chunk).expect("failed to upload frame");
        buf.set_payload(plane, chunk.len());
        data = rest;
    }
}

fn main() {
    env_logger::init();

    let args: Args = argh::from_env();

    let mut input = File::open(&args.input).expect("error opening input file");
    let mut output = args.output.as_ref().map(|p| File::create(p).expect("error creating output"));

    let device = Wave6Device::new(DummyVpu::new());
    let mut session =
        EncoderSession::new(device.clone(), M2mQueues::new()).expect("failed to create session");

    let fourcc: [u8; 4] =
        args.fourcc.as_bytes().try_into().expect("fourcc must be four characters long");
    let src_request = PixFormat {
        fourcc: Fourcc::from(&fourcc),
        width: args.width,
        height: args.height,
        ..Default::default()
    };
    let src_fmt = session.s_fmt(QueueDirection::Output, &src_request).unwrap();
    if (src_fmt.width, src_fmt.height) != (args.width, args.height) {
        log::warn!("source adjusted to {}x{}", src_fmt.width, src_fmt.height);
    }

    let dst_request = PixFormat {
        fourcc: args.codec.fourcc(),
        width: src_fmt.width,
        height: src_fmt.height,
        ..Default::default()
    };
    session.s_fmt(QueueDirection::Capture, &dst_request).unwrap();

    session
        .s_parm(
            QueueDirection::Output,
            Timeperframe { numerator: 1, denominator: args.framerate },
        )
        .unwrap();
    session.set_control(ControlId::Bitrate, args.bitrate).unwrap();

    let src_setup = session.queue_setup(QueueDirection::Output, args.buffers, &[]).unwrap();
    let dst_setup = session.queue_setup(QueueDirection::Capture, args.buffers, &[]).unwrap();

    let mut free_srcs = allocate_buffers(&device, &src_setup.sizes, src_setup.num_buffers);
    let dsts = allocate_buffers(&device, &dst_setup.sizes, dst_setup.num_buffers);

    session.stream_on(QueueDirection::Output).unwrap();
    session.stream_on(QueueDirection::Capture).unwrap();
    for dst in dsts {
        session.queue_buffer(QueueDirection::Capture, dst).unwrap();
    }

    let frame_size = src_setup.sizes.iter().map(|s| *s as usize).sum::<usize>();
    let mut frame = vec![0u8; frame_size];
    let mut digest = md5::Context::new();
    let mut frames_read = 0;
    let mut stop_sent = false;
    let mut frames_encoded = 0;

    while !session.is_eos() {
        while frames_read < args.count {
            let Some(mut src) = free_srcs.pop() else {
                break;
            };

            input.read_exact(&mut frame).expect("error reading input file");
            upload_frame(&device, &mut src, &frame);
            src.timestamp = frames_read as u64;
            src.flags = BufferFlags::default();
            session.queue_buffer(QueueDirection::Output, src).unwrap();
            frames_read += 1;
        }

        if frames_read == args.count && !stop_sent {
            session.encoder_cmd(EncoderCommand::Stop).unwrap();
            stop_sent = true;
        }

        session.process_completions().unwrap();

        for (src, _) in session.queues_mut().take_done(QueueDirection::Output) {
            free_srcs.push(src);
        }

        for (mut dst, state) in session.queues_mut().take_done(QueueDirection::Capture) {
            session.buf_finish(QueueDirection::Capture, &dst);

            let size = dst.payload(0);
            if state == BufferState::Done && size > 0 {
                let vpu = device.lock().unwrap();
                let data = &vpu.read_dma(dst.daddr()).unwrap_or_default()[..size];
                digest.consume(data);
                if let Some(output) = output.as_mut() {
                    output.write_all(data).expect("error writing output file");
                }
                println!(
                    "frame {}: {} bytes, keyframe={}, qp={}",
                    dst.timestamp,
                    size,
                    dst.flags.contains(BufferFlags::KEYFRAME),
                    dst.average_qp
                );
                frames_encoded += 1;
            }

            let last = dst.flags.contains(BufferFlags::LAST);
            if !last && !session.is_eos() {
                dst.flags = BufferFlags::default();
                dst.set_payload(0, 0);
                session.queue_buffer(QueueDirection::Capture, dst).unwrap();
            }
        }
    }

    session.stream_off(QueueDirection::Output).unwrap();
    session.stream_off(QueueDirection::Capture).unwrap();

    println!("{} frames encoded, md5 {:x}", frames_encoded, digest.compute());
    if let Some(fps) = session.performance().fps() {
        println!("{:.2} fps", fps);
    }
}
