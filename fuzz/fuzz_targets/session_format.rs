#![no_main]

use libfuzzer_sys::fuzz_target;
use wave6_enc::backend::dummy::DummyVpu;
use wave6_enc::format::find_by_index;
use wave6_enc::format::FormatKind;
use wave6_enc::format::PixFormat;
use wave6_enc::format::MAX_ENC_PIC_HEIGHT;
use wave6_enc::format::MAX_ENC_PIC_WIDTH;
use wave6_enc::format::MIN_ENC_PIC_HEIGHT;
use wave6_enc::format::MIN_ENC_PIC_WIDTH;
use wave6_enc::hw::Wave6Device;
use wave6_enc::queue::M2mQueues;
use wave6_enc::queue::QueueDirection;
use wave6_enc::session::EncoderSession;
use wave6_enc::session::SelectionFlags;
use wave6_enc::session::SelectionTarget;
use wave6_enc::Rect;

fn words(data: &[u8]) -> impl Iterator<Item = u32> + '_ {
    data.chunks_exact(4).map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
}

fuzz_target!(|data: &[u8]| {
    let mut w = words(data);
    let mut next = || w.next().unwrap_or(0);

    let device = Wave6Device::new(DummyVpu::new());
    let mut session = EncoderSession::new(device, M2mQueues::new()).unwrap();

    let raw = find_by_index(next() as usize % 16, FormatKind::Raw)
        .map(|desc| desc.fourcc)
        .unwrap_or_else(|| session.g_fmt(QueueDirection::Output).fourcc);
    let request = PixFormat { fourcc: raw, width: next(), height: next(), ..Default::default() };
    let fmt = session.s_fmt(QueueDirection::Output, &request).unwrap();
    assert!((MIN_ENC_PIC_WIDTH..=MAX_ENC_PIC_WIDTH).contains(&fmt.width));
    assert!((MIN_ENC_PIC_HEIGHT..=MAX_ENC_PIC_HEIGHT).contains(&fmt.height));

    let codec = PixFormat {
        fourcc: session.g_fmt(QueueDirection::Capture).fourcc,
        width: next(),
        height: next(),
        ..Default::default()
    };
    let _ = session.try_fmt(QueueDirection::Capture, &codec);

    let rect = Rect { left: next(), top: next(), width: next(), height: next() };
    let flags = SelectionFlags(next() & 0x3);
    let _ = session.s_selection(QueueDirection::Output, SelectionTarget::Crop, flags, rect);

    let region = session.encode_region();
    assert!(region.crop.right() <= fmt.width);
    assert!(region.crop.bottom() <= fmt.height);
    assert!(region.codec_rect.left <= region.crop.left);
    assert!(region.codec_rect.top <= region.crop.top);
    assert!(region.codec_rect.right() >= region.crop.right());
    assert!(region.codec_rect.bottom() >= region.crop.bottom());
});
