#![no_main]

use libfuzzer_sys::fuzz_target;
use wave6_enc::hw::params::CodecStd;
use wave6_enc::roi::raster_from_map;
use wave6_enc::roi::remap_user_map;
use wave6_enc::roi::roi_grid;

fuzz_target!(|data: &[u8]| {
    if data.len() < 5 {
        return;
    }

    let std = if data[0] & 1 == 0 { CodecStd::AvcEnc } else { CodecStd::HevcEnc };
    let width = u16::from_le_bytes([data[1], data[2]]) as u32 % 4096 + 1;
    let height = u16::from_le_bytes([data[3], data[4]]) as u32 % 4096 + 1;
    let roi = roi_grid(std, width, height);

    // Delta QPs that survive the 6-bit hardware encoding.
    let user_map: Vec<i32> = data[5..]
        .iter()
        .cycle()
        .take(roi.num_ctu as usize)
        .map(|b| (*b as i8 >> 2) as i32)
        .collect();
    if user_map.len() != roi.num_ctu as usize {
        return;
    }

    let mut map = vec![0u8; roi.custom_map_size];
    remap_user_map(&user_map, &roi, &mut map);
    assert_eq!(raster_from_map(&map, &roi), user_map);
});
