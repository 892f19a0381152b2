//! H.264 sequence parameter set decoding
//!
//! Exp-Golomb bit reader over an RBSP with emulation-prevention bytes removed,
//! plus just enough of the SPS syntax to recover resolution and the
//! profile/level pair for stream registration.

/// Decoded SPS fields of interest to the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpsInfo {
    pub profile_idc: u8,
    pub level_idc: u8,
    pub width: u32,
    pub height: u32,
    pub chroma_format_idc: u32,
    pub frame_mbs_only: bool,
}

/// Big-endian bit reader used for Exp-Golomb parsing.
struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_bit(&mut self) -> Option<u32> {
        let byte = *self.data.get(self.pos / 8)?;
        let bit = (byte >> (7 - self.pos % 8)) & 1;
        self.pos += 1;
        Some(bit as u32)
    }

    fn read_bits(&mut self, count: u32) -> Option<u32> {
        let mut value = 0u32;
        for _ in 0..count {
            value = (value << 1) | self.read_bit()?;
        }
        Some(value)
    }

    /// Unsigned Exp-Golomb code.
    fn read_ue(&mut self) -> Option<u32> {
        let mut zeros = 0u32;
        loop {
            match self.read_bit()? {
                0 => zeros += 1,
                _ => break,
            }
            if zeros > 31 {
                return None;
            }
        }
        let rest = self.read_bits(zeros)?;
        Some((1u32 << zeros) - 1 + rest)
    }

    /// Signed Exp-Golomb code.
    fn read_se(&mut self) -> Option<i32> {
        let ue = self.read_ue()?;
        let value = ue.div_ceil(2) as i32;
        Some(if ue % 2 == 0 { -value } else { value })
    }
}

/// Strip `00 00 03` emulation-prevention sequences from a NAL payload.
fn remove_emulation_prevention(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if i + 2 < data.len() && data[i] == 0x00 && data[i + 1] == 0x00 && data[i + 2] == 0x03 {
            out.push(0x00);
            out.push(0x00);
            i += 3;
        } else {
            out.push(data[i]);
            i += 1;
        }
    }
    out
}

fn skip_scaling_list(reader: &mut BitReader<'_>, entries: u32) -> Option<()> {
    let mut last_scale: i32 = 8;
    let mut next_scale: i32 = 8;
    for _ in 0..entries {
        if next_scale != 0 {
            let delta = reader.read_se()?;
            next_scale = (last_scale + delta) & 0xFF;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Some(())
}

const HIGH_PROFILE_IDCS: [u8; 13] = [100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134, 135];

/// Decode an SPS NAL unit (without start code).
///
/// Returns `None` on anything that does not parse as an SPS; the caller falls
/// back to default dimensions in that case.
pub fn parse_sps(sps: &[u8]) -> Option<SpsInfo> {
    if sps.len() < 4 {
        return None;
    }

    let rbsp = remove_emulation_prevention(sps);
    let mut r = BitReader::new(&rbsp);

    r.read_bit()?; // forbidden_zero_bit
    r.read_bits(2)?; // nal_ref_idc
    let nal_unit_type = r.read_bits(5)?;
    if nal_unit_type != 7 {
        return None;
    }

    let mut info = SpsInfo {
        profile_idc: r.read_bits(8)? as u8,
        ..Default::default()
    };
    r.read_bits(8)?; // constraint flags + reserved
    info.level_idc = r.read_bits(8)? as u8;
    r.read_ue()?; // seq_parameter_set_id

    if HIGH_PROFILE_IDCS.contains(&info.profile_idc) {
        info.chroma_format_idc = r.read_ue()?;
        if info.chroma_format_idc == 3 {
            r.read_bit()?; // separate_colour_plane_flag
        }
        r.read_ue()?; // bit_depth_luma_minus8
        r.read_ue()?; // bit_depth_chroma_minus8
        r.read_bit()?; // qpprime_y_zero_transform_bypass_flag

        if r.read_bit()? == 1 {
            let count = if info.chroma_format_idc != 3 { 8 } else { 12 };
            for i in 0..count {
                if r.read_bit()? == 1 {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    } else {
        info.chroma_format_idc = 1; // 4:2:0
    }

    r.read_ue()?; // log2_max_frame_num_minus4

    let pic_order_cnt_type = r.read_ue()?;
    if pic_order_cnt_type == 0 {
        r.read_ue()?; // log2_max_pic_order_cnt_lsb_minus4
    } else if pic_order_cnt_type == 1 {
        r.read_bit()?; // delta_pic_order_always_zero_flag
        r.read_se()?; // offset_for_non_ref_pic
        r.read_se()?; // offset_for_top_to_bottom_field
        let num_ref_frames = r.read_ue()?;
        for _ in 0..num_ref_frames {
            r.read_se()?;
        }
    }

    r.read_ue()?; // max_num_ref_frames
    r.read_bit()?; // gaps_in_frame_num_value_allowed_flag

    let pic_width_in_mbs_minus1 = r.read_ue()?;
    let pic_height_in_map_units_minus1 = r.read_ue()?;
    let frame_mbs_only = r.read_bit()? == 1;
    info.frame_mbs_only = frame_mbs_only;

    let map_unit_factor = if frame_mbs_only { 1 } else { 2 };
    info.width = (pic_width_in_mbs_minus1 + 1) * 16;
    info.height = map_unit_factor * (pic_height_in_map_units_minus1 + 1) * 16;

    if !frame_mbs_only {
        r.read_bit()?; // mb_adaptive_frame_field_flag
    }
    r.read_bit()?; // direct_8x8_inference_flag

    if r.read_bit()? == 1 {
        let crop_left = r.read_ue()?;
        let crop_right = r.read_ue()?;
        let crop_top = r.read_ue()?;
        let crop_bottom = r.read_ue()?;

        let crop_unit_x = 2;
        let crop_unit_y = 2 * map_unit_factor;
        info.width = info.width.saturating_sub(crop_unit_x * (crop_left + crop_right));
        info.height = info
            .height
            .saturating_sub(crop_unit_y * (crop_top + crop_bottom));
    }

    Some(info)
}

/// Human-readable profile name for a `profile_idc`.
pub fn profile_name(profile_idc: u8) -> &'static str {
    match profile_idc {
        66 => "Baseline",
        77 => "Main",
        88 => "Extended",
        100 => "High",
        110 => "High 10",
        122 => "High 4:2:2",
        244 => "High 4:4:4",
        44 => "CAVLC 4:4:4",
        83 => "Scalable Baseline",
        86 => "Scalable High",
        118 => "Multiview High",
        128 => "Stereo High",
        _ => "Unknown",
    }
}

/// Level string for a `level_idc`, e.g. 31 -> "3.1".
pub fn level_string(level_idc: u8) -> String {
    if !(10..=62).contains(&level_idc) {
        return "Unknown".to_string();
    }
    format!("{}.{}", level_idc / 10, level_idc % 10)
}
