// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parameter set parsing.
//!
//! Only the fields a receiver needs to describe the stream are kept: identifiers, profile and
//! level, and the picture geometry.

use anyhow::anyhow;
use anyhow::Context;

use crate::codec::h264::nalu::NaluHeader;
use crate::codec::h264::nalu::NaluType;
use crate::codec::h264::nalu_reader::NaluReader;
use crate::Resolution;

/// The maximum number of reference frames, as per A.3.1, clause h)
const DPB_MAX_SIZE: u32 = 16;

/// Keeps the picture dimensions in pixels within `u32`.
const MAX_MBS_PER_DIMENSION: u32 = u16::MAX as u32;

/// Profiles whose SPS carries chroma format, bit depth and scaling matrix fields.
const HIGH_PROFILES: [u8; 13] = [100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134, 135];

fn check_type(data: &[u8], expected: NaluType) -> anyhow::Result<()> {
    let byte = *data.first().ok_or(anyhow!("Empty NALU"))?;
    let raw_type = NaluHeader::parse(byte).raw_type;
    if raw_type != expected as u8 {
        return Err(anyhow!(
            "Invalid NALU type, expected {:?}, got {}",
            expected,
            raw_type
        ));
    }

    Ok(())
}

/// A Sequence Parameter Set, restricted to its leading fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sps {
    pub profile_idc: u8,
    pub constraint_set0_flag: bool,
    pub constraint_set1_flag: bool,
    pub constraint_set2_flag: bool,
    pub constraint_set3_flag: bool,
    pub constraint_set4_flag: bool,
    pub constraint_set5_flag: bool,
    pub level_idc: u8,
    pub seq_parameter_set_id: u8,
    pub chroma_format_idc: u8,
    pub separate_colour_plane_flag: bool,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub log2_max_frame_num_minus4: u8,
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub max_num_ref_frames: u32,
    pub gaps_in_frame_num_value_allowed_flag: bool,
    pub pic_width_in_mbs_minus1: u32,
    pub pic_height_in_map_units_minus1: u32,
    pub frame_mbs_only_flag: bool,
    pub mb_adaptive_frame_field_flag: bool,
    pub direct_8x8_inference_flag: bool,
    pub frame_cropping_flag: bool,
    pub frame_crop_left_offset: u32,
    pub frame_crop_right_offset: u32,
    pub frame_crop_top_offset: u32,
    pub frame_crop_bottom_offset: u32,
    pub vui_parameters_present_flag: bool,
}

impl Sps {
    /// Parses an SPS NAL unit, header byte included.
    pub fn parse(data: &[u8]) -> anyhow::Result<Sps> {
        check_type(data, NaluType::Sps)?;

        let mut r = NaluReader::new(&data[1..]);
        let mut sps = Sps {
            profile_idc: r.read_bits(8)?,
            constraint_set0_flag: r.read_bit()?,
            constraint_set1_flag: r.read_bit()?,
            constraint_set2_flag: r.read_bit()?,
            constraint_set3_flag: r.read_bit()?,
            constraint_set4_flag: r.read_bit()?,
            constraint_set5_flag: r.read_bit()?,
            ..Default::default()
        };

        // reserved_zero_2bits
        r.skip_bits(2)?;

        sps.level_idc = r.read_bits(8)?;
        sps.seq_parameter_set_id = r.read_ue_max(31)?;

        if HIGH_PROFILES.contains(&sps.profile_idc) {
            sps.chroma_format_idc = r.read_ue_max(3)?;
            if sps.chroma_format_idc == 3 {
                sps.separate_colour_plane_flag = r.read_bit()?;
            }

            sps.bit_depth_luma_minus8 = r.read_ue_max(6)?;
            sps.bit_depth_chroma_minus8 = r.read_ue_max(6)?;
            // qpprime_y_zero_transform_bypass_flag
            r.skip_bits(1)?;

            let seq_scaling_matrix_present_flag = r.read_bit()?;
            if seq_scaling_matrix_present_flag {
                let num_lists = if sps.chroma_format_idc != 3 { 8 } else { 12 };
                for i in 0..num_lists {
                    if r.read_bit()? {
                        let size = if i < 6 { 16 } else { 64 };
                        Self::skip_scaling_list(&mut r, size)
                            .with_context(|| format!("Invalid scaling list {}", i))?;
                    }
                }
            }
        } else {
            sps.chroma_format_idc = 1;
        }

        sps.log2_max_frame_num_minus4 = r.read_ue_max(12)?;
        sps.pic_order_cnt_type = r.read_ue_max(2)?;

        if sps.pic_order_cnt_type == 0 {
            sps.log2_max_pic_order_cnt_lsb_minus4 = r.read_ue_max(12)?;
        } else if sps.pic_order_cnt_type == 1 {
            // delta_pic_order_always_zero_flag
            r.skip_bits(1)?;
            // offset_for_non_ref_pic, offset_for_top_to_bottom_field
            r.read_se::<i32>()?;
            r.read_se::<i32>()?;
            let num_ref_frames_in_pic_order_cnt_cycle: u32 = r.read_ue_max(254)?;
            for _ in 0..num_ref_frames_in_pic_order_cnt_cycle {
                r.read_se::<i32>()?;
            }
        }

        sps.max_num_ref_frames = r.read_ue_max(DPB_MAX_SIZE)?;
        sps.gaps_in_frame_num_value_allowed_flag = r.read_bit()?;
        sps.pic_width_in_mbs_minus1 = r.read_ue_max(MAX_MBS_PER_DIMENSION)?;
        sps.pic_height_in_map_units_minus1 = r.read_ue_max(MAX_MBS_PER_DIMENSION)?;
        sps.frame_mbs_only_flag = r.read_bit()?;

        if !sps.frame_mbs_only_flag {
            sps.mb_adaptive_frame_field_flag = r.read_bit()?;
        }

        sps.direct_8x8_inference_flag = r.read_bit()?;
        sps.frame_cropping_flag = r.read_bit()?;

        if sps.frame_cropping_flag {
            sps.frame_crop_left_offset = r.read_ue()?;
            sps.frame_crop_right_offset = r.read_ue()?;
            sps.frame_crop_top_offset = r.read_ue()?;
            sps.frame_crop_bottom_offset = r.read_ue()?;

            let (crop_unit_x, crop_unit_y) = sps.crop_unit_x_y();

            let _ = sps
                .frame_crop_left_offset
                .checked_add(sps.frame_crop_right_offset)
                .and_then(|r| r.checked_mul(crop_unit_x))
                .and_then(|r| sps.width().checked_sub(r))
                .ok_or(anyhow!("Invalid frame crop width"))?;

            let _ = sps
                .frame_crop_top_offset
                .checked_add(sps.frame_crop_bottom_offset)
                .and_then(|r| r.checked_mul(crop_unit_y))
                .and_then(|r| sps.height().checked_sub(r))
                .ok_or(anyhow!("Invalid frame crop height"))?;
        }

        sps.vui_parameters_present_flag = r.read_bit()?;

        Ok(sps)
    }

    // 7.3.2.1.1.1
    fn skip_scaling_list(r: &mut NaluReader, size: usize) -> anyhow::Result<()> {
        let mut last_scale = 8i32;
        let mut next_scale = 8i32;

        for _ in 0..size {
            if next_scale != 0 {
                let delta_scale = r.read_se::<i32>()?;
                next_scale = (last_scale + delta_scale + 256) % 256;
            }

            if next_scale != 0 {
                last_scale = next_scale;
            }
        }

        Ok(())
    }

    /// Coded width in pixels.
    pub fn width(&self) -> u32 {
        (self.pic_width_in_mbs_minus1 + 1) * 16
    }

    /// Coded height in pixels.
    pub fn height(&self) -> u32 {
        (self.pic_height_in_map_units_minus1 + 1) * 16 * (2 - u32::from(self.frame_mbs_only_flag))
    }

    // Table 6-1 and equations (7-19) to (7-22).
    fn crop_unit_x_y(&self) -> (u32, u32) {
        let chroma_array_type = if self.separate_colour_plane_flag {
            0
        } else {
            self.chroma_format_idc
        };

        let frame_mbs = 2 - u32::from(self.frame_mbs_only_flag);
        match chroma_array_type {
            0 => (1, frame_mbs),
            1 => (2, 2 * frame_mbs),
            2 => (2, frame_mbs),
            _ => (1, frame_mbs),
        }
    }

    /// Size of the picture after applying the cropping window.
    pub fn visible_resolution(&self) -> Resolution {
        if !self.frame_cropping_flag {
            return Resolution::new(self.width(), self.height());
        }

        let (crop_unit_x, crop_unit_y) = self.crop_unit_x_y();
        let crop_x = crop_unit_x * (self.frame_crop_left_offset + self.frame_crop_right_offset);
        let crop_y = crop_unit_y * (self.frame_crop_top_offset + self.frame_crop_bottom_offset);

        Resolution::new(self.width() - crop_x, self.height() - crop_y)
    }
}

/// The identifiers at the start of a Picture Parameter Set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pps {
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,
}

impl Pps {
    /// Parses a PPS NAL unit, header byte included.
    pub fn parse(data: &[u8]) -> anyhow::Result<Pps> {
        check_type(data, NaluType::Pps)?;

        let mut r = NaluReader::new(&data[1..]);
        Ok(Pps {
            pic_parameter_set_id: r.read_ue_max(255)?,
            seq_parameter_set_id: r.read_ue_max(31)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::Pps;
    use super::Sps;
    use crate::media::tests::PPS;
    use crate::media::tests::SPS_640X480;
    use crate::Resolution;

    #[test]
    fn parse_baseline_sps() {
        let sps = Sps::parse(&SPS_640X480).unwrap();

        assert_eq!(sps.profile_idc, 66);
        assert!(sps.constraint_set0_flag);
        assert!(sps.constraint_set1_flag);
        assert!(!sps.constraint_set2_flag);
        assert_eq!(sps.level_idc, 30);
        assert_eq!(sps.seq_parameter_set_id, 0);
        assert_eq!(sps.chroma_format_idc, 1);
        assert_eq!(sps.log2_max_frame_num_minus4, 0);
        assert_eq!(sps.pic_order_cnt_type, 2);
        assert_eq!(sps.max_num_ref_frames, 1);
        assert!(sps.frame_mbs_only_flag);
        assert!(sps.direct_8x8_inference_flag);
        assert!(!sps.frame_cropping_flag);
        assert!(!sps.vui_parameters_present_flag);
        assert_eq!(sps.width(), 640);
        assert_eq!(sps.height(), 480);
        assert_eq!(sps.visible_resolution(), Resolution::new(640, 480));
    }

    #[test]
    fn cropped_resolution() {
        // 1920x1088 coded, cropped to 1080 lines.
        let sps = Sps {
            chroma_format_idc: 1,
            pic_width_in_mbs_minus1: 119,
            pic_height_in_map_units_minus1: 67,
            frame_mbs_only_flag: true,
            frame_cropping_flag: true,
            frame_crop_bottom_offset: 4,
            ..Default::default()
        };

        assert_eq!(sps.width(), 1920);
        assert_eq!(sps.height(), 1088);
        assert_eq!(sps.visible_resolution(), Resolution::new(1920, 1080));
    }

    #[test]
    fn wrong_nalu_type() {
        assert!(Sps::parse(&PPS).is_err());
        assert!(Pps::parse(&SPS_640X480).is_err());
        assert!(Sps::parse(&[]).is_err());
    }

    #[test]
    fn truncated_sps() {
        assert!(Sps::parse(&SPS_640X480[..5]).is_err());
    }

    #[test]
    fn parse_pps() {
        let pps = Pps::parse(&PPS).unwrap();
        assert_eq!(pps.pic_parameter_set_id, 0);
        assert_eq!(pps.seq_parameter_set_id, 0);
    }
}
