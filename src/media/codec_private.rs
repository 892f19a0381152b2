//! avcC / hvcC codec-private decoding for Matroska tracks
//!
//! ISO-BMFF style configuration records carry parameter sets with explicit
//! lengths. The extractors below take only the first entry per set and
//! re-emit each with a 4-byte Annex-B start code so it can be handed straight
//! to stream registration. Lengths that would overrun the blob are rejected.

use bytes::{BufMut, Bytes, BytesMut};

const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Parameter sets recovered from a codec-private blob, each carrying its
/// start code.
#[derive(Debug, Clone, Default)]
pub struct ParameterSets {
    pub vps: Option<Bytes>,
    pub sps: Option<Bytes>,
    pub pps: Option<Bytes>,
    /// NAL length-prefix size declared by the record (1, 2 or 4 bytes).
    pub nal_length_size: usize,
}

fn with_start_code(payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(4 + payload.len());
    out.put_slice(&START_CODE);
    out.put_slice(payload);
    out.freeze()
}

fn read_u16(data: &[u8], offset: usize) -> Option<usize> {
    if offset + 2 > data.len() {
        return None;
    }
    Some(((data[offset] as usize) << 8) | data[offset + 1] as usize)
}

/// Parse an AVCDecoderConfigurationRecord, keeping the first SPS and PPS.
pub fn parse_avcc(cp: &[u8]) -> Option<ParameterSets> {
    if cp.len() < 8 {
        return None;
    }

    let mut sets = ParameterSets {
        nal_length_size: (cp[4] & 0x03) as usize + 1,
        ..Default::default()
    };

    let mut offset = 5;
    let num_sps = cp[offset] & 0x1F;
    offset += 1;

    for _ in 0..num_sps {
        let len = read_u16(cp, offset)?;
        offset += 2;
        if offset + len > cp.len() {
            return None;
        }
        if sets.sps.is_none() {
            sets.sps = Some(with_start_code(&cp[offset..offset + len]));
        }
        offset += len;
    }

    if offset < cp.len() {
        let num_pps = cp[offset];
        offset += 1;

        for _ in 0..num_pps {
            let len = read_u16(cp, offset)?;
            offset += 2;
            if offset + len > cp.len() {
                return None;
            }
            if sets.pps.is_none() {
                sets.pps = Some(with_start_code(&cp[offset..offset + len]));
            }
            offset += len;
        }
    }

    Some(sets)
}

/// Parse an HEVCDecoderConfigurationRecord, keeping the first VPS, SPS and
/// PPS found across the NAL arrays.
pub fn parse_hvcc(cp: &[u8]) -> Option<ParameterSets> {
    if cp.len() < 23 {
        return None;
    }

    let mut sets = ParameterSets {
        nal_length_size: (cp[21] & 0x03) as usize + 1,
        ..Default::default()
    };

    let mut offset = 22;
    let num_arrays = cp[offset];
    offset += 1;

    for _ in 0..num_arrays {
        if offset >= cp.len() {
            break;
        }
        let nal_unit_type = cp[offset] & 0x3F;
        offset += 1;

        let num_nalus = read_u16(cp, offset)?;
        offset += 2;

        for _ in 0..num_nalus {
            let len = read_u16(cp, offset)?;
            offset += 2;
            if offset + len > cp.len() {
                return None;
            }

            let nalu = &cp[offset..offset + len];
            offset += len;

            match nal_unit_type {
                32 if sets.vps.is_none() => sets.vps = Some(with_start_code(nalu)),
                33 if sets.sps.is_none() => sets.sps = Some(with_start_code(nalu)),
                34 if sets.pps.is_none() => sets.pps = Some(with_start_code(nalu)),
                _ => {}
            }
        }
    }

    Some(sets)
}

/// Rewrite a length-prefixed elementary-stream frame (as stored in Matroska
/// blocks) into Annex-B form by replacing each NAL length with a start code.
///
/// Returns `None` when a declared length overruns the frame.
pub fn length_prefixed_to_annexb(frame: &[u8], nal_length_size: usize) -> Option<Bytes> {
    if !(1..=4).contains(&nal_length_size) {
        return None;
    }

    let mut out = BytesMut::with_capacity(frame.len() + 8);
    let mut offset = 0;

    while offset < frame.len() {
        if offset + nal_length_size > frame.len() {
            return None;
        }
        let mut len = 0usize;
        for &b in &frame[offset..offset + nal_length_size] {
            len = (len << 8) | b as usize;
        }
        offset += nal_length_size;

        if len == 0 || offset + len > frame.len() {
            return None;
        }
        out.put_slice(&START_CODE);
        out.put_slice(&frame[offset..offset + len]);
        offset += len;
    }

    Some(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_avcc() -> Vec<u8> {
        let sps = [0x67, 0x42, 0x00, 0x1F, 0x8C, 0x8D];
        let pps = [0x68, 0xCE, 0x38, 0x80];

        let mut cp = vec![
            0x01, // configurationVersion
            0x42, // AVCProfileIndication
            0x00, // profile_compatibility
            0x1F, // AVCLevelIndication
            0xFF, // lengthSizeMinusOne = 3
            0xE1, // numOfSequenceParameterSets = 1
        ];
        cp.extend_from_slice(&(sps.len() as u16).to_be_bytes());
        cp.extend_from_slice(&sps);
        cp.push(0x01); // numOfPictureParameterSets
        cp.extend_from_slice(&(pps.len() as u16).to_be_bytes());
        cp.extend_from_slice(&pps);
        cp
    }

    #[test]
    fn test_parse_avcc() {
        let sets = parse_avcc(&sample_avcc()).unwrap();
        assert_eq!(sets.nal_length_size, 4);
        assert_eq!(
            sets.sps.as_deref(),
            Some(&[0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1F, 0x8C, 0x8D][..])
        );
        assert_eq!(
            sets.pps.as_deref(),
            Some(&[0x00, 0x00, 0x00, 0x01, 0x68, 0xCE, 0x38, 0x80][..])
        );
        assert!(sets.vps.is_none());
    }

    #[test]
    fn test_parse_avcc_rejects_overrun() {
        let mut cp = sample_avcc();
        // Claim an SPS longer than the blob.
        cp[6] = 0xFF;
        cp[7] = 0xFF;
        assert!(parse_avcc(&cp).is_none());
    }

    #[test]
    fn test_parse_hvcc() {
        let vps = [0x40, 0x01, 0x0C];
        let sps = [0x42, 0x01, 0x01, 0x02];
        let pps = [0x44, 0x01, 0xC0];

        let mut cp = vec![0u8; 22];
        cp[0] = 0x01;
        cp[21] = 0x03; // lengthSizeMinusOne = 3
        cp.push(3); // numOfArrays
        for (nal_type, payload) in [(32u8, &vps[..]), (33, &sps[..]), (34, &pps[..])] {
            cp.push(nal_type);
            cp.extend_from_slice(&1u16.to_be_bytes());
            cp.extend_from_slice(&(payload.len() as u16).to_be_bytes());
            cp.extend_from_slice(payload);
        }

        let sets = parse_hvcc(&cp).unwrap();
        assert_eq!(sets.nal_length_size, 4);
        assert_eq!(
            sets.vps.as_deref(),
            Some(&[0x00, 0x00, 0x00, 0x01, 0x40, 0x01, 0x0C][..])
        );
        assert_eq!(
            sets.sps.as_deref(),
            Some(&[0x00, 0x00, 0x00, 0x01, 0x42, 0x01, 0x01, 0x02][..])
        );
        assert_eq!(
            sets.pps.as_deref(),
            Some(&[0x00, 0x00, 0x00, 0x01, 0x44, 0x01, 0xC0][..])
        );
    }

    #[test]
    fn test_length_prefixed_conversion() {
        // Two NALs with 4-byte length prefixes.
        let mut frame = Vec::new();
        frame.extend_from_slice(&3u32.to_be_bytes());
        frame.extend_from_slice(&[0x65, 0x88, 0x84]);
        frame.extend_from_slice(&2u32.to_be_bytes());
        frame.extend_from_slice(&[0x41, 0x9A]);

        let annexb = length_prefixed_to_annexb(&frame, 4).unwrap();
        assert_eq!(
            annexb.as_ref(),
            &[
                0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84, //
                0x00, 0x00, 0x00, 0x01, 0x41, 0x9A,
            ]
        );
    }

    #[test]
    fn test_length_prefixed_rejects_overrun() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&100u32.to_be_bytes());
        frame.extend_from_slice(&[0x65]);
        assert!(length_prefixed_to_annexb(&frame, 4).is_none());
    }
}
