//! Sample layout conversion
//!
//! The audio thread works with interleaved frames; packets carry
//! channel-major (planar) payloads. Both operate on raw sample bytes so
//! any bit resolution works.

/// Channel-major copy of an interleaved buffer.
///
/// `src` and `dst` both hold `frames * channels * bytes_per_sample` bytes.
pub fn interleaved_to_planar(
    src: &[u8],
    dst: &mut [u8],
    channels: usize,
    frames: usize,
    bytes_per_sample: usize,
) {
    if channels <= 1 {
        let n = src.len().min(dst.len());
        dst[..n].copy_from_slice(&src[..n]);
        return;
    }

    for frame in 0..frames {
        for ch in 0..channels {
            let from = (frame * channels + ch) * bytes_per_sample;
            let to = (ch * frames + frame) * bytes_per_sample;
            dst[to..to + bytes_per_sample].copy_from_slice(&src[from..from + bytes_per_sample]);
        }
    }
}

/// Interleave a channel-major buffer with `src_channels` channels into
/// `dst_channels` channels.
///
/// Only the first `min(src_channels, dst_channels)` channels are copied;
/// any extra destination channels are zeroed.
pub fn planar_to_interleaved(
    src: &[u8],
    src_channels: usize,
    dst: &mut [u8],
    dst_channels: usize,
    frames: usize,
    bytes_per_sample: usize,
) {
    if src_channels == 1 && dst_channels == 1 {
        let n = src.len().min(dst.len());
        dst[..n].copy_from_slice(&src[..n]);
        return;
    }

    let shared = src_channels.min(dst_channels);
    for frame in 0..frames {
        for ch in 0..dst_channels {
            let to = (frame * dst_channels + ch) * bytes_per_sample;
            let out = &mut dst[to..to + bytes_per_sample];
            if ch < shared {
                let from = (ch * frames + frame) * bytes_per_sample;
                out.copy_from_slice(&src[from..from + bytes_per_sample]);
            } else {
                out.fill(0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interleaved_to_planar_stereo_16bit() {
        // L0 R0 L1 R1 L2 R2
        let src = [0x10, 0x11, 0x20, 0x21, 0x12, 0x13, 0x22, 0x23, 0x14, 0x15, 0x24, 0x25];
        let mut dst = [0u8; 12];
        interleaved_to_planar(&src, &mut dst, 2, 3, 2);
        assert_eq!(
            dst,
            [0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x20, 0x21, 0x22, 0x23, 0x24, 0x25]
        );
    }

    #[test]
    fn test_planar_round_trip() {
        let src: Vec<u8> = (0..48).collect();
        let mut planar = vec![0u8; 48];
        let mut back = vec![0u8; 48];
        interleaved_to_planar(&src, &mut planar, 4, 4, 3);
        planar_to_interleaved(&planar, 4, &mut back, 4, 4, 3);
        assert_eq!(back, src);
    }

    #[test]
    fn test_fewer_peer_channels_zero_filled() {
        // mono peer, stereo local
        let planar = [1u8, 2, 3];
        let mut dst = [9u8; 6];
        planar_to_interleaved(&planar, 1, &mut dst, 2, 3, 1);
        assert_eq!(dst, [1, 0, 2, 0, 3, 0]);
    }

    #[test]
    fn test_more_peer_channels_truncated() {
        // three channels of two frames, local stereo
        let planar = [1u8, 2, 3, 4, 5, 6];
        let mut dst = [0u8; 4];
        planar_to_interleaved(&planar, 3, &mut dst, 2, 2, 1);
        assert_eq!(dst, [1, 3, 2, 4]);
    }
}
