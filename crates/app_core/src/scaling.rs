//! Decode-time downscale selection
//!
//! Many decoders can only scale natively in eighths of the natural size
//! (JPEG's DCT scaling being the usual example). Picking the smallest
//! fraction that still covers the draw size avoids decoding at full
//! resolution and resampling afterwards, at the price of an image that may
//! be slightly larger than requested.

use crate::geometry::{clamp_u32, div_ceil, Size};

/// Number of eighths of the natural size used for a full-size decode.
pub const FULL_SCALE: u32 = 8;

/// Outcome of [`choose_decode_scale`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeScale {
    /// Output size as this many eighths of the natural size, in `1..=8`.
    pub eighths: u32,
    /// Size to request from the decoder, in natural (post-orientation) axes.
    pub size: Size,
}

impl DecodeScale {
    pub fn full(natural: Size) -> Self {
        Self {
            eighths: FULL_SCALE,
            size: natural,
        }
    }

    pub fn is_full(&self) -> bool {
        self.eighths == FULL_SCALE
    }
}

/// Pick the eighths factor for decoding an image of `natural` size that
/// will be drawn at `draw`.
///
/// An empty `draw` (any zero dimension) or one that already covers
/// `natural` decodes at full size. Otherwise the factor is the smallest
/// `f` with `natural * f / 8 >= draw` on both axes, and the returned size
/// is `ceil(natural * f / 8)`.
pub fn choose_decode_scale(natural: Size, draw: Size) -> DecodeScale {
    if natural.is_empty() || draw.is_empty() || draw.contains(natural) {
        return DecodeScale::full(natural);
    }

    // ceil(8 / r) with r = min(N/D) over both axes equals the larger of
    // ceil(8 * D / N) per axis; integer math avoids rounding at exact eighths.
    let eighths_for = |d: u32, n: u32| div_ceil(FULL_SCALE as u64 * d as u64, n as u64);
    let eighths = eighths_for(draw.width, natural.width)
        .max(eighths_for(draw.height, natural.height))
        .clamp(1, FULL_SCALE as u64) as u32;

    if eighths == FULL_SCALE {
        return DecodeScale::full(natural);
    }

    let scale = |n: u32| clamp_u32(div_ceil(n as u64 * eighths as u64, FULL_SCALE as u64));
    DecodeScale {
        eighths,
        size: Size::new(scale(natural.width), scale(natural.height)),
    }
}
