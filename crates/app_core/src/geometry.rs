//! Pixel sizes

use serde::{Deserialize, Serialize};
use std::fmt;

/// Width and height in pixels.
///
/// A zero dimension in a requested draw size means "unbounded on that axis";
/// a size with both dimensions zero means "full natural size".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const ZERO: Size = Size { width: 0, height: 0 };

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Both dimensions are zero.
    pub fn is_null(&self) -> bool {
        self.width == 0 && self.height == 0
    }

    /// At least one dimension is zero (zero area).
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Exactly one dimension is zero.
    pub fn is_partial(&self) -> bool {
        self.is_empty() && !self.is_null()
    }

    /// Component-wise maximum.
    pub fn max(self, other: Size) -> Size {
        Size::new(self.width.max(other.width), self.height.max(other.height))
    }

    /// Both dimensions of `self` are at least those of `other`.
    pub fn contains(&self, other: Size) -> bool {
        self.width >= other.width && self.height >= other.height
    }

    /// Width and height swapped.
    pub fn transposed(self) -> Size {
        Size::new(self.height, self.width)
    }

    /// Number of pixels.
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Fill in a single missing dimension from `natural`, preserving its
    /// aspect ratio. The derived dimension is rounded up so the result never
    /// asks for less than the caller wanted. Sizes that are not partial are
    /// returned unchanged.
    pub fn fill_aspect(self, natural: Size) -> Size {
        if !self.is_partial() || natural.is_empty() {
            return self;
        }
        if self.height == 0 {
            let h = div_ceil(self.width as u64 * natural.height as u64, natural.width as u64);
            Size::new(self.width, clamp_u32(h))
        } else {
            let w = div_ceil(self.height as u64 * natural.width as u64, natural.height as u64);
            Size::new(clamp_u32(w), self.height)
        }
    }

    /// Scale `self` to the largest size that fits inside `bounds` while
    /// keeping its aspect ratio. A zero dimension in `bounds` is unbounded.
    pub fn fit_within(self, bounds: Size) -> Size {
        if self.is_empty() || bounds.is_null() {
            return Size::ZERO;
        }
        if bounds.is_partial() {
            return bounds.fill_aspect(self);
        }
        // Compare w/h ratios without floating point.
        let (w, h) = (self.width as u64, self.height as u64);
        let (bw, bh) = (bounds.width as u64, bounds.height as u64);
        if w * bh > h * bw {
            Size::new(bounds.width, clamp_u32(div_ceil(h * bw, w)))
        } else {
            Size::new(clamp_u32(div_ceil(w * bh, h)), bounds.height)
        }
    }
}

impl From<(u32, u32)> for Size {
    fn from((width, height): (u32, u32)) -> Self {
        Size::new(width, height)
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

pub(crate) fn div_ceil(n: u64, d: u64) -> u64 {
    (n + d - 1) / d
}

pub(crate) fn clamp_u32(v: u64) -> u32 {
    v.min(u32::MAX as u64) as u32
}
