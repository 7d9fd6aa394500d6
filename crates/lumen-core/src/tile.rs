//! Tile descriptors
//!
//! A [`Tile`] tells an operator which destination rectangle to produce and
//! where in its source that rectangle starts. Coordinates are local to the
//! operator's bound buffers.

use crate::error::{Error, Result};
use std::fmt;

/// Height and width of a 2-D region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent {
    pub height: usize,
    pub width: usize,
}

impl Extent {
    pub const fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }

    pub const fn area(&self) -> usize {
        self.height * self.width
    }

    /// Whether `self` fits inside `other`
    pub const fn fits_in(&self, other: Extent) -> bool {
        self.height <= other.height && self.width <= other.width
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.height, self.width)
    }
}

/// Region an operator processes in one `execute`
///
/// `h_dst`/`w_dst` and `height`/`width` address the destination. `h_src` and
/// `w_src` give the source position of the first destination pixel in the
/// operator's source sampling grid: source resolution for same-size and
/// downsampling operators, destination resolution for upsampling ones. The
/// source position may be negative or run past `src_bounds`; convolutions
/// read zeros there, other operators reject such tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tile {
    pub h_src: isize,
    pub w_src: isize,
    pub h_dst: usize,
    pub w_dst: usize,
    pub height: usize,
    pub width: usize,
    /// Readable part of the source, starting at local (0, 0)
    pub src_bounds: Extent,
}

impl Tile {
    /// Tile covering a whole destination whose source has the same extent
    pub fn full(dst: Extent) -> Self {
        Self::full_with_source(dst, dst)
    }

    pub fn full_with_source(dst: Extent, src: Extent) -> Self {
        Self {
            h_src: 0,
            w_src: 0,
            h_dst: 0,
            w_dst: 0,
            height: dst.height,
            width: dst.width,
            src_bounds: src,
        }
    }

    pub fn extent(&self) -> Extent {
        Extent::new(self.height, self.width)
    }

    /// Check that the destination rectangle lies inside `dst`
    pub fn check_destination(&self, dst: Extent) -> Result<()> {
        let fits = self.h_dst.checked_add(self.height).is_some_and(|end| end <= dst.height)
            && self.w_dst.checked_add(self.width).is_some_and(|end| end <= dst.width);
        if !fits {
            return Err(Error::invalid(format!(
                "destination tile {}x{} at ({}, {}) exceeds {dst}",
                self.height, self.width, self.h_dst, self.w_dst
            )));
        }
        Ok(())
    }

    /// Check that the readable source bounds lie inside `src`
    pub fn check_source_bounds(&self, src: Extent) -> Result<()> {
        if !self.src_bounds.fits_in(src) {
            return Err(Error::invalid(format!(
                "source bounds {} exceed source {src}",
                self.src_bounds
            )));
        }
        Ok(())
    }

    /// Check that `rows` x `cols` source samples starting at the source
    /// position stay inside `src_bounds`
    pub(crate) fn check_source_window(&self, rows: usize, cols: usize) -> Result<()> {
        let inside = |start: isize, len: usize, bound: usize| {
            start >= 0 && (start as usize).checked_add(len).is_some_and(|end| end <= bound)
        };
        if !inside(self.h_src, rows, self.src_bounds.height) || !inside(self.w_src, cols, self.src_bounds.width) {
            return Err(Error::invalid(format!(
                "source window {rows}x{cols} at ({}, {}) exceeds {}",
                self.h_src, self.w_src, self.src_bounds
            )));
        }
        Ok(())
    }
}
