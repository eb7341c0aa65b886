//! Dirty-rect lists passed between paint, flush and present.

use backdrop_hal::{PixelRect, SurfaceSize};
use smallvec::SmallVec;

/// A set of dirty rectangles in window coordinates. Rects may overlap;
/// nothing here merges or normalizes them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirtyRegion {
    rects: SmallVec<[PixelRect; 4]>,
}

impl DirtyRegion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rect(rect: PixelRect) -> Self {
        let mut region = Self::new();
        region.push(rect);
        region
    }

    pub fn full(size: SurfaceSize) -> Self {
        Self::rect(PixelRect::from_size(size.to_i32()))
    }

    pub fn push(&mut self, rect: PixelRect) {
        if !rect.is_empty() {
            self.rects.push(rect);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = PixelRect> + '_ {
        self.rects.iter().copied()
    }

    /// Intersects every rect with `bounds`, dropping the ones that fall
    /// outside entirely.
    pub fn clipped(&self, bounds: PixelRect) -> DirtyRegion {
        DirtyRegion {
            rects: self
                .rects
                .iter()
                .filter_map(|r| r.intersection(&bounds))
                .collect(),
        }
    }

    /// Whether the region is a single rect covering all of `bounds`.
    pub fn covers(&self, bounds: PixelRect) -> bool {
        matches!(self.rects.as_slice(), [r] if r.contains_box(&bounds))
    }
}

impl FromIterator<PixelRect> for DirtyRegion {
    fn from_iter<T: IntoIterator<Item = PixelRect>>(iter: T) -> Self {
        let mut region = Self::new();
        for rect in iter {
            region.push(rect);
        }
        region
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use euclid::default::Point2D;

    fn rect(x0: i32, y0: i32, x1: i32, y1: i32) -> PixelRect {
        PixelRect::new(Point2D::new(x0, y0), Point2D::new(x1, y1))
    }

    #[test]
    fn empty_rects_are_dropped() {
        let mut region = DirtyRegion::new();
        region.push(rect(5, 5, 5, 20));
        assert!(region.is_empty());
    }

    #[test]
    fn clipped_discards_outside_rects() {
        let region: DirtyRegion =
            [rect(-5, -5, 5, 5), rect(100, 100, 110, 110)].into_iter().collect();
        let clipped = region.clipped(rect(0, 0, 50, 50));
        assert_eq!(clipped.iter().collect::<Vec<_>>(), vec![rect(0, 0, 5, 5)]);
    }

    #[test]
    fn covers_requires_single_enclosing_rect() {
        let bounds = rect(0, 0, 800, 600);
        assert!(DirtyRegion::rect(bounds).covers(bounds));
        assert!(DirtyRegion::rect(rect(-10, -10, 900, 700)).covers(bounds));
        assert!(!DirtyRegion::rect(rect(0, 0, 400, 600)).covers(bounds));
        let two: DirtyRegion =
            [rect(0, 0, 400, 600), rect(400, 0, 800, 600)].into_iter().collect();
        assert!(!two.covers(bounds));
    }
}
