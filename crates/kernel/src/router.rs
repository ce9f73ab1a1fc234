//! Position → owning process lookup over a sorted grid of sub-domains.
//!
//! Boxes are sorted x-major, then y, then z (`rank = ix * ny * nz + iy * nz
//! + iz` in 3-D). Within one x-slab all boxes share x bounds, and within one
//! column all boxes share y bounds, which is what lets the walk below skip
//! whole slabs with a single comparison.

use crate::bounds::Aabb;

/// Index stride of every grid axis: `stride[a] = grid[a+1] * ... * grid[D-1]`.
pub fn grid_strides<const D: usize>(grid: &[usize; D]) -> [usize; D] {
    let mut strides = [1usize; D];
    for axis in (0..D.saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * grid[axis + 1];
    }
    strides
}

/// Owning rank of `position`.
///
/// For each axis in order, advance by that axis's stride while the candidate
/// box ends at or below the coordinate. The walk never steps past the last
/// box of an axis, so a position outside the root domain lands in an edge
/// box instead of indexing out of bounds; callers must still reject such
/// positions beforehand.
pub fn route<const D: usize>(position: &[f64; D], grid: &[usize; D], boxes: &[Aabb<D>]) -> usize {
    route_with_strides(position, grid, &grid_strides(grid), boxes)
}

#[inline]
fn route_with_strides<const D: usize>(
    position: &[f64; D],
    grid: &[usize; D],
    strides: &[usize; D],
    boxes: &[Aabb<D>],
) -> usize {
    let mut idx = 0;
    for axis in 0..D {
        let mut steps = 1;
        while steps < grid[axis] && boxes[idx].high[axis] <= position[axis] {
            idx += strides[axis];
            steps += 1;
        }
    }
    idx
}

/// [`route`] with the strides computed once for many lookups.
#[derive(Debug, Clone, Copy)]
pub struct DomainRouter<'a, const D: usize> {
    grid: [usize; D],
    strides: [usize; D],
    boxes: &'a [Aabb<D>],
}

impl<'a, const D: usize> DomainRouter<'a, D> {
    /// Router over `boxes`, which must hold `grid.iter().product()` sorted boxes.
    pub fn new(grid: [usize; D], boxes: &'a [Aabb<D>]) -> Self {
        debug_assert_eq!(grid.iter().product::<usize>(), boxes.len());
        Self {
            grid,
            strides: grid_strides(&grid),
            boxes,
        }
    }

    /// Owning rank of `position`.
    #[inline]
    pub fn route(&self, position: &[f64; D]) -> usize {
        route_with_strides(position, &self.grid, &self.strides, self.boxes)
    }

    /// Number of sub-domains.
    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    /// Return `true` if there are no sub-domains.
    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }
}
