//! Axis-aligned boxes and per-axis boundary conditions.
//!
//! Every box is half-open: a point belongs to `[low, high)` on each axis, so
//! a coordinate exactly equal to a shared face belongs to the upper neighbor.

/// Boundary condition of one axis of the root domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum BoundaryKind {
    /// Particles leaving through one face re-enter through the opposite face.
    Periodic,
    /// No wrapping; positions pass through unchanged.
    Open,
}

impl BoundaryKind {
    /// Return `true` for [`BoundaryKind::Periodic`].
    pub fn is_periodic(self) -> bool {
        matches!(self, BoundaryKind::Periodic)
    }
}

/// Half-open axis-aligned box in `D` dimensions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb<const D: usize> {
    /// Inclusive lower corner.
    pub low: [f64; D],
    /// Exclusive upper corner.
    pub high: [f64; D],
}

impl<const D: usize> Aabb<D> {
    /// Create a box from its lower and upper corners.
    pub fn new(low: [f64; D], high: [f64; D]) -> Self {
        Self { low, high }
    }

    /// Edge length along every axis.
    pub fn full_length(&self) -> [f64; D] {
        std::array::from_fn(|k| self.high[k] - self.low[k])
    }

    /// Return `true` if `pos` lies in `[low, high)` on every axis.
    ///
    /// NaN coordinates are never contained.
    #[inline]
    pub fn contains(&self, pos: &[f64; D]) -> bool {
        (0..D).all(|k| self.low[k] <= pos[k] && pos[k] < self.high[k])
    }

    /// Return `true` if `other` lies entirely within this box.
    pub fn encloses(&self, other: &Aabb<D>) -> bool {
        (0..D).all(|k| self.low[k] <= other.low[k] && other.high[k] <= self.high[k])
    }

    /// Finite corners with `low < high` on every axis.
    pub fn is_valid(&self) -> bool {
        (0..D).all(|k| {
            self.low[k].is_finite() && self.high[k].is_finite() && self.low[k] < self.high[k]
        })
    }

    /// Product of the edge lengths.
    pub fn volume(&self) -> f64 {
        self.full_length().iter().product()
    }

    /// Geometric center.
    pub fn center(&self) -> [f64; D] {
        std::array::from_fn(|k| 0.5 * (self.low[k] + self.high[k]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_is_half_open() {
        let b = Aabb::new([0.0, 0.0, 0.0], [1.0, 1.0, 1.0]);
        assert!(b.contains(&[0.0, 0.0, 0.0]));
        assert!(b.contains(&[0.999, 0.5, 0.5]));
        assert!(!b.contains(&[1.0, 0.5, 0.5]));
        assert!(!b.contains(&[-1e-12, 0.5, 0.5]));
        assert!(!b.contains(&[f64::NAN, 0.5, 0.5]));
    }

    #[test]
    fn validity_and_volume() {
        let b = Aabb::new([0.0, -1.0], [2.0, 1.0]);
        assert!(b.is_valid());
        assert_eq!(b.volume(), 4.0);
        assert_eq!(b.center(), [1.0, 0.0]);

        let degenerate = Aabb::new([0.0, 0.0], [0.0, 1.0]);
        assert!(!degenerate.is_valid());
    }

    #[test]
    fn encloses_sub_box() {
        let root = Aabb::new([0.0, 0.0], [1.0, 1.0]);
        assert!(root.encloses(&Aabb::new([0.5, 0.0], [1.0, 0.5])));
        assert!(!root.encloses(&Aabb::new([0.5, 0.0], [1.5, 0.5])));
    }
}
