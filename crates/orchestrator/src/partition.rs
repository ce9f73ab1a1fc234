//! Spatial decomposition of the root domain into one box per process.
//!
//! A [`DomainPartition`] is a logical grid of axis-aligned boxes sorted
//! x-major. Cuts are hierarchical: all boxes of one x-slab share their x
//! bounds, all boxes of one column within a slab share their y bounds, and
//! so on. That is exactly the structure [`DomainRouter`] walks.

use particle_kernel::{grid_strides, Aabb, BoundaryKind, DomainRouter, KernelError};

type KResult<T> = std::result::Result<T, KernelError>;

/// Sub-domain boxes of every process plus the root domain they tile.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainPartition<const D: usize> {
    grid: [usize; D],
    boxes: Vec<Aabb<D>>,
    root: Aabb<D>,
    boundary: [BoundaryKind; D],
}

impl<const D: usize> DomainPartition<D> {
    /// Validate and build a partition.
    ///
    /// `boxes[rank]` is the box of process `rank`. The boxes must tile `root`
    /// hierarchically (see the module docs) with faces shared exactly.
    pub fn new(
        grid: [usize; D],
        boxes: Vec<Aabb<D>>,
        root: Aabb<D>,
        boundary: [BoundaryKind; D],
    ) -> KResult<Self> {
        let partition = Self {
            grid,
            boxes,
            root,
            boundary,
        };
        partition.check_tiling()?;
        Ok(partition)
    }

    /// Equal-width cuts along every axis.
    pub fn uniform(root: Aabb<D>, grid: [usize; D], boundary: [BoundaryKind; D]) -> KResult<Self> {
        if grid.iter().any(|&n| n == 0) {
            return Err(KernelError::InvalidPartition(format!(
                "grid {:?} has an empty axis",
                grid
            )));
        }
        let cuts: [Vec<f64>; D] = std::array::from_fn(|axis| {
            let n = grid[axis];
            let (low, high) = (root.low[axis], root.high[axis]);
            (0..=n)
                .map(|i| {
                    if i == n {
                        high
                    } else {
                        low + (high - low) * i as f64 / n as f64
                    }
                })
                .collect()
        });
        let strides = grid_strides(&grid);
        let total: usize = grid.iter().product();
        let boxes = (0..total)
            .map(|rank| {
                let index = multi_index(rank, &grid, &strides);
                Aabb::new(
                    std::array::from_fn(|a| cuts[a][index[a]]),
                    std::array::from_fn(|a| cuts[a][index[a] + 1]),
                )
            })
            .collect();
        Self::new(grid, boxes, root, boundary)
    }

    fn check_tiling(&self) -> KResult<()> {
        let invalid = |msg: String| Err(KernelError::InvalidPartition(msg));
        if !self.root.is_valid() {
            return invalid(format!("root domain {:?} is degenerate", self.root));
        }
        let expected: usize = self.grid.iter().product();
        if expected == 0 || self.boxes.len() != expected {
            return invalid(format!(
                "grid {:?} needs {} boxes, got {}",
                self.grid,
                expected,
                self.boxes.len()
            ));
        }
        let strides = grid_strides(&self.grid);
        for (rank, b) in self.boxes.iter().enumerate() {
            if !b.is_valid() {
                return invalid(format!("box {} {:?} is degenerate", rank, b));
            }
            let index = multi_index(rank, &self.grid, &strides);
            let mut slab_base = 0;
            for a in 0..D {
                slab_base += index[a] * strides[a];
                let slab = &self.boxes[slab_base];
                if b.low[a] != slab.low[a] || b.high[a] != slab.high[a] {
                    return invalid(format!(
                        "box {} does not share axis-{} bounds with box {}",
                        rank, a, slab_base
                    ));
                }
                let lower_face = if index[a] == 0 {
                    self.root.low[a]
                } else {
                    self.boxes[rank - strides[a]].high[a]
                };
                if b.low[a] != lower_face {
                    return invalid(format!("box {} leaves a gap below it on axis {}", rank, a));
                }
                if index[a] + 1 == self.grid[a] && b.high[a] != self.root.high[a] {
                    return invalid(format!(
                        "box {} does not reach the root's upper face on axis {}",
                        rank, a
                    ));
                }
            }
        }
        Ok(())
    }

    /// Process grid shape.
    pub fn grid(&self) -> [usize; D] {
        self.grid
    }

    /// Boxes in rank order.
    pub fn boxes(&self) -> &[Aabb<D>] {
        &self.boxes
    }

    /// Box owned by `rank`.
    pub fn box_of(&self, rank: usize) -> Option<&Aabb<D>> {
        self.boxes.get(rank)
    }

    /// Root domain.
    pub fn root(&self) -> &Aabb<D> {
        &self.root
    }

    /// Boundary kind of every axis.
    pub fn boundary(&self) -> &[BoundaryKind; D] {
        &self.boundary
    }

    /// Number of processes the partition is built for.
    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    /// Always `false` for a validated partition.
    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    /// Router over these boxes.
    pub fn router(&self) -> DomainRouter<'_, D> {
        DomainRouter::new(self.grid, &self.boxes)
    }

    /// Rank owning `position` (which must lie inside the root domain).
    pub fn owner_of(&self, position: &[f64; D]) -> usize {
        self.router().route(position)
    }
}

fn multi_index<const D: usize>(rank: usize, grid: &[usize; D], strides: &[usize; D]) -> [usize; D] {
    std::array::from_fn(|a| (rank / strides[a]) % grid[a])
}

/// Computes a new partition from globally gathered sample positions.
///
/// Every rank calls this with the same samples and must get the same result.
pub trait Rebalancer<const D: usize> {
    /// New partition with the grid, root and boundaries of `current`.
    fn rebalance(
        &self,
        samples: &[[f64; D]],
        current: &DomainPartition<D>,
    ) -> KResult<DomainPartition<D>>;
}

/// Hierarchical sample-quantile decomposition.
///
/// Cuts x so every slab holds the same share of samples, then y within each
/// slab, then z within each column. Outer faces stay pinned to the root.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuantileRebalancer;

impl QuantileRebalancer {
    fn split<const D: usize>(
        axis: usize,
        samples: &mut [[f64; D]],
        region: Aabb<D>,
        grid: &[usize; D],
        out: &mut Vec<Aabb<D>>,
    ) {
        samples.sort_by(|p, q| p[axis].total_cmp(&q[axis]));
        let n = grid[axis];
        let cuts = quantile_cuts(samples, axis, n, region.low[axis], region.high[axis]);

        for i in 0..n {
            let mut slab = region;
            slab.low[axis] = cuts[i];
            slab.high[axis] = cuts[i + 1];
            if axis + 1 == D {
                out.push(slab);
                continue;
            }
            let lo = samples.partition_point(|s| s[axis] < cuts[i]);
            let hi = if i + 1 == n {
                samples.len()
            } else {
                samples.partition_point(|s| s[axis] < cuts[i + 1])
            };
            Self::split(axis + 1, &mut samples[lo..hi], slab, grid, out);
        }
    }
}

/// `n + 1` strictly increasing cuts from `low` to `high`.
///
/// Interior cuts sit halfway between neighboring samples at the `i/n`
/// quantiles. A cut that would not be strictly inside `(previous, high)`
/// falls back to an even split of what is left.
fn quantile_cuts<const D: usize>(
    sorted: &[[f64; D]],
    axis: usize,
    n: usize,
    low: f64,
    high: f64,
) -> Vec<f64> {
    let m = sorted.len();
    let mut cuts = Vec::with_capacity(n + 1);
    cuts.push(low);
    for i in 1..n {
        let prev = cuts[i - 1];
        let q = i * m / n;
        let candidate = if q > 0 && q < m {
            0.5 * (sorted[q - 1][axis] + sorted[q][axis])
        } else {
            f64::NAN
        };
        let cut = if prev < candidate && candidate < high {
            candidate
        } else {
            prev + (high - prev) / (n - i + 1) as f64
        };
        cuts.push(cut);
    }
    cuts.push(high);
    cuts
}

impl<const D: usize> Rebalancer<D> for QuantileRebalancer {
    fn rebalance(
        &self,
        samples: &[[f64; D]],
        current: &DomainPartition<D>,
    ) -> KResult<DomainPartition<D>> {
        let grid = current.grid();
        let root = *current.root();
        let mut inside: Vec<[f64; D]> = samples
            .iter()
            .copied()
            .filter(|s| root.contains(s))
            .collect();
        let mut boxes = Vec::with_capacity(current.len());
        Self::split(0, &mut inside, root, &grid, &mut boxes);
        tracing::debug!(
            "rebalanced {} boxes from {} samples",
            boxes.len(),
            inside.len()
        );
        DomainPartition::new(grid, boxes, root, *current.boundary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const PERIODIC: [BoundaryKind; 3] = [BoundaryKind::Periodic; 3];

    fn unit() -> Aabb<3> {
        Aabb::new([0.0; 3], [1.0; 3])
    }

    #[test]
    fn uniform_quadrants() {
        let p = DomainPartition::uniform(unit(), [2, 2, 1], PERIODIC).unwrap();
        assert_eq!(p.len(), 4);
        assert_eq!(p.boxes()[1], Aabb::new([0.0, 0.5, 0.0], [0.5, 1.0, 1.0]));
        assert_eq!(p.boxes()[2], Aabb::new([0.5, 0.0, 0.0], [1.0, 0.5, 1.0]));
        assert_eq!(p.owner_of(&[0.75, 0.75, 0.2]), 3);
    }

    #[test]
    fn uniform_rejects_empty_axis() {
        assert!(DomainPartition::uniform(unit(), [2, 0, 1], PERIODIC).is_err());
    }

    #[test]
    fn gaps_and_wrong_counts_are_rejected() {
        let good = DomainPartition::uniform(unit(), [2, 1, 1], PERIODIC).unwrap();
        let mut boxes = good.boxes().to_vec();
        boxes[1].low[0] = 0.6;
        assert!(DomainPartition::new([2, 1, 1], boxes, unit(), PERIODIC).is_err());

        let boxes = good.boxes()[..1].to_vec();
        assert!(DomainPartition::new([2, 1, 1], boxes, unit(), PERIODIC).is_err());
    }

    #[test]
    fn slab_bounds_must_be_shared() {
        // Box 1 stops short of the root's upper y face.
        let root = Aabb::new([0.0; 2], [1.0; 2]);
        let boxes = vec![
            Aabb::new([0.0, 0.0], [0.5, 1.0]),
            Aabb::new([0.5, 0.0], [1.0, 0.4]),
            Aabb::new([0.5, 0.5], [1.0, 1.0]),
        ];
        let err = DomainPartition::new([3, 1], boxes, root, [BoundaryKind::Open; 2]);
        assert!(err.is_err());
    }

    #[test]
    fn quantile_balances_skewed_samples() {
        let mut rng = StdRng::seed_from_u64(1);
        // Dense cluster in the lower-left corner.
        let samples: Vec<[f64; 3]> = (0..4000)
            .map(|_| {
                let x: f64 = rng.random::<f64>().powi(3);
                let y: f64 = rng.random::<f64>().powi(2);
                [x, y, rng.random()]
            })
            .collect();
        let current = DomainPartition::uniform(unit(), [2, 2, 2], PERIODIC).unwrap();
        let next = QuantileRebalancer.rebalance(&samples, &current).unwrap();

        let mut counts = vec![0usize; next.len()];
        for s in &samples {
            counts[next.owner_of(s)] += 1;
        }
        for c in counts {
            assert!((450..=550).contains(&c), "unbalanced: {c}");
        }
    }

    #[test]
    fn no_samples_falls_back_to_even_cuts() {
        let current = DomainPartition::uniform(unit(), [4, 1, 1], PERIODIC).unwrap();
        let next = QuantileRebalancer.rebalance(&[], &current).unwrap();
        assert_eq!(next, current);
    }

    #[test]
    fn duplicate_samples_still_give_valid_cuts() {
        let samples = vec![[0.5, 0.5, 0.5]; 100];
        let current = DomainPartition::uniform(unit(), [4, 2, 1], PERIODIC).unwrap();
        let next = QuantileRebalancer.rebalance(&samples, &current).unwrap();
        assert!(next.boxes().iter().all(|b| b.is_valid()));
    }
}
