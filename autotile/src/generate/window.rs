use log::debug;

use crate::axis::{iteration_axes, window_node};
use crate::case::{FactorBound, ShapeRegion, SpecialPattern, TilingCase};
use crate::classify::Pattern;
use crate::common::{DimRange, Dtype, DIM_MAX};
use crate::dag::{ComputeDag, NodeId, NodeKind, Window};
use crate::storage::{buffer_bytes, max_live_buffers, BufferPolicy};
use crate::target::{BufferScope, Target, SCOPE_COUNT};

/// Output-height buckets double in size up to this extent; taller outputs
/// share one open bucket.
pub const WINDOW_BUCKET_CAP: u64 = 1024;

const FIRST_BUCKET: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    Pool,
    Conv,
    Matmul,
}

/// Staging arithmetic for a sliding-window or cube node, shared by the case
/// generator and the window scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowGeometry {
    pub node: NodeId,
    pub kind: WindowKind,
    pub window: Window,
    pub block_axis: usize,
    /// The output-row axis. Tiles hold a band of rows along it.
    pub ub_axis: usize,
    pub width_axis: usize,
    pub in_channels: u64,
    pub out_channels: u64,
    pub weight_elems: u64,
    pub in_dtype: Dtype,
    pub out_dtype: Dtype,
    /// Output-sized UB buffers live at once, including epilogue nodes.
    pub out_buffers: u64,
}

impl WindowGeometry {
    pub fn of(dag: &ComputeDag) -> Option<Self> {
        let node = window_node(dag)?;
        let n = dag.node(node);
        let input = dag.node(*n.inputs.first()?);
        let rank = n.rank();
        let out_buffers = u64::from(max_live_buffers(dag, BufferPolicy::SINGLE))
            .saturating_sub(1)
            .max(1);
        let (kind, window) = match (&n.kind, rank) {
            (NodeKind::Pool { window, .. }, 4) => (WindowKind::Pool, *window),
            (NodeKind::Conv2d { window }, 4) => (WindowKind::Conv, *window),
            (_, 4) if n.is_cube() && !matches!(n.kind, NodeKind::Matmul) => {
                (WindowKind::Conv, Window::IDENTITY)
            }
            (_, r) if r >= 2 && n.is_cube() => (WindowKind::Matmul, Window::IDENTITY),
            _ => return None,
        };
        let (block_axis, ub_axis, width_axis) = match kind {
            WindowKind::Pool | WindowKind::Conv => (0, 2, 3),
            WindowKind::Matmul => (0, rank - 2, rank - 1),
        };
        let (in_channels, out_channels, weight_elems) = match kind {
            WindowKind::Pool => {
                let c = n.shape[1].max();
                (c, c, 0)
            }
            WindowKind::Conv => {
                let cin = input.shape[1].max();
                let cout = n.shape[1].max();
                let kernel = u64::from(window.kernel[0]) * u64::from(window.kernel[1]);
                (cin, cout, cout.saturating_mul(cin).saturating_mul(kernel))
            }
            WindowKind::Matmul => {
                let k = input.shape.last().map_or(1, DimRange::max);
                let cols = n.shape[width_axis].max();
                (k, 1, k.saturating_mul(cols))
            }
        };
        Some(WindowGeometry {
            node,
            kind,
            window,
            block_axis,
            ub_axis,
            width_axis,
            in_channels,
            out_channels,
            weight_elems,
            in_dtype: input.dtype,
            out_dtype: n.dtype,
            out_buffers,
        })
    }

    pub fn is_cube(&self) -> bool {
        self.kind != WindowKind::Pool
    }

    /// Input elements staged for an output tile of `rows` by `cols`.
    pub fn input_elems(&self, rows: u64, cols: u64) -> u64 {
        if self.kind == WindowKind::Matmul {
            return rows.saturating_mul(self.in_channels);
        }
        let [kh, kw] = self.window.kernel.map(u64::from);
        let [sh, sw] = self.window.stride.map(u64::from);
        let in_rows = (rows - 1).saturating_mul(sh).saturating_add(kh);
        let in_cols = (cols - 1).saturating_mul(sw).saturating_add(kw);
        self.in_channels
            .saturating_mul(in_rows)
            .saturating_mul(in_cols)
    }

    pub fn output_elems(&self, rows: u64, cols: u64) -> u64 {
        self.out_channels.saturating_mul(rows).saturating_mul(cols)
    }

    /// Bytes per scope for an output tile of `rows` by `cols`.
    pub fn footprint<Tgt: Target>(&self, rows: u64, cols: u64, db: bool) -> [u64; SCOPE_COUNT] {
        let block = Tgt::block_bytes();
        let input = buffer_bytes(self.input_elems(rows, cols), self.in_dtype, db, block);
        let output = buffer_bytes(self.output_elems(rows, cols), self.out_dtype, db, block);
        let mut bytes = [0; SCOPE_COUNT];
        if self.is_cube() {
            bytes[BufferScope::L1.index()] = input
                .saturating_add(buffer_bytes(self.weight_elems, self.in_dtype, false, block));
            bytes[BufferScope::L0c.index()] =
                buffer_bytes(self.output_elems(rows, cols), Dtype::Float32, db, block);
            bytes[BufferScope::Ub.index()] = output.saturating_mul(self.out_buffers);
        } else {
            bytes[BufferScope::Ub.index()] =
                input.saturating_add(output.saturating_mul(self.out_buffers));
        }
        bytes
    }

    pub fn fits<Tgt: Target>(&self, rows: u64, cols: u64, db: bool) -> bool {
        let bytes = self.footprint::<Tgt>(rows, cols, db);
        [BufferScope::Ub, BufferScope::L1, BufferScope::L0c]
            .iter()
            .all(|&s| bytes[s.index()] <= Tgt::capacity(s))
    }

    /// The most output columns of a single-row tile that fit, or 0.
    pub fn max_cols<Tgt: Target>(&self, limit: u64, db: bool) -> u64 {
        largest_fitting(limit, |c| self.fits::<Tgt>(1, c, db))
    }

    pub fn max_rows<Tgt: Target>(&self, limit: u64, cols: u64, db: bool) -> u64 {
        largest_fitting(limit, |r| self.fits::<Tgt>(r, cols, db))
    }
}

/// The largest `n` in `[1, limit]` with `fits(n)`, or 0. `fits` must be
/// monotone decreasing.
fn largest_fitting(limit: u64, fits: impl Fn(u64) -> bool) -> u64 {
    if limit == 0 || !fits(1) {
        return 0;
    }
    let (mut lo, mut hi) = (1, limit);
    while lo < hi {
        let mid = lo + (hi - lo + 1) / 2;
        if fits(mid) {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    lo
}

/// The output-height buckets, in order: `[1,16]`, `[17,32]`, `[33,64]`, ... up
/// to [WINDOW_BUCKET_CAP], then one open bucket.
pub fn height_buckets() -> Vec<DimRange> {
    let mut buckets = vec![DimRange::new(1, FIRST_BUCKET)];
    let mut hi = FIRST_BUCKET;
    while hi < WINDOW_BUCKET_CAP {
        buckets.push(DimRange::new(hi + 1, hi * 2));
        hi *= 2;
    }
    buckets.push(DimRange::new(hi + 1, DIM_MAX));
    buckets
}

/// Cases for a pooling or cube DAG, one set per output-height bucket.
///
/// Returns `None` when the target has no unit to run the pattern on.
pub(super) fn window_cases<Tgt: Target>(dag: &ComputeDag, pattern: Pattern) -> Option<Vec<TilingCase>> {
    if pattern == Pattern::Cube && !Tgt::has_cube_unit() {
        return None;
    }
    let geometry = WindowGeometry::of(dag)?;
    let dims = iteration_axes(dag, pattern, None)
        .iter()
        .map(|a| a.extent)
        .collect::<Vec<_>>();
    let height = dims[geometry.ub_axis];
    let width = dims[geometry.width_axis];

    let mut cases = vec![];
    for (idx, bucket) in height_buckets().into_iter().enumerate() {
        let Some(rows) = height.intersect(&bucket) else {
            continue;
        };
        let special = SpecialPattern::WindowBucket {
            kernel: geometry.window.kernel,
            stride: geometry.window.stride,
            bucket: idx as u32,
        };
        // Widths the double-buffered case admits are left out of the
        // single-buffered one, which would never be selected for them.
        let mut covered_cols = 0;
        for db in [true, false] {
            let max_cols = geometry.max_cols::<Tgt>(width.max(), db);
            let Some(cols) = width.clamp_to(covered_cols + 1, max_cols) else {
                debug!("bucket {} (db={}): no output column fits", bucket, db);
                continue;
            };
            covered_cols = cols.max();
            let max_rows = geometry.max_rows::<Tgt>(rows.max(), cols.max(), db);
            let mut region_dims = dims.clone();
            region_dims[geometry.ub_axis] = rows;
            region_dims[geometry.width_axis] = cols;
            cases.push(TilingCase {
                pattern,
                block_split_axis: Some(geometry.block_axis as u8),
                block_factor_bound: FactorBound::new(1, dims[geometry.block_axis].max()),
                ub_split_axis: Some(geometry.ub_axis as u8),
                ub_factor_bound: FactorBound::new(1, max_rows),
                is_atomic: false,
                is_db: db,
                special,
                region: ShapeRegion::new(region_dims),
            });
        }
    }
    Some(cases)
}

/// The tile width of a window fallback case: single output rows split along
/// the width axis.
pub(crate) fn fallback_cols<Tgt: Target>(dag: &ComputeDag, pattern: Pattern) -> u64 {
    let Some(geometry) = WindowGeometry::of(dag) else {
        return 1;
    };
    let width = iteration_axes(dag, pattern, None)[geometry.width_axis].extent;
    geometry.max_cols::<Tgt>(width.max(), false).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::PoolMode;
    use crate::target::{CloudTarget, EdgeTarget};

    fn max_pool(max_size: u64) -> ComputeDag {
        let mut b = ComputeDag::builder();
        let x = b.placeholder(
            vec![
                DimRange::new(1, 8),
                DimRange::known(16),
                DimRange::new(8, max_size),
                DimRange::new(8, max_size),
            ],
            Dtype::Float16,
        );
        let window = Window {
            kernel: [3, 3],
            stride: [2, 2],
            pad: [0, 0, 0, 0],
        };
        let p = b.pool(PoolMode::Max, x, window);
        b.output(p);
        b.build().unwrap()
    }

    fn matmul() -> ComputeDag {
        let mut b = ComputeDag::builder();
        let a = b.placeholder(vec![DimRange::new(1, 4096), DimRange::known(256)], Dtype::Float16);
        let w = b.placeholder(vec![DimRange::known(256), DimRange::known(128)], Dtype::Float16);
        let m = b.matmul(a, w);
        b.output(m);
        b.build().unwrap()
    }

    #[test]
    fn test_height_buckets_tile_the_range() {
        let buckets = height_buckets();
        assert_eq!(buckets[0], DimRange::new(1, 16));
        assert_eq!(buckets[1], DimRange::new(17, 32));
        for pair in buckets.windows(2) {
            assert_eq!(pair[0].max() + 1, pair[1].min());
        }
        assert_eq!(buckets.last().map(DimRange::max), Some(DIM_MAX));
    }

    #[test]
    fn test_pool_cases_per_bucket() {
        let dag = max_pool(256);
        let cases = window_cases::<CloudTarget>(&dag, Pattern::Pooling).unwrap();
        // Output heights span [3, 127]: buckets [1,16] .. [65,128].
        let buckets = cases
            .iter()
            .filter_map(|c| match c.special {
                SpecialPattern::WindowBucket { bucket, .. } => Some(bucket),
                _ => None,
            })
            .collect::<std::collections::BTreeSet<_>>();
        assert_eq!(buckets.into_iter().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        for case in &cases {
            let geometry = WindowGeometry::of(&dag).unwrap();
            let cols = case.region.dims[3].max();
            assert!(geometry.fits::<CloudTarget>(case.ub_factor_bound.max, cols, case.is_db));
        }
    }

    #[test]
    fn test_cube_needs_cube_unit() {
        let dag = matmul();
        assert!(window_cases::<EdgeTarget>(&dag, Pattern::Cube).is_none());
        let cases = window_cases::<CloudTarget>(&dag, Pattern::Cube).unwrap();
        assert!(!cases.is_empty());
        assert!(cases.iter().all(|c| c.ub_split_axis == Some(0)));
    }

    #[test]
    fn test_db_and_single_buffer_regions_are_disjoint() {
        let dag = max_pool(4096);
        let cases = window_cases::<CloudTarget>(&dag, Pattern::Pooling).unwrap();
        for pair in cases.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if a.special != b.special {
                continue;
            }
            assert!(a.is_db && !b.is_db);
            assert!(a.region.dims[3].max() < b.region.dims[3].min());
        }
        // Every bucket still admits the narrowest output.
        let geometry = WindowGeometry::of(&dag).unwrap();
        let narrowest = iteration_axes(&dag, Pattern::Pooling, None)[geometry.width_axis]
            .extent
            .min();
        for case in &cases {
            assert!(cases
                .iter()
                .any(|c| c.special == case.special && c.region.dims[3].contains(narrowest)));
        }
    }

    #[test]
    fn test_largest_fitting() {
        assert_eq!(largest_fitting(100, |n| n <= 37), 37);
        assert_eq!(largest_fitting(10, |n| n <= 37), 10);
        assert_eq!(largest_fitting(10, |_| false), 0);
    }
}
