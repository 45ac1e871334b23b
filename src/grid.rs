use crate::protocol::{DEPTH_HEIGHT, DEPTH_WIDTH};
use crate::store::DepthFrame;

/// Occupancy counters over a box of `dims[0] x dims[1] x dims[2]` cells,
/// centred on the origin of the shared frame.
///
/// Cell `(x, y, z)` lives at `z * dx * dy + y * dx + x`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoxelGrid {
    dims: [usize; 3],
    cells: Vec<u32>,
}

impl VoxelGrid {
    pub fn new(dims: [usize; 3]) -> VoxelGrid {
        VoxelGrid {
            dims,
            cells: vec![0; dims[0] * dims[1] * dims[2]],
        }
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    #[inline]
    pub fn index(&self, x: usize, y: usize, z: usize) -> usize {
        z * self.dims[0] * self.dims[1] + y * self.dims[0] + x
    }

    pub fn get(&self, x: usize, y: usize, z: usize) -> u32 {
        self.cells[self.index(x, y, z)]
    }

    pub fn clear(&mut self) {
        self.cells.fill(0);
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.cells
    }

    /// Sum of all counters.
    pub fn total(&self) -> u64 {
        self.cells.iter().map(|&c| c as u64).sum()
    }

    /// Number of non-empty cells.
    pub fn occupied(&self) -> usize {
        self.cells.iter().filter(|&&c| c != 0).count()
    }

    /// Cell containing a point of the shared frame, or `None` outside the box.
    #[inline]
    pub fn cell_of(&self, p: [f64; 3], resolution: f64) -> Option<[usize; 3]> {
        let mut cell = [0usize; 3];
        for axis in 0..3 {
            let dim = self.dims[axis];
            let i = (p[axis] / resolution + dim as f64 / 2.0 + 0.5).floor();
            // NaN fails both comparisons.
            if !(i >= 0.0 && i < dim as f64) {
                return None;
            }
            cell[axis] = i as usize;
        }
        Some(cell)
    }

    /// Project every sample of one sensor's frame into the grid.
    ///
    /// Samples without a reading and samples landing outside the box are
    /// skipped. Returns the number of samples counted.
    pub fn accumulate(&mut self, frame: &DepthFrame, resolution: f64) -> usize {
        let pixel = frame.intrinsics.reference_pixel_size;
        let ref_dist = frame.intrinsics.reference_distance;
        let half_w = (DEPTH_WIDTH / 2) as f64;
        let half_h = (DEPTH_HEIGHT / 2) as f64;
        let mut counted = 0;

        for (row, line) in frame.depth.chunks_exact(DEPTH_WIDTH).enumerate() {
            let dy = row as f64 - half_h + 0.5;
            for (col, &d) in line.iter().enumerate() {
                if d == 0 {
                    continue;
                }
                let z = d as f64 + ref_dist;
                let factor = 2.0 * pixel * z / ref_dist;
                let x = (col as f64 - half_w + 0.5) * factor;
                let y = dy * factor;

                let world = frame.transform.apply([x, y, z]);
                if let Some([cx, cy, cz]) = self.cell_of(world, resolution) {
                    let idx = self.index(cx, cy, cz);
                    self.cells[idx] = self.cells[idx].saturating_add(1);
                    counted += 1;
                }
            }
        }
        counted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::ExtrinsicTransform;
    use crate::types::Intrinsics;
    use std::f64::consts::PI;

    fn frame(transform: ExtrinsicTransform) -> DepthFrame {
        DepthFrame {
            depth: vec![0; DEPTH_WIDTH * DEPTH_HEIGHT],
            intrinsics: Intrinsics::default(),
            transform,
        }
    }

    fn at(row: usize, col: usize) -> usize {
        row * DEPTH_WIDTH + col
    }

    #[test]
    fn test_index_layout() {
        let grid = VoxelGrid::new([4, 3, 2]);
        assert_eq!(grid.as_slice().len(), 24);
        assert_eq!(grid.index(1, 2, 1), 12 + 8 + 1);
    }

    #[test]
    fn test_cell_of_bounds() {
        let grid = VoxelGrid::new([10, 10, 10]);
        assert_eq!(grid.cell_of([0.0, 0.0, 0.0], 50.0), Some([5, 5, 5]));
        assert_eq!(grid.cell_of([-250.0, 0.0, 224.0], 50.0), Some([0, 5, 9]));
        assert_eq!(grid.cell_of([-276.0, 0.0, 0.0], 50.0), None);
        assert_eq!(grid.cell_of([0.0, 225.0, 0.0], 50.0), None);
        assert_eq!(grid.cell_of([f64::NAN, 0.0, 0.0], 50.0), None);
    }

    #[test]
    fn test_counts_are_conserved() {
        let mut grid = VoxelGrid::new([40, 40, 40]);
        let mut f = frame(ExtrinsicTransform::default());
        for (i, d) in f.depth.iter_mut().enumerate().step_by(997) {
            *d = 300 + (i % 400) as u16;
        }
        let counted = grid.accumulate(&f, 50.0);
        assert!(counted > 0);
        assert_eq!(grid.total(), counted as u64);
    }

    #[test]
    fn test_zero_depth_is_skipped() {
        let mut grid = VoxelGrid::new([10, 10, 10]);
        let f = frame(ExtrinsicTransform::default());
        assert_eq!(grid.accumulate(&f, 50.0), 0);
        assert_eq!(grid.total(), 0);
    }

    #[test]
    fn test_out_of_bounds_leaves_grid_untouched() {
        let mut grid = VoxelGrid::new([10, 10, 10]);
        let mut f = frame(ExtrinsicTransform::from_pose(0.0, 0.0, 0.0, 0.0, 10_000.0));
        f.depth.fill(800);
        assert_eq!(grid.accumulate(&f, 50.0), 0);
        assert!(grid.as_slice().iter().all(|&c| c == 0));
    }

    #[test]
    fn test_centre_sample_lands_in_centroid() {
        let mut grid = VoxelGrid::new([10, 10, 10]);
        // z = 100 + 120 mm; shift it back onto the origin.
        let mut f = frame(ExtrinsicTransform::from_pose(0.0, 0.0, 0.0, 0.0, -220.0));
        f.depth[at(240, 320)] = 100;

        assert_eq!(grid.accumulate(&f, 50.0), 1);
        assert_eq!(grid.get(5, 5, 5), 1);
        assert_eq!(grid.total(), 1);
    }

    #[test]
    fn test_untranslated_sample_lands_in_front() {
        let mut grid = VoxelGrid::new([10, 10, 10]);
        let mut f = frame(ExtrinsicTransform::default());
        f.depth[at(240, 320)] = 100;
        grid.accumulate(&f, 50.0);
        assert_eq!(grid.get(5, 5, 9), 1);
    }

    #[test]
    fn test_opposite_sensors_mirror() {
        let mut a = VoxelGrid::new([10, 10, 10]);
        let mut b = VoxelGrid::new([10, 10, 10]);
        let mut fa = frame(ExtrinsicTransform::from_pose(0.0, 0.0, 0.0, 0.0, 0.0));
        let mut fb = frame(ExtrinsicTransform::from_pose(PI, 0.0, 0.0, 0.0, 0.0));
        fa.depth[at(240, 400)] = 100;
        fb.depth[at(240, 400)] = 100;

        assert_eq!(a.accumulate(&fa, 50.0), 1);
        assert_eq!(b.accumulate(&fb, 50.0), 1);

        let find = |g: &VoxelGrid| {
            let idx = g.as_slice().iter().position(|&c| c == 1).unwrap();
            [idx % 10, (idx / 10) % 10, idx / 100]
        };
        let ca = find(&a);
        let cb = find(&b);
        assert_eq!(ca, [6, 5, 9]);
        assert_eq!(ca[0] + cb[0], 10);
        assert_eq!(ca[1], cb[1]);
        assert_eq!(ca[2] + cb[2], 10);
    }
}
