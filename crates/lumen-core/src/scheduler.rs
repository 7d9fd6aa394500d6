//! Tile planning
//!
//! The scheduler sees a pipeline as a list of [`StageGeometry`] values: how
//! far each stage reads around an output pixel, whether it changes
//! resolution, and how many bytes one pixel of its output occupies. From that
//! it derives the resolution of every intermediate result (its domain) and,
//! for any rectangle of the final output, the region each stage has to
//! produce.
//!
//! ```text
//!   slot 0            slot 1            slot n
//!   caller source ──► arena tensor ──► … caller destination
//!          stage 0           stage 1
//! ```
//!
//! Regions are traced backward from the output rectangle, grown by each
//! stage's halo and clipped to the stage domain. Clipping keeps tiled results
//! identical to a single full-image pass: anything cut away lies outside the
//! image, where convolutions read zeros either way.

use crate::error::{Error, Result};
use crate::tile::{Extent, Tile};
use std::ops::Range;

/// Resolution change performed by a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resample {
    Same,
    /// Halves both dimensions (2x2 pooling)
    Down2,
    /// Doubles both dimensions (nearest upsampling)
    Up2,
}

impl Resample {
    fn output_len(self, len: usize) -> Option<usize> {
        match self {
            Resample::Same => Some(len),
            Resample::Down2 => (len % 2 == 0).then_some(len / 2),
            Resample::Up2 => len.checked_mul(2),
        }
    }

    /// Input positions a stage reads to produce `out`, before clipping
    fn input_span(self, out: &Range<usize>, halo: usize) -> (isize, isize) {
        let (start, end) = match self {
            Resample::Same => (out.start, out.end),
            Resample::Down2 => (2 * out.start, 2 * out.end),
            Resample::Up2 => (out.start / 2, out.end.div_ceil(2)),
        };
        (start as isize - halo as isize, end as isize + halo as isize)
    }

    /// Source position of the first output pixel in the operator's sampling
    /// grid, given where the source buffer starts in the stage domain
    fn anchor(self, out_start: usize, origin_in: usize) -> isize {
        let (out, origin) = (out_start as isize, origin_in as isize);
        match self {
            Resample::Same => out - origin,
            Resample::Down2 => 2 * out - origin,
            Resample::Up2 => out - 2 * origin,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageGeometry {
    /// Pixels read on each side of the output position
    pub halo: usize,
    pub resample: Resample,
    /// Bytes per pixel of the stage's output tensor
    pub bytes_per_pixel: usize,
}

impl StageGeometry {
    pub const fn new(halo: usize, resample: Resample, bytes_per_pixel: usize) -> Self {
        Self {
            halo,
            resample,
            bytes_per_pixel,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Axis {
    Rows,
    Cols,
}

impl Axis {
    fn len(self, extent: Extent) -> usize {
        match self {
            Axis::Rows => extent.height,
            Axis::Cols => extent.width,
        }
    }

    fn with(self, extent: Extent, len: usize) -> Extent {
        match self {
            Axis::Rows => Extent::new(len, extent.width),
            Axis::Cols => Extent::new(extent.height, len),
        }
    }
}

fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

/// Stage list plus the domain of every slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineGeometry {
    stages: Vec<StageGeometry>,
    domains: Vec<Extent>,
}

impl PipelineGeometry {
    /// # Errors
    ///
    /// `InvalidArgument` for an empty input or stage list, or when a
    /// downsampling stage meets an odd dimension.
    pub fn new(input: Extent, stages: Vec<StageGeometry>) -> Result<Self> {
        if input.area() == 0 {
            return Err(Error::invalid(format!("pipeline input {input} is empty")));
        }
        if stages.is_empty() {
            return Err(Error::invalid("pipeline has no stages"));
        }

        let mut domains = Vec::with_capacity(stages.len() + 1);
        domains.push(input);
        for (index, stage) in stages.iter().enumerate() {
            let last = domains[index];
            let next = stage
                .resample
                .output_len(last.height)
                .zip(stage.resample.output_len(last.width))
                .map(|(height, width)| Extent::new(height, width))
                .ok_or_else(|| {
                    Error::invalid(format!("stage {index} cannot apply {:?} to {last}", stage.resample))
                })?;
            domains.push(next);
        }
        Ok(Self { stages, domains })
    }

    pub fn stages(&self) -> &[StageGeometry] {
        &self.stages
    }

    /// Domain of every slot: the pipeline input, then each stage's output
    pub fn domains(&self) -> &[Extent] {
        &self.domains
    }

    pub fn input(&self) -> Extent {
        self.domains[0]
    }

    pub fn output(&self) -> Extent {
        self.domains[self.stages.len()]
    }

    /// Tile sizes are multiples of this: 2 to the number of pooling levels
    pub fn alignment(&self) -> usize {
        let levels = self.stages.iter().filter(|s| s.resample == Resample::Down2).count();
        1usize << levels.min(usize::BITS as usize - 1)
    }

    pub fn total_halo(&self) -> usize {
        self.stages.iter().map(|s| s.halo).sum()
    }

    /// Smallest tile the planner will try, clamped to the output
    pub fn floor(&self, min_tile: usize) -> Extent {
        let alignment = self.alignment();
        let edge = align_up(min_tile.max(self.total_halo()).max(alignment).max(1), alignment);
        let output = self.output();
        Extent::new(edge.min(output.height), edge.min(output.width))
    }

    /// Region of every slot needed to produce `out` along one axis
    fn slot_ranges(&self, axis: Axis, out: Range<usize>) -> Vec<Range<usize>> {
        let n = self.stages.len();
        let mut ranges = vec![0..0; n + 1];
        ranges[n] = out;
        for s in (0..n).rev() {
            let stage = &self.stages[s];
            let (start, end) = stage.resample.input_span(&ranges[s + 1], stage.halo);
            let len = axis.len(self.domains[s]);
            let end = (end.max(0) as usize).min(len);
            let start = (start.max(0) as usize).min(end);
            ranges[s] = start..end;
        }
        ranges
    }

    /// Largest region of each slot over all tiles of edge `tile` along `axis`
    fn max_lengths(&self, axis: Axis, tile: usize) -> Vec<usize> {
        let len = axis.len(self.output());
        let mut max = vec![0; self.stages.len() + 1];
        for start in (0..len).step_by(tile.max(1)) {
            let ranges = self.slot_ranges(axis, start..(start + tile).min(len));
            for (m, range) in max.iter_mut().zip(&ranges) {
                *m = (*m).max(range.len());
            }
        }
        max
    }

    /// Allocation extent of every intermediate slot for tiles of size `tile`
    pub fn stage_extents(&self, tile: Extent) -> Vec<Extent> {
        let rows = self.max_lengths(Axis::Rows, tile.height);
        let cols = self.max_lengths(Axis::Cols, tile.width);
        (1..self.stages.len()).map(|k| Extent::new(rows[k], cols[k])).collect()
    }

    /// Bytes the run allocates for intermediates with tiles of size `tile`
    pub fn peak_bytes(&self, tile: Extent) -> usize {
        self.stage_extents(tile)
            .iter()
            .zip(&self.stages)
            .fold(0usize, |sum, (extent, stage)| {
                sum.saturating_add(stage.bytes_per_pixel.saturating_mul(extent.area()))
            })
    }

    /// Tiles handed to each stage, in stage order, for one output rectangle
    pub fn stage_tiles(&self, rect: &TileRect) -> Vec<Tile> {
        let n = self.stages.len();
        let rows = self.slot_ranges(Axis::Rows, rect.h..rect.h + rect.height);
        let cols = self.slot_ranges(Axis::Cols, rect.w..rect.w + rect.width);

        (0..n)
            .map(|s| {
                let resample = self.stages[s].resample;
                let (rows_in, cols_in) = (&rows[s], &cols[s]);
                let (rows_out, cols_out) = (&rows[s + 1], &cols[s + 1]);
                // The caller's source is bound whole; arena slots start at their region.
                let (origin_h, origin_w, src_bounds) = if s == 0 {
                    (0, 0, self.domains[0])
                } else {
                    (rows_in.start, cols_in.start, Extent::new(rows_in.len(), cols_in.len()))
                };
                let (h_dst, w_dst) = if s + 1 == n {
                    (rows_out.start, cols_out.start)
                } else {
                    (0, 0)
                };
                Tile {
                    h_src: resample.anchor(rows_out.start, origin_h),
                    w_src: resample.anchor(cols_out.start, origin_w),
                    h_dst,
                    w_dst,
                    height: rows_out.len(),
                    width: cols_out.len(),
                    src_bounds,
                }
            })
            .collect()
    }

    /// Choose the tile size for `memory_budget`
    ///
    /// Starts from the whole output and halves the larger dimension until the
    /// intermediates fit, then looks for the smallest tile count along the
    /// last shrunk axis that still fits and evens out tile sizes. The count is
    /// the fewest among sizes this halving reaches; other aspect ratios are
    /// not searched.
    ///
    /// # Errors
    ///
    /// `ConfigurationError` when even the floor tile exceeds the budget.
    pub fn plan(&self, memory_budget: usize, min_tile: usize) -> Result<TilePlan> {
        let output = self.output();
        let floor = self.floor(min_tile);
        let alignment = self.alignment();
        let fits = |tile: Extent| self.peak_bytes(tile) <= memory_budget;
        let balanced = |axis: Axis, count: usize| {
            let len = axis.len(output);
            align_up(len.div_ceil(count), alignment).max(axis.len(floor)).min(len)
        };

        let mut tile = output;
        let mut shrunk: Option<(Axis, usize)> = None;
        while !fits(tile) {
            let axis = if tile.height >= tile.width && tile.height > floor.height {
                Axis::Rows
            } else if tile.width > floor.width {
                Axis::Cols
            } else if tile.height > floor.height {
                Axis::Rows
            } else {
                return Err(Error::Configuration(format!(
                    "memory budget of {memory_budget} bytes cannot hold the smallest {floor} tile ({} bytes)",
                    self.peak_bytes(floor)
                )));
            };
            let len = axis.len(tile);
            let failing = axis.len(output).div_ceil(len);
            let halved = align_up(len.div_ceil(2), alignment).max(axis.len(floor));
            tile = axis.with(tile, halved);
            shrunk = Some((axis, failing));
        }

        if let Some((axis, failing)) = shrunk {
            let fitting = axis.len(output).div_ceil(axis.len(tile));
            for count in failing + 1..fitting {
                let candidate = axis.with(tile, balanced(axis, count));
                if fits(candidate) {
                    tile = candidate;
                    break;
                }
            }
        }
        for axis in [Axis::Rows, Axis::Cols] {
            let count = axis.len(output).div_ceil(axis.len(tile));
            let candidate = axis.with(tile, balanced(axis, count));
            if fits(candidate) {
                tile = candidate;
            }
        }

        let plan = TilePlan::new(self.clone(), tile);
        tracing::info!(
            tile = %plan.tile_size(),
            rows = plan.rows(),
            cols = plan.cols(),
            peak_bytes = plan.peak_bytes(),
            memory_budget,
            "tile plan"
        );
        Ok(plan)
    }
}

/// Rectangle of the final output processed as one tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileRect {
    pub h: usize,
    pub w: usize,
    pub height: usize,
    pub width: usize,
}

impl TileRect {
    pub fn extent(&self) -> Extent {
        Extent::new(self.height, self.width)
    }
}

/// Result of planning: tile grid plus what the run has to allocate
#[derive(Debug, Clone)]
pub struct TilePlan {
    geometry: PipelineGeometry,
    tile: Extent,
    rows: usize,
    cols: usize,
    tiles: Vec<TileRect>,
    stage_extents: Vec<Extent>,
    peak_bytes: usize,
}

impl TilePlan {
    fn new(geometry: PipelineGeometry, tile: Extent) -> Self {
        let output = geometry.output();
        let rows = output.height.div_ceil(tile.height);
        let cols = output.width.div_ceil(tile.width);
        let mut tiles = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                let (h, w) = (r * tile.height, c * tile.width);
                tiles.push(TileRect {
                    h,
                    w,
                    height: tile.height.min(output.height - h),
                    width: tile.width.min(output.width - w),
                });
            }
        }
        let stage_extents = geometry.stage_extents(tile);
        let peak_bytes = geometry.peak_bytes(tile);
        Self {
            geometry,
            tile,
            rows,
            cols,
            tiles,
            stage_extents,
            peak_bytes,
        }
    }

    pub fn geometry(&self) -> &PipelineGeometry {
        &self.geometry
    }

    /// Size of interior tiles; edge tiles may be smaller
    pub fn tile_size(&self) -> Extent {
        self.tile
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Output rectangles in row-major order
    pub fn tiles(&self) -> &[TileRect] {
        &self.tiles
    }

    /// Allocation extent of each intermediate result, one per stage but the last
    pub fn stage_extents(&self) -> &[Extent] {
        &self.stage_extents
    }

    pub fn peak_bytes(&self) -> usize {
        self.peak_bytes
    }

    pub fn stage_tiles(&self, rect: &TileRect) -> Vec<Tile> {
        self.geometry.stage_tiles(rect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv(bytes_per_pixel: usize) -> StageGeometry {
        StageGeometry::new(1, Resample::Same, bytes_per_pixel)
    }

    /// 3 -> 8 -> 3 convolutions on a 64x64 image, f32 `Chw`
    fn two_convs() -> PipelineGeometry {
        PipelineGeometry::new(Extent::new(64, 64), vec![conv(8 * 4), conv(3 * 4)]).unwrap()
    }

    #[test]
    fn only_intermediates_count() {
        let geometry = two_convs();
        assert_eq!(geometry.peak_bytes(Extent::new(64, 64)), 64 * 64 * 32);
        assert_eq!(geometry.peak_bytes(Extent::new(32, 64)), 33 * 64 * 32);
        assert_eq!(geometry.peak_bytes(Extent::new(32, 32)), 33 * 33 * 32);
    }

    #[test]
    fn tile_count_is_minimal_within_the_halving_family() {
        let geometry = two_convs();
        // Three full-width strips would fit too, but halving reaches 32x32 first.
        assert!(geometry.peak_bytes(Extent::new(22, 64)) <= 50_000);
        let plan = geometry.plan(50_000, 8).unwrap();
        assert_eq!(plan.len(), 4);
        assert!(geometry.peak_bytes(Extent::new(32, 64)) > 50_000);
    }

    #[test]
    fn budget_splits_into_quadrants() {
        let plan = two_convs().plan(50_000, 8).unwrap();
        assert_eq!(plan.tile_size(), Extent::new(32, 32));
        assert_eq!((plan.rows(), plan.cols()), (2, 2));
        assert_eq!(plan.stage_extents(), &[Extent::new(33, 33)]);
        assert_eq!(plan.peak_bytes(), 34_848);
        assert_eq!(
            plan.tiles()[3],
            TileRect {
                h: 32,
                w: 32,
                height: 32,
                width: 32
            }
        );
    }

    #[test]
    fn ample_budget_keeps_one_tile() {
        let plan = two_convs().plan(usize::MAX, 8).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.tile_size(), Extent::new(64, 64));
    }

    #[test]
    fn budget_below_floor_is_a_configuration_error() {
        let err = two_convs().plan(100, 8).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ConfigurationError);
    }

    #[test]
    fn floor_respects_halo_and_alignment() {
        let stages = vec![
            StageGeometry::new(3, Resample::Down2, 16),
            StageGeometry::new(3, Resample::Down2, 16),
            StageGeometry::new(3, Resample::Up2, 16),
            StageGeometry::new(3, Resample::Up2, 16),
        ];
        let geometry = PipelineGeometry::new(Extent::new(64, 40), stages).unwrap();
        assert_eq!(geometry.alignment(), 4);
        assert_eq!(geometry.total_halo(), 12);
        assert_eq!(geometry.floor(1), Extent::new(12, 12));
        assert_eq!(geometry.floor(13), Extent::new(16, 16));
        assert_eq!(geometry.output(), Extent::new(64, 40));
    }

    #[test]
    fn downsampling_needs_even_dimensions() {
        let err = PipelineGeometry::new(Extent::new(9, 8), vec![StageGeometry::new(0, Resample::Down2, 4)]).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidArgument);
        assert!(PipelineGeometry::new(Extent::new(0, 8), vec![conv(4)]).is_err());
        assert!(PipelineGeometry::new(Extent::new(8, 8), vec![]).is_err());
    }

    #[test]
    fn tiles_partition_the_output() {
        let geometry = PipelineGeometry::new(Extent::new(37, 50), vec![conv(64), conv(12)]).unwrap();
        let plan = geometry.plan(20_000, 8).unwrap();
        let mut covered = vec![0u8; 37 * 50];
        for rect in plan.tiles() {
            for h in rect.h..rect.h + rect.height {
                for w in rect.w..rect.w + rect.width {
                    covered[h * 50 + w] += 1;
                }
            }
        }
        assert!(covered.iter().all(|&n| n == 1));
        assert!(plan.peak_bytes() <= 20_000);
    }

    #[test]
    fn stage_tiles_chain_through_the_arena() {
        let plan = two_convs().plan(50_000, 8).unwrap();
        let tiles = plan.stage_tiles(&plan.tiles()[3]);

        // First stage reads the caller's source and fills rows/cols 31..64.
        assert_eq!((tiles[0].h_src, tiles[0].w_src), (31, 31));
        assert_eq!((tiles[0].h_dst, tiles[0].w_dst), (0, 0));
        assert_eq!(tiles[0].extent(), Extent::new(33, 33));
        assert_eq!(tiles[0].src_bounds, Extent::new(64, 64));

        // Second stage reads the arena from its local row 1 and writes the quadrant.
        assert_eq!((tiles[1].h_src, tiles[1].w_src), (1, 1));
        assert_eq!((tiles[1].h_dst, tiles[1].w_dst), (32, 32));
        assert_eq!(tiles[1].extent(), Extent::new(32, 32));
        assert_eq!(tiles[1].src_bounds, Extent::new(33, 33));
    }

    #[test]
    fn resampling_anchors() {
        let stages = vec![
            StageGeometry::new(1, Resample::Down2, 16),
            StageGeometry::new(1, Resample::Up2, 16),
        ];
        let geometry = PipelineGeometry::new(Extent::new(16, 16), stages).unwrap();
        let tiles = geometry.stage_tiles(&TileRect {
            h: 8,
            w: 0,
            height: 8,
            width: 16,
        });

        // Up2 output rows 8..16 read pooled rows 4..8, grown by the halo: 3..8.
        assert_eq!(tiles[1].src_bounds, Extent::new(5, 8));
        assert_eq!(tiles[1].h_src, 8 - 2 * 3);
        assert_eq!(tiles[1].h_dst, 8);

        // Pooled rows 3..8 come from input rows 5..16 (6..16 plus the halo).
        assert_eq!(tiles[0].extent(), Extent::new(5, 8));
        assert_eq!(tiles[0].h_src, 6);
        assert_eq!(tiles[0].src_bounds, Extent::new(16, 16));
    }
}
