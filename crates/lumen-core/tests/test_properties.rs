//! Generated pipelines: partition, budget and tiling transparency

mod common;

use common::{noise, scalar_cpu, weights};
use lumen_core::{
    ConvDesc, Destination, ErrorKind, Extent, PipelineGeometry, PostOp, Resample, Source, StageGeometry,
};
use proptest::collection::vec;
use proptest::prelude::*;

// ============================================================================
// Strategies
// ============================================================================

fn arb_stage(resample: Resample) -> impl Strategy<Value = StageGeometry> {
    (0usize..=2, 1usize..=16).prop_map(move |(halo, channels)| StageGeometry::new(halo, resample, channels * 4))
}

/// Encoder/decoder shaped stage lists whose input survives every pooling level
fn arb_geometry() -> impl Strategy<Value = PipelineGeometry> {
    (0usize..=2)
        .prop_flat_map(|levels| {
            let unit = 1usize << levels;
            (
                (1usize..=20).prop_map(move |k| k * unit),
                (1usize..=20).prop_map(move |k| k * unit),
                vec(arb_stage(Resample::Down2), levels),
                vec(arb_stage(Resample::Same), 1..=3),
                vec(arb_stage(Resample::Up2), levels),
            )
        })
        .prop_map(|(height, width, down, middle, up)| {
            let stages = down.into_iter().chain(middle).chain(up).collect();
            PipelineGeometry::new(Extent::new(height, width), stages).unwrap()
        })
}

fn assert_partition(output: Extent, rects: &[lumen_core::TileRect]) {
    let mut covered = vec![0u32; output.area()];
    for rect in rects {
        assert!(rect.h + rect.height <= output.height && rect.w + rect.width <= output.width);
        for h in rect.h..rect.h + rect.height {
            for w in rect.w..rect.w + rect.width {
                covered[h * output.width + w] += 1;
            }
        }
    }
    assert!(covered.iter().all(|&n| n == 1), "tiles overlap or leave gaps");
}

// ============================================================================
// Planner properties
// ============================================================================

proptest! {
    #[test]
    fn prop_plan_partitions_and_fits(geometry in arb_geometry(), fraction in 0.0f64..1.2, min_tile in 1usize..=16) {
        let output = geometry.output();
        let full = geometry.peak_bytes(output);
        let budget = (full as f64 * fraction) as usize;

        match geometry.plan(budget, min_tile) {
            Ok(plan) => {
                prop_assert!(plan.peak_bytes() <= budget);
                prop_assert_eq!(plan.peak_bytes(), geometry.peak_bytes(plan.tile_size()));
                prop_assert_eq!(plan.len(), plan.rows() * plan.cols());
                assert_partition(output, plan.tiles());
                if plan.len() > 1 {
                    prop_assert!(full > budget);
                }

                let alignment = geometry.alignment();
                let tile = plan.tile_size();
                prop_assert!(tile.height % alignment == 0 || tile.height == output.height);
                prop_assert!(tile.width % alignment == 0 || tile.width == output.width);
            }
            Err(err) => {
                prop_assert_eq!(err.kind(), ErrorKind::ConfigurationError);
                prop_assert!(geometry.peak_bytes(geometry.floor(min_tile)) > budget);
            }
        }
    }

    #[test]
    fn prop_stage_tiles_stay_inside_their_buffers(geometry in arb_geometry(), fraction in 0.05f64..1.0) {
        let budget = (geometry.peak_bytes(geometry.output()) as f64 * fraction) as usize;
        let Ok(plan) = geometry.plan(budget, 1) else {
            return Ok(());
        };
        let n = geometry.stages().len();
        let extents = plan.stage_extents();
        prop_assert_eq!(extents.len(), n - 1);

        for rect in plan.tiles() {
            let tiles = plan.stage_tiles(rect);
            prop_assert_eq!(tiles.len(), n);
            prop_assert_eq!(tiles[0].src_bounds, geometry.input());
            prop_assert_eq!(tiles[n - 1].extent(), rect.extent());
            prop_assert_eq!((tiles[n - 1].h_dst, tiles[n - 1].w_dst), (rect.h, rect.w));
            for (s, tile) in tiles.iter().enumerate() {
                if s + 1 < n {
                    prop_assert!(tile.extent().fits_in(extents[s]));
                    prop_assert_eq!((tile.h_dst, tile.w_dst), (0, 0));
                }
                if s > 0 {
                    prop_assert!(tile.src_bounds.fits_in(extents[s - 1]));
                }
            }
        }
    }
}

// ============================================================================
// Tiling transparency
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_tiled_runs_match_single_tile(
        half_height in 4usize..=12,
        half_width in 4usize..=12,
        channels in 2usize..=4,
        fraction in 0.1f64..0.9,
        seed in 0u32..1000,
    ) {
        let (height, width) = (2 * half_height, 2 * half_width);
        let exec = scalar_cpu();
        let pipeline = exec
            .pipeline(height, width, 3)
            .conv(weights(seed, channels, 3, 3).unwrap(), ConvDesc::relu().with_post_op(PostOp::Pool))
            .and_then(|b| b.conv(weights(seed + 2, channels, channels, 3)?, ConvDesc::relu().with_post_op(PostOp::Upsample)))
            .and_then(|b| b.conv(weights(seed + 4, 3, channels, 3)?, ConvDesc::default()))
            .and_then(|b| b.build());
        let mut pipeline = pipeline.unwrap();

        let budget = (pipeline.geometry().peak_bytes(pipeline.output()) as f64 * fraction) as usize;
        prop_assume!(pipeline.plan(budget).is_ok());

        let src = exec.tensor_from_chw(3, height, width, &noise(seed + 6, 3 * height * width)).unwrap();
        let tiled = exec.tensor(3, height, width).unwrap();
        let full = exec.tensor(3, height, width).unwrap();
        pipeline.set_source(Source::Tensor(src.binding())).unwrap();

        pipeline.set_destination(Destination::Tensor(tiled.binding())).unwrap();
        pipeline.run(budget).unwrap();
        pipeline.set_destination(Destination::Tensor(full.binding())).unwrap();
        pipeline.run(usize::MAX).unwrap();

        prop_assert_eq!(tiled.read_chw().unwrap(), full.read_chw().unwrap());
    }
}
