//! Parallel segmentation of large images, tile by tile.

use std::{
    any::Any,
    ops::Range,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{mpsc, Arc},
};

use ndarray::{s, ArrayView3};
use rayon::ThreadPoolBuilder;

use crate::{
    algorithm::{segment, ModelClient},
    console_log,
    error::SegmentError,
    parameters::{ParameterSet, PostprocessScope, TileConfig},
    remove::postprocess,
    utils::relabel_sequential,
    Image, SegmentImage,
};

/// Grid position of a tile, in tiles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TileIndex {
    pub row: usize,
    pub col: usize,
}

/// A tile and the pixel rows/columns it covers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tile {
    pub index: TileIndex,
    pub rows: Range<usize>,
    pub cols: Range<usize>,
}

/// Cover a `(height, width)` image with `tile_size` squares. Tiles on the
/// bottom and right edges are cut short instead of padded.
pub fn tile_grid((height, width): (usize, usize), tile_size: usize) -> Vec<Tile> {
    let tile_size = tile_size.max(1);
    let mut tiles = Vec::new();
    for row in 0..height.div_ceil(tile_size) {
        for col in 0..width.div_ceil(tile_size) {
            tiles.push(Tile {
                index: TileIndex { row, col },
                rows: row * tile_size..((row + 1) * tile_size).min(height),
                cols: col * tile_size..((col + 1) * tile_size).min(width),
            });
        }
    }
    tiles
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Segment one tile, and post-process it when the scope asks for it.
fn process_tile(
    pixels: &Image,
    params: &ParameterSet,
    client: Option<&dyn ModelClient>,
) -> Result<SegmentImage, SegmentError> {
    let segment_image = segment(pixels.view(), &params.method, client)?;
    Ok(match params.postprocess_scope {
        PostprocessScope::PerTile => postprocess(segment_image, pixels.view(), params),
        PostprocessScope::Global => segment_image,
    })
}

fn run_task(
    pixels: &Image,
    params: &ParameterSet,
    client: Option<&dyn ModelClient>,
) -> Result<SegmentImage, SegmentError> {
    catch_unwind(AssertUnwindSafe(|| process_tile(pixels, params, client)))
        .unwrap_or_else(|payload| Err(SegmentError::Panicked(panic_message(payload))))
}

/// Writes tile results into the global segment image, offsetting each tile's
/// ids by the largest id written so far.
struct Stitcher {
    segment_image: SegmentImage,
    written: Vec<bool>,
    running_max: u32,
}

impl Stitcher {
    fn new(dim: (usize, usize), tiles: usize) -> Self {
        Self {
            segment_image: SegmentImage::zeros(dim),
            written: vec![false; tiles],
            running_max: 0,
        }
    }

    fn write(&mut self, slot: usize, tile: &Tile, result: Result<SegmentImage, SegmentError>) {
        let mut target = self
            .segment_image
            .slice_mut(s![tile.rows.clone(), tile.cols.clone()]);
        let offset = self.running_max;

        // Compact the tile's ids first so sparse ids cannot overflow the offset
        let stitched = match result {
            Ok(local) if local.dim() == target.dim() => Ok(relabel_sequential(&local)),
            Ok(local) => Err(format!(
                "returned shape {:?}, expected {:?}",
                local.dim(),
                target.dim()
            )),
            Err(err) => Err(err.to_string()),
        }
        .and_then(|local| {
            let count = local.iter().max().copied().unwrap_or(0);
            offset
                .checked_add(count)
                .map(|running_max| (local, running_max))
                .ok_or_else(|| format!("{count} ids do not fit after id {offset}"))
        });

        match stitched {
            Ok((local, running_max)) => {
                target.zip_mut_with(&local, |out, id| *out = id + offset);
                self.running_max = running_max;
            }
            Err(reason) => {
                log::warn!("tile {:?} failed: {reason}", tile.index);
                let placeholder = offset.saturating_add(1);
                target.fill(placeholder);
                self.running_max = placeholder;
            }
        }
        self.written[slot] = true;
    }

    /// Fill tiles that never reported back with a placeholder region each.
    fn finish(mut self, tiles: &[Tile]) -> SegmentImage {
        for (slot, tile) in tiles.iter().enumerate() {
            if !self.written[slot] {
                self.write(
                    slot,
                    tile,
                    Err(SegmentError::Panicked("tile result was lost".into())),
                );
            }
        }
        self.segment_image
    }
}

/// Split `image` into tiles, segment them concurrently on `config.workers`
/// threads, and stitch the results into one labeling with disjoint ids.
///
/// Tiles are stitched in completion order, so which tile receives the lowest
/// ids varies between runs. A tile whose segmentation fails becomes a single
/// region.
pub fn segment_tiled(
    image: ArrayView3<f32>,
    params: &ParameterSet,
    client: Option<Arc<dyn ModelClient>>,
    config: TileConfig,
) -> SegmentImage {
    let (height, width, _) = image.dim();
    let tiles = tile_grid((height, width), config.tile_size);
    let mut stitcher = Stitcher::new((height, width), tiles.len());
    console_log!(
        "Segmenting {} tiles of {} px on {} workers",
        tiles.len(),
        config.tile_size,
        config.workers
    );

    let pool = match ThreadPoolBuilder::new()
        .num_threads(config.workers.max(1))
        .build()
    {
        Ok(pool) => pool,
        Err(err) => {
            log::warn!("cannot build worker pool ({err}), segmenting tiles sequentially");
            for (slot, tile) in tiles.iter().enumerate() {
                let pixels = image.slice(s![tile.rows.clone(), tile.cols.clone(), ..]).to_owned();
                let result = run_task(&pixels, params, client.as_deref());
                stitcher.write(slot, tile, result);
            }
            return stitcher.finish(&tiles);
        }
    };

    let (sender, receiver) = mpsc::channel();
    for (slot, tile) in tiles.iter().enumerate() {
        let pixels = image.slice(s![tile.rows.clone(), tile.cols.clone(), ..]).to_owned();
        let params = params.clone();
        let client = client.clone();
        let sender = sender.clone();
        pool.spawn(move || {
            let result = run_task(&pixels, &params, client.as_deref());
            // The receiver only hangs up once every tile is accounted for
            let _ = sender.send((slot, result));
        });
    }
    drop(sender);

    for (slot, result) in receiver {
        console_log!("Tile {:?} complete", tiles[slot].index);
        stitcher.write(slot, &tiles[slot], result);
    }

    stitcher.finish(&tiles)
}
