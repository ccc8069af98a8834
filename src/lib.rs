mod logger;

pub mod algorithm;
pub mod boundary;
pub mod error;
mod filters;
pub mod graph;
pub mod labels;
pub mod merge;
pub mod parameters;
pub mod preprocess;
pub mod record;
pub mod remove;
pub mod segment_info;
pub mod tiles;
pub mod training;
pub mod utils;
#[cfg(feature = "wasm")]
pub mod wasm;

use std::sync::Arc;

use ndarray::{Array2, Array3, ArrayView3};

pub use algorithm::{segment, InferenceRequest, InferenceResponse, ModelClient};
pub use boundary::{color_labels, mark, Lighting};
pub use error::{InfoError, ParameterError, PipelineError, RecordError, RemoteError, SegmentError};
pub use merge::merge;
pub use parameters::{ParameterSet, PostprocessScope, RawParameters, SegmentationMethod};
pub use preprocess::preprocess;
pub use record::{persist, read, update_info_only};
pub use remove::{postprocess, remove_small};
pub use segment_info::SegmentInfo;
pub use tiles::segment_tiled;

/// Float image in `(height, width, channels)` layout.
pub type Image = Array3<f32>;

/// One region id per pixel. Ids of a finished segmentation are `1..=N`.
pub type SegmentImage = Array2<u32>;

/// Everything a segmentation request hands back to the labeling tool.
#[derive(Clone, Debug)]
pub struct SegmentationOutput {
    /// The visual with region boundaries drawn on it.
    pub marked: Array3<u8>,
    pub segment_image: SegmentImage,
    pub info: SegmentInfo,
}

/// Segment one image from start to finish.
///
/// `data` is the high-fidelity array the algorithms run on; without it the
/// visual is used, scaled to `[0, 1]`. Single-band data is stacked to three
/// channels. Algorithmic failures degrade to a single region covering the
/// image; only malformed input and failures of the remote model are returned
/// as errors.
pub fn run_segmentation(
    visual: ArrayView3<u8>,
    data: Option<Image>,
    params: &ParameterSet,
    client: Option<Arc<dyn ModelClient>>,
    lighting: Lighting,
) -> Result<SegmentationOutput, PipelineError> {
    let (height, width, visual_channels) = visual.dim();
    if visual_channels == 0 {
        return Err(PipelineError::InvalidInput(format!(
            "the visual {:?} has no channels",
            visual.dim()
        )));
    }
    let data = data.unwrap_or_else(|| visual.mapv(|v| v as f32 / 255.0));
    let (data_height, data_width, channels) = data.dim();
    if height == 0 || width == 0 || channels == 0 {
        return Err(PipelineError::InvalidInput(format!(
            "cannot segment an image of shape {:?}",
            data.dim()
        )));
    }
    if (data_height, data_width) != (height, width) {
        return Err(PipelineError::InvalidInput(format!(
            "image data {:?} does not match the visual {:?}",
            (data_height, data_width),
            (height, width)
        )));
    }
    let data = if channels == 1 {
        utils::to_three_channels(data.index_axis(ndarray::Axis(2), 0))
    } else {
        data
    };

    console_log!("Preprocessing {}x{} image", height, width);
    let image = preprocess(data, params);

    console_log!("Segmenting with {:?}", params.method);
    let segment_image = match params.tiling {
        Some(config) => {
            let tiled = segment_tiled(image.view(), params, client, config);
            match params.postprocess_scope {
                PostprocessScope::Global => postprocess(tiled, image.view(), params),
                PostprocessScope::PerTile => tiled,
            }
        }
        None => match segment(image.view(), &params.method, client.as_deref()) {
            Ok(segment_image) => postprocess(segment_image, image.view(), params),
            Err(SegmentError::Remote(err)) => return Err(PipelineError::Remote(err)),
            Err(SegmentError::InvalidInput(msg)) => return Err(PipelineError::InvalidInput(msg)),
            Err(err) => {
                log::warn!("segmentation failed, keeping the image as one region: {err}");
                SegmentImage::ones((height, width))
            }
        },
    };
    let segment_image = utils::relabel_sequential(&utils::ensure_positive_ids(segment_image));

    let info = SegmentInfo::create(segment_image.view());
    console_log!("{} segments", info.len());

    let marked = mark(visual, segment_image.view(), lighting)
        .map_err(|err| PipelineError::InvalidInput(err.to_string()))?;

    Ok(SegmentationOutput {
        marked,
        segment_image,
        info,
    })
}

#[cfg(test)]
mod tests {
    use ndarray::{s, Array3};

    use super::*;
    use crate::{error::RemoteError, parameters::TileConfig};

    struct Offline;

    impl ModelClient for Offline {
        fn infer(&self, _: &InferenceRequest) -> Result<InferenceResponse, RemoteError> {
            Err(RemoteError::Transport("connection refused".into()))
        }
    }

    fn two_halves() -> Array3<u8> {
        let mut visual = Array3::<u8>::zeros((20, 20, 3));
        visual.slice_mut(s![.., 10.., ..]).fill(200);
        visual
    }

    fn watershed() -> SegmentationMethod {
        SegmentationMethod::Watershed {
            smoothing_radius: 1.0,
            gradient_cut: 10.0,
        }
    }

    #[test]
    fn test_run_segmentation_builds_complete_info() {
        let visual = two_halves();
        let params = ParameterSet::new(watershed());
        let output =
            run_segmentation(visual.view(), None, &params, None, Lighting::Bright).unwrap();

        assert!(output.segment_image.iter().all(|id| *id >= 1));
        output.info.verify(output.segment_image.view()).unwrap();
        let area: u64 = output.info.areas().iter().map(|a| *a as u64).sum();
        assert_eq!(area, 400);
        assert_eq!(output.marked.dim(), (20, 20, 3));
    }

    #[test]
    fn test_remote_failure_is_reported() {
        let visual = two_halves();
        let params = ParameterSet::new(SegmentationMethod::RemoteModel {
            model_id: 1,
            num_classes: 2,
        });
        let client: Arc<dyn ModelClient> = Arc::new(Offline);
        assert!(matches!(
            run_segmentation(visual.view(), None, &params, Some(client), Lighting::Dark),
            Err(PipelineError::Remote(RemoteError::Transport(_)))
        ));
    }

    #[test]
    fn test_tiled_remote_failure_degrades_per_tile() {
        let visual = two_halves();
        let params = ParameterSet::new(SegmentationMethod::RemoteModel {
            model_id: 1,
            num_classes: 2,
        })
        .with_tiling(TileConfig {
            tile_size: 10,
            workers: 2,
        });
        let client: Arc<dyn ModelClient> = Arc::new(Offline);
        let output =
            run_segmentation(visual.view(), None, &params, Some(client), Lighting::Dark).unwrap();
        // every tile became one placeholder region
        assert_eq!(output.info.len(), 4);
    }

    #[test]
    fn test_mismatched_data_is_rejected() {
        let visual = two_halves();
        let data = Image::zeros((10, 20, 3));
        let params = ParameterSet::new(watershed());
        assert!(matches!(
            run_segmentation(visual.view(), Some(data), &params, None, Lighting::Bright),
            Err(PipelineError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_visual_without_channels_is_rejected() {
        let visual = Array3::<u8>::zeros((20, 20, 0));
        let data = Image::zeros((20, 20, 3));
        let params = ParameterSet::new(watershed());
        assert!(matches!(
            run_segmentation(visual.view(), Some(data), &params, None, Lighting::Bright),
            Err(PipelineError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_single_band_data_is_stacked() {
        let visual = two_halves();
        let data = visual.slice(s![.., .., 0..1]).mapv(|v| v as f32 / 255.0);
        let params = ParameterSet::new(watershed()).with_small_removal(100);
        let output =
            run_segmentation(visual.view(), Some(data), &params, None, Lighting::Medium).unwrap();
        // 500 px removal threshold swallows everything but the largest region
        assert_eq!(output.info.len(), 1);
        assert_eq!(output.segment_image, SegmentImage::ones((20, 20)));
    }
}
