//! Dispatch over the segmentation capabilities.

mod felzenszwalb;
mod quickshift;
mod remote;
mod seed;
mod slic;
mod slic_helpers;
mod watershed;

use ndarray::ArrayView3;

pub use remote::{InferenceRequest, InferenceResponse, ModelClient};

use crate::{
    error::SegmentError, parameters::SegmentationMethod, utils::ensure_positive_ids, SegmentImage,
};

/// Segment `image` with `method`. Ids of the result start at 1.
///
/// `client` is only consulted by [`SegmentationMethod::RemoteModel`].
pub fn segment(
    image: ArrayView3<f32>,
    method: &SegmentationMethod,
    client: Option<&dyn ModelClient>,
) -> Result<SegmentImage, SegmentError> {
    let (height, width, channels) = image.dim();
    if height == 0 || width == 0 || channels == 0 {
        return Err(SegmentError::InvalidInput(format!(
            "cannot segment an image of shape {:?}",
            image.dim()
        )));
    }

    let segment_image = match *method {
        SegmentationMethod::Watershed {
            smoothing_radius,
            gradient_cut,
        } => watershed::watershed(image, smoothing_radius, gradient_cut)?,
        SegmentationMethod::Slic {
            n_segments,
            compactness,
            sigma,
        } => slic::slic(image, n_segments, compactness, sigma)?,
        SegmentationMethod::Quickshift {
            kernel_size,
            max_distance,
            sigma,
        } => quickshift::quickshift(image, kernel_size, max_distance, sigma)?,
        SegmentationMethod::Felzenszwalb {
            scale,
            min_size,
            sigma,
        } => felzenszwalb::felzenszwalb(image, scale, min_size, sigma)?,
        SegmentationMethod::RemoteModel {
            model_id,
            num_classes,
        } => remote::segment_remote(image, model_id, num_classes, client)?,
    };

    Ok(ensure_positive_ids(segment_image))
}
