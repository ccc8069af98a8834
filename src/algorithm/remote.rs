//! Segmentation by an external learned model.
//!
//! The crate only defines the payloads and the [`ModelClient`] seam; the
//! transport (HTTP, IPC, in-process) is supplied by the caller.

use ndarray::{Array2, ArrayView2, ArrayView3};
use serde::{Deserialize, Serialize};

use crate::{console_log, error::RemoteError, SegmentImage};

/// Image sent to the model. `image_bytes` holds the pixels as little-endian
/// `f32` in row-major `(height, width, channels)` order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub image_shape: Vec<usize>,
    pub image_bytes: Vec<u8>,
    pub model_id: u32,
    pub num_classes: u32,
}

/// Label map returned by the model, same byte layout as the request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub image_shape: Vec<usize>,
    pub image_bytes: Vec<u8>,
}

/// Transport to a segmentation model. Shared by tile workers, hence the
/// `Send + Sync` bound.
pub trait ModelClient: Send + Sync {
    fn infer(&self, request: &InferenceRequest) -> Result<InferenceResponse, RemoteError>;
}

fn encode_f32<'a>(values: impl Iterator<Item = &'a f32>) -> Vec<u8> {
    values.flat_map(|v| v.to_le_bytes()).collect()
}

/// 2^32, the first whole value past `u32::MAX`.
const ID_LIMIT: f32 = 4_294_967_296.0;

fn decode_f32(bytes: &[u8], expected_len: usize) -> Result<Vec<f32>, RemoteError> {
    if bytes.len() != expected_len * 4 {
        return Err(RemoteError::Codec(format!(
            "expected {} bytes, got {}",
            expected_len * 4,
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

impl InferenceRequest {
    pub fn new(image: ArrayView3<f32>, model_id: u32, num_classes: u32) -> Self {
        let (height, width, channels) = image.dim();
        Self {
            image_shape: vec![height, width, channels],
            image_bytes: encode_f32(image.iter()),
            model_id,
            num_classes,
        }
    }

    pub fn to_json(&self) -> Result<String, RemoteError> {
        serde_json::to_string(self).map_err(|e| RemoteError::Codec(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, RemoteError> {
        serde_json::from_str(json).map_err(|e| RemoteError::Codec(e.to_string()))
    }
}

impl InferenceResponse {
    /// Encode a label map, for model servers and test doubles.
    pub fn new(labels: ArrayView2<f32>) -> Self {
        let (height, width) = labels.dim();
        Self {
            image_shape: vec![height, width],
            image_bytes: encode_f32(labels.iter()),
        }
    }

    pub fn to_json(&self) -> Result<String, RemoteError> {
        serde_json::to_string(self).map_err(|e| RemoteError::Codec(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, RemoteError> {
        serde_json::from_str(json).map_err(|e| RemoteError::Codec(e.to_string()))
    }

    /// Decode into a segment image of spatial size `(height, width)`.
    ///
    /// Values must be non-negative whole numbers; a trailing unit channel
    /// axis is accepted.
    pub fn segment_image(&self, (height, width): (usize, usize)) -> Result<SegmentImage, RemoteError> {
        let spatial_match = match self.image_shape.as_slice() {
            [h, w] | [h, w, 1] => (*h, *w) == (height, width),
            _ => false,
        };
        if !spatial_match {
            return Err(RemoteError::ShapeMismatch {
                expected: vec![height, width],
                found: self.image_shape.clone(),
            });
        }

        let values = decode_f32(&self.image_bytes, height * width)?;
        let ids = values
            .into_iter()
            .map(|v| {
                if v.is_finite() && v >= 0.0 && v.fract() == 0.0 && v < ID_LIMIT {
                    Ok(v as u32)
                } else {
                    Err(RemoteError::Codec(format!("{v} is not a segment id")))
                }
            })
            .collect::<Result<Vec<u32>, _>>()?;
        Array2::from_shape_vec((height, width), ids).map_err(|e| RemoteError::Codec(e.to_string()))
    }
}

pub(crate) fn segment_remote(
    image: ArrayView3<f32>,
    model_id: u32,
    num_classes: u32,
    client: Option<&dyn ModelClient>,
) -> Result<SegmentImage, RemoteError> {
    let client = client.ok_or(RemoteError::NoClient)?;
    let (height, width, _) = image.dim();
    let request = InferenceRequest::new(image, model_id, num_classes);
    console_log!("Requesting model {} ({} classes)", model_id, num_classes);
    client.infer(&request)?.segment_image((height, width))
}

#[cfg(test)]
mod tests {
    use ndarray::{array, Array3};

    use super::*;

    /// Labels every pixel by thresholding its first channel.
    struct ThresholdModel;

    impl ModelClient for ThresholdModel {
        fn infer(&self, request: &InferenceRequest) -> Result<InferenceResponse, RemoteError> {
            let (h, w, c) = (request.image_shape[0], request.image_shape[1], request.image_shape[2]);
            let pixels = decode_f32(&request.image_bytes, h * w * c)?;
            let labels = Array2::from_shape_fn((h, w), |(y, x)| {
                if pixels[(y * w + x) * c] > 0.5 {
                    1.0
                } else {
                    0.0
                }
            });
            Ok(InferenceResponse::new(labels.view()))
        }
    }

    struct Unreachable;

    impl ModelClient for Unreachable {
        fn infer(&self, _: &InferenceRequest) -> Result<InferenceResponse, RemoteError> {
            Err(RemoteError::Transport("connection refused".into()))
        }
    }

    #[test]
    fn test_remote_round_trip() {
        let img = Array3::from_shape_fn((2, 3, 3), |(_, x, _)| x as f32 / 2.0);
        let labels = segment_remote(img.view(), 1, 2, Some(&ThresholdModel)).unwrap();
        assert_eq!(labels, array![[0, 0, 1], [0, 0, 1]]);
    }

    #[test]
    fn test_missing_client_and_transport_errors() {
        let img = Array3::<f32>::zeros((2, 2, 3));
        assert!(matches!(
            segment_remote(img.view(), 1, 1, None),
            Err(RemoteError::NoClient)
        ));
        assert!(matches!(
            segment_remote(img.view(), 1, 1, Some(&Unreachable)),
            Err(RemoteError::Transport(_))
        ));
    }

    #[test]
    fn test_response_shape_is_checked() {
        let response = InferenceResponse::new(Array2::<f32>::zeros((3, 2)).view());
        assert!(matches!(
            response.segment_image((2, 3)),
            Err(RemoteError::ShapeMismatch { .. })
        ));

        let mut truncated = InferenceResponse::new(Array2::<f32>::zeros((2, 2)).view());
        truncated.image_bytes.pop();
        assert!(matches!(truncated.segment_image((2, 2)), Err(RemoteError::Codec(_))));

        let negative = InferenceResponse::new(array![[-1.0f32]].view());
        assert!(matches!(negative.segment_image((1, 1)), Err(RemoteError::Codec(_))));
    }

    #[test]
    fn test_ids_past_u32_are_rejected() {
        let too_large = InferenceResponse::new(array![[4_294_967_296.0f32]].view());
        assert!(matches!(too_large.segment_image((1, 1)), Err(RemoteError::Codec(_))));

        // the largest whole f32 below 2^32
        let largest = InferenceResponse::new(array![[4_294_967_040.0f32]].view());
        assert_eq!(largest.segment_image((1, 1)).unwrap(), array![[4_294_967_040u32]]);
    }

    #[test]
    fn test_request_json() {
        let img = Array3::<f32>::ones((1, 1, 1));
        let request = InferenceRequest::new(img.view(), 7, 3);
        assert_eq!(request.image_bytes, 1.0f32.to_le_bytes().to_vec());
        let decoded = InferenceRequest::from_json(&request.to_json().unwrap()).unwrap();
        assert_eq!(decoded, request);
    }
}
