//! Browser bindings for the labeling tool. Images cross the boundary as planar
//! `(channels, height, width)` byte buffers, segment images as row-major ids.

use ndarray::{s, Array2, Array3};
use wasm_bindgen::prelude::*;

use crate::{
    boundary::{self, Lighting},
    console_log,
    labels::parse_label_map,
    parameters::{ParameterSet, RawParameters},
    run_segmentation,
    segment_info::SegmentInfo,
    utils::{array_to_png, array_to_rgba_bitmap},
    SegmentImage,
};

fn planar_to_image(
    data: Vec<u8>,
    width: usize,
    height: usize,
    channels: usize,
) -> Result<Array3<u8>, JsError> {
    let mut array = Array3::from_shape_vec((channels, height, width), data)?;
    array.swap_axes(0, 1);
    array.swap_axes(1, 2);
    Ok(array)
}

fn segment_image_from_js(
    segment_image: Vec<u32>,
    width: usize,
    height: usize,
) -> Result<SegmentImage, JsError> {
    Ok(Array2::from_shape_vec((height, width), segment_image)?)
}

#[wasm_bindgen(start)]
pub fn start() {
    crate::logger::init();
}

#[wasm_bindgen]
pub fn convert_to_png(
    data: &[u8],
    width: usize,
    height: usize,
    channels: usize,
) -> Result<Box<[u8]>, JsError> {
    let array = planar_to_image(data.to_vec(), width, height, channels)?;
    Ok(array_to_png(array.view())?.into_boxed_slice())
}

#[wasm_bindgen(getter_with_clone)]
#[derive(Clone, Debug)]
pub struct Segmentation {
    /// Row-major segment ids.
    pub segment_image: Vec<u32>,
    /// Row-major `(segment_number, label_id, area)` triples.
    pub segment_info: Vec<u32>,
    /// RGBA bitmap of the boundary-marked visual.
    pub marked: Vec<u8>,
}

/// Segment a visual with the parameters of the UI form (`params_json`).
#[wasm_bindgen]
pub fn segment_wasm(
    data: &[u8],
    width: usize,
    height: usize,
    channels: usize,
    params_json: &str,
    lighting: &str,
) -> Result<Segmentation, JsError> {
    let visual = planar_to_image(data.to_vec(), width, height, channels)?;
    let params = ParameterSet::from_raw(&RawParameters::from_json(params_json)?)?;
    console_log!("Dimensions: {:?}", visual.dim());

    let output = run_segmentation(
        visual.view(),
        None,
        &params,
        None,
        Lighting::from_name(lighting),
    )?;

    Ok(Segmentation {
        segment_image: output.segment_image.iter().copied().collect(),
        segment_info: output.info.table().iter().copied().collect(),
        marked: array_to_rgba_bitmap(output.marked.view()),
    })
}

#[wasm_bindgen]
pub fn mark_boundaries_wasm(
    img: Vec<u8>,
    width: usize,
    height: usize,
    channels: usize,
    segment_image: Vec<u32>,
    lighting: &str,
) -> Result<Vec<u8>, JsError> {
    let img = planar_to_image(img, width, height, channels)?;
    let segment_image = segment_image_from_js(segment_image, width, height)?;
    let marked = boundary::mark(img.view(), segment_image.view(), Lighting::from_name(lighting))?;
    Ok(array_to_rgba_bitmap(marked.view()))
}

/// Blend label colours over a marked RGBA bitmap, as returned by
/// [`mark_boundaries_wasm`].
#[wasm_bindgen]
pub fn color_labels_wasm(
    marked: Vec<u8>,
    width: usize,
    height: usize,
    segment_image: Vec<u32>,
    segment_info: Vec<u32>,
    label_map_json: &str,
    alpha: f32,
) -> Result<Vec<u8>, JsError> {
    let rgba = Array3::from_shape_vec((height, width, 4), marked)?;
    let segment_image = segment_image_from_js(segment_image, width, height)?;
    let rows = segment_info.len() / 3;
    let info = SegmentInfo::from_table(Array2::from_shape_vec((rows, 3), segment_info)?)?;
    let label_map = parse_label_map(label_map_json)?;

    let colored = boundary::color_labels(
        rgba.slice(s![.., .., 0..3]),
        segment_image.view(),
        &info,
        &label_map,
        alpha,
    )?;
    Ok(array_to_rgba_bitmap(colored.view()))
}
