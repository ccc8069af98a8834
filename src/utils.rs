use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;

use image::{
    error::{ParameterError, ParameterErrorKind},
    ImageBuffer, ImageError, ImageOutputFormat, ImageResult, Rgb,
};
use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3, Axis, Zip};
use num_traits::ToPrimitive;

use crate::SegmentImage;

pub(crate) fn array_to_image(input: ArrayView3<u8>) -> ImageBuffer<Rgb<u8>, Vec<u8>> {
    let (height, width, _channels) = input.dim();
    let mut output = ImageBuffer::new(width as u32, height as u32);

    for (y, row) in input.outer_iter().enumerate() {
        for (x, pixel) in row.outer_iter().enumerate() {
            let pixel = Rgb([pixel[0], pixel[1], pixel[2]]);
            output.put_pixel(x as u32, y as u32, pixel);
        }
    }

    output
}

pub(crate) fn image_to_png(img: ImageBuffer<Rgb<u8>, Vec<u8>>) -> ImageResult<Vec<u8>> {
    let mut buffer = Vec::new();
    img.write_to(&mut Cursor::new(&mut buffer), ImageOutputFormat::Png)?;

    Ok(buffer)
}

/// Encode the first three channels of an 8-bit image as PNG. Images with one
/// or two channels are encoded as gray from their first channel.
pub fn array_to_png(input: ArrayView3<u8>) -> ImageResult<Vec<u8>> {
    let (height, width, channels) = input.dim();
    let img = match channels {
        0 => {
            return Err(ImageError::Parameter(ParameterError::from_kind(
                ParameterErrorKind::DimensionMismatch,
            )))
        }
        1 | 2 => {
            let gray = Array3::from_shape_fn((height, width, 3), |(y, x, _)| input[[y, x, 0]]);
            array_to_image(gray.view())
        }
        _ => array_to_image(input.slice(s![.., .., 0..3])),
    };
    image_to_png(img)
}

#[cfg_attr(not(feature = "wasm"), allow(dead_code))]
pub(crate) fn array_to_rgba_bitmap(input: ArrayView3<u8>) -> Vec<u8> {
    let (height, width, _channels) = input.dim();

    let mut output = vec![255; height * width * 4];

    for (y, row) in input.outer_iter().enumerate() {
        for (x, pixel) in row.outer_iter().enumerate() {
            let i = y * width + x;
            output[i * 4] = pixel[0];
            output[i * 4 + 1] = pixel[1];
            output[i * 4 + 2] = pixel[2];
        }
    }

    output
}

/// Stack a single band into three identical channels.
pub fn to_three_channels(band: ArrayView2<f32>) -> Array3<f32> {
    let (height, width) = band.dim();
    Array3::from_shape_fn((height, width, 3), |(y, x, _)| band[[y, x]])
}

/// Minimum and maximum of finite values, `(0, 0)` for an empty or all-NaN view.
pub fn value_range<'a, I>(values: I) -> (f32, f32)
where
    I: IntoIterator<Item = &'a f32>,
{
    let (min, max) = values
        .into_iter()
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    if min > max {
        (0.0, 0.0)
    } else {
        (min, max)
    }
}

/// Luminance with ITU-R 709 weights. Images with fewer than three channels
/// use their first channel.
pub fn gray(image: ArrayView3<f32>) -> Array2<f32> {
    let (height, width, channels) = image.dim();
    if channels < 3 {
        return image.index_axis(Axis(2), 0).to_owned();
    }
    Array2::from_shape_fn((height, width), |(y, x)| {
        0.2125 * image[[y, x, 0]] + 0.7154 * image[[y, x, 1]] + 0.0721 * image[[y, x, 2]]
    })
}

/// Convert any numeric image to 8-bit RGB.
///
/// Values already in `[0, 1]` are scaled by 255, values in `[0, 255]` are kept,
/// anything else is stretched from its own min/max.
pub fn to_rgb8<T>(image: ArrayView3<T>) -> Array3<u8>
where
    T: ToPrimitive + Copy,
{
    let (height, width, channels) = image.dim();
    let values = image.mapv(|v| v.to_f64().unwrap_or(0.0));
    let (min, max) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });

    let scale: Box<dyn Fn(f64) -> f64> = if min > max {
        Box::new(|_| 0.0)
    } else if min >= 0.0 && max <= 1.0 {
        Box::new(|v| v * 255.0)
    } else if min >= 0.0 && max <= 255.0 {
        Box::new(|v| v)
    } else if max > min {
        Box::new(move |v| (v - min) / (max - min) * 255.0)
    } else {
        Box::new(|_| 0.0)
    };

    Array3::from_shape_fn((height, width, 3), |(y, x, c)| {
        let channel = if channels >= 3 { c } else { 0 };
        let v = values[[y, x, channel]];
        if v.is_finite() {
            scale(v).round().clamp(0.0, 255.0) as u8
        } else {
            0
        }
    })
}

/// Shift ids so the smallest one is at least 1. Images already starting at 1
/// or above are returned unchanged. When `u32::MAX` is taken the ids are
/// renumbered instead, keeping their order.
pub fn ensure_positive_ids(segment_image: SegmentImage) -> SegmentImage {
    match segment_image.iter().min() {
        Some(0) if segment_image.iter().any(|id| *id == u32::MAX) => {
            relabel_sequential(&segment_image)
        }
        Some(0) => segment_image.mapv(|id| id + 1),
        _ => segment_image,
    }
}

/// Renumber ids to `1..=N` while keeping their relative order.
pub fn relabel_sequential(segment_image: &SegmentImage) -> SegmentImage {
    let mut mapping = BTreeMap::new();
    for &id in segment_image.iter() {
        mapping.entry(id).or_insert(0u32);
    }
    for (next, new_id) in mapping.values_mut().enumerate() {
        *new_id = next as u32 + 1;
    }

    let mut output = SegmentImage::zeros(segment_image.dim());
    Zip::from(&mut output)
        .and(segment_image)
        .for_each(|out, id| *out = mapping[id]);
    output
}

/// Turn a flat, row-major map of representative indices into ids `1..=N`
/// numbered by first appearance.
pub(crate) fn number_by_appearance(roots: &[usize], (height, width): (usize, usize)) -> SegmentImage {
    let mut ids = HashMap::new();
    SegmentImage::from_shape_fn((height, width), |(y, x)| {
        let next = ids.len() as u32 + 1;
        *ids.entry(roots[y * width + x]).or_insert(next)
    })
}

/// Distinct ids with their pixel counts, ascending by id.
pub fn id_counts(segment_image: ArrayView2<u32>) -> BTreeMap<u32, u32> {
    let mut counts = BTreeMap::new();
    for &id in segment_image.iter() {
        *counts.entry(id).or_insert(0u32) += 1;
    }
    counts
}
