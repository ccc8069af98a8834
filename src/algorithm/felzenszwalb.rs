//! Graph-based image segmentation after Felzenszwalb and Huttenlocher (2004).

use ndarray::ArrayView3;
use ordered_float::OrderedFloat;

use crate::{
    console_log, error::SegmentError, filters::gaussian_blur, utils::number_by_appearance,
    SegmentImage,
};

#[derive(Clone)]
struct Component {
    int_diff: f32,
    node_count: usize,
}

#[derive(Clone)]
enum ComponentSlot {
    Here(Component),
    There(usize),
}

/// Disjoint components of the pixel graph. A slot either holds its
/// component or points to a slot closer to it.
struct Components {
    slots: Vec<ComponentSlot>,
}

impl Components {
    fn new(n: usize) -> Self {
        Self {
            slots: vec![
                ComponentSlot::Here(Component {
                    int_diff: 0.0,
                    node_count: 1,
                });
                n
            ],
        }
    }

    fn find(&mut self, idx: usize) -> (usize, Component) {
        let mut root = idx;
        let component = loop {
            match &self.slots[root] {
                ComponentSlot::Here(component) => break component.clone(),
                ComponentSlot::There(next) => root = *next,
            }
        };
        // Path compression
        let mut i = idx;
        while let ComponentSlot::There(next) = self.slots[i] {
            self.slots[i] = ComponentSlot::There(root);
            i = next;
        }
        (root, component)
    }

    /// Merge `c2` into `c1` across an edge of `weight`.
    fn union(&mut self, (c1_idx, c1): (usize, Component), (c2_idx, c2): (usize, Component), weight: f32) {
        self.slots[c1_idx] = ComponentSlot::Here(Component {
            int_diff: c1.int_diff.max(c2.int_diff).max(weight),
            node_count: c1.node_count + c2.node_count,
        });
        self.slots[c2_idx] = ComponentSlot::There(c1_idx);
    }
}

/// 8-connected pixel graph weighted by colour distance, sorted by weight.
fn grid_edges(image: ArrayView3<f32>) -> Vec<(OrderedFloat<f32>, usize, usize)> {
    let (height, width, channels) = image.dim();
    let mut edges = Vec::with_capacity(height * width * 4);
    for y in 0..height {
        for x in 0..width {
            for (dy, dx) in [(0isize, 1isize), (1, 0), (1, 1), (1, -1)] {
                let (ny, nx) = (y as isize + dy, x as isize + dx);
                if ny >= height as isize || nx < 0 || nx >= width as isize {
                    continue;
                }
                let (ny, nx) = (ny as usize, nx as usize);
                let weight = (0..channels)
                    .map(|c| (image[[y, x, c]] - image[[ny, nx, c]]).powi(2))
                    .sum::<f32>()
                    .sqrt();
                edges.push((OrderedFloat(weight), y * width + x, ny * width + nx));
            }
        }
    }
    edges.sort();
    edges
}

/// `scale` plays the role of `k` on the 8-bit range; higher values give
/// larger regions. Components smaller than `min_size` are absorbed afterwards.
pub(crate) fn felzenszwalb(
    image: ArrayView3<f32>,
    scale: f64,
    min_size: usize,
    sigma: f64,
) -> Result<SegmentImage, SegmentError> {
    let (height, width, _) = image.dim();
    if height == 0 || width == 0 {
        return Err(SegmentError::InvalidInput("empty image".into()));
    }
    let smoothed = gaussian_blur(image, sigma);
    let k = (scale / 255.0) as f32;
    let edges = grid_edges(smoothed.view());

    let mut components = Components::new(height * width);
    for &(OrderedFloat(weight), v1, v2) in &edges {
        let c1 = components.find(v1);
        let c2 = components.find(v2);
        if c1.0 == c2.0 {
            continue;
        }
        let mint = f32::min(
            c1.1.int_diff + k / c1.1.node_count as f32,
            c2.1.int_diff + k / c2.1.node_count as f32,
        );
        if weight <= mint {
            components.union(c1, c2, weight);
        }
    }

    // Absorb undersized components into a neighbour
    for &(OrderedFloat(weight), v1, v2) in &edges {
        let c1 = components.find(v1);
        let c2 = components.find(v2);
        if c1.0 != c2.0 && (c1.1.node_count < min_size || c2.1.node_count < min_size) {
            components.union(c1, c2, weight);
        }
    }

    let roots: Vec<usize> = (0..height * width).map(|i| components.find(i).0).collect();
    let labels = number_by_appearance(&roots, (height, width));
    console_log!("Felzenszwalb: {} regions", labels.iter().max().copied().unwrap_or(0));
    Ok(labels)
}
