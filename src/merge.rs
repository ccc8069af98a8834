use std::{cmp::Ordering, collections::BinaryHeap};

use ndarray::ArrayView3;
use petgraph::{graph::EdgeIndex, unionfind::UnionFind};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    console_log,
    error::SegmentError,
    graph::RegionGraph,
    parameters::MergeMethod,
    utils::{relabel_sequential, value_range},
    SegmentImage,
};

/// Normalized cut stops splitting once the best cut costs this much.
const NCUT_THRESHOLD: f64 = 0.001;
const NCUT_NUM_CUTS: usize = 10;
const POWER_ITERATIONS: usize = 500;

#[derive(Debug, PartialEq)]
struct EdgeWrapper {
    index: EdgeIndex,
    weight: f64,
}

impl Eq for EdgeWrapper {}

impl PartialOrd for EdgeWrapper {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EdgeWrapper {
    fn cmp(&self, other: &Self) -> Ordering {
        // We want the smallest weight to be the first element
        other
            .weight
            .total_cmp(&self.weight)
            .then_with(|| other.index.cmp(&self.index))
    }
}

/// Merge visually similar adjacent regions.
///
/// `threshold` is a percentage of the value range of `reference`. The result is
/// renumbered to `1..=N`. If merging fails the input is returned as is.
pub fn merge(
    segment_image: &SegmentImage,
    reference: ArrayView3<f32>,
    method: MergeMethod,
    threshold: f64,
) -> SegmentImage {
    match try_merge(segment_image, reference, method, threshold) {
        Ok(merged) => merged,
        Err(err) => {
            log::warn!("region merge failed, keeping unmerged segments: {err}");
            segment_image.clone()
        }
    }
}

fn try_merge(
    segment_image: &SegmentImage,
    reference: ArrayView3<f32>,
    method: MergeMethod,
    threshold: f64,
) -> Result<SegmentImage, SegmentError> {
    let (min, max) = value_range(reference.iter());
    let absolute_threshold = threshold / 100.0 * (max - min) as f64;

    // One graph node per id: compact sparse ids first
    let segment_image = &relabel_sequential(segment_image);
    let rag = RegionGraph::from_labels(reference, segment_image.view())?;
    let before = rag.region_count();

    let merged = match method {
        MergeMethod::ThresholdCut => threshold_cut(&rag, segment_image, absolute_threshold),
        MergeMethod::NormalizedCut => normalized_cut(&rag, segment_image, (max - min) as f64)?,
        MergeMethod::Hierarchical => hierarchical(rag, segment_image, absolute_threshold),
    };
    let merged = relabel_sequential(&merged);

    console_log!(
        "{:?} merge: {} regions -> {} regions",
        method,
        before,
        merged.iter().max().copied().unwrap_or(0)
    );
    Ok(merged)
}

/// Union every pair of regions joined by an edge lighter than `threshold`.
fn threshold_cut(rag: &RegionGraph, segment_image: &SegmentImage, threshold: f64) -> SegmentImage {
    let num_vertex = segment_image.iter().max().map_or(0, |m| *m as usize + 1);
    let mut sets = UnionFind::<usize>::new(num_vertex);

    for (_, a, b, weight) in rag.active_edges() {
        if weight < threshold {
            sets.union(a as usize, b as usize);
        }
    }

    let roots = sets.into_labeling();
    segment_image.mapv(|id| roots[id as usize] as u32)
}

/// Greedily merge the lightest edge below `threshold`, recomputing mean colours
/// and edge weights at the absorbing region after each merge.
fn hierarchical(mut rag: RegionGraph, segment_image: &SegmentImage, threshold: f64) -> SegmentImage {
    let mut heap: BinaryHeap<EdgeWrapper> = rag
        .active_edges()
        .into_iter()
        .map(|(index, _, _, weight)| EdgeWrapper { index, weight })
        .collect();

    let mut merge_operations = 0;

    while let Some(top) = heap.pop() {
        if top.weight >= threshold {
            break;
        }
        // Stale entries point at deactivated edges
        let Some((a, b, weight)) = rag.active_edge(top.index) else {
            continue;
        };
        debug_assert!(weight == top.weight, "Heap consistency assert");

        let (src, dst) = if a < b { (b, a) } else { (a, b) };
        for (index, weight) in rag.merge(src, dst) {
            heap.push(EdgeWrapper { index, weight });
        }
        merge_operations += 1;
    }

    console_log!("Hierarchical merge: {} merge operations", merge_operations);

    rag.relabel(segment_image.view())
}

/// Adjacency of the similarity graph restricted to a set of regions,
/// self-loops included.
struct Similarity {
    neighbors: Vec<Vec<(usize, f64)>>,
}

impl Similarity {
    fn from_rag(rag: &RegionGraph, regions: &[u32], sigma: f64) -> Self {
        let position = |id: u32| regions.binary_search(&id).ok();
        let neighbors = regions
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let mut row: Vec<(usize, f64)> = rag
                    .neighbors(*id)
                    .into_iter()
                    .filter_map(|(n, distance)| {
                        position(n).map(|j| (j, (-(distance * distance) / sigma).exp()))
                    })
                    .collect();
                row.push((i, 1.0));
                row
            })
            .collect();
        Self { neighbors }
    }

    fn subset(&self, members: &[usize]) -> Self {
        let mut local = vec![usize::MAX; self.neighbors.len()];
        for (i, m) in members.iter().enumerate() {
            local[*m] = i;
        }
        let neighbors = members
            .iter()
            .map(|m| {
                self.neighbors[*m]
                    .iter()
                    .filter(|(n, _)| local[*n] != usize::MAX)
                    .map(|(n, w)| (local[*n], *w))
                    .collect()
            })
            .collect();
        Self { neighbors }
    }

    fn len(&self) -> usize {
        self.neighbors.len()
    }

    fn degrees(&self) -> Vec<f64> {
        self.neighbors
            .iter()
            .map(|row| row.iter().map(|(_, w)| w).sum())
            .collect()
    }

    /// Second eigenvector of the normalized Laplacian.
    ///
    /// Power iteration on `D^-1/2 W D^-1/2 + I`, deflated against its
    /// leading eigenvector `D^1/2 1`.
    fn fiedler(&self, degrees: &[f64], rng: &mut StdRng) -> Result<Vec<f64>, SegmentError> {
        let n = self.len();
        let inv_sqrt: Vec<f64> = degrees.iter().map(|d| 1.0 / d.sqrt()).collect();
        let trivial_norm = degrees.iter().sum::<f64>().sqrt();
        let trivial: Vec<f64> = degrees.iter().map(|d| d.sqrt() / trivial_norm).collect();

        let deflate = |v: &mut Vec<f64>| {
            let dot: f64 = v.iter().zip(&trivial).map(|(a, b)| a * b).sum();
            for (x, t) in v.iter_mut().zip(&trivial) {
                *x -= dot * t;
            }
        };
        let normalize = |v: &mut Vec<f64>| -> f64 {
            let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
            if norm > 0.0 {
                v.iter_mut().for_each(|x| *x /= norm);
            }
            norm
        };

        let mut v: Vec<f64> = (0..n).map(|_| rng.random_range(-1.0..1.0)).collect();
        deflate(&mut v);
        normalize(&mut v);

        for _ in 0..POWER_ITERATIONS {
            let mut next: Vec<f64> = (0..n)
                .map(|i| {
                    v[i] + self.neighbors[i]
                        .iter()
                        .map(|(j, w)| inv_sqrt[i] * w * inv_sqrt[*j] * v[*j])
                        .sum::<f64>()
                })
                .collect();
            deflate(&mut next);
            if normalize(&mut next) == 0.0 {
                break;
            }
            let delta: f64 = next.iter().zip(&v).map(|(a, b)| (a - b).abs()).sum();
            v = next;
            if delta < 1e-10 {
                break;
            }
        }

        if v.iter().any(|x| !x.is_finite()) {
            return Err(SegmentError::Degenerate(
                "normalized cut eigenvector is not finite".into(),
            ));
        }
        Ok(v)
    }

    /// Normalized cut cost of splitting into `mask` and its complement.
    fn ncut_cost(&self, mask: &[bool], degrees: &[f64]) -> f64 {
        let mut cut = 0.0;
        for (i, row) in self.neighbors.iter().enumerate() {
            for (j, w) in row {
                if mask[i] != mask[*j] {
                    cut += w;
                }
            }
        }
        let assoc_a: f64 = degrees.iter().zip(mask).filter(|(_, m)| **m).map(|(d, _)| d).sum();
        let assoc_b: f64 = degrees.iter().zip(mask).filter(|(_, m)| !**m).map(|(d, _)| d).sum();
        cut / assoc_a + cut / assoc_b
    }

    /// Best 2-way split among evenly spaced thresholds on the eigenvector.
    fn min_ncut(&self, eigenvector: &[f64], degrees: &[f64]) -> Option<(Vec<bool>, f64)> {
        let (lo, hi) = eigenvector
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
        if !hi.is_finite() || hi <= lo {
            return None;
        }

        let mut best: Option<(Vec<bool>, f64)> = None;
        for k in 0..NCUT_NUM_CUTS {
            let t = lo + (hi - lo) * k as f64 / NCUT_NUM_CUTS as f64;
            let mask: Vec<bool> = eigenvector.iter().map(|v| *v > t).collect();
            if mask.iter().all(|m| *m) || !mask.iter().any(|m| *m) {
                continue;
            }
            let cost = self.ncut_cost(&mask, degrees);
            if best.as_ref().map_or(true, |(_, c)| cost < *c) {
                best = Some((mask, cost));
            }
        }
        best
    }
}

/// Recursive 2-way normalized cut over the mean-colour similarity graph.
fn normalized_cut(
    rag: &RegionGraph,
    segment_image: &SegmentImage,
    range: f64,
) -> Result<SegmentImage, SegmentError> {
    let regions: Vec<u32> = rag.regions().collect();
    // Similarity falls off on the scale of the image's own value range
    let sigma = (255.0 * (range / 255.0).powi(2)).max(f64::EPSILON);
    let graph = Similarity::from_rag(rag, &regions, sigma);
    let mut rng = StdRng::seed_from_u64(0);

    let mut assignment = vec![0u32; regions.len()];
    let mut next_label = 1;
    let mut pending: Vec<Vec<usize>> = vec![(0..regions.len()).collect()];

    while let Some(members) = pending.pop() {
        let sub = graph.subset(&members);
        let mut split = None;
        if sub.len() > 2 {
            let degrees = sub.degrees();
            let eigenvector = sub.fiedler(&degrees, &mut rng)?;
            if let Some((mask, cost)) = sub.min_ncut(&eigenvector, &degrees) {
                if cost < NCUT_THRESHOLD {
                    split = Some(mask);
                }
            }
        }

        match split {
            Some(mask) => {
                let (a, b): (Vec<(usize, bool)>, Vec<(usize, bool)>) =
                    members.into_iter().zip(mask).partition(|(_, m)| *m);
                pending.push(b.into_iter().map(|(i, _)| i).collect());
                pending.push(a.into_iter().map(|(i, _)| i).collect());
            }
            None => {
                for i in members {
                    assignment[i] = next_label;
                }
                next_label += 1;
            }
        }
    }

    let num_vertex = segment_image.iter().max().map_or(0, |m| *m as usize + 1);
    let mut mapping = vec![0u32; num_vertex];
    for (id, label) in regions.iter().zip(&assignment) {
        mapping[*id as usize] = *label;
    }
    Ok(segment_image.mapv(|id| mapping[id as usize]))
}
