use ndarray::{Array1, ArrayView2, ArrayView3, Zip};
use petgraph::{
    graph::{EdgeIndex, NodeIndex},
    prelude::UnGraph,
    visit::EdgeRef,
};

use crate::{error::SegmentError, SegmentImage};

pub struct RegionNode {
    pub(crate) pixel_count: u32,        // number of pixels in the region
    pub(crate) total_color: Array1<f64>, // sum of values inside the region
    pub(crate) mean_color: Array1<f64>,  // total_color / pixel_count
}

impl RegionNode {
    fn init(channels: usize) -> Self {
        Self {
            pixel_count: 0,
            total_color: Array1::zeros(channels),
            mean_color: Array1::zeros(channels),
        }
    }

    fn refresh_mean(&mut self) {
        if self.pixel_count > 0 {
            self.mean_color = &self.total_color / self.pixel_count as f64;
        }
    }

    pub fn pixel_count(&self) -> u32 {
        self.pixel_count
    }

    pub fn mean_color(&self) -> &Array1<f64> {
        &self.mean_color
    }
}

pub struct RegionEdge {
    pub(crate) weight: f64,
    pub(crate) active: bool,
}

impl RegionEdge {
    fn new(weight: f64) -> Self {
        Self {
            weight,
            active: true,
        }
    }
}

/// Region adjacency graph with mean-colour nodes.
///
/// Node index `i` is region id `i`, so ids absent from the image are nodes with
/// no pixels and no edges. Merging never removes anything from the underlying
/// graph: absorbed nodes are emptied and their edges deactivated.
pub struct RegionGraph {
    graph: UnGraph<RegionNode, RegionEdge>,
    parents: Vec<u32>,
}

/// Euclidean distance between two mean colours.
pub(crate) fn color_distance(a: &RegionNode, b: &RegionNode) -> f64 {
    (&a.mean_color - &b.mean_color).mapv(|d| d * d).sum().sqrt()
}

impl RegionGraph {
    /// Build the graph of 4-adjacent regions of `labels`, with mean colours
    /// taken from `reference` (`(height, width, channels)`).
    ///
    /// Nodes are indexed by id, so `labels` should hold dense ids such as the
    /// output of [`relabel_sequential`](crate::utils::relabel_sequential).
    pub fn from_labels(
        reference: ArrayView3<f32>,
        labels: ArrayView2<u32>,
    ) -> Result<Self, SegmentError> {
        let (height, width, channels) = reference.dim();
        if labels.dim() != (height, width) {
            return Err(SegmentError::InvalidInput(format!(
                "segment image {:?} and reference image {:?} differ in shape",
                labels.dim(),
                (height, width)
            )));
        }
        let num_vertex = labels
            .iter()
            .max()
            .map(|m| *m as usize + 1)
            .ok_or_else(|| SegmentError::InvalidInput("empty segment image".into()))?;

        let mut graph = UnGraph::<RegionNode, RegionEdge>::with_capacity(num_vertex, 0);
        for _ in 0..num_vertex {
            graph.add_node(RegionNode::init(channels));
        }

        for ((y, x), label) in labels.indexed_iter() {
            let i = NodeIndex::new(*label as usize);

            let node_i = &mut graph[i];
            node_i.pixel_count += 1;
            for c in 0..channels {
                node_i.total_color[c] += reference[[y, x, c]] as f64;
            }

            // Loop over the neighbors (right and bottom)
            for (dy, dx) in [(0, 1), (1, 0)] {
                if let Some(n_label) = labels.get((y + dy, x + dx)) {
                    if n_label != label {
                        let j = NodeIndex::new(*n_label as usize);
                        if graph.find_edge(i, j).is_none() {
                            graph.add_edge(i, j, RegionEdge::new(0.0));
                        }
                    }
                }
            }
        }

        for node in graph.node_weights_mut() {
            node.refresh_mean();
        }

        let mut rag = Self {
            graph,
            parents: (0..num_vertex as u32).collect(),
        };
        for edge in rag.graph.edge_indices() {
            if let Some((a, b)) = rag.graph.edge_endpoints(edge) {
                rag.graph[edge].weight = color_distance(&rag.graph[a], &rag.graph[b]);
            }
        }
        Ok(rag)
    }

    pub fn node(&self, id: u32) -> &RegionNode {
        &self.graph[NodeIndex::new(id as usize)]
    }

    /// Whether `id` is a region that still owns pixels.
    pub fn is_alive(&self, id: u32) -> bool {
        (id as usize) < self.parents.len()
            && self.parents[id as usize] == id
            && self.node(id).pixel_count > 0
    }

    /// Live region ids, ascending.
    pub fn regions(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.parents.len() as u32).filter(|id| self.is_alive(*id))
    }

    pub fn region_count(&self) -> usize {
        self.regions().count()
    }

    /// Active neighbours of `id` with their edge weights, ascending by id.
    pub fn neighbors(&self, id: u32) -> Vec<(u32, f64)> {
        let mut neighbors: Vec<(u32, f64)> = self
            .graph
            .edges(NodeIndex::new(id as usize))
            .filter(|edge| edge.weight().active)
            .map(|edge| {
                let other = if edge.source().index() == id as usize {
                    edge.target()
                } else {
                    edge.source()
                };
                (other.index() as u32, edge.weight().weight)
            })
            .collect();
        neighbors.sort_by_key(|(n, _)| *n);
        neighbors.dedup_by_key(|(n, _)| *n);
        neighbors
    }

    /// Active edges as `(edge, a, b, weight)`.
    pub(crate) fn active_edges(&self) -> Vec<(EdgeIndex, u32, u32, f64)> {
        self.graph
            .edge_references()
            .filter(|edge| edge.weight().active)
            .map(|edge| {
                (
                    edge.id(),
                    edge.source().index() as u32,
                    edge.target().index() as u32,
                    edge.weight().weight,
                )
            })
            .collect()
    }

    /// Endpoints and weight of `edge` if it is still active.
    pub(crate) fn active_edge(&self, edge: EdgeIndex) -> Option<(u32, u32, f64)> {
        let weight = self.graph.edge_weight(edge)?;
        if !weight.active {
            return None;
        }
        let (a, b) = self.graph.edge_endpoints(edge)?;
        Some((a.index() as u32, b.index() as u32, weight.weight))
    }

    /// Absorb `src` into `dst`.
    ///
    /// `dst` gets the pixel-count-weighted mean colour of both; every edge
    /// touching either node is replaced by a fresh edge from `dst`, weighted by
    /// the new colour distance. The new edges are returned.
    pub fn merge(&mut self, src: u32, dst: u32) -> Vec<(EdgeIndex, f64)> {
        if src == dst || !self.is_alive(src) || !self.is_alive(dst) {
            return Vec::new();
        }
        let (src_i, dst_i) = (NodeIndex::new(src as usize), NodeIndex::new(dst as usize));

        let mut neighbors = Vec::new();
        for node in [src_i, dst_i] {
            let edges: Vec<EdgeIndex> = self
                .graph
                .edges(node)
                .filter(|edge| edge.weight().active)
                .map(|edge| edge.id())
                .collect();
            for edge in edges {
                self.graph[edge].active = false;
                if let Some((a, b)) = self.graph.edge_endpoints(edge) {
                    let other = if a == node { b } else { a };
                    if other != src_i && other != dst_i {
                        neighbors.push(other);
                    }
                }
            }
        }
        neighbors.sort();
        neighbors.dedup();

        let (src_node, dst_node) = self.graph.index_twice_mut(src_i, dst_i);
        dst_node.pixel_count += src_node.pixel_count;
        dst_node.total_color = &dst_node.total_color + &src_node.total_color;
        dst_node.refresh_mean();
        src_node.pixel_count = 0;
        self.parents[src as usize] = dst;

        neighbors
            .into_iter()
            .map(|n| {
                let weight = color_distance(&self.graph[dst_i], &self.graph[n]);
                (self.graph.add_edge(dst_i, n, RegionEdge::new(weight)), weight)
            })
            .collect()
    }

    /// The live region `id` ended up in.
    pub fn find(&self, mut id: u32) -> u32 {
        while let Some(&parent) = self.parents.get(id as usize) {
            if parent == id {
                break;
            }
            id = parent;
        }
        id
    }

    /// Rewrite `labels` through every merge performed so far.
    pub fn relabel(&self, labels: ArrayView2<u32>) -> SegmentImage {
        let mapping: Vec<u32> = (0..self.parents.len() as u32).map(|id| self.find(id)).collect();
        let mut output = SegmentImage::zeros(labels.dim());
        Zip::from(&mut output)
            .and(labels)
            .for_each(|out, id| *out = mapping[*id as usize]);
        output
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{array, Array2, Array3};

    use super::*;

    fn fixture() -> (Array3<f32>, Array2<u32>) {
        // 1 1 2
        // 1 1 2
        // 3 3 3
        let labels = array![[1, 1, 2], [1, 1, 2], [3, 3, 3]];
        let img = Array3::from_shape_fn((3, 3, 1), |(y, x, _)| match labels[[y, x]] {
            1 => 0.0,
            2 => 0.3,
            _ => 1.0,
        });
        (img, labels)
    }

    #[test]
    fn test_graph_from_labels() {
        let (img, labels) = fixture();
        let rag = RegionGraph::from_labels(img.view(), labels.view()).unwrap();

        assert_eq!(rag.region_count(), 3);
        assert!(!rag.is_alive(0));
        assert_eq!(rag.node(1).pixel_count(), 4);
        assert_eq!(rag.node(2).pixel_count(), 2);
        assert_eq!(rag.node(3).pixel_count(), 3);
        assert!((rag.node(2).mean_color()[0] - 0.3).abs() < 1e-6);

        let neighbors = rag.neighbors(1);
        assert_eq!(neighbors.iter().map(|n| n.0).collect::<Vec<_>>(), vec![2, 3]);
        assert!((neighbors[0].1 - 0.3).abs() < 1e-6);
        assert!((neighbors[1].1 - 1.0).abs() < 1e-6);
        assert_eq!(rag.active_edges().len(), 3);
    }

    #[test]
    fn test_merge_weights_mean_by_pixel_count() {
        let (img, labels) = fixture();
        let mut rag = RegionGraph::from_labels(img.view(), labels.view()).unwrap();

        let new_edges = rag.merge(2, 1);
        assert_eq!(new_edges.len(), 1);
        assert!(!rag.is_alive(2));
        assert_eq!(rag.node(1).pixel_count(), 6);
        // (4 * 0.0 + 2 * 0.3) / 6
        assert!((rag.node(1).mean_color()[0] - 0.1).abs() < 1e-6);
        assert!((new_edges[0].1 - 0.9).abs() < 1e-6);
        assert_eq!(rag.neighbors(1).len(), 1);
        assert_eq!(rag.active_edges().len(), 1);

        let relabeled = rag.relabel(labels.view());
        assert_eq!(relabeled, array![[1, 1, 1], [1, 1, 1], [3, 3, 3]]);
    }

    #[test]
    fn test_find_follows_chains() {
        let (img, labels) = fixture();
        let mut rag = RegionGraph::from_labels(img.view(), labels.view()).unwrap();
        rag.merge(2, 1);
        rag.merge(1, 3);
        assert_eq!(rag.find(2), 3);
        assert_eq!(rag.region_count(), 1);
        assert!(rag.neighbors(3).is_empty());
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let img = Array3::<f32>::zeros((2, 2, 1));
        let labels = Array2::<u32>::ones((3, 2));
        assert!(matches!(
            RegionGraph::from_labels(img.view(), labels.view()),
            Err(SegmentError::InvalidInput(_))
        ));
    }
}
