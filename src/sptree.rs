//! Barnes-Hut space-partitioning tree over a 1-, 2- or 3-dimensional
//! embedding.
//!
//! Every node covers an axis-aligned cell and stores the number of points
//! below it and their center of mass. Leaves hold at most one distinct
//! position; coincident points share a leaf. Nodes live in a flat arena and
//! the `2^dims` children of a node are stored contiguously.

use ndarray::ArrayView2;

/// Largest supported embedding dimensionality.
pub const MAX_DIMENSIONS: usize = 3;

/// Cells narrower than this are never split further.
const MIN_HALF_WIDTH: f32 = 1e-6;

type Point = [f32; MAX_DIMENSIONS];

#[derive(Clone, Debug)]
struct Node {
    center: Point,
    half_width: Point,
    center_of_mass: Point,
    cum_size: usize,
    points: Vec<usize>,
    first_child: Option<usize>,
}

impl Node {
    fn new(center: Point, half_width: Point) -> Self {
        Self {
            center,
            half_width,
            center_of_mass: [0.0; MAX_DIMENSIONS],
            cum_size: 0,
            points: Vec::new(),
            first_child: None,
        }
    }
}

/// Space-partitioning tree built over the rows of an embedding.
#[derive(Debug)]
pub struct SpTree<'a> {
    y: ArrayView2<'a, f32>,
    dims: usize,
    nodes: Vec<Node>,
}

impl<'a> SpTree<'a> {
    /// Builds the tree over all rows of `y`.
    ///
    /// # Panics
    /// * In debug builds, if `y` has more than [`MAX_DIMENSIONS`] columns
    pub fn new(y: ArrayView2<'a, f32>) -> Self {
        let (n, dims) = y.dim();
        debug_assert!(dims <= MAX_DIMENSIONS, "Unsupported dimensionality {dims}");
        let dims = dims.min(MAX_DIMENSIONS);

        let mut center = [0.0_f32; MAX_DIMENSIONS];
        let mut half_width = [0.0_f32; MAX_DIMENSIONS];
        if n > 0 {
            for d in 0..dims {
                let column = y.column(d);
                let mean = column.sum() / n as f32;
                let spread = column.iter().fold(0.0_f32, |m, &v| m.max((v - mean).abs()));
                center[d] = mean;
                half_width[d] = spread + 1e-5;
            }
        }

        let mut tree = Self {
            y,
            dims,
            nodes: vec![Node::new(center, half_width)],
        };
        for i in 0..n {
            tree.insert(0, i);
        }
        tree
    }

    /// Number of points below the root.
    pub fn len(&self) -> usize {
        self.nodes[0].cum_size
    }

    /// Returns `true` if the tree holds no point.
    pub fn is_empty(&self) -> bool {
        self.nodes[0].cum_size == 0
    }

    /// Center of mass of all points.
    pub fn center_of_mass(&self) -> &[f32] {
        &self.nodes[0].center_of_mass[..self.dims]
    }

    fn point(&self, i: usize) -> Point {
        let mut p = [0.0; MAX_DIMENSIONS];
        for (d, v) in p.iter_mut().enumerate().take(self.dims) {
            *v = self.y[[i, d]];
        }
        p
    }

    fn child_offset(&self, node: usize, p: &Point) -> usize {
        let center = &self.nodes[node].center;
        (0..self.dims)
            .filter(|&d| p[d] > center[d])
            .fold(0, |offset, d| offset | (1 << d))
    }

    fn insert(&mut self, node: usize, i: usize) {
        let p = self.point(i);
        let dims = self.dims;

        let nd = &mut self.nodes[node];
        nd.cum_size += 1;
        let count = nd.cum_size as f32;
        for d in 0..dims {
            nd.center_of_mass[d] += (p[d] - nd.center_of_mass[d]) / count;
        }

        if let Some(first) = nd.first_child {
            let child = first + self.child_offset(node, &p);
            self.insert(child, i);
            return;
        }

        let coincident = nd
            .points
            .first()
            .is_some_and(|&r| (0..dims).all(|d| self.y[[r, d]] == p[d]));
        let too_small = nd.half_width[..dims].iter().all(|&w| w < MIN_HALF_WIDTH);
        if nd.points.is_empty() || coincident || too_small {
            nd.points.push(i);
            return;
        }

        self.subdivide(node);
        let residents = std::mem::take(&mut self.nodes[node].points);
        let first = self.nodes.len() - (1 << dims);
        for r in residents.into_iter().chain(std::iter::once(i)) {
            let child = first + self.child_offset(node, &self.point(r));
            self.insert(child, r);
        }
    }

    fn subdivide(&mut self, node: usize) {
        let first = self.nodes.len();
        let Node {
            center, half_width, ..
        } = self.nodes[node].clone();

        for offset in 0..1_usize << self.dims {
            let mut child_center = center;
            let mut child_half = half_width;
            for d in 0..self.dims {
                child_half[d] = half_width[d] / 2.0;
                child_center[d] += if offset & (1 << d) == 0 {
                    -child_half[d]
                } else {
                    child_half[d]
                };
            }
            self.nodes.push(Node::new(child_center, child_half));
        }
        self.nodes[node].first_child = Some(first);
    }

    /// Repulsive forces on point `i`.
    ///
    /// Accumulates `Σ_j q_ij²·(y_i − y_j)` into `neg_force` with the
    /// unnormalized Student-t kernel `q_ij = 1 / (1 + ‖y_i − y_j‖²)`, and
    /// returns `Σ_j q_ij`. Cells whose half width divided by their distance
    /// is below `theta` are summarized by their center of mass; with
    /// `theta = 0` the result is exact.
    pub fn compute_non_edge_forces(&self, i: usize, theta: f32, neg_force: &mut [f64]) -> f64 {
        let p = self.point(i);
        let dims = self.dims;
        let mut sum_q = 0.0_f64;
        let mut stack = vec![0_usize];

        while let Some(node) = stack.pop() {
            let nd = &self.nodes[node];
            if nd.cum_size == 0 {
                continue;
            }

            match nd.first_child {
                None => {
                    for &r in nd.points.iter().filter(|&&r| r != i) {
                        let q = self.point(r);
                        let mut diff = [0.0_f64; MAX_DIMENSIONS];
                        let mut dist_sq = 0.0_f64;
                        for d in 0..dims {
                            diff[d] = f64::from(p[d]) - f64::from(q[d]);
                            dist_sq += diff[d] * diff[d];
                        }
                        let kernel = 1.0 / (1.0 + dist_sq);
                        sum_q += kernel;
                        for d in 0..dims {
                            neg_force[d] += kernel * kernel * diff[d];
                        }
                    }
                }
                Some(first) => {
                    let mut diff = [0.0_f64; MAX_DIMENSIONS];
                    let mut dist_sq = 0.0_f64;
                    for d in 0..dims {
                        diff[d] = f64::from(p[d]) - f64::from(nd.center_of_mass[d]);
                        dist_sq += diff[d] * diff[d];
                    }
                    let max_half_width = nd.half_width[..dims]
                        .iter()
                        .fold(0.0_f32, |m, &w| m.max(w));

                    if dist_sq > 0.0 && f64::from(max_half_width) / dist_sq.sqrt() < f64::from(theta) {
                        let kernel = 1.0 / (1.0 + dist_sq);
                        let mult = nd.cum_size as f64 * kernel;
                        sum_q += mult;
                        for d in 0..dims {
                            neg_force[d] += mult * kernel * diff[d];
                        }
                    } else {
                        stack.extend(first..first + (1 << dims));
                    }
                }
            }
        }

        sum_q
    }
}
