//! Bounding volume hierarchy used by both acceleration structure levels.
//!
//! Nodes are stored so that every child follows its parent, with siblings in
//! adjacent slots. Refitting walks the array backwards.

use glam::{Affine3A, Vec3};

/// Primitives per leaf.
pub const MAX_LEAF_SIZE: usize = 2;

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
    };

    pub fn from_points(points: &[Vec3]) -> Self {
        points.iter().fold(Self::EMPTY, |acc, &p| acc.grow(p))
    }

    #[must_use]
    pub fn grow(self, point: Vec3) -> Self {
        Self {
            min: self.min.min(point),
            max: self.max.max(point),
        }
    }

    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min.cmpgt(self.max).any()
    }

    pub fn centroid(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Bounds of this box after `transform`.
    #[must_use]
    pub fn transformed(&self, transform: &Affine3A) -> Self {
        if self.is_empty() {
            return *self;
        }
        let mut out = Self::EMPTY;
        for corner in 0..8 {
            let p = Vec3::new(
                if corner & 1 == 0 { self.min.x } else { self.max.x },
                if corner & 2 == 0 { self.min.y } else { self.max.y },
                if corner & 4 == 0 { self.min.z } else { self.max.z },
            );
            out = out.grow(transform.transform_point3(p));
        }
        out
    }

    /// Slab test against a ray given by origin and inverse direction.
    pub fn hit(&self, origin: Vec3, inv_direction: Vec3, t_min: f32, t_max: f32) -> bool {
        let t0 = (self.min - origin) * inv_direction;
        let t1 = (self.max - origin) * inv_direction;
        let near = t0.min(t1).max_element().max(t_min);
        let far = t0.max(t1).min_element().min(t_max);
        near <= far
    }
}

#[derive(Debug, Clone, Copy)]
struct Node {
    bounds: Aabb,
    /// First primitive slot for leaves, left child index otherwise.
    first: u32,
    /// Primitive count; zero marks an interior node.
    count: u32,
}

impl Node {
    const PLACEHOLDER: Self = Self {
        bounds: Aabb::EMPTY,
        first: 0,
        count: 0,
    };

    const fn is_leaf(&self) -> bool {
        self.count > 0
    }
}

/// A binary BVH over primitive bounds.
#[derive(Debug, Clone, Default)]
pub struct Bvh {
    nodes: Vec<Node>,
    /// Primitive indices in leaf order.
    order: Vec<u32>,
}

impl Bvh {
    /// Build with median splits along the longest centroid axis.
    pub fn build(bounds: &[Aabb]) -> Self {
        let count = bounds.len();
        let mut order: Vec<u32> = (0..count as u32).collect();
        if count == 0 {
            return Self {
                nodes: Vec::new(),
                order,
            };
        }

        let mut nodes = vec![Node::PLACEHOLDER];
        let mut stack = vec![(0usize, 0usize, count)];
        while let Some((index, start, end)) = stack.pop() {
            let slice = &mut order[start..end];
            let node_bounds = slice
                .iter()
                .fold(Aabb::EMPTY, |acc, &p| acc.union(bounds[p as usize]));
            nodes[index].bounds = node_bounds;

            if slice.len() <= MAX_LEAF_SIZE {
                nodes[index].first = start as u32;
                nodes[index].count = slice.len() as u32;
                continue;
            }

            let centroids = slice
                .iter()
                .fold(Aabb::EMPTY, |acc, &p| acc.grow(bounds[p as usize].centroid()));
            let extent = centroids.max - centroids.min;
            let axis = if extent.x >= extent.y && extent.x >= extent.z {
                0
            } else if extent.y >= extent.z {
                1
            } else {
                2
            };

            let mid = slice.len() / 2;
            slice.select_nth_unstable_by(mid, |&a, &b| {
                bounds[a as usize].centroid()[axis].total_cmp(&bounds[b as usize].centroid()[axis])
            });

            let left = nodes.len();
            nodes.push(Node::PLACEHOLDER);
            nodes.push(Node::PLACEHOLDER);
            nodes[index].first = left as u32;
            nodes[index].count = 0;
            stack.push((left + 1, start + mid, end));
            stack.push((left, start, start + mid));
        }

        Self { nodes, order }
    }

    /// Recompute node bounds for moved primitives, keeping the topology.
    pub fn refit(&mut self, bounds: &[Aabb]) {
        debug_assert_eq!(bounds.len(), self.order.len(), "refit changed the primitive count");
        for index in (0..self.nodes.len()).rev() {
            let node = self.nodes[index];
            let first = node.first as usize;
            self.nodes[index].bounds = if node.is_leaf() {
                self.order[first..first + node.count as usize]
                    .iter()
                    .fold(Aabb::EMPTY, |acc, &p| acc.union(bounds[p as usize]))
            } else {
                self.nodes[first].bounds.union(self.nodes[first + 1].bounds)
            };
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn primitive_count(&self) -> usize {
        self.order.len()
    }

    /// Bounds of the whole hierarchy.
    pub fn bounds(&self) -> Aabb {
        self.nodes.first().map_or(Aabb::EMPTY, |root| root.bounds)
    }

    /// Closest accepted primitive along a ray.
    ///
    /// `test` receives a primitive index and the current closest distance and
    /// returns the hit distance and payload when the primitive is accepted
    /// closer than that.
    pub fn closest<T>(
        &self,
        origin: Vec3,
        direction: Vec3,
        t_min: f32,
        t_max: f32,
        mut test: impl FnMut(u32, f32) -> Option<(f32, T)>,
    ) -> Option<(f32, T)> {
        let Some(root) = self.nodes.first() else {
            return None;
        };
        let inv_direction = direction.recip();
        let mut best: Option<(f32, T)> = None;
        let mut t_closest = t_max;

        if !root.bounds.hit(origin, inv_direction, t_min, t_closest) {
            return None;
        }
        let mut stack = vec![0usize];
        while let Some(index) = stack.pop() {
            let node = &self.nodes[index];
            if !node.bounds.hit(origin, inv_direction, t_min, t_closest) {
                continue;
            }
            let first = node.first as usize;
            if node.is_leaf() {
                for &primitive in &self.order[first..first + node.count as usize] {
                    if let Some((t, payload)) = test(primitive, t_closest) {
                        t_closest = t;
                        best = Some((t, payload));
                    }
                }
            } else {
                stack.push(first + 1);
                stack.push(first);
            }
        }
        best
    }
}

/// Distance and barycentrics of a ray-triangle intersection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriangleHit {
    pub t: f32,
    pub u: f32,
    pub v: f32,
    /// The vertices appear counter-clockwise from the ray origin.
    pub counter_clockwise: bool,
}

/// Möller-Trumbore intersection over `[t_min, t_max]`.
pub fn intersect_triangle(
    origin: Vec3,
    direction: Vec3,
    vertices: &[Vec3; 3],
    t_min: f32,
    t_max: f32,
) -> Option<TriangleHit> {
    let e1 = vertices[1] - vertices[0];
    let e2 = vertices[2] - vertices[0];
    let p = direction.cross(e2);
    let det = e1.dot(p);
    if det.abs() < 1e-12 {
        return None;
    }
    let inv_det = det.recip();
    let s = origin - vertices[0];
    let u = s.dot(p) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(e1);
    let v = direction.dot(q) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = e2.dot(q) * inv_det;
    if t < t_min || t > t_max {
        return None;
    }
    Some(TriangleHit {
        t,
        u,
        v,
        counter_clockwise: det > 0.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn unit_boxes(count: usize) -> Vec<Aabb> {
        (0..count)
            .map(|i| {
                let base = Vec3::new(i as f32 * 2.0, 0.0, 0.0);
                Aabb {
                    min: base,
                    max: base + Vec3::ONE,
                }
            })
            .collect()
    }

    #[test]
    fn build_covers_every_primitive_once() {
        let boxes = unit_boxes(13);
        let bvh = Bvh::build(&boxes);
        let mut seen = bvh.order.clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..13).collect::<Vec<_>>());
        assert!(bvh.node_count() <= 2 * 13 - 1);
        assert_eq!(bvh.bounds().min, Vec3::ZERO);
        assert_eq!(bvh.bounds().max, Vec3::new(25.0, 1.0, 1.0));
    }

    #[test]
    fn children_follow_parents() {
        let bvh = Bvh::build(&unit_boxes(9));
        for (index, node) in bvh.nodes.iter().enumerate() {
            if !node.is_leaf() {
                assert!(node.first as usize > index);
            }
        }
    }

    #[test]
    fn refit_tracks_moved_primitives() {
        let mut boxes = unit_boxes(6);
        let mut bvh = Bvh::build(&boxes);
        let topology = bvh.node_count();
        for b in &mut boxes {
            b.min.y += 10.0;
            b.max.y += 10.0;
        }
        bvh.refit(&boxes);
        assert_eq!(bvh.node_count(), topology);
        assert_relative_eq!(bvh.bounds().min.y, 10.0);
        assert_relative_eq!(bvh.bounds().max.y, 11.0);
    }

    #[test]
    fn closest_picks_nearest_primitive() {
        let boxes = unit_boxes(8);
        let bvh = Bvh::build(&boxes);
        let origin = Vec3::new(-5.0, 0.5, 0.5);
        let direction = Vec3::X;
        let hit = bvh.closest(origin, direction, 0.0, f32::MAX, |p, t_max| {
            let t = boxes[p as usize].min.x - origin.x;
            (t < t_max).then_some((t, p))
        });
        assert_eq!(hit.map(|(_, p)| p), Some(0));
    }

    #[test]
    fn empty_hierarchy_misses() {
        let bvh = Bvh::build(&[]);
        assert!(bvh.bounds().is_empty());
        assert!(bvh
            .closest(Vec3::ZERO, Vec3::Z, 0.0, 1.0, |_, _| Some((0.5, ())))
            .is_none());
    }

    #[test]
    fn triangle_winding_is_reported_from_ray_origin() {
        let triangle = [
            Vec3::new(-1.0, -1.0, 0.0),
            Vec3::new(1.0, -1.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
        ];
        let toward_negative_z = intersect_triangle(
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::NEG_Z,
            &triangle,
            0.0,
            10.0,
        )
        .unwrap();
        assert!(toward_negative_z.counter_clockwise);
        assert_relative_eq!(toward_negative_z.t, 1.0);

        let toward_positive_z =
            intersect_triangle(Vec3::new(0.0, 0.0, -1.0), Vec3::Z, &triangle, 0.0, 10.0).unwrap();
        assert!(!toward_positive_z.counter_clockwise);
    }

    #[test]
    fn triangle_respects_interval_and_edges() {
        let triangle = [Vec3::ZERO, Vec3::X, Vec3::Y];
        let origin = Vec3::new(0.25, 0.25, 2.0);
        assert!(intersect_triangle(origin, Vec3::NEG_Z, &triangle, 0.0, 1.5).is_none());
        assert!(intersect_triangle(
            Vec3::new(0.9, 0.9, 2.0),
            Vec3::NEG_Z,
            &triangle,
            0.0,
            10.0
        )
        .is_none());
        let hit = intersect_triangle(origin, Vec3::NEG_Z, &triangle, 0.0, 10.0).unwrap();
        assert_relative_eq!(hit.u, 0.25);
        assert_relative_eq!(hit.v, 0.25);
    }
}
