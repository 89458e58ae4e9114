//! # Safe flight corridor generation
//!
//! Wraps the reference path in a sequence of convex polytopes, each valid
//! within a time interval. A polytope starts as a bloated axis-aligned box
//! around a stride segment of the path; every obstacle point active in the
//! segment's time window then carves a separating half-space, backed off
//! from the obstacle by the safety margin and verified to keep the reference
//! samples inside. The half-space representation feeds the optimizer and
//! the corridor message.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::egress::{FaceMsg, PolytopeMsg};
use log::{debug, warn};
use nalgebra::Vector3;

use crate::params::CorridorParams;
use crate::search::{sample_path, TimedNode};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// One face of a polytope: a point on the plane and the outward normal.
#[derive(Debug, Clone, Copy)]
pub struct Face {
    pub point_m: Vector3<f64>,
    pub normal: Vector3<f64>,
}

/// A convex polytope of the corridor, valid for `duration_s` of flight time.
#[derive(Debug, Clone)]
pub struct Polytope {
    pub faces: Vec<Face>,

    /// Time the trajectory is allowed to spend inside this polytope.
    pub duration_s: f64,

    /// The reference segment endpoints this polytope was seeded from. Both
    /// are interior points by construction.
    pub seed: [Vector3<f64>; 2],
}

/// The corridor generator.
#[derive(Debug, Clone)]
pub struct CorridorGen {
    params: CorridorParams,

    /// Dense sampling step along the reference path, in seconds.
    dt_sample_s: f64,

    /// Margin by which the reference path must stay inside every face, in
    /// meters. Matches the inward margin the trajectory optimizer enforces,
    /// so the reference itself can never violate the tightened corridor.
    interior_m: f64,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CorridorError {
    #[error("Too few reference nodes to build a corridor ({0})")]
    TooFewNodes(usize),

    #[error("An obstacle point is too close to the reference path in segment {0}")]
    ObstacleTooClose(usize),

    #[error("Adjacent polytopes {0} and {1} do not intersect")]
    EmptyIntersection(usize, usize),

    #[error("Reference sample at t={0:.2} s lies outside its polytope")]
    SampleOutside(f64),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Polytope {
    /// True if the point satisfies every half-space, pulled inwards by
    /// `margin_m`.
    pub fn contains(&self, p: &Vector3<f64>, margin_m: f64) -> bool {
        self.faces
            .iter()
            .all(|f| (p - f.point_m).dot(&f.normal) <= -margin_m)
    }

    /// True if this polytope and the other have a non-empty intersection.
    ///
    /// Adjacent corridor polytopes share a reference node, so containment of
    /// either seed endpoint witnesses the intersection.
    pub fn intersects(&self, other: &Polytope) -> bool {
        other.seed.iter().any(|s| self.contains(s, 0.0))
            || self.seed.iter().any(|s| other.contains(s, 0.0))
    }

    /// Interior anchor point of the polytope.
    pub fn anchor(&self) -> Vector3<f64> {
        (self.seed[0] + self.seed[1]) / 2.0
    }

    /// Project a point into the polytope shrunk inwards by `margin_m`, by
    /// bisecting along the line towards the interior anchor.
    pub fn clamp_inside(&self, p: &Vector3<f64>, margin_m: f64) -> Vector3<f64> {
        if self.contains(p, margin_m) {
            return *p;
        }

        let anchor = self.anchor();
        if !self.contains(&anchor, margin_m) {
            return anchor;
        }

        let mut lo = 0.0;
        let mut hi = 1.0;
        for _ in 0..24 {
            let mid = 0.5 * (lo + hi);
            if self.contains(&(anchor + (p - anchor) * mid), margin_m) {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        anchor + (p - anchor) * lo
    }

    pub fn to_msg(&self) -> PolytopeMsg {
        PolytopeMsg {
            duration_s: self.duration_s,
            faces: self
                .faces
                .iter()
                .map(|f| FaceMsg {
                    point_m: f.point_m,
                    normal: f.normal,
                })
                .collect(),
        }
    }
}

impl CorridorGen {
    pub fn new(params: CorridorParams, dt_sample_s: f64, interior_m: f64) -> Self {
        Self {
            params,
            dt_sample_s,
            interior_m,
        }
    }

    /// Build one polytope per stride-th reference node.
    ///
    /// `t0_s` is the session time of the first node; obstacle points for each
    /// segment are fetched through `gather(t_lo_s, t_hi_s, search_lo,
    /// search_hi)` restricted to the matching time window. `margin_m` is the
    /// clearance kept between polytope faces and obstacle points, reduced
    /// where the reference path itself is closer than the margin allows.
    pub fn find_corridors<F>(
        &self,
        nodes: &[TimedNode],
        t0_s: f64,
        margin_m: f64,
        mut gather: F,
    ) -> Result<Vec<Polytope>, CorridorError>
    where
        F: FnMut(f64, f64, &Vector3<f64>, &Vector3<f64>) -> Vec<Vector3<f64>>,
    {
        if nodes.len() < 2 {
            return Err(CorridorError::TooFewNodes(nodes.len()));
        }

        let stride = self.params.stride.max(1);
        let mut corridors = Vec::new();

        let mut i = 0;
        let mut seg_idx = 0;
        while i < nodes.len() - 1 {
            // A segment wrapping tightly around an obstacle may have no
            // convex cover; fall back to shorter spans until one carves
            let mut j = (i + stride).min(nodes.len() - 1);
            let polytope = loop {
                let segment = &nodes[i..=j];

                let samples: Vec<Vector3<f64>> = sample_path(segment, self.dt_sample_s)
                    .iter()
                    .map(|s| s.position_m)
                    .collect();

                let (seed_lo, seed_hi) = aabb(&samples);
                let reach = self.params.bloat_m + margin_m;
                let search_lo = seed_lo - Vector3::repeat(reach);
                let search_hi = seed_hi + Vector3::repeat(reach);

                let t_lo = t0_s + nodes[i].time_s;
                let t_hi = t0_s + nodes[j].time_s;
                let obstacles = gather(t_lo, t_hi, &search_lo, &search_hi);

                match self.carve(&samples, &seed_lo, &seed_hi, &obstacles, margin_m) {
                    Some(faces) => {
                        break Polytope {
                            faces,
                            duration_s: nodes[j].time_s - nodes[i].time_s,
                            seed: [nodes[i].position_m, nodes[j].position_m],
                        }
                    }
                    None if j > i + 1 => j -= 1,
                    None => {
                        warn!("Obstacle too close to the reference in segment {}", seg_idx);
                        return Err(CorridorError::ObstacleTooClose(seg_idx));
                    }
                }
            };

            corridors.push(polytope);
            i = j;
            seg_idx += 1;
        }

        if self.params.enable_short_cut {
            corridors = Self::short_cut(corridors);
        }

        Self::validate(&corridors, nodes, t0_s)?;
        debug!("Corridor of {} polytopes built", corridors.len());

        Ok(corridors)
    }

    /// Alternate form: cover a dense path directly against an obstacle point
    /// cloud, clipped to the world-frame box `[bbox_lo, bbox_hi]`. Durations
    /// are left at zero for the caller to allocate.
    pub fn convex_cover(
        &self,
        path: &[Vector3<f64>],
        cloud: &[Vector3<f64>],
        bbox_lo: &Vector3<f64>,
        bbox_hi: &Vector3<f64>,
        bloat_m: f64,
        margin_m: f64,
    ) -> Result<Vec<Polytope>, CorridorError> {
        if path.len() < 2 {
            return Err(CorridorError::TooFewNodes(path.len()));
        }

        let mut out = Vec::new();
        for (seg_idx, pair) in path.windows(2).enumerate() {
            let samples = [pair[0], pair[1]];
            let seed_lo = pair[0].inf(&pair[1]).sup(bbox_lo);
            let seed_hi = pair[0].sup(&pair[1]).inf(bbox_hi);

            let mut faces = match self.carve_with_bloat(
                &samples,
                &seed_lo,
                &seed_hi,
                cloud,
                bloat_m,
                margin_m,
            ) {
                Some(f) => f,
                None => return Err(CorridorError::ObstacleTooClose(seg_idx)),
            };

            // Clip to the world box
            faces.push(Face {
                point_m: *bbox_hi,
                normal: Vector3::x(),
            });
            faces.push(Face {
                point_m: *bbox_hi,
                normal: Vector3::y(),
            });
            faces.push(Face {
                point_m: *bbox_hi,
                normal: Vector3::z(),
            });
            faces.push(Face {
                point_m: *bbox_lo,
                normal: -Vector3::x(),
            });
            faces.push(Face {
                point_m: *bbox_lo,
                normal: -Vector3::y(),
            });
            faces.push(Face {
                point_m: *bbox_lo,
                normal: -Vector3::z(),
            });

            out.push(Polytope {
                faces,
                duration_s: 0.0,
                seed: [pair[0], pair[1]],
            });
        }

        Ok(out)
    }

    fn carve(
        &self,
        samples: &[Vector3<f64>],
        seed_lo: &Vector3<f64>,
        seed_hi: &Vector3<f64>,
        obstacles: &[Vector3<f64>],
        margin_m: f64,
    ) -> Option<Vec<Face>> {
        self.carve_with_bloat(
            samples,
            seed_lo,
            seed_hi,
            obstacles,
            self.params.bloat_m,
            margin_m,
        )
    }

    /// Carve the polytope of one segment.
    ///
    /// Starts from the bloated box around the seed, then walks the obstacle
    /// points in order of distance to the reference samples. A point already
    /// outside an existing face is done; otherwise it contributes a
    /// separating face normal to the direction from its nearest reference
    /// sample, backed off by the margin and relaxed just enough to keep
    /// every reference sample inside. Returns `None` when no positive
    /// back-off remains, i.e. the obstacle touches the reference path.
    fn carve_with_bloat(
        &self,
        samples: &[Vector3<f64>],
        seed_lo: &Vector3<f64>,
        seed_hi: &Vector3<f64>,
        obstacles: &[Vector3<f64>],
        bloat_m: f64,
        margin_m: f64,
    ) -> Option<Vec<Face>> {
        let mut faces = box_faces(
            &(seed_lo - Vector3::repeat(bloat_m)),
            &(seed_hi + Vector3::repeat(bloat_m)),
        );

        // Nearest obstacles first, so their faces exclude the farther ones
        let mut ordered: Vec<(f64, usize, Vector3<f64>)> = obstacles
            .iter()
            .map(|p| {
                let (d, q_idx) = nearest_sample(samples, p);
                (d, q_idx, *p)
            })
            .collect();
        ordered.sort_by(|a, b| a.0.partial_cmp(&b.0).expect("Unexpected NaN distance"));

        let chord = (samples[0], samples[samples.len() - 1]);

        for (dist, q_idx, p) in ordered {
            // Already excluded by an existing face with the full margin
            if faces
                .iter()
                .any(|f| (p - f.point_m).dot(&f.normal) >= margin_m)
            {
                continue;
            }

            if dist <= self.interior_m {
                return None;
            }

            // Candidate separating directions: away from the nearest
            // reference sample, and away from the segment chord (which
            // separates obstacles sitting over the sag of a curved segment)
            let q_chord = closest_on_segment(&chord.0, &chord.1, &p);
            let candidates = [p - samples[q_idx], p - q_chord];

            let face = candidates.iter().find_map(|dir| {
                let len = dir.norm();
                if len < 1e-6 {
                    return None;
                }
                let normal = dir / len;

                // Back off by the margin where the path allows it, then
                // relax until every reference sample keeps the interior
                // margin inside the face
                let mut offset = margin_m.min(len - self.interior_m - 1e-2);
                let worst = samples
                    .iter()
                    .map(|x| (x - p).dot(&normal))
                    .fold(f64::NEG_INFINITY, f64::max);
                if worst + offset > -self.interior_m {
                    offset = -worst - self.interior_m - 1e-3;
                }
                if offset <= 1e-3 {
                    return None;
                }

                Some(Face {
                    point_m: p - offset * normal,
                    normal,
                })
            })?;

            faces.push(face);
        }

        Some(faces)
    }

    /// Merge a polytope into its successor when the successor already covers
    /// its reference segment. The merged element keeps the successor's
    /// geometry and the summed duration.
    fn short_cut(polys: Vec<Polytope>) -> Vec<Polytope> {
        let mut out: Vec<Polytope> = Vec::with_capacity(polys.len());
        let mut iter = polys.into_iter().peekable();

        while let Some(current) = iter.next() {
            match iter.peek_mut() {
                Some(next)
                    if next.contains(&current.seed[0], 0.0)
                        && next.contains(&current.seed[1], 0.0) =>
                {
                    next.duration_s += current.duration_s;
                    next.seed[0] = current.seed[0];
                }
                _ => out.push(current),
            }
        }

        out
    }

    /// Check the corridor invariants: every reference node inside the
    /// polytope whose window contains it, and non-empty adjacent
    /// intersections.
    fn validate(
        corridors: &[Polytope],
        nodes: &[TimedNode],
        t0_s: f64,
    ) -> Result<(), CorridorError> {
        for (i, pair) in corridors.windows(2).enumerate() {
            if !pair[0].intersects(&pair[1]) {
                return Err(CorridorError::EmptyIntersection(i, i + 1));
            }
        }

        // Walk nodes against the cumulative time windows
        let mut window_start = nodes[0].time_s;
        let mut k = 0;
        for node in nodes {
            while k < corridors.len()
                && node.time_s > window_start + corridors[k].duration_s + 1e-9
            {
                window_start += corridors[k].duration_s;
                k += 1;
            }
            if k >= corridors.len() {
                break;
            }
            if !corridors[k].contains(&node.position_m, 0.0) {
                return Err(CorridorError::SampleOutside(t0_s + node.time_s));
            }
        }

        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// The six axis-aligned faces of a box.
fn box_faces(lo: &Vector3<f64>, hi: &Vector3<f64>) -> Vec<Face> {
    vec![
        Face {
            point_m: *hi,
            normal: Vector3::x(),
        },
        Face {
            point_m: *lo,
            normal: -Vector3::x(),
        },
        Face {
            point_m: *hi,
            normal: Vector3::y(),
        },
        Face {
            point_m: *lo,
            normal: -Vector3::y(),
        },
        Face {
            point_m: *hi,
            normal: Vector3::z(),
        },
        Face {
            point_m: *lo,
            normal: -Vector3::z(),
        },
    ]
}

/// Axis-aligned bounds of a point set.
fn aabb(points: &[Vector3<f64>]) -> (Vector3<f64>, Vector3<f64>) {
    let mut lo = points[0];
    let mut hi = points[0];
    for p in points {
        lo = lo.inf(p);
        hi = hi.sup(p);
    }
    (lo, hi)
}

/// Distance from `p` to its nearest sample, and that sample's index.
fn nearest_sample(samples: &[Vector3<f64>], p: &Vector3<f64>) -> (f64, usize) {
    let mut best = (f64::MAX, 0);
    for (i, s) in samples.iter().enumerate() {
        let d = (p - s).norm();
        if d < best.0 {
            best = (d, i);
        }
    }
    best
}

/// Closest point to `p` on the segment `[a, b]`.
fn closest_on_segment(a: &Vector3<f64>, b: &Vector3<f64>, p: &Vector3<f64>) -> Vector3<f64> {
    let ab = b - a;
    let len_sq = ab.norm_squared();
    if len_sq < 1e-12 {
        return *a;
    }
    let t = ((p - a).dot(&ab) / len_sq).clamp(0.0, 1.0);
    a + ab * t
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    fn params() -> CorridorParams {
        CorridorParams {
            stride: 2,
            bloat_m: 3.0,
            risk_threshold_corridor: 0.2,
            enable_short_cut: false,
        }
    }

    fn gen() -> CorridorGen {
        CorridorGen::new(params(), 0.1, 0.1)
    }

    fn straight_nodes(n: usize, spacing: f64) -> Vec<TimedNode> {
        (0..n)
            .map(|i| TimedNode {
                time_s: 0.4 * i as f64,
                position_m: Vector3::new(spacing * i as f64, 0.0, 1.0),
                velocity_ms: Vector3::new(spacing / 0.4, 0.0, 0.0),
            })
            .collect()
    }

    #[test]
    fn test_empty_world_boxes_bloat_fully() {
        let nodes = straight_nodes(5, 1.0);

        let corridors = gen()
            .find_corridors(&nodes, 0.0, 0.25, |_, _, _, _| vec![])
            .unwrap();

        assert_eq!(corridors.len(), 2);
        for c in &corridors {
            // The bloated box extends well beyond the seed on every side
            assert!(c.contains(&(c.anchor() + Vector3::new(0.0, 2.9, 0.0)), 0.0));
            assert!(c.contains(&(c.anchor() - Vector3::new(0.0, 2.9, 0.0)), 0.0));
            assert!(!c.contains(&(c.anchor() + Vector3::new(0.0, 5.0, 0.0)), 0.0));
        }

        // Durations come from actual inter-node times, 2 nodes per stride
        assert!((corridors[0].duration_s - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_obstacle_carves_separating_face() {
        let nodes = straight_nodes(3, 1.0);

        // A wall of points at y = 1.0 alongside the whole segment
        let wall: Vec<Vector3<f64>> = (0..30)
            .map(|i| Vector3::new(-1.0 + 0.2 * i as f64, 1.0, 1.0))
            .collect();

        let corridors = gen()
            .find_corridors(&nodes, 0.0, 0.25, |_, _, _, _| wall.clone())
            .unwrap();

        let c = &corridors[0];

        // No wall point is inside the polytope
        for p in &wall {
            assert!(!c.contains(p, 0.0));
        }

        // The face keeps the margin: a point within the margin band of the
        // wall is excluded, the reference side remains free
        assert!(!c.contains(&Vector3::new(1.0, 0.8, 1.0), 0.0));
        assert!(c.contains(&Vector3::new(1.0, 0.5, 1.0), 0.0));
        assert!(c.contains(&Vector3::new(1.0, -2.0, 1.0), 0.0));
    }

    #[test]
    fn test_diagonal_segment_with_chord_side_obstacle() {
        // A bent path dodging below an obstacle which sits over the sag of
        // the segment, away from the path itself
        let nodes = vec![
            TimedNode {
                time_s: 0.0,
                position_m: Vector3::new(0.0, 0.0, 1.0),
                velocity_ms: Vector3::new(2.5, -2.5, 0.0),
            },
            TimedNode {
                time_s: 0.4,
                position_m: Vector3::new(1.0, -0.5, 1.0),
                velocity_ms: Vector3::new(2.5, 0.0, 0.0),
            },
            TimedNode {
                time_s: 0.8,
                position_m: Vector3::new(2.0, 0.0, 1.0),
                velocity_ms: Vector3::new(2.5, 2.5, 0.0),
            },
        ];

        let obstacle = vec![Vector3::new(1.5, -0.05, 1.0)];

        let corridors = gen()
            .find_corridors(&nodes, 0.0, 0.25, |_, _, _, _| obstacle.clone())
            .unwrap();

        let c = &corridors[0];
        assert!(!c.contains(&obstacle[0], 0.0));
        for node in &nodes {
            assert!(c.contains(&node.position_m, 0.0));
        }
    }

    #[test]
    fn test_reference_nodes_inside_and_adjacent_intersect() {
        let mut nodes = straight_nodes(7, 0.8);
        // Bend the path
        for (i, node) in nodes.iter_mut().enumerate() {
            node.position_m.y = 0.3 * (i as f64 / 2.0).floor();
        }

        let corridors = gen()
            .find_corridors(&nodes, 0.0, 0.25, |_, _, _, _| vec![])
            .unwrap();

        for pair in corridors.windows(2) {
            assert!(pair[0].intersects(&pair[1]));
        }

        let mut window_start = 0.0;
        let mut k = 0;
        for node in &nodes {
            while k < corridors.len() && node.time_s > window_start + corridors[k].duration_s {
                window_start += corridors[k].duration_s;
                k += 1;
            }
            if k < corridors.len() {
                assert!(corridors[k].contains(&node.position_m, 0.0));
            }
        }
    }

    #[test]
    fn test_obstacle_on_path_is_infeasible() {
        let nodes = straight_nodes(3, 1.0);

        let result = gen().find_corridors(&nodes, 0.0, 0.25, |_, _, _, _| {
            vec![Vector3::new(1.0, 0.0, 1.0)]
        });

        assert!(matches!(result, Err(CorridorError::ObstacleTooClose(_))));
    }

    #[test]
    fn test_clamp_inside_projects_towards_anchor() {
        let nodes = straight_nodes(3, 1.0);
        let wall: Vec<Vector3<f64>> = (0..30)
            .map(|i| Vector3::new(-1.0 + 0.2 * i as f64, 1.0, 1.0))
            .collect();

        let corridors = gen()
            .find_corridors(&nodes, 0.0, 0.25, |_, _, _, _| wall.clone())
            .unwrap();
        let c = &corridors[0];

        // A point beyond the wall projects back inside with the margin
        let outside = Vector3::new(1.0, 2.0, 1.0);
        let clamped = c.clamp_inside(&outside, 0.1);
        assert!(c.contains(&clamped, 0.05));

        // An interior point is untouched
        let inside = Vector3::new(1.0, 0.0, 1.0);
        assert_eq!(c.clamp_inside(&inside, 0.1), inside);
    }

    #[test]
    fn test_convex_cover() {
        let path = vec![
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(1.0, 0.0, 1.0),
            Vector3::new(2.0, 0.5, 1.0),
        ];
        let cloud = vec![Vector3::new(1.0, 2.0, 1.0)];

        let polys = gen()
            .convex_cover(
                &path,
                &cloud,
                &Vector3::new(-5.0, -5.0, 0.0),
                &Vector3::new(5.0, 5.0, 3.0),
                3.0,
                0.25,
            )
            .unwrap();

        assert_eq!(polys.len(), 2);
        for (pair, poly) in path.windows(2).zip(&polys) {
            assert!(poly.contains(&pair[0], 0.0));
            assert!(poly.contains(&pair[1], 0.0));
            assert!(!poly.contains(&cloud[0], 0.0));

            // The bbox clip holds
            assert!(!poly.contains(&Vector3::new(6.0, 0.0, 1.0), 0.0));
        }
    }

    #[test]
    fn test_short_cut_merges_covered_segment() {
        let mut p = params();
        p.enable_short_cut = true;
        let gen = CorridorGen::new(p, 0.1, 0.1);
        let nodes = straight_nodes(5, 0.2);

        // With no obstacles every box covers the whole path, so short-cut
        // collapses the corridor while preserving total duration
        let corridors = gen
            .find_corridors(&nodes, 0.0, 0.25, |_, _, _, _| vec![])
            .unwrap();

        let total: f64 = corridors.iter().map(|c| c.duration_s).sum();
        assert!((total - 1.6).abs() < 1e-9);
        assert_eq!(corridors.len(), 1);
    }
}
