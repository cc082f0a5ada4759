//! Stereo correspondence between the camera-1 and camera-2 detections of one
//! frame and one color class.

use nalgebra::DMatrix;
use ndarray as nd;
use tracing::{debug, trace};

use crate::assignment;
use crate::error::FrameError;
use crate::feature::{CameraIndex, Detection, EndpointOrder};
use crate::my_types::*;
use crate::rod::endpoint_distance;
use crate::triangulation::{Triangulation, Triangulator};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchingSettings {
    /// Cost in pixels of leaving one detection without a partner.
    pub unmatched_penalty: f64,
    /// Forward and swapped costs closer than this are considered tied.
    pub order_tie_tolerance: f64,
}

impl Default for MatchingSettings {
    fn default() -> Self {
        MatchingSettings {
            unmatched_penalty: 20.,
            order_tie_tolerance: 1e-6,
        }
    }
}

/// An accepted pairing of a camera-1 detection with a camera-2 detection.
#[derive(Debug, Clone, PartialEq)]
pub struct Correspondence {
    pub first: usize,
    pub second: usize,
    pub order: EndpointOrder,
    pub triangulation: Triangulation,
    /// Observed endpoints per camera, the second view already in `order`.
    pub views: [[Vector2d; 2]; 2],
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameMatch {
    pub correspondences: Vec<Correspondence>,
    pub unmatched_first: Vec<usize>,
    pub unmatched_second: Vec<usize>,
    pub total_cost: f64,
}

impl FrameMatch {
    pub fn is_empty(&self) -> bool {
        self.correspondences.is_empty()
            && self.unmatched_first.is_empty()
            && self.unmatched_second.is_empty()
    }
}

/// Per-order costs `[first, second, order]` and the triangulations behind them,
/// the latter indexed `first * n + second`.
pub struct OrderCosts {
    pub costs: nd::Array3<f64>,
    pub triangulations: Vec<[Option<Triangulation>; 2]>,
}

impl OrderCosts {
    fn triangulation(&self, first: usize, second: usize, order: EndpointOrder) -> Option<&Triangulation> {
        let n = self.costs.shape()[1];
        self.triangulations[first * n + second][order.index()].as_ref()
    }
}

pub struct FrameMatcher<'a> {
    triangulator: Triangulator<'a>,
    settings: MatchingSettings,
}

impl<'a> FrameMatcher<'a> {
    pub fn new(triangulator: Triangulator<'a>, settings: MatchingSettings) -> Self {
        FrameMatcher {
            triangulator,
            settings,
        }
    }

    pub fn order_costs(&self, first: &[Detection], second: &[Detection]) -> OrderCosts {
        let (m, n) = (first.len(), second.len());
        let mut costs = nd::Array3::from_elem((m, n, 2), f64::INFINITY);
        let mut triangulations = vec![[None, None]; m * n];
        for (i, a) in first.iter().enumerate() {
            for (j, b) in second.iter().enumerate() {
                for order in EndpointOrder::BOTH {
                    match self.triangulator.triangulate(a, b, order) {
                        Ok(triangulation) => {
                            costs[[i, j, order.index()]] = triangulation.cost;
                            triangulations[i * n + j][order.index()] = Some(triangulation);
                        }
                        Err(err) => trace!("pair ({}, {}) {:?} rejected: {}", i, j, order, err),
                    }
                }
            }
        }
        OrderCosts {
            costs,
            triangulations,
        }
    }

    /// Square `(m + n)` matrix of real pairings and dummy slots. Rows are the
    /// camera-1 detections followed by one dummy row per camera-2 detection,
    /// columns are the camera-2 detections followed by one dummy column per
    /// camera-1 detection.
    pub fn cost_matrix(&self, order_costs: &nd::Array3<f64>) -> Matrixd {
        let shape = order_costs.shape();
        let (m, n) = (shape[0], shape[1]);
        let penalty = self.settings.unmatched_penalty;
        DMatrix::from_fn(m + n, n + m, |row, col| match (row < m, col < n) {
            (true, true) => order_costs[[row, col, 0]].min(order_costs[[row, col, 1]]),
            (true, false) if col - n == row => penalty,
            (false, true) if row - m == col => penalty,
            (false, false) => 0.,
            _ => f64::INFINITY,
        })
    }

    /// Pair the detections of one frame. `prior` holds the endpoints of the
    /// rods reconstructed in the previous frame and is used to break order ties.
    pub fn match_frame(
        &self,
        frame: FrameIndex,
        first: &[Detection],
        second: &[Detection],
        prior: &[[Vector3d; 2]],
    ) -> Result<FrameMatch, FrameError> {
        validate(frame, CameraIndex::First, first)?;
        validate(frame, CameraIndex::Second, second)?;
        if first.is_empty() && second.is_empty() {
            return Ok(FrameMatch::default());
        }

        let (m, n) = (first.len(), second.len());
        let order_costs = self.order_costs(first, second);
        let costs = self.cost_matrix(&order_costs.costs);
        let assignment = assignment::solve(&costs)
            .map_err(|source| FrameError::SolverInfeasible { frame, source })?;

        let mut result = FrameMatch {
            total_cost: assignment.total_cost,
            ..Default::default()
        };
        for (row, col) in assignment.pairs() {
            match (row < m, col < n) {
                (true, true) => {
                    let order = self.resolve_order(&order_costs, row, col, prior);
                    let triangulation = match order_costs.triangulation(row, col, order) {
                        Some(t) => *t,
                        None => {
                            // the solver never picks a pairing without a finite cost
                            result.unmatched_first.push(row);
                            result.unmatched_second.push(col);
                            continue;
                        }
                    };
                    result.correspondences.push(Correspondence {
                        first: row,
                        second: col,
                        order,
                        triangulation,
                        views: [first[row].endpoints, order.apply(second[col].endpoints)],
                    });
                }
                (true, false) => result.unmatched_first.push(row),
                (false, true) => result.unmatched_second.push(col),
                (false, false) => {}
            }
        }
        result.unmatched_first.sort_unstable();
        result.unmatched_second.sort_unstable();
        debug!(
            "frame {}: {} correspondences, {} + {} unmatched, cost {:.3}",
            frame,
            result.correspondences.len(),
            result.unmatched_first.len(),
            result.unmatched_second.len(),
            result.total_cost
        );
        Ok(result)
    }

    fn resolve_order(
        &self,
        order_costs: &OrderCosts,
        first: usize,
        second: usize,
        prior: &[[Vector3d; 2]],
    ) -> EndpointOrder {
        let forward = order_costs.costs[[first, second, EndpointOrder::Forward.index()]];
        let swapped = order_costs.costs[[first, second, EndpointOrder::Swapped.index()]];
        let candidates = [
            order_costs.triangulation(first, second, EndpointOrder::Forward),
            order_costs.triangulation(first, second, EndpointOrder::Swapped),
        ];
        choose_order(
            [forward, swapped],
            candidates,
            prior,
            self.settings.order_tie_tolerance,
        )
    }
}

fn validate(frame: FrameIndex, camera: CameraIndex, detections: &[Detection]) -> Result<(), FrameError> {
    for (index, detection) in detections.iter().enumerate() {
        if detection.frame != frame {
            return Err(FrameError::FrameMismatch {
                frame,
                found: detection.frame,
            });
        }
        if !detection.is_finite() {
            return Err(FrameError::InvalidDetection {
                frame,
                camera,
                index,
            });
        }
    }
    Ok(())
}

/// Lower cost wins. Within `tolerance` the reconstruction closest to a prior
/// rod wins, and `Forward` when there is nothing to compare against.
fn choose_order(
    costs: [f64; 2],
    triangulations: [Option<&Triangulation>; 2],
    prior: &[[Vector3d; 2]],
    tolerance: f64,
) -> EndpointOrder {
    let [forward, swapped] = costs;
    let tied = forward.is_finite() && swapped.is_finite() && (forward - swapped).abs() <= tolerance;
    if !tied {
        return if swapped < forward {
            EndpointOrder::Swapped
        } else {
            EndpointOrder::Forward
        };
    }
    let nearest = |t: Option<&Triangulation>| {
        t.map_or(f64::INFINITY, |t| {
            prior
                .iter()
                .map(|p| endpoint_distance(&t.endpoints, p).0)
                .fold(f64::INFINITY, f64::min)
        })
    };
    if nearest(triangulations[1]) < nearest(triangulations[0]) {
        EndpointOrder::Swapped
    } else {
        EndpointOrder::Forward
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::tests::test_rig;
    use crate::camera::StereoRig;
    use crate::feature::ColorClass;
    use crate::triangulation::TriangulationSettings;

    const DEPTH: f64 = 500.;

    fn lift(rig: &StereoRig, pixel: Vector2d) -> Vector3d {
        rig.back_project(pixel, CameraIndex::First).unwrap() * DEPTH
    }

    fn detection(pixels: [Vector2d; 2], camera: CameraIndex) -> Detection {
        Detection::new(pixels, ColorClass::new("red"), 0, camera)
    }

    /// Camera-1 detections at the given pixels, and their camera-2 views when
    /// the rods lie at a fixed depth.
    fn scene(rig: &StereoRig, pixels: &[[Vector2d; 2]]) -> (Vec<Detection>, Vec<Detection>) {
        let first = pixels
            .iter()
            .map(|p| detection(*p, CameraIndex::First))
            .collect();
        let second = pixels
            .iter()
            .map(|p| {
                let projected = [
                    rig.project(&lift(rig, p[0]), CameraIndex::Second).unwrap(),
                    rig.project(&lift(rig, p[1]), CameraIndex::Second).unwrap(),
                ];
                detection(projected, CameraIndex::Second)
            })
            .collect();
        (first, second)
    }

    fn two_rods() -> [[Vector2d; 2]; 2] {
        [
            [Vector2d::new(10., 10.), Vector2d::new(50., 50.)],
            [Vector2d::new(200., 10.), Vector2d::new(240., 50.)],
        ]
    }

    #[test]
    fn test_straight_pairing() {
        let rig = test_rig();
        let matcher = FrameMatcher::new(
            Triangulator::new(&rig, TriangulationSettings::default()),
            MatchingSettings::default(),
        );
        let (first, second) = scene(&rig, &two_rods());
        let result = matcher.match_frame(0, &first, &second, &[]).unwrap();

        let mut pairs: Vec<_> = result
            .correspondences
            .iter()
            .map(|c| (c.first, c.second))
            .collect();
        pairs.sort();
        assert_eq!(pairs, vec![(0, 0), (1, 1)]);
        assert!(result.unmatched_first.is_empty());
        assert!(result.unmatched_second.is_empty());
        assert!(result.total_cost < 1e-6);
        for c in &result.correspondences {
            assert_eq!(c.order, EndpointOrder::Forward);
            let expected = lift(&rig, first[c.first].endpoints[0]);
            assert!((c.triangulation.endpoints[0] - expected).norm() < 1e-6);
        }
    }

    #[test]
    fn test_swapped_second_view_gives_same_rods() {
        let rig = test_rig();
        let matcher = FrameMatcher::new(
            Triangulator::new(&rig, TriangulationSettings::default()),
            MatchingSettings::default(),
        );
        let (first, second) = scene(&rig, &two_rods());
        let swapped: Vec<_> = second
            .iter()
            .map(|d| d.ordered(EndpointOrder::Swapped))
            .collect();
        let straight = matcher.match_frame(0, &first, &second, &[]).unwrap();
        let crossed = matcher.match_frame(0, &first, &swapped, &[]).unwrap();

        assert_eq!(straight.correspondences.len(), crossed.correspondences.len());
        for (a, b) in straight.correspondences.iter().zip(crossed.correspondences.iter()) {
            assert_eq!((a.first, a.second), (b.first, b.second));
            assert_eq!(b.order, EndpointOrder::Swapped);
            assert_eq!(a.views, b.views);
            for k in 0..2 {
                assert!((a.triangulation.endpoints[k] - b.triangulation.endpoints[k]).norm() < 1e-6);
            }
        }
    }

    #[test]
    fn test_unpaired_detections_use_dummy_slots() {
        let rig = test_rig();
        let settings = MatchingSettings {
            unmatched_penalty: 1.,
            ..Default::default()
        };
        let matcher = FrameMatcher::new(
            Triangulator::new(&rig, TriangulationSettings::default()),
            settings,
        );
        let (mut first, second) = scene(&rig, &two_rods());
        first.push(detection(
            [Vector2d::new(1200., 900.), Vector2d::new(1250., 950.)],
            CameraIndex::First,
        ));
        let result = matcher.match_frame(0, &first, &second, &[]).unwrap();
        assert_eq!(result.correspondences.len(), 2);
        assert_eq!(result.unmatched_first, vec![2]);
        assert!(result.unmatched_second.is_empty());
        let triangulated: f64 = result
            .correspondences
            .iter()
            .map(|c| c.triangulation.cost)
            .sum();
        assert!((result.total_cost - triangulated - settings.unmatched_penalty).abs() < 1e-9);

        let result = matcher.match_frame(0, &first[..1], &[], &[]).unwrap();
        assert_eq!(result.unmatched_first, vec![0]);
        assert_eq!(result.total_cost, 1.);
        let result = matcher.match_frame(0, &[], &second, &[]).unwrap();
        assert_eq!(result.unmatched_second, vec![0, 1]);
    }

    #[test]
    fn test_empty_frame() {
        let rig = test_rig();
        let matcher = FrameMatcher::new(
            Triangulator::new(&rig, TriangulationSettings::default()),
            MatchingSettings::default(),
        );
        let result = matcher.match_frame(3, &[], &[], &[]).unwrap();
        assert!(result.is_empty());
        assert_eq!(result.total_cost, 0.);
    }

    #[test]
    fn test_invalid_detection() {
        let rig = test_rig();
        let matcher = FrameMatcher::new(
            Triangulator::new(&rig, TriangulationSettings::default()),
            MatchingSettings::default(),
        );
        let (first, mut second) = scene(&rig, &two_rods());
        second[1].endpoints[0].y = f64::NAN;
        assert_eq!(
            matcher.match_frame(0, &first, &second, &[]),
            Err(FrameError::InvalidDetection {
                frame: 0,
                camera: CameraIndex::Second,
                index: 1
            })
        );
        assert_eq!(
            matcher.match_frame(4, &first, &[], &[]),
            Err(FrameError::FrameMismatch { frame: 4, found: 0 })
        );
    }

    #[test]
    fn test_cost_matrix_layout() {
        let rig = test_rig();
        let matcher = FrameMatcher::new(
            Triangulator::new(&rig, TriangulationSettings::default()),
            MatchingSettings::default(),
        );
        let mut order_costs = nd::Array3::from_elem((2, 1, 2), f64::INFINITY);
        order_costs[[0, 0, 0]] = 3.;
        order_costs[[0, 0, 1]] = 2.;
        let costs = matcher.cost_matrix(&order_costs);
        let inf = f64::INFINITY;
        #[rustfmt::skip]
        let expected = DMatrix::from_row_slice(3, 3, &[
            2.,  20., inf,
            inf, inf, 20.,
            20., 0.,  0.,
        ]);
        assert_eq!(costs, expected);
    }

    #[test]
    fn test_order_tie_break() {
        let rod = [Vector3d::new(0., 0., 100.), Vector3d::new(10., 0., 100.)];
        let forward = Triangulation {
            endpoints: rod,
            order: EndpointOrder::Forward,
            errors: [[0.; 2]; 2],
            cost: 1.,
        };
        let swapped = Triangulation {
            endpoints: [Vector3d::new(0., 0., 300.), Vector3d::new(10., 0., 300.)],
            order: EndpointOrder::Swapped,
            ..forward
        };
        let both = [Some(&forward), Some(&swapped)];

        assert_eq!(choose_order([1., 2.], both, &[], 1e-6), EndpointOrder::Forward);
        assert_eq!(choose_order([2., 1.], both, &[], 1e-6), EndpointOrder::Swapped);
        assert_eq!(choose_order([1., 1.], both, &[], 1e-6), EndpointOrder::Forward);

        let near_swapped = [[Vector3d::new(10., 0., 299.), Vector3d::new(0., 0., 299.)]];
        assert_eq!(
            choose_order([1., 1.], both, &near_swapped, 1e-6),
            EndpointOrder::Swapped
        );
        assert_eq!(
            choose_order([1., 1.5], both, &near_swapped, 1e-6),
            EndpointOrder::Forward
        );
        assert_eq!(
            choose_order([1., 1.5], both, &near_swapped, 1.),
            EndpointOrder::Swapped
        );
    }
}
