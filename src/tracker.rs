use serde::Deserialize;
use tracing::{debug, trace};

use crate::assignment;
use crate::error::AssignmentError;
use crate::feature::ColorClass;
use crate::math::axis_angle;
use crate::matcher::Correspondence;
use crate::my_types::*;
use crate::registry::{Candidate, IdentityRegistry};
use crate::rod::{endpoint_distance, Rod, RodId};

/// Cost of a pairing whose displacement exceeds the allowed maximum. Pairs
/// solved at this cost are rejected.
pub const INFEASIBLE_COST: f64 = 1e12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DisplacementMetric {
    /// Distance between rod centers.
    Center,
    /// Summed endpoint distance under the better endpoint pairing.
    Endpoints,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackingSettings {
    /// Largest center displacement per frame, in calibration units.
    pub max_displacement: f64,
    pub position_weight: f64,
    pub orientation_weight: f64,
    pub metric: DisplacementMetric,
    /// Frames an identity may stay unobserved and still be picked up again.
    pub reactivation_window: usize,
    pub keep_endpoint_order: bool,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        TrackingSettings {
            max_displacement: 20.,
            position_weight: 1.,
            orientation_weight: 0.,
            metric: DisplacementMetric::Center,
            reactivation_window: 3,
            keep_endpoint_order: false,
        }
    }
}

/// Outcome of assigning one frame's rods, before any identity is minted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackDecision {
    /// Previous identity and index of the current rod that continues it.
    pub matches: Vec<(RodId, usize)>,
    /// Current rods without a previous identity, in input order.
    pub unmatched_current: Vec<usize>,
    /// Candidate identities not continued by any current rod.
    pub unmatched_previous: Vec<RodId>,
    pub total_cost: f64,
}

impl TrackDecision {
    pub fn identity_of(&self, current: usize) -> Option<RodId> {
        self.matches
            .iter()
            .find(|(_, index)| *index == current)
            .map(|(id, _)| *id)
    }
}

pub struct TrackAssigner {
    settings: TrackingSettings,
}

impl TrackAssigner {
    pub fn new(settings: TrackingSettings) -> Self {
        TrackAssigner { settings }
    }

    pub fn settings(&self) -> &TrackingSettings {
        &self.settings
    }

    pub fn cost(&self, candidate: &Candidate, current: &[Vector3d; 2]) -> f64 {
        let previous = &candidate.endpoints;
        let center_previous = (previous[0] + previous[1]) / 2.;
        let center_current = (current[0] + current[1]) / 2.;
        let displacement = (center_current - center_previous).norm();
        if displacement > self.settings.max_displacement * candidate.gap as f64 {
            return INFEASIBLE_COST;
        }
        let distance = match self.settings.metric {
            DisplacementMetric::Center => displacement,
            DisplacementMetric::Endpoints => endpoint_distance(previous, current).0,
        };
        let angle = axis_angle(&(previous[1] - previous[0]), &(current[1] - current[0]));
        self.settings.position_weight * distance + self.settings.orientation_weight * angle
    }

    pub fn cost_matrix(&self, candidates: &[Candidate], current: &[[Vector3d; 2]]) -> Matrixd {
        Matrixd::from_fn(candidates.len(), current.len(), |i, j| {
            self.cost(&candidates[i], &current[j])
        })
    }

    /// Decide which previous identity each current rod continues. The registry
    /// is not modified.
    pub fn assign(
        &self,
        registry: &IdentityRegistry,
        frame: FrameIndex,
        current: &[[Vector3d; 2]],
    ) -> Result<TrackDecision, AssignmentError> {
        let candidates = registry.candidates(frame, self.settings.reactivation_window);
        if candidates.is_empty() || current.is_empty() {
            return Ok(TrackDecision {
                matches: vec![],
                unmatched_current: (0..current.len()).collect(),
                unmatched_previous: candidates.iter().map(|c| c.id).collect(),
                total_cost: 0.,
            });
        }

        let costs = self.cost_matrix(&candidates, current);
        let assignment = assignment::solve(&costs)?;

        let mut decision = TrackDecision::default();
        let mut continued = vec![false; current.len()];
        for (row, candidate) in candidates.iter().enumerate() {
            match assignment.row_to_col[row] {
                Some(col) if costs[(row, col)] < INFEASIBLE_COST => {
                    decision.matches.push((candidate.id, col));
                    decision.total_cost += costs[(row, col)];
                    continued[col] = true;
                }
                Some(col) => {
                    trace!("identity {} too far from rod {}", candidate.id, col);
                    decision.unmatched_previous.push(candidate.id);
                }
                None => decision.unmatched_previous.push(candidate.id),
            }
        }
        decision.unmatched_current = continued
            .iter()
            .enumerate()
            .filter(|(_, c)| !**c)
            .map(|(i, _)| i)
            .collect();
        debug!(
            "frame {}: {} continued, {} new, {} lost",
            frame,
            decision.matches.len(),
            decision.unmatched_current.len(),
            decision.unmatched_previous.len()
        );
        Ok(decision)
    }

    /// Build the identity-stamped rods of a frame. New identities are minted
    /// for unmatched rods in input order. Continued rods get their endpoints
    /// reordered to follow the previous rod unless `keep_endpoint_order` is set.
    pub fn label(
        &self,
        registry: &mut IdentityRegistry,
        decision: &TrackDecision,
        frame: FrameIndex,
        color: &ColorClass,
        correspondences: &[Correspondence],
    ) -> Vec<Rod> {
        let mut rods = Vec::with_capacity(correspondences.len());
        for (index, correspondence) in correspondences.iter().enumerate() {
            let (id, previous) = match decision.identity_of(index) {
                Some(id) => (id, registry.get(id).and_then(|e| e.last_endpoints())),
                None => (registry.mint(), None),
            };
            let mut rod = Rod::from_correspondence(id, color.clone(), frame, correspondence);
            if let (Some(previous), Some(endpoints), false) =
                (previous, rod.endpoints, self.settings.keep_endpoint_order)
            {
                if endpoint_distance(&previous, &endpoints).1 {
                    rod.swap_endpoints();
                }
            }
            rods.push(rod);
        }
        rods.sort_by_key(|rod| rod.id);
        rods
    }
}
