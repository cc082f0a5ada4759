use std::collections::BTreeMap;
use std::str::FromStr;

use clap::Parser;
use serde::Deserialize;

use crate::feature::ColorClass;
use crate::matcher::MatchingSettings;
use crate::sequence::SequenceSettings;
use crate::tracker::{DisplacementMetric, TrackingSettings};
use crate::triangulation::TriangulationSettings;

/// Advisory particle count of one color, written `color=count`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct ExpectedCount {
    pub color: ColorClass,
    pub count: usize,
}

impl FromStr for ExpectedCount {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (color, count) = s
            .split_once('=')
            .ok_or_else(|| format!("expected color=count, got '{s}'"))?;
        let color = color.trim();
        if color.is_empty() {
            return Err(format!("missing color in '{s}'"));
        }
        let count = count
            .trim()
            .parse()
            .map_err(|err| format!("invalid count in '{s}': {err}"))?;
        Ok(ExpectedCount {
            color: ColorClass::new(color),
            count,
        })
    }
}

impl TryFrom<String> for ExpectedCount {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Parser, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    #[clap(long, default_value = "0")]
    pub seed: u64,

    /// Pixel cost of leaving a detection without a stereo partner.
    #[clap(long, default_value = "20")]
    pub unmatched_penalty: f64,

    #[clap(long, default_value = "1e-6")]
    pub order_tie_tolerance: f64,

    /// Largest center displacement between consecutive frames.
    #[clap(long, default_value = "20")]
    pub max_displacement: f64,

    #[clap(long, default_value = "1")]
    pub position_weight: f64,

    #[clap(long, default_value = "0")]
    pub orientation_weight: f64,

    #[clap(long, value_enum, default_value = "center")]
    pub metric: DisplacementMetric,

    /// Frames an identity may be missing and still be picked up again.
    #[clap(long, default_value = "3")]
    pub reactivation_window: usize,

    #[clap(long)]
    pub keep_endpoint_order: bool,

    #[clap(long, default_value = "5")]
    pub refine_iterations: usize,

    /// Minimum angle between viewing rays, radians.
    #[clap(long, default_value = "1e-5")]
    pub min_parallax: f64,

    #[clap(long = "expected-count")]
    pub expected_counts: Vec<ExpectedCount>,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        TrackingConfig {
            seed: 0,
            unmatched_penalty: 20.,
            order_tie_tolerance: 1e-6,
            max_displacement: 20.,
            position_weight: 1.,
            orientation_weight: 0.,
            metric: DisplacementMetric::Center,
            reactivation_window: 3,
            keep_endpoint_order: false,
            refine_iterations: 5,
            min_parallax: 1e-5,
            expected_counts: vec![],
        }
    }
}

impl TrackingConfig {
    pub fn triangulation_settings(&self) -> TriangulationSettings {
        TriangulationSettings {
            min_parallax: self.min_parallax,
            refine_iterations: self.refine_iterations,
        }
    }

    pub fn matching_settings(&self) -> MatchingSettings {
        MatchingSettings {
            unmatched_penalty: self.unmatched_penalty,
            order_tie_tolerance: self.order_tie_tolerance,
        }
    }

    pub fn tracking_settings(&self) -> TrackingSettings {
        TrackingSettings {
            max_displacement: self.max_displacement,
            position_weight: self.position_weight,
            orientation_weight: self.orientation_weight,
            metric: self.metric,
            reactivation_window: self.reactivation_window,
            keep_endpoint_order: self.keep_endpoint_order,
        }
    }

    pub fn sequence_settings(&self) -> SequenceSettings {
        let expected_counts: BTreeMap<ColorClass, usize> = self
            .expected_counts
            .iter()
            .map(|e| (e.color.clone(), e.count))
            .collect();
        SequenceSettings {
            triangulation: self.triangulation_settings(),
            matching: self.matching_settings(),
            tracking: self.tracking_settings(),
            expected_counts,
        }
    }
}
