//! Summary statistics of a reconstruction run.

use serde::Serialize;

use crate::feature::ColorClass;
use crate::my_types::FrameIndex;
use crate::sequence::{ColorRun, FrameOutput};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Distribution {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    /// Population standard deviation.
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

impl Distribution {
    /// Statistics of the finite samples. All zero when there are none.
    pub fn from_samples(samples: &[f64]) -> Self {
        let mut values: Vec<f64> = samples.iter().copied().filter(|x| x.is_finite()).collect();
        if values.is_empty() {
            return Distribution::default();
        }
        values.sort_by(f64::total_cmp);
        let count = values.len();
        let mean = values.iter().sum::<f64>() / count as f64;
        let variance = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / count as f64;
        let median = if count % 2 == 1 {
            values[count / 2]
        } else {
            (values[count / 2 - 1] + values[count / 2]) / 2.
        };
        Distribution {
            count,
            mean,
            median,
            std: variance.sqrt(),
            min: values[0],
            max: values[count - 1],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameDisplacement {
    pub color: ColorClass,
    pub frame: FrameIndex,
    pub mean_displacement: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub reprojection_cost: Distribution,
    pub rod_length: Distribution,
    pub displacement: Vec<FrameDisplacement>,
    pub frames_processed: usize,
    pub frames_skipped: usize,
    pub cancelled: bool,
    pub identities_minted: usize,
}

/// Accumulates frame outputs of any number of colors.
#[derive(Debug, Clone, Default)]
pub struct StatsCollector {
    costs: Vec<f64>,
    lengths: Vec<f64>,
    displacement: Vec<FrameDisplacement>,
    frames_processed: usize,
    frames_skipped: usize,
    identities_minted: usize,
    cancelled: bool,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, output: &FrameOutput) {
        self.frames_processed += 1;
        if output.skipped {
            self.frames_skipped += 1;
        }
        self.identities_minted += output.new_identities.len();
        for rod in output.rods.iter().filter(|r| !r.is_dummy()) {
            self.costs.extend(rod.cost);
            self.lengths.extend(rod.length());
        }
        if let Some(mean_displacement) = output.mean_displacement {
            self.displacement.push(FrameDisplacement {
                color: output.color.clone(),
                frame: output.frame,
                mean_displacement,
            });
        }
    }

    pub fn record_run(&mut self, run: &ColorRun) {
        self.cancelled |= run.cancelled;
    }

    pub fn summary(&self) -> RunSummary {
        let mut displacement = self.displacement.clone();
        displacement.sort_by(|a, b| (&a.color, a.frame).cmp(&(&b.color, b.frame)));
        RunSummary {
            reprojection_cost: Distribution::from_samples(&self.costs),
            rod_length: Distribution::from_samples(&self.lengths),
            displacement,
            frames_processed: self.frames_processed,
            frames_skipped: self.frames_skipped,
            cancelled: self.cancelled,
            identities_minted: self.identities_minted,
        }
    }
}
