use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use indicatif::ProgressStyle;
use rayon::prelude::*;
use tracing::{debug, info, info_span, warn, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::calibration::WorldTransform;
use crate::camera::StereoRig;
use crate::error::FrameError;
use crate::feature::{CameraIndex, ColorClass, Detection};
use crate::matcher::{FrameMatch, FrameMatcher, MatchingSettings};
use crate::my_types::*;
use crate::registry::{IdentityRegistry, IdentityStatus};
use crate::rod::{Rod, RodId};
use crate::tracker::{TrackAssigner, TrackDecision, TrackingSettings};
use crate::triangulation::{TriangulationSettings, Triangulator};

/// Cooperative cancellation, checked between frames.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Detections of one frame and one color, split by camera.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StereoDetections {
    pub views: [Vec<Detection>; 2],
}

impl StereoDetections {
    pub fn new(first: Vec<Detection>, second: Vec<Detection>) -> Self {
        StereoDetections {
            views: [first, second],
        }
    }

    pub fn push(&mut self, detection: Detection) {
        self.views[detection.camera.index()].push(detection);
    }

    pub fn view(&self, camera: CameraIndex) -> &[Detection] {
        &self.views[camera.index()]
    }

    pub fn is_empty(&self) -> bool {
        self.views.iter().all(|v| v.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SequenceSettings {
    pub triangulation: TriangulationSettings,
    pub matching: MatchingSettings,
    pub tracking: TrackingSettings,
    /// Advisory number of particles per color.
    pub expected_counts: BTreeMap<ColorClass, usize>,
}

/// Everything committed for one frame of one color.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameOutput {
    pub frame: FrameIndex,
    pub color: ColorClass,
    /// One rod per emitted identity, sorted by identity.
    pub rods: Vec<Rod>,
    /// Detections seen by one camera only.
    pub unassigned: Vec<Detection>,
    pub new_identities: Vec<RodId>,
    /// Mean center displacement of the continued identities.
    pub mean_displacement: Option<f64>,
    pub skipped: bool,
}

/// Matching and tracking outcome of a frame, computed without touching the
/// registry.
#[derive(Debug, Clone, PartialEq)]
pub struct FramePlan {
    pub frame_match: FrameMatch,
    pub decision: TrackDecision,
}

/// Input of one color's run.
#[derive(Debug, Clone)]
pub struct ColorInput {
    pub color: ColorClass,
    pub frames: Range<FrameIndex>,
    pub detections: BTreeMap<FrameIndex, StereoDetections>,
    /// State to continue from, a fresh registry when absent.
    pub registry: Option<IdentityRegistry>,
}

#[derive(Debug, Clone)]
pub struct ColorRun {
    pub color: ColorClass,
    pub registry: IdentityRegistry,
    /// First frame not committed. A resumed run starts here.
    pub next_frame: FrameIndex,
    pub outputs: Vec<FrameOutput>,
    pub cancelled: bool,
}

pub struct SequenceController<'a> {
    rig: &'a StereoRig,
    settings: SequenceSettings,
    world: Option<WorldTransform>,
    cancel: CancelToken,
}

impl<'a> SequenceController<'a> {
    pub fn new(rig: &'a StereoRig, settings: SequenceSettings) -> Self {
        SequenceController {
            rig,
            settings,
            world: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_world_transform(mut self, world: WorldTransform) -> Self {
        self.world = Some(world);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn settings(&self) -> &SequenceSettings {
        &self.settings
    }

    fn matcher(&self) -> FrameMatcher<'_> {
        FrameMatcher::new(
            Triangulator::new(self.rig, self.settings.triangulation),
            self.settings.matching,
        )
    }

    /// Match and assign one frame against the current registry state.
    pub fn plan_frame(
        &self,
        registry: &IdentityRegistry,
        frame: FrameIndex,
        detections: &StereoDetections,
    ) -> Result<FramePlan, FrameError> {
        let frame_match = self.matcher().match_frame(
            frame,
            detections.view(CameraIndex::First),
            detections.view(CameraIndex::Second),
            &registry.reference_endpoints(),
        )?;
        let current: Vec<[Vector3d; 2]> = frame_match
            .correspondences
            .iter()
            .map(|c| c.triangulation.endpoints)
            .collect();
        let decision = TrackAssigner::new(self.settings.tracking)
            .assign(registry, frame, &current)
            .map_err(|source| FrameError::SolverInfeasible { frame, source })?;
        Ok(FramePlan {
            frame_match,
            decision,
        })
    }

    /// Run one frame. A frame that cannot be matched or assigned is skipped:
    /// every tracked identity gets a dummy rod and active ones become inactive.
    pub fn process_frame(
        &self,
        registry: IdentityRegistry,
        frame: FrameIndex,
        detections: &StereoDetections,
    ) -> (IdentityRegistry, FrameOutput) {
        match self.plan_frame(&registry, frame, detections) {
            Ok(plan) => self.commit_plan(registry, frame, detections, plan),
            Err(err) => {
                warn!("skipping frame: {}", err);
                self.skip_frame(registry, frame)
            }
        }
    }

    pub fn commit_plan(
        &self,
        mut registry: IdentityRegistry,
        frame: FrameIndex,
        detections: &StereoDetections,
        plan: FramePlan,
    ) -> (IdentityRegistry, FrameOutput) {
        let color = registry.color().clone();
        let tracked = self.tracked_ids(&registry, frame);
        let continued: Vec<RodId> = plan.decision.matches.iter().map(|(id, _)| *id).collect();

        let displacements: Vec<f64> = plan
            .decision
            .matches
            .iter()
            .filter_map(|(id, index)| {
                let previous = registry.get(*id)?.last_rod.as_ref()?.center()?;
                let current = plan.frame_match.correspondences[*index].triangulation.center();
                Some((current - previous).norm())
            })
            .collect();
        let mean_displacement = (!displacements.is_empty())
            .then(|| displacements.iter().sum::<f64>() / displacements.len() as f64);

        let mut rods = TrackAssigner::new(self.settings.tracking).label(
            &mut registry,
            &plan.decision,
            frame,
            &color,
            &plan.frame_match.correspondences,
        );
        let new_identities: Vec<RodId> = rods
            .iter()
            .map(|r| r.id)
            .filter(|id| !continued.contains(id))
            .collect();
        if let Some(world) = &self.world {
            for rod in rods.iter_mut() {
                rod.world_endpoints = rod
                    .endpoints
                    .map(|[a, b]| [world.apply(&a), world.apply(&b)]);
            }
        }
        for id in tracked {
            if !continued.contains(&id) {
                rods.push(Rod::dummy(id, color.clone(), frame));
            }
        }
        self.pad_to_expected(&mut registry, &mut rods, frame);
        rods.sort_by_key(|r| r.id);

        let mut unassigned = Vec::new();
        for &index in &plan.frame_match.unmatched_first {
            unassigned.push(detections.view(CameraIndex::First)[index].clone());
        }
        for &index in &plan.frame_match.unmatched_second {
            unassigned.push(detections.view(CameraIndex::Second)[index].clone());
        }

        let registry = registry.commit(frame, &rods);
        let output = FrameOutput {
            frame,
            color,
            rods,
            unassigned,
            new_identities,
            mean_displacement,
            skipped: false,
        };
        (registry, output)
    }

    pub fn skip_frame(
        &self,
        mut registry: IdentityRegistry,
        frame: FrameIndex,
    ) -> (IdentityRegistry, FrameOutput) {
        let color = registry.color().clone();
        let mut rods: Vec<Rod> = self
            .tracked_ids(&registry, frame)
            .into_iter()
            .map(|id| Rod::dummy(id, color.clone(), frame))
            .collect();
        self.pad_to_expected(&mut registry, &mut rods, frame);
        rods.sort_by_key(|r| r.id);
        let registry = registry.commit(frame, &rods);
        let output = FrameOutput {
            frame,
            color,
            rods,
            unassigned: vec![],
            new_identities: vec![],
            mean_displacement: None,
            skipped: true,
        };
        (registry, output)
    }

    /// Identities owed a row in `frame`, dummy or not.
    fn tracked_ids(&self, registry: &IdentityRegistry, frame: FrameIndex) -> Vec<RodId> {
        registry.tracked_ids(frame, self.settings.tracking.reactivation_window)
    }

    /// Dummy rows for placeholder identities until the expected count is met.
    fn pad_to_expected(&self, registry: &mut IdentityRegistry, rods: &mut Vec<Rod>, frame: FrameIndex) {
        let expected = match self.settings.expected_counts.get(registry.color()) {
            Some(expected) => *expected,
            None => return,
        };
        let unused: Vec<RodId> = registry
            .ids_with_status(IdentityStatus::Placeholder)
            .into_iter()
            .filter(|id| rods.iter().all(|r| r.id != *id))
            .collect();
        let mut placeholders = unused.into_iter();
        while rods.len() < expected {
            let id = match placeholders.next() {
                Some(id) => id,
                None => registry.add_placeholder(),
            };
            rods.push(Rod::dummy(id, registry.color().clone(), frame));
        }
    }

    /// Process `input.frames` in order. Stops early, without emitting a
    /// partial frame, once the cancel token is set.
    pub fn run_color(&self, input: ColorInput, sink: Option<&Sender<FrameOutput>>) -> ColorRun {
        let ColorInput {
            color,
            frames,
            detections,
            registry,
        } = input;
        let mut registry = registry.unwrap_or_else(|| IdentityRegistry::new(color.clone()));
        let empty = StereoDetections::default();

        let span = info_span!("color", color = %color);
        span.pb_set_style(&ProgressStyle::default_bar());
        span.pb_set_length(frames.len() as u64);
        let _enter = span.enter();

        let mut outputs = Vec::new();
        let mut next_frame = frames.start;
        let mut cancelled = false;
        for frame in frames {
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let frame_detections = detections.get(&frame).unwrap_or(&empty);
            let (updated, output) = self.process_frame(registry, frame, frame_detections);
            registry = updated;
            next_frame = frame + 1;
            debug!(
                "frame {}: {} rods, {} unassigned",
                frame,
                output.rods.len(),
                output.unassigned.len()
            );
            if let Some(sink) = sink {
                if sink.send(output.clone()).is_err() {
                    warn!("frame sink disconnected");
                }
            }
            outputs.push(output);
            Span::current().pb_inc(1);
        }
        info!(
            "color {}: {} frames, {} identities{}",
            color,
            outputs.len(),
            registry.len(),
            if cancelled { ", cancelled" } else { "" }
        );
        ColorRun {
            color,
            registry,
            next_frame,
            outputs,
            cancelled,
        }
    }

    /// Run every color on its own rayon task.
    pub fn run(&self, inputs: Vec<ColorInput>, sink: Option<Sender<FrameOutput>>) -> Vec<ColorRun> {
        let tasks: Vec<(ColorInput, Option<Sender<FrameOutput>>)> = inputs
            .into_iter()
            .map(|input| (input, sink.clone()))
            .collect();
        drop(sink);
        tasks
            .into_par_iter()
            .map(|(input, sink)| self.run_color(input, sink.as_ref()))
            .collect()
    }
}
