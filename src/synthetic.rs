//! Seeded synthetic scenes: moving rods observed by a stereo rig.

use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::camera::StereoRig;
use crate::feature::{CameraIndex, ColorClass, Detection};
use crate::my_types::*;
use crate::rod::RodId;
use crate::sequence::StereoDetections;

/// Smallest vertical component of a rod axis. Rods lying in an epipolar plane
/// have an ambiguous endpoint order.
const MIN_TILT: f64 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub struct SceneSettings {
    pub frames: usize,
    pub rods_per_color: usize,
    pub rod_length: f64,
    /// Mean distance of the rods from the first camera.
    pub depth: f64,
    /// Vertical distance between neighbouring rods.
    pub spacing: f64,
    /// Largest per-axis center velocity, per frame.
    pub max_speed: f64,
    /// Half width of the uniform pixel noise.
    pub pixel_noise: f64,
    pub seed: u64,
}

impl Default for SceneSettings {
    fn default() -> Self {
        SceneSettings {
            frames: 10,
            rods_per_color: 4,
            rod_length: 20.,
            depth: 500.,
            spacing: 80.,
            max_speed: 1.,
            pixel_noise: 0.2,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Scene {
    /// Ground truth endpoints per color, indexed by rod then frame.
    truth: BTreeMap<ColorClass, Vec<Vec<[Vector3d; 2]>>>,
    detections: BTreeMap<ColorClass, BTreeMap<FrameIndex, StereoDetections>>,
}

impl Scene {
    /// Camera-1 detections keep the rod order, so identities minted on the
    /// first frame equal the rod indices. Camera-2 detections are shuffled and
    /// their endpoints randomly swapped.
    pub fn generate(rig: &StereoRig, settings: &SceneSettings, colors: &[ColorClass]) -> Scene {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(settings.seed);
        let mut truth = BTreeMap::new();
        let mut detections = BTreeMap::new();
        for (color_index, color) in colors.iter().enumerate() {
            let tracks: Vec<Vec<[Vector3d; 2]>> = (0..settings.rods_per_color)
                .map(|k| trajectory(&mut rng, settings, color_index, k))
                .collect();

            let mut frames = BTreeMap::new();
            for frame in 0..settings.frames {
                let mut first = Vec::new();
                let mut second = Vec::new();
                for track in &tracks {
                    let rod = track[frame];
                    let views = CameraIndex::BOTH.map(|camera| {
                        let a = rig.project(&rod[0], camera)?;
                        let b = rig.project(&rod[1], camera)?;
                        Some([noisy(&mut rng, a, settings), noisy(&mut rng, b, settings)])
                    });
                    if let [Some(view_first), Some(mut view_second)] = views {
                        if rng.gen_bool(0.5) {
                            view_second.swap(0, 1);
                        }
                        first.push(Detection::new(view_first, color.clone(), frame, CameraIndex::First));
                        second.push(Detection::new(
                            view_second,
                            color.clone(),
                            frame,
                            CameraIndex::Second,
                        ));
                    }
                }
                second.shuffle(&mut rng);
                frames.insert(frame, StereoDetections::new(first, second));
            }
            truth.insert(color.clone(), tracks);
            detections.insert(color.clone(), frames);
        }
        Scene { truth, detections }
    }

    pub fn detections(&self, color: &ColorClass) -> BTreeMap<FrameIndex, StereoDetections> {
        self.detections.get(color).cloned().unwrap_or_default()
    }

    /// True center of the rod that received identity `id`.
    pub fn truth(&self, color: &ColorClass, frame: FrameIndex, id: RodId) -> Option<Vector3d> {
        let rod = self.truth.get(color)?.get(id.0 as usize)?.get(frame)?;
        Some((rod[0] + rod[1]) / 2.)
    }
}

fn trajectory(
    rng: &mut Xoshiro256PlusPlus,
    settings: &SceneSettings,
    color_index: usize,
    k: usize,
) -> Vec<[Vector3d; 2]> {
    let offset = (settings.rods_per_color as f64 - 1.) / 2.;
    let mut center = Vector3d::new(
        rng.gen_range(-60.0..60.0) + 15. * color_index as f64,
        settings.spacing * (k as f64 - offset),
        settings.depth + rng.gen_range(-30.0..30.0),
    );
    let speed = settings.max_speed;
    let velocity = Vector3d::new(
        rng.gen_range(-speed..=speed),
        rng.gen_range(-speed..=speed),
        rng.gen_range(-speed..=speed),
    );
    let mut direction = loop {
        let candidate = random_unit(rng);
        if candidate.y.abs() >= MIN_TILT {
            break candidate;
        }
    };
    let mut track = Vec::with_capacity(settings.frames);
    for _ in 0..settings.frames {
        let half = direction * settings.rod_length / 2.;
        track.push([center - half, center + half]);
        center += velocity;
        let next = (direction + 0.05 * random_unit(rng)).normalize();
        if next.y.abs() >= MIN_TILT {
            direction = next;
        }
    }
    track
}

fn random_unit(rng: &mut Xoshiro256PlusPlus) -> Vector3d {
    loop {
        let v = Vector3d::new(
            rng.gen_range(-1.0..1.0),
            rng.gen_range(-1.0..1.0),
            rng.gen_range(-1.0..1.0),
        );
        let norm = v.norm();
        if norm > 0.1 && norm <= 1. {
            return v / norm;
        }
    }
}

fn noisy(rng: &mut Xoshiro256PlusPlus, pixel: Vector2d, settings: &SceneSettings) -> Vector2d {
    let noise = settings.pixel_noise;
    if noise <= 0. {
        return pixel;
    }
    pixel + Vector2d::new(rng.gen_range(-noise..noise), rng.gen_range(-noise..noise))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::tests::test_rig;

    #[test]
    fn test_generation_is_seeded() {
        let rig = test_rig();
        let colors = [ColorClass::new("red"), ColorClass::new("blue")];
        let settings = SceneSettings::default();
        let a = Scene::generate(&rig, &settings, &colors);
        let b = Scene::generate(&rig, &settings, &colors);
        assert_eq!(a.detections(&colors[0]), b.detections(&colors[0]));
        for color in &colors {
            let detections = a.detections(color);
            assert_eq!(detections.len(), settings.frames);
            let count: usize = detections
                .values()
                .map(|frame| frame.views.iter().map(Vec::len).sum::<usize>())
                .sum();
            assert_eq!(count, 2 * settings.frames * settings.rods_per_color);
        }

        let other = Scene::generate(&rig, &SceneSettings { seed: 1, ..settings }, &colors);
        assert_ne!(a.detections(&colors[0]), other.detections(&colors[0]));
        assert!(a.detections(&ColorClass::new("green")).is_empty());
    }

    #[test]
    fn test_noiseless_detections_project_truth() {
        let rig = test_rig();
        let color = ColorClass::new("red");
        let settings = SceneSettings {
            pixel_noise: 0.,
            ..Default::default()
        };
        let scene = Scene::generate(&rig, &settings, &[color.clone()]);
        let detections = scene.detections(&color);
        let frame = &detections[&3];
        for (k, detection) in frame.view(CameraIndex::First).iter().enumerate() {
            let center = scene.truth(&color, 3, RodId(k as u32)).unwrap();
            let projected = rig.project(&center, CameraIndex::First).unwrap();
            // the image of the midpoint lies between the endpoint images
            assert!((detection.center() - projected).norm() < 5.);
            assert_eq!(detection.frame, 3);
        }
        assert!(scene.truth(&color, settings.frames, RodId(0)).is_none());
    }
}
