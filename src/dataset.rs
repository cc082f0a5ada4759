use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context as AnyhowContext, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::feature::{CameraIndex, ColorClass, Detection};
use crate::my_types::*;
use crate::rod::{Rod, RodId};
use crate::sequence::{FrameOutput, StereoDetections};

/// One line of a detections file. Cameras are numbered from 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub frame: FrameIndex,
    pub camera: usize,
    pub color: ColorClass,
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl DetectionRecord {
    pub fn from_detection(detection: &Detection) -> Self {
        let [a, b] = detection.endpoints;
        DetectionRecord {
            frame: detection.frame,
            camera: detection.camera.index() + 1,
            color: detection.color.clone(),
            x1: a.x,
            y1: a.y,
            x2: b.x,
            y2: b.y,
        }
    }

    pub fn to_detection(&self) -> Result<Detection> {
        let camera = self
            .camera
            .checked_sub(1)
            .and_then(CameraIndex::from_index)
            .ok_or(anyhow!("camera must be 1 or 2, got {}", self.camera))?;
        Ok(Detection::new(
            [Vector2d::new(self.x1, self.y1), Vector2d::new(self.x2, self.y2)],
            self.color.clone(),
            self.frame,
            camera,
        ))
    }
}

pub struct DetectionReader {
    reader: BufReader<File>,
    line: String,
    line_number: usize,
}

impl DetectionReader {
    pub fn new(path: &Path) -> Result<DetectionReader> {
        let file = File::open(path)
            .with_context(|| format!("failed to open detections {}", path.display()))?;
        Ok(DetectionReader {
            reader: BufReader::new(file),
            line: String::new(),
            line_number: 0,
        })
    }

    pub fn next(&mut self) -> Result<Option<Detection>> {
        loop {
            self.line.clear();
            self.line_number += 1;
            match self.reader.read_line(&mut self.line) {
                Ok(0) => return Ok(None),
                Err(err) => bail!("Failed to read line {}: {}", self.line_number, err),
                _ => {}
            }
            if self.line.trim().is_empty() {
                continue;
            }
            let record: DetectionRecord = serde_json::from_str(&self.line).context(format!(
                "JSON deserialization failed for line {}: {}",
                self.line_number,
                self.line.trim_end()
            ))?;
            return record
                .to_detection()
                .map(Some)
                .with_context(|| format!("line {}", self.line_number));
        }
    }
}

pub type ColorDetections = BTreeMap<FrameIndex, StereoDetections>;

/// Detections grouped by color and frame. Only `colors` are kept when given,
/// and only frames in `frames`.
pub fn load_detections(
    path: &Path,
    colors: Option<&[ColorClass]>,
    frames: Option<&Range<FrameIndex>>,
) -> Result<BTreeMap<ColorClass, ColorDetections>> {
    let mut reader = DetectionReader::new(path)?;
    let mut grouped: BTreeMap<ColorClass, ColorDetections> = BTreeMap::new();
    let mut ignored = 0;
    while let Some(detection) = reader.next()? {
        let wanted_color = colors.map_or(true, |c| c.contains(&detection.color));
        let wanted_frame = frames.map_or(true, |f| f.contains(&detection.frame));
        if !(wanted_color && wanted_frame) {
            ignored += 1;
            continue;
        }
        grouped
            .entry(detection.color.clone())
            .or_default()
            .entry(detection.frame)
            .or_default()
            .push(detection);
    }
    if let Some(colors) = colors {
        for color in colors {
            if !grouped.contains_key(color) {
                warn!("no detections of color {}", color);
                grouped.insert(color.clone(), BTreeMap::new());
            }
        }
    }
    info!(
        "loaded {} colors from {}, ignored {} detections",
        grouped.len(),
        path.display(),
        ignored
    );
    Ok(grouped)
}

/// Flat rod row. Coordinates of an unobserved view hold the sentinel, 3D
/// coordinates of a dummy rod are absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RodRecord {
    pub x1: Option<f64>,
    pub y1: Option<f64>,
    pub z1: Option<f64>,
    pub x2: Option<f64>,
    pub y2: Option<f64>,
    pub z2: Option<f64>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub l: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world: Option<[[f64; 3]; 2]>,
    pub x1_cam1: f64,
    pub y1_cam1: f64,
    pub x2_cam1: f64,
    pub y2_cam1: f64,
    pub x1_cam2: f64,
    pub y1_cam2: f64,
    pub x2_cam2: f64,
    pub y2_cam2: f64,
    pub seen_cam1: bool,
    pub seen_cam2: bool,
    pub cost: Option<f64>,
    pub particle: RodId,
    pub frame: FrameIndex,
    pub color: ColorClass,
}

impl RodRecord {
    pub fn from_rod(rod: &Rod) -> Self {
        let endpoints = rod.endpoints;
        let coordinate = |k: usize, axis: usize| endpoints.map(|e| e[k][axis]);
        let center = rod.center();
        let [a1, b1] = rod.view_endpoints(CameraIndex::First);
        let [a2, b2] = rod.view_endpoints(CameraIndex::Second);
        RodRecord {
            x1: coordinate(0, 0),
            y1: coordinate(0, 1),
            z1: coordinate(0, 2),
            x2: coordinate(1, 0),
            y2: coordinate(1, 1),
            z2: coordinate(1, 2),
            x: center.map(|c| c.x),
            y: center.map(|c| c.y),
            z: center.map(|c| c.z),
            l: rod.length(),
            world: rod
                .world_endpoints
                .map(|[a, b]| [[a.x, a.y, a.z], [b.x, b.y, b.z]]),
            x1_cam1: a1.x,
            y1_cam1: a1.y,
            x2_cam1: b1.x,
            y2_cam1: b1.y,
            x1_cam2: a2.x,
            y1_cam2: a2.y,
            x2_cam2: b2.x,
            y2_cam2: b2.y,
            seen_cam1: rod.seen(CameraIndex::First),
            seen_cam2: rod.seen(CameraIndex::Second),
            cost: rod.cost,
            particle: rod.id,
            frame: rod.frame,
            color: rod.color.clone(),
        }
    }

    pub fn to_rod(&self) -> Rod {
        let mut rod = Rod::dummy(self.particle, self.color.clone(), self.frame);
        if let (Some(x1), Some(y1), Some(z1), Some(x2), Some(y2), Some(z2)) =
            (self.x1, self.y1, self.z1, self.x2, self.y2, self.z2)
        {
            rod.endpoints = Some([Vector3d::new(x1, y1, z1), Vector3d::new(x2, y2, z2)]);
        }
        rod.world_endpoints = self
            .world
            .map(|[a, b]| [Vector3d::from(a), Vector3d::from(b)]);
        if self.seen_cam1 {
            rod.views[0] = Some([
                Vector2d::new(self.x1_cam1, self.y1_cam1),
                Vector2d::new(self.x2_cam1, self.y2_cam1),
            ]);
        }
        if self.seen_cam2 {
            rod.views[1] = Some([
                Vector2d::new(self.x1_cam2, self.y1_cam2),
                Vector2d::new(self.x2_cam2, self.y2_cam2),
            ]);
        }
        rod.cost = self.cost;
        rod
    }
}

/// Previously written rods, e.g. to continue tracking from an earlier run.
pub fn load_rods(path: &Path) -> Result<Vec<Rod>> {
    let file =
        File::open(path).with_context(|| format!("failed to open rods {}", path.display()))?;
    let mut rods = Vec::new();
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: RodRecord = serde_json::from_str(&line)
            .with_context(|| format!("{} line {}", path.display(), number + 1))?;
        rods.push(record.to_rod());
    }
    debug!("loaded {} rods from {}", rods.len(), path.display());
    Ok(rods)
}

pub fn rods_path(dir: &Path, color: &ColorClass) -> PathBuf {
    dir.join(format!("rods_{}.jsonl", color))
}

/// Writes committed frames to one `rods_<color>.jsonl` file per color.
pub struct RodWriter {
    dir: PathBuf,
    append: bool,
    writers: BTreeMap<ColorClass, BufWriter<File>>,
    written: usize,
}

impl RodWriter {
    /// Replaces existing rod files in `dir`.
    pub fn new(dir: &Path) -> Result<RodWriter> {
        Self::open(dir, false)
    }

    /// Continues existing rod files in `dir`, as needed when resuming into the
    /// folder of an earlier run.
    pub fn appending(dir: &Path) -> Result<RodWriter> {
        Self::open(dir, true)
    }

    fn open(dir: &Path, append: bool) -> Result<RodWriter> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create output folder {}", dir.display()))?;
        Ok(RodWriter {
            dir: dir.to_path_buf(),
            append,
            writers: BTreeMap::new(),
            written: 0,
        })
    }

    pub fn write(&mut self, output: &FrameOutput) -> Result<()> {
        if !self.writers.contains_key(&output.color) {
            let path = rods_path(&self.dir, &output.color);
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .append(self.append)
                .truncate(!self.append)
                .open(&path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            self.writers.insert(output.color.clone(), BufWriter::new(file));
        }
        let writer = self
            .writers
            .get_mut(&output.color)
            .ok_or(anyhow!("no writer for color {}", output.color))?;
        for rod in &output.rods {
            serde_json::to_writer(&mut *writer, &RodRecord::from_rod(rod))?;
            writer.write_all(b"\n")?;
            self.written += 1;
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<usize> {
        for writer in self.writers.values_mut() {
            writer.flush()?;
        }
        Ok(self.written)
    }
}
