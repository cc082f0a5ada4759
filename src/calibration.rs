use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context as AnyhowContext, Result};
use serde::Deserialize;

use crate::camera::StereoRig;
use crate::error::CalibrationError;
use crate::math::{check_rotation, rotation_from_vector};
use crate::my_types::*;

/// A matrix as exported by OpenCV or Matlab, either nested rows or flat in
/// row-major order.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum MatrixValue {
    Nested(Vec<Vec<f64>>),
    Flat(Vec<f64>),
}

impl MatrixValue {
    pub fn values(&self) -> Vec<f64> {
        match self {
            MatrixValue::Nested(rows) => rows.iter().flatten().copied().collect(),
            MatrixValue::Flat(values) => values.clone(),
        }
    }

    fn matrix3(&self, name: &str) -> Result<Matrix3d, CalibrationError> {
        let values = self.values();
        if values.len() != 9 {
            return Err(CalibrationError::InvalidCalibration(format!(
                "{name} must have 9 entries, got {}",
                values.len()
            )));
        }
        Ok(Matrix3d::from_row_slice(&values))
    }

    fn vector3(&self, name: &str) -> Result<Vector3d, CalibrationError> {
        let values = self.values();
        if values.len() != 3 {
            return Err(CalibrationError::InvalidCalibration(format!(
                "{name} must have 3 entries, got {}",
                values.len()
            )));
        }
        Ok(Vector3d::from_column_slice(&values))
    }

    /// A 3-vector, or the translation column of a 4x4 homogeneous transform.
    fn translation(&self, name: &str) -> Result<Vector3d, CalibrationError> {
        let values = self.values();
        match values.len() {
            16 => Ok(Vector3d::new(values[3], values[7], values[11])),
            _ => self.vector3(name),
        }
    }

    /// A 3x3 matrix, the rotation block of a 4x4 homogeneous transform, or a
    /// rotation vector.
    fn rotation(&self, name: &str) -> Result<Matrix3d, CalibrationError> {
        let values = self.values();
        match values.len() {
            3 => Ok(rotation_from_vector(Vector3d::from_column_slice(&values))),
            9 => self.matrix3(name),
            16 => Ok(Matrix4d::from_row_slice(&values)
                .fixed_view::<3, 3>(0, 0)
                .into_owned()),
            n => Err(CalibrationError::InvalidCalibration(format!(
                "{name} must be a rotation vector or matrix, got {n} entries"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StereoCalibration {
    #[serde(rename = "CM1")]
    pub camera_matrix_1: MatrixValue,
    #[serde(rename = "dist1", default = "no_distortion")]
    pub distortion_1: MatrixValue,
    #[serde(rename = "CM2")]
    pub camera_matrix_2: MatrixValue,
    #[serde(rename = "dist2", default = "no_distortion")]
    pub distortion_2: MatrixValue,
    #[serde(rename = "R")]
    pub rotation: MatrixValue,
    #[serde(rename = "T")]
    pub translation: MatrixValue,
}

fn no_distortion() -> MatrixValue {
    MatrixValue::Flat(vec![])
}

impl StereoCalibration {
    pub fn to_rig(&self) -> Result<StereoRig, CalibrationError> {
        let k1 = self.camera_matrix_1.matrix3("CM1")?;
        let k2 = self.camera_matrix_2.matrix3("CM2")?;
        let d1 = self.distortion_1.values();
        let d2 = self.distortion_2.values();
        let r = self.rotation.rotation("R")?;
        let t = self.translation.vector3("T")?;
        StereoRig::new([k1, k2], [d1.as_slice(), d2.as_slice()], r, t)
    }
}

/// Rigid transform from the first camera's frame to the world frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldTransform {
    rotation: Matrix3d,
    translation: Vector3d,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WorldTransformFile {
    Direct {
        rotation: MatrixValue,
        translation: MatrixValue,
    },
    /// Older exports: one homogeneous matrix per axis rotation and two shifts,
    /// applied as `rz * ry * rx * (p + t1) + t2`.
    Axes {
        #[serde(rename = "M_rotate_x")]
        rotate_x: MatrixValue,
        #[serde(rename = "M_rotate_y")]
        rotate_y: MatrixValue,
        #[serde(rename = "M_rotate_z")]
        rotate_z: MatrixValue,
        #[serde(rename = "M_trans")]
        shift: MatrixValue,
        #[serde(rename = "M_trans2")]
        shift_after: MatrixValue,
    },
}

impl WorldTransformFile {
    fn parts(&self) -> Result<(Matrix3d, Vector3d), CalibrationError> {
        match self {
            WorldTransformFile::Direct {
                rotation,
                translation,
            } => Ok((
                rotation.rotation("rotation")?,
                translation.vector3("translation")?,
            )),
            WorldTransformFile::Axes {
                rotate_x,
                rotate_y,
                rotate_z,
                shift,
                shift_after,
            } => {
                let rotation = rotate_z.rotation("M_rotate_z")?
                    * rotate_y.rotation("M_rotate_y")?
                    * rotate_x.rotation("M_rotate_x")?;
                let translation = rotation * shift.translation("M_trans")?
                    + shift_after.translation("M_trans2")?;
                Ok((rotation, translation))
            }
        }
    }
}

impl WorldTransform {
    pub fn new(rotation: Matrix3d, translation: Vector3d) -> Result<Self, CalibrationError> {
        check_rotation(&rotation, "rotation")?;
        if translation.iter().any(|x| !x.is_finite()) {
            return Err(CalibrationError::InvalidCalibration(
                "translation contains non-finite entries".to_string(),
            ));
        }
        Ok(WorldTransform {
            rotation,
            translation,
        })
    }

    pub fn rotation(&self) -> &Matrix3d {
        &self.rotation
    }

    pub fn translation(&self) -> &Vector3d {
        &self.translation
    }

    pub fn apply(&self, point: &Vector3d) -> Vector3d {
        self.rotation * point + self.translation
    }

    pub fn inverse_apply(&self, point: &Vector3d) -> Vector3d {
        self.rotation.transpose() * (point - self.translation)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let file: WorldTransformFile =
            serde_json::from_str(json).context("failed to parse world transform")?;
        let (rotation, translation) = file.parts()?;
        Ok(WorldTransform::new(rotation, translation)?)
    }
}

pub fn load_stereo_rig(path: &Path) -> Result<StereoRig> {
    let file = File::open(path)
        .with_context(|| format!("failed to open calibration {}", path.display()))?;
    let calibration: StereoCalibration = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("failed to parse calibration {}", path.display()))?;
    let rig = calibration
        .to_rig()
        .with_context(|| format!("rejected calibration {}", path.display()))?;
    Ok(rig)
}

pub fn load_world_transform(path: &Path) -> Result<WorldTransform> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read world transform {}", path.display()))?;
    WorldTransform::from_json(&json).with_context(|| format!("in {}", path.display()))
}
