use std::fmt::Debug;

use crate::error::CalibrationError;
use crate::feature::CameraIndex;
use crate::math::check_rotation;
use crate::my_types::*;
use crate::pinhole::PinholeModel;

#[derive(Debug)]
pub struct Camera {
    pub kind: CameraKind,
    pub model: Box<dyn CameraModel + Send + Sync>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CameraKind {
    Pinhole,
}

pub trait CameraModel: Debug {
    /// Normalized ray (z = 1) through a raw pixel.
    fn back_project(&self, pixel: Vector2d) -> Option<Vector3d>;

    /// Pixel of a point in camera coordinates, distortion included. The
    /// derivative is that of the undistorted pinhole projection.
    fn project_with_derivative(
        &self,
        ray: Vector3d,
        compute_derivative: bool,
    ) -> (Option<Vector2d>, Option<Matrix23d>);

    fn project(&self, ray: Vector3d) -> Option<Vector2d> {
        self.project_with_derivative(ray, false).0
    }

    /// Pixel of a point in camera coordinates without lens distortion.
    fn project_undistorted(&self, ray: Vector3d) -> Option<Vector2d>;
}

/// Rigid pose of a camera relative to the first camera: `x_cam = R x_cam1 + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraPose {
    pub orientation: Matrix3d,
    pub position: Vector3d,
}

impl CameraPose {
    pub fn identity() -> Self {
        CameraPose {
            orientation: Matrix3d::identity(),
            position: Vector3d::zeros(),
        }
    }

    pub fn transform(&self, point: &Vector3d) -> Vector3d {
        self.orientation * point + self.position
    }

    /// `[R | t]`
    pub fn matrix(&self) -> Matrix34d {
        let mut m = Matrix34d::zeros();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.orientation);
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.position);
        m
    }

    /// Optical center expressed in the first camera's frame.
    pub fn center(&self) -> Vector3d {
        -self.orientation.transpose() * self.position
    }
}

/// Calibrated two-view rig. Camera one defines the reference frame.
#[derive(Debug)]
pub struct StereoRig {
    cameras: [Camera; 2],
    poses: [CameraPose; 2],
}

impl StereoRig {
    pub fn new(
        camera_matrices: [Matrix3d; 2],
        distortions: [&[f64]; 2],
        r_cam1_cam2: Matrix3d,
        t_cam1_cam2: Vector3d,
    ) -> Result<Self, CalibrationError> {
        check_rotation(&r_cam1_cam2, "R")?;
        if t_cam1_cam2.iter().any(|x| !x.is_finite()) {
            return Err(CalibrationError::InvalidCalibration(
                "T contains non-finite entries".to_string(),
            ));
        }
        if t_cam1_cam2.norm() < f64::EPSILON {
            return Err(CalibrationError::InvalidCalibration(
                "stereo baseline is zero".to_string(),
            ));
        }
        let camera0 = Camera {
            kind: CameraKind::Pinhole,
            model: Box::new(PinholeModel::with_distortion(
                camera_matrices[0],
                distortions[0],
            )?),
        };
        let camera1 = Camera {
            kind: CameraKind::Pinhole,
            model: Box::new(PinholeModel::with_distortion(
                camera_matrices[1],
                distortions[1],
            )?),
        };
        Ok(StereoRig {
            cameras: [camera0, camera1],
            poses: [
                CameraPose::identity(),
                CameraPose {
                    orientation: r_cam1_cam2,
                    position: t_cam1_cam2,
                },
            ],
        })
    }

    pub fn camera(&self, camera: CameraIndex) -> &Camera {
        &self.cameras[camera.index()]
    }

    pub fn pose(&self, camera: CameraIndex) -> &CameraPose {
        &self.poses[camera.index()]
    }

    /// Point in the first camera's frame to a raw pixel of `camera`.
    pub fn project(&self, point: &Vector3d, camera: CameraIndex) -> Option<Vector2d> {
        let ray = self.pose(camera).transform(point);
        self.camera(camera).model.project(ray)
    }

    /// Euclidean pixel distance between the projection and the observation.
    /// Infinite if the point cannot be projected into `camera`.
    pub fn reprojection_error(
        &self,
        point: &Vector3d,
        observed: &Vector2d,
        camera: CameraIndex,
    ) -> f64 {
        self.project(point, camera)
            .map(|p| (p - observed).norm())
            .unwrap_or(f64::INFINITY)
    }

    /// Ray direction through a raw pixel, expressed in the first camera's frame.
    pub fn back_project(&self, pixel: Vector2d, camera: CameraIndex) -> Option<Vector3d> {
        let ray = self.camera(camera).model.back_project(pixel)?;
        Some(self.pose(camera).orientation.transpose() * ray)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::math::rotation_from_vector;

    pub fn test_rig() -> StereoRig {
        let k0 = Matrix3d::new(1000., 0., 640., 0., 1000., 480., 0., 0., 1.);
        let k1 = Matrix3d::new(980., 0., 650., 0., 990., 470., 0., 0., 1.);
        let r = rotation_from_vector(Vector3d::new(0.02, -0.35, 0.01));
        let t = Vector3d::new(-150., 5., 30.);
        StereoRig::new([k0, k1], [&[], &[]], r, t).unwrap()
    }

    #[test]
    fn test_projection_of_reprojected_point() {
        let rig = test_rig();
        let point = Vector3d::new(12., -30., 400.);
        for camera in CameraIndex::BOTH {
            let pixel = rig.project(&point, camera).unwrap();
            assert!(rig.reprojection_error(&point, &pixel, camera) < 1e-9);

            let ray = rig.back_project(pixel, camera).unwrap();
            let center = rig.pose(camera).center();
            let expected = (point - center).normalize();
            assert!((ray.normalize() - expected).norm() < 1e-9);
        }
    }

    #[test]
    fn test_point_behind_camera() {
        let rig = test_rig();
        let point = Vector3d::new(0., 0., -100.);
        assert!(rig.project(&point, CameraIndex::First).is_none());
        let error = rig.reprojection_error(&point, &Vector2d::zeros(), CameraIndex::First);
        assert!(error.is_infinite());
    }

    #[test]
    fn test_invalid_rig() {
        let k = Matrix3d::new(1000., 0., 640., 0., 1000., 480., 0., 0., 1.);
        let t = Vector3d::new(-150., 0., 0.);
        let bad_r = Matrix3d::new(1., 0., 0., 0., 1., 0., 0., 0., 2.);
        assert!(StereoRig::new([k, k], [&[], &[]], bad_r, t).is_err());
        assert!(StereoRig::new([k, k], [&[], &[]], Matrix3d::identity(), Vector3d::zeros()).is_err());
        let singular = Matrix3d::zeros();
        assert!(StereoRig::new([singular, k], [&[], &[]], Matrix3d::identity(), t).is_err());
    }
}
