use nalgebra::matrix;

use crate::camera::*;
use crate::error::CalibrationError;
use crate::my_types::*;

const UNDISTORT_ITERATIONS: usize = 20;

/// Brown-Conrady coefficients in OpenCV order `k1 k2 p1 p2 k3`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Distortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

impl Distortion {
    pub fn from_coefficients(coefficients: &[f64]) -> Result<Self, CalibrationError> {
        if coefficients.len() > 5 {
            return Err(CalibrationError::InvalidCalibration(format!(
                "expected at most 5 distortion coefficients, got {}",
                coefficients.len()
            )));
        }
        if coefficients.iter().any(|x| !x.is_finite()) {
            return Err(CalibrationError::InvalidCalibration(
                "distortion coefficients must be finite".to_string(),
            ));
        }
        let mut c = [0.; 5];
        c[..coefficients.len()].copy_from_slice(coefficients);
        Ok(Distortion {
            k1: c[0],
            k2: c[1],
            p1: c[2],
            p2: c[3],
            k3: c[4],
        })
    }

    pub fn is_zero(&self) -> bool {
        *self == Distortion::default()
    }

    pub fn distort(&self, p: Vector2d) -> Vector2d {
        let (x, y) = (p[0], p[1]);
        let r2 = x * x + y * y;
        let radial = 1. + self.k1 * r2 + self.k2 * r2 * r2 + self.k3 * r2 * r2 * r2;
        let x_tan = 2. * self.p1 * x * y + self.p2 * (r2 + 2. * x * x);
        let y_tan = self.p1 * (r2 + 2. * y * y) + 2. * self.p2 * x * y;
        Vector2d::new(x * radial + x_tan, y * radial + y_tan)
    }

    /// Fixed point inversion of `distort`.
    pub fn undistort(&self, p: Vector2d) -> Vector2d {
        if self.is_zero() {
            return p;
        }
        let mut u = p;
        for _ in 0..UNDISTORT_ITERATIONS {
            let e = self.distort(u) - p;
            u -= e;
            if e.norm_squared() < 1e-24 {
                break;
            }
        }
        u
    }
}

#[derive(Debug)]
pub struct PinholeModel {
    pub camera_matrix: Matrix3d,
    pub camera_matrix_inv: Matrix3d,
    pub distortion: Distortion,
}

impl PinholeModel {
    pub fn new(camera_matrix: Matrix3d) -> Result<Self, CalibrationError> {
        Self::with_distortion(camera_matrix, &[])
    }

    pub fn with_distortion(
        camera_matrix: Matrix3d,
        coefficients: &[f64],
    ) -> Result<Self, CalibrationError> {
        if camera_matrix.iter().any(|x| !x.is_finite()) {
            return Err(CalibrationError::InvalidCalibration(
                "camera matrix contains non-finite entries".to_string(),
            ));
        }
        if camera_matrix[(0, 0)] <= 0. || camera_matrix[(1, 1)] <= 0. {
            return Err(CalibrationError::InvalidCalibration(
                "focal lengths must be positive".to_string(),
            ));
        }
        let camera_matrix_inv = camera_matrix.try_inverse().ok_or_else(|| {
            CalibrationError::InvalidCalibration("camera matrix is not invertible".to_string())
        })?;
        Ok(PinholeModel {
            camera_matrix,
            camera_matrix_inv,
            distortion: Distortion::from_coefficients(coefficients)?,
        })
    }

    fn normalized_to_pixel(&self, p: Vector2d) -> Vector2d {
        let pixel = self.camera_matrix * Vector3d::new(p[0], p[1], 1.);
        Vector2d::new(pixel[0] / pixel[2], pixel[1] / pixel[2])
    }

    fn pixel_to_normalized(&self, pixel: Vector2d) -> Vector2d {
        let p = self.camera_matrix_inv * Vector3d::new(pixel[0], pixel[1], 1.);
        Vector2d::new(p[0] / p[2], p[1] / p[2])
    }
}

impl CameraModel for PinholeModel {
    fn back_project(&self, pixel: Vector2d) -> Option<Vector3d> {
        let p = self.distortion.undistort(self.pixel_to_normalized(pixel));
        if !p.iter().all(|x| x.is_finite()) {
            return None;
        }
        Some(Vector3d::new(p[0], p[1], 1.))
    }

    fn project_with_derivative(
        &self,
        ray: Vector3d,
        compute_derivative: bool,
    ) -> (Option<Vector2d>, Option<Matrix23d>) {
        // ray is behind camera
        if ray[2] <= 0. {
            return (None, None);
        }
        let z_inv = 1. / ray[2];
        let p = Vector2d::new(z_inv * ray[0], z_inv * ray[1]);
        let pixel = self.normalized_to_pixel(self.distortion.distort(p));
        // derivative of uv wrt xyz
        let pixel_derivative = if compute_derivative {
            // derivative of normalized uv wrt xyz
            let x_xbar_derivative = matrix!(
                z_inv,
                0.,
                -ray[0] * z_inv.powi(2);
                0.,
                z_inv,
                -ray[1] * z_inv.powi(2);
            );
            Some(self.camera_matrix.fixed_view::<2, 2>(0, 0) * x_xbar_derivative)
        } else {
            None
        };
        (Some(pixel), pixel_derivative)
    }

    fn project_undistorted(&self, ray: Vector3d) -> Option<Vector2d> {
        if ray[2] <= 0. {
            return None;
        }
        Some(self.normalized_to_pixel(Vector2d::new(ray[0] / ray[2], ray[1] / ray[2])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pinhole() {
        let intrinsics = Matrix3d::new(1000., 0., 360., 0., 1000., 240., 0., 0., 1.);
        let ray = Vector3d::new(-0.25, 0.11, 2.).normalize();
        let camera = PinholeModel::new(intrinsics).unwrap();
        let pixel = camera.project(ray).unwrap();
        assert!((pixel - Vector2d::new(235., 295.)).norm() < 1e-6);

        let intrinsics = Matrix3d::new(458., 0., 367.215, 0., 458., 248.375, 0., 0., 1.);
        let camera = PinholeModel::new(intrinsics).unwrap();
        let pixel = camera.project(ray).unwrap();
        assert!((pixel - Vector2d::new(309.965, 273.565)).norm() < 1e-6);

        let ray_computed = camera.back_project(pixel).unwrap();
        assert!((ray_computed - ray / ray[2]).norm() < 1e-10)
    }

    #[test]
    fn test_distortion_round_trip() {
        let intrinsics = Matrix3d::new(1200., 0., 640., 0., 1180., 512., 0., 0., 1.);
        let camera =
            PinholeModel::with_distortion(intrinsics, &[-0.21, 0.08, 0.001, -0.0005, 0.01])
                .unwrap();
        for ray in [
            Vector3d::new(0.1, -0.05, 1.),
            Vector3d::new(-0.3, 0.25, 1.),
            Vector3d::new(0., 0., 3.),
        ] {
            let pixel = camera.project(ray).unwrap();
            let back = camera.back_project(pixel).unwrap();
            assert!((back - ray / ray[2]).norm() < 1e-9, "{back} vs {ray}");

            let ideal = camera.project_undistorted(back).unwrap();
            let expected = camera.project_undistorted(ray).unwrap();
            assert!((ideal - expected).norm() < 1e-6);
        }
    }

    #[test]
    fn test_projection_derivative() {
        let intrinsics = Matrix3d::new(800., 0., 320., 0., 820., 240., 0., 0., 1.);
        let camera = PinholeModel::new(intrinsics).unwrap();
        let ray = Vector3d::new(0.4, -0.2, 2.5);
        let (pixel, derivative) = camera.project_with_derivative(ray, true);
        let (pixel, derivative) = (pixel.unwrap(), derivative.unwrap());
        let h = 1e-6;
        for i in 0..3 {
            let mut shifted = ray;
            shifted[i] += h;
            let numeric = (camera.project(shifted).unwrap() - pixel) / h;
            assert!((numeric - derivative.column(i)).norm() < 1e-3);
        }
    }

    #[test]
    fn test_invalid_intrinsics() {
        assert!(PinholeModel::new(Matrix3d::zeros()).is_err());
        let k = Matrix3d::new(-10., 0., 0., 0., 10., 0., 0., 0., 1.);
        assert!(PinholeModel::new(k).is_err());
        let k = Matrix3d::identity();
        assert!(PinholeModel::with_distortion(k, &[0.; 6]).is_err());
        assert!(PinholeModel::with_distortion(k, &[f64::NAN]).is_err());
    }
}
