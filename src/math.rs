use crate::error::CalibrationError;
use crate::my_types::*;

/// slam book eq. 2.4
pub fn skew(v: Vector3d) -> Matrix3d {
    let mut ss = Matrix3d::zeros();
    ss[(0, 1)] = -v[2];
    ss[(0, 2)] = v[1];
    ss[(1, 0)] = v[2];
    ss[(1, 2)] = -v[0];
    ss[(2, 0)] = -v[1];
    ss[(2, 1)] = v[0];
    ss
}

/// Rodrigues formula, rotation vector to rotation matrix.
pub fn rotation_from_vector(omega: Vector3d) -> Matrix3d {
    let theta = omega.norm();
    if theta < 1e-12 {
        return Matrix3d::identity() + skew(omega);
    }
    let k = skew(omega / theta);
    Matrix3d::identity() + theta.sin() * k + (1. - theta.cos()) * k * k
}

pub fn check_rotation(r: &Matrix3d, name: &str) -> Result<(), CalibrationError> {
    if r.iter().any(|x| !x.is_finite()) {
        return Err(CalibrationError::InvalidCalibration(format!(
            "{name} contains non-finite entries"
        )));
    }
    let orthogonality = (r.transpose() * r - Matrix3d::identity()).abs().max();
    if orthogonality > 1e-6 || (r.determinant() - 1.).abs() > 1e-6 {
        return Err(CalibrationError::InvalidCalibration(format!(
            "{name} is not a proper rotation matrix"
        )));
    }
    Ok(())
}

/// Angle between two undirected axes, in [0, pi/2].
pub fn axis_angle(u: &Vector3d, v: &Vector3d) -> f64 {
    let nu = u.norm();
    let nv = v.norm();
    if nu < f64::EPSILON || nv < f64::EPSILON {
        return 0.;
    }
    (u.dot(v).abs() / (nu * nv)).min(1.).acos()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skew_is_cross_product() {
        let a = Vector3d::new(0.3, -1.2, 2.);
        let b = Vector3d::new(-0.7, 0.4, 1.1);
        assert!((skew(a) * b - a.cross(&b)).norm() < 1e-12);
    }

    #[test]
    fn test_rotation_from_vector() {
        let r = rotation_from_vector(Vector3d::new(0., 0., std::f64::consts::FRAC_PI_2));
        let x = r * Vector3d::new(1., 0., 0.);
        assert!((x - Vector3d::new(0., 1., 0.)).norm() < 1e-12);
        assert!(check_rotation(&r, "r").is_ok());

        let bad = Matrix3d::new(1., 0., 0., 0., 2., 0., 0., 0., 1.);
        assert!(check_rotation(&bad, "bad").is_err());
        assert!(check_rotation(&-Matrix3d::identity(), "reflection").is_err());
    }

    #[test]
    fn test_axis_angle_ignores_direction() {
        let u = Vector3d::new(1., 0., 0.);
        assert!(axis_angle(&u, &-u).abs() < 1e-12);
        let v = Vector3d::new(0., 3., 0.);
        assert!((axis_angle(&u, &v) - std::f64::consts::FRAC_PI_2).abs() < 1e-12);
    }
}
