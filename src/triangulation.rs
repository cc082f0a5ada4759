use crate::camera::StereoRig;
use crate::error::GeometryError;
use crate::feature::{CameraIndex, Detection, EndpointOrder};
use crate::math::skew;
use crate::my_types::*;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriangulationSettings {
    /// Minimum angle in radians between the two viewing rays of a point.
    pub min_parallax: f64,
    /// Gauss-Newton steps applied after the linear solution.
    pub refine_iterations: usize,
}

impl Default for TriangulationSettings {
    fn default() -> Self {
        TriangulationSettings {
            min_parallax: 1e-5,
            refine_iterations: 5,
        }
    }
}

/// Both endpoints of one candidate correspondence, reconstructed in the first
/// camera's frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Triangulation {
    pub endpoints: [Vector3d; 2],
    pub order: EndpointOrder,
    /// Pixel reprojection error, indexed by endpoint then camera.
    pub errors: [[f64; 2]; 2],
    pub cost: f64,
}

impl Triangulation {
    pub fn center(&self) -> Vector3d {
        (self.endpoints[0] + self.endpoints[1]) / 2.
    }

    pub fn length(&self) -> f64 {
        (self.endpoints[0] - self.endpoints[1]).norm()
    }
}

pub struct Triangulator<'a> {
    rig: &'a StereoRig,
    settings: TriangulationSettings,
}

impl<'a> Triangulator<'a> {
    pub fn new(rig: &'a StereoRig, settings: TriangulationSettings) -> Self {
        Triangulator { rig, settings }
    }

    pub fn rig(&self) -> &StereoRig {
        self.rig
    }

    /// Reconstruct a rod from a camera-1 and a camera-2 detection. Endpoint `k`
    /// of `first` pairs with endpoint `k` of `order.apply(second.endpoints)`.
    pub fn triangulate(
        &self,
        first: &Detection,
        second: &Detection,
        order: EndpointOrder,
    ) -> Result<Triangulation, GeometryError> {
        let second_endpoints = order.apply(second.endpoints);
        let endpoints = [
            self.triangulate_point(first.endpoints[0], second_endpoints[0])?,
            self.triangulate_point(first.endpoints[1], second_endpoints[1])?,
        ];

        let mut errors = [[0.; 2]; 2];
        for k in 0..2 {
            errors[k][0] =
                self.rig
                    .reprojection_error(&endpoints[k], &first.endpoints[k], CameraIndex::First);
            errors[k][1] = self.rig.reprojection_error(
                &endpoints[k],
                &second_endpoints[k],
                CameraIndex::Second,
            );
        }
        let cost: f64 = errors.iter().flatten().sum();
        if !cost.is_finite() {
            return Err(GeometryError::DegenerateGeometry("non-finite reprojection cost"));
        }
        Ok(Triangulation {
            endpoints,
            order,
            errors,
            cost,
        })
    }

    /// Linear two-view triangulation on normalized coordinates followed by a
    /// Gauss-Newton refinement of the undistorted pixel error.
    pub fn triangulate_point(
        &self,
        pixel_first: Vector2d,
        pixel_second: Vector2d,
    ) -> Result<Vector3d, GeometryError> {
        let pixels = [pixel_first, pixel_second];
        let mut rays = [Vector3d::zeros(); 2];
        for camera in CameraIndex::BOTH {
            rays[camera.index()] = self
                .rig
                .camera(camera)
                .model
                .back_project(pixels[camera.index()])
                .ok_or(GeometryError::DegenerateGeometry("pixel cannot be undistorted"))?;
        }

        let direction_first = rays[0];
        let direction_second =
            self.rig.pose(CameraIndex::Second).orientation.transpose() * rays[1];
        let cos_parallax = direction_first.dot(&direction_second)
            / (direction_first.norm() * direction_second.norm());
        if cos_parallax.min(1.).acos() < self.settings.min_parallax {
            return Err(GeometryError::DegenerateGeometry("near-parallel rays"));
        }

        let mut a = Matrix4d::zeros();
        for camera in CameraIndex::BOTH {
            let rows = skew(rays[camera.index()]) * self.rig.pose(camera).matrix();
            a.fixed_view_mut::<2, 4>(2 * camera.index(), 0)
                .copy_from(&rows.fixed_view::<2, 4>(0, 0));
        }
        let svd = a.svd(false, true);
        let v_t = svd
            .v_t
            .ok_or(GeometryError::DegenerateGeometry("svd failed during triangulation"))?;
        let x_h = v_t.row(svd.singular_values.imin()).transpose();
        if x_h[3].abs() <= 1e-12 * x_h.norm() {
            return Err(GeometryError::DegenerateGeometry("point at infinity"));
        }
        let mut point = x_h.fixed_rows::<3>(0) / x_h[3];

        if self.settings.refine_iterations > 0 {
            point = self.refine(point, &rays);
        }

        if !point.iter().all(|x| x.is_finite()) {
            return Err(GeometryError::DegenerateGeometry("non-finite point"));
        }
        for camera in CameraIndex::BOTH {
            if self.rig.pose(camera).transform(&point)[2] <= 0. {
                return Err(GeometryError::BehindCamera(camera));
            }
        }
        Ok(point)
    }

    fn refine(&self, mut point: Vector3d, rays: &[Vector3d; 2]) -> Vector3d {
        for _ in 0..self.settings.refine_iterations {
            let mut jtj = Matrix3d::zeros();
            let mut jtr = Vector3d::zeros();
            for camera in CameraIndex::BOTH {
                let model = &self.rig.camera(camera).model;
                let pose = self.rig.pose(camera);
                let observed = match model.project_undistorted(rays[camera.index()]) {
                    Some(p) => p,
                    None => return point,
                };
                let ray = pose.transform(&point);
                let (pixel, derivative) = match (
                    model.project_undistorted(ray),
                    model.project_with_derivative(ray, true).1,
                ) {
                    (Some(pixel), Some(derivative)) => (pixel, derivative),
                    _ => return point,
                };
                let jacobian = derivative * pose.orientation;
                let residual = pixel - observed;
                jtj += jacobian.transpose() * jacobian;
                jtr += jacobian.transpose() * residual;
            }
            let delta = match jtj.try_inverse() {
                Some(inverse) => -(inverse * jtr),
                None => return point,
            };
            point += delta;
            if delta.norm() < 1e-10 * point.norm().max(1.) {
                break;
            }
        }
        point
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::tests::test_rig;
    use crate::feature::ColorClass;

    fn cost(
        triangulator: &Triangulator,
        first: &Detection,
        second: &Detection,
        order: EndpointOrder,
    ) -> f64 {
        triangulator
            .triangulate(first, second, order)
            .map_or(f64::INFINITY, |t| t.cost)
    }

    fn detection(rig: &StereoRig, points: [Vector3d; 2], camera: CameraIndex) -> Detection {
        Detection::new(
            [
                rig.project(&points[0], camera).unwrap(),
                rig.project(&points[1], camera).unwrap(),
            ],
            ColorClass::new("red"),
            0,
            camera,
        )
    }

    #[test]
    fn test_noiseless_round_trip() {
        let rig = test_rig();
        let triangulator = Triangulator::new(&rig, TriangulationSettings::default());
        let rod = [Vector3d::new(-20., 10., 500.), Vector3d::new(15., 25., 520.)];
        let first = detection(&rig, rod, CameraIndex::First);
        let second = detection(&rig, rod, CameraIndex::Second);

        let result = triangulator
            .triangulate(&first, &second, EndpointOrder::Forward)
            .unwrap();
        assert!(result.cost < 1e-6, "cost {}", result.cost);
        for k in 0..2 {
            assert!((result.endpoints[k] - rod[k]).norm() < 1e-6);
            for camera in CameraIndex::BOTH {
                let observed = if camera == CameraIndex::First {
                    first.endpoints[k]
                } else {
                    second.endpoints[k]
                };
                assert!(rig.reprojection_error(&result.endpoints[k], &observed, camera) < 1e-6);
            }
        }
        assert!((result.length() - (rod[0] - rod[1]).norm()).abs() < 1e-6);

        let swapped = cost(&triangulator, &first, &second, EndpointOrder::Swapped);
        assert!(swapped > 1.);
    }

    #[test]
    fn test_swapped_detection_prefers_swapped_order() {
        let rig = test_rig();
        let triangulator = Triangulator::new(&rig, TriangulationSettings::default());
        let rod = [Vector3d::new(0., 0., 450.), Vector3d::new(30., -5., 430.)];
        let first = detection(&rig, rod, CameraIndex::First);
        let second = detection(&rig, rod, CameraIndex::Second).ordered(EndpointOrder::Swapped);

        let result = triangulator
            .triangulate(&first, &second, EndpointOrder::Swapped)
            .unwrap();
        assert!(result.cost < 1e-6);
        assert!((result.endpoints[0] - rod[0]).norm() < 1e-6);
        assert!(cost(&triangulator, &first, &second, EndpointOrder::Forward) > result.cost);
    }

    #[test]
    fn test_linear_solution_without_refinement() {
        let rig = test_rig();
        let settings = TriangulationSettings {
            refine_iterations: 0,
            ..Default::default()
        };
        let triangulator = Triangulator::new(&rig, settings);
        let point = Vector3d::new(40., -12., 610.);
        let p0 = rig.project(&point, CameraIndex::First).unwrap();
        let p1 = rig.project(&point, CameraIndex::Second).unwrap();
        let estimate = triangulator.triangulate_point(p0, p1).unwrap();
        assert!((estimate - point).norm() < 1e-6);
    }

    #[test]
    fn test_far_point_is_degenerate() {
        let rig = test_rig();
        let settings = TriangulationSettings {
            min_parallax: 1e-4,
            ..Default::default()
        };
        let triangulator = Triangulator::new(&rig, settings);
        let point = Vector3d::new(0., 0., 1e7);
        let p0 = rig.project(&point, CameraIndex::First).unwrap();
        let p1 = rig.project(&point, CameraIndex::Second).unwrap();
        assert!(matches!(
            triangulator.triangulate_point(p0, p1),
            Err(GeometryError::DegenerateGeometry(_))
        ));
    }

    #[test]
    fn test_inconsistent_pixels_are_rejected() {
        let rig = test_rig();
        let triangulator = Triangulator::new(&rig, TriangulationSettings::default());
        // The second view observes a different point.
        let point = Vector3d::new(0., 0., 400.);
        let p0 = rig.project(&point, CameraIndex::First).unwrap();
        let p1 = rig.project(&point, CameraIndex::Second).unwrap() + Vector2d::new(900., 0.);
        let first = Detection::new([p0, p0], ColorClass::new("red"), 0, CameraIndex::First);
        let second = Detection::new([p1, p1], ColorClass::new("red"), 0, CameraIndex::Second);
        let cost = cost(&triangulator, &first, &second, EndpointOrder::Forward);
        assert!(cost.is_infinite() || cost > 100.);
    }
}
