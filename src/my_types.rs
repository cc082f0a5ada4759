use nalgebra as na;

pub type Vector2d = na::Vector2<f64>;
pub type Vector3d = na::Vector3<f64>;

pub type Matrix3d = na::Matrix3<f64>;
pub type Matrix4d = na::Matrix4<f64>;
pub type Matrix23d = na::Matrix2x3<f64>;
pub type Matrix34d = na::Matrix3x4<f64>;
pub type Matrixd = na::DMatrix<f64>;

/// Index of a frame in the recorded sequence.
pub type FrameIndex = usize;

/// Sentinel coordinate of an endpoint that was not observed in a view.
pub const DUMMY_COORDINATE: f64 = -1.;

pub fn dummy_point() -> Vector2d {
    Vector2d::new(DUMMY_COORDINATE, DUMMY_COORDINATE)
}
