use std::fmt;

use serde::{Deserialize, Serialize};

use crate::feature::{CameraIndex, ColorClass};
use crate::matcher::Correspondence;
use crate::my_types::*;

/// Particle identity, stable across frames once assigned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RodId(pub u32);

impl fmt::Display for RodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One particle in one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Rod {
    pub id: RodId,
    pub color: ColorClass,
    pub frame: FrameIndex,
    /// In the first camera's frame. `None` when the rod was not reconstructed.
    pub endpoints: Option<[Vector3d; 2]>,
    pub world_endpoints: Option<[Vector3d; 2]>,
    /// Observed endpoints per camera, `None` for a view without detection.
    pub views: [Option<[Vector2d; 2]>; 2],
    /// Summed reprojection error of the stereo correspondence.
    pub cost: Option<f64>,
}

impl Rod {
    pub fn dummy(id: RodId, color: ColorClass, frame: FrameIndex) -> Self {
        Rod {
            id,
            color,
            frame,
            endpoints: None,
            world_endpoints: None,
            views: [None, None],
            cost: None,
        }
    }

    pub fn from_correspondence(
        id: RodId,
        color: ColorClass,
        frame: FrameIndex,
        correspondence: &Correspondence,
    ) -> Self {
        Rod {
            id,
            color,
            frame,
            endpoints: Some(correspondence.triangulation.endpoints),
            world_endpoints: None,
            views: [
                Some(correspondence.views[0]),
                Some(correspondence.views[1]),
            ],
            cost: Some(correspondence.triangulation.cost),
        }
    }

    pub fn is_dummy(&self) -> bool {
        self.views.iter().all(|v| v.is_none())
    }

    pub fn seen(&self, camera: CameraIndex) -> bool {
        self.views[camera.index()].is_some()
    }

    /// Observed endpoints, or the sentinel for an unobserved view.
    pub fn view_endpoints(&self, camera: CameraIndex) -> [Vector2d; 2] {
        self.views[camera.index()].unwrap_or([dummy_point(), dummy_point()])
    }

    pub fn center(&self) -> Option<Vector3d> {
        self.endpoints.map(|[a, b]| (a + b) / 2.)
    }

    pub fn length(&self) -> Option<f64> {
        self.endpoints.map(|[a, b]| (a - b).norm())
    }

    /// Exchange the endpoint labels in 3D and in both views.
    pub fn swap_endpoints(&mut self) {
        fn swap<T: Copy>(pair: &mut Option<[T; 2]>) {
            if let Some(p) = pair {
                p.swap(0, 1);
            }
        }
        swap(&mut self.endpoints);
        swap(&mut self.world_endpoints);
        for view in self.views.iter_mut() {
            swap(view);
        }
    }
}

/// Summed endpoint distance under the pairing that minimizes it, together with
/// whether that pairing swaps the endpoints of `b`.
pub fn endpoint_distance(a: &[Vector3d; 2], b: &[Vector3d; 2]) -> (f64, bool) {
    let straight = (a[0] - b[0]).norm() + (a[1] - b[1]).norm();
    let crossed = (a[0] - b[1]).norm() + (a[1] - b[0]).norm();
    if crossed < straight {
        (crossed, true)
    } else {
        (straight, false)
    }
}
