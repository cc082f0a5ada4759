use std::fmt;

use serde::{Deserialize, Serialize};

use crate::my_types::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CameraIndex {
    First,
    Second,
}

impl CameraIndex {
    pub const BOTH: [CameraIndex; 2] = [CameraIndex::First, CameraIndex::Second];

    pub fn index(self) -> usize {
        match self {
            CameraIndex::First => 0,
            CameraIndex::Second => 1,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(CameraIndex::First),
            1 => Some(CameraIndex::Second),
            _ => None,
        }
    }
}

/// Particle color class. Color classes are matched and tracked independently.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColorClass(pub String);

impl ColorClass {
    pub fn new(name: impl Into<String>) -> Self {
        ColorClass(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ColorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The two endpoints of a detected rod carry no label, so a correspondence
/// between views has to state which endpoint of the second view pairs with the
/// first endpoint of the first view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointOrder {
    Forward,
    Swapped,
}

impl EndpointOrder {
    pub const BOTH: [EndpointOrder; 2] = [EndpointOrder::Forward, EndpointOrder::Swapped];

    pub fn apply<T: Copy>(self, endpoints: [T; 2]) -> [T; 2] {
        match self {
            EndpointOrder::Forward => endpoints,
            EndpointOrder::Swapped => [endpoints[1], endpoints[0]],
        }
    }

    pub fn flipped(self) -> Self {
        match self {
            EndpointOrder::Forward => EndpointOrder::Swapped,
            EndpointOrder::Swapped => EndpointOrder::Forward,
        }
    }

    pub fn index(self) -> usize {
        match self {
            EndpointOrder::Forward => 0,
            EndpointOrder::Swapped => 1,
        }
    }
}

/// One rod segment seen by one camera in one frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub endpoints: [Vector2d; 2],
    pub color: ColorClass,
    pub frame: FrameIndex,
    pub camera: CameraIndex,
}

impl Detection {
    pub fn new(
        endpoints: [Vector2d; 2],
        color: ColorClass,
        frame: FrameIndex,
        camera: CameraIndex,
    ) -> Self {
        Detection {
            endpoints,
            color,
            frame,
            camera,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.endpoints.iter().all(|p| p.iter().all(|x| x.is_finite()))
    }

    pub fn center(&self) -> Vector2d {
        (self.endpoints[0] + self.endpoints[1]) / 2.
    }

    /// Same detection with the endpoints taken in the given order.
    pub fn ordered(&self, order: EndpointOrder) -> Detection {
        Detection {
            endpoints: order.apply(self.endpoints),
            ..self.clone()
        }
    }
}
