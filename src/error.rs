use thiserror::Error;

use crate::feature::CameraIndex;
use crate::my_types::FrameIndex;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("invalid calibration: {0}")]
    InvalidCalibration(String),
}

/// Raised by the triangulator for correspondences that cannot be reconstructed.
#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum GeometryError {
    #[error("degenerate stereo geometry: {0}")]
    DegenerateGeometry(&'static str),
    #[error("point lies behind camera {0:?}")]
    BehindCamera(CameraIndex),
}

#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum AssignmentError {
    #[error("no finite assignment exists for a {rows}x{cols} cost matrix")]
    Infeasible { rows: usize, cols: usize },
}

/// Frame-scoped failures. The sequence controller recovers from all of them by
/// skipping the frame.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    #[error("frame {frame}: detection {index} of camera {camera:?} has non-finite coordinates")]
    InvalidDetection {
        frame: FrameIndex,
        camera: CameraIndex,
        index: usize,
    },
    #[error("frame {frame}: detection belongs to frame {found}")]
    FrameMismatch { frame: FrameIndex, found: FrameIndex },
    #[error("frame {frame}: assignment solver failed: {source}")]
    SolverInfeasible {
        frame: FrameIndex,
        #[source]
        source: AssignmentError,
    },
}
