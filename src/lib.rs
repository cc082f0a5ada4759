pub mod assignment;
pub mod calibration;
pub mod camera;
pub mod config;
pub mod dataset;
pub mod error;
pub mod feature;
pub mod matcher;
pub mod math;
pub mod my_types;
pub mod pinhole;
pub mod registry;
pub mod rod;
pub mod sequence;
pub mod stats;
pub mod synthetic;
pub mod tracker;
pub mod triangulation;
