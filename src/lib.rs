//! Prepares YOLO ONNX models for TensorRT on Jetson GPUs and DLAs.
//!
//! The [`surgeon`] rewrites the ONNX graph: it folds padding chains the
//! exporter could not express directly and swaps the raw detection outputs
//! for the `BatchedNMSDynamic_TRT` plugin, driven by JSON edit
//! [`request`]s. [`engine`] names and describes the engine build, and
//! [`calibration`] feeds INT8 calibration from a directory of images.

pub mod calibration;
pub mod editor;
pub mod engine;
mod error;
pub mod graph;
pub mod onnx;
pub mod request;
pub mod surgeon;

pub use error::{Error, Result};
