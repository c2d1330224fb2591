//! Engine build plan: naming conventions for engines and calibration
//! caches, and the builder settings rendered as `trtexec` arguments.

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use crate::{
    error::{Error, Result},
    graph::Dim,
};

/// Default builder workspace, 1 << 31 bytes.
pub const DEFAULT_WORKSPACE_MIB: u64 = 2048;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Precision {
    Fp32,
    Fp16,
    Int8,
}

impl Precision {
    /// INT8 engines keep FP16 enabled for layers without INT8 kernels.
    pub fn fp16(self) -> bool {
        matches!(self, Precision::Fp16 | Precision::Int8)
    }

    pub fn int8(self) -> bool {
        self == Precision::Int8
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Precision::Fp32 => "FP32",
            Precision::Fp16 => "FP16",
            Precision::Int8 => "INT8",
        })
    }
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FP32" => Ok(Precision::Fp32),
            "FP16" => Ok(Precision::Fp16),
            "INT8" => Ok(Precision::Int8),
            _ => Err(format!("unknown precision {s:?}, expected FP32 | FP16 | INT8")),
        }
    }
}

/// Compute core the engine targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Device {
    Gpu,
    Dla0,
    Dla1,
}

impl Device {
    pub fn dla_core(self) -> Option<u32> {
        match self {
            Device::Gpu => None,
            Device::Dla0 => Some(0),
            Device::Dla1 => Some(1),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Device::Gpu => "CUDA",
            Device::Dla0 => "DLA0",
            Device::Dla1 => "DLA1",
        })
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CUDA" | "GPU" => Ok(Device::Gpu),
            "DLA0" => Ok(Device::Dla0),
            "DLA1" => Ok(Device::Dla1),
            _ => Err(format!("unknown core {s:?}, expected CUDA | DLA0 | DLA1")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchProfile {
    pub min: usize,
    pub opt: usize,
    pub max: usize,
}

impl BatchProfile {
    /// `[min, opt, max]`; a static batch repeats one value three times.
    pub fn from_slice(batch: &[usize]) -> Result<Self> {
        let &[min, opt, max] = batch else {
            return Err(Error::ConfigError(format!(
                "batch needs 3 values [MIN OPT MAX], got {}",
                batch.len()
            )));
        };
        if min == 0 || min > opt || opt > max {
            return Err(Error::ConfigError(format!(
                "batch sizes must satisfy 1 <= min <= opt <= max, got {min} {opt} {max}"
            )));
        }
        Ok(Self { min, opt, max })
    }

    pub fn is_static(&self) -> bool {
        self.min == self.max
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EngineSpec {
    pub model: String,
    pub device: Device,
    pub precision: Precision,
    pub batch: BatchProfile,
    /// Whether the ONNX file went through graph surgery first.
    pub surgery: bool,
    pub input_name: String,
    pub input_hw: (u32, u32),
    pub workspace_mib: u64,
}

impl EngineSpec {
    pub fn validate(&self) -> Result<()> {
        if self.device.dla_core().is_some() && !self.batch.is_static() {
            return Err(Error::ConfigError(format!(
                "{} needs a static batch (min == opt == max)",
                self.device
            )));
        }
        let (h, w) = self.input_hw;
        if h == 0 || w == 0 {
            return Err(Error::ConfigError(format!("bad input size {h}x{w}")));
        }
        Ok(())
    }

    /// `{model}_{device}_{precision}[.gs]`
    pub fn name(&self) -> String {
        let gs = if self.surgery { ".gs" } else { "" };
        format!("{}_{}_{}{gs}", self.model, self.device, self.precision)
    }

    pub fn engine_path(&self, engine_dir: &Path) -> PathBuf {
        engine_dir.join(format!("{}.trt", self.name()))
    }

    pub fn cache_path(&self, calib_dir: &Path) -> PathBuf {
        calib_dir.join(format!("{}.cache", self.name()))
    }

    /// The calibration cache an INT8 build reads, if it does not exist yet.
    /// Without it the builder falls back to placeholder scales.
    pub fn missing_calibration(&self, calib_dir: &Path) -> Option<PathBuf> {
        let cache = self.cache_path(calib_dir);
        (self.precision.int8() && !cache.is_file()).then_some(cache)
    }

    fn shape(&self, batch: usize) -> String {
        let (h, w) = self.input_hw;
        format!("{}:{batch}x3x{h}x{w}", self.input_name)
    }

    pub fn trtexec_args(&self, onnx: &Path, engine_dir: &Path, calib_dir: &Path) -> Vec<String> {
        let mut args = vec![
            format!("--onnx={}", onnx.display()),
            format!("--saveEngine={}", self.engine_path(engine_dir).display()),
            "--explicitBatch".to_string(),
            format!("--minShapes={}", self.shape(self.batch.min)),
            format!("--optShapes={}", self.shape(self.batch.opt)),
            format!("--maxShapes={}", self.shape(self.batch.max)),
            format!("--workspace={}", self.workspace_mib),
        ];
        if self.precision.fp16() {
            args.push("--fp16".to_string());
        }
        if self.precision.int8() {
            args.push("--int8".to_string());
            args.push(format!("--calib={}", self.cache_path(calib_dir).display()));
        }
        if let Some(core) = self.device.dla_core() {
            args.push(format!("--useDLACore={core}"));
            args.push("--allowGPUFallback".to_string());
        }
        args
    }
}

/// Network input `(h, w)` from an `N x 3 x H x W` shape.
pub fn input_hw_from_shape(shape: &[Dim]) -> Option<(u32, u32)> {
    match shape {
        [_, _, Dim::Static(h), Dim::Static(w)] if *h > 0 && *w > 0 => Some((*h as u32, *w as u32)),
        _ => None,
    }
}

/// Network input `(h, w)` from a model name ending in `-{size}` or
/// `-{w}x{h}`, e.g. `yolov4-416` or `yolov4-tiny-416x256`.
pub fn input_hw_from_name(model: &str) -> Option<(u32, u32)> {
    let suffix = model.rsplit('-').next()?;
    match suffix.split_once('x') {
        Some((w, h)) => Some((h.parse().ok()?, w.parse().ok()?)),
        None => {
            let side = suffix.parse().ok()?;
            Some((side, side))
        }
    }
}
