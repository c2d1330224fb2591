//! INT8 calibration input: image batches for the engine builder's entropy
//! calibrator and the calibration cache it leaves behind.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use image::{imageops::FilterType, DynamicImage};

use crate::error::{Error, Result};

/// Below this many samples calibration quality drops noticeably.
pub const MIN_RECOMMENDED_SAMPLES: usize = 500;

const EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// The calibrator callback surface the engine builder drives.
pub trait Calibrator {
    fn batch_size(&self) -> usize;

    /// Next batch laid out as `(batch, 3, h, w)`, or `None` once exhausted.
    fn next_batch(&mut self) -> Result<Option<&[f32]>>;

    fn read_cache(&self) -> Result<Option<Bytes>>;

    fn write_cache(&self, cache: &[u8]) -> Result<()>;
}

/// Whatever turns observed batches into a calibration table.
pub trait CalibrationAlgorithm {
    fn observe(&mut self, batch: &[f32]);

    fn finish(self) -> Bytes;
}

/// Produces a calibration table, reusing the cached one when present.
pub fn calibrate<C, A>(calibrator: &mut C, mut algorithm: A) -> Result<Bytes>
where
    C: Calibrator,
    A: CalibrationAlgorithm,
{
    if let Some(cached) = calibrator.read_cache()? {
        log::info!("using cached calibration table ({} bytes)", cached.len());
        return Ok(cached);
    }

    let mut batches = 0;
    while let Some(batch) = calibrator.next_batch()? {
        algorithm.observe(batch);
        batches += 1;
    }
    log::info!("calibrated on {batches} batches");

    let table = algorithm.finish();
    calibrator.write_cache(&table)?;
    Ok(table)
}

pub struct CalibrationReader {
    images: Vec<PathBuf>,
    net_hw: (u32, u32),
    batch_size: usize,
    cursor: usize,
    buffer: Vec<f32>,
    cache_path: PathBuf,
}

impl CalibrationReader {
    pub fn new(
        image_dir: &Path,
        net_hw: (u32, u32),
        batch_size: usize,
        cache_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        if !image_dir.is_dir() {
            return Err(Error::FileNotFound(image_dir.to_path_buf()));
        }
        let (h, w) = net_hw;
        if h == 0 || w == 0 || h % 32 != 0 || w % 32 != 0 {
            return Err(Error::ConfigError(format!(
                "bad net shape {h}x{w}, both sides must be multiples of 32"
            )));
        }
        if batch_size == 0 {
            return Err(Error::ConfigError("batch size must be at least 1".to_string()));
        }

        let mut images: Vec<PathBuf> = std::fs::read_dir(image_dir)
            .map_err(Error::io_ctx(format!("listing {image_dir:?}")))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| EXTENSIONS.iter().any(|x| x.eq_ignore_ascii_case(e)))
            })
            .collect();
        images.sort();

        if images.len() < MIN_RECOMMENDED_SAMPLES {
            log::warn!(
                "found only {} images in {image_dir:?}, {MIN_RECOMMENDED_SAMPLES} or more are recommended",
                images.len()
            );
        }

        let blob = batch_size * 3 * h as usize * w as usize;
        Ok(Self {
            images,
            net_hw,
            batch_size,
            cursor: 0,
            buffer: vec![0.0; blob],
            cache_path: cache_path.into(),
        })
    }

    pub fn num_samples(&self) -> usize {
        self.images.len()
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }
}

impl Calibrator for CalibrationReader {
    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn next_batch(&mut self) -> Result<Option<&[f32]>> {
        if self.cursor + self.batch_size > self.images.len() {
            return Ok(None);
        }
        let (h, w) = self.net_hw;
        let per_image = 3 * h as usize * w as usize;
        for (i, slot) in self.buffer.chunks_exact_mut(per_image).enumerate() {
            let path = &self.images[self.cursor + i];
            let img = image::open(path)?;
            preprocess(img, self.net_hw, slot);
        }
        log::debug!(
            "calibration batch {} ({} images)",
            self.cursor / self.batch_size,
            self.batch_size
        );
        self.cursor += self.batch_size;
        Ok(Some(&self.buffer))
    }

    fn read_cache(&self) -> Result<Option<Bytes>> {
        if !self.cache_path.is_file() {
            return Ok(None);
        }
        std::fs::read(&self.cache_path)
            .map(|b| Some(Bytes::from(b)))
            .map_err(Error::io_ctx(format!("reading {:?}", self.cache_path)))
    }

    fn write_cache(&self, cache: &[u8]) -> Result<()> {
        if let Some(dir) = self.cache_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(Error::io_ctx(format!("creating {dir:?}")))?;
        }
        std::fs::write(&self.cache_path, cache)
            .map_err(Error::io_ctx(format!("writing {:?}", self.cache_path)))
    }
}

/// Resizes to the network input, converts to RGB and writes `out` in CHW
/// order scaled to `[0, 1]`.
pub fn preprocess(img: DynamicImage, (h, w): (u32, u32), out: &mut [f32]) {
    let img = image::imageops::resize(&img.into_rgb8(), w, h, FilterType::Triangle);
    let plane = (h * w) as usize;
    for (x, y, px) in img.enumerate_pixels() {
        let at = (y * w + x) as usize;
        for c in 0..3 {
            out[c * plane + at] = px[c] as f32 / 255.0;
        }
    }
}
