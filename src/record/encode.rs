//! Still and animated evidence encoding with the `image` crate.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;
use std::time::Duration;

use image::codecs::gif::{GifEncoder, Repeat};
use image::codecs::jpeg::JpegEncoder;
use image::{Delay, DynamicImage, Frame, RgbImage};

use crate::error::Result;
use crate::record::ring_buffer::BufferedFrame;

/// JPEG quality for snapshots.
pub const JPEG_QUALITY: u8 = 90;

/// GIF quantizer speed (1 = best quality, 30 = fastest).
const GIF_SPEED: i32 = 10;

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Write one frame as a JPEG still.
pub fn write_snapshot(frame: &RgbImage, path: &Path) -> Result<()> {
    create_parent(path)?;
    let mut writer = BufWriter::new(File::create(path)?);
    let encoder = JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY);
    frame.write_with_encoder(encoder)?;
    Ok(())
}

/// Write frames, in order, as a looping animated GIF at `fps`.
pub fn write_clip(frames: &[BufferedFrame], fps: f64, path: &Path) -> Result<()> {
    create_parent(path)?;
    let delay = Delay::from_saturating_duration(Duration::from_secs_f64(1.0 / fps.max(1.0)));

    let writer = BufWriter::new(File::create(path)?);
    let mut encoder = GifEncoder::new_with_speed(writer, GIF_SPEED);
    encoder.set_repeat(Repeat::Infinite)?;

    for entry in frames {
        let rgba = DynamicImage::ImageRgb8(entry.frame.as_ref().clone()).into_rgba8();
        encoder.encode_frame(Frame::from_parts(rgba, 0, 0, delay))?;
    }

    Ok(())
}
