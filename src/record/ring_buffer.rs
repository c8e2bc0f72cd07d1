//! Time-bounded, memory-aware circular frame store.
//!
//! Every ingested frame is copied in; eviction is purely by capacity
//! (oldest first) and knows nothing about incidents. Readers get `Arc`
//! handles to the stored copies, so an extracted window stays stable while
//! ingestion keeps evicting.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::RgbImage;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::record::encode;

/// One stored frame.
#[derive(Debug, Clone)]
pub struct BufferedFrame {
    pub frame: Arc<RgbImage>,
    pub timestamp: f64,
    pub frame_id: u64,
}

/// Point-in-time buffer statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferInfo {
    pub frames: usize,
    pub capacity: usize,
    pub fps: f64,
    pub duration_seconds: f64,
    pub memory_bytes: usize,
    pub first_timestamp: Option<f64>,
    pub last_timestamp: Option<f64>,
}

#[derive(Debug)]
pub struct RingBuffer {
    frames: VecDeque<BufferedFrame>,
    capacity: usize,
    fps: f64,
    max_memory_bytes: usize,
    frame_bytes: Option<usize>,
}

impl RingBuffer {
    /// Capacity is `max_seconds * fps` frames, possibly shrunk on the first
    /// insert to fit `max_memory_bytes`. Storage grows with use; nothing is
    /// reserved up front.
    pub fn new(max_seconds: f64, fps: f64, max_memory_bytes: usize) -> Self {
        let capacity = ((max_seconds * fps).round() as usize).max(1);
        debug!(capacity, fps, max_seconds, "Ring buffer created");
        Self {
            frames: VecDeque::new(),
            capacity,
            fps,
            max_memory_bytes,
            frame_bytes: None,
        }
    }

    /// Copy a frame in, evicting the oldest entry when full.
    pub fn push(&mut self, frame: &RgbImage, timestamp: f64, frame_id: u64) {
        if self.frame_bytes.is_none() {
            self.fit_memory_budget(frame.as_raw().len());
        }

        while self.frames.len() >= self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(BufferedFrame {
            frame: Arc::new(frame.clone()),
            timestamp,
            frame_id,
        });
    }

    fn fit_memory_budget(&mut self, frame_bytes: usize) {
        self.frame_bytes = Some(frame_bytes);
        if frame_bytes == 0 {
            return;
        }
        let projected = frame_bytes.saturating_mul(self.capacity);
        if projected > self.max_memory_bytes {
            let shrunk = (self.max_memory_bytes / frame_bytes).max(1);
            warn!(
                requested = self.capacity,
                capacity = shrunk,
                frame_bytes,
                max_memory_mb = self.max_memory_bytes / (1024 * 1024),
                "Ring buffer capacity reduced to fit memory cap"
            );
            self.capacity = shrunk;
        }
    }

    /// Entries with `start <= timestamp <= end`, in arrival order.
    pub fn window(&self, start: f64, end: f64) -> Vec<BufferedFrame> {
        self.frames
            .iter()
            .filter(|f| f.timestamp >= start && f.timestamp <= end)
            .cloned()
            .collect()
    }

    /// The entry whose timestamp is closest to `timestamp`.
    pub fn closest(&self, timestamp: f64) -> Option<BufferedFrame> {
        self.frames
            .iter()
            .min_by(|a, b| {
                (a.timestamp - timestamp)
                    .abs()
                    .total_cmp(&(b.timestamp - timestamp).abs())
            })
            .cloned()
    }

    /// Write `[trigger - pre, trigger + post]` as a clip at the buffer's
    /// frame rate, or `fps` when given.
    pub fn extract_clip(
        &self,
        trigger_time: f64,
        pre_seconds: f64,
        post_seconds: f64,
        destination: &Path,
        fps: Option<f64>,
    ) -> Result<PathBuf> {
        if self.frames.is_empty() {
            return Err(Error::EmptyBuffer);
        }
        let (start, end) = (trigger_time - pre_seconds, trigger_time + post_seconds);
        let frames = self.window(start, end);
        if frames.is_empty() {
            return Err(Error::NoFramesInRange { start, end });
        }

        encode::write_clip(&frames, fps.unwrap_or(self.fps), destination)?;
        debug!(frames = frames.len(), path = %destination.display(), "Clip written");
        Ok(destination.to_path_buf())
    }

    /// Write the frame closest to `timestamp` as a still image.
    pub fn save_snapshot(&self, timestamp: f64, destination: &Path) -> Result<PathBuf> {
        let entry = self.closest(timestamp).ok_or(Error::EmptyBuffer)?;
        encode::write_snapshot(&entry.frame, destination)?;
        Ok(destination.to_path_buf())
    }

    pub fn info(&self) -> BufferInfo {
        let first_timestamp = self.frames.front().map(|f| f.timestamp);
        let last_timestamp = self.frames.back().map(|f| f.timestamp);
        BufferInfo {
            frames: self.frames.len(),
            capacity: self.capacity,
            fps: self.fps,
            duration_seconds: match (first_timestamp, last_timestamp) {
                (Some(first), Some(last)) => last - first,
                _ => 0.0,
            },
            memory_bytes: self.frame_bytes.unwrap_or(0) * self.frames.len(),
            first_timestamp,
            last_timestamp,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MB: usize = 1024 * 1024;

    fn tiny() -> RgbImage {
        RgbImage::new(4, 4)
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut buffer = RingBuffer::new(10.0, 30.0, 500 * MB);
        assert_eq!(buffer.capacity(), 300);

        for id in 1..=301u64 {
            buffer.push(&tiny(), id as f64 / 30.0, id);
        }

        assert_eq!(buffer.len(), 300);
        let ids: Vec<_> = buffer.window(f64::MIN, f64::MAX).iter().map(|f| f.frame_id).collect();
        assert_eq!(ids.first(), Some(&2));
        assert_eq!(ids.last(), Some(&301));
    }

    #[test]
    fn test_memory_cap_shrinks_capacity() {
        // 4x4 RGB = 48 bytes, cap fits 10 frames
        let mut buffer = RingBuffer::new(10.0, 30.0, 480);
        buffer.push(&tiny(), 0.0, 0);
        assert_eq!(buffer.capacity(), 10);

        for id in 1..20u64 {
            buffer.push(&tiny(), id as f64, id);
        }
        assert_eq!(buffer.len(), 10);
        assert_eq!(buffer.info().memory_bytes, 480);
    }

    #[test]
    fn test_huge_window_is_capped_not_allocated() {
        let mut buffer = RingBuffer::new(1e9 + 10.0, 30.0, 480);
        assert!(buffer.capacity() > 1_000_000_000);

        buffer.push(&tiny(), 0.0, 0);
        assert_eq!(buffer.capacity(), 10);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_window_is_inclusive_and_ordered() {
        let mut buffer = RingBuffer::new(60.0, 1.0, 500 * MB);
        for t in 5..=20u64 {
            buffer.push(&tiny(), t as f64, t);
        }

        let stamps: Vec<_> = buffer.window(10.0 - 2.0, 10.0 + 3.0).iter().map(|f| f.timestamp).collect();
        assert_eq!(stamps, vec![8.0, 9.0, 10.0, 11.0, 12.0, 13.0]);
    }

    #[test]
    fn test_push_copies_frame() {
        let mut buffer = RingBuffer::new(1.0, 10.0, 500 * MB);
        let mut frame = tiny();
        buffer.push(&frame, 0.0, 0);
        frame.put_pixel(0, 0, image::Rgb([255, 255, 255]));

        let stored = buffer.closest(0.0).unwrap();
        assert_eq!(stored.frame.get_pixel(0, 0), &image::Rgb([0, 0, 0]));
    }

    #[test]
    fn test_closest_frame() {
        let mut buffer = RingBuffer::new(60.0, 1.0, 500 * MB);
        for t in [1.0, 2.0, 4.0] {
            buffer.push(&tiny(), t, t as u64);
        }
        assert_eq!(buffer.closest(3.4).unwrap().frame_id, 4);
        assert_eq!(buffer.closest(-10.0).unwrap().frame_id, 1);
    }

    #[test]
    fn test_extract_clip_failures() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clip.gif");
        let mut buffer = RingBuffer::new(60.0, 1.0, 500 * MB);

        assert!(matches!(
            buffer.extract_clip(10.0, 2.0, 3.0, &path, None),
            Err(Error::EmptyBuffer)
        ));
        assert!(matches!(
            buffer.save_snapshot(10.0, &path),
            Err(Error::EmptyBuffer)
        ));

        buffer.push(&tiny(), 100.0, 1);
        assert!(matches!(
            buffer.extract_clip(10.0, 2.0, 3.0, &path, None),
            Err(Error::NoFramesInRange { .. })
        ));
        assert!(!path.exists());
    }

    #[test]
    fn test_extract_clip_and_snapshot_written() {
        let dir = TempDir::new().unwrap();
        let mut buffer = RingBuffer::new(60.0, 1.0, 500 * MB);
        for t in 5..=20u64 {
            buffer.push(&tiny(), t as f64, t);
        }

        let clip = buffer
            .extract_clip(10.0, 2.0, 3.0, &dir.path().join("clip.gif"), Some(5.0))
            .unwrap();
        assert!(clip.exists());

        let snapshot = buffer.save_snapshot(10.2, &dir.path().join("snap.jpg")).unwrap();
        assert!(snapshot.exists());
    }

    #[test]
    fn test_info() {
        let mut buffer = RingBuffer::new(60.0, 1.0, 500 * MB);
        assert_eq!(buffer.info().first_timestamp, None);

        for t in 5..=20u64 {
            buffer.push(&tiny(), t as f64, t);
        }
        let info = buffer.info();
        assert_eq!(info.frames, 16);
        assert_eq!(info.capacity, 60);
        assert_eq!(info.duration_seconds, 15.0);
        assert_eq!(info.memory_bytes, 16 * 48);
        assert_eq!(info.last_timestamp, Some(20.0));
    }
}
