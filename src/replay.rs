//! Offline session replay: frames from an image directory, tracks from a
//! JSON-lines log written by an upstream tracker.

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use image::RgbImage;
use serde::Deserialize;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::model::{Detection, Track};
use crate::pipeline::{Detector, FrameSource, Tracker};

const FRAME_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// Frames read in file-name order from a directory.
pub struct ImageSequenceSource {
    files: Vec<PathBuf>,
    next: usize,
    fps: f64,
}

impl ImageSequenceSource {
    pub fn open(dir: &Path, fps: f64) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::NotFound(format!("frame directory {}", dir.display())));
        }
        let mut files: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| FRAME_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            })
            .collect();
        files.sort();

        info!(dir = %dir.display(), frames = files.len(), fps, "Image sequence opened");
        Ok(Self {
            files,
            next: 0,
            fps,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FrameSource for ImageSequenceSource {
    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        let Some(path) = self.files.get(self.next) else {
            return Ok(None);
        };
        self.next += 1;
        Ok(Some(image::open(path)?.to_rgb8()))
    }

    fn fps(&self) -> f64 {
        self.fps
    }

    fn release(&mut self) {
        debug!(read = self.next, total = self.files.len(), "Image sequence released");
        self.next = self.files.len();
    }
}

#[derive(Debug, Deserialize)]
struct TrackLogLine {
    frame_id: u64,
    #[serde(default)]
    tracks: Vec<Track>,
}

/// Tracker stand-in that replays recorded per-frame tracks.
#[derive(Debug, Default)]
pub struct TrackLogReplay {
    frames: HashMap<u64, Vec<Track>>,
}

impl TrackLogReplay {
    pub fn open(path: &Path) -> Result<Self> {
        let file = fs::File::open(path)?;
        let replay = Self::from_reader(BufReader::new(file))?;
        info!(path = %path.display(), frames = replay.frames.len(), "Track log loaded");
        Ok(replay)
    }

    /// Parse a JSON-lines log. Blank lines are ignored; malformed lines are
    /// logged and skipped.
    pub fn from_reader(reader: impl BufRead) -> Result<Self> {
        let mut frames = HashMap::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TrackLogLine>(&line) {
                Ok(entry) => {
                    frames.insert(entry.frame_id, entry.tracks);
                }
                Err(e) => error!(line = index + 1, error = %e, "Malformed track log line skipped"),
            }
        }
        Ok(Self { frames })
    }

    pub fn frames(&self) -> usize {
        self.frames.len()
    }
}

impl Tracker for TrackLogReplay {
    fn update(&mut self, _detections: &[Detection], frame_id: u64, _timestamp: f64) -> Result<Vec<Track>> {
        Ok(self.frames.get(&frame_id).cloned().unwrap_or_default())
    }
}

/// Detector for replays whose track log already embodies the detections.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDetector;

impl Detector for NoopDetector {
    fn detect(&mut self, _frame: &RgbImage, _prompts: &[String], _frame_id: u64) -> Result<Vec<Detection>> {
        Ok(Vec::new())
    }
}
