// src/frame_source.rs
//
// Frame acquisition. The perception loop only sees the `FrameSource`
// trait; the shipped implementation replays still images from a
// directory (the flight camera driver is an external collaborator that
// feeds the same directory contract). Replay yields the next image
// immediately; frame cadence is enforced by the session loop, which
// keeps acquisition non-blocking on the async runtime.

use crate::types::{Frame, SessionClock};
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use walkdir::WalkDir;

/// Time-bounded frame acquisition. `Ok(None)` means no frame arrived
/// within the timeout; the caller treats that cycle as "no detection".
pub trait FrameSource: Send {
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<Frame>>;

    /// True once the source can never yield another frame. Live camera
    /// sources stay `false` forever; replay sources flip after the last
    /// image.
    fn is_exhausted(&self) -> bool {
        false
    }
}

pub struct ImageDirSource {
    files: Vec<PathBuf>,
    next_idx: usize,
    clock: SessionClock,
    seq: u64,
}

impl ImageDirSource {
    pub fn open(input_dir: &str, clock: SessionClock) -> Result<Self> {
        let files = find_image_files(Path::new(input_dir))?;
        if files.is_empty() {
            anyhow::bail!("no image files found in {}", input_dir);
        }
        info!("Frame source: {} image(s) in {}", files.len(), input_dir);

        Ok(Self {
            files,
            next_idx: 0,
            clock,
            seq: 0,
        })
    }
}

impl FrameSource for ImageDirSource {
    fn next_frame(&mut self, _timeout: Duration) -> Result<Option<Frame>> {
        if self.next_idx >= self.files.len() {
            return Ok(None);
        }

        let path = &self.files[self.next_idx];
        self.next_idx += 1;

        let img = image::open(path)?.to_rgb8();
        self.seq += 1;
        Ok(Some(Frame {
            seq: self.seq,
            timestamp_ms: self.clock.now_ms(),
            width: img.width() as usize,
            height: img.height() as usize,
            data: img.into_raw(),
        }))
    }

    fn is_exhausted(&self) -> bool {
        self.next_idx >= self.files.len()
    }
}

fn find_image_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let extensions = ["png", "jpg", "jpeg", "bmp", "PNG", "JPG", "JPEG", "BMP"];
    let mut files = Vec::new();

    for entry in WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if let Some(ext) = path.extension() {
            if extensions.contains(&ext.to_str().unwrap_or("")) {
                files.push(path.to_path_buf());
            }
        }
    }

    files.sort();
    Ok(files)
}
