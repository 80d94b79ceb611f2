// src/evidence.rs
//
// Append-only evidence log for post-flight review. One JSON object per
// line in evidence.jsonl, plus optional JPEG frame snapshots under
// frames/. Decision entries are written and flushed synchronously;
// per-frame entries go through a bounded queue and are the first thing
// dropped under backpressure.

use crate::types::{
    CommandRecord, DetectionResult, EvidenceConfig, Frame, LinkStatus, TriggerDecision,
};
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    /// Per-frame detection record
    Detection,
    /// Trigger decision (confirmation or abort)
    Decision,
    /// Mode-change command outcome
    Command,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvidenceEntry {
    pub timestamp_ms: f64,
    pub kind: EvidenceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detection: Option<DetectionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<LinkStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<TriggerDecision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_path: Option<String>,
}

impl EvidenceEntry {
    pub fn detection(detection: DetectionResult, link: LinkStatus) -> Self {
        Self {
            timestamp_ms: detection.timestamp_ms,
            kind: EvidenceKind::Detection,
            detection: Some(detection),
            link: Some(link),
            decision: None,
            command: None,
            frame_path: None,
        }
    }

    pub fn decision(decision: TriggerDecision, link: LinkStatus, timestamp_ms: f64) -> Self {
        Self {
            timestamp_ms,
            kind: EvidenceKind::Decision,
            detection: None,
            link: Some(link),
            decision: Some(decision),
            command: None,
            frame_path: None,
        }
    }

    pub fn command(record: CommandRecord, timestamp_ms: f64) -> Self {
        Self {
            timestamp_ms,
            kind: EvidenceKind::Command,
            detection: None,
            link: None,
            decision: None,
            command: Some(record),
            frame_path: None,
        }
    }

    pub fn with_frame_path(mut self, path: Option<String>) -> Self {
        self.frame_path = path;
        self
    }
}

pub struct EvidenceLogger {
    writer: BufWriter<File>,
    run_dir: PathBuf,
    frames_dir: PathBuf,
    save_frames: bool,
    queue_capacity: usize,
    pending: VecDeque<EvidenceEntry>,
    dropped: u64,
    written: u64,
}

impl EvidenceLogger {
    pub fn new(config: &EvidenceConfig) -> Result<Self> {
        // Each run gets its own directory under output_dir so the
        // timestamp ordering holds within one log file even when the
        // same evidence root is reused across flights.
        let run_dir = PathBuf::from(&config.output_dir).join(run_dir_name());
        let frames_dir = run_dir.join("frames");
        fs::create_dir_all(&frames_dir)
            .with_context(|| format!("creating evidence directory {}", run_dir.display()))?;

        let log_path = run_dir.join("evidence.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("opening {}", log_path.display()))?;
        info!("Evidence log: {}", log_path.display());

        Ok(Self {
            writer: BufWriter::new(file),
            run_dir,
            frames_dir,
            save_frames: config.save_frames,
            queue_capacity: config.queue_capacity.max(1),
            pending: VecDeque::new(),
            dropped: 0,
            written: 0,
        })
    }

    /// Queue a per-frame entry. When the queue is full the oldest
    /// queued frame entry is dropped; decision and command entries
    /// never sit in this queue, so they are never the victim.
    pub fn record_detection(&mut self, entry: EvidenceEntry) {
        if self.pending.len() >= self.queue_capacity {
            self.pending.pop_front();
            self.dropped += 1;
            if self.dropped % 100 == 1 {
                warn!(
                    "Evidence queue full; {} detection entr(ies) dropped so far",
                    self.dropped
                );
            }
        }
        self.pending.push_back(entry);
    }

    /// Write a decision or command entry durably. Queued frame entries
    /// are drained first so line order matches event order. Persistence
    /// failure is logged but never stops the perception loop.
    pub fn record_decisive(&mut self, entry: EvidenceEntry) {
        if let Err(e) = self.write_all_pending().and_then(|_| self.write_entry(&entry)) {
            warn!("Failed to persist evidence entry: {:#}", e);
            return;
        }
        if let Err(e) = self.writer.flush() {
            warn!("Failed to flush evidence log: {:#}", e);
        }
    }

    /// Opportunistic drain between frames.
    pub fn flush_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        if let Err(e) = self.write_all_pending() {
            warn!("Failed to drain evidence queue: {:#}", e);
        }
    }

    /// Encode a frame snapshot as JPEG under frames/. Returns the saved
    /// path, or `None` when snapshots are disabled or encoding fails.
    pub fn save_frame_snapshot(&mut self, frame: &Frame) -> Option<String> {
        if !self.save_frames {
            return None;
        }
        let path = self.frames_dir.join(format!("frame_{:06}.jpg", frame.seq));
        match encode_jpeg(frame, &path) {
            Ok(()) => {
                debug!("Saved frame snapshot {}", path.display());
                Some(path.to_string_lossy().into_owned())
            }
            Err(e) => {
                warn!("Failed to save frame {}: {:#}", frame.seq, e);
                None
            }
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn entries_written(&self) -> u64 {
        self.written
    }

    pub fn entries_dropped(&self) -> u64 {
        self.dropped
    }

    fn write_all_pending(&mut self) -> Result<()> {
        while let Some(entry) = self.pending.pop_front() {
            self.write_entry(&entry)?;
        }
        Ok(())
    }

    fn write_entry(&mut self, entry: &EvidenceEntry) -> Result<()> {
        let line = serde_json::to_string(entry)?;
        writeln!(self.writer, "{}", line)?;
        self.written += 1;
        Ok(())
    }
}

impl Drop for EvidenceLogger {
    fn drop(&mut self) {
        self.flush_pending();
        let _ = self.writer.flush();
    }
}

fn run_dir_name() -> String {
    // Counter suffix disambiguates runs started within the same second
    static RUN_SEQ: AtomicU32 = AtomicU32::new(0);
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("run_{}_{:03}", secs, RUN_SEQ.fetch_add(1, Ordering::Relaxed))
}

fn encode_jpeg(frame: &Frame, path: &std::path::Path) -> Result<()> {
    let buffer: image::RgbImage =
        image::ImageBuffer::from_raw(frame.width as u32, frame.height as u32, frame.data.clone())
            .context("frame buffer size mismatch")?;
    buffer.save(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TriggerDecision, TriggerState};

    fn test_config(dir: &std::path::Path, capacity: usize, save_frames: bool) -> EvidenceConfig {
        EvidenceConfig {
            output_dir: dir.to_string_lossy().into_owned(),
            queue_capacity: capacity,
            save_frames,
        }
    }

    fn detection_entry(seq: u64) -> EvidenceEntry {
        EvidenceEntry::detection(
            DetectionResult {
                found: true,
                confidence: 0.9,
                offset: None,
                frame_seq: seq,
                timestamp_ms: seq as f64 * 33.3,
            },
            LinkStatus::disconnected(),
        )
    }

    fn decision_entry(timestamp_ms: f64) -> EvidenceEntry {
        EvidenceEntry::decision(
            TriggerDecision {
                state: TriggerState::Confirmed,
                consecutive_hits: 3,
                timestamp_ms,
                command_id: None,
                abort_reason: None,
            },
            LinkStatus::disconnected(),
            timestamp_ms,
        )
    }

    fn read_lines(run_dir: &Path) -> Vec<serde_json::Value> {
        let raw = fs::read_to_string(run_dir.join("evidence.jsonl")).unwrap();
        raw.lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_decision_flushes_queued_detections_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = EvidenceLogger::new(&test_config(dir.path(), 16, false)).unwrap();

        logger.record_detection(detection_entry(1));
        logger.record_detection(detection_entry(2));
        logger.record_decisive(decision_entry(100.0));

        let lines = read_lines(logger.run_dir());
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["kind"], "detection");
        assert_eq!(lines[1]["kind"], "detection");
        assert_eq!(lines[2]["kind"], "decision");

        let timestamps: Vec<f64> = lines
            .iter()
            .map(|l| l["timestamp_ms"].as_f64().unwrap())
            .collect();
        assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_queue_overflow_drops_oldest_detection_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = EvidenceLogger::new(&test_config(dir.path(), 2, false)).unwrap();

        logger.record_detection(detection_entry(1));
        logger.record_detection(detection_entry(2));
        logger.record_detection(detection_entry(3)); // evicts seq 1
        assert_eq!(logger.entries_dropped(), 1);

        logger.record_decisive(decision_entry(200.0));
        let lines = read_lines(logger.run_dir());
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["detection"]["frame_seq"], 2);
        assert_eq!(lines[1]["detection"]["frame_seq"], 3);
        assert_eq!(lines[2]["kind"], "decision");
    }

    #[test]
    fn test_decision_written_with_empty_queue() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = EvidenceLogger::new(&test_config(dir.path(), 4, false)).unwrap();
        logger.record_decisive(decision_entry(10.0));
        assert_eq!(logger.entries_written(), 1);

        let lines = read_lines(logger.run_dir());
        assert_eq!(lines[0]["decision"]["consecutive_hits"], 3);
    }

    #[test]
    fn test_each_run_gets_its_own_directory() {
        // Reusing an evidence root across runs must not append into the
        // previous run's log, or its timestamp ordering would break.
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), 4, false);

        let mut first = EvidenceLogger::new(&config).unwrap();
        first.record_decisive(decision_entry(500.0));
        let mut second = EvidenceLogger::new(&config).unwrap();
        second.record_decisive(decision_entry(1.0));

        assert_ne!(first.run_dir(), second.run_dir());
        assert_eq!(read_lines(first.run_dir()).len(), 1);
        assert_eq!(read_lines(second.run_dir()).len(), 1);
    }

    #[test]
    fn test_frame_snapshot_saved_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = EvidenceLogger::new(&test_config(dir.path(), 4, true)).unwrap();
        let frame = Frame {
            seq: 7,
            timestamp_ms: 33.0,
            width: 8,
            height: 6,
            data: vec![128; 8 * 6 * 3],
        };
        let path = logger.save_frame_snapshot(&frame).expect("snapshot path");
        assert!(std::path::Path::new(&path).exists());

        let mut disabled = EvidenceLogger::new(&test_config(dir.path(), 4, false)).unwrap();
        assert!(disabled.save_frame_snapshot(&frame).is_none());
    }
}
