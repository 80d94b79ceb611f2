use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub camera: CameraConfig,
    pub detection: DetectionConfig,
    pub trigger: TriggerConfig,
    pub link: LinkConfig,
    pub evidence: EvidenceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub input_dir: String,
    pub frame_rate: f64,
    pub proc_width: usize,
    pub frame_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    pub budget_ms: u64,
    pub min_white_area: usize,
    pub aspect_min: f32,
    pub angle_tolerance_deg: f32,
    pub min_green_ratio: f32,
    pub min_gray_ratio: f32,
    pub ring_scale_outer: f32,
    pub ring_inner_ratio: f32,
    pub calibration: CalibrationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    pub enabled: bool,
    pub frames: usize,
    pub timeout_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// T_detect: minimum detection confidence to qualify
    pub confidence_threshold: f32,
    /// N: consecutive qualifying detections required to confirm
    pub confirm_frames: u32,
    /// Max normalized lateral jump between consecutive qualifying detections
    pub max_offset_drift: f32,
    /// Max angular jump (degrees) between consecutive qualifying detections
    pub max_angle_drift_deg: f32,
    /// Optional bounded search window; expiry without confirmation aborts
    pub search_window_secs: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    pub target_mode: String,
    pub ack_timeout_ms: u64,
    pub ack_poll_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub status_refresh_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceConfig {
    pub output_dir: String,
    pub queue_capacity: usize,
    pub save_frames: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

/// Monotonic session clock. All timestamps in this crate are milliseconds
/// since session start, so evidence ordering never depends on wall-clock
/// adjustments mid-flight.
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    epoch: Instant,
}

impl SessionClock {
    pub fn start() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64() * 1000.0
    }
}

/// One timestamped RGB8 frame. Owned by the frame source until handed to
/// the detector; retained afterwards only when selected for evidence.
#[derive(Debug, Clone)]
pub struct Frame {
    pub seq: u64,
    pub timestamp_ms: f64,
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
}

/// Geometric descriptor of the detected runway centerline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CenterlineOffset {
    /// Normalized lateral offset of the runway center, -1.0 (far left)
    /// to 1.0 (far right) of the frame
    pub lateral: f32,
    /// Runway axis angle relative to image vertical, folded to [0, 45]
    pub angle_deg: f32,
}

/// Immutable result of running the detector on exactly one frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DetectionResult {
    pub found: bool,
    pub confidence: f32,
    pub offset: Option<CenterlineOffset>,
    pub frame_seq: u64,
    pub timestamp_ms: f64,
}

impl DetectionResult {
    /// The fail-open result: no runway, zero confidence. Used for frame
    /// timeouts and detector budget overruns.
    pub fn none(frame_seq: u64, timestamp_ms: f64) -> Self {
        Self {
            found: false,
            confidence: 0.0,
            offset: None,
            frame_seq,
            timestamp_ms,
        }
    }
}

/// Snapshot of link health at one instant. Single writer (the link
/// monitor task); everyone else reads copies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LinkStatus {
    pub connected: bool,
    pub heartbeat_age_ms: Option<u64>,
    pub last_acked_command: Option<u32>,
}

impl LinkStatus {
    pub fn disconnected() -> Self {
        Self {
            connected: false,
            heartbeat_age_ms: None,
            last_acked_command: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerState {
    Idle,
    Candidate,
    Confirmed,
    Dispatched,
    Done,
    Aborted,
}

impl TriggerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerState::Idle => "IDLE",
            TriggerState::Candidate => "CANDIDATE",
            TriggerState::Confirmed => "CONFIRMED",
            TriggerState::Dispatched => "DISPATCHED",
            TriggerState::Done => "DONE",
            TriggerState::Aborted => "ABORTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TriggerState::Done | TriggerState::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    /// Link disconnected at confirmation time
    LinkDown,
    /// Mode-change message never left the link (send error)
    SendFailed,
    /// Command sent but no acknowledgment within the timeout
    AckTimeout,
    /// Controller explicitly rejected the mode change
    CommandRejected,
    /// External operator abort signal
    OperatorAbort,
    /// Abort commanded by an external system (not a human operator)
    ExternalCommand,
    /// Search window elapsed without a confirmed detection
    SearchWindowExpired,
    /// Frame source ended before a confirmed detection (replay sources)
    SourceEnded,
}

impl AbortReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbortReason::LinkDown => "link_down",
            AbortReason::SendFailed => "send_failed",
            AbortReason::AckTimeout => "ack_timeout",
            AbortReason::CommandRejected => "command_rejected",
            AbortReason::OperatorAbort => "operator_abort",
            AbortReason::ExternalCommand => "external_command",
            AbortReason::SearchWindowExpired => "search_window_expired",
            AbortReason::SourceEnded => "source_ended",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    InProgress,
    Done,
    Aborted(AbortReason),
}

impl SessionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionOutcome::InProgress => "in_progress",
            SessionOutcome::Done => "done",
            SessionOutcome::Aborted(_) => "aborted",
        }
    }
}

/// Record of the (at most one) trigger decision taken during a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerDecision {
    pub state: TriggerState,
    pub consecutive_hits: u32,
    pub timestamp_ms: f64,
    pub command_id: Option<u32>,
    pub abort_reason: Option<AbortReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandOutcome {
    Acknowledged,
    Rejected,
    SendFailed,
    AckTimeout,
}

impl CommandOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandOutcome::Acknowledged => "acknowledged",
            CommandOutcome::Rejected => "rejected",
            CommandOutcome::SendFailed => "send_failed",
            CommandOutcome::AckTimeout => "ack_timeout",
        }
    }
}

/// Terminal record of one mode-change send attempt. Never mutated after
/// the dispatcher returns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command_id: u32,
    pub target_mode: String,
    pub sent_at_ms: f64,
    pub acked_at_ms: Option<f64>,
    pub outcome: CommandOutcome,
}
