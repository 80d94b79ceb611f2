// src/trigger.rs
//
// Debounced trigger state machine. Pure and synchronous: one call per
// detection result, no I/O, no clocks of its own. Replaying the same
// sequence of detection results and link snapshots produces the same
// transitions, which is what makes post-flight evidence replay useful.

use crate::types::{
    AbortReason, CenterlineOffset, CommandOutcome, CommandRecord, DetectionResult, LinkStatus,
    SessionOutcome, TriggerConfig, TriggerDecision, TriggerState,
};
use tracing::{debug, info, warn};

/// Emitted exactly once per session, when the machine reaches CONFIRMED
/// with the link up. The caller must answer with `note_dispatched` and
/// `resolve_dispatch`.
#[derive(Debug, Clone)]
pub struct ModeChangeRequest {
    pub consecutive_hits: u32,
    pub timestamp_ms: f64,
}

pub struct TriggerStateMachine {
    config: TriggerConfig,
    state: TriggerState,
    consecutive_hits: u32,
    last_offset: Option<CenterlineOffset>,
    decision: Option<TriggerDecision>,
    abort_reason: Option<AbortReason>,
}

impl TriggerStateMachine {
    pub fn new(config: TriggerConfig) -> Self {
        Self {
            config,
            state: TriggerState::Idle,
            consecutive_hits: 0,
            last_offset: None,
            decision: None,
            abort_reason: None,
        }
    }

    pub fn state(&self) -> TriggerState {
        self.state
    }

    pub fn consecutive_hits(&self) -> u32 {
        self.consecutive_hits
    }

    pub fn decision(&self) -> Option<&TriggerDecision> {
        self.decision.as_ref()
    }

    pub fn outcome(&self) -> SessionOutcome {
        match self.state {
            TriggerState::Done => SessionOutcome::Done,
            TriggerState::Aborted => {
                SessionOutcome::Aborted(self.abort_reason.unwrap_or(AbortReason::OperatorAbort))
            }
            _ => SessionOutcome::InProgress,
        }
    }

    /// Feed one detection result. Returns a mode-change request on the
    /// IDLE/CANDIDATE -> CONFIRMED transition; `None` otherwise.
    pub fn update(
        &mut self,
        detection: &DetectionResult,
        link: LinkStatus,
    ) -> Option<ModeChangeRequest> {
        if !matches!(self.state, TriggerState::Idle | TriggerState::Candidate) {
            return None;
        }

        let qualifying = detection.found && detection.confidence >= self.config.confidence_threshold;
        if !qualifying {
            self.reset_candidate(detection);
            return None;
        }

        // Drift gate: a qualifying hit whose descriptor jumps too far
        // from the previous hit is treated as a different object and
        // resets the streak entirely.
        if let (Some(prev), Some(curr)) = (self.last_offset, detection.offset) {
            let lateral_jump = (curr.lateral - prev.lateral).abs();
            let angle_jump = (curr.angle_deg - prev.angle_deg).abs();
            if lateral_jump > self.config.max_offset_drift
                || angle_jump > self.config.max_angle_drift_deg
            {
                debug!(
                    "Frame {}: descriptor drift (lateral {:.3}, angle {:.1} deg) broke the streak",
                    detection.frame_seq, lateral_jump, angle_jump
                );
                self.state = TriggerState::Idle;
                self.consecutive_hits = 0;
                self.last_offset = None;
                return None;
            }
        }

        self.consecutive_hits += 1;
        self.last_offset = detection.offset;
        if self.state == TriggerState::Idle {
            self.state = TriggerState::Candidate;
            info!(
                "Frame {}: runway candidate (confidence {:.2})",
                detection.frame_seq, detection.confidence
            );
        }

        if self.consecutive_hits < self.config.confirm_frames {
            return None;
        }

        // Confirmation gate: the link must be up before committing.
        if !link.connected {
            warn!(
                "Detection confirmed after {} frames but link is down; aborting",
                self.consecutive_hits
            );
            self.abort(AbortReason::LinkDown, detection.timestamp_ms);
            return None;
        }

        self.state = TriggerState::Confirmed;
        self.decision = Some(TriggerDecision {
            state: TriggerState::Confirmed,
            consecutive_hits: self.consecutive_hits,
            timestamp_ms: detection.timestamp_ms,
            command_id: None,
            abort_reason: None,
        });
        info!(
            "Runway confirmed after {} consecutive detections",
            self.consecutive_hits
        );
        Some(ModeChangeRequest {
            consecutive_hits: self.consecutive_hits,
            timestamp_ms: detection.timestamp_ms,
        })
    }

    /// The mode-change command left the dispatcher. CONFIRMED -> DISPATCHED.
    pub fn note_dispatched(&mut self, command_id: u32) {
        if self.state != TriggerState::Confirmed {
            warn!(
                "note_dispatched called in state {}; ignoring",
                self.state.as_str()
            );
            return;
        }
        self.state = TriggerState::Dispatched;
        if let Some(decision) = self.decision.as_mut() {
            decision.command_id = Some(command_id);
        }
    }

    /// Fold the dispatch outcome into the session outcome.
    /// DISPATCHED -> DONE on acknowledgment, ABORTED otherwise.
    pub fn resolve_dispatch(&mut self, record: &CommandRecord) {
        if self.state != TriggerState::Dispatched {
            warn!(
                "resolve_dispatch called in state {}; ignoring",
                self.state.as_str()
            );
            return;
        }
        match record.outcome {
            CommandOutcome::Acknowledged => {
                self.state = TriggerState::Done;
                info!(
                    "Mode change {} acknowledged; session complete",
                    record.command_id
                );
            }
            CommandOutcome::Rejected => {
                self.abort(AbortReason::CommandRejected, record.sent_at_ms);
            }
            CommandOutcome::SendFailed => {
                self.abort(AbortReason::SendFailed, record.sent_at_ms);
            }
            CommandOutcome::AckTimeout => {
                self.abort(AbortReason::AckTimeout, record.sent_at_ms);
            }
        }
    }

    /// Abort from any pre-dispatch state. Once the command is out, the
    /// outcome is decided by the pending acknowledgment instead.
    pub fn abort(&mut self, reason: AbortReason, timestamp_ms: f64) {
        if self.state.is_terminal() {
            return;
        }
        if self.state == TriggerState::Dispatched
            && !matches!(
                reason,
                AbortReason::SendFailed | AbortReason::AckTimeout | AbortReason::CommandRejected
            )
        {
            debug!("Abort ({}) ignored: command already dispatched", reason.as_str());
            return;
        }
        warn!("Session aborted: {}", reason.as_str());
        self.state = TriggerState::Aborted;
        self.abort_reason = Some(reason);
        let command_id = self.decision.as_ref().and_then(|d| d.command_id);
        self.decision = Some(TriggerDecision {
            state: TriggerState::Aborted,
            consecutive_hits: self.consecutive_hits,
            timestamp_ms,
            command_id,
            abort_reason: Some(reason),
        });
    }

    fn reset_candidate(&mut self, detection: &DetectionResult) {
        if self.state == TriggerState::Candidate {
            debug!(
                "Frame {}: non-qualifying result after {} hit(s); back to idle",
                detection.frame_seq, self.consecutive_hits
            );
        }
        self.state = TriggerState::Idle;
        self.consecutive_hits = 0;
        self.last_offset = None;
    }
}
