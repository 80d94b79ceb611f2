// src/session.rs
//
// One approach session: pull frames, run the detector, feed the trigger
// state machine, dispatch the mode change when it confirms, and record
// evidence along the way. A session runs to a terminal outcome exactly
// once; a new approach means a new session.

use crate::dispatcher::CommandDispatcher;
use crate::evidence::{EvidenceEntry, EvidenceLogger};
use crate::frame_source::FrameSource;
use crate::link::LinkHandle;
use crate::runway_detection::RunwayDetector;
use crate::trigger::TriggerStateMachine;
use crate::types::{
    AbortReason, Config, DetectionResult, SessionClock, SessionOutcome, TriggerState,
};
use anyhow::Result;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Operator-facing abort control. Cheap to clone across tasks. The first
/// reason delivered wins; later calls are no-ops.
#[derive(Clone)]
pub struct SessionHandle {
    abort: Arc<Mutex<Option<AbortReason>>>,
}

impl SessionHandle {
    pub fn abort(&self, reason: AbortReason) {
        if let Ok(mut slot) = self.abort.lock() {
            slot.get_or_insert(reason);
        }
    }
}

pub struct Session {
    machine: TriggerStateMachine,
    dispatcher: CommandDispatcher,
    evidence: EvidenceLogger,
    link: LinkHandle,
    clock: SessionClock,
    abort_slot: Arc<Mutex<Option<AbortReason>>>,
    target_mode: String,
    frame_interval: Duration,
    frame_timeout: Duration,
    detect_budget: Duration,
    search_window: Option<Duration>,
    save_frames: bool,
}

impl Session {
    pub fn new(
        config: &Config,
        link: LinkHandle,
        evidence: EvidenceLogger,
        clock: SessionClock,
    ) -> Self {
        Self {
            machine: TriggerStateMachine::new(config.trigger.clone()),
            dispatcher: CommandDispatcher::new(link.clone(), &config.link, clock),
            evidence,
            link,
            clock,
            abort_slot: Arc::new(Mutex::new(None)),
            target_mode: config.link.target_mode.clone(),
            frame_interval: Duration::from_secs_f64(1.0 / config.camera.frame_rate.max(0.1)),
            frame_timeout: Duration::from_millis(config.camera.frame_timeout_ms),
            detect_budget: Duration::from_millis(config.detection.budget_ms),
            search_window: config.trigger.search_window_secs.map(Duration::from_secs_f64),
            save_frames: config.evidence.save_frames,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            abort: Arc::clone(&self.abort_slot),
        }
    }

    pub fn outcome(&self) -> SessionOutcome {
        self.machine.outcome()
    }

    /// Drive the session to a terminal outcome.
    pub async fn run(
        &mut self,
        source: &mut dyn FrameSource,
        detector: &mut dyn RunwayDetector,
    ) -> Result<SessionOutcome> {
        let search_deadline = self.search_window.map(|w| Instant::now() + w);
        let mut last_seq = 0u64;
        let mut next_cycle = tokio::time::Instant::now();
        info!("Session started (target mode: {})", self.target_mode);

        loop {
            if self.machine.state().is_terminal() {
                break;
            }

            // Frame cadence; also keeps the runtime breathing while the
            // camera is quiet
            tokio::time::sleep_until(next_cycle).await;
            next_cycle = tokio::time::Instant::now() + self.frame_interval;

            let requested = self.abort_slot.lock().ok().and_then(|mut slot| slot.take());
            if let Some(reason) = requested {
                self.terminate(reason);
                continue;
            }

            if let Some(deadline) = search_deadline {
                if Instant::now() >= deadline
                    && matches!(
                        self.machine.state(),
                        TriggerState::Idle | TriggerState::Candidate
                    )
                {
                    self.terminate(AbortReason::SearchWindowExpired);
                    continue;
                }
            }

            let frame = match source.next_frame(self.frame_timeout)? {
                Some(frame) => frame,
                None => {
                    if source.is_exhausted() {
                        self.terminate(AbortReason::SourceEnded);
                    } else {
                        debug!("No frame within {} ms", self.frame_timeout.as_millis());
                        // A stalled camera counts as a no-detection cycle
                        let blank = DetectionResult::none(last_seq, self.clock.now_ms());
                        self.machine.update(&blank, self.link.snapshot());
                    }
                    continue;
                }
            };
            last_seq = frame.seq;

            let started = Instant::now();
            let mut detection = detector.detect(&frame);
            let elapsed = started.elapsed();
            if elapsed > self.detect_budget {
                // Fail open: a slow cycle counts as "nothing seen".
                warn!(
                    "Detector overran budget ({} ms > {} ms) on frame {}; discarding result",
                    elapsed.as_millis(),
                    self.detect_budget.as_millis(),
                    frame.seq
                );
                detection = DetectionResult::none(frame.seq, frame.timestamp_ms);
            }

            let link_status = self.link.snapshot();
            if detection.found {
                self.evidence
                    .record_detection(EvidenceEntry::detection(detection, link_status));
            }

            let state_before = self.machine.state();
            let request = self.machine.update(&detection, link_status);

            if let Some(request) = request {
                let frame_path = if self.save_frames {
                    self.evidence.save_frame_snapshot(&frame)
                } else {
                    None
                };
                info!(
                    "Dispatching mode change after {} consecutive detections",
                    request.consecutive_hits
                );
                let record = self.dispatcher.dispatch(&self.target_mode).await;
                self.machine.note_dispatched(record.command_id);
                self.machine.resolve_dispatch(&record);

                self.evidence.record_decisive(
                    EvidenceEntry::command(record, self.clock.now_ms()).with_frame_path(frame_path),
                );
                self.record_decision_evidence();
            } else if self.machine.state() == TriggerState::Aborted
                && state_before != TriggerState::Aborted
            {
                // Aborted inside update (link down at confirmation)
                self.record_decision_evidence();
            }

            self.evidence.flush_pending();
        }

        self.evidence.flush_pending();
        let outcome = self.machine.outcome();
        match outcome {
            SessionOutcome::Done => info!("Session complete: autoland dispatched and acknowledged"),
            SessionOutcome::Aborted(reason) => {
                warn!("Session aborted: {}", reason.as_str())
            }
            SessionOutcome::InProgress => {}
        }
        Ok(outcome)
    }

    fn terminate(&mut self, reason: AbortReason) {
        self.machine.abort(reason, self.clock.now_ms());
        if self.machine.state() == TriggerState::Aborted {
            self.record_decision_evidence();
        }
    }

    fn record_decision_evidence(&mut self) {
        if let Some(decision) = self.machine.decision().cloned() {
            let link = self.link.snapshot();
            self.evidence
                .record_decisive(EvidenceEntry::decision(decision, link, self.clock.now_ms()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::EvidenceLogger;
    use crate::link::{spawn_monitor, LoopbackBehavior, LoopbackLink};
    use crate::types::{
        CalibrationConfig, CameraConfig, CenterlineOffset, DetectionConfig, EvidenceConfig, Frame,
        LinkConfig, LoggingConfig, TriggerConfig,
    };

    /// Plays back a fixed confidence script, one entry per frame;
    /// optionally stalls on selected frame numbers.
    struct ScriptedDetector {
        script: Vec<f32>,
        cursor: usize,
        slow_frames: Vec<u64>,
        slow_delay: Duration,
    }

    impl ScriptedDetector {
        fn new(script: Vec<f32>) -> Self {
            Self {
                script,
                cursor: 0,
                slow_frames: Vec::new(),
                slow_delay: Duration::ZERO,
            }
        }

        fn with_slow_frames(mut self, frames: Vec<u64>, delay: Duration) -> Self {
            self.slow_frames = frames;
            self.slow_delay = delay;
            self
        }
    }

    impl RunwayDetector for ScriptedDetector {
        fn detect(&mut self, frame: &Frame) -> DetectionResult {
            if self.slow_frames.contains(&frame.seq) {
                std::thread::sleep(self.slow_delay);
            }
            let confidence = self.script.get(self.cursor).copied().unwrap_or(0.0);
            self.cursor += 1;
            DetectionResult {
                found: confidence > 0.0,
                confidence,
                offset: (confidence > 0.0).then_some(CenterlineOffset {
                    lateral: 0.01,
                    angle_deg: 2.0,
                }),
                frame_seq: frame.seq,
                timestamp_ms: frame.timestamp_ms,
            }
        }
    }

    /// Synthesizes blank frames without touching the filesystem;
    /// optionally returns no frame on selected acquisition calls to
    /// mimic a stalling camera.
    struct SyntheticSource {
        clock: SessionClock,
        remaining: usize,
        seq: u64,
        calls: usize,
        stall_calls: Vec<usize>,
    }

    impl SyntheticSource {
        fn new(frames: usize, clock: SessionClock) -> Self {
            Self {
                clock,
                remaining: frames,
                seq: 0,
                calls: 0,
                stall_calls: Vec::new(),
            }
        }

        fn with_stalls(mut self, calls: Vec<usize>) -> Self {
            self.stall_calls = calls;
            self
        }
    }

    impl FrameSource for SyntheticSource {
        fn next_frame(&mut self, _timeout: Duration) -> Result<Option<Frame>> {
            self.calls += 1;
            if self.stall_calls.contains(&self.calls) {
                return Ok(None);
            }
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            self.seq += 1;
            Ok(Some(Frame {
                seq: self.seq,
                timestamp_ms: self.clock.now_ms(),
                width: 4,
                height: 4,
                data: vec![0; 4 * 4 * 3],
            }))
        }

        fn is_exhausted(&self) -> bool {
            self.remaining == 0
        }
    }

    fn test_config(evidence_dir: &std::path::Path) -> Config {
        Config {
            camera: CameraConfig {
                input_dir: String::new(),
                frame_rate: 500.0,
                proc_width: 320,
                frame_timeout_ms: 50,
            },
            detection: DetectionConfig {
                budget_ms: 1_000,
                min_white_area: 500,
                aspect_min: 3.0,
                angle_tolerance_deg: 25.0,
                min_green_ratio: 0.25,
                min_gray_ratio: 0.35,
                ring_scale_outer: 0.2,
                ring_inner_ratio: 0.45,
                calibration: CalibrationConfig {
                    enabled: false,
                    frames: 0,
                    timeout_secs: 0.0,
                },
            },
            trigger: TriggerConfig {
                confidence_threshold: 0.75,
                confirm_frames: 3,
                max_offset_drift: 0.15,
                max_angle_drift_deg: 10.0,
                search_window_secs: None,
            },
            link: LinkConfig {
                target_mode: "AUTO_LAND".to_string(),
                ack_timeout_ms: 300,
                ack_poll_interval_ms: 5,
                heartbeat_timeout_ms: 1_000,
                status_refresh_interval_ms: 5,
            },
            evidence: EvidenceConfig {
                output_dir: evidence_dir.to_string_lossy().into_owned(),
                queue_capacity: 64,
                save_frames: false,
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
            },
        }
    }

    fn read_evidence(dir: &std::path::Path) -> Vec<serde_json::Value> {
        let run_dir = std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| {
                p.is_dir()
                    && p.file_name()
                        .map_or(false, |n| n.to_string_lossy().starts_with("run_"))
            })
            .expect("run directory");
        let raw = std::fs::read_to_string(run_dir.join("evidence.jsonl")).unwrap();
        raw.lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    async fn run_scripted(
        config: Config,
        link: LoopbackLink,
        mut source: SyntheticSource,
        mut detector: ScriptedDetector,
    ) -> (SessionOutcome, Vec<serde_json::Value>) {
        let evidence_dir = tempfile::tempdir().unwrap();
        let mut config = config;
        config.evidence.output_dir = evidence_dir.path().to_string_lossy().into_owned();

        let handle = LinkHandle::new(Box::new(link), &config.link);
        let monitor = spawn_monitor(handle.clone(), Duration::from_millis(5));
        // Let the first heartbeat land before frames start flowing
        tokio::time::sleep(Duration::from_millis(20)).await;

        let clock = SessionClock::start();
        let evidence = EvidenceLogger::new(&config.evidence).unwrap();
        let mut session = Session::new(&config, handle, evidence, clock);

        let outcome = session.run(&mut source, &mut detector).await.unwrap();
        monitor.abort();
        drop(session);
        (outcome, read_evidence(evidence_dir.path()))
    }

    async fn run_session(
        config: Config,
        link: LoopbackLink,
        script: Vec<f32>,
        frames: usize,
    ) -> (SessionOutcome, Vec<serde_json::Value>) {
        let clock = SessionClock::start();
        run_scripted(
            config,
            link,
            SyntheticSource::new(frames, clock),
            ScriptedDetector::new(script),
        )
        .await
    }

    #[tokio::test]
    async fn test_clean_approach_dispatches_once_and_completes() {
        let script = vec![0.9, 0.88, 0.91, 0.9];
        let (outcome, entries) =
            run_session(test_config(std::env::temp_dir().as_path()), LoopbackLink::new(), script, 6)
                .await;

        assert_eq!(outcome, SessionOutcome::Done);
        let commands: Vec<_> = entries.iter().filter(|e| e["kind"] == "command").collect();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0]["command"]["outcome"], "Acknowledged");
        assert_eq!(commands[0]["command"]["target_mode"], "AUTO_LAND");

        let decisions: Vec<_> = entries.iter().filter(|e| e["kind"] == "decision").collect();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0]["decision"]["consecutive_hits"], 3);
    }

    #[tokio::test]
    async fn test_silent_link_aborts_at_confirmation() {
        let link = LoopbackLink::new().with_behavior(LoopbackBehavior::Silent);
        let script = vec![0.9, 0.9, 0.9];
        let (outcome, entries) =
            run_session(test_config(std::env::temp_dir().as_path()), link, script, 5).await;

        assert_eq!(outcome, SessionOutcome::Aborted(AbortReason::LinkDown));
        assert!(entries.iter().all(|e| e["kind"] != "command"));
        let decision = entries
            .iter()
            .find(|e| e["kind"] == "decision")
            .expect("abort decision recorded");
        assert_eq!(decision["decision"]["abort_reason"], "LinkDown");
    }

    #[tokio::test]
    async fn test_dropped_ack_aborts_with_timeout() {
        let link = LoopbackLink::new().with_behavior(LoopbackBehavior::DropAcks);
        let script = vec![0.9, 0.9, 0.9];
        let (outcome, entries) =
            run_session(test_config(std::env::temp_dir().as_path()), link, script, 5).await;

        assert_eq!(outcome, SessionOutcome::Aborted(AbortReason::AckTimeout));
        let commands: Vec<_> = entries.iter().filter(|e| e["kind"] == "command").collect();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0]["command"]["outcome"], "AckTimeout");
    }

    #[tokio::test]
    async fn test_source_exhaustion_aborts() {
        let script = vec![0.9]; // never reaches three in a row
        let (outcome, _) =
            run_session(test_config(std::env::temp_dir().as_path()), LoopbackLink::new(), script, 2)
                .await;
        assert_eq!(outcome, SessionOutcome::Aborted(AbortReason::SourceEnded));
    }

    #[tokio::test]
    async fn test_budget_overrun_discards_hit_and_resets_streak() {
        // Frames 1-2 qualify; frame 3 also qualifies but the detector
        // overruns its budget, so the streak resets and frames 4-5 only
        // reach two hits before the source ends. Without the fail-open
        // discard this script would confirm on frame 3.
        let mut config = test_config(std::env::temp_dir().as_path());
        config.detection.budget_ms = 5;
        let detector = ScriptedDetector::new(vec![0.9; 5])
            .with_slow_frames(vec![3], Duration::from_millis(40));
        let clock = SessionClock::start();
        let (outcome, entries) = run_scripted(
            config,
            LoopbackLink::new(),
            SyntheticSource::new(5, clock),
            detector,
        )
        .await;

        assert_eq!(outcome, SessionOutcome::Aborted(AbortReason::SourceEnded));
        assert!(entries.iter().all(|e| e["kind"] != "command"));
    }

    #[tokio::test]
    async fn test_camera_stall_cycles_are_survived() {
        // Two empty acquisition cycles before any frame arrives; the
        // session keeps polling and still confirms on the three frames
        let config = test_config(std::env::temp_dir().as_path());
        let clock = SessionClock::start();
        let (outcome, _) = run_scripted(
            config,
            LoopbackLink::new(),
            SyntheticSource::new(3, clock).with_stalls(vec![1, 2]),
            ScriptedDetector::new(vec![0.9, 0.9, 0.9]),
        )
        .await;
        assert_eq!(outcome, SessionOutcome::Done);
    }

    #[tokio::test]
    async fn test_camera_stall_resets_candidate_streak() {
        // Two hits, then a frameless cycle, then one more hit: the gap
        // counts as a no-detection cycle, so the streak never reaches
        // three and the session ends with the source.
        let config = test_config(std::env::temp_dir().as_path());
        let clock = SessionClock::start();
        let (outcome, entries) = run_scripted(
            config,
            LoopbackLink::new(),
            SyntheticSource::new(3, clock).with_stalls(vec![3]),
            ScriptedDetector::new(vec![0.9, 0.9, 0.9]),
        )
        .await;

        assert_eq!(outcome, SessionOutcome::Aborted(AbortReason::SourceEnded));
        assert!(entries.iter().all(|e| e["kind"] != "command"));
    }

    #[tokio::test]
    async fn test_operator_abort_stops_session() {
        let evidence_dir = tempfile::tempdir().unwrap();
        let config = test_config(evidence_dir.path());

        let handle = LinkHandle::new(Box::new(LoopbackLink::new()), &config.link);
        let monitor = spawn_monitor(handle.clone(), Duration::from_millis(5));
        let clock = SessionClock::start();
        let evidence = EvidenceLogger::new(&config.evidence).unwrap();
        let mut session = Session::new(&config, handle, evidence, clock);
        session.handle().abort(AbortReason::OperatorAbort);

        let mut source = SyntheticSource::new(100, clock);
        let mut detector = ScriptedDetector::new(vec![0.9; 100]);
        let outcome = session.run(&mut source, &mut detector).await.unwrap();
        monitor.abort();

        assert_eq!(outcome, SessionOutcome::Aborted(AbortReason::OperatorAbort));
    }

    #[tokio::test]
    async fn test_abort_reason_is_attributed_in_outcome_and_evidence() {
        // The abort signal carries its own reason; the session must not
        // collapse every external abort into "operator abort".
        let evidence_dir = tempfile::tempdir().unwrap();
        let config = test_config(evidence_dir.path());

        let handle = LinkHandle::new(Box::new(LoopbackLink::new()), &config.link);
        let monitor = spawn_monitor(handle.clone(), Duration::from_millis(5));
        let clock = SessionClock::start();
        let evidence = EvidenceLogger::new(&config.evidence).unwrap();
        let mut session = Session::new(&config, handle, evidence, clock);
        session.handle().abort(AbortReason::ExternalCommand);

        let mut source = SyntheticSource::new(10, clock);
        let mut detector = ScriptedDetector::new(vec![0.0; 10]);
        let outcome = session.run(&mut source, &mut detector).await.unwrap();
        monitor.abort();
        drop(session);

        assert_eq!(
            outcome,
            SessionOutcome::Aborted(AbortReason::ExternalCommand)
        );
        let entries = read_evidence(evidence_dir.path());
        let decision = entries
            .iter()
            .find(|e| e["kind"] == "decision")
            .expect("abort decision recorded");
        assert_eq!(decision["decision"]["abort_reason"], "ExternalCommand");
    }

    #[tokio::test]
    async fn test_search_window_expiry_aborts_while_idle() {
        let mut config = test_config(std::env::temp_dir().as_path());
        config.trigger.search_window_secs = Some(0.0);
        let (outcome, _) = run_session(config, LoopbackLink::new(), vec![0.0; 10], 10).await;
        assert_eq!(
            outcome,
            SessionOutcome::Aborted(AbortReason::SearchWindowExpired)
        );
    }
}
