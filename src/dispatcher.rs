// src/dispatcher.rs
//
// Mode-change command dispatch. Exactly one send per dispatch call;
// after that the dispatcher only watches the shared link status for the
// acknowledgment. Retries are a policy decision that belongs above this
// layer, and the state machine never asks for them.

use crate::link::LinkHandle;
use crate::types::{CommandOutcome, CommandRecord, LinkConfig, SessionClock};
use std::time::Duration;
use tracing::{info, warn};

pub struct CommandDispatcher {
    link: LinkHandle,
    ack_timeout: Duration,
    poll_interval: Duration,
    clock: SessionClock,
    next_command_id: u32,
}

impl CommandDispatcher {
    pub fn new(link: LinkHandle, config: &LinkConfig, clock: SessionClock) -> Self {
        Self {
            link,
            ack_timeout: Duration::from_millis(config.ack_timeout_ms),
            poll_interval: Duration::from_millis(config.ack_poll_interval_ms.max(1)),
            clock,
            next_command_id: 1,
        }
    }

    /// Send one mode-change command and wait for its acknowledgment.
    /// Always returns a terminal record; never sends twice.
    pub async fn dispatch(&mut self, target_mode: &str) -> CommandRecord {
        let command_id = self.next_command_id;
        self.next_command_id += 1;
        let sent_at_ms = self.clock.now_ms();

        if let Err(e) = self.link.send_mode_change(command_id, target_mode) {
            warn!("Mode-change command {} failed to send: {:#}", command_id, e);
            return CommandRecord {
                command_id,
                target_mode: target_mode.to_string(),
                sent_at_ms,
                acked_at_ms: None,
                outcome: CommandOutcome::SendFailed,
            };
        }
        info!(
            "Mode-change command {} sent (target mode: {})",
            command_id, target_mode
        );

        let deadline = tokio::time::Instant::now() + self.ack_timeout;
        loop {
            tokio::time::sleep(self.poll_interval).await;
            if let Some(accepted) = self.link.ack_result(command_id) {
                let acked_at_ms = self.clock.now_ms();
                let outcome = if accepted {
                    CommandOutcome::Acknowledged
                } else {
                    warn!("Controller rejected mode-change command {}", command_id);
                    CommandOutcome::Rejected
                };
                return CommandRecord {
                    command_id,
                    target_mode: target_mode.to_string(),
                    sent_at_ms,
                    acked_at_ms: Some(acked_at_ms),
                    outcome,
                };
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "No acknowledgment for command {} within {} ms",
                    command_id,
                    self.ack_timeout.as_millis()
                );
                return CommandRecord {
                    command_id,
                    target_mode: target_mode.to_string(),
                    sent_at_ms,
                    acked_at_ms: None,
                    outcome: CommandOutcome::AckTimeout,
                };
            }
        }
    }
}
