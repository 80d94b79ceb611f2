// src/link.rs
//
// Telemetry link to the flight controller. The transport itself
// (serial bring-up, wire protocol) is an external capability behind the
// `LinkChannel` trait; this module owns the shared `LinkStatus` and the
// background task that refreshes it.
//
// Status discipline: the monitor task is the only writer. Everyone else
// takes `snapshot()` copies, so the trigger logic never observes a
// half-updated status.

use crate::types::{LinkConfig, LinkStatus};
use anyhow::Result;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Inbound events drained from the link on each refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Heartbeat,
    CommandAck { command_id: u32, accepted: bool },
}

/// Minimal transmit/receive capability the core consumes. Message
/// semantics beyond "mode-change request" and "ack" are opaque here.
pub trait LinkChannel: Send {
    fn send_mode_change(&mut self, command_id: u32, target_mode: &str) -> Result<()>;

    /// Non-blocking drain of whatever arrived since the last poll.
    fn poll(&mut self) -> Vec<LinkEvent>;
}

#[derive(Debug, Default)]
struct StatusInner {
    last_heartbeat: Option<Instant>,
    last_ack: Option<(u32, bool)>,
}

/// Cloneable handle pairing the channel with the shared status.
#[derive(Clone)]
pub struct LinkHandle {
    channel: Arc<Mutex<Box<dyn LinkChannel>>>,
    status: Arc<RwLock<StatusInner>>,
    heartbeat_timeout: Duration,
}

impl LinkHandle {
    pub fn new(channel: Box<dyn LinkChannel>, config: &LinkConfig) -> Self {
        Self {
            channel: Arc::new(Mutex::new(channel)),
            status: Arc::new(RwLock::new(StatusInner::default())),
            heartbeat_timeout: Duration::from_millis(config.heartbeat_timeout_ms),
        }
    }

    pub fn send_mode_change(&self, command_id: u32, target_mode: &str) -> Result<()> {
        let mut channel = self
            .channel
            .lock()
            .map_err(|_| anyhow::anyhow!("link channel lock poisoned"))?;
        channel.send_mode_change(command_id, target_mode)
    }

    /// Consistent copy of the current link status.
    pub fn snapshot(&self) -> LinkStatus {
        let inner = match self.status.read() {
            Ok(inner) => inner,
            Err(_) => return LinkStatus::disconnected(),
        };
        let heartbeat_age_ms = inner
            .last_heartbeat
            .map(|at| at.elapsed().as_millis() as u64);
        LinkStatus {
            connected: heartbeat_age_ms.map_or(false, |age| age <= self.heartbeat_timeout.as_millis() as u64),
            heartbeat_age_ms,
            last_acked_command: inner.last_ack.map(|(id, _)| id),
        }
    }

    /// Whether the given command was acknowledged, and whether the
    /// controller accepted it.
    pub fn ack_result(&self, command_id: u32) -> Option<bool> {
        let inner = self.status.read().ok()?;
        match inner.last_ack {
            Some((id, accepted)) if id == command_id => Some(accepted),
            _ => None,
        }
    }

    /// Drain pending link events into the shared status. Called only by
    /// the monitor task (single-writer invariant).
    pub fn refresh(&self) {
        let events = match self.channel.lock() {
            Ok(mut channel) => channel.poll(),
            Err(_) => return,
        };
        if events.is_empty() {
            return;
        }
        let mut inner = match self.status.write() {
            Ok(inner) => inner,
            Err(_) => return,
        };
        for event in events {
            match event {
                LinkEvent::Heartbeat => {
                    inner.last_heartbeat = Some(Instant::now());
                }
                LinkEvent::CommandAck {
                    command_id,
                    accepted,
                } => {
                    debug!(
                        "Link ack for command {} (accepted: {})",
                        command_id, accepted
                    );
                    inner.last_ack = Some((command_id, accepted));
                }
            }
        }
    }
}

/// Spawn the status-refresh task. Runs until the handle is dropped by
/// aborting the returned task.
pub fn spawn_monitor(
    handle: LinkHandle,
    refresh_interval: Duration,
) -> tokio::task::JoinHandle<()> {
    info!(
        "Link monitor running (refresh every {} ms)",
        refresh_interval.as_millis()
    );
    tokio::spawn(async move {
        loop {
            handle.refresh();
            tokio::time::sleep(refresh_interval).await;
        }
    })
}

// ============================================================================
// LOOPBACK LINK
// ============================================================================

/// How the simulated controller responds to mode-change requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopbackBehavior {
    /// Acknowledge and accept every command
    AckAll,
    /// Acknowledge but reject every command
    RejectAll,
    /// Swallow commands without ever acking
    DropAcks,
    /// Fail at send time
    FailSends,
    /// No heartbeats at all (link appears down)
    Silent,
}

/// In-process stand-in for the flight controller, used for bench runs
/// and tests. Emits a heartbeat on every poll and acks sends after a
/// configurable delay.
pub struct LoopbackLink {
    behavior: LoopbackBehavior,
    ack_delay: Duration,
    pending_acks: VecDeque<(tokio::time::Instant, u32)>,
    sent_commands: Vec<(u32, String)>,
}

impl LoopbackLink {
    pub fn new() -> Self {
        Self {
            behavior: LoopbackBehavior::AckAll,
            ack_delay: Duration::ZERO,
            pending_acks: VecDeque::new(),
            sent_commands: Vec::new(),
        }
    }

    pub fn with_behavior(mut self, behavior: LoopbackBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn with_ack_delay(mut self, delay: Duration) -> Self {
        self.ack_delay = delay;
        self
    }

    pub fn sent_commands(&self) -> &[(u32, String)] {
        &self.sent_commands
    }
}

impl Default for LoopbackLink {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkChannel for LoopbackLink {
    fn send_mode_change(&mut self, command_id: u32, target_mode: &str) -> Result<()> {
        if self.behavior == LoopbackBehavior::FailSends {
            anyhow::bail!("simulated send failure");
        }
        self.sent_commands.push((command_id, target_mode.to_string()));
        if !matches!(
            self.behavior,
            LoopbackBehavior::DropAcks | LoopbackBehavior::Silent
        ) {
            self.pending_acks
                .push_back((tokio::time::Instant::now() + self.ack_delay, command_id));
        }
        Ok(())
    }

    fn poll(&mut self) -> Vec<LinkEvent> {
        let mut events = Vec::new();
        if self.behavior != LoopbackBehavior::Silent {
            events.push(LinkEvent::Heartbeat);
        }
        let now = tokio::time::Instant::now();
        while let Some(&(due, command_id)) = self.pending_acks.front() {
            if due > now {
                break;
            }
            self.pending_acks.pop_front();
            events.push(LinkEvent::CommandAck {
                command_id,
                accepted: self.behavior != LoopbackBehavior::RejectAll,
            });
        }
        events
    }
}
