//! Command/ack protocol bookkeeping
//!
//! The issuer side ([`CommandTracker`]) tracks unacknowledged commands and
//! decides resends; the receiver side ([`AckCache`]) remembers computed acks
//! so duplicate deliveries are answered without re-executing. Both are plain
//! data structures, the tasks driving them live in the binaries.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::defaults;
use crate::message::{Command, CommandAck};

/// Resend schedule of unacknowledged commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait before the first resend
    pub ack_timeout: Duration,
    /// Cap on the wait between two sends
    pub max_interval: Duration,
    /// Total sends, first send included
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(defaults::COMMAND_ACK_TIMEOUT_MS),
            max_interval: Duration::from_millis(defaults::COMMAND_MAX_RETRY_INTERVAL_MS),
            max_attempts: defaults::COMMAND_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Wait after the send numbered `attempt` (1 = first send)
    pub fn interval_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.ack_timeout
            .saturating_mul(1u32 << exponent)
            .min(self.max_interval)
    }

    /// Time from the first send until an unacknowledged command is given
    /// up. Every resend of a command reaches the receiver within it, short
    /// of broker-side delays.
    pub fn tracking_window(&self) -> Duration {
        (1..=self.max_attempts).map(|attempt| self.interval_after(attempt)).sum()
    }
}

/// A command sent and not yet resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub command: Command,
    /// Sends so far, first send included
    pub attempts: u32,
    pub first_sent_at_ms: u64,
    pub next_retry_at_ms: u64,
}

impl PendingCommand {
    pub fn command_id(&self) -> Uuid {
        self.command.command_id
    }
}

/// Result of a retry tick
#[derive(Debug, Default)]
pub struct TickOutcome {
    /// Commands to send again, same id
    pub resend: Vec<Command>,
    /// Commands whose retry budget is exhausted, resolved as FAILED
    pub failed: Vec<PendingCommand>,
}

impl TickOutcome {
    pub fn is_empty(&self) -> bool {
        self.resend.is_empty() && self.failed.is_empty()
    }
}

/// Issuer side tracking of pending commands
#[derive(Debug)]
pub struct CommandTracker {
    policy: RetryPolicy,
    pending: HashMap<Uuid, PendingCommand>,
}

impl CommandTracker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            pending: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Start tracking a command that is being sent for the first time
    pub fn issue(&mut self, command: Command, now_ms: u64) -> PendingCommand {
        let pending = PendingCommand {
            attempts: 1,
            first_sent_at_ms: now_ms,
            next_retry_at_ms: now_ms + self.policy.interval_after(1).as_millis() as u64,
            command,
        };
        debug!(
            "Tracking command {} ({}), first retry at {}",
            pending.command_id(),
            pending.command.command_type,
            pending.next_retry_at_ms
        );
        self.pending.insert(pending.command_id(), pending.clone());
        pending
    }

    /// Resolve a pending command by its ack. Every ack is terminal; acks for
    /// unknown or already resolved ids return `None`.
    pub fn on_ack(&mut self, ack: &CommandAck) -> Option<PendingCommand> {
        match self.pending.remove(&ack.command_id) {
            Some(pending) => {
                info!(
                    "Command {} ({}) resolved: {} after {} attempt(s)",
                    ack.command_id, pending.command.command_type, ack.outcome, pending.attempts
                );
                Some(pending)
            }
            None => {
                warn!(
                    "Ack for unknown or resolved command {} ({}), ignoring",
                    ack.command_id, ack.outcome
                );
                None
            }
        }
    }

    /// Advance retry bookkeeping to `now_ms`
    pub fn tick(&mut self, now_ms: u64) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        let due: Vec<Uuid> = self
            .pending
            .values()
            .filter(|p| p.next_retry_at_ms <= now_ms)
            .map(PendingCommand::command_id)
            .collect();

        for id in due {
            let Some(pending) = self.pending.get_mut(&id) else {
                continue;
            };
            if pending.attempts < self.policy.max_attempts {
                pending.attempts += 1;
                pending.next_retry_at_ms =
                    now_ms + self.policy.interval_after(pending.attempts).as_millis() as u64;
                info!(
                    "Command {} unacknowledged, resending ({}/{})",
                    id, pending.attempts, self.policy.max_attempts
                );
                outcome.resend.push(pending.command.clone());
            } else if let Some(pending) = self.pending.remove(&id) {
                warn!(
                    "Command {} failed after {} attempt(s)",
                    id, pending.attempts
                );
                outcome.failed.push(pending);
            }
        }
        outcome
    }

    pub fn get(&self, command_id: &Uuid) -> Option<&PendingCommand> {
        self.pending.get(command_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Receiver side dedup cache of computed acks
///
/// An ack is kept for at least `retention`, which should cover the issuer's
/// [`RetryPolicy::tracking_window`]. Past `capacity` the oldest entry is
/// evicted only once it has outlived `retention`, so a resend arriving
/// within the window is always answered from the cache. Under a burst the
/// cache grows beyond `capacity` rather than forget a live command.
#[derive(Debug)]
pub struct AckCache {
    capacity: usize,
    retention_ms: u64,
    acks: HashMap<Uuid, CommandAck>,
    /// Insertion order with insertion time
    order: VecDeque<(Uuid, u64)>,
}

impl AckCache {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            retention_ms: retention.as_millis() as u64,
            acks: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn get(&self, command_id: &Uuid) -> Option<&CommandAck> {
        self.acks.get(command_id)
    }

    pub fn insert(&mut self, ack: CommandAck, now_ms: u64) {
        if self.acks.contains_key(&ack.command_id) {
            self.acks.insert(ack.command_id, ack);
            return;
        }
        while self.order.len() >= self.capacity {
            match self.order.front() {
                Some(&(oldest, inserted_at)) if now_ms.saturating_sub(inserted_at) >= self.retention_ms => {
                    self.order.pop_front();
                    self.acks.remove(&oldest);
                }
                _ => {
                    debug!(
                        "Ack cache over capacity ({} entries), oldest still within {}ms retention",
                        self.order.len(),
                        self.retention_ms
                    );
                    break;
                }
            }
        }
        self.order.push_back((ack.command_id, now_ms));
        self.acks.insert(ack.command_id, ack);
    }

    pub fn len(&self) -> usize {
        self.acks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acks.is_empty()
    }
}

impl Default for AckCache {
    fn default() -> Self {
        Self::new(defaults::ACK_CACHE_CAPACITY, RetryPolicy::default().tracking_window())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CommandType;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            ack_timeout: Duration::from_millis(100),
            max_interval: Duration::from_millis(300),
            max_attempts: 3,
        }
    }

    #[test]
    fn test_interval_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.interval_after(1), Duration::from_millis(100));
        assert_eq!(p.interval_after(2), Duration::from_millis(200));
        assert_eq!(p.interval_after(3), Duration::from_millis(300));
        assert_eq!(p.interval_after(40), Duration::from_millis(300));
    }

    #[test]
    fn test_resend_keeps_id_then_fails_once() {
        let mut tracker = CommandTracker::new(policy());
        let command = Command::new(CommandType::Land, "drone-1", Vec::new());
        let id = command.command_id;
        tracker.issue(command, 0);

        assert!(tracker.tick(99).is_empty());

        let out = tracker.tick(100);
        assert_eq!(out.resend.len(), 1);
        assert_eq!(out.resend[0].command_id, id);
        assert_eq!(tracker.get(&id).unwrap().attempts, 2);

        // second resend after 200ms
        assert!(tracker.tick(299).is_empty());
        let out = tracker.tick(300);
        assert_eq!(out.resend.len(), 1);
        assert_eq!(tracker.get(&id).unwrap().attempts, 3);

        // budget exhausted
        let out = tracker.tick(600);
        assert!(out.resend.is_empty());
        assert_eq!(out.failed.len(), 1);
        assert_eq!(out.failed[0].attempts, 3);
        assert_eq!(tracker.pending_count(), 0);

        // never again
        assert!(tracker.tick(10_000).is_empty());
    }

    #[test]
    fn test_ack_resolves_and_late_ack_is_ignored() {
        let mut tracker = CommandTracker::new(policy());
        let command = Command::new(CommandType::Acknowledge, "drone-1", Vec::new());
        let id = command.command_id;
        tracker.issue(command, 0);

        let ack = CommandAck::rejected(id, "not in ALERT");
        let resolved = tracker.on_ack(&ack).unwrap();
        assert_eq!(resolved.command.command_type, CommandType::Acknowledge);
        assert!(tracker.on_ack(&ack).is_none());
        assert!(tracker.tick(10_000).is_empty());
    }

    #[test]
    fn test_ack_for_unknown_id_is_ignored() {
        let mut tracker = CommandTracker::new(policy());
        let ack = CommandAck::executed(Uuid::new_v4(), "done");
        assert!(tracker.on_ack(&ack).is_none());
    }

    #[test]
    fn test_tracking_window_matches_failure_time() {
        // sends at 0, 100 and 300, given up at 600
        assert_eq!(policy().tracking_window(), Duration::from_millis(600));
        assert_eq!(RetryPolicy::default().tracking_window(), Duration::from_millis(45_000));
    }

    #[test]
    fn test_ack_cache_evicts_oldest_after_retention() {
        let mut cache = AckCache::new(2, Duration::from_millis(1_000));
        let a = CommandAck::accepted(Uuid::new_v4(), "a");
        let b = CommandAck::accepted(Uuid::new_v4(), "b");
        let c = CommandAck::accepted(Uuid::new_v4(), "c");
        cache.insert(a.clone(), 0);
        cache.insert(b.clone(), 10);
        cache.insert(c.clone(), 1_000);

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&a.command_id).is_none());
        assert_eq!(cache.get(&b.command_id), Some(&b));
        assert_eq!(cache.get(&c.command_id), Some(&c));
    }

    #[test]
    fn test_ack_cache_keeps_live_entries_past_capacity() {
        let mut cache = AckCache::new(2, Duration::from_millis(1_000));
        let acks: Vec<CommandAck> = (0..5)
            .map(|i| CommandAck::accepted(Uuid::new_v4(), format!("{i}")))
            .collect();
        for (i, ack) in acks.iter().enumerate() {
            cache.insert(ack.clone(), i as u64 * 100);
        }

        // a burst inside the retention window evicts nothing
        assert_eq!(cache.len(), 5);
        assert!(acks.iter().all(|ack| cache.get(&ack.command_id).is_some()));

        // expired entries go once the window has passed
        let late = CommandAck::accepted(Uuid::new_v4(), "late");
        cache.insert(late.clone(), 1_250);
        assert_eq!(cache.len(), 3);
        assert!(cache.get(&acks[2].command_id).is_none());
        assert!(cache.get(&acks[3].command_id).is_some());
        assert!(cache.get(&late.command_id).is_some());
    }

    #[test]
    fn test_ack_cache_reinsert_does_not_grow() {
        let mut cache = AckCache::new(2, Duration::from_millis(1_000));
        let a = CommandAck::accepted(Uuid::new_v4(), "a");
        cache.insert(a.clone(), 0);
        cache.insert(a.clone(), 5);
        assert_eq!(cache.len(), 1);
    }
}
