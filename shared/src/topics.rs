//! Topic scheme and router
//!
//! Topics are device scoped so one broker can serve several drone/operator
//! pairings without cross-talk:
//! ```text
//! devices/{device_id}/telemetry   drone -> operator   at-most-once
//! devices/{device_id}/state       drone -> operator   at-least-once
//! devices/{device_id}/acks        drone -> operator   at-least-once
//! devices/{device_id}/commands    operator -> drone   at-least-once
//! ```
//! Filters use MQTT syntax: `+` matches one segment, a trailing `#` matches
//! the remaining segments.

use std::fmt;

use tracing::warn;

use crate::message::{Message, MessageKind, Role};
use crate::session::QoS;

/// Root segment of every channel topic
pub const TOPIC_ROOT: &str = "devices";

/// Per-device channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicChannel {
    Telemetry,
    State,
    Acks,
    Commands,
}

impl TopicChannel {
    pub fn segment(&self) -> &'static str {
        match self {
            TopicChannel::Telemetry => "telemetry",
            TopicChannel::State => "state",
            TopicChannel::Acks => "acks",
            TopicChannel::Commands => "commands",
        }
    }

    fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "telemetry" => Some(TopicChannel::Telemetry),
            "state" => Some(TopicChannel::State),
            "acks" => Some(TopicChannel::Acks),
            "commands" => Some(TopicChannel::Commands),
            _ => None,
        }
    }

    /// Payload kind carried on this channel
    pub fn message_kind(&self) -> MessageKind {
        match self {
            TopicChannel::Telemetry => MessageKind::Telemetry,
            TopicChannel::State => MessageKind::State,
            TopicChannel::Acks => MessageKind::Ack,
            TopicChannel::Commands => MessageKind::Command,
        }
    }

    /// Delivery guarantee used when publishing on this channel
    pub fn qos(&self) -> QoS {
        match self {
            TopicChannel::Telemetry => QoS::AtMostOnce,
            TopicChannel::State | TopicChannel::Acks | TopicChannel::Commands => QoS::AtLeastOnce,
        }
    }
}

impl fmt::Display for TopicChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.segment())
    }
}

/// Build the topic of a device channel
pub fn topic(device_id: &str, channel: TopicChannel) -> String {
    format!("{TOPIC_ROOT}/{device_id}/{}", channel.segment())
}

/// Split a concrete topic into its device id and channel
pub fn parse_topic(topic: &str) -> Option<(&str, TopicChannel)> {
    let mut parts = topic.split('/');
    let root = parts.next()?;
    let device_id = parts.next()?;
    let channel = TopicChannel::from_segment(parts.next()?)?;
    if root != TOPIC_ROOT || device_id.is_empty() || parts.next().is_some() {
        return None;
    }
    Some((device_id, channel))
}

/// Resolve where an outbound message goes. `drone_id` is the drone the
/// exchange belongs to; acks carry no device id of their own.
pub fn outbound(message: &Message, drone_id: &str) -> (String, QoS) {
    let (device, channel) = match message {
        Message::Telemetry(sample) => (sample.device_id.as_str(), TopicChannel::Telemetry),
        Message::State(report) => (report.device_id.as_str(), TopicChannel::State),
        Message::Command(command) => (command.target_device_id.as_str(), TopicChannel::Commands),
        Message::Ack(_) => (drone_id, TopicChannel::Acks),
    };
    (topic(device, channel), channel.qos())
}

/// Topics a process subscribes to. A drone only listens to its own command
/// topic; an operator only listens to its paired drone's outbound channels.
pub fn subscriptions(role: Role, self_id: &str, peer_id: &str) -> Vec<(String, TopicChannel)> {
    match role {
        Role::Drone => vec![(topic(self_id, TopicChannel::Commands), TopicChannel::Commands)],
        Role::Operator => [TopicChannel::Telemetry, TopicChannel::State, TopicChannel::Acks]
            .into_iter()
            .map(|channel| (topic(peer_id, channel), channel))
            .collect(),
    }
}

/// A parsed MQTT-style topic filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    raw: String,
    segments: Vec<String>,
}

impl TopicFilter {
    /// Parse a filter. `#` is only allowed as the last segment.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.is_empty() {
            return None;
        }
        let segments: Vec<String> = raw.split('/').map(str::to_string).collect();
        let last = segments.len() - 1;
        for (i, segment) in segments.iter().enumerate() {
            if segment == "#" && i != last {
                return None;
            }
            if segment.len() > 1 && (segment.contains('#') || segment.contains('+')) {
                return None;
            }
        }
        Some(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Check whether a concrete topic matches this filter
    pub fn matches(&self, topic: &str) -> bool {
        let mut levels = topic.split('/');
        for segment in &self.segments {
            match segment.as_str() {
                "#" => return true,
                "+" => {
                    if levels.next().is_none() {
                        return false;
                    }
                }
                literal => {
                    if levels.next() != Some(literal) {
                        return false;
                    }
                }
            }
        }
        levels.next().is_none()
    }

    /// Higher is more specific: literal segments first, then single-level
    /// wildcards over multi-level ones.
    fn specificity(&self) -> (usize, usize) {
        let literals = self
            .segments
            .iter()
            .filter(|s| s.as_str() != "+" && s.as_str() != "#")
            .count();
        let single = self.segments.iter().filter(|s| s.as_str() == "+").count();
        (literals, single)
    }
}

/// Maps topics to handlers by the most specific matching filter
#[derive(Debug)]
pub struct TopicRouter<H> {
    routes: Vec<(TopicFilter, H)>,
}

impl<H> Default for TopicRouter<H> {
    fn default() -> Self {
        Self { routes: Vec::new() }
    }
}

impl<H> TopicRouter<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a filter. Returns false if the filter is invalid.
    pub fn register(&mut self, filter: &str, handler: H) -> bool {
        match TopicFilter::parse(filter) {
            Some(filter) => {
                self.routes.push((filter, handler));
                true
            }
            None => {
                warn!("Ignoring invalid topic filter: {}", filter);
                false
            }
        }
    }

    /// Find the handler for a topic without logging misses
    pub fn resolve(&self, topic: &str) -> Option<&H> {
        let mut best: Option<&(TopicFilter, H)> = None;
        for route in self.routes.iter().filter(|(f, _)| f.matches(topic)) {
            match best {
                // earliest registration wins a tie
                Some((current, _)) if current.specificity() >= route.0.specificity() => {}
                _ => best = Some(route),
            }
        }
        best.map(|(_, handler)| handler)
    }

    /// Find the handler for an inbound topic. Unmatched topics are logged and
    /// dropped by the caller.
    pub fn route(&self, topic: &str) -> Option<&H> {
        let handler = self.resolve(topic);
        if handler.is_none() {
            warn!("No route for topic {}, dropping message", topic);
        }
        handler
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Command, CommandAck, CommandType};

    #[test]
    fn test_topic_roundtrip() {
        let t = topic("drone-7", TopicChannel::Acks);
        assert_eq!(t, "devices/drone-7/acks");
        assert_eq!(parse_topic(&t), Some(("drone-7", TopicChannel::Acks)));
        assert_eq!(parse_topic("devices/drone-7/unknown"), None);
        assert_eq!(parse_topic("devices/drone-7/acks/extra"), None);
        assert_eq!(parse_topic("other/drone-7/acks"), None);
    }

    #[test]
    fn test_filter_matching() {
        let plus = TopicFilter::parse("devices/+/telemetry").unwrap();
        assert!(plus.matches("devices/a/telemetry"));
        assert!(!plus.matches("devices/a/b/telemetry"));
        assert!(!plus.matches("devices/a"));

        let hash = TopicFilter::parse("devices/#").unwrap();
        assert!(hash.matches("devices/a/telemetry"));
        assert!(hash.matches("devices/a"));
        assert!(!hash.matches("other/a"));

        let exact = TopicFilter::parse("devices/a/state").unwrap();
        assert!(exact.matches("devices/a/state"));
        assert!(!exact.matches("devices/a/state/x"));

        assert!(TopicFilter::parse("devices/#/state").is_none());
        assert!(TopicFilter::parse("devices/a+/state").is_none());
        assert!(TopicFilter::parse("").is_none());
    }

    #[test]
    fn test_most_specific_route_wins() {
        let mut router = TopicRouter::new();
        router.register("devices/#", "catch-all");
        router.register("devices/+/state", "any-state");
        router.register("devices/drone-1/state", "drone-1-state");

        assert_eq!(router.route("devices/drone-1/state"), Some(&"drone-1-state"));
        assert_eq!(router.route("devices/drone-2/state"), Some(&"any-state"));
        assert_eq!(router.route("devices/drone-2/acks"), Some(&"catch-all"));
        assert_eq!(router.route("elsewhere/x"), None);
    }

    #[test]
    fn test_tie_goes_to_first_registration() {
        let mut router = TopicRouter::new();
        router.register("devices/+/acks", 1);
        router.register("devices/drone-1/+", 2);
        assert_eq!(router.route("devices/drone-1/acks"), Some(&1));
    }

    #[test]
    fn test_outbound_mapping() {
        let command = Command::new(CommandType::Land, "drone-9", Vec::new());
        let (t, qos) = outbound(&Message::Command(command.clone()), "drone-9");
        assert_eq!(t, "devices/drone-9/commands");
        assert_eq!(qos, QoS::AtLeastOnce);

        let ack = CommandAck::executed(command.command_id, "ok");
        let (t, qos) = outbound(&Message::Ack(ack), "drone-9");
        assert_eq!(t, "devices/drone-9/acks");
        assert_eq!(qos, QoS::AtLeastOnce);

        assert_eq!(TopicChannel::Telemetry.qos(), QoS::AtMostOnce);
    }

    #[test]
    fn test_subscriptions_are_scoped() {
        let drone = subscriptions(Role::Drone, "drone-1", "op-1");
        assert_eq!(drone, vec![("devices/drone-1/commands".to_string(), TopicChannel::Commands)]);

        let operator = subscriptions(Role::Operator, "op-1", "drone-1");
        let topics: Vec<&str> = operator.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(
            topics,
            vec!["devices/drone-1/telemetry", "devices/drone-1/state", "devices/drone-1/acks"]
        );
    }
}
