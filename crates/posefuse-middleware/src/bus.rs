//! Named-topic publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others. A subscriber that falls behind loses the *oldest* buffered
//! events and is told how many it missed; publishers never block.
//!
//! # Topics
//!
//! Topics are plain strings so that deployments can rename them in
//! configuration. The defaults used by the fusion engine are:
//!
//! | Topic | Traffic |
//! |---|---|
//! | [`topics::TAG_INPUT`] | Fiducial detection frames |
//! | [`topics::ODOMETRY_INPUT`] | Wheel odometry readings |
//! | [`topics::IMU_INPUT`] | IMU readings |
//! | [`topics::SET_POSITION`] | Trusted pose override commands |
//! | [`topics::ROBOT_POSITION_OUTPUT`] | Fused robot pose |
//! | [`topics::FUSION_DIAGNOSTICS`] | Skipped-measurement notices |

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use posefuse_types::{Event, PoseError};
use tokio::sync::broadcast;
use tracing::trace;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
pub const DEFAULT_CAPACITY: usize = 256;

/// Default topic names.
pub mod topics {
    pub const TAG_INPUT: &str = "tag-input";
    pub const ODOMETRY_INPUT: &str = "odometry-input";
    pub const IMU_INPUT: &str = "imu-input";
    pub const SET_POSITION: &str = "set-position";
    pub const ROBOT_POSITION_OUTPUT: &str = "robot-position-output";
    pub const FUSION_DIAGNOSTICS: &str = "fusion-diagnostics";
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
///
/// Channels are created lazily the first time a topic is published to or
/// subscribed to, each with the bus-wide capacity.
#[derive(Clone, Debug)]
pub struct EventBus {
    capacity: usize,
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<Event>>>>,
}

impl EventBus {
    /// Create a new bus with the given per-topic channel capacity.
    ///
    /// A capacity of zero is bumped to one; broadcast channels cannot be empty.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Publish `event` to `topic`.
    ///
    /// Returns the number of active receivers that were handed the event, or
    /// [`PoseError::Channel`] when nobody is listening on the topic.
    pub fn publish_to(&self, topic: &str, event: Event) -> Result<usize, PoseError> {
        let sender = self.sender(topic);
        match sender.send(event) {
            Ok(n) => {
                trace!(topic, receivers = n, "event published");
                Ok(n)
            }
            Err(broadcast::error::SendError(_)) => {
                Err(PoseError::Channel(format!("No subscribers for topic {topic}")))
            }
        }
    }

    /// Subscribe to `topic`. Only events published after this call are seen.
    pub fn subscribe_to(&self, topic: &str) -> TopicReceiver {
        TopicReceiver {
            topic: topic.to_string(),
            receiver: self.sender(topic).subscribe(),
        }
    }

    /// Number of live receivers on `topic` (zero if the topic was never used).
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.get(topic).map_or(0, |s| s.receiver_count())
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Event> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Topic-bound receiver
// ---------------------------------------------------------------------------

/// An async receiver bound to a single topic.
///
/// Obtained via [`EventBus::subscribe_to`].
#[derive(Debug)]
pub struct TopicReceiver {
    topic: String,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Returns:
    /// * `Ok(event)` – a successfully received event.
    /// * `Err(RecvError::Lagged(n))` – the subscriber fell behind and the `n`
    ///   oldest messages were dropped. The next call resumes with the oldest
    ///   message still buffered.
    /// * `Err(RecvError::Closed)` – every sender has been dropped.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Non-blocking variant of [`TopicReceiver::recv`], used to drain
    /// whatever is already buffered.
    pub fn try_recv(&mut self) -> Result<Event, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// The topic this receiver is bound to.
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use posefuse_types::{EventPayload, ImuReading};

    fn make_event(source: &str, timestamp: f64) -> Event {
        Event::new(
            source,
            EventPayload::Imu(ImuReading {
                sensor_id: "navx".into(),
                timestamp,
                yaw_rad: 0.0,
                velocity: None,
                position: None,
            }),
        )
    }

    #[test]
    fn publish_no_subscribers_returns_error() {
        let bus = EventBus::default();
        let result = bus.publish_to(topics::IMU_INPUT, make_event("test", 0.0));
        assert!(matches!(result, Err(PoseError::Channel(_))));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let bus = EventBus::new(0);
        assert_eq!(bus.capacity(), 1);
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut sub1 = bus.subscribe_to(topics::TAG_INPUT);
        let mut sub2 = bus.subscribe_to(topics::TAG_INPUT);
        assert_eq!(bus.subscriber_count(topics::TAG_INPUT), 2);

        let event = make_event("camera::front", 1.0);
        let delivered = bus.publish_to(topics::TAG_INPUT, event.clone())?;
        assert_eq!(delivered, 2);

        assert_eq!(sub1.recv().await?.id, event.id);
        assert_eq!(sub2.recv().await?.id, event.id);
        Ok(())
    }

    #[tokio::test]
    async fn subscriber_does_not_receive_other_topic_events() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut output = bus.subscribe_to(topics::ROBOT_POSITION_OUTPUT);
        let _imu = bus.subscribe_to(topics::IMU_INPUT);

        bus.publish_to(topics::IMU_INPUT, make_event("imu::navx", 1.0))?;

        let result =
            tokio::time::timeout(std::time::Duration::from_millis(50), output.recv()).await;
        assert!(result.is_err(), "output subscriber must not see IMU traffic");
        Ok(())
    }

    #[tokio::test]
    async fn clones_share_channels() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let clone = bus.clone();
        let mut rx = bus.subscribe_to("custom");
        let event = make_event("clone", 2.0);
        clone.publish_to("custom", event.clone())?;
        assert_eq!(rx.recv().await?.id, event.id);
        assert_eq!(rx.topic(), "custom");
        Ok(())
    }

    /// A slow subscriber loses the oldest events and then resumes with the
    /// oldest one still buffered.
    #[tokio::test]
    async fn slow_subscriber_drops_oldest() -> Result<(), Box<dyn std::error::Error>> {
        const CAPACITY: usize = 4;
        let bus = EventBus::new(CAPACITY);
        let mut slow = bus.subscribe_to(topics::ODOMETRY_INPUT);

        for i in 0..10 {
            bus.publish_to(topics::ODOMETRY_INPUT, make_event("flood", i as f64))?;
        }

        match slow.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert_eq!(n, 6),
            other => panic!("expected Lagged, got {other:?}"),
        }
        let next = slow.recv().await?;
        assert_eq!(next.payload.sensor_timestamp(), Some(6.0));
        Ok(())
    }

    #[test]
    fn try_recv_drains_buffered_events() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_to(topics::IMU_INPUT);
        bus.publish_to(topics::IMU_INPUT, make_event("a", 1.0))?;
        bus.publish_to(topics::IMU_INPUT, make_event("b", 2.0))?;

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event.source);
        }
        assert_eq!(seen, vec!["a".to_string(), "b".to_string()]);
        assert!(matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
        Ok(())
    }
}
