//! [`PosePublisher`] – emits fused poses and skip notices on the bus.
//!
//! Publishing never feeds back into the estimate: a topic with no
//! subscribers is logged at `debug` and otherwise ignored.

use posefuse_middleware::EventBus;
use posefuse_types::{Event, EventPayload, RobotPose, SensorKind, SkipReason};
use tracing::{debug, trace};

use crate::config::TopicsConfig;
use crate::engine::FusionOutcome;

const SOURCE: &str = "posefuse-runtime::publisher";

#[derive(Clone)]
pub struct PosePublisher {
    bus: EventBus,
    output_topic: String,
    diagnostics_topic: String,
    published: u64,
}

impl PosePublisher {
    pub fn new(bus: EventBus, topics: &TopicsConfig) -> Self {
        Self {
            bus,
            output_topic: topics.robot_position_output.clone(),
            diagnostics_topic: topics.fusion_diagnostics.clone(),
            published: 0,
        }
    }

    /// Publish `pose` on the output topic. Returns whether anyone received it.
    pub fn publish_pose(&mut self, pose: &RobotPose) -> bool {
        let event = Event::new(SOURCE, EventPayload::RobotPosition(pose.clone()));
        match self.bus.publish_to(&self.output_topic, event) {
            Ok(receivers) => {
                self.published += 1;
                trace!(sequence = pose.sequence, receivers, "pose published");
                true
            }
            Err(e) => {
                debug!(sequence = pose.sequence, error = %e, "pose not delivered");
                false
            }
        }
    }

    /// Publish a skip notice on the diagnostics topic.
    pub fn publish_skip(&self, kind: SensorKind, sensor_id: &str, reason: &SkipReason) -> bool {
        let event = Event::new(
            SOURCE,
            EventPayload::FusionSkipped {
                kind,
                sensor_id: sensor_id.to_string(),
                reason: reason.to_string(),
            },
        );
        self.bus.publish_to(&self.diagnostics_topic, event).is_ok()
    }

    /// Route an engine outcome to the matching topic.
    pub fn publish_outcome(&mut self, outcome: &FusionOutcome) -> bool {
        match outcome {
            FusionOutcome::Accepted(pose) => self.publish_pose(pose),
            FusionOutcome::Skipped {
                kind,
                sensor_id,
                reason,
            } => self.publish_skip(*kind, sensor_id, reason),
        }
    }

    /// Poses delivered to at least one subscriber.
    pub fn published(&self) -> u64 {
        self.published
    }
}
