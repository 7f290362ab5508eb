//! JSON-lines event feed.
//!
//! Each line is one serialized [`Event`]. Input payloads are routed to the
//! configured topic for their kind; output payloads (poses, skip notices)
//! are ignored so a recorded output stream can be replayed unchanged.

use std::io::BufRead;
use std::path::Path;
use std::time::Duration;

use posefuse_middleware::EventBus;
use posefuse_runtime::config::TopicsConfig;
use posefuse_types::{Event, EventPayload};
use tracing::{debug, warn};

/// Topic an event should be published on, or `None` for output payloads.
pub fn topic_for<'a>(payload: &EventPayload, topics: &'a TopicsConfig) -> Option<&'a str> {
    match payload {
        EventPayload::TagDetections(_) => Some(&topics.tag_input),
        EventPayload::Odometry(_) => Some(&topics.odometry_input),
        EventPayload::Imu(_) => Some(&topics.imu_input),
        EventPayload::SetPosition(_) => Some(&topics.set_position),
        EventPayload::RobotPosition(_) | EventPayload::FusionSkipped { .. } => None,
    }
}

/// Parse one line. Blank lines and `#` comments yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<Event>, serde_json::Error> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    serde_json::from_str(trimmed).map(Some)
}

/// Read every event from a JSON-lines file. Malformed lines are an error
/// naming the line number.
pub fn read_events(path: &Path) -> Result<Vec<Event>, String> {
    let file = std::fs::File::open(path)
        .map_err(|e| format!("Failed to open replay file {}: {}", path.display(), e))?;
    let mut events = Vec::new();
    for (n, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
        match parse_line(&line) {
            Ok(Some(event)) => events.push(event),
            Ok(None) => {}
            Err(e) => return Err(format!("{}:{}: {}", path.display(), n + 1, e)),
        }
    }
    Ok(events)
}

/// Publish `events` in order.
///
/// With `speed > 0` the gaps between sensor timestamps are reproduced,
/// scaled by `1 / speed`; with `speed == 0` events are sent back to back.
/// Returns the number of events delivered to a subscriber.
pub async fn replay(bus: &EventBus, topics: &TopicsConfig, events: Vec<Event>, speed: f64) -> usize {
    let mut delivered = 0;
    let mut previous: Option<f64> = None;
    for event in events {
        let Some(topic) = topic_for(&event.payload, topics) else {
            continue;
        };
        if let Some(gap) = pacing(previous, event.payload.sensor_timestamp(), speed) {
            tokio::time::sleep(gap).await;
        }
        if let Some(t) = event.payload.sensor_timestamp() {
            previous = Some(t);
        }
        match bus.publish_to(topic, event) {
            Ok(_) => delivered += 1,
            Err(e) => debug!(topic, error = %e, "replayed event not delivered"),
        }
        tokio::task::yield_now().await;
    }
    delivered
}

/// Sleep needed before an event stamped `next` when the previous one was
/// stamped `previous`.
fn pacing(previous: Option<f64>, next: Option<f64>, speed: f64) -> Option<Duration> {
    if !(speed > 0.0) {
        return None;
    }
    let gap = (next? - previous?) / speed;
    (gap.is_finite() && gap > 0.0).then(|| Duration::from_secs_f64(gap))
}

/// Publish events read line by line from `reader` as they arrive. Bad lines
/// are logged and skipped. Returns the number of events delivered.
pub async fn feed_lines<R>(bus: &EventBus, topics: &TopicsConfig, reader: R) -> usize
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    use tokio::io::AsyncBufReadExt;

    let mut delivered = 0;
    let mut lines = reader.lines();
    let mut n = 0usize;
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "input stream failed");
                break;
            }
        };
        n += 1;
        let event = match parse_line(&line) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                warn!(line = n, error = %e, "skipping malformed input line");
                continue;
            }
        };
        if let Some(topic) = topic_for(&event.payload, topics) {
            match bus.publish_to(topic, event) {
                Ok(_) => delivered += 1,
                Err(e) => debug!(topic, error = %e, "input event not delivered"),
            }
        }
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use posefuse_types::{OdometryReading, RobotPose};

    fn odometry_line(t: f64) -> String {
        let event = Event::new(
            "test",
            EventPayload::Odometry(OdometryReading {
                sensor_id: "swerve".into(),
                timestamp: t,
                position: [0.0, 0.0],
                velocity: [0.0, 0.0],
                heading_rad: 0.0,
            }),
        );
        serde_json::to_string(&event).expect("serialize")
    }

    #[test]
    fn blank_and_comment_lines_are_skipped() {
        assert!(parse_line("").unwrap().is_none());
        assert!(parse_line("   ").unwrap().is_none());
        assert!(parse_line("# recorded on the practice field").unwrap().is_none());
        assert!(parse_line("{not json").is_err());
        assert!(parse_line(&odometry_line(1.0)).unwrap().is_some());
    }

    #[test]
    fn output_payloads_have_no_input_topic() {
        let topics = TopicsConfig::default();
        let pose = EventPayload::RobotPosition(RobotPose {
            sequence: 1,
            timestamp: 0.0,
            x: 0.0,
            y: 0.0,
            vx: 0.0,
            vy: 0.0,
            theta_rad: 0.0,
            direction: [1.0, 0.0],
            uncertainty: 0.0,
            covariance: Vec::new(),
            strategy: "kalman".into(),
        });
        assert_eq!(topic_for(&pose, &topics), None);
    }

    #[test]
    fn pacing_scales_sensor_gaps() {
        assert_eq!(pacing(Some(1.0), Some(1.5), 1.0), Some(Duration::from_millis(500)));
        assert_eq!(pacing(Some(1.0), Some(1.5), 2.0), Some(Duration::from_millis(250)));
        assert_eq!(pacing(Some(1.0), Some(1.5), 0.0), None);
        assert_eq!(pacing(None, Some(1.5), 1.0), None);
        assert_eq!(pacing(Some(2.0), Some(1.5), 1.0), None);
    }

    #[test]
    fn read_events_reports_bad_line_number() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("run.jsonl");
        std::fs::write(&path, format!("{}\n\nnope\n", odometry_line(0.0))).expect("write");
        let err = read_events(&path).unwrap_err();
        assert!(err.ends_with(&format!(":3: {}", parse_line("nope").unwrap_err())));
    }

    #[tokio::test]
    async fn replay_routes_events_to_topics() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::new(16);
        let topics = TopicsConfig::default();
        let mut odom = bus.subscribe_to(&topics.odometry_input);

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("run.jsonl");
        std::fs::write(&path, format!("{}\n{}\n", odometry_line(0.0), odometry_line(0.001)))?;
        let events = read_events(&path)?;
        assert_eq!(replay(&bus, &topics, events, 0.0).await, 2);

        for expected in [0.0, 0.001] {
            match odom.recv().await?.payload {
                EventPayload::Odometry(r) => assert_eq!(r.timestamp, expected),
                other => panic!("unexpected payload {other:?}"),
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn feed_lines_skips_malformed_input() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::new(16);
        let topics = TopicsConfig::default();
        let mut odom = bus.subscribe_to(&topics.odometry_input);

        let input = format!("garbage\n{}\n", odometry_line(2.0));
        let delivered = feed_lines(&bus, &topics, tokio::io::BufReader::new(input.as_bytes())).await;
        assert_eq!(delivered, 1);
        assert!(matches!(odom.recv().await?.payload, EventPayload::Odometry(_)));
        Ok(())
    }
}
