//! Per-device topic names.

/// Builds `telemetry/`, `status/` and `last/` topics for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBuilder {
    prefix: Option<String>,
    device_id: String,
}

impl TopicBuilder {
    pub fn new(prefix: Option<&str>, device_id: impl Into<String>) -> Self {
        Self {
            prefix: prefix
                .map(|p| p.trim_matches('/').to_string())
                .filter(|p| !p.is_empty()),
            device_id: device_id.into(),
        }
    }

    fn topic(&self, kind: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{kind}/{}", self.device_id),
            None => format!("{kind}/{}", self.device_id),
        }
    }

    /// Live and drained records.
    pub fn telemetry(&self) -> String {
        self.topic("telemetry")
    }

    /// Retained "online"/"offline", also the last-will topic.
    pub fn status(&self) -> String {
        self.topic("status")
    }

    /// Retained latest live snapshot.
    pub fn last(&self) -> String {
        self.topic("last")
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topics_without_prefix() {
        let topics = TopicBuilder::new(None, "rig-01");
        assert_eq!(topics.telemetry(), "telemetry/rig-01");
        assert_eq!(topics.status(), "status/rig-01");
        assert_eq!(topics.last(), "last/rig-01");
    }

    #[test]
    fn test_topics_with_prefix() {
        let topics = TopicBuilder::new(Some("/fleet/eu/"), "rig-01");
        assert_eq!(topics.telemetry(), "fleet/eu/telemetry/rig-01");
        assert_eq!(TopicBuilder::new(Some(""), "x").status(), "status/x");
    }
}
