pub const MQTT_ROOT_TOPIC: &str = "sensors/smoke";

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";

pub fn normalize_root_topic(topic: &str) -> String {
    let trimmed = topic.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        MQTT_ROOT_TOPIC.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Retained availability topic (`online` / `offline` last will).
pub fn status_topic(root: &str) -> String {
    format!("{root}/status")
}

/// Retained reporter diagnostics topic.
pub fn state_topic(root: &str) -> String {
    format!("{root}/state")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_subtopics_from_root() {
        assert_eq!(status_topic(MQTT_ROOT_TOPIC), "sensors/smoke/status");
        assert_eq!(state_topic("kitchen/smoke"), "kitchen/smoke/state");
    }

    #[test]
    fn blank_root_falls_back_to_default() {
        assert_eq!(normalize_root_topic(" / "), "sensors/smoke".to_string());
        assert_eq!(normalize_root_topic("a/b//"), "a/b");
    }
}
