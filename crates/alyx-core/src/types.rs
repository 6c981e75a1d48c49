use serde::{Deserialize, Serialize};

/// Discriminator for everything flowing through the bus.
///
/// The type selects which concrete payload shape a publisher is expected to
/// produce; storage treats the payload as an opaque JSON blob either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Http,
    Webhook,
    Database,
    Auth,
    Schedule,
    Custom,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventType::Http => "http",
            EventType::Webhook => "webhook",
            EventType::Database => "database",
            EventType::Auth => "auth",
            EventType::Schedule => "schedule",
            EventType::Custom => "custom",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "http" => Ok(EventType::Http),
            "webhook" => Ok(EventType::Webhook),
            "database" => Ok(EventType::Database),
            "auth" => Ok(EventType::Auth),
            "schedule" => Ok(EventType::Schedule),
            "custom" => Ok(EventType::Custom),
            other => Err(format!("unknown event type: {other}")),
        }
    }
}

/// New UUIDv7 string. Time-ordered, so lexicographic id tiebreaks follow
/// creation order.
pub fn new_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// Current instant as the RFC 3339 UTC string every timestamp column uses.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
