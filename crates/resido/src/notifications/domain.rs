use chrono::{DateTime, FixedOffset, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::access::{AccessError, RowScoped};
use crate::error::{Classify, ErrorKind};
use crate::ids::{NotificationId, ResidentId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    Push,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    Pending,
    /// Claimed by a drain and handed to the transport.
    Queued,
    Sent,
    Failed,
}

/// Hours of the day (`start_hour` inclusive, `end_hour` exclusive) in which
/// an entry may be sent, read on the recipient's clock at `utc_offset_minutes`
/// from UTC. A window whose end is before its start wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendWindow {
    pub start_hour: u32,
    pub end_hour: u32,
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

impl SendWindow {
    pub const fn hours(start_hour: u32, end_hour: u32) -> Self {
        Self {
            start_hour,
            end_hour,
            utc_offset_minutes: 0,
        }
    }

    pub const fn business_hours() -> Self {
        Self::hours(9, 18)
    }

    pub const fn at_offset(mut self, utc_offset_minutes: i32) -> Self {
        self.utc_offset_minutes = utc_offset_minutes;
        self
    }

    /// Offsets outside +/-24h are read as UTC.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let hour = FixedOffset::east_opt(self.utc_offset_minutes.saturating_mul(60))
            .map_or_else(|| at.hour(), |offset| at.with_timezone(&offset).hour());
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEntry {
    pub id: NotificationId,
    pub channel: Channel,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    /// 1 is the most urgent.
    pub priority: u8,
    pub status: NotificationStatus,
    pub attempt_count: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub send_window: Option<SendWindow>,
    pub payload: Value,
    pub resident_id: Option<ResidentId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl RowScoped for NotificationEntry {
    fn resident_path(&self) -> Option<ResidentId> {
        self.resident_id
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewNotification {
    pub channel: Channel,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    #[serde(default = "NewNotification::default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub send_window: Option<SendWindow>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub resident_id: Option<ResidentId>,
}

impl NewNotification {
    pub const MIN_PRIORITY: u8 = 1;
    pub const MAX_PRIORITY: u8 = 3;

    fn default_priority() -> u8 {
        2
    }

    pub fn email(recipient: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            channel: Channel::Email,
            recipient: recipient.into(),
            subject: subject.into(),
            body: body.into(),
            priority: Self::default_priority(),
            send_window: None,
            payload: Value::Null,
            resident_id: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn within(mut self, window: SendWindow) -> Self {
        self.send_window = Some(window);
        self
    }

    pub fn for_resident(mut self, resident: ResidentId) -> Self {
        self.resident_id = Some(resident);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum NotificationError {
    #[error("notification {0} not found")]
    NotFound(NotificationId),
    #[error("notification {0} was modified concurrently")]
    VersionConflict(NotificationId),
    #[error("priority must be between 1 and 3, got {0}")]
    InvalidPriority(u8),
    #[error("a notification needs a recipient")]
    MissingRecipient,
    #[error(transparent)]
    Access(#[from] AccessError),
}

impl Classify for NotificationError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::VersionConflict(_) => ErrorKind::Conflict,
            Self::InvalidPriority(_) | Self::MissingRecipient => ErrorKind::Validation,
            Self::Access(err) => err.kind(),
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "notification_not_found",
            Self::VersionConflict(_) => "version_conflict",
            Self::InvalidPriority(_) => "invalid_priority",
            Self::MissingRecipient => "missing_recipient",
            Self::Access(err) => err.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, 15, 0).single().expect("valid time")
    }

    #[test]
    fn business_hours_exclude_the_evening() {
        let window = SendWindow::business_hours();
        assert!(window.contains(at(9)));
        assert!(window.contains(at(17)));
        assert!(!window.contains(at(18)));
        assert!(!window.contains(at(3)));
    }

    #[test]
    fn windows_can_wrap_midnight() {
        let night = SendWindow::hours(22, 6);
        assert!(night.contains(at(23)));
        assert!(night.contains(at(2)));
        assert!(!night.contains(at(12)));
    }

    #[test]
    fn windows_follow_the_recipient_clock() {
        let chicago = SendWindow::business_hours().at_offset(-6 * 60);
        assert!(!chicago.contains(at(10)));
        assert!(chicago.contains(at(16)));
        assert!(chicago.contains(at(23)));
        assert!(!chicago.contains(at(0)));

        let parsed: SendWindow = serde_json::from_str(r#"{"start_hour":9,"end_hour":18}"#).expect("window");
        assert_eq!(parsed, SendWindow::business_hours());
    }
}
