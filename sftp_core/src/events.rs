//! Events published by the registry and the transfer engine, and their
//! mapping to user-facing notifications.

use serde::{Deserialize, Serialize};

use crate::core::transfer::TransferDirection;

/// Session lifecycle, as broadcast by the connection registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum LifecycleEvent {
    Connected { profile_id: String },
    Disconnected { profile_id: String },
    Failed { profile_id: String, reason: String },
}

impl LifecycleEvent {
    pub fn profile_id(&self) -> &str {
        match self {
            LifecycleEvent::Connected { profile_id }
            | LifecycleEvent::Disconnected { profile_id }
            | LifecycleEvent::Failed { profile_id, .. } => profile_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum TransferEvent {
    Started {
        transfer_id: String,
        profile_id: String,
        direction: TransferDirection,
        name: String,
        total: u64,
        resumable_offset: u64,
    },
    Progress {
        transfer_id: String,
        name: String,
        bytes_transferred: u64,
        total: u64,
        resumable_offset: u64,
    },
    Paused {
        transfer_id: String,
        resumable_offset: u64,
    },
    Completed {
        transfer_id: String,
        name: String,
        total: u64,
    },
    Failed {
        transfer_id: String,
        profile_id: String,
        offset: u64,
        reason: String,
    },
    Cancelled {
        transfer_id: String,
    },
}

impl TransferEvent {
    pub fn transfer_id(&self) -> &str {
        match self {
            TransferEvent::Started { transfer_id, .. }
            | TransferEvent::Progress { transfer_id, .. }
            | TransferEvent::Paused { transfer_id, .. }
            | TransferEvent::Completed { transfer_id, .. }
            | TransferEvent::Failed { transfer_id, .. }
            | TransferEvent::Cancelled { transfer_id } => transfer_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferEvent::Completed { .. }
                | TransferEvent::Failed { .. }
                | TransferEvent::Cancelled { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Success,
    Error,
    Warning,
    Info,
}

/// A toast for the notification layer.
///
/// Persistent notifications stay until a later notification with the same
/// id replaces them. Others disappear after `duration` milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default = "default_duration")]
    pub duration: u64,
    #[serde(default)]
    pub persistent: bool,
}

fn default_duration() -> u64 {
    Notification::DEFAULT_DURATION_MS
}

impl Notification {
    pub const DEFAULT_DURATION_MS: u64 = 1000;

    /// Timed notification with a fresh id.
    pub fn new(kind: NotificationKind, title: impl Into<String>, message: Option<String>) -> Self {
        Self::keyed(new_id(), kind, title, message)
    }

    /// Timed notification under a caller-chosen id, replacing any previous one.
    pub fn keyed(
        id: impl Into<String>,
        kind: NotificationKind,
        title: impl Into<String>,
        message: Option<String>,
    ) -> Self {
        Notification {
            id: id.into(),
            kind,
            title: title.into(),
            message,
            duration: Self::DEFAULT_DURATION_MS,
            persistent: false,
        }
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn with_duration(mut self, millis: u64) -> Self {
        self.duration = millis;
        self
    }
}

fn new_id() -> String {
    format!(
        "notification_{}_{}",
        chrono::Utc::now().timestamp_millis(),
        &uuid::Uuid::new_v4().simple().to_string()[..9]
    )
}

impl From<&LifecycleEvent> for Notification {
    fn from(event: &LifecycleEvent) -> Self {
        match event {
            LifecycleEvent::Connected { profile_id } => Notification::new(
                NotificationKind::Success,
                "Connected",
                Some(format!("Session {profile_id} is ready")),
            ),
            LifecycleEvent::Disconnected { profile_id } => Notification::new(
                NotificationKind::Info,
                "Disconnected",
                Some(format!("Session {profile_id} closed")),
            ),
            LifecycleEvent::Failed { profile_id, reason } => Notification::new(
                NotificationKind::Error,
                "Connection failed",
                Some(format!("{profile_id}: {reason}")),
            )
            .with_duration(5000),
        }
    }
}

/// Progress and pause keep one persistent toast per transfer up to date.
/// Terminal events replace it with a timed one under the same id.
impl From<&TransferEvent> for Notification {
    fn from(event: &TransferEvent) -> Self {
        let id = event.transfer_id().to_string();
        match event {
            TransferEvent::Started { name, total, .. } => Notification::keyed(
                id,
                NotificationKind::Info,
                format!("Transferring {name}"),
                Some(format!("0 / {total} bytes")),
            )
            .persistent(),
            TransferEvent::Progress {
                name,
                bytes_transferred,
                total,
                ..
            } => Notification::keyed(
                id,
                NotificationKind::Info,
                format!("Transferring {name}"),
                Some(format!("{}% ({bytes_transferred} / {total} bytes)", percent(*bytes_transferred, *total))),
            )
            .persistent(),
            TransferEvent::Paused {
                resumable_offset, ..
            } => Notification::keyed(
                id,
                NotificationKind::Warning,
                "Transfer paused",
                Some(format!("resumable at byte {resumable_offset}")),
            )
            .persistent(),
            TransferEvent::Completed { name, total, .. } => Notification::keyed(
                id,
                NotificationKind::Success,
                "Transfer complete",
                Some(format!("{name} ({total} bytes)")),
            )
            .with_duration(3000),
            TransferEvent::Failed { offset, reason, .. } => Notification::keyed(
                id,
                NotificationKind::Error,
                "Transfer failed",
                Some(format!("at byte {offset}: {reason}")),
            )
            .with_duration(5000),
            TransferEvent::Cancelled { .. } => {
                Notification::keyed(id, NotificationKind::Warning, "Transfer cancelled", None)
            }
        }
    }
}

fn percent(done: u64, total: u64) -> u64 {
    if total == 0 {
        100
    } else {
        done.saturating_mul(100) / total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_serializes_kind_as_type() {
        let n = Notification::keyed("t1", NotificationKind::Error, "Oops", None);
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["duration"], 1000);
        assert_eq!(json["persistent"], false);
        assert!(json.get("message").is_none());
    }

    #[test]
    fn progress_updates_one_persistent_notification_per_transfer() {
        let progress = |done| TransferEvent::Progress {
            transfer_id: "abc".into(),
            name: "a.bin".into(),
            bytes_transferred: done,
            total: 200,
            resumable_offset: done,
        };
        let first = Notification::from(&progress(50));
        let second = Notification::from(&progress(100));
        assert_eq!(first.id, second.id);
        assert!(second.persistent);
        assert_eq!(second.message.as_deref(), Some("50% (100 / 200 bytes)"));

        let done = Notification::from(&TransferEvent::Completed {
            transfer_id: "abc".into(),
            name: "a.bin".into(),
            total: 200,
        });
        assert_eq!(done.id, "abc");
        assert!(!done.persistent);
    }

    #[test]
    fn lifecycle_events_are_camel_case_tagged() {
        let event = LifecycleEvent::Failed {
            profile_id: "p".into(),
            reason: "boom".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "failed");
        assert_eq!(json["profileId"], "p");
    }
}
