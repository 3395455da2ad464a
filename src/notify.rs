use chrono::{NaiveDate, NaiveTime};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use ulid::Ulid;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Confirmed,
    Cancelled,
}

/// Payload published after a successful create/cancel. Delivery is
/// fire-and-forget: nothing here is awaited for correctness and a failed
/// send never rolls back the reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub reservation_id: Ulid,
    pub member_id: Ulid,
    pub resource_name: String,
    pub date: NaiveDate,
    pub start: NaiveTime,
}

impl Notice {
    pub fn confirmed(
        reservation_id: Ulid,
        member_id: Ulid,
        resource_name: &str,
        date: NaiveDate,
        start: NaiveTime,
    ) -> Self {
        Self {
            kind: NoticeKind::Confirmed,
            reservation_id,
            member_id,
            resource_name: resource_name.to_string(),
            date,
            start,
        }
    }

    pub fn cancelled(
        reservation_id: Ulid,
        member_id: Ulid,
        resource_name: &str,
        date: NaiveDate,
        start: NaiveTime,
    ) -> Self {
        Self {
            kind: NoticeKind::Cancelled,
            reservation_id,
            member_id,
            resource_name: resource_name.to_string(),
            date,
            start,
        }
    }

    /// JSON payload for wire-level consumers.
    pub fn to_payload(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Broadcast hub, one channel per resource.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self { channels: DashMap::new() }
    }

    /// Subscribe to notices for a resource. Creates the channel if needed.
    pub fn subscribe(&self, resource_id: Ulid) -> broadcast::Receiver<Notice> {
        let sender = self
            .channels
            .entry(resource_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notice. No-op if nobody is listening.
    pub fn send(&self, resource_id: Ulid, notice: &Notice) {
        if let Some(sender) = self.channels.get(&resource_id) {
            let _ = sender.send(notice.clone());
        }
    }

    /// Remove a channel (e.g. when a resource is retired).
    pub fn remove(&self, resource_id: &Ulid) {
        self.channels.remove(resource_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn notice(kind: NoticeKind) -> Notice {
        Notice {
            kind,
            reservation_id: Ulid::new(),
            member_id: Ulid::new(),
            resource_name: "Lane 1".into(),
            date: NaiveDate::from_ymd_opt(2026, 8, 10).unwrap(),
            start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        let mut rx = hub.subscribe(rid);

        let n = notice(NoticeKind::Confirmed);
        hub.send(rid, &n);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, n);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        // No subscriber — should not panic
        hub.send(Ulid::new(), &notice(NoticeKind::Cancelled));
    }

    #[test]
    fn payload_is_json_with_kind() {
        let n = notice(NoticeKind::Cancelled);
        let payload = n.to_payload();
        assert!(payload.contains("\"cancelled\""));
        assert!(payload.contains("Lane 1"));
    }
}
