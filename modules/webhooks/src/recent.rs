use payment_contracts::WebhookEvent;
use std::collections::VecDeque;
use std::sync::Mutex;

const SIGNATURE_PREFIX: usize = 12;

/// Bounded log of the latest inbound callbacks, newest last. Diagnostics only.
pub struct RecentRequests {
    capacity: usize,
    entries: Mutex<VecDeque<WebhookEvent>>,
}

impl RecentRequests {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    pub fn record(&self, mut event: WebhookEvent) {
        event.signature = event.signature.map(|s| truncate(&s));
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(event);
    }

    /// Newest first
    pub fn snapshot(&self) -> Vec<WebhookEvent> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn truncate(signature: &str) -> String {
    match signature.char_indices().nth(SIGNATURE_PREFIX) {
        Some((idx, _)) => format!("{}...", &signature[..idx]),
        None => signature.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn event(n: u32, signature: Option<&str>) -> WebhookEvent {
        WebhookEvent {
            id: Uuid::new_v4(),
            provider: "paystack".to_string(),
            event_type: format!("charge.success#{n}"),
            payload: json!({"n": n}),
            received_at: Utc::now(),
            signature: signature.map(str::to_string),
        }
    }

    #[test]
    fn test_ring_buffer_keeps_newest() {
        let recent = RecentRequests::new(3);
        for n in 0..5 {
            recent.record(event(n, None));
        }
        let snap = recent.snapshot();
        assert_eq!(snap.len(), 3);
        assert_eq!(snap[0].payload["n"], 4);
        assert_eq!(snap[2].payload["n"], 2);
    }

    #[test]
    fn test_signature_is_truncated() {
        let recent = RecentRequests::new(2);
        recent.record(event(0, Some("a3f9c2d1e0b4a3f9c2d1e0b4a3f9c2d1e0b4")));
        recent.record(event(1, Some("short")));
        let snap = recent.snapshot();
        assert_eq!(snap[1].signature.as_deref(), Some("a3f9c2d1e0b4..."));
        assert_eq!(snap[0].signature.as_deref(), Some("short"));
    }
}
