use super::query::CompiledQuery;
use super::{now_ts, Event, EventQuery, EventsPage};
use crate::utils::event_log::EventLog;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::trace;

/// Process-wide, sequence-ordered event stream.
///
/// Keeps the most recent `capacity` events in memory for querying and mirrors
/// every event to an optional durable [`EventLog`].
#[derive(Debug)]
pub struct EventBus {
    window: Mutex<VecDeque<Event>>,
    capacity: usize,
    /// Last assigned seq. Only bumped while `window` is locked.
    seq: AtomicU64,
    log: Option<EventLog>,
}

impl EventBus {
    pub fn new(capacity: usize, log: Option<EventLog>) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            seq: AtomicU64::new(0),
            log,
        }
    }

    /// Stamps and records `event`, returning its sequence number.
    pub fn publish(&self, mut event: Event) -> u64 {
        if event.ts.is_empty() {
            event.ts = now_ts();
        }

        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        event.seq = seq;
        if window.len() >= self.capacity {
            window.pop_front();
        }
        // Queued under the lock so the durable log sees events in seq order.
        // Appending never touches the disk itself.
        if let Some(log) = &self.log {
            log.append(&event);
        }
        trace!(seq, terminal_id = %event.terminal_id, kind = %event.kind, "Published event");
        window.push_back(event);
        seq
    }

    /// Waits for the durable log to catch up with everything published so far.
    pub async fn flush_log(&self) {
        if let Some(log) = &self.log {
            log.flush().await;
        }
    }

    pub fn query(&self, query: &EventQuery) -> EventsPage {
        let compiled = CompiledQuery::new(query);
        let window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        let oldest_seq = window.front().map(|e| e.seq);
        let newest_seq = window.back().map(|e| e.seq);

        let limit = compiled.limit();
        if limit <= 0 {
            return EventsPage::empty(compiled.after(), oldest_seq, newest_seq);
        }
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);

        let events: Vec<Event> = window
            .iter()
            .filter(|e| compiled.matches(e))
            .take(limit)
            .cloned()
            .collect();
        drop(window);

        let next_cursor = events.last().map(|e| e.seq).or(compiled.after());
        let has_more = match (newest_seq, next_cursor) {
            (Some(newest), Some(cursor)) => newest > cursor,
            _ => false,
        };
        let truncated = match (compiled.after(), oldest_seq) {
            (Some(after), Some(oldest)) => after + 1 < oldest,
            _ => false,
        };

        EventsPage {
            count: events.len(),
            events,
            next_cursor,
            has_more,
            truncated,
            oldest_seq,
            newest_seq,
        }
    }

    pub fn oldest_seq(&self) -> Option<u64> {
        self.window
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .front()
            .map(|e| e.seq)
    }

    pub fn newest_seq(&self) -> Option<u64> {
        self.window
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .back()
            .map(|e| e.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use std::sync::Arc;

    fn stdout(id: &str, text: &str) -> Event {
        Event::new(id, EventType::Stdout).with_text(text)
    }

    #[test]
    fn seq_starts_at_one_and_ts_is_filled() {
        let bus = EventBus::new(10, None);
        assert_eq!(bus.publish(stdout("a", "x")), 1);
        assert_eq!(bus.publish(stdout("a", "y")), 2);
        let page = bus.query(&EventQuery::default());
        assert_eq!(page.count, 2);
        assert!(page.events.iter().all(|e| e.ts.ends_with('Z')));
    }

    #[test]
    fn window_evicts_oldest_and_reports_truncation() {
        let bus = EventBus::new(3, None);
        for i in 0..5 {
            bus.publish(stdout("a", &format!("line {i}")));
        }
        assert_eq!(bus.oldest_seq(), Some(3));
        assert_eq!(bus.newest_seq(), Some(5));

        let page = bus.query(&EventQuery {
            after: Some(1),
            ..Default::default()
        });
        assert!(page.truncated);
        assert_eq!(page.events.first().map(|e| e.seq), Some(3));

        let page = bus.query(&EventQuery {
            after: Some(2),
            ..Default::default()
        });
        assert!(!page.truncated);
    }

    #[test]
    fn cursor_just_before_the_window_is_not_truncated() {
        let bus = EventBus::new(4, None);
        for i in 0..10 {
            bus.publish(stdout("a", &format!("line {i}")));
        }
        assert_eq!(bus.oldest_seq(), Some(7));

        // Nothing between seq 6 and the window was lost.
        let page = bus.query(&EventQuery {
            after: Some(6),
            ..Default::default()
        });
        assert!(!page.truncated);
        assert_eq!(page.events.first().map(|e| e.seq), Some(7));

        // Seq 6 itself was evicted.
        let page = bus.query(&EventQuery {
            after: Some(5),
            ..Default::default()
        });
        assert!(page.truncated);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_publishers_log_in_seq_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let bus = Arc::new(EventBus::new(10_000, Some(EventLog::spawn(&path, 0))));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let bus = Arc::clone(&bus);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        bus.publish(stdout(&format!("t{t}"), &i.to_string()));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        bus.flush_log().await;

        let content = std::fs::read_to_string(&path).unwrap();
        let seqs: Vec<u64> = content
            .lines()
            .map(|line| serde_json::from_str::<Event>(line).unwrap().seq)
            .collect();
        assert_eq!(seqs, (1..=400).collect::<Vec<u64>>());
    }

    #[test]
    fn pagination_continues_after_cursor() {
        let bus = EventBus::new(100, None);
        for i in 0..6 {
            bus.publish(stdout("a", &format!("PG{i}")));
        }
        let first = bus.query(&EventQuery {
            limit: Some(3),
            ..Default::default()
        });
        assert_eq!(first.count, 3);
        assert!(first.has_more);
        assert_eq!(first.next_cursor, Some(3));

        let second = bus.query(&EventQuery {
            after: first.next_cursor.map(|c| c as i64),
            limit: Some(3),
            ..Default::default()
        });
        assert_eq!(second.events.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![4, 5, 6]);
        assert!(!second.has_more);
        assert_eq!(second.next_cursor, Some(6));
    }

    #[test]
    fn non_positive_limit_is_empty() {
        let bus = EventBus::new(10, None);
        bus.publish(stdout("a", "x"));
        let page = bus.query(&EventQuery {
            limit: Some(0),
            after: Some(4),
            ..Default::default()
        });
        assert_eq!(page.count, 0);
        assert!(page.events.is_empty());
        assert_eq!(page.next_cursor, Some(4));
        assert_eq!(page.newest_seq, Some(1));
    }

    #[test]
    fn empty_result_keeps_original_cursor() {
        let bus = EventBus::new(10, None);
        bus.publish(stdout("a", "x"));
        let page = bus.query(&EventQuery {
            terminal_id: Some("nobody".into()),
            after: Some(0),
            ..Default::default()
        });
        assert_eq!(page.count, 0);
        assert_eq!(page.next_cursor, Some(0));
        assert!(page.has_more);

        let fresh = EventBus::new(10, None).query(&EventQuery::default());
        assert_eq!(fresh.next_cursor, None);
        assert_eq!(fresh.oldest_seq, None);
        assert!(!fresh.has_more);
        assert!(!fresh.truncated);
    }

    #[test]
    fn page_serializes_camel_case() {
        let bus = EventBus::new(10, None);
        bus.publish(stdout("a", "x"));
        let value = serde_json::to_value(bus.query(&EventQuery::default())).unwrap();
        for key in ["events", "count", "nextCursor", "hasMore", "truncated", "oldestSeq", "newestSeq"] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn concurrent_publishers_get_unique_increasing_seqs() {
        let bus = Arc::new(EventBus::new(10_000, None));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let bus = Arc::clone(&bus);
                std::thread::spawn(move || {
                    (0..200)
                        .map(|i| bus.publish(stdout(&format!("t{t}"), &i.to_string())))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 1600);

        let page = bus.query(&EventQuery {
            limit: Some(10_000),
            ..Default::default()
        });
        assert!(page.events.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[tokio::test]
    async fn events_are_mirrored_to_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let bus = EventBus::new(10, Some(EventLog::spawn(&path, 0)));
        bus.publish(stdout("a", "x"));
        bus.publish(Event::new("a", EventType::Clear));
        bus.flush_log().await;
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("\"type\":\"clear\""));
    }
}
