//! Terminal activity events.
//!
//! Every lifecycle step of a session (creation, commands, output, interrupts,
//! clears, disposal) is published as an [`Event`] on the [`EventBus`], which
//! orders them with a process-wide sequence number.

pub mod bus;
pub mod query;

pub use bus::EventBus;
pub use query::{EventQuery, EventsPage};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Create,
    Cmd,
    Stdout,
    Clear,
    Interrupt,
    Dispose,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Create => "create",
            EventType::Cmd => "cmd",
            EventType::Stdout => "stdout",
            EventType::Clear => "clear",
            EventType::Interrupt => "interrupt",
            EventType::Dispose => "dispose",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the activity log. Serialized field names are part of the
/// durable log format and of the `terminal_events` tool output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Assigned by [`EventBus::publish`]; zero until then.
    pub seq: u64,
    /// ISO-8601 UTC with millisecond precision. Filled at publish time when empty.
    pub ts: String,
    pub terminal_id: String,
    #[serde(rename = "type")]
    pub kind: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl Event {
    pub fn new(terminal_id: impl Into<String>, kind: EventType) -> Self {
        Self {
            seq: 0,
            ts: String::new(),
            terminal_id: terminal_id.into(),
            kind,
            text: None,
            cwd: None,
            pid: None,
            exit_code: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_pid(mut self, pid: Option<u32>) -> Self {
        self.pid = pid;
        self
    }

    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }

    /// The field `contains` and `regex` filters look at: the text, or the cwd
    /// for events that carry no text (create, clear, interrupt, dispose).
    pub fn search_text(&self) -> Option<&str> {
        self.text.as_deref().or(self.cwd.as_deref())
    }
}

/// Current time in the event timestamp format, e.g. `2024-05-01T12:00:00.123Z`.
pub fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_wire_names() {
        let mut event = Event::new("mcp-calm-fox", EventType::Dispose)
            .with_cwd("/home/dev")
            .with_exit_code(Some(0));
        event.seq = 7;
        event.ts = "2024-05-01T12:00:00.123Z".into();
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["terminalId"], "mcp-calm-fox");
        assert_eq!(value["type"], "dispose");
        assert_eq!(value["exitCode"], 0);
        assert_eq!(value["seq"], 7);
        assert!(value.get("text").is_none());
        assert!(value.get("pid").is_none());
    }

    #[test]
    fn timestamp_has_millisecond_precision() {
        let ts = now_ts();
        assert!(ts.ends_with('Z'), "{ts}");
        let fraction = ts.rsplit('.').next().unwrap();
        assert_eq!(fraction.len(), 4, "{ts}"); // "123Z"
    }

    #[test]
    fn search_text_falls_back_to_cwd() {
        let create = Event::new("t", EventType::Create).with_cwd("/srv/app");
        assert_eq!(create.search_text(), Some("/srv/app"));
        let cmd = Event::new("t", EventType::Cmd).with_text("ls").with_cwd("/srv/app");
        assert_eq!(cmd.search_text(), Some("ls"));
    }
}
