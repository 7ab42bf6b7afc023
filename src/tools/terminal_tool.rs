use crate::error::{AppError, CreateError};
use crate::events::{Event, EventBus, EventQuery, EventType, EventsPage};
use crate::session::{Created, Disposed, SessionInfo, SessionRegistry};
use crate::utils::ansi::{strip_ansi, tail_lines};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument};

#[derive(Debug, Default, Deserialize)]
pub struct CreateParams {
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub cwd: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub verbose: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SendParams {
    #[serde(rename = "terminalId", default, deserialize_with = "lenient_string")]
    pub terminal_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReadParams {
    #[serde(rename = "terminalId", default, deserialize_with = "lenient_string")]
    pub terminal_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub lines: Option<i64>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub strip_ansi: Option<bool>,
}

/// Parameters of the tools that only address a terminal (interrupt, clear).
#[derive(Debug, Default, Deserialize)]
pub struct TerminalIdParams {
    #[serde(rename = "terminalId", default, deserialize_with = "lenient_string")]
    pub terminal_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DisposeParams {
    #[serde(rename = "terminalId", default, deserialize_with = "lenient_string")]
    pub terminal_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub verbose: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsParams {
    #[serde(rename = "terminalId", default, deserialize_with = "lenient_string")]
    pub terminal_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub since_ts: Option<String>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub after: Option<i64>,
    #[serde(default, deserialize_with = "lenient_types")]
    pub types: Option<Vec<String>>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub contains: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub regex: Option<String>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub limit: Option<i64>,
}

/// Outcome of a successful send.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub terminal_id: String,
    /// Set when the send had no terminal id and created one.
    pub created: Option<Created>,
}

/// Tool arguments arrive either top-level or inside `payload`; payload keys win.
pub fn merge_payload(args: Value) -> Value {
    let Value::Object(mut map) = args else {
        return Value::Object(Default::default());
    };
    if let Some(Value::Object(payload)) = map.remove("payload") {
        for (key, value) in payload {
            map.insert(key, value);
        }
    }
    Value::Object(map)
}

fn required(value: &Option<String>, field: &'static str) -> Result<String, AppError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(AppError::InvalidInputArgument(field)),
    }
}

/// The operations behind the `terminal_*` tools.
pub struct TerminalTools {
    registry: Arc<SessionRegistry>,
    bus: Arc<EventBus>,
}

impl TerminalTools {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        let bus = Arc::clone(registry.bus());
        Self { registry, bus }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    #[instrument(skip(self, params), fields(name = ?params.name))]
    pub async fn create(&self, params: &CreateParams) -> Result<Created, CreateError> {
        self.registry
            .create(params.name.as_deref(), params.cwd.as_deref())
            .await
    }

    #[instrument(skip(self, params), fields(terminal_id = ?params.terminal_id))]
    pub async fn send(&self, params: &SendParams) -> Result<SendOutcome, AppError> {
        let text = params.text.clone().ok_or(AppError::InvalidInputArgument("text"))?;

        let (terminal_id, created) = match params.terminal_id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => (id.to_string(), None),
            None => {
                let created = self.registry.create(None, None).await.map_err(|e| {
                    AppError::BackendError(format!("failed to create terminal: {}", e.source))
                })?;
                info!(terminal_id = %created.terminal_id, "Created terminal for send without terminalId");
                (created.terminal_id.clone(), Some(created))
            }
        };

        let session = self.registry.get(&terminal_id).await?;
        let mut to_write = text.clone();
        if !to_write.ends_with('\n') {
            to_write.push('\n');
        }

        // Published before the write so the command precedes its own output.
        self.bus.publish(
            Event::new(terminal_id.clone(), EventType::Cmd)
                .with_text(text)
                .with_cwd(session.cwd())
                .with_pid(session.pid()),
        );
        session.write(to_write.into_bytes()).await?;
        debug!(terminal_id = %terminal_id, "Sent input to terminal");

        Ok(SendOutcome {
            terminal_id,
            created,
        })
    }

    #[instrument(skip(self, params), fields(terminal_id = ?params.terminal_id, lines = ?params.lines))]
    pub async fn read(&self, params: &ReadParams) -> Result<String, AppError> {
        let terminal_id = required(&params.terminal_id, "terminalId")?;
        let session = self.registry.get(&terminal_id).await?;

        let raw = session.snapshot(params.lines).await;
        if !params.strip_ansi.unwrap_or(true) {
            return Ok(raw);
        }
        let stripped = strip_ansi(&raw);
        // Stripping can turn carriage returns into extra lines.
        Ok(match params.lines {
            Some(n) => tail_lines(&stripped, n),
            None => stripped,
        })
    }

    #[instrument(skip(self, params), fields(terminal_id = ?params.terminal_id))]
    pub async fn interrupt(&self, params: &TerminalIdParams) -> Result<(), AppError> {
        let terminal_id = required(&params.terminal_id, "terminalId")?;
        let session = self.registry.get(&terminal_id).await?;
        session.interrupt().await?;
        self.bus.publish(
            Event::new(terminal_id, EventType::Interrupt)
                .with_cwd(session.cwd())
                .with_pid(session.pid()),
        );
        Ok(())
    }

    #[instrument(skip(self, params), fields(terminal_id = ?params.terminal_id))]
    pub async fn clear(&self, params: &TerminalIdParams) -> Result<(), AppError> {
        let terminal_id = required(&params.terminal_id, "terminalId")?;
        let session = self.registry.get(&terminal_id).await?;
        session.clear().await;
        self.bus
            .publish(Event::new(terminal_id, EventType::Clear).with_cwd(session.cwd()));
        Ok(())
    }

    #[instrument(skip(self, params), fields(terminal_id = ?params.terminal_id))]
    pub async fn dispose(&self, params: &DisposeParams) -> Result<Disposed, AppError> {
        let terminal_id = required(&params.terminal_id, "terminalId")?;
        self.registry.dispose(&terminal_id).await
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        self.registry.list().await
    }

    pub fn events(&self, params: &EventsParams) -> EventsPage {
        let query = EventQuery {
            terminal_id: params.terminal_id.clone().filter(|id| !id.is_empty()),
            types: params.types.clone().unwrap_or_default(),
            since_ts: params.since_ts.clone().filter(|ts| !ts.is_empty()),
            after: params.after,
            contains: params.contains.clone(),
            regex: params.regex.clone(),
            limit: params.limit,
        };
        self.bus.query(&query)
    }
}

// Agents send loosely typed arguments ("2" for 2, 1 for true). Values that do
// not fit are treated as absent.

fn lenient_string<'de, D: Deserializer<'de>>(de: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(de)? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    })
}

fn lenient_i64<'de, D: Deserializer<'de>>(de: D) -> Result<Option<i64>, D::Error> {
    Ok(match Value::deserialize(de)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_bool<'de, D: Deserializer<'de>>(de: D) -> Result<Option<bool>, D::Error> {
    Ok(match Value::deserialize(de)? {
        Value::Bool(b) => Some(b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" | "" => Some(false),
            _ => None,
        },
        _ => None,
    })
}

fn lenient_types<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Vec<String>>, D::Error> {
    Ok(match Value::deserialize(de)? {
        Value::Array(items) => Some(
            items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        ),
        Value::String(s) => Some(
            s.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect(),
        ),
        _ => None,
    })
}
