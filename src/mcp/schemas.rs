use serde_json::{json, Map, Value};

// Helper to create a JSON schema property
fn create_prop(type_str: &str, description: &str) -> Value {
    json!({
        "type": type_str,
        "description": description
    })
}

fn create_prop_with_default_bool(type_str: &str, description: &str, default_val: bool) -> Value {
    json!({
        "type": type_str,
        "description": description,
        "default": default_val
    })
}

fn create_prop_with_default_int(type_str: &str, description: &str, default_val: i64) -> Value {
    json!({
        "type": type_str,
        "description": description,
        "default": default_val
    })
}

fn create_array_prop(item_type_str: &str, description: &str) -> Value {
    json!({
        "type": "array",
        "items": { "type": item_type_str },
        "description": description
    })
}

const TERMINAL_ID_DESCRIPTION: &str = "Terminal id returned by terminal_create.";

/// Builds an object schema. Every tool also accepts the same fields nested in
/// `payload`, which take precedence over top-level ones.
fn input_schema(required: &[&str], properties: Vec<(&str, Value)>) -> Value {
    let mut props: Map<String, Value> = properties
        .into_iter()
        .map(|(name, schema)| (name.to_string(), schema))
        .collect();
    let payload_props = Value::Object(props.clone());
    props.insert(
        "payload".to_string(),
        json!({
            "type": "object",
            "description": "Alternative way to pass the same arguments. Fields here override top-level ones.",
            "properties": payload_props
        }),
    );
    json!({
        "type": "object",
        "properties": props,
        "required": required
    })
}

pub fn terminal_create_schema() -> Value {
    input_schema(
        &[],
        vec![
            ("name", create_prop("string", "Terminal id to use. A name like mcp-calm-otter is generated when omitted; a random suffix is added if it is taken.")),
            ("cwd", create_prop("string", "Working directory. Defaults to the home directory; ~ is expanded.")),
            ("verbose", create_prop_with_default_bool("boolean", "Also return the shell pid and backend type.", false)),
        ],
    )
}

pub fn terminal_send_schema() -> Value {
    input_schema(
        &[],
        vec![
            ("terminalId", create_prop("string", "Target terminal. When omitted a new terminal is created and its id returned.")),
            ("text", create_prop("string", "Text to send. A trailing newline is added if missing. Required.")),
        ],
    )
}

pub fn terminal_read_schema() -> Value {
    input_schema(
        &[],
        vec![
            ("terminalId", create_prop("string", TERMINAL_ID_DESCRIPTION)),
            ("lines", create_prop("integer", "Only return the last N lines. 0 or less returns nothing.")),
            ("strip_ansi", create_prop_with_default_bool("boolean", "Remove escape sequences and control characters.", true)),
        ],
    )
}

pub fn terminal_id_only_schema() -> Value {
    input_schema(&[], vec![("terminalId", create_prop("string", TERMINAL_ID_DESCRIPTION))])
}

pub fn terminal_dispose_schema() -> Value {
    input_schema(
        &[],
        vec![
            ("terminalId", create_prop("string", TERMINAL_ID_DESCRIPTION)),
            ("verbose", create_prop_with_default_bool("boolean", "Return {terminalId, disposed, exitCode} instead of an empty string.", false)),
        ],
    )
}

pub fn terminal_list_schema() -> Value {
    input_schema(&[], vec![])
}

pub fn terminal_events_schema() -> Value {
    input_schema(
        &[],
        vec![
            ("terminalId", create_prop("string", "Only events of this terminal.")),
            ("since_ts", create_prop("string", "Only events with a timestamp after this ISO-8601 value.")),
            ("after", create_prop("integer", "Only events with seq greater than this cursor. Pass the previous nextCursor to page.")),
            ("types", create_array_prop("string", "Event types to include: create, cmd, stdout, clear, interrupt, dispose.")),
            ("contains", create_prop("string", "Case-insensitive substring of the event text (or cwd when there is no text).")),
            ("regex", create_prop("string", "Case-insensitive, multi-line regex on the same field. Invalid patterns match literally.")),
            ("limit", create_prop_with_default_int("integer", "Maximum events to return.", 100)),
        ],
    )
}

/// Name, description and input schema for every tool, in listing order.
pub fn tool_catalogue() -> Vec<(&'static str, &'static str, Value)> {
    vec![
        ("terminal_create", "Create a terminal (pty-backed where available). Returns terminal id and cwd.", terminal_create_schema()),
        ("terminal_send", "Send text to a terminal. Non-blocking; read the output with terminal_read.", terminal_send_schema()),
        ("runCommand", "Alias of terminal_send.", terminal_send_schema()),
        ("terminal_read", "Read buffered output of a terminal.", terminal_read_schema()),
        ("terminal_interrupt", "Send an interrupt (Ctrl-C) to a terminal.", terminal_id_only_schema()),
        ("terminal_clear", "Clear the buffered output of a terminal. The shell is unaffected.", terminal_id_only_schema()),
        ("terminal_dispose", "Stop a terminal's shell and forget it.", terminal_dispose_schema()),
        ("terminal_list", "List live terminals as a JSON array.", terminal_list_schema()),
        ("terminal_events", "Query the terminal activity log with cursor pagination and text/regex filters.", terminal_events_schema()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_schema_offers_payload() {
        for (name, _, schema) in tool_catalogue() {
            assert_eq!(schema["type"], "object", "{name}");
            assert!(schema["properties"]["payload"].is_object(), "{name}");
        }
    }

    #[test]
    fn payload_mirrors_top_level_fields() {
        let schema = terminal_read_schema();
        assert_eq!(schema["properties"]["payload"]["properties"]["lines"]["type"], "integer");
        assert_eq!(schema["properties"]["strip_ansi"]["default"], true);
    }
}
