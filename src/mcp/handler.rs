use crate::error::AppError;
use crate::mcp::schemas::tool_catalogue;
use crate::session::SessionRegistry;
use crate::tools::terminal_tool::{
    merge_payload, CreateParams, DisposeParams, EventsParams, ReadParams, SendParams,
    TerminalIdParams, TerminalTools,
};
use async_trait::async_trait;
use rust_mcp_schema::{
    schema_utils::CallToolError, CallToolRequest, CallToolResult, Implementation,
    InitializeResult, ListToolsRequest, ListToolsResult, RpcError, ServerCapabilities,
    ServerCapabilitiesTools, Tool, LATEST_PROTOCOL_VERSION,
};
use rust_mcp_sdk::mcp_server::ServerHandler;
use rust_mcp_sdk::McpServer;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument};

pub const SERVER_NAME: &str = "terminal-mcp";

/// Failures that are protocol errors rather than tool output.
#[derive(Error, Debug)]
pub enum ToolCallError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("Invalid arguments for {tool}: {message}")]
    InvalidParams { tool: String, message: String },
}

impl From<ToolCallError> for CallToolError {
    fn from(err: ToolCallError) -> Self {
        tracing::error!("ToolCallError converted to CallToolError: {:?}", err);
        match err {
            ToolCallError::UnknownTool(name) => CallToolError::unknown_tool(name),
            other => CallToolError::new(other),
        }
    }
}

/// What `initialize` answers with.
pub fn server_details() -> InitializeResult {
    InitializeResult {
        server_info: Implementation {
            name: SERVER_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        capabilities: ServerCapabilities {
            tools: Some(ServerCapabilitiesTools { list_changed: None }),
            ..Default::default()
        },
        meta: None,
        instructions: Some(
            "Terminal sessions for agents. Create a terminal, send commands, read buffered output, \
            and page through the activity log with terminal_events (pass nextCursor as `after`)."
                .to_string(),
        ),
        protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
    }
}

/// Wraps tool output as text content; output starting with `Error: ` is flagged as an error.
pub fn call_tool_result(text: String) -> CallToolResult {
    let is_error = text.starts_with("Error: ");
    let mut result = CallToolResult::text_content(text, None);
    if is_error {
        result.is_error = Some(true);
    }
    result
}

/// Tool failures are reported to the caller as text, not as protocol errors.
pub fn render_error(err: &AppError) -> String {
    format!("Error: {}", err)
}

/// Routes tool calls to [`TerminalTools`] and renders their results as the
/// text the tools return.
pub struct ToolHandler {
    tools: TerminalTools,
}

impl ToolHandler {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            tools: TerminalTools::new(registry),
        }
    }

    pub fn tools(&self) -> &TerminalTools {
        &self.tools
    }

    /// Every tool, in listing order.
    pub fn list_tools(&self) -> Result<Vec<Tool>, serde_json::Error> {
        tool_catalogue()
            .into_iter()
            .map(|(name, description, schema)| {
                serde_json::from_value(json!({
                    "name": name,
                    "description": description,
                    "inputSchema": schema
                }))
            })
            .collect()
    }

    #[instrument(skip(self, args))]
    pub async fn call_tool(&self, name: &str, args: Value) -> Result<String, ToolCallError> {
        info!("Handling call_tool request for: {}", name);
        let args = merge_payload(args);

        fn parse<T: DeserializeOwned>(tool: &str, args: Value) -> Result<T, ToolCallError> {
            serde_json::from_value(args).map_err(|e| ToolCallError::InvalidParams {
                tool: tool.to_string(),
                message: e.to_string(),
            })
        }

        let text = match name {
            "terminal_create" => {
                let params: CreateParams = parse(name, args)?;
                match self.tools.create(&params).await {
                    Ok(created) => {
                        let mut out = json!({
                            "terminalId": created.terminal_id,
                            "cwd": created.cwd,
                        });
                        if params.verbose.unwrap_or(false) {
                            out["pid"] = json!(created.pid);
                            out["type"] = json!(created.kind);
                        }
                        out.to_string()
                    }
                    // Callers get the id the attempt resolved, even on failure.
                    Err(e) => e.terminal_id,
                }
            }
            "terminal_send" | "runCommand" => {
                let params: SendParams = parse(name, args)?;
                match self.tools.send(&params).await {
                    Ok(outcome) => match outcome.created {
                        Some(created) => json!({
                            "terminalId": outcome.terminal_id,
                            "status": "created",
                            "cwd": created.cwd,
                        })
                        .to_string(),
                        None => String::new(),
                    },
                    Err(e) => render_error(&e),
                }
            }
            "terminal_read" => {
                let params: ReadParams = parse(name, args)?;
                self.tools
                    .read(&params)
                    .await
                    .unwrap_or_else(|e| render_error(&e))
            }
            "terminal_interrupt" => {
                let params: TerminalIdParams = parse(name, args)?;
                match self.tools.interrupt(&params).await {
                    Ok(()) => String::new(),
                    Err(e) => render_error(&e),
                }
            }
            "terminal_clear" => {
                let params: TerminalIdParams = parse(name, args)?;
                match self.tools.clear(&params).await {
                    Ok(()) => String::new(),
                    Err(e) => render_error(&e),
                }
            }
            "terminal_dispose" => {
                let params: DisposeParams = parse(name, args)?;
                match self.tools.dispose(&params).await {
                    Ok(disposed) if params.verbose.unwrap_or(false) => json!({
                        "terminalId": disposed.terminal_id,
                        "disposed": true,
                        "exitCode": disposed.exit_code,
                    })
                    .to_string(),
                    Ok(_) => String::new(),
                    Err(e) => render_error(&e),
                }
            }
            "terminal_list" => json!(self.tools.list().await).to_string(),
            "terminal_events" => {
                let params: EventsParams = parse(name, args)?;
                json!(self.tools.events(&params)).to_string()
            }
            _ => {
                error!("Unknown tool called: {}", name);
                return Err(ToolCallError::UnknownTool(name.to_string()));
            }
        };
        Ok(text)
    }
}

#[async_trait]
impl ServerHandler for ToolHandler {
    #[instrument(skip(self, _request, _runtime))]
    async fn handle_list_tools_request(
        &self,
        _request: ListToolsRequest,
        _runtime: &dyn McpServer,
    ) -> Result<ListToolsResult, RpcError> {
        info!("Handling list_tools request");
        let tools = self.list_tools().map_err(|e| {
            error!(error = %e, "Tool schema does not describe a valid tool");
            RpcError::internal_error().with_message(e.to_string())
        })?;
        Ok(ListToolsResult {
            tools,
            meta: None,
            next_cursor: None,
        })
    }

    #[instrument(skip(self, request, _runtime), fields(tool_name = %request.params.name))]
    async fn handle_call_tool_request(
        &self,
        request: CallToolRequest,
        _runtime: &dyn McpServer,
    ) -> Result<CallToolResult, CallToolError> {
        let args = request.params.arguments.unwrap_or_default();
        let text = self.call_tool(&request.params.name, Value::Object(args)).await?;
        Ok(call_tool_result(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendPolicy, Config};
    use crate::events::EventBus;

    fn handler() -> ToolHandler {
        let config = Arc::new(Config {
            backend_policy: BackendPolicy::Pipe,
            default_shell: Some("/bin/sh".to_string()),
            ..Config::default()
        });
        let bus = Arc::new(EventBus::new(100, None));
        ToolHandler::new(Arc::new(SessionRegistry::new(config, bus)))
    }

    #[tokio::test]
    async fn error_strings_match_the_tool_contract() {
        let h = handler();
        assert_eq!(
            h.call_tool("terminal_read", json!({})).await.unwrap(),
            "Error: terminalId required"
        );
        assert_eq!(
            h.call_tool("terminal_read", json!({"terminalId": "ghost"})).await.unwrap(),
            "Error: terminal not found"
        );
        assert_eq!(
            h.call_tool("terminal_send", json!({"terminalId": "ghost"})).await.unwrap(),
            "Error: text required"
        );
        assert_eq!(
            h.call_tool("terminal_send", json!({"payload": {"terminalId": "ghost", "text": "ls"}}))
                .await
                .unwrap(),
            "Error: terminal not found"
        );
        for tool in ["terminal_interrupt", "terminal_clear", "terminal_dispose"] {
            assert_eq!(
                h.call_tool(tool, json!({"terminalId": "ghost"})).await.unwrap(),
                "Error: terminal not found",
                "{tool}"
            );
            assert_eq!(
                h.call_tool(tool, json!({})).await.unwrap(),
                "Error: terminalId required",
                "{tool}"
            );
        }
    }

    #[tokio::test]
    async fn list_and_events_start_empty() {
        let h = handler();
        assert_eq!(h.call_tool("terminal_list", json!({})).await.unwrap(), "[]");
        let page: Value =
            serde_json::from_str(&h.call_tool("terminal_events", json!({})).await.unwrap()).unwrap();
        assert_eq!(page["count"], 0);
        assert_eq!(page["hasMore"], false);
        assert!(page["nextCursor"].is_null());
    }

    #[tokio::test]
    async fn unknown_tool_is_a_protocol_error() {
        let h = handler();
        assert!(matches!(
            h.call_tool("rm_rf", json!({})).await,
            Err(ToolCallError::UnknownTool(_))
        ));
    }

    #[test]
    fn listing_includes_every_tool() {
        let listed = handler().list_tools().unwrap();
        let names: Vec<&str> = listed.iter().map(|t| t.name.as_str()).collect();
        for name in [
            "terminal_create",
            "terminal_send",
            "runCommand",
            "terminal_read",
            "terminal_interrupt",
            "terminal_clear",
            "terminal_dispose",
            "terminal_list",
            "terminal_events",
        ] {
            assert!(names.contains(&name), "{name}");
        }
        let read = listed.iter().find(|t| t.name == "terminal_read").unwrap();
        assert_eq!(read.description.as_deref(), Some("Read buffered output of a terminal."));
    }

    #[test]
    fn results_are_text_content_flagged_on_error() {
        let ok = serde_json::to_value(call_tool_result("hello".to_string())).unwrap();
        assert_eq!(ok["content"][0]["type"], "text");
        assert_eq!(ok["content"][0]["text"], "hello");
        assert_ne!(ok["isError"], true);

        let failed = serde_json::to_value(call_tool_result("Error: terminal not found".to_string())).unwrap();
        assert_eq!(failed["content"][0]["text"], "Error: terminal not found");
        assert_eq!(failed["isError"], true);
    }

    #[test]
    fn unknown_tool_maps_to_call_tool_error() {
        let err: CallToolError = ToolCallError::UnknownTool("rm_rf".to_string()).into();
        assert!(err.to_string().contains("rm_rf"), "{err}");
        let err: CallToolError = ToolCallError::InvalidParams {
            tool: "terminal_read".to_string(),
            message: "invalid type".to_string(),
        }
        .into();
        assert!(err.to_string().contains("terminal_read"), "{err}");
    }

    #[test]
    fn server_details_advertise_tools() {
        let details = server_details();
        assert_eq!(details.server_info.name, SERVER_NAME);
        assert!(details.capabilities.tools.is_some());
        assert_eq!(details.protocol_version, LATEST_PROTOCOL_VERSION);
    }
}
