use std::sync::Arc;

use dap_bridge_core::{DapError, DebugConfig, ErrorKind, StandaloneDapBackend, StartParams};
use rmcp::{
    handler::server::{tool::ToolRouter, wrapper::Parameters, ServerHandler},
    model::*,
    tool, tool_handler, tool_router, transport, ErrorData as McpError, ServiceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct NoParams {}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct StartDebuggingParams {
    /// Program to debug; the adapter is chosen from its extension.
    file_path: String,
    #[serde(default)]
    working_directory: Option<String>,
    /// Named launch configuration from the bridge configuration file.
    #[serde(default)]
    configuration_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct AddBreakpointParams {
    file_path: String,
    line: u32,
    #[serde(default)]
    condition: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct RemoveBreakpointParams {
    file_path: String,
    line: u32,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct GetVariablesParams {
    /// Scope name such as `local` or `global`; defaults to the local scope.
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct EvaluateExpressionParams {
    expression: String,
    #[serde(default)]
    frame_id: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct GetStackTraceParams {
    #[serde(default)]
    thread_id: Option<i64>,
}

fn to_mcp_error(error: DapError) -> McpError {
    let kind = error.kind();
    let data = Some(json!({ "kind": kind.as_str() }));
    let message = error.to_string();
    match kind {
        ErrorKind::InvalidArgument | ErrorKind::UnknownAdapter | ErrorKind::ConfigError => {
            McpError::invalid_params(message, data)
        }
        ErrorKind::NoActiveSession | ErrorKind::NotStopped | ErrorKind::OperationInProgress => {
            McpError::invalid_request(message, data)
        }
        _ => McpError::internal_error(message, data),
    }
}

fn structured<T: Serialize>(
    result: Result<T, DapError>,
) -> Result<CallToolResult, McpError> {
    let value = result.map_err(to_mcp_error)?;
    let value = serde_json::to_value(value)
        .map_err(|e| McpError::internal_error(format!("Failed to encode result: {e}"), None))?;
    Ok(CallToolResult::structured(value))
}

#[derive(Clone)]
struct DebuggerMcpServer {
    tool_router: ToolRouter<Self>,
    backend: Arc<StandaloneDapBackend>,
}

#[tool_router]
impl DebuggerMcpServer {
    fn new(config: DebugConfig) -> Self {
        Self {
            tool_router: Self::tool_router(),
            backend: Arc::new(StandaloneDapBackend::new(config)),
        }
    }

    #[tool(description = "Start a debug session for a program, stopping on entry")]
    async fn start_debugging(
        &self,
        params: Parameters<StartDebuggingParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let start = StartParams {
            file_path: params.file_path,
            working_directory: params.working_directory,
            configuration_name: params.configuration_name,
        };
        structured(self.backend.start_debugging(start).await)
    }

    #[tool(description = "Stop the debug session and shut down the adapter")]
    async fn stop_debugging(&self, _params: Parameters<NoParams>) -> Result<CallToolResult, McpError> {
        structured(self.backend.stop_debugging().await)
    }

    #[tool(description = "Restart the debug session, keeping breakpoints")]
    async fn restart_debugging(
        &self,
        _params: Parameters<NoParams>,
    ) -> Result<CallToolResult, McpError> {
        structured(self.backend.restart_debugging().await)
    }

    #[tool(description = "Continue execution until the next stop or program exit")]
    async fn continue_execution(
        &self,
        _params: Parameters<NoParams>,
    ) -> Result<CallToolResult, McpError> {
        structured(self.backend.continue_execution().await)
    }

    #[tool(description = "Step over the next line")]
    async fn step_over(&self, _params: Parameters<NoParams>) -> Result<CallToolResult, McpError> {
        structured(self.backend.step_over().await)
    }

    #[tool(description = "Step into the function call on the current line")]
    async fn step_into(&self, _params: Parameters<NoParams>) -> Result<CallToolResult, McpError> {
        structured(self.backend.step_into().await)
    }

    #[tool(description = "Step out of the current function")]
    async fn step_out(&self, _params: Parameters<NoParams>) -> Result<CallToolResult, McpError> {
        structured(self.backend.step_out().await)
    }

    #[tool(description = "Add a breakpoint, optionally conditional")]
    async fn add_breakpoint(
        &self,
        params: Parameters<AddBreakpointParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        structured(
            self.backend
                .add_breakpoint(&params.file_path, params.line, params.condition)
                .await,
        )
    }

    #[tool(description = "Remove the breakpoint at a file and line")]
    async fn remove_breakpoint(
        &self,
        params: Parameters<RemoveBreakpointParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        structured(
            self.backend
                .remove_breakpoint(&params.file_path, params.line)
                .await,
        )
    }

    #[tool(description = "List breakpoints with their verified locations")]
    async fn list_breakpoints(
        &self,
        _params: Parameters<NoParams>,
    ) -> Result<CallToolResult, McpError> {
        structured(self.backend.list_breakpoints().await)
    }

    #[tool(description = "Report session state, current location, threads and recent output")]
    async fn get_debug_status(
        &self,
        _params: Parameters<NoParams>,
    ) -> Result<CallToolResult, McpError> {
        structured(self.backend.get_debug_status().await)
    }

    #[tool(description = "Read variables of a scope in the top stack frame")]
    async fn get_variables(
        &self,
        params: Parameters<GetVariablesParams>,
    ) -> Result<CallToolResult, McpError> {
        structured(self.backend.get_variables(params.0.scope.as_deref()).await)
    }

    #[tool(description = "Evaluate an expression in the stopped frame")]
    async fn evaluate_expression(
        &self,
        params: Parameters<EvaluateExpressionParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        structured(
            self.backend
                .evaluate_expression(&params.expression, params.frame_id)
                .await,
        )
    }

    #[tool(description = "Get the call stack of the stopped thread")]
    async fn get_stack_trace(
        &self,
        params: Parameters<GetStackTraceParams>,
    ) -> Result<CallToolResult, McpError> {
        structured(self.backend.get_stack_trace(params.0.thread_id).await)
    }
}

#[tool_handler]
impl ServerHandler for DebuggerMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Single-session debugger driving Debug Adapter Protocol adapters (debugpy, dlv, lldb-dap, js-debug)".into(),
            ),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let config = DebugConfig::from_env()?;
    let server = DebuggerMcpServer::new(config);
    let transport = transport::stdio();

    tracing::info!("Starting Debugger MCP Server on stdio...");

    server.serve(transport).await?.waiting().await?;

    Ok(())
}
