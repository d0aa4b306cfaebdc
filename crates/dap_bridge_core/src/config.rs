use crate::{DapError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "DAP_BRIDGE_CONFIG";
pub const TIMEOUT_ENV: &str = "DAP_BRIDGE_TIMEOUT_MS";

/// Placeholder in adapter arguments replaced by a free local port.
pub const PORT_PLACEHOLDER: &str = "{port}";

/// How the client reaches the adapter once it is spawned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdapterTransport {
    #[default]
    Stdio,
    Tcp {
        #[serde(default = "default_host")]
        host: String,
        #[serde(default)]
        port: Option<u16>,
    },
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterLaunchSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub adapter_id: Option<String>,
    #[serde(default)]
    pub transport: AdapterTransport,
}

impl AdapterLaunchSpec {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            cwd: None,
            env: HashMap::new(),
            adapter_id: None,
            transport: AdapterTransport::Stdio,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_transport(mut self, transport: AdapterTransport) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_adapter_id(mut self, adapter_id: impl Into<String>) -> Self {
        self.adapter_id = Some(adapter_id.into());
        self
    }

    /// `adapterID` sent in the initialize request.
    pub fn adapter_id_for(&self, language: &str) -> String {
        self.adapter_id
            .clone()
            .unwrap_or_else(|| language.to_string())
    }

    pub fn substitute_port(&self, port: u16) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace(PORT_PLACEHOLDER, &port.to_string()))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    #[default]
    Launch,
    Attach,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Launch => "launch",
            RequestKind::Attach => "attach",
        }
    }
}

/// A named debug configuration selectable by `start_debugging`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchConfiguration {
    pub language: String,
    #[serde(default)]
    pub request: RequestKind,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub operation_ms: u64,
    pub startup_ms: u64,
    pub request_ms: u64,
    pub disconnect_ms: u64,
    pub exit_grace_ms: u64,
    pub initialized_wait_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            operation_ms: 180_000,
            startup_ms: 10_000,
            request_ms: 30_000,
            disconnect_ms: 3_000,
            exit_grace_ms: 2_000,
            initialized_wait_ms: 5_000,
        }
    }
}

impl Timeouts {
    pub fn operation(&self) -> Duration {
        Duration::from_millis(self.operation_ms)
    }

    pub fn startup(&self) -> Duration {
        Duration::from_millis(self.startup_ms)
    }

    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }

    pub fn disconnect(&self) -> Duration {
        Duration::from_millis(self.disconnect_ms)
    }

    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.exit_grace_ms)
    }

    pub fn initialized_wait(&self) -> Duration {
        Duration::from_millis(self.initialized_wait_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugConfig {
    #[serde(default)]
    pub adapters: HashMap<String, AdapterLaunchSpec>,
    #[serde(default)]
    pub request_defaults: HashMap<String, Map<String, Value>>,
    #[serde(default)]
    pub configurations: HashMap<String, LaunchConfiguration>,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub traffic_log_dir: Option<PathBuf>,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self::builtin()
    }
}

impl DebugConfig {
    /// Adapters and request defaults known without any configuration file.
    pub fn builtin() -> Self {
        let mut adapters = HashMap::new();
        adapters.insert(
            "python".to_string(),
            AdapterLaunchSpec::new("python3", vec!["-m".into(), "debugpy.adapter".into()])
                .with_adapter_id("debugpy"),
        );
        adapters.insert(
            "go".to_string(),
            AdapterLaunchSpec::new(
                "dlv",
                vec![
                    "dap".into(),
                    "--listen".into(),
                    format!("127.0.0.1:{PORT_PLACEHOLDER}"),
                ],
            )
            .with_adapter_id("go")
            .with_transport(AdapterTransport::Tcp {
                host: default_host(),
                port: None,
            }),
        );
        adapters.insert(
            "javascript".to_string(),
            AdapterLaunchSpec::new("js-debug-adapter", vec![PORT_PLACEHOLDER.into()])
                .with_adapter_id("pwa-node")
                .with_transport(AdapterTransport::Tcp {
                    host: default_host(),
                    port: None,
                }),
        );
        for language in ["rust", "c", "cpp"] {
            adapters.insert(
                language.to_string(),
                AdapterLaunchSpec::new("lldb-dap", Vec::new()).with_adapter_id("lldb-dap"),
            );
        }

        let mut request_defaults = HashMap::new();
        request_defaults.insert(
            "python".to_string(),
            object(json!({ "console": "internalConsole", "justMyCode": true })),
        );
        request_defaults.insert("go".to_string(), object(json!({ "mode": "debug" })));
        request_defaults.insert(
            "javascript".to_string(),
            object(json!({ "type": "pwa-node", "console": "internalConsole" })),
        );

        Self {
            adapters,
            request_defaults,
            configurations: HashMap::new(),
            timeouts: Timeouts::default(),
            traffic_log_dir: None,
        }
    }

    /// Parse a JSON configuration file and merge it over the built-in defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            DapError::Config(format!("Failed to read '{}': {e}", path.display()))
        })?;
        let overrides: DebugConfig = serde_json::from_str(&text).map_err(|e| {
            DapError::Config(format!("Failed to parse '{}': {e}", path.display()))
        })?;
        Ok(Self::builtin().merged_with(overrides))
    }

    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim())?,
            _ => Self::builtin(),
        };

        if let Some(ms) = std::env::var(TIMEOUT_ENV)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            config.timeouts.operation_ms = ms;
        }

        Ok(config)
    }

    pub fn merged_with(mut self, overrides: DebugConfig) -> Self {
        self.adapters.extend(overrides.adapters);
        for (language, defaults) in overrides.request_defaults {
            self.request_defaults
                .entry(language)
                .or_default()
                .extend(defaults);
        }
        self.configurations.extend(overrides.configurations);
        self.timeouts = overrides.timeouts;
        if overrides.traffic_log_dir.is_some() {
            self.traffic_log_dir = overrides.traffic_log_dir;
        }
        self
    }

    pub fn launch_spec(&self, language: &str) -> Result<&AdapterLaunchSpec> {
        self.adapters
            .get(language)
            .ok_or_else(|| DapError::UnknownAdapter(language.to_string()))
    }

    pub fn configuration(&self, name: &str) -> Result<&LaunchConfiguration> {
        self.configurations.get(name).ok_or_else(|| {
            DapError::InvalidArgument(format!("Unknown debug configuration '{name}'"))
        })
    }

    /// Launch/attach arguments: `base` <- language defaults <- `overrides`.
    pub fn request_arguments(
        &self,
        language: &str,
        base: Map<String, Value>,
        overrides: &Map<String, Value>,
    ) -> Map<String, Value> {
        let mut arguments = base;
        if let Some(defaults) = self.request_defaults.get(language) {
            arguments.extend(defaults.clone());
        }
        arguments.extend(overrides.clone());
        arguments
    }
}

/// Map a source file to the language key of its adapter.
pub fn language_for_path(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    match extension.as_str() {
        "py" | "pyw" => Some("python"),
        "go" => Some("go"),
        "rs" => Some("rust"),
        "c" | "h" => Some("c"),
        "cc" | "cpp" | "cxx" | "hpp" => Some("cpp"),
        "js" | "mjs" | "cjs" | "ts" => Some("javascript"),
        _ => None,
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DebugConfig::default();
        assert_eq!(config.launch_spec("python").unwrap().command, "python3");
        assert_eq!(config.timeouts.operation(), Duration::from_secs(180));
        assert!(config.traffic_log_dir.is_none());
        assert!(matches!(
            config.launch_spec("cobol"),
            Err(DapError::UnknownAdapter(lang)) if lang == "cobol"
        ));
    }

    #[test]
    fn test_language_for_path() {
        assert_eq!(language_for_path(Path::new("src/main.py")), Some("python"));
        assert_eq!(language_for_path(Path::new("cmd/app/main.go")), Some("go"));
        assert_eq!(language_for_path(Path::new("lib.RS")), Some("rust"));
        assert_eq!(language_for_path(Path::new("web/app.ts")), Some("javascript"));
        assert_eq!(language_for_path(Path::new("notes.txt")), None);
        assert_eq!(language_for_path(Path::new("Makefile")), None);
    }

    #[test]
    fn test_substitute_port() {
        let config = DebugConfig::default();
        let args = config.launch_spec("go").unwrap().substitute_port(40123);
        assert_eq!(args, vec!["dap", "--listen", "127.0.0.1:40123"]);
    }

    #[test]
    fn test_request_argument_merge_order() {
        let mut config = DebugConfig::default();
        config
            .request_defaults
            .get_mut("python")
            .unwrap()
            .insert("stopOnEntry".into(), json!(false));

        let base = object(json!({ "program": "/w/main.py", "stopOnEntry": true }));
        let overrides = object(json!({ "justMyCode": false }));
        let merged = config.request_arguments("python", base, &overrides);

        assert_eq!(merged["program"], "/w/main.py");
        assert_eq!(merged["stopOnEntry"], false);
        assert_eq!(merged["console"], "internalConsole");
        assert_eq!(merged["justMyCode"], false);
    }

    #[test]
    fn test_merge_file_over_builtin() {
        let overrides: DebugConfig = serde_json::from_value(json!({
            "adapters": {
                "python": { "command": "/opt/venv/bin/python", "args": ["-m", "debugpy.adapter"] },
                "node": {
                    "command": "js-debug",
                    "args": ["{port}"],
                    "transport": { "type": "tcp", "port": 8123 }
                }
            },
            "request_defaults": { "python": { "justMyCode": false } },
            "configurations": {
                "tests": { "language": "python", "request": "launch", "arguments": { "module": "pytest" } }
            },
            "timeouts": { "operation_ms": 1000 }
        }))
        .unwrap();

        let config = DebugConfig::builtin().merged_with(overrides);
        assert_eq!(config.launch_spec("python").unwrap().command, "/opt/venv/bin/python");
        assert!(config.launch_spec("go").is_ok());
        assert_eq!(
            config.launch_spec("node").unwrap().transport,
            AdapterTransport::Tcp {
                host: "127.0.0.1".into(),
                port: Some(8123)
            }
        );
        assert_eq!(config.request_defaults["python"]["justMyCode"], false);
        assert_eq!(config.request_defaults["python"]["console"], "internalConsole");
        assert_eq!(config.configuration("tests").unwrap().request, RequestKind::Launch);
        assert!(config.configuration("missing").is_err());
        assert_eq!(config.timeouts.operation_ms, 1000);
        assert_eq!(config.timeouts.request_ms, 30_000);
    }

    #[test]
    fn test_from_env_defaults_and_overrides() {
        std::env::remove_var(CONFIG_PATH_ENV);
        std::env::remove_var(TIMEOUT_ENV);

        let config = DebugConfig::from_env().unwrap();
        assert_eq!(config.timeouts.operation(), Duration::from_secs(180));

        let path = std::env::temp_dir().join(format!("dap_bridge_cfg_{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "traffic_log_dir": "/tmp/dap-traffic" }"#).unwrap();
        std::env::set_var(CONFIG_PATH_ENV, &path);
        std::env::set_var(TIMEOUT_ENV, "5000");

        let config = DebugConfig::from_env().unwrap();
        assert_eq!(config.timeouts.operation(), Duration::from_millis(5000));
        assert_eq!(config.traffic_log_dir, Some(PathBuf::from("/tmp/dap-traffic")));
        assert!(config.launch_spec("python").is_ok());

        std::env::remove_var(CONFIG_PATH_ENV);
        std::env::remove_var(TIMEOUT_ENV);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_from_file_reports_parse_errors() {
        let path = std::env::temp_dir().join(format!("dap_bridge_bad_{}.json", std::process::id()));
        std::fs::write(&path, "{ not json").unwrap();
        let err = DebugConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, DapError::Config(_)), "unexpected error: {err}");
        let _ = std::fs::remove_file(path);
    }
}
