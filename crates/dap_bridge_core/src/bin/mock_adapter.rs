//! Scripted debug adapter used by the integration tests.
//!
//! Speaks DAP over stdio (or `--listen <port>` for TCP) and "runs" a fake
//! 20-line program on a single thread. Behaviour switches come from the
//! comma-separated `MOCK_ADAPTER_MODE` environment variable:
//!
//! - `hang_initialize`: never answer `initialize`
//! - `crash_on_variables`: exit with code 3 when asked for variables
//! - `ignore_disconnect`: swallow `disconnect` and keep running
//! - `slow_step`: delay every step by 500ms
//! - `native_restart`: advertise and honour the `restart` request
//! - `late_restart`: honour `restart`, advertised by a `capabilities` event after launch
//! - `run_forever`: `continue` without a breakpoint ahead never stops

use dap_bridge_core::framing::{FrameReader, FrameWriter};
use dap_bridge_core::protocol::{Event, ProtocolMessage, Request, Response};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

const PROGRAM_LINES: u32 = 20;
const THREAD_ID: i64 = 1;
const RELOCATED_FROM: u32 = 3;

struct Modes(HashSet<String>);

impl Modes {
    fn from_env() -> Self {
        let modes = std::env::var("MOCK_ADAPTER_MODE").unwrap_or_default();
        Self(
            modes
                .split(',')
                .map(str::trim)
                .filter(|mode| !mode.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    fn has(&self, mode: &str) -> bool {
        self.0.contains(mode)
    }
}

struct MockBreakpoint {
    id: i64,
    line: u32,
}

enum Flow {
    Continue,
    Exit(i32),
}

struct MockAdapter<W> {
    writer: FrameWriter<W>,
    modes: Modes,
    seq: u64,
    program: String,
    stop_on_entry: bool,
    pending_launch: Option<Request>,
    line: u32,
    epoch: i64,
    running: bool,
    breakpoints: BTreeMap<String, Vec<MockBreakpoint>>,
    next_breakpoint_id: i64,
}

impl<W: AsyncWrite + Unpin> MockAdapter<W> {
    fn new(writer: W, modes: Modes) -> Self {
        Self {
            writer: FrameWriter::new(writer),
            modes,
            seq: 0,
            program: "main.py".to_string(),
            stop_on_entry: false,
            pending_launch: None,
            line: 0,
            epoch: 0,
            running: false,
            breakpoints: BTreeMap::new(),
            next_breakpoint_id: 1,
        }
    }

    async fn send(&mut self, message: ProtocolMessage) -> std::io::Result<()> {
        self.writer
            .write(&message)
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::BrokenPipe, e.to_string()))
    }

    async fn respond(&mut self, request: &Request, body: Value) -> std::io::Result<()> {
        self.seq += 1;
        let response = Response {
            seq: self.seq,
            request_seq: request.seq,
            command: request.command.clone(),
            success: true,
            message: None,
            body: Some(body),
        };
        self.send(ProtocolMessage::Response(response)).await
    }

    async fn fail(&mut self, request: &Request, message: &str) -> std::io::Result<()> {
        self.seq += 1;
        let response = Response {
            seq: self.seq,
            request_seq: request.seq,
            command: request.command.clone(),
            success: false,
            message: Some(message.to_string()),
            body: Some(json!({ "error": { "id": 1, "format": message } })),
        };
        self.send(ProtocolMessage::Response(response)).await
    }

    async fn emit(&mut self, event: &str, body: Value) -> std::io::Result<()> {
        self.seq += 1;
        let event = Event {
            seq: self.seq,
            event: event.to_string(),
            body: Some(body),
        };
        self.send(ProtocolMessage::Event(event)).await
    }

    async fn stop(&mut self, reason: &str, hit: Vec<i64>) -> std::io::Result<()> {
        self.epoch += 1;
        self.running = false;
        self.emit(
            "stopped",
            json!({
                "reason": reason,
                "threadId": THREAD_ID,
                "allThreadsStopped": true,
                "hitBreakpointIds": hit,
            }),
        )
        .await
    }

    async fn finish(&mut self) -> std::io::Result<()> {
        self.running = false;
        self.emit("output", json!({ "category": "stdout", "output": "program finished\n" }))
            .await?;
        self.emit("exited", json!({ "exitCode": 0 })).await?;
        self.emit("terminated", json!({})).await
    }

    /// Run from the current line to the next breakpoint or the end.
    async fn run(&mut self) -> std::io::Result<()> {
        let current = self.line;
        let next_hit = self
            .breakpoints
            .values()
            .flatten()
            .filter(|bp| bp.line > current)
            .min_by_key(|bp| bp.line)
            .map(|bp| (bp.id, bp.line));

        match next_hit {
            Some((id, line)) => {
                self.line = line;
                self.stop("breakpoint", vec![id]).await
            }
            None if self.modes.has("run_forever") => {
                self.running = true;
                Ok(())
            }
            None => self.finish().await,
        }
    }

    async fn step(&mut self) -> std::io::Result<()> {
        if self.modes.has("slow_step") {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        self.line += 1;
        if self.line > PROGRAM_LINES {
            self.finish().await
        } else {
            self.stop("step", Vec::new()).await
        }
    }

    fn frames(&self) -> Value {
        let source = json!({ "name": "main.py", "path": self.program });
        json!([
            { "id": self.epoch * 100, "name": "compute", "line": self.line, "column": 1, "source": source.clone() },
            { "id": self.epoch * 100 + 1, "name": "<module>", "line": PROGRAM_LINES, "column": 1, "source": source },
        ])
    }

    async fn set_breakpoints(&mut self, request: &Request) -> std::io::Result<()> {
        let args = request.arguments.clone().unwrap_or(Value::Null);
        let path = args["source"]["path"].as_str().unwrap_or_default().to_string();
        if path.ends_with(".txt") {
            return self
                .fail(request, "Breakpoints are not supported in this file type")
                .await;
        }

        let requested: Vec<u32> = args["breakpoints"]
            .as_array()
            .map(|bps| {
                bps.iter()
                    .filter_map(|bp| bp["line"].as_u64())
                    .map(|line| line as u32)
                    .collect()
            })
            .unwrap_or_default();

        let mut placed = Vec::new();
        let mut reported = Vec::new();
        for line in requested {
            let id = self.next_breakpoint_id;
            self.next_breakpoint_id += 1;
            if line > PROGRAM_LINES {
                reported.push(json!({
                    "id": id,
                    "verified": false,
                    "message": format!("Line {line} is beyond the end of the file"),
                }));
                continue;
            }
            let actual = if line == RELOCATED_FROM { line + 1 } else { line };
            placed.push(MockBreakpoint { id, line: actual });
            reported.push(json!({
                "id": id,
                "verified": true,
                "line": actual,
                "source": { "path": path },
            }));
        }

        if placed.is_empty() {
            self.breakpoints.remove(&path);
        } else {
            self.breakpoints.insert(path, placed);
        }
        self.respond(request, json!({ "breakpoints": reported })).await
    }

    async fn handle(&mut self, request: Request) -> std::io::Result<Flow> {
        let args = request.arguments.clone().unwrap_or(Value::Null);
        let command = request.command.clone();
        match command.as_str() {
            "initialize" => {
                if self.modes.has("hang_initialize") {
                    return Ok(Flow::Continue);
                }
                let capabilities = json!({
                    "supportsConfigurationDoneRequest": true,
                    "supportsConditionalBreakpoints": true,
                    "supportsTerminateRequest": true,
                    "supportsEvaluateForHovers": true,
                    "supportsRestartRequest": self.modes.has("native_restart"),
                });
                self.respond(&request, capabilities).await?;
                // Noise a client must tolerate.
                self.seq += 1;
                let stray = Response {
                    seq: self.seq,
                    request_seq: 9_999,
                    command: "ghost".to_string(),
                    success: true,
                    message: None,
                    body: None,
                };
                self.send(ProtocolMessage::Response(stray)).await?;
                self.emit("mockHeartbeat", json!({ "tick": 1 })).await?;
            }
            "launch" | "attach" => {
                if let Some(program) = args["program"].as_str() {
                    self.program = program.to_string();
                }
                self.stop_on_entry = args["stopOnEntry"].as_bool().unwrap_or(false);
                self.pending_launch = Some(request);
                self.emit("initialized", json!({})).await?;
            }
            "configurationDone" => {
                self.respond(&request, json!({})).await?;
                if let Some(launch) = self.pending_launch.take() {
                    self.respond(&launch, json!({})).await?;
                    if self.modes.has("late_restart") {
                        self.emit(
                            "capabilities",
                            json!({ "capabilities": { "supportsRestartRequest": true } }),
                        )
                        .await?;
                    }
                    self.emit("thread", json!({ "reason": "started", "threadId": THREAD_ID }))
                        .await?;
                    self.emit("output", json!({ "category": "console", "output": "mock program started\n" }))
                        .await?;
                    if self.stop_on_entry {
                        self.line = 1;
                        self.stop("entry", Vec::new()).await?;
                    } else {
                        self.run().await?;
                    }
                }
            }
            "setBreakpoints" => self.set_breakpoints(&request).await?,
            "threads" => {
                self.respond(
                    &request,
                    json!({ "threads": [{ "id": THREAD_ID, "name": "MainThread" }] }),
                )
                .await?
            }
            "stackTrace" => {
                let frames = self.frames();
                self.respond(&request, json!({ "stackFrames": frames, "totalFrames": 2 }))
                    .await?
            }
            "scopes" => {
                let frame_id = args["frameId"].as_i64().unwrap_or_default();
                let base = (frame_id / 100) * 1000;
                self.respond(
                    &request,
                    json!({ "scopes": [
                        { "name": "Locals", "variablesReference": base + 1, "expensive": false },
                        { "name": "Globals", "variablesReference": base + 2, "expensive": false },
                    ]}),
                )
                .await?
            }
            "variables" => {
                if self.modes.has("crash_on_variables") {
                    return Ok(Flow::Exit(3));
                }
                let reference = args["variablesReference"].as_i64().unwrap_or_default();
                let variables = if reference % 1000 == 1 {
                    json!([
                        { "name": "counter", "value": self.line.to_string(), "type": "int", "variablesReference": 0 },
                        { "name": "message", "value": "'hello'", "type": "str", "variablesReference": 0 },
                    ])
                } else {
                    json!([
                        { "name": "__name__", "value": "'__main__'", "type": "str", "variablesReference": 0 },
                    ])
                };
                self.respond(&request, json!({ "variables": variables })).await?
            }
            "evaluate" => {
                let expression = args["expression"].as_str().unwrap_or_default().trim();
                let value = match expression {
                    "counter" => Some((self.line.to_string(), "int")),
                    "message" => Some(("'hello'".to_string(), "str")),
                    literal => literal.parse::<i64>().ok().map(|n| (n.to_string(), "int")),
                };
                match value {
                    Some((result, type_name)) => {
                        self.respond(
                            &request,
                            json!({ "result": result, "type": type_name, "variablesReference": 0 }),
                        )
                        .await?
                    }
                    None => {
                        let message = format!("NameError: name '{expression}' is not defined");
                        self.fail(&request, &message).await?
                    }
                }
            }
            "continue" => {
                self.respond(&request, json!({ "allThreadsContinued": true }))
                    .await?;
                self.run().await?;
            }
            "next" | "stepIn" | "stepOut" => {
                self.respond(&request, json!({})).await?;
                self.step().await?;
            }
            "pause" => {
                self.respond(&request, json!({})).await?;
                if self.running {
                    self.stop("pause", Vec::new()).await?;
                }
            }
            "restart" if self.modes.has("native_restart") || self.modes.has("late_restart") => {
                self.respond(&request, json!({})).await?;
                self.line = 1;
                self.stop("entry", Vec::new()).await?;
            }
            "terminate" => {
                self.respond(&request, json!({})).await?;
                self.emit("terminated", json!({})).await?;
            }
            "disconnect" => {
                if self.modes.has("ignore_disconnect") {
                    return Ok(Flow::Continue);
                }
                self.respond(&request, json!({})).await?;
                return Ok(Flow::Exit(0));
            }
            other => {
                let message = format!("Unsupported command '{other}'");
                self.fail(&request, &message).await?
            }
        }
        Ok(Flow::Continue)
    }
}

async fn serve<R, W>(reader: R, writer: W) -> i32
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut frames = FrameReader::new(reader);
    let mut adapter = MockAdapter::new(writer, Modes::from_env());
    loop {
        let request = match frames.read_next().await {
            Ok(Some(ProtocolMessage::Request(request))) => request,
            Ok(Some(_)) => continue,
            Ok(None) => return 0,
            Err(e) => {
                eprintln!("mock_adapter: {e}");
                return 2;
            }
        };
        eprintln!("mock_adapter: <- {}", request.command);
        match adapter.handle(request).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Exit(code)) => return code,
            Err(e) => {
                eprintln!("mock_adapter: write failed: {e}");
                return 1;
            }
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let listen_port = args
        .iter()
        .position(|arg| arg == "--listen")
        .and_then(|index| args.get(index + 1))
        .and_then(|port| port.parse::<u16>().ok());

    let code = match listen_port {
        Some(port) => match tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => match listener.accept().await {
                Ok((stream, _)) => {
                    let (reader, writer) = stream.into_split();
                    serve(reader, writer).await
                }
                Err(e) => {
                    eprintln!("mock_adapter: accept failed: {e}");
                    1
                }
            },
            Err(e) => {
                eprintln!("mock_adapter: bind failed: {e}");
                1
            }
        },
        None => serve(tokio::io::stdin(), tokio::io::stdout()).await,
    };
    std::process::exit(code);
}
