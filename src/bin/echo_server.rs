//! `echo-server` — a small external server speaking the stdio protocol.
//!
//! Serves the tools `echo`, `get_env_info` and `check_oauth` plus the
//! resource `example://hello`. The remaining tools and the command-line
//! flags inject faults for exercising the host's recovery paths:
//!
//! - `--framing newline|content_length`
//! - `--counter-file PATH`: append one line per launch
//! - `--fail-launches N`: exit before the handshake on the first N launches
//!   (counted through `--counter-file`)
//! - `--hang-handshake`: never answer `initialize`
//! - `--ignore-stdin-close`: keep running after stdin closes

use std::io::{BufRead, BufReader, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

#[derive(Clone, Copy, PartialEq)]
enum Framing {
    Newline,
    ContentLength,
}

#[derive(Default)]
struct Options {
    content_length: bool,
    counter_file: Option<String>,
    fail_launches: u32,
    hang_handshake: bool,
    ignore_stdin_close: bool,
}

fn parse_args() -> Options {
    let mut opts = Options::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--framing" => opts.content_length = args.next().as_deref() == Some("content_length"),
            "--counter-file" => opts.counter_file = args.next(),
            "--fail-launches" => {
                opts.fail_launches = args.next().and_then(|n| n.parse().ok()).unwrap_or(0)
            }
            "--hang-handshake" => opts.hang_handshake = true,
            "--ignore-stdin-close" => opts.ignore_stdin_close = true,
            other => eprintln!("echo-server: ignoring unknown argument {other}"),
        }
    }
    opts
}

/// Record this launch and return its 1-based number.
fn count_launch(path: &str) -> std::io::Result<u32> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "launch {}", std::process::id())?;
    let launches = std::fs::read_to_string(path)?.lines().count();
    Ok(launches as u32)
}

// ─── Output ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct Output {
    framing: Framing,
    stdout: Arc<Mutex<std::io::Stdout>>,
}

impl Output {
    fn send_raw(&self, payload: &[u8]) {
        let Ok(mut out) = self.stdout.lock() else {
            return;
        };
        let _ = match self.framing {
            Framing::Newline => out
                .write_all(payload)
                .and_then(|_| out.write_all(b"\n")),
            Framing::ContentLength => write!(out, "Content-Length: {}\r\n\r\n", payload.len())
                .and_then(|_| out.write_all(payload)),
        };
        let _ = out.flush();
    }

    fn send(&self, message: &Value) {
        self.send_raw(message.to_string().as_bytes());
    }

    fn result(&self, id: &Value, result: Value) {
        self.send(&json!({"jsonrpc": "2.0", "id": id, "result": result}));
    }

    fn error(&self, id: &Value, code: i64, message: &str) {
        self.send(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": code, "message": message},
        }));
    }
}

// ─── Input ───────────────────────────────────────────────────────────────────

fn read_frame(framing: Framing, input: &mut impl BufRead) -> Option<String> {
    match framing {
        Framing::Newline => loop {
            let mut line = String::new();
            if input.read_line(&mut line).ok()? == 0 {
                return None;
            }
            let line = line.trim();
            if !line.is_empty() {
                return Some(line.to_string());
            }
        },
        Framing::ContentLength => {
            let mut length = None;
            loop {
                let mut line = String::new();
                if input.read_line(&mut line).ok()? == 0 {
                    return None;
                }
                let line = line.trim();
                if line.is_empty() {
                    if length.is_some() {
                        break;
                    }
                    continue;
                }
                if let Some((name, value)) = line.split_once(':') {
                    if name.trim().eq_ignore_ascii_case("content-length") {
                        length = value.trim().parse::<usize>().ok();
                    }
                }
            }
            let mut body = vec![0u8; length?];
            input.read_exact(&mut body).ok()?;
            String::from_utf8(body).ok()
        }
    }
}

// ─── Handlers ────────────────────────────────────────────────────────────────

fn tool_definitions() -> Value {
    let empty = || json!({"type": "object", "properties": {}});
    json!([
        {
            "name": "echo",
            "description": "Echo back the input message",
            "inputSchema": {
                "type": "object",
                "properties": {"message": {"type": "string"}},
                "required": ["message"],
            },
        },
        {"name": "get_env_info", "description": "Describe the hosted environment", "inputSchema": empty()},
        {"name": "check_oauth", "description": "Report whether a token was injected", "inputSchema": empty()},
        {
            "name": "sleep",
            "description": "Answer after `ms` milliseconds",
            "inputSchema": {"type": "object", "properties": {"ms": {"type": "integer"}, "message": {"type": "string"}}},
        },
        {"name": "env", "description": "Return one environment variable", "inputSchema": {"type": "object", "properties": {"name": {"type": "string"}}}},
        {"name": "hang", "description": "Never answer", "inputSchema": empty()},
        {"name": "garbage", "description": "Answer with a non-JSON frame", "inputSchema": empty()},
        {"name": "token_frame", "description": "Answer with the bare injected token as a frame", "inputSchema": empty()},
        {"name": "crash", "description": "Exit immediately", "inputSchema": empty()},
        {"name": "stderr_token", "description": "Write the injected token to stderr", "inputSchema": empty()},
        {"name": "stall_list", "description": "Stop answering tools/list", "inputSchema": empty()},
    ])
}

fn text(text: impl Into<String>) -> Value {
    json!({"content": [{"type": "text", "text": text.into()}], "isError": false})
}

fn env_or(name: &str, fallback: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| fallback.to_string())
}

fn injected_token() -> String {
    std::env::var("OAUTH_TOKEN")
        .or_else(|_| std::env::var("ACCESS_TOKEN"))
        .unwrap_or_default()
}

struct Server {
    out: Output,
    stall_list: AtomicBool,
}

impl Server {
    fn handle_request(&self, id: Value, method: &str, params: Value) {
        match method {
            "initialize" => {
                let version = params
                    .get("protocolVersion")
                    .cloned()
                    .unwrap_or_else(|| json!("2024-11-05"));
                self.out.result(
                    &id,
                    json!({
                        "protocolVersion": version,
                        "capabilities": {"tools": {}, "resources": {}},
                        "serverInfo": {"name": "echo-server", "version": env!("CARGO_PKG_VERSION")},
                    }),
                );
            }
            "ping" => self.out.result(&id, json!({})),
            "tools/list" => {
                if !self.stall_list.load(Ordering::SeqCst) {
                    self.out.result(&id, json!({"tools": tool_definitions()}));
                }
            }
            "tools/call" => self.call_tool(id, params),
            "resources/list" => self.out.result(
                &id,
                json!({"resources": [{
                    "uri": "example://hello",
                    "name": "Hello Resource",
                    "description": "A simple example resource",
                    "mimeType": "text/plain",
                }]}),
            ),
            "resources/read" => {
                let uri = params.get("uri").and_then(Value::as_str).unwrap_or_default();
                if uri == "example://hello" {
                    self.out.result(
                        &id,
                        json!({"contents": [{
                            "uri": uri,
                            "mimeType": "text/plain",
                            "text": "Hello from echo-server!",
                        }]}),
                    );
                } else {
                    self.out.error(&id, -32602, &format!("Unknown resource: {uri}"));
                }
            }
            _ => self.out.error(&id, -32601, &format!("Method not found: {method}")),
        }
    }

    fn call_tool(&self, id: Value, params: Value) {
        let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
        let args = params.get("arguments").cloned().unwrap_or(Value::Null);
        let arg = |key: &str| args.get(key).and_then(Value::as_str).unwrap_or_default().to_string();

        match name {
            "echo" => self.out.result(&id, text(format!("Echo: {}", arg("message")))),
            "get_env_info" => self.out.result(
                &id,
                text(format!(
                    "Runtime Environment Information:\n- Tenant ID: {}\n- Connector ID: {}\n- Mode: {}\n- API URL: {}",
                    env_or("TENANT_ID", "not set"),
                    env_or("CONNECTOR_ID", "not set"),
                    env_or("SAGEMCP_MODE", "not set"),
                    env_or("SAGEMCP_API_URL", "not set"),
                )),
            ),
            "check_oauth" => {
                let status = if std::env::var("OAUTH_TOKEN").is_ok_and(|t| !t.is_empty()) {
                    "OAuth token available (OAUTH_TOKEN)"
                } else if std::env::var("ACCESS_TOKEN").is_ok_and(|t| !t.is_empty()) {
                    "OAuth token available (ACCESS_TOKEN)"
                } else {
                    "No OAuth token found in environment"
                };
                self.out.result(&id, text(status));
            }
            "sleep" => {
                let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(0);
                let message = arg("message");
                let out = self.out.clone();
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(ms));
                    out.result(&id, text(format!("slept {ms}ms: {message}")));
                });
            }
            "env" => {
                let value = std::env::var(arg("name")).unwrap_or_default();
                self.out.result(&id, text(value));
            }
            "hang" => {}
            "garbage" => {
                let frame = format!("!!not-json-frame {}", injected_token());
                self.out.send_raw(frame.as_bytes());
            }
            "token_frame" => self.out.send_raw(injected_token().as_bytes()),
            "crash" => std::process::exit(3),
            "stderr_token" => {
                eprintln!("echo-server: token is {}", injected_token());
                self.out.result(&id, text("written to stderr"));
            }
            "stall_list" => {
                self.stall_list.store(true, Ordering::SeqCst);
                self.out.result(&id, text("tools/list stalled"));
            }
            other => self.out.result(
                &id,
                json!({
                    "content": [{"type": "text", "text": format!("Unknown tool: {other}")}],
                    "isError": true,
                }),
            ),
        }
    }
}

fn main() {
    let opts = parse_args();

    if let Some(path) = &opts.counter_file {
        let launch = count_launch(path).unwrap_or(u32::MAX);
        if launch <= opts.fail_launches {
            eprintln!("echo-server: simulated startup failure (launch {launch})");
            std::process::exit(1);
        }
    }

    let framing = if opts.content_length {
        Framing::ContentLength
    } else {
        Framing::Newline
    };
    let server = Server {
        out: Output {
            framing,
            stdout: Arc::new(Mutex::new(std::io::stdout())),
        },
        stall_list: AtomicBool::new(false),
    };

    let mut input = BufReader::new(std::io::stdin());
    while let Some(frame) = read_frame(framing, &mut input) {
        let Ok(message) = serde_json::from_str::<Value>(&frame) else {
            eprintln!("echo-server: unparsable frame ({} bytes)", frame.len());
            continue;
        };
        let Some(method) = message.get("method").and_then(Value::as_str) else {
            continue; // response to a server-initiated request
        };
        let Some(id) = message.get("id").cloned() else {
            continue; // notification
        };
        if method == "initialize" && opts.hang_handshake {
            continue;
        }
        let params = message.get("params").cloned().unwrap_or(Value::Null);
        server.handle_request(id, method, params);
    }

    if opts.ignore_stdin_close {
        loop {
            std::thread::sleep(Duration::from_secs(60));
        }
    }
}
