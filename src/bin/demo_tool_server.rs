//! A small line-delimited JSON-RPC tool server over stdio.
//!
//! Used by the integration tests and handy for trying the server locally:
//!
//! ```text
//! vox-demo-tool-server [--name <server>] [--fail-init] [--tools-only]
//! ```
//!
//! Tools: `read_file`, `echo`, `fail`, `slow`, `crash`. One resource,
//! `demo://<name>/readme`, unless `--tools-only` is given.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::Mutex;

struct Options {
    name: String,
    fail_init: bool,
    tools_only: bool,
}

impl Options {
    fn parse() -> Self {
        let mut opts = Self {
            name: std::env::var("DEMO_SERVER_NAME").unwrap_or_else(|_| "demo".to_string()),
            fail_init: false,
            tools_only: false,
        };
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--name" => {
                    if let Some(name) = args.next() {
                        opts.name = name;
                    }
                }
                "--fail-init" => opts.fail_init = true,
                "--tools-only" => opts.tools_only = true,
                other => eprintln!("ignoring unknown argument {other}"),
            }
        }
        opts
    }

    fn readme_uri(&self) -> String {
        format!("demo://{}/readme", self.name)
    }
}

type Out = Arc<Mutex<Stdout>>;

async fn write_line(out: &Out, msg: &Value) {
    let mut line = msg.to_string();
    line.push('\n');
    let mut stdout = out.lock().await;
    let _ = stdout.write_all(line.as_bytes()).await;
    let _ = stdout.flush().await;
}

fn text_result(text: impl Into<String>) -> Value {
    json!({ "content": [{ "type": "text", "text": text.into() }] })
}

fn tool_error(text: impl Into<String>) -> Value {
    json!({ "isError": true, "content": [{ "type": "text", "text": text.into() }] })
}

fn tools() -> Value {
    json!({ "tools": [
        {
            "name": "read_file",
            "description": "Read a UTF-8 file",
            "inputSchema": {
                "type": "object",
                "properties": { "path": { "type": "string" } },
                "required": ["path"]
            }
        },
        {
            "name": "echo",
            "description": "Return the arguments unchanged",
            "inputSchema": { "type": "object" }
        },
        {
            "name": "fail",
            "description": "Always reports a tool error",
            "inputSchema": { "type": "object" }
        },
        {
            "name": "slow",
            "description": "Answer after `ms` milliseconds",
            "inputSchema": {
                "type": "object",
                "properties": { "ms": { "type": "integer" } }
            }
        },
        {
            "name": "crash",
            "description": "Exit the process immediately",
            "inputSchema": { "type": "object" }
        }
    ]})
}

async fn call_tool(params: &Value) -> Result<Value, (i64, String)> {
    let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
    let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    match name {
        "read_file" => {
            let path = args.get("path").and_then(Value::as_str).unwrap_or_default();
            Ok(match tokio::fs::read_to_string(path).await {
                Ok(content) => text_result(content),
                Err(e) => tool_error(format!("cannot read {path}: {e}")),
            })
        }
        "echo" => Ok(text_result(args.to_string())),
        "fail" => Ok(tool_error("the fail tool always fails")),
        "slow" => {
            let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(1_000);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(text_result(format!("slept {ms}ms")))
        }
        "crash" => std::process::exit(3),
        other => Err((-32602, format!("unknown tool {other}"))),
    }
}

async fn handle(opts: &Options, method: &str, params: &Value) -> Result<Value, (i64, String)> {
    match method {
        "initialize" if opts.fail_init => Err((-32603, "initialization refused".to_string())),
        "initialize" => Ok(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": { "tools": {}, "resources": {} },
            "serverInfo": { "name": opts.name, "version": env!("CARGO_PKG_VERSION") }
        })),
        "tools/list" => Ok(tools()),
        "resources/list" if opts.tools_only => Err((-32601, "Method not found".to_string())),
        "resources/list" => Ok(json!({ "resources": [{
            "uri": opts.readme_uri(),
            "name": "readme",
            "mimeType": "text/plain"
        }]})),
        "resources/read" => {
            let uri = params.get("uri").and_then(Value::as_str).unwrap_or_default();
            if !opts.tools_only && uri == opts.readme_uri() {
                Ok(json!({ "contents": [{
                    "uri": uri,
                    "mimeType": "text/plain",
                    "text": format!("{} demo tool server", opts.name)
                }]}))
            } else {
                Err((-32002, format!("resource not found: {uri}")))
            }
        }
        "tools/call" => call_tool(params).await,
        _ => Err((-32601, "Method not found".to_string())),
    }
}

#[tokio::main]
async fn main() {
    let opts = Arc::new(Options::parse());
    let out: Out = Arc::new(Mutex::new(tokio::io::stdout()));

    eprintln!("{} demo tool server starting", opts.name);
    {
        let mut stdout = out.lock().await;
        let _ = stdout.write_all(b"this line is not json\n").await;
    }
    write_line(
        &out,
        &json!({
            "jsonrpc": "2.0",
            "method": "notifications/message",
            "params": { "level": "info", "data": format!("{} ready", opts.name) }
        }),
    )
    .await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(msg) = serde_json::from_str::<Value>(&line) else {
            eprintln!("unparseable input: {line}");
            continue;
        };
        let Some(method) = msg.get("method").and_then(Value::as_str).map(str::to_string) else {
            continue;
        };
        let Some(id) = msg.get("id").cloned() else {
            if method == "shutdown" {
                eprintln!("shutdown requested");
                break;
            }
            continue;
        };
        let params = msg.get("params").cloned().unwrap_or(Value::Null);

        let opts = Arc::clone(&opts);
        let out = Arc::clone(&out);
        tokio::spawn(async move {
            let reply = match handle(&opts, &method, &params).await {
                Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
                Err((code, message)) => json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": code, "message": message }
                }),
            };
            write_line(&out, &reply).await;
        });
    }
}
