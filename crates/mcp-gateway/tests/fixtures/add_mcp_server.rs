//! Minimal stdio MCP server for integration testing.
//!
//! Reads newline-delimited JSON from stdin and writes newline-delimited JSON
//! to stdout. Before anything else it prints a non-protocol banner line, as
//! many real servers do, so the gateway's framer has something to skip.
//!
//! # Supported methods
//!
//! - `initialize`: echoes the requested protocol version
//! - `tools/list`: lists `add`, `pid` and `crash`
//! - `tools/call`: `add(a, b)` sums two numbers, `pid` reports the process
//!   id, `crash` exits with code 42
//! - notifications (including `reset`): accepted, no response

use serde_json::{Value, json};
use std::io::{BufRead, BufReader, Write};

fn main() {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let reader = BufReader::new(stdin.lock());
    let mut writer = stdout.lock();

    let _ = writeln!(writer, "add-mcp-server starting (pid {})", std::process::id());
    let _ = writer.flush();

    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        let msg: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => continue,
        };
        handle_message(&msg, &mut writer);
    }
}

fn handle_message(msg: &Value, writer: &mut impl Write) {
    let Some(method) = msg.get("method").and_then(|v| v.as_str()) else {
        return;
    };
    let Some(id) = msg.get("id").cloned() else {
        return;
    };

    let result = match method {
        "initialize" => {
            let version = msg
                .pointer("/params/protocolVersion")
                .cloned()
                .unwrap_or(json!("2024-11-05"));
            json!({
                "protocolVersion": version,
                "capabilities": { "tools": {} },
                "serverInfo": { "name": "add-mcp-server", "version": "0.1.0" }
            })
        }
        "tools/list" => json!({
            "tools": [
                {
                    "name": "add",
                    "description": "Add two numbers",
                    "inputSchema": {
                        "type": "object",
                        "properties": { "a": {"type": "number"}, "b": {"type": "number"} },
                        "required": ["a", "b"]
                    }
                },
                { "name": "pid", "description": "Report the server process id", "inputSchema": {"type": "object"} },
                { "name": "crash", "description": "Exit with code 42", "inputSchema": {"type": "object"} }
            ]
        }),
        "tools/call" => {
            let name = msg.pointer("/params/name").and_then(|v| v.as_str()).unwrap_or("");
            match name {
                "add" => {
                    let a = msg.pointer("/params/arguments/a").and_then(Value::as_i64).unwrap_or(0);
                    let b = msg.pointer("/params/arguments/b").and_then(Value::as_i64).unwrap_or(0);
                    text_result(format!("The sum of {a} and {b} is {}.", a + b))
                }
                "pid" => text_result(std::process::id().to_string()),
                "crash" => std::process::exit(42),
                other => {
                    write_msg(
                        writer,
                        &json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "error": { "code": -32602, "message": format!("MCP error -32602: Unknown tool: {other}") }
                        }),
                    );
                    return;
                }
            }
        }
        other => {
            write_msg(
                writer,
                &json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": -32601, "message": format!("Method not found: {other}") }
                }),
            );
            return;
        }
    };
    write_msg(writer, &json!({ "jsonrpc": "2.0", "id": id, "result": result }));
}

fn text_result(text: String) -> Value {
    json!({ "content": [{ "type": "text", "text": text }] })
}

fn write_msg(writer: &mut impl Write, msg: &Value) {
    let _ = writeln!(writer, "{msg}");
    let _ = writer.flush();
}
