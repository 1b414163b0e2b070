use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct CallOutput<'a> {
    method: &'a str,
    ok: bool,
    result_size: usize,
    result: String,
    elapsed_ms: u128,
    timestamp: String,
}

/// Print the outcome of one remote method call.
pub fn print_call(
    method: &str,
    result: Result<&[u8], &str>,
    elapsed_ms: u128,
    format: OutputFormat,
) {
    let (ok, body) = match result {
        Ok(data) => (true, payload_preview(data)),
        Err(message) => (false, message.to_string()),
    };
    let size = match result {
        Ok(data) => data.len(),
        Err(message) => message.len(),
    };

    match format {
        OutputFormat::Json => {
            let out = CallOutput {
                method,
                ok,
                result_size: size,
                result: body,
                elapsed_ms,
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["METHOD", "STATUS", "SIZE", "RESULT"])
                .add_row(vec![
                    method.to_string(),
                    status(ok).to_string(),
                    size.to_string(),
                    body,
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "method={method} status={} size={size} elapsed={elapsed_ms}ms result={body}",
                status(ok)
            );
        }
        OutputFormat::Raw => match result {
            Ok(data) => print_raw(data),
            Err(message) => print_raw(message.as_bytes()),
        },
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn status(ok: bool) -> &'static str {
    if ok {
        "ok"
    } else {
        "error"
    }
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
