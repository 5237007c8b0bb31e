use std::path::PathBuf;

use clap::Parser;
use serde_json::{json, Value};

use record_proxy::record::read_record;
use record_proxy::record::schema::HttpMessage;

#[derive(Parser)]
#[command(name = "record-inspect")]
#[command(about = "Print recorded request/response pairs as JSON", long_about = None)]
struct Cli {
    /// Include message bodies (lossy UTF-8).
    #[arg(short, long)]
    body: bool,

    /// Record files to decode.
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let mut failed = false;

    for path in &cli.files {
        match read_record(path) {
            Ok(record) => {
                let value = json!({
                    "file": path.display().to_string(),
                    "destination": {
                        "ip": record.ip,
                        "port": record.port,
                        "scheme": record.scheme,
                    },
                    "request": record.request.as_ref().map(|m| message_json(m, cli.body)),
                    "response": record.response.as_ref().map(|m| message_json(m, cli.body)),
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
            Err(e) => {
                eprintln!("Error: {}: {}", path.display(), e);
                failed = true;
            }
        }
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn message_json(message: &HttpMessage, with_body: bool) -> Value {
    let headers: Vec<Value> = message
        .header
        .iter()
        .map(|h| {
            json!({
                "name": String::from_utf8_lossy(&h.key),
                "value": String::from_utf8_lossy(&h.value),
            })
        })
        .collect();

    let mut value = json!({
        "first_line": String::from_utf8_lossy(&message.first_line),
        "headers": headers,
        "body_bytes": message.body.len(),
    });
    if with_body {
        value["body"] = Value::String(String::from_utf8_lossy(&message.body).into_owned());
    }
    value
}
