//! Line-oriented UI front end for a [`ScriptShell`].
//!
//! Requests arrive on stdin, one JSON object per line:
//!
//! ```json
//! {"command":"exec-script","data":{"scriptName":"deploy"},"responseId":"r-1"}
//! {"command":"start-log-to-front"}
//! ```
//!
//! A request with a `responseId` is answered on stdout with that id; one
//! without is a notification. `timeoutMs` overrides the configured timeout,
//! and `0` waits for as long as the command takes. UI events (progress,
//! piped logs) share stdout through [`JsonlSurface`](crate::shell::JsonlSurface).

use std::io::{BufRead, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::ResultExt;
use crate::logging;
use crate::protocol::log_preview;
use crate::request::Response;
use crate::shell::ScriptShell;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiRequest {
    pub command: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub response_id: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UiResponse {
    pub response_id: String,
    pub command: String,
    #[serde(flatten)]
    pub response: Response,
}

/// Read requests on a background thread until EOF or a read error
pub fn start_listener<R>(reader: R) -> async_channel::Receiver<UiRequest>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = async_channel::bounded(100);

    thread::spawn(move || {
        logging::log("SERVE", "UI request listener started");
        for line in reader.lines() {
            match line {
                Ok(line) if !line.trim().is_empty() => {
                    match serde_json::from_str::<UiRequest>(&line) {
                        Ok(request) => {
                            if tx.send_blocking(request).is_err() {
                                logging::log("SERVE", "Request channel closed, exiting");
                                break;
                            }
                        }
                        Err(e) => {
                            let (preview, len) = log_preview(&line);
                            warn!(error = %e, preview = %preview, raw_len = len, "Skipping malformed request");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    logging::log("SERVE", &format!("Error reading requests: {}", e));
                    break;
                }
            }
        }
        logging::log("SERVE", "UI request listener exiting");
    });

    rx
}

/// Serve requests until the input closes, then stop every script and wait
/// for in-flight requests to answer.
pub fn serve<R, W>(shell: Arc<ScriptShell>, reader: R, out: Arc<Mutex<W>>)
where
    R: BufRead + Send + 'static,
    W: Write + Send + 'static,
{
    let requests = start_listener(reader);
    let mut in_flight: Vec<JoinHandle<()>> = Vec::new();

    while let Ok(request) = requests.recv_blocking() {
        in_flight.retain(|handle| !handle.is_finished());
        debug!(command = %request.command, response_id = ?request.response_id, "UI request");

        let Some(response_id) = request.response_id.clone() else {
            shell.commands().notify(&request.command, request.data);
            continue;
        };
        let shell = Arc::clone(&shell);
        let out = Arc::clone(&out);
        in_flight.push(thread::spawn(move || {
            let response = answer(&shell, &request);
            write_response(
                &out,
                &UiResponse {
                    response_id,
                    command: request.command,
                    response,
                },
            );
        }));
    }

    info!(in_flight = in_flight.len(), "UI input closed, shutting down");
    shell.shutdown();
    for handle in in_flight {
        if handle.join().is_err() {
            warn!("Request thread panicked");
        }
    }
}

fn answer(shell: &ScriptShell, request: &UiRequest) -> Response {
    let timeout = match request.timeout_ms {
        Some(0) => None,
        Some(ms) => Some(Duration::from_millis(ms)),
        None => Some(shell.commands().timeout()),
    };
    shell
        .commands()
        .request_with_timeout(&request.command, request.data.clone(), timeout)
        .unwrap_or_else(|e| Response::error(e.user_message()))
}

fn write_response<W: Write>(out: &Mutex<W>, response: &UiResponse) {
    let line = match serde_json::to_string(response) {
        Ok(line) => line,
        Err(e) => {
            warn!(error = %e, "Failed to serialize response");
            return;
        }
    };
    let mut out = out.lock();
    writeln!(out, "{}", line).and_then(|_| out.flush()).log_err();
}
