//! Browser host spoken to over JSON lines.
//!
//! The browser-side bridge writes page messages (`Inbound`) and replies to
//! our requests on our stdin; we write requests on stdout:
//!
//! ```text
//! -> {"id":4,"op":"post","args":{"port":"2","message":{"type":"dom","value":[...]}}}
//! <- {"reply":4,"result":{"delivered":true}}
//! <- {"port":"2","state":"replaying","message":{"type":"ack","value":{"type":"SUCCESS"}}}
//! ```

use crate::errors::ReplayError;
use crate::log_retention::enforce_total_budget;
use crate::logging::append_run_log;
use crate::protocol::{CoreMessage, Inbound};
use crate::runtime::{BrowserHost, Operator, TabInfo};
use crate::types::TabId;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};

#[derive(Default)]
struct ReplyBook {
    waiting: HashMap<u64, oneshot::Sender<Value>>,
    closed: bool,
}

pub struct StdioHost {
    inbound_rx: Mutex<mpsc::UnboundedReceiver<Inbound>>,
    replies: Arc<Mutex<ReplyBook>>,
    next_request: AtomicU64,
    out: Mutex<Box<dyn Write + Send>>,
    screenshot_dir: PathBuf,
    screenshot_budget_bytes: u64,
}

impl StdioHost {
    pub fn from_stdio(screenshot_dir: PathBuf, screenshot_budget_bytes: u64) -> Self {
        let stdin = std::io::BufReader::new(std::io::stdin());
        Self::spawn(stdin, std::io::stdout(), screenshot_dir, screenshot_budget_bytes)
    }

    pub fn spawn<R, W>(
        reader: R,
        writer: W,
        screenshot_dir: PathBuf,
        screenshot_budget_bytes: u64,
    ) -> Self
    where
        R: BufRead + Send + 'static,
        W: Write + Send + 'static,
    {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let replies = Arc::new(Mutex::new(ReplyBook::default()));
        let book = Arc::clone(&replies);
        thread::spawn(move || {
            read_loop(reader, inbound_tx, &book);
            let mut book = book.lock().expect("reply lock");
            book.closed = true;
            book.waiting.clear();
        });

        Self {
            inbound_rx: Mutex::new(inbound_rx),
            replies,
            next_request: AtomicU64::new(1),
            out: Mutex::new(Box::new(writer)),
            screenshot_dir,
            screenshot_budget_bytes,
        }
    }

    fn write_line(&self, value: &Value) -> Result<(), ReplayError> {
        let line = serde_json::to_string(value).map_err(|e| ReplayError::Host(e.to_string()))?;
        let mut out = self
            .out
            .lock()
            .map_err(|_| ReplayError::Host("output lock poisoned".to_string()))?;
        out.write_all(line.as_bytes())
            .and_then(|_| out.write_all(b"\n"))
            .and_then(|_| out.flush())
            .map_err(|e| ReplayError::Io(e.to_string()))
    }

    /// Send a request and block until the bridge answers it.
    fn request(&self, op: &str, args: Value) -> Result<Value, ReplayError> {
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut book = self
                .replies
                .lock()
                .map_err(|_| ReplayError::Host("reply lock poisoned".to_string()))?;
            if book.closed {
                return Err(ReplayError::Host(format!("host closed before {op}")));
            } else {
                book.waiting.insert(id, reply_tx);
            }
        }

        self.write_line(&json!({"id": id, "op": op, "args": args}))?;
        let result = reply_rx
            .blocking_recv()
            .map_err(|_| ReplayError::Host(format!("host closed during {op}")))?;
        if let Some(error) = result.get("error").and_then(Value::as_str) {
            return Err(ReplayError::Host(format!("{op}: {error}")));
        }
        Ok(result)
    }
}

/// Bytes that are not UTF-8 are replaced rather than ending the stream, so
/// one bad line from the bridge costs only that line.
fn read_loop<R: BufRead>(
    mut reader: R,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    replies: &Mutex<ReplyBook>,
) {
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                append_run_log(
                    "warn",
                    "host.inbound.read_failed",
                    json!({"error": err.to_string()}),
                );
                break;
            }
        }
        let line = String::from_utf8_lossy(&raw);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value = match serde_json::from_str::<Value>(line) {
            Ok(value) => value,
            Err(err) => {
                append_run_log(
                    "warn",
                    "host.inbound.malformed",
                    json!({"error": err.to_string(), "line": line.chars().take(256).collect::<String>()}),
                );
                continue;
            }
        };

        if let Some(id) = value.get("reply").and_then(Value::as_u64) {
            let result = value.get("result").cloned().unwrap_or(Value::Null);
            let Ok(mut book) = replies.lock() else {
                break;
            };
            match book.waiting.remove(&id) {
                Some(tx) => {
                    let _ = tx.send(result);
                }
                None => append_run_log("warn", "host.reply.unmatched", json!({"reply": id})),
            }
            continue;
        }

        match serde_json::from_value::<Inbound>(value) {
            Ok(inbound) => {
                if inbound_tx.send(inbound).is_err() {
                    break;
                }
            }
            Err(err) => append_run_log(
                "warn",
                "host.inbound.unknown",
                json!({"error": err.to_string()}),
            ),
        }
    }
}

fn screenshot_name(label: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let label = label
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect::<String>();
    format!("{millis}-{label}.png")
}

impl BrowserHost for StdioHost {
    fn post(&self, port: &str, message: CoreMessage) -> Result<(), ReplayError> {
        let message = serde_json::to_value(&message).map_err(|e| ReplayError::Host(e.to_string()))?;
        let result = self.request("post", json!({"port": port, "message": message}))?;
        if result.get("delivered").and_then(Value::as_bool) == Some(false) {
            return Err(ReplayError::ChannelClosed(port.to_string()));
        }
        Ok(())
    }

    fn broadcast(&self, message: CoreMessage) -> Result<(), ReplayError> {
        let message = serde_json::to_value(&message).map_err(|e| ReplayError::Host(e.to_string()))?;
        self.write_line(&json!({"op": "broadcast", "args": {"message": message}}))
    }

    fn poll_inbound(&self) -> Result<Vec<Inbound>, ReplayError> {
        let mut rx = self
            .inbound_rx
            .lock()
            .map_err(|_| ReplayError::Host("inbound lock poisoned".to_string()))?;
        let mut out = Vec::new();
        while let Ok(inbound) = rx.try_recv() {
            out.push(inbound);
        }
        Ok(out)
    }

    fn open_tabs(&self) -> Result<Vec<TabId>, ReplayError> {
        let result = self.request("openTabs", Value::Null)?;
        serde_json::from_value(result).map_err(|e| ReplayError::Host(e.to_string()))
    }

    fn create_tab(&self, url: &str) -> Result<TabId, ReplayError> {
        let result = self.request("createTab", json!({"url": url, "active": true}))?;
        result
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| ReplayError::Host("createTab reply without id".to_string()))
    }

    fn get_tab(&self, tab: TabId) -> Result<Option<TabInfo>, ReplayError> {
        let result = self.request("getTab", json!({"tab": tab}))?;
        if result.is_null() {
            return Ok(None);
        }
        serde_json::from_value(result)
            .map(Some)
            .map_err(|e| ReplayError::Host(e.to_string()))
    }

    fn remove_tab(&self, tab: TabId) -> Result<(), ReplayError> {
        self.request("removeTab", json!({"tab": tab})).map(|_| ())
    }

    fn foreground_tab(&self) -> Result<Option<TabId>, ReplayError> {
        let result = self.request("foregroundTab", Value::Null)?;
        Ok(result.get("id").and_then(Value::as_i64))
    }

    fn capture_screenshot(&self, tab: TabId, label: &str) -> Result<(), ReplayError> {
        std::fs::create_dir_all(&self.screenshot_dir).map_err(|e| ReplayError::Io(e.to_string()))?;
        let path = self.screenshot_dir.join(screenshot_name(label));
        self.request(
            "captureScreenshot",
            json!({"tab": tab, "path": path.display().to_string()}),
        )?;
        enforce_total_budget(&self.screenshot_dir, self.screenshot_budget_bytes)?;
        Ok(())
    }
}

impl Operator for StdioHost {
    fn ask(&self, prompt: &str) -> Result<String, ReplayError> {
        let result = self.request("ask", json!({"prompt": prompt}))?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ReplayError::Host("ask reply is not text".to_string()))
    }
}
