use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

/// A CDP event received from the browser.
struct CdpEvent {
    method: String,
    params: Value,
}

/// A console message captured from the page (`Runtime.consoleAPICalled`).
#[derive(Debug, Clone)]
pub struct ConsoleMessage {
    pub level: String,
    pub text: String,
}

/// Per-target WebSocket CDP connection.
///
/// Each tab gets its own connection — no multiplexing, no contention.
/// Reads are inline (no background task) since each connection is single-owner.
pub struct CdpConnection {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: u64,
    event_buffer: Vec<CdpEvent>,
    console: Vec<ConsoleMessage>,
    crashed: bool,
}

impl CdpConnection {
    /// Connect to a per-target CDP WebSocket URL.
    pub async fn connect(url: &str) -> Result<Self> {
        debug!(url, "connecting CDP WebSocket");
        let (ws, _) = connect_async(url)
            .await
            .with_context(|| format!("Failed to connect to {url}"))?;
        debug!(url, "CDP WebSocket connected");

        Ok(Self {
            ws,
            next_id: 1,
            event_buffer: Vec::new(),
            console: Vec::new(),
            crashed: false,
        })
    }

    /// Send a CDP command and wait for the matching response (by id).
    /// Events received while waiting are buffered for later retrieval.
    pub async fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id;
        self.next_id += 1;

        let msg = json!({
            "id": id,
            "method": method,
            "params": params,
        });

        self.ws
            .send(Message::Text(msg.to_string().into()))
            .await
            .with_context(|| format!("Failed to send CDP command {method}"))?;

        // Read messages until we get the matching response.
        loop {
            let raw = self
                .ws
                .next()
                .await
                .context("WebSocket closed while waiting for response")?
                .context("WebSocket error")?;

            let Message::Text(text) = raw else {
                continue; // Skip binary/ping/pong frames
            };

            let parsed: Value =
                serde_json::from_str(&text).context("Failed to parse CDP message")?;

            // Check if this is our response (has matching id).
            if parsed.get("id").and_then(|v| v.as_u64()) == Some(id) {
                if let Some(error) = parsed.get("error") {
                    bail!(
                        "CDP error for {method}: {}",
                        serde_json::to_string(error).unwrap_or_default()
                    );
                }
                return Ok(parsed.get("result").cloned().unwrap_or(Value::Null));
            }

            // Otherwise it's an event — buffer it.
            if let Some(event_method) = parsed.get("method").and_then(|v| v.as_str()) {
                self.buffer_event(CdpEvent {
                    method: event_method.to_string(),
                    params: parsed.get("params").cloned().unwrap_or(Value::Null),
                });
            }
        }
    }

    /// Wait for a specific CDP event (by method name).
    /// Checks the buffer first, then reads from the WebSocket.
    pub async fn wait_event(&mut self, method: &str) -> Result<Value> {
        if let Some(idx) = self.event_buffer.iter().position(|e| e.method == method) {
            return Ok(self.event_buffer.remove(idx).params);
        }

        loop {
            let (event_method, params) = self.read_event().await?;
            if event_method == method {
                return Ok(params);
            }
            self.buffer_event(CdpEvent {
                method: event_method,
                params,
            });
        }
    }

    /// Wait for the DOMContentLoaded event. Returns `false` on timeout so the
    /// caller can fall back to polling `document.readyState`.
    pub async fn wait_dom_content_loaded(&mut self, timeout: Duration) -> Result<bool> {
        match tokio::time::timeout(timeout, self.wait_event("Page.domContentEventFired")).await {
            Ok(Ok(_)) => {
                debug!("DOMContentLoaded received");
                Ok(true)
            }
            Ok(Err(e)) => Err(e).context("Error waiting for DOMContentLoaded"),
            Err(_) => {
                warn!("DOMContentLoaded timed out, falling back to readyState polling");
                Ok(false)
            }
        }
    }

    /// Evaluate a synchronous JS expression and return its value.
    pub async fn eval(&mut self, expression: &str) -> Result<Value> {
        let result = self
            .call(
                "Runtime.evaluate",
                json!({"expression": expression, "returnByValue": true}),
            )
            .await
            .context("JS evaluation failed")?;
        Self::check_js_exception(&result)?;
        Ok(result)
    }

    /// Evaluate a JS expression and await its promise.
    pub async fn eval_async(&mut self, expression: &str) -> Result<Value> {
        let snippet: String = expression.chars().take(80).collect();
        debug!(snippet, "eval_async");
        let result = self
            .call(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "awaitPromise": true,
                    "returnByValue": true,
                }),
            )
            .await
            .context("JS evaluation failed")?;
        debug!("eval_async done");
        Self::check_js_exception(&result)?;
        Ok(result)
    }

    /// Register a script to run in every new document before any page script.
    pub async fn add_init_script(&mut self, source: &str) -> Result<()> {
        self.call(
            "Page.addScriptToEvaluateOnNewDocument",
            json!({"source": source, "runImmediately": true}),
        )
        .await
        .context("Failed to add init script")?;
        Ok(())
    }

    /// Capture a PNG screenshot and return decoded bytes.
    ///
    /// `full_page` captures the entire CSS content size via
    /// `captureBeyondViewport`; otherwise the visible viewport is captured.
    pub async fn capture_screenshot(&mut self, full_page: bool) -> Result<Vec<u8>> {
        let params = if full_page {
            let metrics = self
                .call("Page.getLayoutMetrics", json!({}))
                .await
                .context("Failed to get layout metrics")?;
            let content = &metrics["cssContentSize"];
            let width = content["width"].as_f64().unwrap_or(1.0).max(1.0);
            let height = content["height"].as_f64().unwrap_or(1.0).max(1.0);
            json!({
                "format": "png",
                "captureBeyondViewport": true,
                "clip": {
                    "x": 0,
                    "y": 0,
                    "width": width,
                    "height": height,
                    "scale": 1,
                },
            })
        } else {
            json!({"format": "png"})
        };

        let result = self
            .call("Page.captureScreenshot", params)
            .await
            .context("Failed to capture screenshot")?;

        let b64_data = result["data"]
            .as_str()
            .context("No screenshot data in response")?;

        use base64::Engine;
        base64::engine::general_purpose::STANDARD
            .decode(b64_data)
            .context("Failed to decode base64 screenshot")
    }

    /// Bail if a `Runtime.evaluate` result contains an exception.
    fn check_js_exception(result: &Value) -> Result<()> {
        if let Some(desc) = result
            .get("exceptionDetails")
            .and_then(|e| e.get("exception"))
            .and_then(|e| e.get("description"))
            .and_then(|d| d.as_str())
        {
            bail!("JS error: {desc}");
        }
        Ok(())
    }

    /// Navigate to a URL and wait for the main-document response status.
    ///
    /// Clears the event buffer first — events from prior navigations on this
    /// tab are stale. Returns the HTTP status of the document response, or
    /// `None` when no response arrived within `response_timeout` (e.g. a
    /// file:// URL or a hung server; the caller decides how to proceed).
    pub async fn navigate(&mut self, url: &str, response_timeout: Duration) -> Result<Option<u16>> {
        let stale = self.event_buffer.len();
        self.event_buffer.clear();
        debug!(url, stale_events_cleared = stale, "navigating");
        let result = self
            .call("Page.navigate", json!({"url": url}))
            .await
            .context("Failed to navigate")?;
        if let Some(err) = result.get("errorText").and_then(|v| v.as_str())
            && !err.is_empty()
        {
            bail!("Navigation failed: {err}");
        }
        debug!(url, frame_id = ?result.get("frameId"), "navigation committed");

        // Watch for the main-document response to learn the HTTP status.
        let deadline = tokio::time::Instant::now() + response_timeout;
        loop {
            if let Some(status) = self.find_document_status() {
                return Ok(Some(status));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            match tokio::time::timeout(deadline - now, self.read_event()).await {
                Err(_) => return Ok(None),
                Ok(result) => {
                    let (method, params) = result?;
                    self.buffer_event(CdpEvent { method, params });
                }
            }
        }
    }

    /// Scan the buffer for a `Network.responseReceived` of type `Document`.
    fn find_document_status(&self) -> Option<u16> {
        self.event_buffer.iter().find_map(|e| {
            if e.method != "Network.responseReceived" {
                return None;
            }
            if e.params.get("type").and_then(|v| v.as_str()) != Some("Document") {
                return None;
            }
            e.params
                .get("response")
                .and_then(|r| r.get("status"))
                .and_then(|s| s.as_u64())
                .map(|s| s as u16)
        })
    }

    /// Set the emulated viewport size.
    pub async fn set_viewport(&mut self, width: u32, height: u32) -> Result<()> {
        self.call(
            "Emulation.setDeviceMetricsOverride",
            json!({
                "width": width,
                "height": height,
                "deviceScaleFactor": 1,
                "mobile": false,
            }),
        )
        .await
        .context("Failed to set device metrics")?;
        Ok(())
    }

    /// Enable the CDP domains this connection relies on.
    ///
    /// Page for lifecycle events, Network for the document response status,
    /// Runtime for console capture, Inspector for crash notifications.
    pub async fn enable_domains(&mut self) -> Result<()> {
        self.call("Page.enable", json!({}))
            .await
            .context("Failed to enable Page domain")?;
        self.call("Network.enable", json!({}))
            .await
            .context("Failed to enable Network domain")?;
        self.call("Runtime.enable", json!({}))
            .await
            .context("Failed to enable Runtime domain")?;
        self.call("Inspector.enable", json!({}))
            .await
            .context("Failed to enable Inspector domain")?;
        Ok(())
    }

    /// Whether the target has reported a crash (`Inspector.targetCrashed`).
    pub fn crashed(&self) -> bool {
        self.crashed
    }

    /// Drain the console messages captured so far.
    pub fn take_console_messages(&mut self) -> Vec<ConsoleMessage> {
        std::mem::take(&mut self.console)
    }

    /// Record an event in the buffer, siphoning off console messages and
    /// crash notifications.
    fn buffer_event(&mut self, event: CdpEvent) {
        match event.method.as_str() {
            "Inspector.targetCrashed" => {
                warn!("target crashed");
                self.crashed = true;
            }
            "Runtime.consoleAPICalled" => {
                let level = event
                    .params
                    .get("type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("log")
                    .to_string();
                let text = event
                    .params
                    .get("args")
                    .and_then(|v| v.as_array())
                    .map(|args| {
                        args.iter()
                            .map(describe_remote_object)
                            .collect::<Vec<_>>()
                            .join(" ")
                    })
                    .unwrap_or_default();
                self.console.push(ConsoleMessage { level, text });
            }
            _ => self.event_buffer.push(event),
        }
    }

    /// Read the next CDP event from the WebSocket, skipping non-event messages.
    async fn read_event(&mut self) -> Result<(String, Value)> {
        loop {
            let raw = self
                .ws
                .next()
                .await
                .context("WebSocket closed while waiting for event")?
                .context("WebSocket error")?;

            let Message::Text(text) = raw else {
                continue;
            };

            let parsed: Value =
                serde_json::from_str(&text).context("Failed to parse CDP message")?;

            if let Some(method) = parsed.get("method").and_then(|v| v.as_str()) {
                let params = parsed.get("params").cloned().unwrap_or(Value::Null);
                return Ok((method.to_string(), params));
            }
            // Skip non-event messages (stale responses).
        }
    }
}

/// Render a CDP RemoteObject as log text.
fn describe_remote_object(obj: &Value) -> String {
    if let Some(v) = obj.get("value") {
        match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    } else if let Some(desc) = obj.get("description").and_then(|d| d.as_str()) {
        desc.to_string()
    } else {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_object_string_value() {
        let obj = json!({"type": "string", "value": "hello"});
        assert_eq!(describe_remote_object(&obj), "hello");
    }

    #[test]
    fn remote_object_numeric_value() {
        let obj = json!({"type": "number", "value": 42});
        assert_eq!(describe_remote_object(&obj), "42");
    }

    #[test]
    fn remote_object_falls_back_to_description() {
        let obj = json!({"type": "object", "description": "HTMLDivElement"});
        assert_eq!(describe_remote_object(&obj), "HTMLDivElement");
    }
}
