use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use super::scripts;
use crate::artifacts::ArtifactManager;
use crate::cdp::{CdpConnection, ConsoleMessage};
use crate::storybook::Story;

/// Page state captured alongside a timeout/crash dump.
#[derive(Serialize)]
struct PageStateDump {
    story_id: String,
    url: String,
    error: String,
    page_state: serde_json::Value,
}

/// Dump whatever is reachable about a wedged page: the serialized DOM, a
/// JSON probe of page state, and the buffered console messages.
///
/// Best-effort: a crashed target answers none of these, and a failed dump
/// never masks the original error.
pub async fn write_dumps(
    conn: &mut CdpConnection,
    story: &Story,
    artifacts: &ArtifactManager,
    error: &str,
) {
    let dir = artifacts.dump_dir();
    if let Err(e) = std::fs::create_dir_all(&dir) {
        warn!(error = %e, "failed to create timeout-dumps directory");
        return;
    }
    let safe_id = story.safe_id();

    match conn.eval(scripts::OUTER_HTML_JS).await {
        Ok(result) => {
            if let Some(html) = result["result"]["value"].as_str() {
                write_dump(&dir, &safe_id, "html", html.as_bytes());
            }
        }
        Err(e) => debug!(error = %format!("{e:#}"), "could not dump page HTML"),
    }

    let page_state = match conn.eval(scripts::PAGE_STATE_JS).await {
        Ok(result) => result["result"]["value"]
            .as_str()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or(serde_json::Value::Null),
        Err(e) => {
            debug!(error = %format!("{e:#}"), "could not probe page state");
            serde_json::Value::Null
        }
    };
    let state = PageStateDump {
        story_id: story.id.clone(),
        url: story.url.clone(),
        error: error.to_string(),
        page_state,
    };
    if let Ok(json) = serde_json::to_vec_pretty(&state) {
        write_dump(&dir, &safe_id, "json", &json);
    }

    let console = conn.take_console_messages();
    write_dump(&dir, &safe_id, "console.txt", render_console(&console).as_bytes());
}

fn write_dump(dir: &Path, safe_id: &str, ext: &str, bytes: &[u8]) {
    let path = dump_path(dir, safe_id, ext);
    if let Err(e) = std::fs::write(&path, bytes) {
        warn!(path = %path.display(), error = %e, "failed to write dump");
    }
}

pub(crate) fn dump_path(dir: &Path, safe_id: &str, ext: &str) -> PathBuf {
    dir.join(format!("{safe_id}.{ext}"))
}

fn render_console(messages: &[ConsoleMessage]) -> String {
    let mut out = String::new();
    for m in messages {
        out.push_str(&format!("[{}] {}\n", m.level, m.text));
    }
    out
}
