use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

const DEFAULT_JSON_LOG_FILE: &str = "docchat.logs.jsonl";

/// Destination for log lines.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LogOutput {
    /// Compact lines on stderr; stdout is reserved for streamed answers.
    Console,
    /// One JSON object per line, appended to `dir/file_name`.
    JsonFile { dir: PathBuf, file_name: String },
}

impl LogOutput {
    fn from_path(raw: Option<&str>) -> Self {
        let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
            return Self::Console;
        };
        let path = Path::new(raw);
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(DEFAULT_JSON_LOG_FILE)
            .to_string();
        Self::JsonFile { dir, file_name }
    }
}

fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

fn resolve_env_filter(level: Option<&str>) -> EnvFilter {
    level
        .and_then(|level| EnvFilter::try_new(level).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Installs the global subscriber once per process.
///
/// - `DOCCHAT_OBSERVABILITY`: `0`/`off`/`false` disables logging.
/// - `DOCCHAT_LOG_LEVEL`, then `RUST_LOG`: filter directives (default `info`).
/// - `DOCCHAT_JSON_LOG_PATH`: write JSON lines to this file instead of stderr.
pub fn init_observability() {
    INIT.get_or_init(|| {
        let enabled = std::env::var("DOCCHAT_OBSERVABILITY")
            .ok()
            .and_then(|value| parse_bool_env(&value))
            .unwrap_or(true);
        if !enabled {
            return;
        }

        let filter = resolve_env_filter(std::env::var("DOCCHAT_LOG_LEVEL").ok().as_deref());
        let output = LogOutput::from_path(std::env::var("DOCCHAT_JSON_LOG_PATH").ok().as_deref());
        let registry = tracing_subscriber::registry().with(filter);
        let _ = match output {
            LogOutput::Console => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .compact()
                        .with_target(false)
                        .with_writer(std::io::stderr),
                )
                .try_init(),
            LogOutput::JsonFile { dir, file_name } => {
                let _ = std::fs::create_dir_all(&dir);
                registry
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_writer(tracing_appender::rolling::never(dir, file_name)),
                    )
                    .try_init()
            }
        };
    });
}
