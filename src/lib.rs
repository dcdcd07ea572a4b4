pub mod supervisor;

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub use supervisor::{
    ClientTier, EnvOverrides, Supervisor, SupervisorConfig, SupervisorError, ToolFacade,
};

/// Return the platform-standard data directory for toolhost.
///
/// - macOS: `~/Library/Application Support/toolhost/`
/// - Windows: `{FOLDERID_RoamingAppData}\toolhost\`
/// - Linux: `$XDG_DATA_HOME/toolhost/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.toolhost/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("toolhost");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolhost")
}

/// Initialize the tracing subscriber.
///
/// With a log directory, rotates `toolhost.log` (keeps the last 3) and
/// appends to a fresh file. Without one, or if the file cannot be opened,
/// logs go to stderr; stdout is never used. `RUST_LOG` overrides the default
/// filter.
pub fn init_tracing(log_dir: Option<&Path>) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("toolhost=info,warn"));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false);

    // `File` is unbuffered and fmt writes each event in one call, so every
    // line is on disk as soon as it is logged.
    let (log_path, installed) = match log_dir.and_then(open_log_file) {
        Some((path, file)) => (
            Some(path),
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init(),
        ),
        None => (None, builder.with_writer(std::io::stderr).try_init()),
    };
    if installed.is_err() {
        return; // a subscriber is already set
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?log_path.map(|p| p.display().to_string()),
        pid = std::process::id(),
        "=== toolhost starting ==="
    );
}

const LOG_FILE_NAME: &str = "toolhost.log";
const LOG_GENERATIONS: u32 = 3;

/// Rotate the previous logs in `dir` and open a fresh `toolhost.log`.
fn open_log_file(dir: &Path) -> Option<(PathBuf, File)> {
    std::fs::create_dir_all(dir).ok()?;
    let path = dir.join(LOG_FILE_NAME);
    rotate_log_file(&path, LOG_GENERATIONS);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .ok()?;
    Some((path, file))
}

/// `toolhost.log` -> `toolhost.log.<n>`.
fn generation_path(base: &Path, n: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

/// Shift each log one generation older and drop the one past `keep`.
///
/// Gaps in the chain are skipped. Failures are ignored: logging is not set
/// up yet and a stale log must not block startup.
fn rotate_log_file(base: &Path, keep: u32) {
    let chain: Vec<PathBuf> = std::iter::once(base.to_path_buf())
        .chain((1..=keep).map(|n| generation_path(base, n)))
        .collect();

    if let Some(oldest) = chain.last() {
        let _ = std::fs::remove_file(oldest);
    }
    for pair in chain.windows(2).rev() {
        if pair[0].exists() {
            let _ = std::fs::rename(&pair[0], &pair[1]);
        }
    }
}
