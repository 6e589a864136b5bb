use heapscope_types::{SNAPSHOT_FORMAT_VERSION, Snapshot};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

#[derive(Debug)]
pub enum StoreError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Encode(String),
    Decode {
        path: PathBuf,
        message: String,
    },
    UnsupportedVersion {
        path: PathBuf,
        version: u32,
    },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "{}: {source}", path.display()),
            Self::Encode(message) => write!(f, "failed to encode snapshot: {message}"),
            Self::Decode { path, message } => {
                write!(f, "{} is not a snapshot: {message}", path.display())
            }
            Self::UnsupportedVersion { path, version } => write!(
                f,
                "{} has snapshot format version {version}, expected {SNAPSHOT_FORMAT_VERSION}",
                path.display()
            ),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Writes `snapshot` as JSON. The file is replaced atomically.
pub fn save_snapshot(path: &Path, snapshot: &Snapshot) -> Result<(), StoreError> {
    let json =
        facet_json::to_string_pretty(snapshot).map_err(|e| StoreError::Encode(e.to_string()))?;
    let staging = path.with_extension("json.partial");
    std::fs::write(&staging, json).map_err(|source| StoreError::Io {
        path: staging.clone(),
        source,
    })?;
    std::fs::rename(&staging, path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), types = snapshot.types.len(), "snapshot saved");
    Ok(())
}

pub fn load_snapshot(path: &Path) -> Result<Snapshot, StoreError> {
    let json = std::fs::read_to_string(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let snapshot: Snapshot = facet_json::from_str(&json).map_err(|e| StoreError::Decode {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    if snapshot.version != SNAPSHOT_FORMAT_VERSION {
        return Err(StoreError::UnsupportedVersion {
            path: path.to_path_buf(),
            version: snapshot.version,
        });
    }
    Ok(snapshot)
}

/// `<target>-<unix_ms>.json`, with every character of `target` that is not
/// safe in a file name replaced by `_`.
pub fn snapshot_file_name(target: &str, unix_ms: u64) -> String {
    let mut stem: String = target
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.trim_matches('.').is_empty() {
        stem = "snapshot".to_string();
    }
    format!("{stem}-{unix_ms}.json")
}

pub fn unix_millis_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
