use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::modules::event::{Event, EventKind, EventSink};
use crate::modules::world::{WorldError, WorldState};

pub const HOME_ENV: &str = "HARIMU_HOME";
const DEFAULT_DIR: &str = ".harimu";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}; delete it or run `harimu init --force` to reset: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{path} failed its consistency check: {source}")]
    Inconsistent {
        path: PathBuf,
        #[source]
        source: WorldError,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Directory holding every persisted file of one sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$HARIMU_HOME`, falling back to `.harimu` in the working directory.
    pub fn from_env() -> Self {
        match env::var_os(HOME_ENV) {
            Some(dir) if !dir.is_empty() => Self::new(dir),
            _ => Self::new(DEFAULT_DIR),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root).map_err(io_err(&self.root))
    }

    pub fn wallets(&self) -> PathBuf {
        self.root.join("wallets.json")
    }

    pub fn world(&self) -> PathBuf {
        self.root.join("world.json")
    }

    pub fn runtime(&self) -> PathBuf {
        self.root.join("state.json")
    }

    /// Tick progress written by a running loop, separate from `state.json`.
    pub fn progress(&self) -> PathBuf {
        self.root.join("progress.json")
    }

    pub fn events(&self) -> PathBuf {
        self.root.join("events.jsonl")
    }

    pub fn action_stats(&self) -> PathBuf {
        self.root.join("action_stats.json")
    }

    pub fn config(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn snapshot(&self) -> PathBuf {
        self.root.join("world_snapshot.json")
    }

    pub fn snapshot_history(&self) -> PathBuf {
        self.root.join("world_snapshots")
    }

    pub fn pid(&self) -> PathBuf {
        self.root.join("runtime.pid")
    }

    pub fn llm_log(&self) -> PathBuf {
        self.root.join("logs").join("llm.log")
    }
}

/// Read a JSON document. A missing or empty file is `None`; anything that
/// exists but does not parse is an error.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(path)(e)),
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

/// Write to a sibling temp file, then rename over `path`.
pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));
    {
        let mut file = File::create(&tmp).map_err(io_err(&tmp))?;
        file.write_all(bytes).map_err(io_err(&tmp))?;
        file.sync_all().map_err(io_err(&tmp))?;
    }
    fs::rename(&tmp, path).map_err(io_err(path))
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Encode {
        path: path.to_path_buf(),
        source,
    })?;
    write_bytes_atomic(path, &json)
}

/// Load the persisted world. Parse failures and inconsistent worlds are fatal.
pub fn load_world(dir: &StateDir) -> Result<Option<WorldState>, StoreError> {
    let path = dir.world();
    let Some(world) = read_json::<WorldState>(&path)? else {
        return Ok(None);
    };
    world
        .check_consistency()
        .map_err(|source| StoreError::Inconsistent {
            path: path.clone(),
            source,
        })?;
    debug!(path = %path.display(), tick = world.tick(), "loaded world");
    Ok(Some(world))
}

pub fn save_world(dir: &StateDir, world: &WorldState) -> Result<(), StoreError> {
    write_json_atomic(&dir.world(), world)
}

/// Append events to the JSON lines log, one record per line.
pub fn append_events(path: &Path, events: &[Event]) -> Result<(), StoreError> {
    if events.is_empty() {
        return Ok(());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let mut buf = Vec::new();
    for event in events {
        serde_json::to_writer(&mut buf, event).map_err(|source| StoreError::Encode {
            path: path.to_path_buf(),
            source,
        })?;
        buf.push(b'\n');
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_err(path))?;
    file.write_all(&buf).map_err(io_err(path))
}

pub fn read_events(path: &Path) -> Result<Vec<Event>, StoreError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(path)(e)),
    };
    let mut events = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(io_err(path))?;
        if line.trim().is_empty() {
            continue;
        }
        let event = serde_json::from_str(&line).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;
        events.push(event);
    }
    Ok(events)
}

/// Append events produced outside the tick loop, stamped with `tick` and
/// numbered after whatever that tick already logged.
pub fn append_at_tick(path: &Path, tick: u64, kinds: Vec<EventKind>) -> Result<Vec<Event>, StoreError> {
    if kinds.is_empty() {
        return Ok(Vec::new());
    }
    let next_seq = read_events(path)?
        .iter()
        .filter(|e| e.tick == tick)
        .map(|e| e.seq.saturating_add(1))
        .max()
        .unwrap_or(0);
    let mut sink = EventSink::resume(tick, next_seq);
    sink.extend(kinds);
    let events = sink.into_events();
    append_events(path, &events)?;
    Ok(events)
}

/// Remove a file if present.
pub fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(path)(e)),
    }
}
