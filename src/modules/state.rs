use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::modules::store::{self, StateDir, StoreError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Status {
    Initialized,
    Running,
    /// Written by `harimu stop`; the runner exits after the current tick.
    Stopping,
    Stopped,
}

impl Status {
    pub const fn label(self) -> &'static str {
        match self {
            Status::Initialized => "initialized",
            Status::Running => "running",
            Status::Stopping => "stopping",
            Status::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeState {
    pub status: Status,
    pub last_tick: u64,
    pub message: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            status: Status::Initialized,
            last_tick: 0,
            message: None,
            updated_at: None,
        }
    }
}

/// Last tick committed by a running loop. Kept in its own file so the loop
/// never rewrites `state.json` while `harimu stop` may be writing it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Progress {
    pub last_tick: u64,
    pub updated_at: DateTime<Utc>,
}

impl Progress {
    fn now(last_tick: u64) -> Self {
        Self {
            last_tick,
            updated_at: Utc::now(),
        }
    }
}

impl RuntimeState {
    /// Status file merged with the loop's latest progress.
    pub fn load(dir: &StateDir) -> Result<Option<Self>, StoreError> {
        let Some(mut state) = store::read_json::<Self>(&dir.runtime())? else {
            return Ok(None);
        };
        if let Some(progress) = store::read_json::<Progress>(&dir.progress())? {
            state.last_tick = progress.last_tick;
            state.updated_at = state.updated_at.max(Some(progress.updated_at));
        }
        Ok(Some(state))
    }

    pub fn save(&self, dir: &StateDir) -> Result<(), StoreError> {
        store::write_json_atomic(&dir.runtime(), self)
    }

    pub fn init(dir: &StateDir) -> Result<Self, StoreError> {
        let state = Self {
            updated_at: Some(Utc::now()),
            ..Self::default()
        };
        state.save(dir)?;
        store::remove_if_exists(&dir.progress())?;
        Ok(state)
    }
}

pub fn set_status(
    dir: &StateDir,
    status: Status,
    last_tick: u64,
    message: Option<String>,
) -> Result<RuntimeState, StoreError> {
    let mut state = RuntimeState::load(dir)?.unwrap_or_default();
    state.status = status;
    state.last_tick = last_tick;
    state.message = message;
    state.updated_at = Some(Utc::now());
    state.save(dir)?;
    store::write_json_atomic(&dir.progress(), &Progress::now(last_tick))?;
    Ok(state)
}

/// Progress update from the tick loop. Only touches `progress.json`.
pub fn record_tick(dir: &StateDir, last_tick: u64) -> Result<Progress, StoreError> {
    let progress = Progress::now(last_tick);
    store::write_json_atomic(&dir.progress(), &progress)?;
    Ok(progress)
}

/// The runtime state while a tick loop owns `world.json`, if one does.
pub fn active_loop(dir: &StateDir) -> Result<Option<RuntimeState>, StoreError> {
    Ok(RuntimeState::load(dir)?.filter(|s| matches!(s.status, Status::Running | Status::Stopping)))
}

/// Ask a running loop to stop. Returns false when nothing is running.
pub fn request_stop(dir: &StateDir) -> Result<bool, StoreError> {
    let Some(mut state) = RuntimeState::load(dir)? else {
        return Ok(false);
    };
    if state.status != Status::Running {
        return Ok(false);
    }
    state.status = Status::Stopping;
    state.message = Some("stop requested".to_string());
    state.updated_at = Some(Utc::now());
    state.save(dir)?;
    Ok(true)
}

pub fn stop_requested(dir: &StateDir) -> bool {
    matches!(
        RuntimeState::load(dir),
        Ok(Some(RuntimeState {
            status: Status::Stopping | Status::Stopped,
            ..
        }))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_only_flips_a_running_loop() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = StateDir::new(tmp.path());
        assert!(!request_stop(&dir).unwrap());

        RuntimeState::init(&dir).unwrap();
        assert!(!request_stop(&dir).unwrap());
        assert!(!stop_requested(&dir));

        set_status(&dir, Status::Running, 4, None).unwrap();
        assert!(request_stop(&dir).unwrap());
        assert!(stop_requested(&dir));
        record_tick(&dir, 4).unwrap();
        assert!(stop_requested(&dir));

        let state = RuntimeState::load(&dir).unwrap().unwrap();
        assert_eq!(state.status, Status::Stopping);
        assert_eq!(state.last_tick, 4);
        assert!(state.updated_at.is_some());
    }

    #[test]
    fn progress_never_clobbers_a_stop_request() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = StateDir::new(tmp.path());
        set_status(&dir, Status::Running, 0, None).unwrap();
        assert!(active_loop(&dir).unwrap().is_some());

        // Stop lands between two progress writes.
        record_tick(&dir, 1).unwrap();
        assert!(request_stop(&dir).unwrap());
        record_tick(&dir, 2).unwrap();

        let state = RuntimeState::load(&dir).unwrap().unwrap();
        assert_eq!(state.status, Status::Stopping);
        assert_eq!(state.last_tick, 2);
        assert!(stop_requested(&dir));
        assert!(active_loop(&dir).unwrap().is_some());

        set_status(&dir, Status::Stopped, 2, None).unwrap();
        assert!(active_loop(&dir).unwrap().is_none());

        RuntimeState::init(&dir).unwrap();
        assert_eq!(RuntimeState::load(&dir).unwrap().unwrap().last_tick, 0);
    }

    #[test]
    fn older_state_files_load() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = StateDir::new(tmp.path());
        std::fs::write(
            dir.runtime(),
            r#"{"status":"Running","last_tick":9,"message":null}"#,
        )
        .unwrap();
        let state = RuntimeState::load(&dir).unwrap().unwrap();
        assert_eq!(state.status, Status::Running);
        assert_eq!(state.updated_at, None);
    }
}
