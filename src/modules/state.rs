use std::fs;
use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Status {
    Initialized,
    Running,
    Stopped,
}

/// Process-level status shared between `iskra run` and the other commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeState {
    pub status: Status,
    pub last_cycle: u64,
    pub message: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            status: Status::Initialized,
            last_cycle: 0,
            message: None,
            updated_at: None,
        }
    }
}

pub fn state_dir() -> PathBuf {
    PathBuf::from(".iskra")
}

pub fn state_file_path() -> PathBuf {
    state_dir().join("state.json")
}

pub fn key_file_path() -> PathBuf {
    state_dir().join(".key")
}

pub fn init_state() -> io::Result<RuntimeState> {
    let state = RuntimeState {
        updated_at: Some(Utc::now()),
        ..RuntimeState::default()
    };
    save_state(&state)?;
    Ok(state)
}

pub fn load_state() -> io::Result<Option<RuntimeState>> {
    let path = state_file_path();
    if !path.exists() {
        return Ok(None);
    }

    let bytes = fs::read(&path)?;
    if bytes.is_empty() {
        return Ok(None);
    }

    let state: RuntimeState = serde_json::from_slice(&bytes).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "failed to parse state file {}; delete it or run `iskra init` to reset: {}",
                path.display(),
                e
            ),
        )
    })?;
    Ok(Some(state))
}

pub fn save_state(state: &RuntimeState) -> io::Result<()> {
    fs::create_dir_all(state_dir())?;
    let json = serde_json::to_vec_pretty(state)?;
    fs::write(state_file_path(), json)?;
    Ok(())
}

pub fn set_status(
    status: Status,
    last_cycle: u64,
    message: Option<String>,
) -> io::Result<RuntimeState> {
    let mut state = load_state()?.unwrap_or_default();
    state.status = status;
    state.last_cycle = last_cycle;
    state.message = message;
    state.updated_at = Some(Utc::now());
    save_state(&state)?;
    Ok(state)
}

/// API key stored next to the state file, if any.
pub fn load_key_file() -> Option<String> {
    let data = fs::read_to_string(key_file_path()).ok()?;
    let trimmed = data.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
