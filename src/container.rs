use std::fs::{create_dir_all, read_dir, read_to_string, remove_dir_all, File};
use std::path::PathBuf;

use chrono::Local;
use log::warn;
use rand::distributions::{Alphanumeric, DistString as _};
use serde::{Deserialize, Serialize};

use crate::{Error, Pid};

pub const DEFAULT_INFO_ROOT: &str = "/var/run/miniker";

const CONFIG_NAME: &str = "config.json";
const LOG_NAME: &str = "container.log";
const ID_LENGTH: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Running,
    Stopped,
    Exit,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Running => write!(f, "running"),
            Status::Stopped => write!(f, "stopped"),
            Status::Exit => write!(f, "exit"),
        }
    }
}

/// State of one container, persisted as `config.json` in the container's
/// info directory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRecord {
    /// Pid of the init process, cleared once the container is stopped.
    pub pid: String,
    pub id: String,
    pub name: String,
    /// The user command with arguments joined by single spaces.
    pub command: String,
    pub create_time: String,
    pub status: Status,
}

impl ContainerRecord {
    /// Creates a running record for a freshly started init process.
    pub fn new(pid: Pid, id: String, name: String, command: &[String]) -> Self {
        Self {
            pid: pid.as_raw().to_string(),
            id,
            name,
            command: command.join(" "),
            create_time: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            status: Status::Running,
        }
    }
}

pub fn generate_id() -> String {
    Alphanumeric.sample_string(&mut rand::thread_rng(), ID_LENGTH)
}

/// Directory-per-container state store under a single root.
#[derive(Clone, Debug)]
pub struct ContainerStore {
    root: PathBuf,
}

impl Default for ContainerStore {
    fn default() -> Self {
        Self::new(DEFAULT_INFO_ROOT)
    }
}

impl ContainerStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn log_path(&self, name: &str) -> PathBuf {
        self.dir(name).join(LOG_NAME)
    }

    /// Creates a freshly truncated log file for the container.
    pub fn create_log_file(&self, name: &str) -> Result<File, Error> {
        create_dir_all(self.dir(name))?;
        Ok(File::create(self.log_path(name))?)
    }

    pub fn save(&self, record: &ContainerRecord) -> Result<(), Error> {
        let dir = self.dir(&record.name);
        create_dir_all(&dir).map_err(|v| format!("Cannot create info directory: {v}"))?;
        let data = serde_json::to_string(record)?;
        Ok(std::fs::write(dir.join(CONFIG_NAME), data)?)
    }

    pub fn get(&self, name: &str) -> Result<ContainerRecord, Error> {
        let path = self.dir(name).join(CONFIG_NAME);
        let data =
            read_to_string(path).map_err(|_| format!("No such container: {name}"))?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn remove(&self, name: &str) -> Result<(), Error> {
        Ok(remove_dir_all(self.dir(name))?)
    }

    /// All readable records under the store root. Unreadable entries are
    /// logged and skipped.
    pub fn list(&self) -> Result<Vec<ContainerRecord>, Error> {
        let mut records = Vec::new();
        let entries = match read_dir(&self.root) {
            Ok(v) => v,
            Err(v) if v.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(v) => return Err(v.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match self.get(&name) {
                Ok(record) => records.push(record),
                Err(err) => warn!("Cannot read container {name}: {err}"),
            }
        }
        Ok(records)
    }
}
