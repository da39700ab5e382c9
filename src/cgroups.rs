use std::fs::{create_dir, remove_dir, File};
use std::io::{BufRead, BufReader, Write as _};
use std::path::PathBuf;

use log::error;

use crate::{ignore_kind, Error, Pid};

const MOUNT_INFO: &str = "/proc/self/mountinfo";

/// Per-container resource limits. Empty fields are left unset.
#[derive(Clone, Debug, Default)]
pub struct CgroupConfig {
    /// Bytes, written verbatim to `memory.limit_in_bytes`.
    pub mem_limit: String,
    /// Relative CPU weight, written to `cpu.shares`.
    pub cpu_share: String,
    /// CPU list expression, written to `cpuset.cpus`.
    pub cpu_set: String,
}

impl CgroupConfig {
    pub fn is_empty(&self) -> bool {
        self.mem_limit.is_empty() && self.cpu_share.is_empty() && self.cpu_set.is_empty()
    }
}

pub trait Controller {
    fn name(&self) -> &'static str;

    /// Writes the controller's limit into the cgroup, creating the leaf
    /// directory if needed.
    fn set(&self, cgroup: &str, config: &CgroupConfig) -> Result<(), Error>;

    /// Assigns the process to the cgroup leaf, which must already exist.
    fn apply(&self, cgroup: &str, pid: Pid) -> Result<(), Error>;

    /// Removes the cgroup leaf.
    fn remove(&self, cgroup: &str) -> Result<(), Error>;
}

pub struct MemoryController;

impl Controller for MemoryController {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn set(&self, cgroup: &str, config: &CgroupConfig) -> Result<(), Error> {
        let path = controller_path(self.name(), cgroup, true)?;
        if !config.mem_limit.is_empty() {
            write_file(path.join("memory.limit_in_bytes"), &config.mem_limit)?;
        }
        Ok(())
    }

    fn apply(&self, cgroup: &str, pid: Pid) -> Result<(), Error> {
        add_task(self.name(), cgroup, pid)
    }

    fn remove(&self, cgroup: &str) -> Result<(), Error> {
        remove_leaf(self.name(), cgroup)
    }
}

pub struct CpuController;

impl Controller for CpuController {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn set(&self, cgroup: &str, config: &CgroupConfig) -> Result<(), Error> {
        let path = controller_path(self.name(), cgroup, true)?;
        if !config.cpu_share.is_empty() {
            write_file(path.join("cpu.shares"), &config.cpu_share)?;
        }
        Ok(())
    }

    fn apply(&self, cgroup: &str, pid: Pid) -> Result<(), Error> {
        add_task(self.name(), cgroup, pid)
    }

    fn remove(&self, cgroup: &str) -> Result<(), Error> {
        remove_leaf(self.name(), cgroup)
    }
}

pub struct CpusetController;

impl Controller for CpusetController {
    fn name(&self) -> &'static str {
        "cpuset"
    }

    fn set(&self, cgroup: &str, config: &CgroupConfig) -> Result<(), Error> {
        let path = controller_path(self.name(), cgroup, true)?;
        if !config.cpu_set.is_empty() {
            write_file(path.join("cpuset.cpus"), &config.cpu_set)?;
        }
        Ok(())
    }

    fn apply(&self, cgroup: &str, pid: Pid) -> Result<(), Error> {
        add_task(self.name(), cgroup, pid)
    }

    fn remove(&self, cgroup: &str) -> Result<(), Error> {
        remove_leaf(self.name(), cgroup)
    }
}

/// Applies one [`CgroupConfig`] uniformly over all controllers. The logical
/// path is a single segment under each controller's mount point.
pub struct CgroupManager {
    path: String,
    config: CgroupConfig,
    controllers: Vec<Box<dyn Controller>>,
}

impl CgroupManager {
    pub fn new(path: impl Into<String>, config: CgroupConfig) -> Self {
        Self {
            path: path.into(),
            config,
            controllers: vec![
                Box::new(MemoryController),
                Box::new(CpuController),
                Box::new(CpusetController),
            ],
        }
    }

    pub fn as_path(&self) -> &str {
        &self.path
    }

    pub fn set(&self) -> Result<(), Error> {
        for controller in &self.controllers {
            controller
                .set(&self.path, &self.config)
                .map_err(|v| format!("Cannot set {} cgroup: {v}", controller.name()))?;
        }
        Ok(())
    }

    pub fn apply(&self, pid: Pid) -> Result<(), Error> {
        for controller in &self.controllers {
            controller
                .apply(&self.path, pid)
                .map_err(|v| format!("Cannot apply {} cgroup: {v}", controller.name()))?;
        }
        Ok(())
    }

    /// Best-effort removal of every controller leaf. Errors are logged so a
    /// stray controller does not block the rest of the teardown.
    pub fn destroy(&self) {
        for controller in &self.controllers {
            if let Err(err) = controller.remove(&self.path) {
                error!("Cannot remove {} cgroup: {err}", controller.name());
            }
        }
    }
}

/// Resolves the controller's mount point from `/proc/self/mountinfo`: the
/// first line whose trailing option list contains the controller name wins,
/// and its fifth column is the mount point.
pub fn find_mount_point(controller: &str) -> Result<PathBuf, Error> {
    let file = File::open(MOUNT_INFO)?;
    find_mount_point_in(controller, BufReader::new(file))
}

pub fn find_mount_point_in(controller: &str, reader: impl BufRead) -> Result<PathBuf, Error> {
    for line in reader.lines() {
        let line = line?;
        let fields: Vec<_> = line.split(' ').collect();
        let options = match fields.last() {
            Some(v) => *v,
            None => continue,
        };
        if options.split(',').any(|v| v == controller) {
            let mount_point = fields
                .get(4)
                .ok_or_else(|| format!("Malformed mountinfo line: {line}"))?;
            return Ok(PathBuf::from(mount_point));
        }
    }
    Err(format!("Cannot find mount point for controller {controller}").into())
}

fn controller_path(controller: &str, cgroup: &str, auto_create: bool) -> Result<PathBuf, Error> {
    let path = find_mount_point(controller)?.join(cgroup);
    if auto_create {
        ignore_kind(create_dir(&path), std::io::ErrorKind::AlreadyExists)
            .map_err(|v| format!("Cannot create cgroup {}: {v}", path.display()))?;
    }
    Ok(path)
}

fn add_task(controller: &str, cgroup: &str, pid: Pid) -> Result<(), Error> {
    let path = controller_path(controller, cgroup, false)?;
    write_file(path.join("tasks"), &pid.as_raw().to_string())
}

fn remove_leaf(controller: &str, cgroup: &str) -> Result<(), Error> {
    let path = controller_path(controller, cgroup, false)?;
    Ok(remove_dir(path)?)
}

fn write_file(path: PathBuf, data: &str) -> Result<(), Error> {
    Ok(File::options()
        .create(false)
        .write(true)
        .truncate(false)
        .open(path)?
        .write_all(data.as_bytes())?)
}
