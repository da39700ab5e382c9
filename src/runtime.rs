use std::fs::{create_dir_all, read_to_string, remove_dir_all, File};
use std::io::ErrorKind;
use std::process::Command;

use log::{error, info};
use nix::sys::signal::{kill, Signal};
use tar::Builder;

use crate::{
    generate_id, ignore_kind, image_archive_path, CgroupConfig, CgroupManager, ContainerRecord,
    ContainerStore, Error, InitProcess, LayerStore, NetworkRegistry, Pid, Status, ENV_EXEC_CMD,
    ENV_EXEC_PID,
};

const SELF_EXE: &str = "/proc/self/exe";

/// Logical cgroup path shared by every container of this runtime.
pub const CGROUP_PATH: &str = "miniker";

#[derive(Debug, Default)]
pub struct RunConfig {
    pub tty: bool,
    pub command: Vec<String>,
    pub cgroup: CgroupConfig,
    pub volume: String,
    pub name: String,
    pub image: String,
    pub network: String,
    pub port_mappings: Vec<String>,
}

/// Top-level driver tying the stores and the network registry together.
/// One value per invocation; all file writes go through the owning store.
pub struct Runtime {
    store: ContainerStore,
    layers: LayerStore,
    registry: NetworkRegistry,
}

impl Runtime {
    pub fn new() -> Result<Self, Error> {
        Ok(Self::with_stores(
            ContainerStore::default(),
            LayerStore::from_env()?,
            NetworkRegistry::from_default_paths()?,
        ))
    }

    pub fn with_stores(
        store: ContainerStore,
        layers: LayerStore,
        registry: NetworkRegistry,
    ) -> Self {
        Self {
            store,
            layers,
            registry,
        }
    }

    /// Starts a container and returns its name. Foreground containers are
    /// waited for and fully torn down on exit; detached ones leave their
    /// record behind for `stop` and `remove`.
    pub fn run(&mut self, config: RunConfig) -> Result<String, Error> {
        if config.command.is_empty() {
            return Err("Wrong container command".into());
        }
        let id = generate_id();
        let name = if config.name.is_empty() {
            id.clone()
        } else {
            config.name.clone()
        };
        let mnt_dir = self
            .layers
            .create_workspace(&config.image, &name, &config.volume)?;
        let mut options = InitProcess::options().tty(config.tty).work_dir(&mnt_dir);
        if !config.tty {
            options = options.log_file(self.store.create_log_file(&name)?);
        }
        let mut init = options.start()?;
        let record = ContainerRecord::new(init.as_pid(), id, name.clone(), &config.command);
        self.store.save(&record)?;
        let cgroup = CgroupManager::new(CGROUP_PATH, config.cgroup);
        cgroup.set()?;
        cgroup.apply(init.as_pid())?;
        if !config.network.is_empty() {
            self.registry.connect(
                &config.network,
                &name,
                config.port_mappings.clone(),
                init.as_pid(),
            )?;
        }
        // The child blocks on the init pipe, so limits and network are in
        // place before the user command runs.
        init.send_command(&config.command)?;
        if config.tty {
            let status = init.wait()?;
            info!("Container {name} exited: {status:?}");
            cgroup.destroy();
            self.layers.delete_workspace(&name, &config.volume);
            if let Err(err) = self.store.remove(&name) {
                error!("Cannot remove container info: {err}");
            }
        }
        Ok(name)
    }

    /// Signals the init process, marks the record as exited and unmounts
    /// the merged view.
    pub fn stop(&self, name: &str) -> Result<(), Error> {
        let mut record = self.store.get(name)?;
        let pid: i32 = record
            .pid
            .parse()
            .map_err(|_| format!("Container {name} has no pid"))?;
        if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            error!("Cannot signal pid {pid}: {err}");
        }
        record.status = Status::Exit;
        record.pid = String::new();
        self.store.save(&record)?;
        self.layers.unmount_workspace(name);
        Ok(())
    }

    /// Removes an exited container's mount point tree and info directory.
    pub fn remove(&self, name: &str) -> Result<(), Error> {
        let record = self.store.get(name)?;
        if record.status != Status::Exit {
            return Err(format!("Container {name} is not exited").into());
        }
        ignore_kind(
            remove_dir_all(self.layers.mnt_dir(name)),
            ErrorKind::NotFound,
        )?;
        self.store.remove(name)
    }

    /// Archives the container's merged view into `resources/<image>.tar`
    /// with a single top-level `.`, making it runnable as `<image>`.
    pub fn commit(&self, name: &str, image: &str) -> Result<(), Error> {
        let mnt_dir = self.layers.mnt_dir(name);
        let archive_path = image_archive_path(image);
        if let Some(dir) = archive_path.parent() {
            create_dir_all(dir)?;
        }
        let mut builder = Builder::new(File::create(&archive_path)?);
        builder
            .append_dir_all(".", &mnt_dir)
            .map_err(|v| format!("Cannot archive {}: {v}", mnt_dir.display()))?;
        Ok(builder.finish()?)
    }

    /// Runs a command inside an existing container by re-executing the
    /// runtime with the target pid and command in the environment; the
    /// shim joins the namespaces before the CLI ever parses.
    pub fn exec(&self, name: &str, command: &[String]) -> Result<(), Error> {
        let record = self.store.get(name)?;
        if record.status != Status::Running {
            return Err(format!("Container {name} is not running").into());
        }
        let status = Command::new(SELF_EXE)
            .arg("exec")
            .env(ENV_EXEC_PID, &record.pid)
            .env(ENV_EXEC_CMD, command.join(" "))
            .status()?;
        if !status.success() {
            let code = status.code().unwrap_or(1);
            return Err(format!("Exec exited with code {code}").into());
        }
        Ok(())
    }

    pub fn logs(&self, name: &str) -> Result<String, Error> {
        let path = self.store.log_path(name);
        Ok(read_to_string(path).map_err(|_| format!("No such container: {name}"))?)
    }

    pub fn list(&self) -> Result<Vec<ContainerRecord>, Error> {
        self.store.list()
    }

    pub fn create_network(&mut self, driver: &str, subnet: &str, name: &str) -> Result<(), Error> {
        self.registry.create(driver, subnet, name)
    }

    pub fn remove_network(&mut self, name: &str) -> Result<(), Error> {
        self.registry.delete(name)
    }

    pub fn networks(&self) -> Vec<&crate::Network> {
        self.registry.list()
    }
}
