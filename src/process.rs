use std::convert::Infallible;
use std::env::current_dir;
use std::ffi::CString;
use std::fs::{create_dir, remove_dir, File};
use std::io::ErrorKind;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::panic::catch_unwind;
use std::path::{Path, PathBuf};

use nix::fcntl::OFlag;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, execv, execvp, pivot_root, sethostname};

use crate::{
    clone3, exit_child, ignore_kind, map_current_user_as_root, new_pipe, read_all, retarget_fd,
    write_all, CloneArgs, CloneResult, Error, Pid,
};

/// Slot the init pipe's read end occupies in the child, the first free
/// descriptor above the standard streams.
pub const INIT_PIPE_FD: i32 = 3;

const SELF_EXE: &str = "/proc/self/exe";

#[derive(Debug, Default)]
pub struct InitProcessOptions {
    tty: bool,
    work_dir: PathBuf,
    log_file: Option<File>,
}

impl InitProcessOptions {
    pub fn new() -> Self {
        Default::default()
    }

    /// Wires the child's stdio to the parent's instead of the log file.
    pub fn tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }

    /// Merged mount point the child starts in.
    pub fn work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    /// Receives the child's stdout and stderr when no tty is requested.
    pub fn log_file(mut self, file: File) -> Self {
        self.log_file = Some(file);
        self
    }

    /// Starts the container's init process: clones a child in fresh mount,
    /// pid, uts, ipc, network and user namespaces, wires its stdio, pins
    /// the init pipe's read end at the well-known slot and re-executes the
    /// runtime with the `init` argument. The child then blocks on the pipe
    /// until [`InitProcess::send_command`] delivers the user command.
    pub fn start(self) -> Result<InitProcess, Error> {
        let tty = self.tty;
        let work_dir = self.work_dir;
        let log_file = self.log_file;
        if !tty && log_file.is_none() {
            return Err("Detached container requires a log file".into());
        }
        let dev_null = if tty {
            None
        } else {
            let raw_fd =
                nix::fcntl::open("/dev/null", OFlag::O_RDWR, nix::sys::stat::Mode::empty())?;
            Some(unsafe { File::from_raw_fd(raw_fd) })
        };
        let pipe = new_pipe()?;
        let mut clone_args = CloneArgs::default();
        clone_args.flag_newuser();
        clone_args.flag_newns();
        clone_args.flag_newpid();
        clone_args.flag_newnet();
        clone_args.flag_newipc();
        clone_args.flag_newuts();
        match unsafe { clone3(&clone_args) }
            .map_err(|v| format!("Cannot start init process: {v}"))?
        {
            CloneResult::Child => {
                let _ = catch_unwind(move || {
                    let rx = pipe.rx();
                    exit_child(move || -> Result<Infallible, Error> {
                        if let Some(log_file) = &log_file {
                            nix::unistd::dup2(
                                dev_null.as_ref().unwrap().as_raw_fd(),
                                RawFd::from(0),
                            )?;
                            nix::unistd::dup2(log_file.as_raw_fd(), RawFd::from(1))?;
                            nix::unistd::dup2(log_file.as_raw_fd(), RawFd::from(2))?;
                        }
                        retarget_fd(&rx, INIT_PIPE_FD)?;
                        chdir(&work_dir).map_err(|v| format!("Cannot change directory: {v}"))?;
                        let filename = CString::new(SELF_EXE)?;
                        let argv = [filename.clone(), CString::new("init")?];
                        Ok(execv(&filename, &argv)?)
                    }())
                });
                unsafe { nix::libc::_exit(2) }
            }
            CloneResult::Parent { child } => {
                drop(log_file);
                drop(dev_null);
                let tx = pipe.tx();
                // Map container root to the current user before the child
                // needs privileges inside its user namespace.
                map_current_user_as_root(child)
                    .map_err(|v| format!("Cannot setup user namespace: {v}"))?;
                Ok(InitProcess {
                    pid: child,
                    pipe: Some(tx),
                })
            }
        }
    }
}

pub struct InitProcess {
    pid: Pid,
    pipe: Option<File>,
}

impl InitProcess {
    pub fn as_pid(&self) -> Pid {
        self.pid
    }

    /// Delivers the space-joined command over the init pipe and closes the
    /// write end, unblocking the child's init routine. The caller must have
    /// finished recording state, applying cgroups and attaching the network
    /// before calling this.
    pub fn send_command(&mut self, command: &[String]) -> Result<(), Error> {
        let tx = self.pipe.take().ok_or("Command already sent")?;
        write_all(tx, &command.join(" "))
    }

    pub fn wait(&self) -> Result<WaitStatus, Error> {
        Ok(waitpid(self.pid, Some(WaitPidFlag::__WALL))?)
    }

    pub fn options() -> InitProcessOptions {
        InitProcessOptions::new()
    }
}

/// Entry point of the container's first process, reached when the runtime
/// is re-executed with the `init` argument. Recovers the user command from
/// the init pipe, pivots into the layered root mounted at the current
/// working directory and replaces itself with the command.
pub fn init_container() -> Result<Infallible, Error> {
    let command = read_init_command()?;
    if command.is_empty() {
        return Err("Wrong container command".into());
    }
    let new_root = current_dir()?;
    if let Some(name) = new_root.file_name() {
        sethostname(name).map_err(|v| format!("Cannot set hostname: {v}"))?;
    }
    setup_rootfs(&new_root).map_err(|v| format!("Cannot setup rootfs: {v}"))?;
    let filename = CString::new(command[0].as_bytes())?;
    let argv = Result::<Vec<_>, _>::from_iter(command.iter().map(|v| CString::new(v.as_bytes())))?;
    // Resolved on PATH, keeping the current environment.
    Ok(execvp(&filename, &argv)?)
}

fn read_init_command() -> Result<Vec<String>, Error> {
    let pipe = unsafe { File::from_raw_fd(INIT_PIPE_FD) };
    let data = read_all(pipe)?;
    if data.is_empty() {
        return Ok(Vec::new());
    }
    Ok(data.split(' ').map(str::to_string).collect())
}

fn setup_rootfs(new_root: &Path) -> Result<(), Error> {
    remount_private_root(new_root)?;
    pivot_rootfs(new_root)?;
    // Mounted after the pivot so the container gets its own instances
    // inside the new root.
    setup_mount(
        "proc",
        "/proc",
        "proc",
        MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        None,
    )?;
    setup_mount(
        "tmpfs",
        "/dev",
        "tmpfs",
        MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
        Some("mode=755"),
    )?;
    Ok(())
}

// Make all changes private for the current root, then turn the new root
// into a mount point so it is a valid pivot target.
fn remount_private_root(path: &Path) -> Result<(), Error> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_SLAVE | MsFlags::MS_REC,
        None::<&str>,
    )?;
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE,
        None::<&str>,
    )?;
    Ok(mount(
        Some(path),
        path,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )?)
}

// Stacks the old root on a scratch directory inside the new root, then
// detaches and removes it.
fn pivot_rootfs(new_root: &Path) -> Result<(), Error> {
    let put_old = new_root.join(".pivot_root");
    ignore_kind(create_dir(&put_old), ErrorKind::AlreadyExists)?;
    pivot_root(new_root, &put_old)?;
    chdir("/")?;
    umount2("/.pivot_root", MntFlags::MNT_DETACH)?;
    Ok(remove_dir("/.pivot_root")?)
}

fn setup_mount(
    source: &str,
    target: &str,
    fstype: &str,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<(), Error> {
    ignore_kind(create_dir(target), ErrorKind::AlreadyExists)?;
    Ok(mount(source.into(), target, fstype.into(), flags, data)?)
}
