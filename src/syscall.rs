use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;

use nix::errno::Errno;
use nix::libc::syscall;
use nix::unistd::dup2;

use crate::Error;

pub type Pid = nix::unistd::Pid;

#[repr(C, align(8))]
#[derive(Debug, Default)]
pub(crate) struct CloneArgs {
    pub flags: u64,
    pub pidfd: u64,
    pub child_tid: u64,
    pub parent_tid: u64,
    pub exit_signal: u64,
    pub stack: u64,
    pub stack_size: u64,
    pub tls: u64,
    pub set_tid: u64,
    pub set_tid_size: u64,
    pub cgroup: u64,
}

impl CloneArgs {
    pub fn flag_newuser(&mut self) {
        self.flags |= nix::libc::CLONE_NEWUSER as u64;
    }

    pub fn flag_newns(&mut self) {
        self.flags |= nix::libc::CLONE_NEWNS as u64;
    }

    pub fn flag_newpid(&mut self) {
        self.flags |= nix::libc::CLONE_NEWPID as u64;
    }

    pub fn flag_newnet(&mut self) {
        self.flags |= nix::libc::CLONE_NEWNET as u64;
    }

    pub fn flag_newipc(&mut self) {
        self.flags |= nix::libc::CLONE_NEWIPC as u64;
    }

    pub fn flag_newuts(&mut self) {
        self.flags |= nix::libc::CLONE_NEWUTS as u64;
    }
}

pub(crate) enum CloneResult {
    Child,
    Parent { child: Pid },
}

pub(crate) unsafe fn clone3(cl_args: &CloneArgs) -> Result<CloneResult, Errno> {
    let res = syscall(
        nix::libc::SYS_clone3,
        cl_args as *const CloneArgs,
        core::mem::size_of::<CloneArgs>(),
    );
    Errno::result(res).map(|v| match v {
        0 => CloneResult::Child,
        v => CloneResult::Parent {
            child: Pid::from_raw(v as nix::libc::pid_t),
        },
    })
}

pub(crate) struct Pipe {
    rx: File,
    tx: File,
}

impl Pipe {
    pub fn rx(self) -> File {
        drop(self.tx);
        self.rx
    }

    pub fn tx(self) -> File {
        drop(self.rx);
        self.tx
    }
}

pub(crate) fn new_pipe() -> Result<Pipe, Error> {
    let (rx, tx) = nix::unistd::pipe()?;
    Ok(Pipe {
        rx: File::from(rx),
        tx: File::from(tx),
    })
}

/// Moves a descriptor to the well-known slot, leaving it in place if it
/// already occupies the slot.
pub(crate) fn retarget_fd(file: &File, target: i32) -> Result<(), Error> {
    if file.as_raw_fd() != target {
        dup2(file.as_raw_fd(), target)?;
    }
    Ok(())
}

pub(crate) fn read_all(mut rx: impl Read) -> Result<String, Error> {
    let mut buf = String::new();
    rx.read_to_string(&mut buf)?;
    Ok(buf)
}

pub(crate) fn write_all(mut tx: impl Write, data: &str) -> Result<(), Error> {
    Ok(tx.write_all(data.as_bytes())?)
}

pub(crate) fn exit_child<T, E>(result: Result<T, E>) -> ! {
    match result {
        Ok(_) => unsafe { nix::libc::_exit(0) },
        Err(_) => unsafe { nix::libc::_exit(1) },
    }
}

pub(crate) fn ignore_kind(
    result: std::io::Result<()>,
    kind: std::io::ErrorKind,
) -> std::io::Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err) => {
            if err.kind() == kind {
                Ok(())
            } else {
                Err(err)
            }
        }
    }
}
