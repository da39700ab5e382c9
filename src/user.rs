use std::fmt::Write as _;

use nix::libc::uid_t;
use nix::unistd::{getgid, getuid};

use crate::{Error, Pid};

pub type Uid = nix::unistd::Uid;
pub type Gid = nix::unistd::Gid;

/// Represents mapping for IDs from host namespace to container namespace.
#[derive(Clone, Debug)]
pub struct IdMap<T> {
    /// First ID in container namespace.
    pub container_id: T,
    /// First ID in host namespace.
    pub host_id: T,
    /// Amount of mapped IDs.
    pub size: u32,
}

impl<T: From<uid_t>> IdMap<T> {
    /// Maps specified host ID as root (ID = 0) in container namespace.
    pub fn new_root(host_id: T) -> Self {
        Self {
            host_id,
            container_id: 0.into(),
            size: 1,
        }
    }
}

/// Writes the uid and gid maps for a freshly created user namespace through
/// `/proc/<pid>`. Setgroups is denied first so the gid map is accepted.
pub fn run_map_user(
    pid: Pid,
    uid_map: &[IdMap<Uid>],
    gid_map: &[IdMap<Gid>],
) -> Result<(), Error> {
    let proc_dir = format!("/proc/{pid}");
    std::fs::write(format!("{proc_dir}/uid_map"), render_id_map(uid_map))
        .map_err(|v| format!("Cannot map users: {v}"))?;
    std::fs::write(format!("{proc_dir}/setgroups"), "deny")
        .map_err(|v| format!("Cannot deny setgroups: {v}"))?;
    std::fs::write(format!("{proc_dir}/gid_map"), render_id_map(gid_map))
        .map_err(|v| format!("Cannot map groups: {v}"))?;
    Ok(())
}

/// Maps the current user and group as container root.
pub fn map_current_user_as_root(pid: Pid) -> Result<(), Error> {
    run_map_user(
        pid,
        &[IdMap::new_root(getuid())],
        &[IdMap::new_root(getgid())],
    )
}

fn render_id_map<T: Copy + Into<uid_t>>(id_map: &[IdMap<T>]) -> String {
    let mut data = String::new();
    for v in id_map {
        let _ = writeln!(
            data,
            "{} {} {}",
            v.container_id.into(),
            v.host_id.into(),
            v.size
        );
    }
    data
}
