use std::fs::File;
use std::process::Command;

use nix::sched::{setns, CloneFlags};

use crate::Error;

/// Environment variable carrying the target init pid.
pub const ENV_EXEC_PID: &str = "miniker_pid";
/// Environment variable carrying the command to run inside the container.
pub const ENV_EXEC_CMD: &str = "miniker_cmd";

const NAMESPACES: [&str; 5] = ["ipc", "uts", "net", "pid", "mnt"];

/// Shim that runs before the normal program entry. When both environment
/// variables are present the process joins the target's namespaces, runs
/// the command through the host shell and exits with its status; otherwise
/// it returns and startup continues as usual.
pub fn enter_if_requested() {
    let pid = match std::env::var(ENV_EXEC_PID) {
        Ok(v) => v,
        Err(_) => return,
    };
    let cmd = match std::env::var(ENV_EXEC_CMD) {
        Ok(v) => v,
        Err(_) => return,
    };
    let code = match enter(&pid, &cmd) {
        Ok(v) => v,
        Err(err) => {
            eprintln!("Cannot enter container {pid}: {err}");
            1
        }
    };
    std::process::exit(code);
}

fn enter(pid: &str, cmd: &str) -> Result<i32, Error> {
    for ns in NAMESPACES {
        let file = File::open(format!("/proc/{pid}/ns/{ns}"))?;
        setns(&file, CloneFlags::empty())
            .map_err(|v| format!("Cannot enter {ns} namespace: {v}"))?;
    }
    // The shell lands in the joined pid namespace because entering takes
    // effect on the next child.
    let status = Command::new("/bin/sh").arg("-c").arg(cmd).status()?;
    Ok(status.code().unwrap_or(1))
}
