mod bridge;
mod cgroups;
mod container;
mod ipam;
mod mounts;
mod network;
mod nsenter;
mod process;
mod runtime;
mod syscall;
mod user;

pub use bridge::*;
pub use cgroups::*;
pub use container::*;
pub use ipam::*;
pub use mounts::*;
pub use network::*;
pub use nsenter::*;
pub use process::*;
pub use runtime::*;
pub use syscall::*;
pub use user::*;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
