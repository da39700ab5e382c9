use std::path::PathBuf;

use miniker::{find_mount_point_in, CgroupConfig};

const MOUNT_INFO: &str = "\
24 30 0:22 / /sys rw,nosuid,nodev,noexec,relatime shared:7 - sysfs sysfs rw
30 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw,errors=remount-ro
36 25 0:31 / /sys/fs/cgroup/memory rw,nosuid,nodev,noexec,relatime shared:15 - cgroup cgroup rw,memory
37 25 0:32 / /sys/fs/cgroup/cpu,cpuacct rw,nosuid,nodev,noexec,relatime shared:16 - cgroup cgroup rw,cpu,cpuacct
38 25 0:33 / /sys/fs/cgroup/cpuset rw,nosuid,nodev,noexec,relatime shared:17 - cgroup cgroup rw,cpuset
";

#[test]
fn test_find_mount_point() {
    let memory = find_mount_point_in("memory", MOUNT_INFO.as_bytes()).unwrap();
    assert_eq!(memory, PathBuf::from("/sys/fs/cgroup/memory"));
    let cpu = find_mount_point_in("cpu", MOUNT_INFO.as_bytes()).unwrap();
    assert_eq!(cpu, PathBuf::from("/sys/fs/cgroup/cpu,cpuacct"));
    let cpuset = find_mount_point_in("cpuset", MOUNT_INFO.as_bytes()).unwrap();
    assert_eq!(cpuset, PathBuf::from("/sys/fs/cgroup/cpuset"));
}

#[test]
fn test_find_mount_point_matches_whole_option() {
    // "cpu" must not match the "cpuset" option of an earlier line.
    let info = "\
38 25 0:33 / /sys/fs/cgroup/cpuset rw,relatime shared:17 - cgroup cgroup rw,cpuset
37 25 0:32 / /sys/fs/cgroup/cpu rw,relatime shared:16 - cgroup cgroup rw,cpu
";
    let cpu = find_mount_point_in("cpu", info.as_bytes()).unwrap();
    assert_eq!(cpu, PathBuf::from("/sys/fs/cgroup/cpu"));
}

#[test]
fn test_find_mount_point_missing() {
    let err = find_mount_point_in("pids", MOUNT_INFO.as_bytes()).unwrap_err();
    assert!(err.to_string().contains("pids"), "{err}");
}

#[test]
fn test_config_is_empty() {
    assert!(CgroupConfig::default().is_empty());
    let config = CgroupConfig {
        mem_limit: "64m".into(),
        ..Default::default()
    };
    assert!(!config.is_empty());
}
