use common::TempDir;
use miniker::{
    ContainerRecord, ContainerStore, Ipam, LayerStore, NetworkRegistry, Pid, Runtime, Status,
};

mod common;

fn new_runtime(tmpdir: &TempDir) -> Runtime {
    let store = ContainerStore::new(tmpdir.join("info"));
    let layers = LayerStore::new(tmpdir.join("layers"));
    let registry = NetworkRegistry::new(
        tmpdir.join("networks"),
        Ipam::new(tmpdir.join("subnet.json")),
    )
    .unwrap();
    Runtime::with_stores(store, layers, registry)
}

#[test]
fn test_remove_requires_exited_container() {
    let tmpdir = TempDir::new().unwrap();
    let runtime = new_runtime(&tmpdir);
    let store = ContainerStore::new(tmpdir.join("info"));
    let record = ContainerRecord::new(
        Pid::from_raw(1234),
        miniker::generate_id(),
        "web".to_string(),
        &["/bin/sh".to_string()],
    );
    store.save(&record).unwrap();
    let err = runtime.remove("web").unwrap_err();
    assert!(err.to_string().contains("not exited"), "{err}");
    let mut record = store.get("web").unwrap();
    record.status = Status::Exit;
    record.pid = String::new();
    store.save(&record).unwrap();
    runtime.remove("web").unwrap();
    assert!(store.get("web").is_err());
}

#[test]
fn test_remove_missing_container() {
    let tmpdir = TempDir::new().unwrap();
    let runtime = new_runtime(&tmpdir);
    let err = runtime.remove("ghost").unwrap_err();
    assert!(err.to_string().contains("No such container"), "{err}");
}

#[test]
fn test_logs_missing_container() {
    let tmpdir = TempDir::new().unwrap();
    let runtime = new_runtime(&tmpdir);
    assert!(runtime.logs("ghost").is_err());
}

#[test]
fn test_logs_reads_container_log() {
    let tmpdir = TempDir::new().unwrap();
    let runtime = new_runtime(&tmpdir);
    let store = ContainerStore::new(tmpdir.join("info"));
    {
        use std::io::Write as _;
        let mut file = store.create_log_file("web").unwrap();
        file.write_all(b"hello from container\n").unwrap();
    }
    assert_eq!(runtime.logs("web").unwrap(), "hello from container\n");
}
