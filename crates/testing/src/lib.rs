#[cfg(test)]
mod cli_tests {
    use assert_cmd::prelude::*;
    use std::{
        path::{Path, PathBuf},
        process::Command,
        sync::OnceLock,
    };
    use tempfile::tempdir;

    // The binary belongs to another package, so build it once if this test
    // run has not produced it yet.
    fn memsync_bin() -> &'static Path {
        static BIN: OnceLock<PathBuf> = OnceLock::new();
        BIN.get_or_init(|| {
            let path = assert_cmd::cargo::cargo_bin("memsync");
            if !path.exists() {
                let status = Command::new(env!("CARGO"))
                    .args(["build", "--quiet", "-p", "memsync-cli", "--bin", "memsync"])
                    .status()
                    .unwrap();
                assert!(status.success(), "building memsync failed");
            }
            path
        })
        .as_path()
    }

    fn memsync(root: &Path, remote: &Path, device: &str) -> Command {
        let mut cmd = Command::new(memsync_bin());
        cmd.arg("--root")
            .arg(root)
            .arg("--host")
            .arg(format!("file://{}", remote.display()))
            .args(["--device-id", device, "--log-level", "warn"]);
        cmd
    }

    fn stdout(cmd: &mut Command) -> String {
        let output = cmd.output().unwrap();
        assert!(
            output.status.success(),
            "command failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8(output.stdout).unwrap()
    }

    #[test]
    fn set_on_one_tree_is_visible_from_another() {
        let tmp = tempdir().unwrap();
        let remote = tmp.path().join("remote");
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");

        memsync(&a, &remote, "a")
            .args(["set", "profile:user", r#"{"name":"Ana"}"#])
            .assert()
            .success();

        let out = stdout(memsync(&b, &remote, "b").args(["get", "profile:user"]));
        assert_eq!(out.trim(), r#"{"name":"Ana"}"#);
    }

    #[test]
    fn list_prints_sorted_keys_for_prefix() {
        let tmp = tempdir().unwrap();
        let remote = tmp.path().join("remote");
        let root = tmp.path().join("a");
        for key in ["fact:2", "block:1", "fact:1"] {
            memsync(&root, &remote, "a")
                .args(["set", key, "v"])
                .assert()
                .success();
        }
        let out = stdout(memsync(&root, &remote, "a").args(["list", "fact:"]));
        assert_eq!(out.lines().collect::<Vec<_>>(), vec!["fact:1", "fact:2"]);
    }

    #[test]
    fn get_missing_key_fails() {
        let tmp = tempdir().unwrap();
        memsync(&tmp.path().join("a"), &tmp.path().join("remote"), "a")
            .args(["get", "fact:404"])
            .assert()
            .failure();
    }

    #[test]
    fn reset_requires_confirmation() {
        let tmp = tempdir().unwrap();
        let remote = tmp.path().join("remote");
        let root = tmp.path().join("a");
        memsync(&root, &remote, "a")
            .args(["set", "fact:1", "x"])
            .assert()
            .success();
        memsync(&root, &remote, "a")
            .arg("reset")
            .assert()
            .failure();
        memsync(&root, &remote, "a")
            .args(["reset", "--yes"])
            .assert()
            .success();
        memsync(&root, &remote, "a")
            .args(["get", "fact:1"])
            .assert()
            .failure();
    }

    #[test]
    fn status_and_account_commands() {
        let tmp = tempdir().unwrap();
        let remote = tmp.path().join("remote");
        let root = tmp.path().join("a");

        let status = stdout(memsync(&root, &remote, "laptop").arg("status"));
        assert!(status.contains("database: memory"));
        assert!(status.contains("last_sync: never"));
        assert!(status.contains("stale: true"));

        memsync(&root, &remote, "laptop")
            .arg("sync")
            .assert()
            .success();
        let whoami = stdout(memsync(&root, &remote, "laptop").arg("whoami"));
        assert_eq!(whoami.trim(), "laptop");
        let keys = stdout(memsync(&root, &remote, "laptop").arg("keys"));
        assert!(keys.starts_with("laptop\t"));

        memsync(&root, &remote, "laptop")
            .args(["unlink-key", "laptop"])
            .assert()
            .success();
        memsync(&root, &remote, "laptop")
            .args(["unlink-key", "laptop"])
            .assert()
            .failure();
    }
}

#[cfg(test)]
mod tests {
    use std::{path::Path, time::Duration};

    use memsync_client::StorageClient;
    use memsync_core::{
        config::SessionConfig,
        errors::{ClientError, ErrorKind, Operation},
        keys,
        traits::RemoteStore,
    };
    use memsync_storage_ephemeral::{EphemeralRemote, EphemeralStore};
    use memsync_storage_git::GitStore;
    use serde::{Deserialize, Serialize};
    use tempfile::tempdir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Fact {
        id: String,
        key: String,
        text: String,
    }

    fn file_config(remote: &Path) -> SessionConfig {
        SessionConfig::new(&format!("file://{}", remote.display()), "memory")
            .unwrap()
            .with_staleness(Duration::from_secs(3600))
    }

    fn git_client(root: &Path, remote: &Path, device: &str) -> StorageClient<GitStore> {
        let mut store = GitStore::new(root).unwrap();
        store.set_device_id(device);
        StorageClient::new(file_config(remote), store)
    }

    fn exercise_contract<S: RemoteStore>(client: &StorageClient<S>) {
        client.set("fact:1", b"one").unwrap();
        client.set("fact:2", b"two").unwrap();
        client.set("block:1", b"blk").unwrap();
        assert_eq!(client.get("fact:1").unwrap(), Some(b"one".to_vec()));

        let mut facts = client.list_keys(keys::FACT_PREFIX).unwrap();
        facts.sort();
        assert_eq!(facts, vec!["fact:1", "fact:2"]);

        client.delete("fact:1").unwrap();
        assert_eq!(client.get("fact:1").unwrap(), None);
        let err = client.get_json::<Fact>("fact:1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        client
            .set_json(keys::PROFILE_KEY, &serde_json::json!({"name": "Ana"}))
            .unwrap();
        let profile: serde_json::Value = client.get_json(keys::PROFILE_KEY).unwrap();
        assert_eq!(profile["name"], "Ana");
    }

    #[test]
    fn ephemeral_backend_meets_client_contract() {
        let client = StorageClient::new(file_config(Path::new("/unused")), EphemeralStore::new());
        exercise_contract(&client);
    }

    #[test]
    fn git_backend_meets_client_contract() {
        let tmp = tempdir().unwrap();
        let client = git_client(&tmp.path().join("local"), &tmp.path().join("remote"), "a");
        exercise_contract(&client);
    }

    #[test]
    fn fact_with_secondary_key_written_in_one_batch() {
        let tmp = tempdir().unwrap();
        let client = git_client(&tmp.path().join("local"), &tmp.path().join("remote"), "a");
        let fact = Fact {
            id: keys::new_fact_id(),
            key: "home-city".into(),
            text: "Lives in Lisbon".into(),
        };
        client
            .run_read_write(|tx| -> Result<(), ClientError> {
                tx.set_json(&keys::fact_key(&fact.id), &fact)?;
                tx.set(&keys::fact_by_key(&fact.key), fact.id.as_bytes())?;
                Ok(())
            })
            .unwrap();

        let found: Fact = client
            .run_read_only(|tx| -> Result<Fact, ClientError> {
                let id = tx
                    .get(&keys::fact_by_key("home-city"))?
                    .ok_or_else(|| {
                        ClientError::not_found(Operation::Get, &keys::fact_by_key("home-city"))
                    })?;
                tx.get_json(&keys::fact_key(&String::from_utf8_lossy(&id)))
            })
            .unwrap();
        assert_eq!(found, fact);
    }

    #[test]
    fn failed_git_batch_leaves_nothing_behind() {
        let tmp = tempdir().unwrap();
        let remote = tmp.path().join("remote");
        let client = git_client(&tmp.path().join("local"), &remote, "a");
        let res: Result<(), ClientError> = client.run_read_write(|tx| {
            tx.set("block:1", b"half")?;
            Err(ClientError::not_found(Operation::Get, "block:missing"))
        });
        assert!(res.is_err());
        assert!(!remote.join("memory").exists());
        assert_eq!(client.store().pending_changes("memory").unwrap(), 0);
        assert_eq!(client.get("block:1").unwrap(), None);
    }

    #[test]
    fn independent_processes_share_through_remote() {
        let tmp = tempdir().unwrap();
        let remote = tmp.path().join("remote");
        let writer = git_client(&tmp.path().join("w"), &remote, "writer");
        let patient = git_client(&tmp.path().join("p"), &remote, "patient");
        let eager = StorageClient::new(
            file_config(&remote).with_staleness(Duration::ZERO),
            {
                let mut s = GitStore::new(tmp.path().join("e")).unwrap();
                s.set_device_id("eager");
                s
            },
        );

        // patient syncs once up front, then trusts local data for an hour
        patient.sync().unwrap();
        writer.set("block:1", b"v1").unwrap();

        assert_eq!(eager.get("block:1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(patient.get("block:1").unwrap(), None);
        patient.sync().unwrap();
        assert_eq!(patient.get("block:1").unwrap(), Some(b"v1".to_vec()));

        let mut devices: Vec<String> = writer
            .list_authorized_keys()
            .unwrap()
            .into_iter()
            .map(|k| k.id)
            .collect();
        devices.sort();
        assert_eq!(devices, vec!["eager", "patient", "writer"]);
    }

    #[test]
    fn local_writes_without_auto_sync_stay_local() {
        let tmp = tempdir().unwrap();
        let remote = tmp.path().join("remote");
        let mut store = GitStore::new(tmp.path().join("local")).unwrap();
        store.set_device_id("a");
        let client = StorageClient::new(file_config(&remote).with_auto_sync(false), store);
        client.set("fact:1", b"x").unwrap();
        assert_eq!(client.store().pending_changes("memory").unwrap(), 1);
        assert!(!remote.join("memory").exists());

        client.sync().unwrap();
        assert_eq!(client.store().pending_changes("memory").unwrap(), 0);
        assert!(remote.join("memory").exists());
    }

    #[test]
    fn staleness_bounds_what_readers_see() {
        let remote = EphemeralRemote::default();
        let cfg = file_config(Path::new("/unused"));
        let writer = StorageClient::new(cfg.clone(), EphemeralStore::with_remote(remote.clone()));
        let reader_store = EphemeralStore::with_remote(remote.clone());
        let reader = StorageClient::new(cfg, reader_store.clone());

        reader.sync().unwrap();
        writer.set("fact:1", b"new").unwrap();
        assert_eq!(reader.get("fact:1").unwrap(), None);

        reader_store.set_last_sync(
            "memory",
            Some(chrono::Utc::now() - chrono::Duration::hours(2)),
        );
        let before = remote.sync_count();
        assert_eq!(reader.get("fact:1").unwrap(), Some(b"new".to_vec()));
        assert_eq!(remote.sync_count(), before + 1);
    }

    #[test]
    fn long_keys_round_trip_through_git_client() {
        let tmp = tempdir().unwrap();
        let remote = tmp.path().join("remote");
        let writer = git_client(&tmp.path().join("w"), &remote, "w");
        let reader = git_client(&tmp.path().join("r"), &remote, "r");
        let key = keys::fact_by_key(&"k".repeat(189));
        assert_eq!(key.len(), 200);

        writer.set(&key, b"fact_1").unwrap();
        assert_eq!(writer.get(&key).unwrap(), Some(b"fact_1".to_vec()));
        assert_eq!(reader.get(&key).unwrap(), Some(b"fact_1".to_vec()));
        assert_eq!(reader.list_keys(keys::FACT_BY_KEY_PREFIX).unwrap(), vec![key]);
    }

    #[test]
    fn unreadable_sync_stamp_is_an_open_failure() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("local");
        let client = git_client(&root, &tmp.path().join("remote"), "a");
        client.sync().unwrap();
        std::fs::write(root.join("meta").join("memory").join("SYNC.json"), b"{oops").unwrap();

        let err = client.last_synced_at().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connectivity);
        assert_eq!(err.operation(), Some(Operation::Open));
        let err = client.get("fact:1").unwrap_err();
        assert_eq!(err.operation(), Some(Operation::Open));
    }
}
