use std::path::PathBuf;

use chrono::{Duration, Utc};
use sftp_core::storage::{ConnectionProfile, CredentialRef, ProfileStore, SavedConnection};

fn key_profile(name: &str, host: &str, user: &str) -> ConnectionProfile {
    ConnectionProfile::new(
        name,
        host,
        22,
        user,
        CredentialRef::KeyFile {
            path: PathBuf::from("/home/me/.ssh/id_ed25519"),
            passphrase_in_keyring: false,
        },
    )
}

#[test]
fn save_get_and_delete() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = ProfileStore::with_dir(dir.path())?;
    let profile = key_profile("build", "build.example", "ci");

    let id = store.save(&profile)?;
    assert_eq!(id, profile.id);
    assert_eq!(store.get(&id)?, Some(profile.clone()));
    assert_eq!(store.find_by_name("build")?.map(|p| p.id), Some(id.clone()));

    assert!(store.delete(&id)?);
    assert!(!store.delete(&id)?);
    assert_eq!(store.get(&id)?, None);
    Ok(())
}

#[test]
fn same_endpoint_replaces_the_existing_entry() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = ProfileStore::with_dir(dir.path())?;
    let first = key_profile("old name", "db.example", "admin");
    let first_id = store.save(&first)?;

    let mut second = key_profile("new name", "db.example", "admin");
    second.credential = CredentialRef::Agent;
    let second_id = store.save(&second)?;

    assert_eq!(second_id, first_id, "entry keeps its id");
    let all = store.list()?;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].name, "new name");
    assert_eq!(all[0].credential, CredentialRef::Agent);
    assert_eq!(all[0].created_at, first.created_at);
    Ok(())
}

#[test]
fn list_is_most_recent_first_and_touch_reorders() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = ProfileStore::with_dir(dir.path())?;

    let mut older = key_profile("older", "a.example", "u");
    older.created_at = Utc::now() - Duration::days(2);
    let mut newer = key_profile("newer", "b.example", "u");
    newer.created_at = Utc::now() - Duration::days(1);
    store.save(&older)?;
    store.save(&newer)?;

    let names: Vec<String> = store.list()?.into_iter().map(|p| p.name).collect();
    assert_eq!(names, ["newer", "older"]);

    assert!(store.touch(&older.id)?);
    assert!(!store.touch("conn_missing")?);
    let names: Vec<String> = store.list()?.into_iter().map(|p| p.name).collect();
    assert_eq!(names, ["older", "newer"]);
    Ok(())
}

#[test]
fn malformed_files_are_skipped() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = ProfileStore::with_dir(dir.path())?;
    store.save(&key_profile("ok", "ok.example", "u"))?;
    std::fs::write(dir.path().join("broken.json"), b"{ not json")?;
    std::fs::write(dir.path().join("notes.txt"), b"ignored")?;

    let all = store.list()?;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].name, "ok");
    Ok(())
}

#[test]
fn inline_password_never_reaches_disk() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = ProfileStore::with_dir(dir.path())?;
    let profile = ConnectionProfile::new(
        "pw",
        "pw.example",
        2222,
        "me",
        CredentialRef::Inline {
            password: "hunter2".into(),
            remember: false,
        },
    );

    let id = store.save(&profile)?;
    let raw = std::fs::read_to_string(dir.path().join(format!("{id}.json")))?;
    assert!(!raw.contains("hunter2"));
    assert_eq!(store.get(&id)?.map(|p| p.credential), Some(CredentialRef::Keyring));
    Ok(())
}

#[test]
fn saved_connection_json_converts_to_a_profile() -> anyhow::Result<()> {
    let json = r#"{
        "id": "conn_1",
        "name": "staging",
        "host": "staging.example",
        "port": 22,
        "username": "deploy",
        "password": "pw",
        "savePassword": true,
        "createdAt": "2024-05-01T10:00:00Z"
    }"#;
    let saved: SavedConnection = serde_json::from_str(json)?;
    let profile = ConnectionProfile::from(saved);

    assert_eq!(profile.id, "conn_1");
    assert_eq!(profile.endpoint(), "deploy@staging.example:22");
    assert_eq!(
        profile.credential,
        CredentialRef::Inline {
            password: "pw".into(),
            remember: true
        }
    );
    assert_eq!(profile.last_used, None);

    let without: SavedConnection = serde_json::from_str(
        r#"{"id":"conn_2","name":"n","host":"h","port":22,"username":"u","createdAt":"2024-05-01T10:00:00Z"}"#,
    )?;
    assert_eq!(ConnectionProfile::from(without).credential, CredentialRef::Keyring);
    Ok(())
}
