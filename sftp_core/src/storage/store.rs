use std::{fs, io, path::PathBuf};

use chrono::Utc;
use directories::ProjectDirs;
use log::{debug, warn};
use serde_json::Error as SerdeError;

use super::profile::{ConnectionProfile, CredentialRef, KEYRING_SERVICE};

#[derive(Debug, Clone)]
pub struct ProfileStore {
    dir: PathBuf,
}

impl ProfileStore {
    /// `~/.config/sftp_rs/profiles` on Linux, `%APPDATA%\sftp_rs\profiles` on Windows, etc.
    pub fn new() -> io::Result<Self> {
        let proj = ProjectDirs::from("", "", "sftp_rs")
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "Unable to locate config dir"))?;
        Self::with_dir(proj.config_dir().join("profiles"))
    }

    /// Store rooted at an explicit directory.
    pub fn with_dir(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn file_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Returns every stored profile, most recently used first
    /// (silently skips malformed files).
    pub fn list(&self) -> io::Result<Vec<ConnectionProfile>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !path.extension().is_some_and(|e| e == "json") {
                continue;
            }
            match fs::File::open(&path)
                .and_then(|f| serde_json::from_reader(f).map_err(SerdeError::into))
            {
                Ok(profile) => out.push(profile),
                Err(e) => warn!("could not read profile {:?}: {e}", path),
            }
        }
        out.sort_by(|a: &ConnectionProfile, b| b.recency().cmp(&a.recency()));
        Ok(out)
    }

    pub fn get(&self, id: &str) -> io::Result<Option<ConnectionProfile>> {
        match fs::File::open(self.file_for(id)) {
            Ok(f) => Ok(Some(serde_json::from_reader(f).map_err(io::Error::from)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Look a profile up by its display name.
    pub fn find_by_name(&self, name: &str) -> io::Result<Option<ConnectionProfile>> {
        Ok(self.list()?.into_iter().find(|p| p.name == name))
    }

    /// Create or overwrite a profile and return the id it was stored under.
    ///
    /// A profile for an already stored host/port/user replaces that entry and
    /// keeps its id and creation time. Inline passwords never reach the disk.
    pub fn save(&self, profile: &ConnectionProfile) -> io::Result<String> {
        let mut profile = profile.clone();
        if let Some(existing) = self
            .list()?
            .into_iter()
            .find(|p| p.id != profile.id && p.same_endpoint(&profile))
        {
            debug!("profile {} replaces {}", profile.name, existing.id);
            profile.id = existing.id;
            profile.created_at = existing.created_at;
        }

        if let CredentialRef::Inline { password, remember } = &profile.credential {
            if *remember {
                keyring::Entry::new(KEYRING_SERVICE, &profile.id)
                    .and_then(|entry| entry.set_password(password))
                    .map_err(io::Error::other)?;
            }
            profile.credential = CredentialRef::Keyring;
        }

        let file = fs::File::create(self.file_for(&profile.id))?;
        serde_json::to_writer_pretty(file, &profile).map_err(io::Error::from)?;
        Ok(profile.id)
    }

    /// Record that a profile was just used.
    pub fn touch(&self, id: &str) -> io::Result<bool> {
        let Some(mut profile) = self.get(id)? else {
            return Ok(false);
        };
        profile.last_used = Some(Utc::now());
        let file = fs::File::create(self.file_for(id))?;
        serde_json::to_writer_pretty(file, &profile).map_err(io::Error::from)?;
        Ok(true)
    }

    /// Delete a profile (`Ok(true)` if removed, `Ok(false)` if it didn’t exist).
    pub fn delete(&self, id: &str) -> io::Result<bool> {
        match fs::remove_file(self.file_for(id)) {
            Ok(()) => {
                if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, id) {
                    let _ = entry.delete_credential();
                }
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}
