//! Session bookkeeping database.
//!
//! A small JSON-backed table of completed sessions, one record per
//! (subject, session, task) triple, holding the output paths the session
//! produced. Re-running a session replaces its record (last write wins);
//! everything else is append-only.

use crate::error::AcqResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SessionRecord {
    pub subject: String,
    pub session: String,
    pub task: String,
    /// Output label ("configuration", "device/<id>", ...) to file path.
    pub paths: BTreeMap<String, PathBuf>,
}

impl SessionRecord {
    fn key(&self) -> (&str, &str, &str) {
        (&self.subject, &self.session, &self.task)
    }
}

pub struct SessionDatabase {
    path: PathBuf,
    records: Vec<SessionRecord>,
}

impl SessionDatabase {
    /// Open (or create) the database file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> AcqResult<Self> {
        let path = path.into();
        let records = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            serde_json::from_str(&text)?
        } else {
            Vec::new()
        };
        Ok(Self { path, records })
    }

    /// Insert or replace the record for its (subject, session, task) key,
    /// then persist.
    pub fn update(&mut self, record: SessionRecord) -> AcqResult<()> {
        if let Some(existing) = self
            .records
            .iter_mut()
            .find(|r| r.key() == record.key())
        {
            *existing = record;
        } else {
            self.records.push(record);
        }
        self.save()
    }

    pub fn sessions(&self) -> &[SessionRecord] {
        &self.records
    }

    pub fn find(&self, subject: &str, session: &str, task: &str) -> Option<&SessionRecord> {
        self.records
            .iter()
            .find(|r| r.key() == (subject, session, task))
    }

    fn save(&self) -> AcqResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(&self.records)?;
        std::fs::write(&self.path, text)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(subject: &str, label: &str) -> SessionRecord {
        let mut paths = BTreeMap::new();
        paths.insert(label.to_string(), PathBuf::from(format!("/data/{label}.csv")));
        SessionRecord {
            subject: subject.to_string(),
            session: "01".to_string(),
            task: "wheel".to_string(),
            paths,
        }
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        {
            let mut db = SessionDatabase::open(&path).unwrap();
            db.update(record("s1", "configuration")).unwrap();
            db.update(record("s2", "configuration")).unwrap();
        }
        let db = SessionDatabase::open(&path).unwrap();
        assert_eq!(db.sessions().len(), 2);
        assert!(db.find("s1", "01", "wheel").is_some());
    }

    #[test]
    fn rerun_replaces_previous_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let mut db = SessionDatabase::open(&path).unwrap();
        db.update(record("s1", "first")).unwrap();
        db.update(record("s1", "second")).unwrap();

        assert_eq!(db.sessions().len(), 1);
        let kept = db.find("s1", "01", "wheel").unwrap();
        assert!(kept.paths.contains_key("second"));
        assert!(!kept.paths.contains_key("first"));
    }
}
