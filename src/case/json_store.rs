use std::io::Write;
use std::path::{Path, PathBuf};

use super::{Case, CaseError, CaseStore};

/// One pretty-printed JSON file per case, `<dir>/<case_id>.json`.
/// Writes go through a temp file in the same directory and a rename, so a
/// crash never leaves a half-written case behind.
pub struct JsonCaseStore {
    dir: PathBuf,
}

impl JsonCaseStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CaseError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Store under the default application data directory.
    pub fn open_default() -> Result<Self, CaseError> {
        Self::open(crate::config::cases_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, CaseError> {
        let safe = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !safe {
            return Err(CaseError::NotFound(id.to_string()));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }
}

impl CaseStore for JsonCaseStore {
    fn get_case(&self, id: &str) -> Result<Case, CaseError> {
        let path = self.path_for(id)?;
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CaseError::NotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&content)?)
    }

    fn put_case(&self, case: &Case) -> Result<(), CaseError> {
        let path = self.path_for(&case.id)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer_pretty(&mut tmp, case)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| CaseError::Io(e.error))?;
        Ok(())
    }

    fn list_cases(&self) -> Result<Vec<Case>, CaseError> {
        let mut cases = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let parsed = std::fs::read_to_string(&path)
                .map_err(CaseError::from)
                .and_then(|content| serde_json::from_str::<Case>(&content).map_err(CaseError::from));
            match parsed {
                Ok(case) => cases.push(case),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable case file");
                }
            }
        }
        cases.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at).then_with(|| b.id.cmp(&a.id)));
        Ok(cases)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisOutput;
    use crate::case::{CaseStatus, NewCase};
    use chrono::{Duration, Utc};

    fn new_case(name: &str) -> NewCase {
        NewCase {
            customer_name: name.into(),
            customer_email: format!("{}@example.com", name.to_lowercase()),
            pipeline: "psych_timeline".into(),
            records_count: 2,
        }
    }

    #[test]
    fn create_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCaseStore::open(dir.path()).unwrap();
        let case = store.create_case(new_case("Alice")).unwrap();

        let path = dir.path().join(format!("{}.json", case.id));
        assert!(path.exists());

        let reopened = JsonCaseStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get_case(&case.id).unwrap(), case);
    }

    #[test]
    fn analysis_survives_roundtrip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCaseStore::open(dir.path()).unwrap();
        let case = store.create_case(new_case("Bob")).unwrap();
        let analysis = AnalysisOutput {
            chronology: vec!["entry".into()],
            ..AnalysisOutput::default()
        };
        store.update_analysis(&case.id, &analysis, None).unwrap();

        let loaded = store.get_case(&case.id).unwrap();
        assert_eq!(loaded.status, CaseStatus::PendingReview);
        assert_eq!(loaded.analysis.as_ref(), Some(&analysis));
        assert_eq!(loaded.edits.as_ref(), Some(&analysis));
    }

    #[test]
    fn list_is_newest_first_and_skips_junk() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCaseStore::open(dir.path()).unwrap();

        let mut older = crate::case::Case::new(new_case("Old"), Utc::now() - Duration::days(2));
        older.id = "20200101_000000_aaaaaaaa".into();
        store.put_case(&older).unwrap();
        let newer = store.create_case(new_case("New")).unwrap();

        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignore me").unwrap();

        let cases = store.list_cases().unwrap();
        let ids: Vec<&str> = cases.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec![newer.id.as_str(), older.id.as_str()]);
    }

    #[test]
    fn unknown_and_unsafe_ids_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCaseStore::open(dir.path()).unwrap();
        assert!(matches!(store.get_case("missing"), Err(CaseError::NotFound(_))));
        assert!(matches!(store.get_case("../etc/passwd"), Err(CaseError::NotFound(_))));
    }

    #[test]
    fn open_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("cases");
        let store = JsonCaseStore::open(&nested).unwrap();
        assert!(store.dir().is_dir());
    }
}
