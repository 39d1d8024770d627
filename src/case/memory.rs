use std::collections::HashMap;
use std::sync::Mutex;

use super::{Case, CaseError, CaseStore};

/// Process-local store. Used by tests and one-shot CLI runs that should not
/// touch the case directory.
#[derive(Default)]
pub struct MemoryCaseStore {
    cases: Mutex<HashMap<String, Case>>,
}

impl MemoryCaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Case>> {
        match self.cases.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl CaseStore for MemoryCaseStore {
    fn get_case(&self, id: &str) -> Result<Case, CaseError> {
        self.lock()
            .get(id)
            .cloned()
            .ok_or_else(|| CaseError::NotFound(id.to_string()))
    }

    fn put_case(&self, case: &Case) -> Result<(), CaseError> {
        self.lock().insert(case.id.clone(), case.clone());
        Ok(())
    }

    fn list_cases(&self) -> Result<Vec<Case>, CaseError> {
        let mut cases: Vec<Case> = self.lock().values().cloned().collect();
        cases.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at).then_with(|| b.id.cmp(&a.id)));
        Ok(cases)
    }
}
