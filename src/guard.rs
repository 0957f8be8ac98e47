//! Optimistic concurrency for main-history writes

use std::sync::Arc;

use tracing::debug;

use crate::checksum::Fingerprint;
use crate::error::Result;
use crate::store::{RevisionId, RevisionStore};

/// Rejects writes whose caller saw a different head than the current one.
///
/// A caller reads content together with its fingerprint, edits, and hands the
/// fingerprint back. If someone else committed in between, the write fails with
/// [`VaultError::Conflict`](crate::VaultError::Conflict) carrying the current
/// fingerprint so the caller can re-fetch and merge.
#[derive(Clone)]
pub struct ConflictGuard {
    store: Arc<RevisionStore>,
}

impl ConflictGuard {
    pub fn new(store: Arc<RevisionStore>) -> Self {
        Self { store }
    }

    pub fn check_and_write(
        &self,
        path: &str,
        expected: &Fingerprint,
        new_content: &str,
        message: &str,
        author: &str,
    ) -> Result<RevisionId> {
        let id = self.store.write_if(path, expected, new_content, message, author)?;
        debug!(path, revision = %id, "guarded write accepted");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VaultError;
    use crate::item::{ItemKind, NewItem};
    use chrono::Utc;

    #[test]
    fn test_second_writer_with_stale_fingerprint_conflicts() {
        let store = Arc::new(RevisionStore::in_memory());
        let item = NewItem::new(ItemKind::prompt(), "greeting", "Greeting")
            .into_item("ana", Utc::now())
            .unwrap();
        let path = item.path().to_string();
        store.create_item(item, "C1", "create").unwrap();
        let guard = ConflictGuard::new(store.clone());

        let seen = store.fingerprint(&path, None).unwrap();
        guard.check_and_write(&path, &seen, "A", "from a", "ana").unwrap();

        let err = guard.check_and_write(&path, &seen, "B", "from b", "ben").unwrap_err();
        assert!(err.is_retryable());
        match err {
            VaultError::Conflict { current } => assert_eq!(current, Fingerprint::of("A")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(store.read(&path, None).unwrap(), "A");
    }
}
