//! Draft namespaces
//!
//! A draft is a mutable pointer scoped to `(item_id, owner, session_id)`.
//! Its revisions live in the item's log like any other, but are only
//! reachable through the pointer; discarding a draft drops the pointer.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::error::{Result, VaultError};
use crate::item::ItemId;
use crate::store::{Namespace, Revision, RevisionId, RevisionRef, RevisionStore};

/// Check that an owner or session id is usable in refs and file names
pub fn validate_segment(field: &str, value: &str) -> Result<()> {
    let valid = !value.is_empty()
        && value.len() <= 64
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(VaultError::validation(format!("Invalid {}: {:?}", field, value)))
    }
}

/// Identifies one draft
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DraftKey {
    pub item_id: ItemId,
    pub owner: String,
    pub session_id: String,
}

impl DraftKey {
    pub fn new(item_id: ItemId, owner: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            item_id,
            owner: owner.into(),
            session_id: session_id.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_segment("owner", &self.owner)?;
        validate_segment("session_id", &self.session_id)
    }

    pub fn namespace(&self) -> Namespace {
        Namespace::draft(&self.owner, &self.session_id)
    }

    pub fn to_ref(&self) -> RevisionRef {
        RevisionRef::draft_ref(&self.owner, &self.session_id)
    }
}

impl fmt::Display for DraftKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/draft/{}/{}", self.item_id, self.owner, self.session_id)
    }
}

/// Persisted state of one draft
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftPointer {
    pub item_id: ItemId,
    pub owner: String,
    pub session_id: String,
    /// Main head when the draft was opened
    pub base: Option<RevisionId>,
    /// Latest draft revision, if anything was saved
    pub head: Option<RevisionId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DraftPointer {
    pub(crate) fn new(key: &DraftKey, base: Option<RevisionId>) -> Self {
        let now = Utc::now();
        Self {
            item_id: key.item_id.clone(),
            owner: key.owner.clone(),
            session_id: key.session_id.clone(),
            base,
            head: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> DraftKey {
        DraftKey::new(self.item_id.clone(), &self.owner, &self.session_id)
    }

    pub fn ref_name(&self) -> String {
        self.key().to_ref().to_string()
    }

    /// Revision the draft currently resolves to
    pub fn tip(&self) -> Option<RevisionId> {
        self.head.or(self.base)
    }
}

/// Draft operations over a revision store
#[derive(Clone)]
pub struct DraftNamespace {
    store: Arc<RevisionStore>,
}

impl DraftNamespace {
    pub fn new(store: Arc<RevisionStore>) -> Self {
        Self { store }
    }

    /// Open the draft, basing it on the current main head. Idempotent.
    pub fn open(&self, key: &DraftKey) -> Result<DraftPointer> {
        key.validate()?;
        self.store.open_draft(key)
    }

    pub fn pointer(&self, key: &DraftKey) -> Result<DraftPointer> {
        self.store.draft(key)
    }

    /// Revision the draft resolves to
    pub fn head(&self, key: &DraftKey) -> Result<Revision> {
        let item = self.store.get_item(&key.item_id)?;
        self.store
            .resolve(&item.path().to_string(), Some(&key.to_ref()))
    }

    /// Save content into the draft, opening it first if needed
    #[instrument(skip(self, content), fields(draft = %key))]
    pub fn write(&self, key: &DraftKey, content: &str, message: &str) -> Result<RevisionId> {
        self.open(key)?;
        let item = self.store.get_item(&key.item_id)?;
        self.store.write_to(
            &item.path().to_string(),
            &key.namespace(),
            content,
            message,
            &key.owner,
        )
    }

    /// Open drafts of an item
    pub fn list(&self, item_id: &ItemId) -> Result<Vec<DraftPointer>> {
        self.store.drafts(item_id)
    }

    pub fn discard(&self, key: &DraftKey) -> Result<DraftPointer> {
        self.store.discard_draft(key)
    }

    /// Discard every draft untouched for longer than `older_than`
    #[instrument(skip(self))]
    pub fn gc(&self, older_than: Duration) -> Result<Vec<DraftKey>> {
        let removed = self.store.discard_drafts_before(Utc::now() - older_than)?;
        if !removed.is_empty() {
            info!(count = removed.len(), "collected abandoned drafts");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{ItemKind, NewItem};

    fn setup() -> (DraftNamespace, Arc<RevisionStore>, ItemId, String) {
        let store = Arc::new(RevisionStore::in_memory());
        let item = NewItem::new(ItemKind::prompt(), "greeting", "Greeting")
            .into_item("ana", Utc::now())
            .unwrap();
        let id = item.id.clone();
        let path = item.path().to_string();
        store.create_item(item, "main", "create").unwrap();
        (DraftNamespace::new(store.clone()), store, id, path)
    }

    #[test]
    fn test_open_draft_resolves_to_base() {
        let (drafts, _, id, _) = setup();
        let key = DraftKey::new(id, "ana", "s1");
        let pointer = drafts.open(&key).unwrap();

        assert_eq!(pointer.base, Some(RevisionId::new(1)));
        assert_eq!(pointer.head, None);
        assert_eq!(drafts.head(&key).unwrap().content, "main");
        assert_eq!(pointer.ref_name(), "draft/ana/s1");
    }

    #[test]
    fn test_draft_writes_stay_off_main() {
        let (drafts, store, id, path) = setup();
        let key = DraftKey::new(id, "ana", "s1");
        drafts.write(&key, "draft one", "wip").unwrap();
        let r = drafts.write(&key, "draft two", "wip").unwrap();

        assert_eq!(drafts.head(&key).unwrap().revision_id, r);
        assert_eq!(drafts.head(&key).unwrap().parent, Some(RevisionId::new(2)));
        assert_eq!(store.read(&path, None).unwrap(), "main");
        assert_eq!(store.history_len(&path).unwrap(), 1);
    }

    #[test]
    fn test_sessions_are_isolated() {
        let (drafts, _, id, _) = setup();
        let a = DraftKey::new(id.clone(), "ana", "s1");
        let b = DraftKey::new(id.clone(), "ben", "s1");
        drafts.write(&a, "from ana", "wip").unwrap();
        drafts.write(&b, "from ben", "wip").unwrap();

        assert_eq!(drafts.head(&a).unwrap().content, "from ana");
        assert_eq!(drafts.head(&b).unwrap().content, "from ben");
        assert_eq!(drafts.list(&id).unwrap().len(), 2);
    }

    #[test]
    fn test_discard_keeps_revisions() {
        let (drafts, store, id, path) = setup();
        let key = DraftKey::new(id, "ana", "s1");
        let r = drafts.write(&key, "draft", "wip").unwrap();

        drafts.discard(&key).unwrap();
        assert!(drafts.head(&key).unwrap_err().is_not_found());
        assert!(drafts.discard(&key).unwrap_err().is_not_found());
        assert_eq!(store.read(&path, Some(&RevisionRef::Revision(r))).unwrap(), "draft");
    }

    #[test]
    fn test_gc_only_collects_stale_drafts() {
        let (drafts, _, id, _) = setup();
        drafts.open(&DraftKey::new(id.clone(), "ana", "s1")).unwrap();

        assert!(drafts.gc(Duration::hours(1)).unwrap().is_empty());
        let removed = drafts.gc(Duration::seconds(-1)).unwrap();
        assert_eq!(removed.len(), 1);
        assert!(drafts.list(&id).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_bad_segments() {
        let (drafts, _, id, _) = setup();
        assert!(drafts.open(&DraftKey::new(id.clone(), "a/b", "s1")).is_err());
        assert!(drafts.open(&DraftKey::new(id, "ana", "")).is_err());
    }
}
