//! The vault facade
//!
//! Owns one revision store, the search index and configuration. Every
//! mutation that changes an item's main history or metadata re-syncs that
//! item's index row before returning. Once the store has committed, a failed
//! sync only leaves the row stale until the next sync or [`Vault::rebuild`];
//! the mutation still reports success.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::checksum::Fingerprint;
use crate::config::VaultConfig;
use crate::drafts::{DraftKey, DraftNamespace, DraftPointer};
use crate::error::Result;
use crate::frontmatter::FrontMatter;
use crate::guard::ConflictGuard;
use crate::index::{IndexSource, IndexStatus, RebuildReport, SearchIndex, SearchPage, SearchQuery};
use crate::item::{Item, ItemId, ItemPatch, ItemType, NewItem};
use crate::publish::{DraftSaved, PublishRequest, PublishWorkflow, ResolvedContent, TimelineEvent};
use crate::store::{CommitInfo, DiffResult, RevisionId, RevisionRef, RevisionStore};
use crate::tags::{Release, TagManager};
use crate::version::ReleaseVersion;

/// A diff plus the front matter keys that changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comparison {
    pub diff: DiffResult,
    pub metadata_changes: Vec<String>,
}

pub struct Vault {
    config: VaultConfig,
    store: Arc<RevisionStore>,
    index: SearchIndex,
    workflow: PublishWorkflow,
}

impl Vault {
    /// Open the store at the configured path
    pub fn open(config: VaultConfig) -> Result<Self> {
        let store = Arc::new(RevisionStore::open(config.storage_path())?);
        let index = match config.index_file() {
            Some(file) => SearchIndex::open(file, config.lock_timeout())?,
            None => SearchIndex::new(config.lock_timeout()),
        };

        let vault = Self::assemble(config, store, index);
        if vault.index.is_empty()? && !vault.store.item_ids()?.is_empty() {
            let report = vault.rebuild()?;
            info!(rows = report.total(), "populated empty search index");
        }
        Ok(vault)
    }

    /// A vault that keeps nothing on disk
    pub fn in_memory(config: VaultConfig) -> Self {
        let index = SearchIndex::new(config.lock_timeout());
        Self::assemble(config, Arc::new(RevisionStore::in_memory()), index)
    }

    fn assemble(config: VaultConfig, store: Arc<RevisionStore>, index: SearchIndex) -> Self {
        Self {
            workflow: PublishWorkflow::new(store.clone()),
            config,
            store,
            index,
        }
    }

    pub fn close(&self) {
        self.store.close();
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<RevisionStore> {
        &self.store
    }

    pub fn index(&self) -> &SearchIndex {
        &self.index
    }

    pub fn workflow(&self) -> &PublishWorkflow {
        &self.workflow
    }

    pub fn tags(&self) -> &TagManager {
        self.workflow.tags()
    }

    pub fn drafts(&self) -> &DraftNamespace {
        self.workflow.drafts()
    }

    fn author(&self, author: Option<&str>) -> String {
        self.config.author_or_default(author)
    }

    fn path_of(&self, id: &ItemId) -> Result<String> {
        Ok(self.store.get_item(id)?.path().to_string())
    }

    fn parse_ref(at: Option<&str>) -> Result<RevisionRef> {
        at.map(RevisionRef::parse)
            .transpose()
            .map(|r| r.unwrap_or(RevisionRef::Head))
    }

    // --- Items ---

    #[instrument(skip(self, new, content), fields(slug = %new.slug))]
    pub fn create_item(&self, new: NewItem, content: &str, author: Option<&str>) -> Result<(Item, RevisionId)> {
        let author = self.author(author);
        let item = new.into_item(&author, Utc::now())?;
        let id = item.id.clone();

        let revision = self.store.create_item(item, content, "Initial revision")?;
        self.refresh_index(&id);
        Ok((self.store.get_item(&id)?, revision))
    }

    pub fn get_item(&self, id: &ItemId) -> Result<Item> {
        self.store.get_item(id)
    }

    pub fn find_by_slug(&self, item_type: ItemType, slug: &str) -> Option<Item> {
        self.store.find_by_slug(item_type, slug)
    }

    pub fn list_items(&self, item_type: Option<ItemType>) -> Result<Vec<Item>> {
        self.store.list_items(item_type)
    }

    #[instrument(skip(self, patch))]
    pub fn update_item(&self, id: &ItemId, patch: ItemPatch) -> Result<Item> {
        let current = self.store.get_item(id)?;
        if patch.is_empty() {
            return Ok(current);
        }
        let mut updated = patch.apply(&current)?;
        updated.updated_at = Utc::now();

        self.store.update_item(updated.clone())?;
        self.refresh_index(id);
        Ok(updated)
    }

    #[instrument(skip(self))]
    pub fn delete_item(&self, id: &ItemId) -> Result<Item> {
        let item = self.store.delete_item(id)?;
        if let Err(e) = self.index.remove(id) {
            warn!(item = %id, error = %e, "index row left behind after delete");
        }
        Ok(item)
    }

    // --- Content ---

    pub fn read(&self, id: &ItemId, at: Option<&str>) -> Result<String> {
        let at = Self::parse_ref(at)?;
        self.store.read(&self.path_of(id)?, Some(&at))
    }

    pub fn write(&self, id: &ItemId, content: &str, message: &str, author: Option<&str>) -> Result<RevisionId> {
        let revision = self
            .store
            .write(&self.path_of(id)?, content, message, &self.author(author))?;
        self.refresh_index(id);
        Ok(revision)
    }

    /// Write that fails with `Conflict` if the head is no longer `expected`
    pub fn write_guarded(
        &self,
        id: &ItemId,
        expected: &Fingerprint,
        content: &str,
        message: &str,
        author: Option<&str>,
    ) -> Result<RevisionId> {
        let guard = ConflictGuard::new(self.store.clone());
        let revision = guard.check_and_write(&self.path_of(id)?, expected, content, message, &self.author(author))?;
        self.refresh_index(id);
        Ok(revision)
    }

    pub fn history(&self, id: &ItemId, limit: usize) -> Result<Vec<CommitInfo>> {
        self.store.history(&self.path_of(id)?, limit)
    }

    pub fn diff(&self, id: &ItemId, from: &str, to: &str) -> Result<DiffResult> {
        let from = RevisionRef::parse(from)?;
        let to = RevisionRef::parse(to)?;
        self.store.diff(&from, &to, &self.path_of(id)?)
    }

    /// Diff plus changed front matter keys
    pub fn compare(&self, id: &ItemId, from: &str, to: &str) -> Result<Comparison> {
        let path = self.path_of(id)?;
        let before = self.store.read(&path, Some(&RevisionRef::parse(from)?))?;
        let after = self.store.read(&path, Some(&RevisionRef::parse(to)?))?;

        let metadata_changes = FrontMatter::parse(&before).changed_keys(&FrontMatter::parse(&after));
        Ok(Comparison {
            diff: crate::store::diff_text(&before, &after, from, to),
            metadata_changes,
        })
    }

    pub fn fingerprint(&self, id: &ItemId, at: Option<&str>) -> Result<Fingerprint> {
        let at = Self::parse_ref(at)?;
        self.store.fingerprint(&self.path_of(id)?, Some(&at))
    }

    // --- Drafts ---

    pub fn save_draft(
        &self,
        id: &ItemId,
        owner: &str,
        session_id: &str,
        content: &str,
        message: &str,
    ) -> Result<DraftSaved> {
        self.workflow.save_draft(id, owner, session_id, content, message)
    }

    pub fn list_drafts(&self, id: &ItemId) -> Result<Vec<DraftPointer>> {
        self.drafts().list(id)
    }

    pub fn discard_draft(&self, id: &ItemId, owner: &str, session_id: &str) -> Result<DraftPointer> {
        self.drafts().discard(&DraftKey::new(id.clone(), owner, session_id))
    }

    /// Collect drafts idle longer than the configured threshold
    pub fn gc_drafts(&self) -> Result<Vec<DraftKey>> {
        self.drafts().gc(self.config.abandon_after())
    }

    // --- Releases ---

    pub fn publish(&self, id: &ItemId, request: PublishRequest) -> Result<Release> {
        let release = self.workflow.publish(id, request)?;
        self.refresh_index(id);
        Ok(release)
    }

    /// A publish request prefilled with configured defaults
    pub fn publish_request(&self, base: RevisionRef, author: Option<&str>) -> PublishRequest {
        PublishRequest::new(base, self.author(author)).channel(&self.config.release.default_channel)
    }

    pub fn rollback(
        &self,
        id: &ItemId,
        to_version: &ReleaseVersion,
        notes: Option<&str>,
        author: Option<&str>,
    ) -> Result<Release> {
        let author = author
            .map(str::to_string)
            .unwrap_or_else(|| self.config.release.bot_author.clone());
        let release = self.workflow.rollback(
            id,
            to_version,
            &self.config.release.default_channel,
            notes,
            &author,
        )?;
        self.refresh_index(id);
        Ok(release)
    }

    pub fn releases(&self, id: &ItemId, prefix: Option<&str>) -> Result<Vec<Release>> {
        self.tags().list_releases(id, prefix)
    }

    pub fn timeline(&self, id: &ItemId, include_drafts: bool, limit: usize) -> Result<Vec<TimelineEvent>> {
        self.workflow.timeline(id, include_drafts, limit)
    }

    pub fn resolve_content(&self, id: &ItemId, selector: &str) -> Result<ResolvedContent> {
        self.workflow.resolve_content(id, selector)
    }

    // --- Index ---

    pub fn search(&self, query: &SearchQuery) -> Result<SearchPage> {
        self.index.search(query)
    }

    /// Recompute one item's index row from the store
    pub fn sync_index(&self, id: &ItemId) -> Result<()> {
        match self.store.index_entry(id) {
            Ok(entry) => self.index.upsert(entry),
            Err(e) if e.is_not_found() => {
                warn!(item = %id, "item vanished before index sync");
                self.index.remove(id).map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    /// Sync after a committed mutation; failures leave the row stale
    fn refresh_index(&self, id: &ItemId) {
        if let Err(e) = self.sync_index(id) {
            warn!(item = %id, error = %e, "search index not updated");
        }
    }

    pub fn rebuild(&self) -> Result<RebuildReport> {
        self.index.rebuild(self.store.as_ref())
    }

    pub fn index_status(&self) -> Result<IndexStatus> {
        self.index.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VaultError;
    use crate::item::ItemKind;
    use tempfile::tempdir;

    fn vault() -> Vault {
        Vault::in_memory(VaultConfig::default())
    }

    #[test]
    fn test_create_syncs_index() {
        let vault = vault();
        let (item, rev) = vault
            .create_item(
                NewItem::new(ItemKind::prompt(), "greeting", "Greeting").with_labels(["email"]),
                "hello",
                Some("ana"),
            )
            .unwrap();

        assert_eq!(rev, RevisionId::new(1));
        let entry = vault.index().get_by_id(&item.id).unwrap().unwrap();
        assert_eq!(entry.author, "ana");
        assert_eq!(entry.current_revision_ref, "r1");
        assert_eq!(entry.content_fingerprint, Fingerprint::of("hello"));
    }

    #[test]
    fn test_chat_provider_is_searchable() {
        let vault = vault();
        let kind = ItemKind::Chat {
            provider: Some("openai".to_string()),
            model: None,
            conversation_id: None,
            turn_count: 0,
        };
        let (chat, _) = vault
            .create_item(NewItem::new(kind, "support-thread", "Support thread"), "{}", Some("ana"))
            .unwrap();
        vault
            .create_item(NewItem::new(ItemKind::chat(), "other-thread", "Other"), "{}", Some("ana"))
            .unwrap();

        let page = vault.search(&SearchQuery::new().provider("openai")).unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id, chat.id);
        assert_eq!(page.items[0].provider.as_deref(), Some("openai"));

        let page = vault.search(&SearchQuery::new().query("support")).unwrap();
        assert_eq!(page.items.len(), 1);
    }

    #[test]
    fn test_author_falls_back_to_bot() {
        let vault = vault();
        let (item, _) = vault
            .create_item(NewItem::new(ItemKind::prompt(), "a", "A"), "x", None)
            .unwrap();
        assert_eq!(item.author, "vault-bot");
    }

    #[test]
    fn test_update_and_delete() {
        let vault = vault();
        let (item, _) = vault
            .create_item(NewItem::new(ItemKind::prompt(), "greeting", "Greeting"), "hello", Some("ana"))
            .unwrap();

        let patch = ItemPatch {
            title: Some("Welcome".to_string()),
            ..ItemPatch::default()
        };
        let updated = vault.update_item(&item.id, patch).unwrap();
        assert_eq!(updated.title, "Welcome");
        assert_eq!(vault.index().get_by_id(&item.id).unwrap().unwrap().title, "Welcome");

        vault.delete_item(&item.id).unwrap();
        assert!(vault.index().get_by_id(&item.id).unwrap().is_none());
        assert!(vault.read(&item.id, None).unwrap_err().is_not_found());
    }

    #[test]
    fn test_compare_reports_metadata_keys() {
        let vault = vault();
        let (item, r1) = vault
            .create_item(
                NewItem::new(ItemKind::prompt(), "greeting", "Greeting"),
                "---\ntype: prompt\n---\nhi\n",
                Some("ana"),
            )
            .unwrap();
        let r2 = vault
            .write(&item.id, "---\ntype: prompt\nproject: p\n---\nhello\n", "edit", Some("ana"))
            .unwrap();

        let cmp = vault
            .compare(&item.id, &r1.to_string(), &r2.to_string())
            .unwrap();
        assert_eq!(cmp.metadata_changes, vec!["project".to_string()]);
        assert_eq!(cmp.diff.additions, 2);
        assert_eq!(cmp.diff.deletions, 1);
    }

    #[test]
    fn test_guarded_write_through_facade() {
        let vault = vault();
        let (item, _) = vault
            .create_item(NewItem::new(ItemKind::prompt(), "greeting", "Greeting"), "C1", Some("ana"))
            .unwrap();
        let seen = vault.fingerprint(&item.id, None).unwrap();

        vault.write(&item.id, "C2", "edit", Some("ben")).unwrap();
        let err = vault
            .write_guarded(&item.id, &seen, "C3", "edit", Some("ana"))
            .unwrap_err();
        assert!(matches!(err, VaultError::Conflict { .. }));
    }

    /// Holds the rebuild lock for a while before listing items
    struct SlowSource<'a> {
        store: &'a RevisionStore,
        delay: std::time::Duration,
    }

    impl IndexSource for SlowSource<'_> {
        fn item_ids(&self) -> Result<Vec<ItemId>> {
            std::thread::sleep(self.delay);
            self.store.item_ids()
        }

        fn index_entry(&self, id: &ItemId) -> Result<crate::index::IndexEntry> {
            self.store.index_entry(id)
        }
    }

    #[test]
    fn test_write_succeeds_while_rebuild_holds_index() {
        let mut config = VaultConfig::default();
        config.index.lock_timeout_ms = 50;
        let vault = Vault::in_memory(config);
        let (item, _) = vault
            .create_item(NewItem::new(ItemKind::prompt(), "greeting", "Greeting"), "C1", Some("ana"))
            .unwrap();

        let source = SlowSource {
            store: vault.store().as_ref(),
            delay: std::time::Duration::from_millis(400),
        };
        std::thread::scope(|scope| {
            let rebuild = scope.spawn(|| vault.index().rebuild(&source));
            std::thread::sleep(std::time::Duration::from_millis(100));

            let revision = vault.write(&item.id, "C2", "edit", Some("ana")).unwrap();
            assert_eq!(revision, RevisionId::new(2));
            assert!(rebuild.join().unwrap().is_ok());
        });

        assert_eq!(vault.read(&item.id, None).unwrap(), "C2");
        assert_eq!(vault.history(&item.id, 10).unwrap().len(), 2);
        vault.sync_index(&item.id).unwrap();
        let entry = vault.index().get_by_id(&item.id).unwrap().unwrap();
        assert_eq!(entry.current_revision_ref, "r2");
    }

    #[test]
    fn test_reopen_populates_missing_index() {
        let dir = tempdir().unwrap();
        let mut config = VaultConfig::at(dir.path());
        config.index.persist = false;

        let id = {
            let vault = Vault::open(config.clone()).unwrap();
            let (item, _) = vault
                .create_item(NewItem::new(ItemKind::prompt(), "greeting", "Greeting"), "C1", Some("ana"))
                .unwrap();
            vault.close();
            item.id
        };

        let vault = Vault::open(config).unwrap();
        assert!(vault.index().get_by_id(&id).unwrap().is_some());
        assert_eq!(vault.read(&id, Some("HEAD")).unwrap(), "C1");
    }
}
