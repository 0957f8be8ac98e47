//! Search index
//!
//! A denormalized, rebuildable view of item metadata. The revision store is
//! the source of truth; anything here can be thrown away and recomputed with
//! [`SearchIndex::rebuild`].
//!
//! Rows are kept ordered by `(updated_at, id)` and served newest first with
//! keyset pagination, so pages stay stable while items are added.

mod cursor;
mod lock;

pub use cursor::Cursor;
pub use lock::{IndexLock, IndexWriteGuard, LockHolder};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::checksum::Fingerprint;
use crate::error::Result;
use crate::item::{Item, ItemId, ItemType};
use crate::store::{LoadError, Revision, RevisionRef};
use crate::version::ReleaseVersion;

/// Name reported in lock errors
pub const INDEX_LOCK: &str = "search-index";

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 200;

/// One searchable row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: ItemId,
    pub item_type: ItemType,
    pub title: String,
    pub description: String,
    pub slug: String,
    pub labels: BTreeSet<String>,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub current_revision_ref: String,
    pub content_fingerprint: Fingerprint,
    pub revision_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_release: Option<ReleaseVersion>,
    /// Chats only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl IndexEntry {
    /// The only way rows are produced, for both incremental sync and rebuild
    pub fn build(
        item: &Item,
        head: &Revision,
        revision_count: usize,
        latest_release: Option<ReleaseVersion>,
    ) -> Self {
        Self {
            id: item.id.clone(),
            item_type: item.item_type(),
            title: item.title.clone(),
            description: item.description.clone(),
            slug: item.slug.clone(),
            labels: item.labels.clone(),
            author: item.author.clone(),
            created_at: item.created_at,
            updated_at: item.updated_at,
            current_revision_ref: RevisionRef::Revision(head.revision_id).to_string(),
            content_fingerprint: head.fingerprint.clone(),
            revision_count,
            latest_release,
            provider: item.kind.provider().map(str::to_string),
        }
    }

    fn key(&self) -> (DateTime<Utc>, ItemId) {
        (self.updated_at, self.id.clone())
    }

    fn matches(&self, query: &SearchQuery) -> bool {
        query.item_type.map_or(true, |t| t == self.item_type)
            && query.slug.as_deref().map_or(true, |s| s == self.slug)
            && query.author.as_deref().map_or(true, |a| a == self.author)
            && query
                .provider
                .as_deref()
                .map_or(true, |p| self.provider.as_deref() == Some(p))
            && query.labels.is_subset(&self.labels)
            && query.text().map_or(true, |text| self.contains_text(&text))
    }

    /// Case-insensitive substring match on title, description or slug
    fn contains_text(&self, needle: &str) -> bool {
        [&self.title, &self.description, &self.slug]
            .iter()
            .any(|field| field.to_lowercase().contains(needle))
    }
}

/// Where a rebuild reads items from
pub trait IndexSource {
    fn item_ids(&self) -> Result<Vec<ItemId>>;

    fn index_entry(&self, id: &ItemId) -> Result<IndexEntry>;

    /// Items the source knows exist but cannot read
    fn broken_items(&self) -> Vec<LoadError> {
        Vec::new()
    }
}

/// Conjunctive search filters plus paging
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    pub item_type: Option<ItemType>,
    /// Matching rows carry every one of these labels
    pub labels: BTreeSet<String>,
    pub slug: Option<String>,
    pub author: Option<String>,
    pub provider: Option<String>,
    /// Free text matched against title, description and slug
    pub query: Option<String>,
    /// 0 means [`DEFAULT_PAGE_SIZE`]
    pub limit: usize,
    pub cursor: Option<String>,
}

impl SearchQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn item_type(mut self, item_type: ItemType) -> Self {
        self.item_type = Some(item_type);
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.labels.insert(label.into());
        self
    }

    pub fn slug(mut self, slug: impl Into<String>) -> Self {
        self.slug = Some(slug.into());
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn query(mut self, text: impl Into<String>) -> Self {
        self.query = Some(text.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn after(mut self, cursor: Option<String>) -> Self {
        self.cursor = cursor;
        self
    }

    /// Lowercased text filter; blank means none
    fn text(&self) -> Option<String> {
        self.query
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
    }

    fn page_size(&self) -> usize {
        match self.limit {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchPage {
    pub items: Vec<IndexEntry>,
    /// Present only when more matching rows follow
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildError {
    pub item: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildReport {
    pub counts: BTreeMap<ItemType, usize>,
    pub errors: Vec<RebuildError>,
}

impl RebuildReport {
    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStatus {
    pub counts: BTreeMap<ItemType, usize>,
    pub total: usize,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct IndexData {
    rows: BTreeMap<(DateTime<Utc>, ItemId), IndexEntry>,
    keys: HashMap<ItemId, DateTime<Utc>>,
    last_updated: Option<DateTime<Utc>>,
}

impl IndexData {
    fn insert(&mut self, entry: IndexEntry) {
        self.take(&entry.id);
        self.keys.insert(entry.id.clone(), entry.updated_at);
        self.rows.insert(entry.key(), entry);
    }

    fn take(&mut self, id: &ItemId) -> Option<IndexEntry> {
        let updated_at = self.keys.remove(id)?;
        self.rows.remove(&(updated_at, id.clone()))
    }

    fn get(&self, id: &ItemId) -> Option<&IndexEntry> {
        let updated_at = self.keys.get(id)?;
        self.rows.get(&(*updated_at, id.clone()))
    }

    fn counts(&self) -> BTreeMap<ItemType, usize> {
        let mut counts: BTreeMap<ItemType, usize> =
            ItemType::ALL.into_iter().map(|t| (t, 0)).collect();
        for entry in self.rows.values() {
            *counts.entry(entry.item_type).or_default() += 1;
        }
        counts
    }
}

/// The search index service
pub struct SearchIndex {
    data: IndexLock<IndexData>,
    file: Option<PathBuf>,
}

impl SearchIndex {
    /// An index held only in memory
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            data: IndexLock::new(INDEX_LOCK, IndexData::default(), lock_timeout),
            file: None,
        }
    }

    /// An index persisted to `file`, loading existing rows if present
    pub fn open(file: impl AsRef<Path>, lock_timeout: Duration) -> Result<Self> {
        let file = file.as_ref().to_path_buf();
        let mut data = IndexData::default();

        if file.exists() {
            let content = fs::read_to_string(&file)?;
            let entries: Vec<IndexEntry> = serde_json::from_str(&content)?;
            for entry in entries {
                data.insert(entry);
            }
            data.last_updated = fs::metadata(&file)?.modified().ok().map(DateTime::<Utc>::from);
            debug!(file = %file.display(), rows = data.rows.len(), "loaded search index");
        }

        Ok(Self {
            data: IndexLock::new(INDEX_LOCK, data, lock_timeout),
            file: Some(file),
        })
    }

    pub fn upsert(&self, entry: IndexEntry) -> Result<()> {
        let mut data = self.data.write(LockHolder::Writer)?;
        data.insert(entry);
        self.touch(&mut data)
    }

    pub fn remove(&self, id: &ItemId) -> Result<Option<IndexEntry>> {
        let mut data = self.data.write(LockHolder::Writer)?;
        let removed = data.take(id);
        if removed.is_some() {
            self.touch(&mut data)?;
        }
        Ok(removed)
    }

    pub fn get_by_id(&self, id: &ItemId) -> Result<Option<IndexEntry>> {
        Ok(self.data.read()?.get(id).cloned())
    }

    /// Rows matching every filter, newest first, one page at a time
    pub fn search(&self, query: &SearchQuery) -> Result<SearchPage> {
        let after = query.cursor.as_deref().map(Cursor::decode).transpose()?;
        let page_size = query.page_size();
        let data = self.data.read()?;

        let rows: Box<dyn Iterator<Item = &IndexEntry> + '_> = match &after {
            Some(cursor) => Box::new(data.rows.range(..cursor.key()).rev().map(|(_, e)| e)),
            None => Box::new(data.rows.values().rev()),
        };

        let mut items: Vec<IndexEntry> = rows
            .filter(|entry| entry.matches(query))
            .take(page_size + 1)
            .cloned()
            .collect();

        let next_cursor = if items.len() > page_size {
            items.truncate(page_size);
            items
                .last()
                .map(|last| Cursor::new(last.updated_at, last.id.clone()).encode())
                .transpose()?
        } else {
            None
        };

        Ok(SearchPage { items, next_cursor })
    }

    /// Replace every row with what `source` reports
    #[instrument(skip(self, source))]
    pub fn rebuild(&self, source: &dyn IndexSource) -> Result<RebuildReport> {
        let mut data = self.data.write(LockHolder::Rebuild)?;
        let mut fresh = IndexData::default();
        let mut report = RebuildReport::default();

        for id in source.item_ids()? {
            match source.index_entry(&id) {
                Ok(entry) => fresh.insert(entry),
                Err(e) => {
                    warn!(item = %id, error = %e, "skipping item during rebuild");
                    report.errors.push(RebuildError {
                        item: id.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        for broken in source.broken_items() {
            report.errors.push(RebuildError {
                item: broken.path,
                reason: broken.reason,
            });
        }

        report.counts = fresh.counts();
        *data = fresh;
        self.touch(&mut data)?;

        info!(rows = report.total(), errors = report.errors.len(), "rebuilt search index");
        Ok(report)
    }

    pub fn status(&self) -> Result<IndexStatus> {
        let data = self.data.read()?;
        Ok(IndexStatus {
            counts: data.counts(),
            total: data.rows.len(),
            last_updated: data.last_updated,
        })
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.data.read()?.rows.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn touch(&self, data: &mut IndexData) -> Result<()> {
        data.last_updated = Some(Utc::now());
        if let Some(file) = &self.file {
            let rows: Vec<&IndexEntry> = data.rows.values().collect();
            if let Some(parent) = file.parent() {
                fs::create_dir_all(parent)?;
            }
            crate::store::write_json_atomic(file, &rows)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VaultError;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn entry(id: &str, item_type: ItemType, minute: u32, labels: &[&str]) -> IndexEntry {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 12, minute, 0).unwrap();
        IndexEntry {
            id: ItemId::parse(id).unwrap(),
            item_type,
            title: id.to_string(),
            description: String::new(),
            slug: id.to_lowercase(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            author: "ana".to_string(),
            created_at: at,
            updated_at: at,
            current_revision_ref: "r1".to_string(),
            content_fingerprint: Fingerprint::of(id),
            revision_count: 1,
            latest_release: None,
            provider: None,
        }
    }

    fn index() -> SearchIndex {
        SearchIndex::new(Duration::from_millis(50))
    }

    fn ids(page: &SearchPage) -> Vec<&str> {
        page.items.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn test_newest_first_with_id_tiebreak() {
        let index = index();
        index.upsert(entry("A", ItemType::Prompt, 1, &[])).unwrap();
        index.upsert(entry("B", ItemType::Prompt, 2, &[])).unwrap();
        index.upsert(entry("C", ItemType::Prompt, 2, &[])).unwrap();

        let page = index.search(&SearchQuery::new()).unwrap();
        assert_eq!(ids(&page), vec!["C", "B", "A"]);
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn test_upsert_moves_row() {
        let index = index();
        index.upsert(entry("A", ItemType::Prompt, 1, &[])).unwrap();
        index.upsert(entry("B", ItemType::Prompt, 2, &[])).unwrap();
        index.upsert(entry("A", ItemType::Prompt, 3, &[])).unwrap();

        assert_eq!(index.len().unwrap(), 2);
        assert_eq!(ids(&index.search(&SearchQuery::new()).unwrap()), vec!["A", "B"]);
    }

    #[test]
    fn test_keyset_pages() {
        let index = index();
        for (i, id) in ["A", "B", "C", "D", "E"].iter().enumerate() {
            index.upsert(entry(id, ItemType::Prompt, i as u32, &[])).unwrap();
        }

        let first = index.search(&SearchQuery::new().limit(2)).unwrap();
        assert_eq!(ids(&first), vec!["E", "D"]);

        let second = index
            .search(&SearchQuery::new().limit(2).after(first.next_cursor.clone()))
            .unwrap();
        assert_eq!(ids(&second), vec!["C", "B"]);

        let third = index
            .search(&SearchQuery::new().limit(2).after(second.next_cursor.clone()))
            .unwrap();
        assert_eq!(ids(&third), vec!["A"]);
        assert!(third.next_cursor.is_none());
    }

    #[test]
    fn test_exact_final_page_has_no_cursor() {
        let index = index();
        index.upsert(entry("A", ItemType::Prompt, 1, &[])).unwrap();
        index.upsert(entry("B", ItemType::Prompt, 2, &[])).unwrap();

        let page = index.search(&SearchQuery::new().limit(2)).unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn test_filters_are_conjunctive() {
        let index = index();
        index.upsert(entry("A", ItemType::Prompt, 1, &["x", "y"])).unwrap();
        index.upsert(entry("B", ItemType::Prompt, 2, &["x"])).unwrap();
        index.upsert(entry("C", ItemType::Template, 3, &["x", "y"])).unwrap();

        let page = index
            .search(&SearchQuery::new().item_type(ItemType::Prompt).label("x").label("y"))
            .unwrap();
        assert_eq!(ids(&page), vec!["A"]);

        let page = index.search(&SearchQuery::new().slug("b")).unwrap();
        assert_eq!(ids(&page), vec!["B"]);

        let page = index.search(&SearchQuery::new().author("ben")).unwrap();
        assert!(page.items.is_empty());
    }

    #[test]
    fn test_text_query_is_case_insensitive() {
        let index = index();
        let mut welcome = entry("A", ItemType::Prompt, 1, &[]);
        welcome.title = "Welcome Email".to_string();
        let mut onboarding = entry("B", ItemType::Prompt, 2, &[]);
        onboarding.description = "Sent after the welcome call".to_string();
        let mut other = entry("C", ItemType::Prompt, 3, &[]);
        other.slug = "invoice-reminder".to_string();
        for row in [welcome, onboarding, other] {
            index.upsert(row).unwrap();
        }

        let page = index.search(&SearchQuery::new().query("WELCOME")).unwrap();
        assert_eq!(ids(&page), vec!["B", "A"]);
        let page = index.search(&SearchQuery::new().query("voice-rem")).unwrap();
        assert_eq!(ids(&page), vec!["C"]);
        let page = index.search(&SearchQuery::new().query("  ")).unwrap();
        assert_eq!(page.items.len(), 3);
    }

    #[test]
    fn test_provider_filter_matches_chats() {
        let index = index();
        let mut openai = entry("A", ItemType::Chat, 1, &[]);
        openai.provider = Some("openai".to_string());
        let mut anthropic = entry("B", ItemType::Chat, 2, &[]);
        anthropic.provider = Some("anthropic".to_string());
        index.upsert(openai).unwrap();
        index.upsert(anthropic).unwrap();
        index.upsert(entry("C", ItemType::Prompt, 3, &[])).unwrap();

        let page = index.search(&SearchQuery::new().provider("openai")).unwrap();
        assert_eq!(ids(&page), vec!["A"]);
        let page = index
            .search(&SearchQuery::new().provider("anthropic").item_type(ItemType::Chat))
            .unwrap();
        assert_eq!(ids(&page), vec!["B"]);
    }

    #[test]
    fn test_bad_cursor() {
        let index = index();
        let err = index
            .search(&SearchQuery::new().after(Some("%%%".to_string())))
            .unwrap_err();
        assert!(matches!(err, VaultError::Validation(_)));
    }

    #[test]
    fn test_search_during_rebuild_is_locked() {
        let index = index();
        let _held = index.data.write(LockHolder::Rebuild).unwrap();
        match index.search(&SearchQuery::new()) {
            Err(VaultError::Locked { holder, .. }) => assert_eq!(holder, LockHolder::Rebuild),
            other => panic!("expected Locked, got {other:?}"),
        }
    }

    struct FixedSource(Vec<IndexEntry>);

    impl IndexSource for FixedSource {
        fn item_ids(&self) -> Result<Vec<ItemId>> {
            let mut ids: Vec<ItemId> = self.0.iter().map(|e| e.id.clone()).collect();
            ids.push(ItemId::parse("GONE").unwrap());
            Ok(ids)
        }

        fn index_entry(&self, id: &ItemId) -> Result<IndexEntry> {
            self.0
                .iter()
                .find(|e| &e.id == id)
                .cloned()
                .ok_or_else(|| VaultError::not_found("item", id.as_str()))
        }
    }

    #[test]
    fn test_rebuild_replaces_rows_and_collects_errors() {
        let index = index();
        index.upsert(entry("STALE", ItemType::Chat, 9, &[])).unwrap();

        let source = FixedSource(vec![
            entry("A", ItemType::Prompt, 1, &[]),
            entry("B", ItemType::Template, 2, &[]),
        ]);
        let report = index.rebuild(&source).unwrap();

        assert_eq!(report.counts[&ItemType::Prompt], 1);
        assert_eq!(report.counts[&ItemType::Template], 1);
        assert_eq!(report.counts[&ItemType::Chat], 0);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].item, "GONE");
        assert!(index.get_by_id(&ItemId::parse("STALE").unwrap()).unwrap().is_none());
        assert_eq!(index.status().unwrap().total, 2);
    }

    #[test]
    fn test_persisted_index_reloads() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("index.json");
        {
            let index = SearchIndex::open(&file, Duration::from_millis(50)).unwrap();
            index.upsert(entry("A", ItemType::Prompt, 1, &["x"])).unwrap();
            index.upsert(entry("B", ItemType::Chat, 2, &[])).unwrap();
            index.remove(&ItemId::parse("B").unwrap()).unwrap();
        }

        let index = SearchIndex::open(&file, Duration::from_millis(50)).unwrap();
        assert_eq!(index.len().unwrap(), 1);
        assert!(index.get_by_id(&ItemId::parse("A").unwrap()).unwrap().is_some());
        assert!(index.status().unwrap().last_updated.is_some());
    }
}
