//! Revision Store
//!
//! Append-only revision logs, one per item. Each revision is addressed by
//! `(item_id, sequence)`; the main head, draft heads and release tags are plain
//! pointers into the log, so resolving any of them is a map lookup.
//!
//! ## Layout
//!
//! ```text
//! items/
//! ├── prompts/
//! │   └── 01HX3.../
//! │       ├── item.json
//! │       ├── HEAD                      # "r3"
//! │       ├── revisions/
//! │       │   ├── 0000000001.json       # written once, never replaced
//! │       │   ├── 0000000002.json
//! │       │   └── 0000000003.json
//! │       ├── drafts/
//! │       │   └── ana.s1.json
//! │       └── releases/
//! │           └── v0.1.0.json
//! ├── templates/
//! └── chats/
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use similar::{Algorithm, ChangeTag, TextDiff};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::checksum::Fingerprint;
use crate::drafts::{validate_segment, DraftKey, DraftPointer};
use crate::error::{Result, VaultError};
use crate::index::{IndexEntry, IndexSource};
use crate::item::{Item, ItemId, ItemPath, ItemType};
use crate::tags::{parse_tag_name, Release};
use crate::version::{ReleaseVersion, VersionPolicy};

/// Lines of context in unified diffs
const DIFF_CONTEXT: usize = 3;

/// Position of a revision in its item's log, starting at 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RevisionId(u64);

impl RevisionId {
    pub fn new(seq: u64) -> Self {
        Self(seq)
    }

    pub fn seq(&self) -> u64 {
        self.0
    }

    /// Parse `r12` or `12`
    pub fn parse(s: &str) -> Result<Self> {
        let digits = s.strip_prefix('r').unwrap_or(s);
        match digits.parse::<u64>() {
            Ok(seq) if seq > 0 => Ok(Self(seq)),
            _ => Err(VaultError::validation(format!("Invalid revision id: {:?}", s))),
        }
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

impl TryFrom<String> for RevisionId {
    type Error = VaultError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<RevisionId> for String {
    fn from(id: RevisionId) -> Self {
        id.to_string()
    }
}

/// One committed, immutable version of an item's content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub item_id: ItemId,
    pub revision_id: RevisionId,
    /// Previous revision in the same namespace
    pub parent: Option<RevisionId>,
    pub content: String,
    pub author: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub fingerprint: Fingerprint,
}

/// History entry as returned by [`RevisionStore::history`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub revision_id: RevisionId,
    pub author: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub fingerprint: Fingerprint,
}

impl From<&Revision> for CommitInfo {
    fn from(rev: &Revision) -> Self {
        Self {
            revision_id: rev.revision_id,
            author: rev.author.clone(),
            message: rev.message.clone(),
            timestamp: rev.created_at,
            fingerprint: rev.fingerprint.clone(),
        }
    }
}

/// Line diff between two resolved revisions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffResult {
    pub from_ref: String,
    pub to_ref: String,
    pub additions: usize,
    pub deletions: usize,
    pub unified_text: String,
}

/// Where a write lands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Namespace {
    Main,
    Draft { owner: String, session_id: String },
}

impl Namespace {
    pub fn draft(owner: impl Into<String>, session_id: impl Into<String>) -> Self {
        Namespace::Draft {
            owner: owner.into(),
            session_id: session_id.into(),
        }
    }
}

/// A symbolic or concrete pointer to a revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevisionRef {
    Head,
    Revision(RevisionId),
    Draft { owner: String, session_id: String },
    Release {
        item: Option<(ItemType, ItemId)>,
        version: ReleaseVersion,
    },
}

impl RevisionRef {
    pub fn draft_ref(owner: impl Into<String>, session_id: impl Into<String>) -> Self {
        RevisionRef::Draft {
            owner: owner.into(),
            session_id: session_id.into(),
        }
    }

    /// Parse `HEAD`, `r<N>`, `draft/<owner>/<session>`, `v<semver>` or a full tag name
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("head") {
            return Ok(RevisionRef::Head);
        }
        if let Some(rest) = s.strip_prefix("draft/") {
            let (owner, session_id) = rest
                .split_once('/')
                .ok_or_else(|| VaultError::validation(format!("Invalid draft ref: {:?}", s)))?;
            validate_segment("owner", owner)?;
            validate_segment("session_id", session_id)?;
            return Ok(RevisionRef::Draft {
                owner: owner.to_string(),
                session_id: session_id.to_string(),
            });
        }
        if s.starts_with('r') && s[1..].chars().all(|c| c.is_ascii_digit()) {
            return RevisionId::parse(s).map(RevisionRef::Revision);
        }
        if let Some((item_type, id, version)) = parse_tag_name(s) {
            return Ok(RevisionRef::Release {
                item: Some((item_type, id)),
                version,
            });
        }
        ReleaseVersion::parse(s)
            .map(|version| RevisionRef::Release {
                item: None,
                version,
            })
            .map_err(|_| VaultError::validation(format!("Unrecognized ref: {:?}", s)))
    }
}

impl FromStr for RevisionRef {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for RevisionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RevisionRef::Head => f.write_str("HEAD"),
            RevisionRef::Revision(id) => write!(f, "{}", id),
            RevisionRef::Draft { owner, session_id } => write!(f, "draft/{}/{}", owner, session_id),
            RevisionRef::Release { item: Some((t, id)), version } => write!(f, "{}/{}/{}", t, id, version),
            RevisionRef::Release { item: None, version } => write!(f, "{}", version),
        }
    }
}

/// An item directory that could not be loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadError {
    pub path: String,
    pub reason: String,
}

struct ItemLog {
    item: Item,
    revisions: Vec<Revision>,
    head: Option<RevisionId>,
    drafts: BTreeMap<(String, String), DraftPointer>,
    releases: BTreeMap<ReleaseVersion, Release>,
}

impl ItemLog {
    fn new(item: Item) -> Self {
        Self {
            item,
            revisions: Vec::new(),
            head: None,
            drafts: BTreeMap::new(),
            releases: BTreeMap::new(),
        }
    }

    fn revision(&self, id: RevisionId) -> Option<&Revision> {
        let idx = id.seq().checked_sub(1)?;
        self.revisions.get(idx as usize)
    }

    fn next_id(&self) -> RevisionId {
        RevisionId::new(self.revisions.len() as u64 + 1)
    }

    fn draft(&self, owner: &str, session_id: &str) -> Result<&DraftPointer> {
        self.drafts
            .get(&(owner.to_string(), session_id.to_string()))
            .ok_or_else(|| {
                VaultError::not_found("draft", format!("{}/draft/{}/{}", self.item.id, owner, session_id))
            })
    }

    fn namespace_head(&self, ns: &Namespace) -> Result<Option<RevisionId>> {
        match ns {
            Namespace::Main => Ok(self.head),
            Namespace::Draft { owner, session_id } => {
                let ptr = self.draft(owner, session_id)?;
                Ok(ptr.head.or(ptr.base))
            }
        }
    }

    fn resolve(&self, at: &RevisionRef) -> Result<&Revision> {
        let missing = || VaultError::not_found("ref", format!("{}@{}", self.item.path(), at));
        let id = match at {
            RevisionRef::Head => self.head.ok_or_else(missing)?,
            RevisionRef::Revision(id) => *id,
            RevisionRef::Draft { owner, session_id } => {
                let ptr = self.draft(owner, session_id)?;
                ptr.head.or(ptr.base).ok_or_else(missing)?
            }
            RevisionRef::Release { item, version } => {
                if let Some((item_type, id)) = item {
                    if *item_type != self.item.item_type() || *id != self.item.id {
                        return Err(missing());
                    }
                }
                self.releases.get(version).ok_or_else(missing)?.revision_id
            }
        };
        self.revision(id).ok_or_else(missing)
    }

    /// Main history, newest first
    fn main_chain(&self) -> impl Iterator<Item = &Revision> + '_ {
        let mut next = self.head;
        std::iter::from_fn(move || {
            let rev = self.revision(next?)?;
            next = rev.parent;
            Some(rev)
        })
    }
}

#[derive(Default)]
struct StoreState {
    items: HashMap<ItemId, ItemLog>,
    slugs: HashMap<(ItemType, String), ItemId>,
    load_errors: Vec<LoadError>,
}

impl StoreState {
    fn log(&self, id: &ItemId) -> Result<&ItemLog> {
        self.items.get(id).ok_or_else(|| VaultError::not_found("item", id.as_str()))
    }

    fn log_mut(&mut self, id: &ItemId) -> Result<&mut ItemLog> {
        self.items
            .get_mut(id)
            .ok_or_else(|| VaultError::not_found("item", id.as_str()))
    }

    fn log_at(&self, path: &str) -> Result<&ItemLog> {
        let path = ItemPath::parse(path)?;
        let log = self.items.get(&path.id).ok_or_else(|| VaultError::not_found("path", path.to_string()))?;
        if log.item.item_type() != path.item_type {
            return Err(VaultError::not_found("path", path.to_string()));
        }
        Ok(log)
    }

    fn log_at_mut(&mut self, path: &str) -> Result<&mut ItemLog> {
        let path = ItemPath::parse(path)?;
        let log = self
            .items
            .get_mut(&path.id)
            .ok_or_else(|| VaultError::not_found("path", path.to_string()))?;
        if log.item.item_type() != path.item_type {
            return Err(VaultError::not_found("path", path.to_string()));
        }
        Ok(log)
    }

    fn claim_slug(&mut self, item: &Item) -> Result<()> {
        let key = (item.item_type(), item.slug.clone());
        match self.slugs.get(&key) {
            Some(owner) if *owner != item.id => Err(VaultError::SlugTaken {
                item_type: item.item_type().to_string(),
                slug: item.slug.clone(),
            }),
            _ => {
                self.slugs.insert(key, item.id.clone());
                Ok(())
            }
        }
    }
}

/// The revision store service
pub struct RevisionStore {
    root: Option<PathBuf>,
    state: RwLock<StoreState>,
    open: AtomicBool,
}

impl RevisionStore {
    /// Open an existing store or create a new one under `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        fs::create_dir_all(root.join("items"))?;

        let state = load_state(&root)?;
        info!(
            root = %root.display(),
            items = state.items.len(),
            broken = state.load_errors.len(),
            "opened revision store"
        );

        Ok(Self {
            root: Some(root),
            state: RwLock::new(state),
            open: AtomicBool::new(true),
        })
    }

    /// A store that keeps everything in memory
    pub fn in_memory() -> Self {
        Self {
            root: None,
            state: RwLock::new(StoreState::default()),
            open: AtomicBool::new(true),
        }
    }

    /// Get the root path of the store, if persistent
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Refuse further operations. Every write is already durable.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            info!("closed revision store");
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(VaultError::Closed)
        }
    }

    /// Item directories skipped while opening
    pub fn load_errors(&self) -> Vec<LoadError> {
        self.state.read().load_errors.clone()
    }

    // --- Items ---

    /// Register a new item together with its first revision
    #[instrument(skip(self, item, content), fields(item = %item.path()))]
    pub fn create_item(&self, item: Item, content: &str, message: &str) -> Result<RevisionId> {
        self.ensure_open()?;
        item.validate()?;
        let mut state = self.state.write();

        if state.items.contains_key(&item.id) {
            return Err(VaultError::validation(format!("Item already exists: {}", item.id)));
        }
        state.claim_slug(&item)?;

        if let Some(root) = &self.root {
            let dir = item_dir(root, &item.path());
            fs::create_dir_all(dir.join("revisions"))?;
            write_json_atomic(&dir.join("item.json"), &item)?;
        }

        let author = item.author.clone();
        let mut log = ItemLog::new(item);
        let id = commit(self.root.as_deref(), &mut log, &Namespace::Main, content, message, &author, None)?;
        state.items.insert(log.item.id.clone(), log);

        info!(revision = %id, "created item");
        Ok(id)
    }

    pub fn get_item(&self, id: &ItemId) -> Result<Item> {
        self.ensure_open()?;
        Ok(self.state.read().log(id)?.item.clone())
    }

    pub fn item_at(&self, path: &str) -> Result<Item> {
        self.ensure_open()?;
        Ok(self.state.read().log_at(path)?.item.clone())
    }

    pub fn find_by_slug(&self, item_type: ItemType, slug: &str) -> Option<Item> {
        let state = self.state.read();
        let id = state.slugs.get(&(item_type, slug.to_string()))?;
        state.items.get(id).map(|log| log.item.clone())
    }

    /// All items, optionally of one type, ordered by id
    pub fn list_items(&self, item_type: Option<ItemType>) -> Result<Vec<Item>> {
        self.ensure_open()?;
        let state = self.state.read();
        let mut items: Vec<Item> = state
            .items
            .values()
            .map(|log| log.item.clone())
            .filter(|item| item_type.map_or(true, |t| item.item_type() == t))
            .collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(items)
    }

    /// Replace an item's metadata
    #[instrument(skip(self, item), fields(item = %item.path()))]
    pub fn update_item(&self, item: Item) -> Result<()> {
        self.ensure_open()?;
        item.validate()?;
        let mut state = self.state.write();

        let previous = state.log(&item.id)?.item.clone();
        if previous.item_type() != item.item_type() {
            return Err(VaultError::validation("item type is immutable"));
        }
        if previous.slug != item.slug {
            state.claim_slug(&item)?;
            state.slugs.remove(&(previous.item_type(), previous.slug.clone()));
        }

        if let Some(root) = &self.root {
            write_json_atomic(&item_dir(root, &item.path()).join("item.json"), &item)?;
        }
        let id = item.id.clone();
        state.log_mut(&id)?.item = item;
        debug!("updated item metadata");
        Ok(())
    }

    /// Remove an item with its whole log
    #[instrument(skip(self))]
    pub fn delete_item(&self, id: &ItemId) -> Result<Item> {
        self.ensure_open()?;
        let mut state = self.state.write();
        let log = state
            .items
            .remove(id)
            .ok_or_else(|| VaultError::not_found("item", id.as_str()))?;
        state.slugs.remove(&(log.item.item_type(), log.item.slug.clone()));

        if let Some(root) = &self.root {
            let dir = item_dir(root, &log.item.path());
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(revisions = log.revisions.len(), "deleted item");
        Ok(log.item)
    }

    // --- Content ---

    /// Content of the revision `at` resolves to (head when omitted)
    pub fn read(&self, path: &str, at: Option<&RevisionRef>) -> Result<String> {
        Ok(self.resolve(path, at)?.content)
    }

    /// The full revision `at` resolves to (head when omitted)
    pub fn resolve(&self, path: &str, at: Option<&RevisionRef>) -> Result<Revision> {
        self.ensure_open()?;
        let state = self.state.read();
        let log = state.log_at(path)?;
        Ok(log.resolve(at.unwrap_or(&RevisionRef::Head))?.clone())
    }

    pub fn head(&self, path: &str) -> Result<Option<RevisionId>> {
        self.ensure_open()?;
        Ok(self.state.read().log_at(path)?.head)
    }

    /// Commit `content` onto main history
    pub fn write(&self, path: &str, content: &str, message: &str, author: &str) -> Result<RevisionId> {
        self.write_to(path, &Namespace::Main, content, message, author)
    }

    /// Commit `content` on top of the head of `ns`
    #[instrument(skip(self, content), fields(bytes = content.len()))]
    pub fn write_to(
        &self,
        path: &str,
        ns: &Namespace,
        content: &str,
        message: &str,
        author: &str,
    ) -> Result<RevisionId> {
        self.ensure_open()?;
        let mut state = self.state.write();
        let log = state.log_at_mut(path)?;
        commit(self.root.as_deref(), log, ns, content, message, author, None)
    }

    /// Commit onto main history only if the head still has `expected` fingerprint.
    ///
    /// The comparison and the append happen under one store lock.
    #[instrument(skip(self, content, expected), fields(expected = %expected.short()))]
    pub fn write_if(
        &self,
        path: &str,
        expected: &Fingerprint,
        content: &str,
        message: &str,
        author: &str,
    ) -> Result<RevisionId> {
        self.ensure_open()?;
        let mut state = self.state.write();
        let log = state.log_at_mut(path)?;
        commit(self.root.as_deref(), log, &Namespace::Main, content, message, author, Some(expected))
    }

    /// Main history, most recent first, at most `limit` entries
    pub fn history(&self, path: &str, limit: usize) -> Result<Vec<CommitInfo>> {
        self.ensure_open()?;
        let state = self.state.read();
        let log = state.log_at(path)?;
        Ok(log.main_chain().take(limit).map(CommitInfo::from).collect())
    }

    /// Number of revisions on main history
    pub fn history_len(&self, path: &str) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.state.read().log_at(path)?.main_chain().count())
    }

    /// Line diff from `ref_a` (before) to `ref_b` (after)
    pub fn diff(&self, ref_a: &RevisionRef, ref_b: &RevisionRef, path: &str) -> Result<DiffResult> {
        let before = self.read(path, Some(ref_a))?;
        let after = self.read(path, Some(ref_b))?;
        Ok(diff_text(&before, &after, &ref_a.to_string(), &ref_b.to_string()))
    }

    /// Fingerprint of the revision `at` resolves to (head when omitted)
    pub fn fingerprint(&self, path: &str, at: Option<&RevisionRef>) -> Result<Fingerprint> {
        Ok(self.resolve(path, at)?.fingerprint)
    }

    // --- Drafts ---

    pub(crate) fn open_draft(&self, key: &DraftKey) -> Result<DraftPointer> {
        self.ensure_open()?;
        let mut state = self.state.write();
        let log = state.log_mut(&key.item_id)?;
        let map_key = (key.owner.clone(), key.session_id.clone());

        if let Some(existing) = log.drafts.get(&map_key) {
            return Ok(existing.clone());
        }

        let pointer = DraftPointer::new(key, log.head);
        if let Some(root) = &self.root {
            persist_draft(root, &log.item.path(), &pointer)?;
        }
        log.drafts.insert(map_key, pointer.clone());
        debug!(draft = %key, base = ?pointer.base, "opened draft");
        Ok(pointer)
    }

    pub(crate) fn draft(&self, key: &DraftKey) -> Result<DraftPointer> {
        self.ensure_open()?;
        let state = self.state.read();
        Ok(state.log(&key.item_id)?.draft(&key.owner, &key.session_id)?.clone())
    }

    pub(crate) fn drafts(&self, item_id: &ItemId) -> Result<Vec<DraftPointer>> {
        self.ensure_open()?;
        Ok(self.state.read().log(item_id)?.drafts.values().cloned().collect())
    }

    pub(crate) fn discard_draft(&self, key: &DraftKey) -> Result<DraftPointer> {
        self.ensure_open()?;
        let mut state = self.state.write();
        let log = state.log_mut(&key.item_id)?;
        let pointer = log
            .drafts
            .remove(&(key.owner.clone(), key.session_id.clone()))
            .ok_or_else(|| VaultError::not_found("draft", key.to_string()))?;
        if let Some(root) = &self.root {
            remove_if_exists(&draft_file(root, &log.item.path(), &pointer.owner, &pointer.session_id))?;
        }
        debug!(draft = %key, "discarded draft");
        Ok(pointer)
    }

    /// Drop draft pointers untouched since `cutoff`
    pub(crate) fn discard_drafts_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<DraftKey>> {
        self.ensure_open()?;
        let mut state = self.state.write();
        let mut removed = Vec::new();

        for log in state.items.values_mut() {
            let stale: Vec<(String, String)> = log
                .drafts
                .iter()
                .filter(|(_, ptr)| ptr.updated_at < cutoff)
                .map(|(k, _)| k.clone())
                .collect();
            for (owner, session_id) in stale {
                log.drafts.remove(&(owner.clone(), session_id.clone()));
                if let Some(root) = &self.root {
                    remove_if_exists(&draft_file(root, &log.item.path(), &owner, &session_id))?;
                }
                removed.push(DraftKey::new(log.item.id.clone(), owner, session_id));
            }
        }
        Ok(removed)
    }

    // --- Releases ---

    /// Record a release; its tag name must be new
    pub(crate) fn insert_release(&self, release: Release) -> Result<Release> {
        self.ensure_open()?;
        let mut state = self.state.write();
        let log = state.log_mut(&release.item_id)?;

        if log.revision(release.revision_id).is_none() {
            return Err(VaultError::not_found(
                "revision",
                format!("{}@{}", log.item.path(), release.revision_id),
            ));
        }
        if log.releases.contains_key(&release.version) {
            return Err(VaultError::ReleaseExists {
                tag: release.tag_name(),
            });
        }

        if let Some(root) = &self.root {
            let dir = item_dir(root, &log.item.path()).join("releases");
            fs::create_dir_all(&dir)?;
            let file = dir.join(format!("{}.json", release.version));
            match write_json_new(&file, &release) {
                Err(VaultError::Io(e)) if e.kind() == ErrorKind::AlreadyExists => {
                    return Err(VaultError::ReleaseExists {
                        tag: release.tag_name(),
                    });
                }
                other => other?,
            }
        }

        log.releases.insert(release.version.clone(), release.clone());
        Ok(release)
    }

    /// Releases of an item in ascending version order
    pub(crate) fn releases(&self, item_id: &ItemId) -> Result<Vec<Release>> {
        self.ensure_open()?;
        Ok(self.state.read().log(item_id)?.releases.values().cloned().collect())
    }

    pub(crate) fn release(&self, item_id: &ItemId, version: &ReleaseVersion) -> Result<Release> {
        self.ensure_open()?;
        let state = self.state.read();
        let log = state.log(item_id)?;
        log.releases
            .get(version)
            .cloned()
            .ok_or_else(|| VaultError::not_found("release", crate::tags::tag_name(log.item.item_type(), item_id, version)))
    }
}

impl IndexSource for RevisionStore {
    fn item_ids(&self) -> Result<Vec<ItemId>> {
        self.ensure_open()?;
        let mut ids: Vec<ItemId> = self.state.read().items.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn index_entry(&self, id: &ItemId) -> Result<IndexEntry> {
        self.ensure_open()?;
        let state = self.state.read();
        let log = state.log(id)?;
        let head = log
            .head
            .and_then(|h| log.revision(h))
            .ok_or_else(|| VaultError::Corrupt {
                path: log.item.path().to_string(),
                reason: "item has no head revision".to_string(),
            })?;
        let latest = VersionPolicy::latest_stable(log.releases.keys());
        Ok(IndexEntry::build(&log.item, head, log.main_chain().count(), latest))
    }

    fn broken_items(&self) -> Vec<LoadError> {
        self.load_errors()
    }
}

// --- Commit ---

fn commit(
    root: Option<&Path>,
    log: &mut ItemLog,
    ns: &Namespace,
    content: &str,
    message: &str,
    author: &str,
    expected: Option<&Fingerprint>,
) -> Result<RevisionId> {
    let parent = log.namespace_head(ns)?;

    if let Some(expected) = expected {
        let current = parent
            .and_then(|id| log.revision(id))
            .map(|rev| rev.fingerprint.clone())
            .unwrap_or_else(|| Fingerprint::of(""));
        if current != *expected {
            warn!(
                path = %log.item.path(),
                expected = %expected.short(),
                current = %current.short(),
                "fingerprint precondition failed"
            );
            return Err(VaultError::Conflict { current });
        }
    }

    let revision = Revision {
        item_id: log.item.id.clone(),
        revision_id: log.next_id(),
        parent,
        content: content.to_string(),
        author: author.to_string(),
        message: message.to_string(),
        created_at: Utc::now(),
        fingerprint: Fingerprint::of(content),
    };
    let id = revision.revision_id;
    let path = log.item.path();

    // Disk first: memory only moves once every file for the commit is in place.
    let mut next_item = None;
    let mut next_pointer = None;
    match ns {
        Namespace::Main => {
            let mut item = log.item.clone();
            item.updated_at = revision.created_at;
            item.kind.refresh_from_content(content);
            next_item = Some(item);
        }
        Namespace::Draft { owner, session_id } => {
            let mut pointer = log
                .drafts
                .get(&(owner.clone(), session_id.clone()))
                .cloned()
                .ok_or_else(|| VaultError::not_found("draft", format!("{}/draft/{}/{}", path, owner, session_id)))?;
            pointer.head = Some(id);
            pointer.updated_at = revision.created_at;
            next_pointer = Some(pointer);
        }
    }

    if let Some(root) = root {
        let dir = item_dir(root, &path);
        let file = dir.join("revisions").join(format!("{:010}.json", id.seq()));
        write_json_new(&file, &revision)?;

        let persisted = match (&next_item, &next_pointer) {
            (Some(item), _) => write_json_atomic(&dir.join("item.json"), item)
                .and_then(|()| write_atomic(&dir.join("HEAD"), id.to_string().as_bytes())),
            (None, Some(pointer)) => persist_draft(root, &path, pointer),
            (None, None) => Ok(()),
        };
        if let Err(e) = persisted {
            warn!(path = %path, revision = %id, error = %e, "commit aborted, removing revision file");
            if let Err(cleanup) = remove_if_exists(&file) {
                warn!(file = %file.display(), error = %cleanup, "could not remove orphaned revision");
            }
            return Err(e);
        }
    }

    if let Some(item) = next_item {
        log.item = item;
        log.head = Some(id);
    }
    if let Some(pointer) = next_pointer {
        log.drafts
            .insert((pointer.owner.clone(), pointer.session_id.clone()), pointer);
    }
    log.revisions.push(revision);
    debug!(path = %path, revision = %id, "committed revision");
    Ok(id)
}

/// Minimal line diff of two texts (longest common subsequence)
pub fn diff_text(before: &str, after: &str, from_ref: &str, to_ref: &str) -> DiffResult {
    let diff = TextDiff::configure()
        .algorithm(Algorithm::Myers)
        .diff_lines(before, after);

    let mut additions = 0;
    let mut deletions = 0;
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => additions += 1,
            ChangeTag::Delete => deletions += 1,
            ChangeTag::Equal => {}
        }
    }

    let unified_text = diff
        .unified_diff()
        .context_radius(DIFF_CONTEXT)
        .header(from_ref, to_ref)
        .to_string();

    DiffResult {
        from_ref: from_ref.to_string(),
        to_ref: to_ref.to_string(),
        additions,
        deletions,
        unified_text,
    }
}

// --- Persistence ---

fn item_dir(root: &Path, path: &ItemPath) -> PathBuf {
    root.join("items").join(path.item_type.dir_name()).join(path.id.as_str())
}

fn draft_file(root: &Path, path: &ItemPath, owner: &str, session_id: &str) -> PathBuf {
    item_dir(root, path)
        .join("drafts")
        .join(format!("{}.{}.json", owner, session_id))
}

fn persist_draft(root: &Path, path: &ItemPath, pointer: &DraftPointer) -> Result<()> {
    let file = draft_file(root, path, &pointer.owner, &pointer.session_id);
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent)?;
    }
    write_json_atomic(&file, pointer)
}

/// Replace a file via a temp file and rename
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    write_atomic(path, content.as_bytes())
}

/// Create a file that must not exist yet
fn write_json_new<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    Ok(files)
}

fn load_state(root: &Path) -> Result<StoreState> {
    let mut state = StoreState::default();

    for entry in WalkDir::new(root.join("items")).min_depth(3).max_depth(3) {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_name() != "item.json" {
            continue;
        }
        let Some(dir) = entry.path().parent() else {
            continue;
        };

        match load_item_dir(dir) {
            Ok(log) => {
                if let Err(e) = state.claim_slug(&log.item) {
                    warn!(dir = %dir.display(), error = %e, "duplicate slug on disk");
                }
                state.items.insert(log.item.id.clone(), log);
            }
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "skipping unreadable item");
                state.load_errors.push(LoadError {
                    path: dir.display().to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }

    Ok(state)
}

fn load_item_dir(dir: &Path) -> Result<ItemLog> {
    let corrupt = |reason: String| VaultError::Corrupt {
        path: dir.display().to_string(),
        reason,
    };

    let item: Item = read_json(&dir.join("item.json"))?;
    let mut log = ItemLog::new(item);

    for (idx, file) in json_files(&dir.join("revisions"))?.into_iter().enumerate() {
        let revision: Revision = read_json(&file)?;
        if revision.revision_id.seq() != idx as u64 + 1 {
            return Err(corrupt(format!("revision log gap at {}", revision.revision_id)));
        }
        if !revision.fingerprint.verify(&revision.content) {
            return Err(corrupt(format!("fingerprint mismatch in {}", revision.revision_id)));
        }
        log.revisions.push(revision);
    }

    let head_file = dir.join("HEAD");
    if head_file.exists() {
        let head = RevisionId::parse(fs::read_to_string(&head_file)?.trim())?;
        if log.revision(head).is_none() {
            return Err(corrupt(format!("HEAD points at missing {}", head)));
        }
        log.head = Some(head);
    }

    for file in json_files(&dir.join("drafts"))? {
        let pointer: DraftPointer = read_json(&file)?;
        log.drafts
            .insert((pointer.owner.clone(), pointer.session_id.clone()), pointer);
    }

    for file in json_files(&dir.join("releases"))? {
        let release: Release = read_json(&file)?;
        log.releases.insert(release.version.clone(), release);
    }

    Ok(log)
}
