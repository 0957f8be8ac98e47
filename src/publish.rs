//! Draft-to-release workflow
//!
//! ```text
//!            save_draft               publish
//!   Draft ─────────────▶ Draft ────────────────▶ Published
//!     ▲                                   │
//!     └────────── open (from main) ◀──────┘     rollback: Published ─▶ Published
//! ```
//!
//! Publishing copies the chosen content onto main history and tags the
//! resulting revision. Rolling back re-commits an old release's content and
//! tags it one patch above the latest release.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::checksum::Fingerprint;
use crate::drafts::{DraftKey, DraftNamespace, DraftPointer};
use crate::error::{Result, VaultError};
use crate::guard::ConflictGuard;
use crate::item::ItemId;
use crate::store::{CommitInfo, RevisionId, RevisionRef, RevisionStore};
use crate::tags::{Release, ReleaseMeta, TagManager};
use crate::version::{Bump, ReleaseVersion, VersionPolicy, VersionRequest};

/// Keyword accepted by [`PublishWorkflow::resolve_content`]
pub const LATEST: &str = "latest";

/// Result of saving into a draft
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftSaved {
    pub revision_id: RevisionId,
    pub suggested_next_version: ReleaseVersion,
    pub draft_ref: String,
}

/// Parameters of a publish
#[derive(Debug, Clone)]
pub struct PublishRequest {
    /// Revision to release; usually a draft ref or a raw revision id
    pub base: RevisionRef,
    pub version: VersionRequest,
    pub channel: String,
    pub notes: String,
    pub released_by: String,
    /// When set, the main-history write is rejected if the head moved
    pub expected_fingerprint: Option<Fingerprint>,
}

impl PublishRequest {
    pub fn new(base: RevisionRef, released_by: impl Into<String>) -> Self {
        Self {
            base,
            version: VersionRequest::Auto,
            channel: "prod".to_string(),
            notes: String::new(),
            released_by: released_by.into(),
            expected_fingerprint: None,
        }
    }

    pub fn version(mut self, version: VersionRequest) -> Self {
        self.version = version;
        self
    }

    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    pub fn expect(mut self, fingerprint: Fingerprint) -> Self {
        self.expected_fingerprint = Some(fingerprint);
        self
    }
}

/// One event in an item's timeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TimelineEvent {
    Released(Release),
    Committed(CommitInfo),
    Drafted {
        owner: String,
        session_id: String,
        commit: CommitInfo,
    },
}

impl TimelineEvent {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            TimelineEvent::Released(r) => r.released_at,
            TimelineEvent::Committed(c) => c.timestamp,
            TimelineEvent::Drafted { commit, .. } => commit.timestamp,
        }
    }
}

/// Content picked by a selector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedContent {
    pub revision_id: RevisionId,
    pub version: Option<ReleaseVersion>,
    pub fingerprint: Fingerprint,
    pub content: String,
}

#[derive(Clone)]
pub struct PublishWorkflow {
    store: Arc<RevisionStore>,
    tags: TagManager,
    drafts: DraftNamespace,
    guard: ConflictGuard,
}

impl PublishWorkflow {
    pub fn new(store: Arc<RevisionStore>) -> Self {
        Self {
            tags: TagManager::new(store.clone()),
            drafts: DraftNamespace::new(store.clone()),
            guard: ConflictGuard::new(store.clone()),
            store,
        }
    }

    pub fn tags(&self) -> &TagManager {
        &self.tags
    }

    pub fn drafts(&self) -> &DraftNamespace {
        &self.drafts
    }

    fn path_of(&self, item_id: &ItemId) -> Result<String> {
        Ok(self.store.get_item(item_id)?.path().to_string())
    }

    fn latest_version(&self, item_id: &ItemId) -> Result<Option<ReleaseVersion>> {
        Ok(self.tags.latest_release(item_id)?.map(|r| r.version))
    }

    /// Save into the caller's draft and suggest the version publishing it would get
    #[instrument(skip(self, content), fields(item = %item_id))]
    pub fn save_draft(
        &self,
        item_id: &ItemId,
        owner: &str,
        session_id: &str,
        content: &str,
        message: &str,
    ) -> Result<DraftSaved> {
        if content.trim().is_empty() {
            return Err(VaultError::validation("Draft content cannot be empty"));
        }

        let key = DraftKey::new(item_id.clone(), owner, session_id);
        let revision_id = self.drafts.write(&key, content, message)?;

        let main = self.store.read(&self.path_of(item_id)?, None)?;
        let latest = self.latest_version(item_id)?;
        let suggested_next_version = VersionPolicy::suggest(&main, content, latest.as_ref())?;

        debug!(revision = %revision_id, suggested = %suggested_next_version, "saved draft");
        Ok(DraftSaved {
            revision_id,
            suggested_next_version,
            draft_ref: key.to_ref().to_string(),
        })
    }

    /// Copy the base content onto main history and tag it
    #[instrument(skip(self, request), fields(item = %item_id, base = %request.base))]
    pub fn publish(&self, item_id: &ItemId, request: PublishRequest) -> Result<Release> {
        let path = self.path_of(item_id)?;
        let base = self.store.resolve(&path, Some(&request.base))?;
        let head = self.store.resolve(&path, None)?;
        let latest = self.latest_version(item_id)?;

        let version = match request.version {
            VersionRequest::Auto => VersionPolicy::suggest(&head.content, &base.content, latest.as_ref())?,
            VersionRequest::Exact(v) => v,
        };
        if let Some(highest) = self.tags.highest_version(item_id)? {
            if version <= highest {
                return Err(VaultError::validation(format!(
                    "Version {} must be greater than latest release {}",
                    version, highest
                )));
            }
        }

        let message = format!("Publish {}", version);
        let revision_id = match &request.expected_fingerprint {
            Some(expected) if head.fingerprint == base.fingerprint => {
                if *expected != head.fingerprint {
                    return Err(VaultError::Conflict {
                        current: head.fingerprint,
                    });
                }
                head.revision_id
            }
            Some(expected) => {
                self.guard
                    .check_and_write(&path, expected, &base.content, &message, &request.released_by)?
            }
            None if head.fingerprint == base.fingerprint => head.revision_id,
            None => self
                .store
                .write(&path, &base.content, &message, &request.released_by)?,
        };

        let meta = ReleaseMeta::new(request.channel, request.notes, request.released_by);
        let release = self.tags.create_release(item_id, &version, revision_id, meta)?;

        for pointer in self.drafts.list(item_id)? {
            if pointer.head == Some(base.revision_id) {
                self.drafts.discard(&pointer.key())?;
                debug!(draft = %pointer.key(), "closed published draft");
            }
        }

        info!(tag = %release.tag_name(), revision = %revision_id, "published");
        Ok(release)
    }

    /// Restore a release's content as a new release
    #[instrument(skip(self, notes), fields(item = %item_id, to = %to_version))]
    pub fn rollback(
        &self,
        item_id: &ItemId,
        to_version: &ReleaseVersion,
        channel: &str,
        notes: Option<&str>,
        released_by: &str,
    ) -> Result<Release> {
        let path = self.path_of(item_id)?;
        let target = self.tags.get_release(item_id, to_version)?;
        let content = self
            .store
            .read(&path, Some(&RevisionRef::Revision(target.revision_id)))?;

        let notes = notes
            .map(str::to_string)
            .unwrap_or_else(|| format!("Rollback to {}", to_version));
        let revision_id = self.store.write(&path, &content, &notes, released_by)?;

        let current = self
            .tags
            .highest_version(item_id)?
            .ok_or_else(|| VaultError::not_found("release", item_id.as_str()))?;
        let version = current.increment(Bump::Patch)?;

        let meta = ReleaseMeta::new(channel, notes, released_by).rollback_from(to_version.clone());
        let release = self.tags.create_release(item_id, &version, revision_id, meta)?;

        info!(tag = %release.tag_name(), "rolled back");
        Ok(release)
    }

    /// Releases newest first; with `include_drafts`, unreleased main commits
    /// and open draft heads are merged in
    pub fn timeline(&self, item_id: &ItemId, include_drafts: bool, limit: usize) -> Result<Vec<TimelineEvent>> {
        let releases = self.tags.list_releases(item_id, None)?;
        let mut events = Vec::with_capacity(releases.len());

        if include_drafts {
            let path = self.path_of(item_id)?;
            for commit in self.store.history(&path, usize::MAX)? {
                if releases.iter().all(|r| r.revision_id != commit.revision_id) {
                    events.push(TimelineEvent::Committed(commit));
                }
            }
            for pointer in self.drafts.list(item_id)? {
                if let Some(event) = self.draft_event(&path, &pointer)? {
                    events.push(event);
                }
            }
        }
        events.extend(releases.into_iter().map(TimelineEvent::Released));

        events.sort_by(|a, b| b.at().cmp(&a.at()));
        events.truncate(limit);
        Ok(events)
    }

    fn draft_event(&self, path: &str, pointer: &DraftPointer) -> Result<Option<TimelineEvent>> {
        if pointer.head.is_none() {
            return Ok(None);
        }
        let revision = self.store.resolve(path, Some(&pointer.key().to_ref()))?;
        Ok(Some(TimelineEvent::Drafted {
            owner: pointer.owner.clone(),
            session_id: pointer.session_id.clone(),
            commit: CommitInfo::from(&revision),
        }))
    }

    /// Resolve `latest`, a release version, or any ref.
    ///
    /// `latest` is the latest stable release, or the main head before the
    /// first release.
    pub fn resolve_content(&self, item_id: &ItemId, selector: &str) -> Result<ResolvedContent> {
        let path = self.path_of(item_id)?;

        let (at, version) = if selector.trim().eq_ignore_ascii_case(LATEST) {
            match self.tags.latest_release(item_id)? {
                Some(release) => (RevisionRef::Revision(release.revision_id), Some(release.version)),
                None => (RevisionRef::Head, None),
            }
        } else {
            match RevisionRef::parse(selector)? {
                RevisionRef::Release { version, .. } => {
                    let release = self.tags.get_release(item_id, &version)?;
                    (RevisionRef::Revision(release.revision_id), Some(release.version))
                }
                other => (other, None),
            }
        };

        let revision = self.store.resolve(&path, Some(&at))?;
        Ok(ResolvedContent {
            revision_id: revision.revision_id,
            version,
            fingerprint: revision.fingerprint,
            content: revision.content,
        })
    }
}
