//! Release tags
//!
//! A release is an immutable, named pointer at one committed revision.
//! Tag names have the form `{type}/{item_id}/{version}`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::checksum::Fingerprint;
use crate::error::Result;
use crate::item::{ItemId, ItemPath, ItemType};
use crate::store::{RevisionId, RevisionRef, RevisionStore};
use crate::version::{ReleaseVersion, VersionPolicy};

/// Build the tag name for a release
pub fn tag_name(item_type: ItemType, item_id: &ItemId, version: &ReleaseVersion) -> String {
    format!("{}/{}/{}", item_type, item_id, version)
}

/// Split a tag name into its parts, if it is one
pub fn parse_tag_name(name: &str) -> Option<(ItemType, ItemId, ReleaseVersion)> {
    let mut parts = name.splitn(3, '/');
    let item_type = parts.next()?.parse::<ItemType>().ok()?;
    let id = ItemId::parse(parts.next()?).ok()?;
    let version = ReleaseVersion::parse(parts.next()?).ok()?;
    Some((item_type, id, version))
}

/// An immutable release record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub item_id: ItemId,
    pub item_type: ItemType,
    pub version: ReleaseVersion,
    pub channel: String,
    pub notes: String,
    pub revision_id: RevisionId,
    pub released_at: DateTime<Utc>,
    pub released_by: String,
    /// SHA256 of the released content
    pub checksum: Fingerprint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_from: Option<ReleaseVersion>,
}

impl Release {
    pub fn tag_name(&self) -> String {
        tag_name(self.item_type, &self.item_id, &self.version)
    }

    pub fn is_rollback(&self) -> bool {
        self.rollback_from.is_some()
    }
}

/// Release metadata supplied by the caller
#[derive(Debug, Clone, Default)]
pub struct ReleaseMeta {
    pub channel: String,
    pub notes: String,
    pub released_by: String,
    pub rollback_from: Option<ReleaseVersion>,
}

impl ReleaseMeta {
    pub fn new(channel: impl Into<String>, notes: impl Into<String>, released_by: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            notes: notes.into(),
            released_by: released_by.into(),
            rollback_from: None,
        }
    }

    pub fn rollback_from(mut self, version: ReleaseVersion) -> Self {
        self.rollback_from = Some(version);
        self
    }
}

/// Creates and looks up releases
#[derive(Clone)]
pub struct TagManager {
    store: Arc<RevisionStore>,
}

impl TagManager {
    pub fn new(store: Arc<RevisionStore>) -> Self {
        Self { store }
    }

    /// Tag `base_revision` as `version`. Fails if the tag name exists.
    #[instrument(skip(self, meta), fields(channel = %meta.channel))]
    pub fn create_release(
        &self,
        item_id: &ItemId,
        version: &ReleaseVersion,
        base_revision: RevisionId,
        meta: ReleaseMeta,
    ) -> Result<Release> {
        let item = self.store.get_item(item_id)?;
        let path = ItemPath::new(item.item_type(), item_id.clone()).to_string();
        let revision = self
            .store
            .resolve(&path, Some(&RevisionRef::Revision(base_revision)))?;

        let release = Release {
            item_id: item_id.clone(),
            item_type: item.item_type(),
            version: version.clone(),
            channel: meta.channel,
            notes: meta.notes,
            revision_id: base_revision,
            released_at: Utc::now(),
            released_by: meta.released_by,
            checksum: revision.fingerprint,
            rollback_from: meta.rollback_from,
        };

        let release = self.store.insert_release(release)?;
        info!(tag = %release.tag_name(), revision = %base_revision, "created release");
        Ok(release)
    }

    /// Releases in ascending version order, optionally limited to versions
    /// whose string form starts with `prefix` (with or without the leading `v`)
    pub fn list_releases(&self, item_id: &ItemId, prefix: Option<&str>) -> Result<Vec<Release>> {
        let releases = self.store.releases(item_id)?;
        let Some(prefix) = prefix else {
            return Ok(releases);
        };
        let prefix = if prefix.starts_with('v') {
            prefix.to_string()
        } else {
            format!("v{}", prefix)
        };
        Ok(releases
            .into_iter()
            .filter(|r| r.version.to_string().starts_with(&prefix))
            .collect())
    }

    pub fn get_release(&self, item_id: &ItemId, version: &ReleaseVersion) -> Result<Release> {
        self.store.release(item_id, version)
    }

    /// Latest stable release, falling back to the latest prerelease
    pub fn latest_release(&self, item_id: &ItemId) -> Result<Option<Release>> {
        let releases = self.store.releases(item_id)?;
        let latest = VersionPolicy::latest_stable(releases.iter().map(|r| &r.version));
        Ok(latest.and_then(|v| releases.into_iter().find(|r| r.version == v)))
    }

    /// Highest version of any release, stable or not
    pub fn highest_version(&self, item_id: &ItemId) -> Result<Option<ReleaseVersion>> {
        Ok(self.store.releases(item_id)?.pop().map(|r| r.version))
    }
}
