//! Prompt Vault
//!
//! A versioned, append-only store for prompts, templates and chat transcripts,
//! with per-session drafts, immutable releases and a rebuildable search index.
//!
//! ## Features
//!
//! - **Append-only history**: every write is a new revision; nothing is overwritten
//! - **Drafts**: isolated per `(item, owner, session)` until published
//! - **Releases**: immutable tags, versioned `vMAJOR.MINOR.PATCH`, with suggested bumps
//! - **Optimistic concurrency**: SHA256 fingerprints reject stale writes
//! - **Search**: conjunctive filters with stable keyset pagination
//!
//! ## Example
//!
//! ```no_run
//! use prompt_vault::{ItemKind, NewItem, RevisionRef, Vault, VaultConfig};
//!
//! # fn main() -> prompt_vault::Result<()> {
//! let vault = Vault::open(VaultConfig::at("./vault"))?;
//! let (item, _) = vault.create_item(
//!     NewItem::new(ItemKind::prompt(), "welcome", "Welcome email"),
//!     "# Welcome\nHello {{name}}",
//!     Some("ana"),
//! )?;
//!
//! let saved = vault.save_draft(&item.id, "ana", "s1", "# Welcome\nHi {{name}}!", "tone")?;
//! let release = vault.publish(
//!     &item.id,
//!     vault.publish_request(RevisionRef::parse(&saved.draft_ref)?, Some("ana")),
//! )?;
//! println!("released {}", release.tag_name());
//! # Ok(())
//! # }
//! ```

pub mod checksum;
pub mod config;
pub mod drafts;
pub mod error;
pub mod frontmatter;
pub mod guard;
pub mod index;
pub mod item;
pub mod publish;
pub mod store;
pub mod tags;
pub mod vault;
pub mod version;

pub use checksum::Fingerprint;
pub use config::VaultConfig;
pub use drafts::{DraftKey, DraftNamespace, DraftPointer};
pub use error::{Result, VaultError};
pub use frontmatter::FrontMatter;
pub use guard::ConflictGuard;
pub use index::{IndexEntry, IndexSource, LockHolder, RebuildReport, SearchIndex, SearchPage, SearchQuery};
pub use item::{Item, ItemId, ItemKind, ItemPatch, ItemPath, ItemType, NewItem, TemplateVariable, VariableType};
pub use publish::{DraftSaved, PublishRequest, PublishWorkflow, ResolvedContent, TimelineEvent};
pub use store::{CommitInfo, DiffResult, Namespace, Revision, RevisionId, RevisionRef, RevisionStore};
pub use tags::{Release, ReleaseMeta, TagManager};
pub use vault::{Comparison, Vault};
pub use version::{Bump, ReleaseVersion, VersionPolicy, VersionRequest};
