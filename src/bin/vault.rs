//! Prompt Vault CLI
//!
//! Create, edit, draft, publish and search vault items.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use prompt_vault::{
    ItemId, ItemKind, ItemType, NewItem, ReleaseVersion, RevisionRef, SearchQuery, TimelineEvent, Vault,
    VaultConfig, VersionRequest,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "vault")]
#[command(about = "Versioned store for prompts, templates and chats")]
struct Cli {
    /// Config file to load on top of the default locations
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Store directory (overrides config)
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,

    /// Author recorded on writes
    #[arg(short, long, global = true)]
    author: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a store and write a config file for it
    Init {
        /// Where to write the config
        #[arg(long, default_value = "vault.toml")]
        output: PathBuf,
    },

    /// Create an item with its first revision
    Create {
        /// prompt, template or chat
        #[arg(short = 't', long = "type")]
        item_type: ItemType,
        #[arg(long)]
        slug: String,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(short, long = "label")]
        labels: Vec<String>,
        /// Read content from a file (stdin when neither --file nor --content)
        #[arg(short, long)]
        file: Option<PathBuf>,
        #[arg(long)]
        content: Option<String>,
    },

    /// Print an item's content
    Show {
        /// Item id or `<type>:<slug>`
        item: String,
        /// HEAD, r<N>, draft/<owner>/<session>, a version, or "latest"
        #[arg(long, default_value = "HEAD")]
        at: String,
        /// Print metadata instead of content
        #[arg(long)]
        meta: bool,
    },

    /// Commit new content to main history
    Write {
        item: String,
        #[arg(short, long)]
        message: String,
        #[arg(short, long)]
        file: Option<PathBuf>,
        #[arg(long)]
        content: Option<String>,
        /// Reject the write unless the head still has this fingerprint
        #[arg(long)]
        expect: Option<String>,
    },

    /// Show main history
    History {
        item: String,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Diff two refs of an item
    Diff {
        item: String,
        from: String,
        #[arg(default_value = "HEAD")]
        to: String,
    },

    /// Manage drafts
    Draft {
        #[command(subcommand)]
        command: DraftCommands,
    },

    /// Publish a revision as a release
    Publish {
        item: String,
        /// Ref to publish
        #[arg(long, default_value = "HEAD")]
        base: String,
        /// Version, or "auto" to use the suggestion
        #[arg(long, default_value = "auto")]
        version: String,
        #[arg(long)]
        channel: Option<String>,
        #[arg(long, default_value = "")]
        notes: String,
        #[arg(long)]
        expect: Option<String>,
    },

    /// Re-release the content of an earlier version
    Rollback {
        item: String,
        to: String,
        #[arg(long)]
        notes: Option<String>,
    },

    /// List releases
    Releases {
        item: String,
        /// Only versions starting with this prefix
        #[arg(long)]
        prefix: Option<String>,
        /// Show the full timeline including unreleased commits and drafts
        #[arg(long)]
        timeline: bool,
    },

    /// Search the index
    Search {
        #[arg(short = 't', long = "type")]
        item_type: Option<ItemType>,
        #[arg(short, long = "label")]
        labels: Vec<String>,
        #[arg(long)]
        slug: Option<String>,
        #[arg(long = "by")]
        by_author: Option<String>,
        /// Chat provider
        #[arg(long)]
        provider: Option<String>,
        /// Text matched against title, description and slug
        #[arg(short, long)]
        query: Option<String>,
        #[arg(long, default_value = "20")]
        limit: usize,
        #[arg(long)]
        cursor: Option<String>,
        /// Emit JSON
        #[arg(long)]
        json: bool,
    },

    /// Rebuild the search index from the store
    Rebuild,

    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum DraftCommands {
    /// Save content into a draft
    Save {
        item: String,
        #[arg(long)]
        owner: String,
        #[arg(long)]
        session: String,
        #[arg(short, long, default_value = "Draft")]
        message: String,
        #[arg(short, long)]
        file: Option<PathBuf>,
        #[arg(long)]
        content: Option<String>,
    },
    /// List open drafts of an item
    List { item: String },
    /// Drop a draft pointer
    Discard {
        item: String,
        #[arg(long)]
        owner: String,
        #[arg(long)]
        session: String,
    },
    /// Drop drafts idle longer than the configured threshold
    Gc,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn read_content(file: Option<PathBuf>, content: Option<String>) -> anyhow::Result<String> {
    match (file, content) {
        (Some(_), Some(_)) => bail!("use either --file or --content, not both"),
        (Some(path), None) => {
            std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))
        }
        (None, Some(content)) => Ok(content),
        (None, None) => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            Ok(buf)
        }
    }
}

/// Accept an item id or `<type>:<slug>`
fn resolve_item(vault: &Vault, key: &str) -> anyhow::Result<ItemId> {
    if let Some((item_type, slug)) = key.split_once(':') {
        let item_type: ItemType = item_type.parse()?;
        return vault
            .find_by_slug(item_type, slug)
            .map(|item| item.id)
            .ok_or_else(|| anyhow!("no {} with slug {:?}", item_type, slug));
    }
    Ok(ItemId::parse(key)?)
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = VaultConfig::load_from(cli.config.as_deref())?;
    if let Some(store) = cli.store {
        config.storage.path = store;
    }
    let author = cli.author.as_deref();

    match cli.command {
        Commands::Init { output } => {
            let vault = Vault::open(config.clone())?;
            config.save(&output)?;
            println!("Initialized vault at {}", vault.config().storage_path().display());
            println!("Config written to {}", output.display());
            Ok(())
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        command => execute(&Vault::open(config)?, command, author),
    }
}

fn execute(vault: &Vault, command: Commands, author: Option<&str>) -> anyhow::Result<()> {
    match command {
        Commands::Init { .. } | Commands::Config => {}

        Commands::Create {
            item_type,
            slug,
            title,
            description,
            labels,
            file,
            content,
        } => {
            let kind = match item_type {
                ItemType::Prompt => ItemKind::prompt(),
                ItemType::Template => ItemKind::template(Vec::new()),
                ItemType::Chat => ItemKind::chat(),
            };
            let content = read_content(file, content)?;
            let new = NewItem::new(kind, slug, title)
                .with_description(description)
                .with_labels(labels);
            let (item, revision) = vault.create_item(new, &content, author)?;
            println!("{} {} ({})", item.path(), item.slug, revision);
        }

        Commands::Show { item, at, meta } => {
            let id = resolve_item(vault, &item)?;
            if meta {
                println!("{}", serde_json::to_string_pretty(&vault.get_item(&id)?)?);
            } else {
                print!("{}", vault.resolve_content(&id, &at)?.content);
            }
        }

        Commands::Write {
            item,
            message,
            file,
            content,
            expect,
        } => {
            let id = resolve_item(vault, &item)?;
            let content = read_content(file, content)?;
            let revision = match expect {
                Some(fp) => vault.write_guarded(&id, &fp.into(), &content, &message, author)?,
                None => vault.write(&id, &content, &message, author)?,
            };
            println!("{}", revision);
        }

        Commands::History { item, limit } => {
            let id = resolve_item(vault, &item)?;
            for commit in vault.history(&id, limit)? {
                println!(
                    "{:>5}  {}  {:<12} {}",
                    commit.revision_id,
                    commit.timestamp.format("%Y-%m-%d %H:%M"),
                    commit.author,
                    commit.message
                );
            }
        }

        Commands::Diff { item, from, to } => {
            let id = resolve_item(vault, &item)?;
            let cmp = vault.compare(&id, &from, &to)?;
            print!("{}", cmp.diff.unified_text);
            println!("+{} -{}", cmp.diff.additions, cmp.diff.deletions);
            if !cmp.metadata_changes.is_empty() {
                println!("metadata changed: {}", cmp.metadata_changes.join(", "));
            }
        }

        Commands::Draft { command } => match command {
            DraftCommands::Save {
                item,
                owner,
                session,
                message,
                file,
                content,
            } => {
                let id = resolve_item(vault, &item)?;
                let content = read_content(file, content)?;
                let saved = vault.save_draft(&id, &owner, &session, &content, &message)?;
                println!(
                    "{} at {} (suggested {})",
                    saved.draft_ref, saved.revision_id, saved.suggested_next_version
                );
            }
            DraftCommands::List { item } => {
                let id = resolve_item(vault, &item)?;
                for draft in vault.list_drafts(&id)? {
                    let tip = draft
                        .tip()
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!("{:<30} {:>5}  {}", draft.ref_name(), tip, draft.updated_at.to_rfc3339());
                }
            }
            DraftCommands::Discard { item, owner, session } => {
                let id = resolve_item(vault, &item)?;
                vault.discard_draft(&id, &owner, &session)?;
                println!("discarded draft/{}/{}", owner, session);
            }
            DraftCommands::Gc => {
                let removed = vault.gc_drafts()?;
                for key in &removed {
                    println!("collected {}", key);
                }
                println!("{} draft(s) collected", removed.len());
            }
        },

        Commands::Publish {
            item,
            base,
            version,
            channel,
            notes,
            expect,
        } => {
            let id = resolve_item(vault, &item)?;
            let mut request = vault
                .publish_request(RevisionRef::parse(&base)?, author)
                .version(version.parse::<VersionRequest>()?)
                .notes(notes);
            if let Some(channel) = channel {
                request = request.channel(channel);
            }
            if let Some(fp) = expect {
                request = request.expect(fp.into());
            }
            let release = vault.publish(&id, request)?;
            println!("{} -> {} [{}]", release.tag_name(), release.revision_id, release.channel);
        }

        Commands::Rollback { item, to, notes } => {
            let id = resolve_item(vault, &item)?;
            let to = ReleaseVersion::parse(&to)?;
            let release = vault.rollback(&id, &to, notes.as_deref(), author)?;
            println!("{} -> {} (rollback from {})", release.tag_name(), release.revision_id, to);
        }

        Commands::Releases { item, prefix, timeline } => {
            let id = resolve_item(vault, &item)?;
            if timeline {
                for event in vault.timeline(&id, true, usize::MAX)? {
                    let at = event.at().format("%Y-%m-%d %H:%M");
                    match event {
                        TimelineEvent::Released(r) => {
                            println!("{}  release  {:<12} {} {}", at, r.version, r.revision_id, r.notes)
                        }
                        TimelineEvent::Committed(c) => {
                            println!("{}  commit   {:<12} {}", at, c.revision_id, c.message)
                        }
                        TimelineEvent::Drafted { owner, session_id, commit } => {
                            println!("{}  draft    {:<12} draft/{}/{}", at, commit.revision_id, owner, session_id)
                        }
                    }
                }
            } else {
                for r in vault.releases(&id, prefix.as_deref())? {
                    println!(
                        "{:<14} {:>5}  {:<8} {}  {}",
                        r.version,
                        r.revision_id,
                        r.channel,
                        r.released_at.format("%Y-%m-%d %H:%M"),
                        r.notes
                    );
                }
            }
        }

        Commands::Search {
            item_type,
            labels,
            slug,
            by_author,
            provider,
            query,
            limit,
            cursor,
            json,
        } => {
            let query = SearchQuery {
                item_type,
                labels: labels.into_iter().collect(),
                slug,
                author: by_author,
                provider,
                query,
                limit,
                cursor,
            };
            let page = vault.search(&query)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&page)?);
            } else {
                for entry in &page.items {
                    println!(
                        "{:<9} {:<26} {:<24} {}",
                        entry.item_type,
                        entry.id,
                        entry.slug,
                        entry.updated_at.to_rfc3339()
                    );
                }
                if let Some(next) = page.next_cursor {
                    println!("next: {}", next);
                }
            }
        }

        Commands::Rebuild => {
            let report = vault.rebuild()?;
            for (item_type, count) in &report.counts {
                println!("{:<9} {}", item_type, count);
            }
            for error in &report.errors {
                eprintln!("error: {}: {}", error.item, error.reason);
            }
        }
    }

    Ok(())
}
