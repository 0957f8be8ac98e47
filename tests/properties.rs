//! Property-based tests for history, versions and search

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use prompt_vault::{
    Fingerprint, IndexEntry, ItemId, ItemKind, ItemType, NewItem, RevisionStore, SearchIndex, SearchQuery,
    VersionPolicy,
};

const LABELS: [&str; 3] = ["a", "b", "c"];

fn store_with_item(content: &str) -> (RevisionStore, String) {
    let store = RevisionStore::in_memory();
    let item = NewItem::new(ItemKind::prompt(), "subject", "Subject")
        .into_item("ana", Utc::now())
        .unwrap();
    let path = item.path().to_string();
    store.create_item(item, content, "create").unwrap();
    (store, path)
}

fn version_strategy() -> impl Strategy<Value = String> {
    (
        0u64..4,
        0u64..4,
        0u64..4,
        prop::option::of("[a-z0-9]{1,4}(\\.[a-z0-9]{1,3})?"),
        any::<bool>(),
    )
        .prop_map(|(major, minor, patch, pre, prefix)| {
            let mut s = format!("{}{}.{}.{}", if prefix { "v" } else { "" }, major, minor, patch);
            if let Some(pre) = pre {
                s.push('-');
                s.push_str(&pre);
            }
            s
        })
}

fn entry_strategy() -> impl Strategy<Value = (u32, BTreeSet<String>)> {
    (
        0u32..10,
        prop::collection::btree_set(prop::sample::select(LABELS.to_vec()), 0..=3)
            .prop_map(|set| set.into_iter().map(str::to_string).collect::<BTreeSet<String>>()),
    )
}

fn build_index(rows: &[(u32, BTreeSet<String>)]) -> SearchIndex {
    let index = SearchIndex::new(Duration::from_secs(1));
    for (i, (minute, labels)) in rows.iter().enumerate() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 9, *minute, 0).unwrap();
        let id = format!("ITEM{:03}", i);
        index
            .upsert(IndexEntry {
                id: ItemId::parse(&id).unwrap(),
                item_type: ItemType::Prompt,
                title: id.clone(),
                description: String::new(),
                slug: id.to_lowercase(),
                labels: labels.clone(),
                author: "ana".to_string(),
                created_at: at,
                updated_at: at,
                current_revision_ref: "r1".to_string(),
                content_fingerprint: Fingerprint::of(&id),
                revision_count: 1,
                latest_release: None,
                provider: None,
            })
            .unwrap();
    }
    index
}

/// History only ever grows at the front; earlier entries keep their order.
#[test]
fn prop_history_is_append_only() {
    proptest!(|(contents in prop::collection::vec(".{0,40}", 1..12))| {
        let (store, path) = store_with_item("seed");
        let mut previous = store.history(&path, usize::MAX).unwrap();

        for (i, content) in contents.iter().enumerate() {
            store.write(&path, content, &format!("edit {i}"), "ana").unwrap();
            let current = store.history(&path, usize::MAX).unwrap();

            prop_assert_eq!(current.len(), previous.len() + 1);
            prop_assert_eq!(&current[1..], &previous[..]);
            previous = current;
        }
    });
}

#[test]
fn prop_write_then_read_round_trips() {
    proptest!(|(content in any::<String>())| {
        let (store, path) = store_with_item("seed");
        store.write(&path, &content, "edit", "ana").unwrap();
        prop_assert_eq!(store.read(&path, None).unwrap(), content.clone());
        prop_assert!(store.fingerprint(&path, None).unwrap().verify(&content));
    });
}

#[test]
fn prop_version_compare_is_antisymmetric() {
    proptest!(|(a in version_strategy(), b in version_strategy())| {
        let ab = VersionPolicy::compare(&a, &b).unwrap();
        let ba = VersionPolicy::compare(&b, &a).unwrap();
        prop_assert_eq!(ab, -ba);
        prop_assert_eq!(VersionPolicy::compare(&a, &a).unwrap(), 0);
    });

    assert_eq!(VersionPolicy::compare("v1.0.0-rc", "v1.0.0").unwrap(), -1);
    assert_eq!(VersionPolicy::compare("v1.0.0", "v1.0.1").unwrap(), -1);
}

/// Following cursors visits every match exactly once for any page size.
#[test]
fn prop_pagination_is_complete() {
    proptest!(|(rows in prop::collection::vec(entry_strategy(), 0..30), page_size in 1usize..8, want in prop::sample::subsequence(LABELS.to_vec(), 0..=2))| {
        let index = build_index(&rows);
        let mut query = SearchQuery::new().limit(page_size);
        for label in &want {
            query = query.label(*label);
        }

        let expected: BTreeSet<String> = rows
            .iter()
            .enumerate()
            .filter(|(_, (_, labels))| want.iter().all(|l| labels.contains(*l)))
            .map(|(i, _)| format!("ITEM{:03}", i))
            .collect();

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = index.search(&query.clone().after(cursor)).unwrap();
            prop_assert!(page.items.len() <= page_size);
            seen.extend(page.items.iter().map(|e| e.id.to_string()));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        let unique: BTreeSet<String> = seen.iter().cloned().collect();
        prop_assert_eq!(unique.len(), seen.len());
        prop_assert_eq!(unique, expected);
    });
}

#[test]
fn prop_label_filter_is_conjunctive() {
    proptest!(|(rows in prop::collection::vec(entry_strategy(), 1..30))| {
        let index = build_index(&rows);
        let page = index
            .search(&SearchQuery::new().label("a").label("b").limit(100))
            .unwrap();

        for entry in &page.items {
            prop_assert!(entry.labels.contains("a") && entry.labels.contains("b"));
        }
        let matching = rows
            .iter()
            .filter(|(_, l)| l.contains("a") && l.contains("b"))
            .count();
        prop_assert_eq!(page.items.len(), matching);
    });
}
