#![allow(missing_docs)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use stree::primitives::pager::{BlockCache, Pager, PagerOptions};
use stree::primitives::wal::MemJournal;
use stree::storage::tree::node::{max_item_len, SearchPos};
use stree::storage::tree::{
    EntrySearch, Item, ItemHead, Key, KeyLen, KeyType, KeyVersion, OffsetEntrySearch, STree,
};
use stree::storage::{FileObject, TreeOptions};
use stree::types::{Result, StreeError};

fn fixture(block_size: u32) -> Result<(Arc<Pager>, STree)> {
    let pager = Arc::new(Pager::new(PagerOptions {
        block_size,
        capacity_blocks: 4096,
    })?);
    let cache: Arc<dyn BlockCache> = pager.clone();
    let journal = Arc::new(MemJournal::new(Arc::clone(&cache)));
    let tree = STree::builder(cache, journal)
        .options(TreeOptions::default())
        .create()?;
    Ok((pager, tree))
}

fn items_of(tree: &STree, object: &FileObject) -> Result<Vec<Item>> {
    let mut items = Vec::new();
    let mut cursor = object.key;
    while let Some(item) = tree.next_item(&cursor)? {
        if !item.head.key.same_object(&object.key) {
            break;
        }
        cursor = item.head.key;
        items.push(item);
    }
    Ok(items)
}

/// Keys and bodies; item locations inside a leaf move with its neighbours.
fn contents_of(tree: &STree, object: &FileObject) -> Result<Vec<(Key, Vec<u8>)>> {
    Ok(items_of(tree, object)?
        .into_iter()
        .map(|item| (item.head.key, item.body))
        .collect())
}

#[test]
fn insert_rejects_partial_and_wildcard_keys() -> Result<()> {
    let (_pager, tree) = fixture(1024)?;
    let key = Key::new(1, 5, 1, KeyType::Direct, KeyVersion::V2);
    let mut txn = tree.begin()?;
    let short = Item::new(key.with_len(KeyLen::Three), 0, vec![1; 4])?;
    assert!(matches!(tree.insert(&mut txn, &short), Err(StreeError::Invalid(_))));
    let wildcard = Item::new(key.with_kind(KeyType::Any), 0, vec![1; 4])?;
    assert!(matches!(tree.insert(&mut txn, &wildcard), Err(StreeError::Invalid(_))));
    tree.end(txn)
}

#[test]
fn paste_extends_only_the_item_end() -> Result<()> {
    let (pager, tree) = fixture(1024)?;
    let key = Key::new(1, 50, 1, KeyType::Direct, KeyVersion::V2);
    let mut txn = tree.begin()?;
    tree.insert(&mut txn, &Item::new(key, 0, vec![1; 10])?)?;
    tree.paste(&mut txn, &key.with_offset(11), &[2; 10])?;

    assert!(matches!(tree.paste(&mut txn, &key.with_offset(5), &[3]), Err(StreeError::Duplicate)));
    assert!(matches!(tree.paste(&mut txn, &key.with_offset(40), &[3]), Err(StreeError::Invalid(_))));
    let stranger = Key::new(1, 49, 1, KeyType::Direct, KeyVersion::V2);
    assert!(matches!(tree.paste(&mut txn, &stranger, &[3]), Err(StreeError::NotFound)));
    let as_pointer = key.with_offset(21).with_kind(KeyType::Indirect);
    assert!(matches!(tree.paste(&mut txn, &as_pointer, &[0; 4]), Err(StreeError::Invalid(_))));
    let oversized = vec![0; max_item_len(1024)];
    assert!(matches!(tree.paste(&mut txn, &key.with_offset(21), &oversized), Err(StreeError::OutOfSpace)));
    tree.end(txn)?;

    let item = tree
        .next_item(&Key::stat_data(1, 50, KeyVersion::V2))?
        .expect("pasted item");
    assert_eq!(item.head.key.offset, 1);
    assert_eq!(item.body.len(), 20);
    assert_eq!(&item.body[..10], &[1u8; 10]);
    assert_eq!(&item.body[10..], &[2u8; 10]);
    assert_eq!(pager.pinned(), 0);
    Ok(())
}

#[test]
fn removing_one_object_leaves_its_neighbours_alone() -> Result<()> {
    let (pager, tree) = fixture(512)?;
    let mut files = Vec::new();
    for object_id in 10..16 {
        let mut file = tree.create_object(Key::stat_data(1, object_id, KeyVersion::V2))?;
        for block in 0..3u8 {
            tree.append_block(&mut file, &[block + object_id as u8; 512])?;
        }
        tree.write_tail(&mut file, &vec![object_id as u8; 100])?;
        files.push(file);
    }
    let before: Vec<Vec<(Key, Vec<u8>)>> = files
        .iter()
        .map(|file| contents_of(&tree, file))
        .collect::<Result<_>>()?;

    let victim = files.remove(2);
    let victim_key = victim.key;
    tree.delete_object(victim)?;
    assert!(matches!(tree.load_object(&victim_key), Err(StreeError::NotFound)));

    let mut expected = before;
    expected.remove(2);
    for (file, items) in files.iter().zip(&expected) {
        assert_eq!(&contents_of(&tree, file)?, items);
        let loaded = tree.load_object(&file.key)?;
        assert_eq!(loaded.size(), 3 * 512 + 100);
        assert_eq!(loaded.stat.blocks, 3);
    }
    assert_eq!(pager.pinned(), 0);
    Ok(())
}

#[test]
fn cut_trims_a_v1_direct_item() -> Result<()> {
    let (_pager, tree) = fixture(1024)?;
    let mut file = tree.create_object(Key::stat_data(1, 60, KeyVersion::V1))?;
    tree.write_tail(&mut file, &[5; 600])?;

    let key = file.item_key(KeyType::Direct, 600).with_len(KeyLen::Three);
    let mut txn = tree.begin()?;
    assert_eq!(tree.cut(&mut txn, &file, &key, 100)?, 500);
    tree.end(txn)?;

    let items = items_of(&tree, &file)?;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].body, vec![5u8; 100]);
    Ok(())
}

#[test]
fn directory_entries_round_trip() -> Result<()> {
    let (_pager, tree) = fixture(4096)?;
    let root = Key::stat_data(0, 1, KeyVersion::V2);
    let mut dir = tree.create_directory(Key::stat_data(1, 300, KeyVersion::V2), &root)?;
    for i in 0..24u32 {
        let name = format!("file-{i:02}.log");
        let target = Key::stat_data(300, 400 + i, KeyVersion::V2);
        tree.add_entry(&mut dir, name.as_bytes(), &target)?;
    }

    let entries = tree.list_entries(&dir)?;
    assert_eq!(entries.len(), 26);
    assert_eq!(entries[0].name, b".");
    assert_eq!(entries[1].name, b"..");
    assert_eq!(entries[1].object_id, root.object_id);
    assert!(entries.windows(2).all(|pair| pair[0].offset < pair[1].offset));

    let found = tree.find_entry(&dir, b"file-07.log")?.expect("entry");
    assert_eq!(found.object_id, 407);
    let target = Key::stat_data(300, 999, KeyVersion::V2);
    assert!(matches!(tree.add_entry(&mut dir, b"file-07.log", &target), Err(StreeError::Duplicate)));
    assert!(matches!(tree.add_entry(&mut dir, b"..", &target), Err(StreeError::Invalid(_))));
    assert!(matches!(tree.remove_entry(&mut dir, b".."), Err(StreeError::Invalid(_))));

    let removed = tree.remove_entry(&mut dir, b"file-07.log")?;
    assert_eq!(removed, found);
    assert!(tree.find_entry(&dir, b"file-07.log")?.is_none());
    assert!(matches!(tree.remove_entry(&mut dir, b"file-07.log"), Err(StreeError::NotFound)));
    assert_eq!(tree.list_entries(&dir)?.len(), 25);
    assert_eq!(tree.load_object(&dir.key)?.size(), dir.size());
    Ok(())
}

#[test]
fn stat_data_survives_a_reload() -> Result<()> {
    let (_pager, tree) = fixture(1024)?;
    let mut file = tree.create_object(Key::stat_data(1, 70, KeyVersion::V2))?;
    tree.append_block(&mut file, &[1; 1024])?;
    file.stat.uid = 1000;
    file.stat.gid = 100;
    let mut txn = tree.begin()?;
    tree.update_stat_data(&mut txn, &file)?;
    tree.end(txn)?;

    let loaded = tree.load_object(&file.key)?;
    assert_eq!(loaded.stat, file.stat);
    assert!(!loaded.is_dir());
    assert!(matches!(
        tree.create_object(Key::stat_data(1, 70, KeyVersion::V2)),
        Err(StreeError::Duplicate)
    ));
    Ok(())
}

/// Counts lookups and delegates to the offset search.
#[derive(Default)]
struct CountingEntrySearch {
    calls: AtomicUsize,
}

impl EntrySearch for CountingEntrySearch {
    fn locate(&self, head: &ItemHead, body: &[u8], key: &Key) -> Result<SearchPos> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        OffsetEntrySearch.locate(head, body, key)
    }
}

#[test]
fn entry_lookups_go_through_the_configured_search() -> Result<()> {
    let pager = Arc::new(Pager::new(PagerOptions {
        block_size: 4096,
        capacity_blocks: 64,
    })?);
    let cache: Arc<dyn BlockCache> = pager.clone();
    let journal = Arc::new(MemJournal::new(Arc::clone(&cache)));
    let entries = Arc::new(CountingEntrySearch::default());
    let tree = STree::builder(cache, journal)
        .entry_search(entries.clone())
        .create()?;

    let root = Key::stat_data(0, 1, KeyVersion::V2);
    let mut dir = tree.create_directory(Key::stat_data(1, 500, KeyVersion::V2), &root)?;
    tree.add_entry(&mut dir, b"a.txt", &Key::stat_data(500, 501, KeyVersion::V2))?;
    let before = entries.calls.load(Ordering::SeqCst);
    assert!(tree.find_entry(&dir, b"a.txt")?.is_some());
    tree.remove_entry(&mut dir, b"a.txt")?;
    assert!(entries.calls.load(Ordering::SeqCst) > before);
    Ok(())
}
