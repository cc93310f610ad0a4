#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use stree::primitives::pager::{BlockCache, Pager, PagerOptions};
use stree::primitives::wal::{MemJournal, Transaction};
use stree::storage::tree::{
    BalanceOp, Balanced, Balancer, Item, Key, KeyType, KeyVersion, STree, SimpleBalancer,
    TreeContext, TreePath,
};
use stree::storage::{FileObject, PageSource, TailPolicy, TreeOptions};
use stree::types::{BlockId, Result, StreeError};

const BLOCK: usize = 1024;

struct Fixture {
    pager: Arc<Pager>,
    journal: Arc<MemJournal>,
    tree: STree,
}

fn fixture(options: TreeOptions) -> Result<Fixture> {
    build(options, None)
}

fn build(options: TreeOptions, balancer: Option<Arc<dyn Balancer>>) -> Result<Fixture> {
    let pager = Arc::new(Pager::new(PagerOptions {
        block_size: BLOCK as u32,
        capacity_blocks: 4096,
    })?);
    let cache: Arc<dyn BlockCache> = pager.clone();
    let journal = Arc::new(MemJournal::new(Arc::clone(&cache)));
    let mut builder = STree::builder(cache, journal.clone()).options(options);
    if let Some(balancer) = balancer {
        builder = builder.balancer(balancer);
    }
    Ok(Fixture {
        pager,
        journal,
        tree: builder.create()?,
    })
}

fn pattern(block: usize) -> Vec<u8> {
    (0..BLOCK).map(|i| (block * 31 + i * 7) as u8).collect()
}

/// Creates a file of `blocks` full blocks and returns it with its content
/// and the blocks holding it.
fn file_with_blocks(
    tree: &STree,
    version: KeyVersion,
    object_id: u32,
    blocks: usize,
) -> Result<(FileObject, Vec<u8>, Vec<BlockId>)> {
    let mut file = tree.create_object(Key::stat_data(1, object_id, version))?;
    let mut content = Vec::new();
    let mut ids = Vec::new();
    for block in 0..blocks {
        let data = pattern(block);
        ids.push(tree.append_block(&mut file, &data)?);
        content.extend_from_slice(&data);
    }
    Ok((file, content, ids))
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

#[test]
fn v1_file_shrinks_into_a_direct_tail() -> Result<()> {
    let fx = fixture(TreeOptions::default())?;
    let (mut file, original, _) = file_with_blocks(&fx.tree, KeyVersion::V1, 100, 10)?;
    let allocated = fx.pager.stats().allocated;

    let report = fx.tree.truncate(&mut file, 50, true)?;
    assert!(report.converted);
    assert_eq!(report.bytes_removed, 10 * BLOCK as u64 - 50);

    let items = items_of(&fx.tree, &file)?;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].head.kind(), KeyType::Direct);
    assert_eq!(items[0].head.key.offset, 1);
    assert_eq!(items[0].body, original[..50]);

    assert_eq!(file.size(), 50);
    assert_eq!(fx.tree.load_object(&file.key)?.size(), 50);
    assert_eq!(fx.tree.read_content(&file)?, original[..50]);
    assert_eq!(fx.pager.stats().allocated, allocated - 10);
    assert_eq!(fx.tree.stats().conversions(), 1);
    assert_eq!(fx.journal.open_units(), 0);
    assert_eq!(fx.pager.pinned(), 0);
    Ok(())
}

#[test]
fn repeating_a_truncate_changes_nothing() -> Result<()> {
    let fx = fixture(TreeOptions::default())?;
    let (mut file, _, _) = file_with_blocks(&fx.tree, KeyVersion::V1, 100, 10)?;
    fx.tree.truncate(&mut file, 50, false)?;
    let items = items_of(&fx.tree, &file)?;
    let generation = fx.tree.context().generation().snapshot();

    let report = fx.tree.truncate(&mut file, 50, false)?;
    assert_eq!(report.bytes_removed, 0);
    assert!(!report.converted);
    assert_eq!(fx.tree.context().generation().snapshot(), generation);
    assert_eq!(items_of(&fx.tree, &file)?, items);
    assert_eq!(fx.tree.stats().conversions(), 1);
    Ok(())
}

#[test]
fn truncating_to_the_current_aligned_size_removes_nothing() -> Result<()> {
    let fx = fixture(TreeOptions::default())?;
    for (object_id, version) in [(110, KeyVersion::V1), (111, KeyVersion::V2)] {
        let (mut file, original, blocks) = file_with_blocks(&fx.tree, version, object_id, 2)?;
        let items = items_of(&fx.tree, &file)?;
        let generation = fx.tree.context().generation().snapshot();

        let report = fx.tree.truncate(&mut file, 2 * BLOCK as u64, false)?;
        assert_eq!(report.bytes_removed, 0);
        assert_eq!(report.cuts, 0);
        assert!(!report.converted);
        assert_eq!(fx.tree.context().generation().snapshot(), generation);
        assert_eq!(items_of(&fx.tree, &file)?, items);
        assert!(blocks.iter().all(|block| fx.pager.is_allocated(*block)));
        assert_eq!(file.size(), 2 * BLOCK as u64);
        assert_eq!(fx.tree.read_content(&file)?, original);
    }
    assert_eq!(fx.tree.stats().conversions(), 0);
    Ok(())
}

#[test]
fn v2_file_stops_at_the_block_boundary() -> Result<()> {
    let fx = fixture(TreeOptions::default())?;
    let (mut file, original, blocks) = file_with_blocks(&fx.tree, KeyVersion::V2, 101, 3)?;

    let report = fx.tree.truncate(&mut file, 1500, false)?;
    assert!(!report.converted);
    assert_eq!(report.bytes_removed, BLOCK as u64);

    let items = items_of(&fx.tree, &file)?;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].head.kind(), KeyType::Indirect);
    assert_eq!(items[0].head.pointer_count(), 2);
    assert!(!fx.pager.is_allocated(blocks[2]));
    assert_eq!(fx.tree.read_content(&file)?, original[..1500]);
    Ok(())
}

#[test]
fn v1_file_packs_the_tail_past_the_last_full_block() -> Result<()> {
    let fx = fixture(TreeOptions::default())?;
    let (mut file, original, blocks) = file_with_blocks(&fx.tree, KeyVersion::V1, 102, 3)?;

    let report = fx.tree.truncate(&mut file, 1500, false)?;
    assert!(report.converted);
    assert_eq!(report.bytes_removed, 3 * BLOCK as u64 - 1500);

    let items = items_of(&fx.tree, &file)?;
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].head.kind(), KeyType::Indirect);
    assert_eq!(items[0].head.pointer_count(), 1);
    assert_eq!(items[1].head.kind(), KeyType::Direct);
    assert_eq!(items[1].head.key.offset, BLOCK as u64 + 1);
    assert_eq!(items[1].body, original[BLOCK..1500]);
    assert!(fx.pager.is_allocated(blocks[0]));
    assert!(!fx.pager.is_allocated(blocks[1]));
    assert_eq!(fx.tree.read_content(&file)?, original[..1500]);
    Ok(())
}

#[test]
fn v2_direct_tail_is_removed_whole_before_the_blocks() -> Result<()> {
    let fx = fixture(TreeOptions::default())?;
    let (mut file, mut original, _) = file_with_blocks(&fx.tree, KeyVersion::V2, 103, 2)?;
    let tail = vec![0xAB; 300];
    fx.tree.write_tail(&mut file, &tail)?;
    original.extend_from_slice(&tail);
    assert_eq!(fx.tree.read_content(&file)?, original);

    let report = fx.tree.truncate(&mut file, 100, false)?;
    assert_eq!(report.cuts, 2);
    assert_eq!(report.bytes_removed, 300 + BLOCK as u64);
    let items = items_of(&fx.tree, &file)?;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].head.kind(), KeyType::Indirect);
    assert_eq!(fx.tree.read_content(&file)?, original[..100]);
    Ok(())
}

/// Refuses to remove indirect items or pointers while armed.
struct FailingPointerRemoval {
    inner: SimpleBalancer,
    armed: AtomicBool,
}

impl Balancer for FailingPointerRemoval {
    fn balance(
        &self,
        ctx: &TreeContext,
        txn: &mut Transaction,
        path: &TreePath,
        op: BalanceOp<'_>,
    ) -> Result<Balanced> {
        let removes = matches!(op, BalanceOp::Delete | BalanceOp::Cut { .. });
        if self.armed.load(Ordering::SeqCst)
            && removes
            && path.item_head()?.kind() == KeyType::Indirect
        {
            return Err(StreeError::OutOfSpace);
        }
        self.inner.balance(ctx, txn, path, op)
    }
}

#[test]
fn failed_pointer_removal_rolls_the_conversion_back() -> Result<()> {
    let balancer = Arc::new(FailingPointerRemoval {
        inner: SimpleBalancer::new(),
        armed: AtomicBool::new(true),
    });
    let fx = build(TreeOptions::default(), Some(balancer.clone()))?;
    let (mut file, original, _) = file_with_blocks(&fx.tree, KeyVersion::V1, 104, 1)?;

    let result = fx.tree.truncate(&mut file, 50, false);
    assert!(matches!(result, Err(StreeError::OutOfSpace)));
    assert_eq!(fx.tree.stats().conversions(), 1);
    assert_eq!(fx.tree.stats().rollbacks(), 1);

    let items = items_of(&fx.tree, &file)?;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].head.kind(), KeyType::Indirect);
    assert_eq!(items[0].head.pointer_count(), 1);
    assert_eq!(file.size(), BLOCK as u64);
    assert_eq!(fx.tree.read_content(&file)?, original);
    assert_eq!(fx.journal.open_units(), 0);
    assert_eq!(fx.pager.pinned(), 0);

    balancer.armed.store(false, Ordering::SeqCst);
    let report = fx.tree.truncate(&mut file, 50, false)?;
    assert!(report.converted);
    assert_eq!(fx.tree.read_content(&file)?, original[..50]);
    Ok(())
}

#[test]
fn long_truncate_is_split_into_checkpointed_units() -> Result<()> {
    let fx = fixture(TreeOptions::default().truncate_checkpoint_blocks(4))?;
    let (mut file, _, blocks) = file_with_blocks(&fx.tree, KeyVersion::V1, 105, 40)?;
    let ended = fx.journal.stats().ended;

    let report = fx.tree.truncate(&mut file, 0, false)?;
    assert_eq!(report.cuts, 10);
    assert_eq!(report.checkpoints, 10);
    assert_eq!(report.bytes_removed, 40 * BLOCK as u64);
    assert_eq!(fx.journal.stats().ended - ended, u64::from(report.checkpoints) + 1);

    let units = fx.journal.committed();
    let freed: usize = units.iter().map(|unit| unit.freed.len()).sum();
    assert_eq!(freed, 40);
    assert!(units.iter().all(|unit| unit.freed.len() <= 4));
    assert!(blocks.iter().all(|&id| !fx.pager.is_allocated(id)));
    assert!(items_of(&fx.tree, &file)?.is_empty());
    assert_eq!(fx.tree.load_object(&file.key)?.size(), 0);
    Ok(())
}

#[test]
fn busy_last_block_stops_the_truncate() -> Result<()> {
    let fx = fixture(TreeOptions {
        busy_retry_limit: 2,
        busy_backoff_us: 0,
        ..TreeOptions::default()
    })?;
    let (mut file, _, blocks) = file_with_blocks(&fx.tree, KeyVersion::V1, 106, 3)?;
    fx.pager.lock_block(blocks[2])?;

    let result = fx.tree.truncate(&mut file, 0, false);
    assert!(matches!(result, Err(StreeError::Busy { block }) if block == blocks[2]));
    assert_eq!(fx.tree.stats().busy_waits(), 2);
    assert!(blocks.iter().all(|&id| fx.pager.is_allocated(id)));
    assert_eq!(fx.journal.open_units(), 0);

    fx.pager.unlock_block(blocks[2])?;
    fx.tree.truncate(&mut file, 0, false)?;
    assert!(items_of(&fx.tree, &file)?.is_empty());
    Ok(())
}

#[test]
fn shared_or_unreadable_tails_stay_in_their_block() -> Result<()> {
    let fx = fixture(TreeOptions::default())?;

    let (mut shared, original, blocks) = file_with_blocks(&fx.tree, KeyVersion::V1, 107, 1)?;
    shared.handle_count = 2;
    let report = fx.tree.truncate(&mut shared, 50, false)?;
    assert!(!report.converted);
    assert!(fx.pager.is_allocated(blocks[0]));
    assert_eq!(items_of(&fx.tree, &shared)?[0].head.kind(), KeyType::Indirect);
    assert_eq!(fx.tree.read_content(&shared)?, original[..50]);

    let (mut unreadable, original, blocks) = file_with_blocks(&fx.tree, KeyVersion::V1, 108, 1)?;
    fx.pager.fail_reads(blocks[0], true);
    let report = fx.tree.truncate(&mut unreadable, 50, false)?;
    fx.pager.fail_reads(blocks[0], false);
    assert!(!report.converted);
    assert_eq!(fx.tree.read_content(&unreadable)?, original[..50]);
    assert_eq!(fx.tree.stats().conversions(), 0);
    Ok(())
}

/// Serves pages from a fixed image instead of the cache.
struct FixedPages {
    page: Vec<u8>,
    calls: AtomicUsize,
}

impl PageSource for FixedPages {
    fn page(&self, _object: &FileObject, _block: BlockId) -> Result<Option<Vec<u8>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some(self.page.clone()))
    }
}

#[test]
fn tail_bytes_come_from_the_page_source() -> Result<()> {
    let pager = Arc::new(Pager::new(PagerOptions {
        block_size: BLOCK as u32,
        capacity_blocks: 256,
    })?);
    let cache: Arc<dyn BlockCache> = pager.clone();
    let journal = Arc::new(MemJournal::new(Arc::clone(&cache)));
    let pages = Arc::new(FixedPages {
        page: vec![0x5a; BLOCK],
        calls: AtomicUsize::new(0),
    });
    let tree = STree::builder(cache, journal)
        .page_source(pages.clone())
        .create()?;

    let (mut file, _, blocks) = file_with_blocks(&tree, KeyVersion::V1, 110, 1)?;
    let report = tree.truncate(&mut file, 40, false)?;
    assert!(report.converted);
    assert_eq!(pages.calls.load(Ordering::SeqCst), 1);
    assert!(!pager.is_allocated(blocks[0]));
    assert_eq!(tree.read_content(&file)?, vec![0x5a; 40]);
    Ok(())
}

#[test]
fn never_policy_keeps_tails_in_blocks() -> Result<()> {
    let fx = fixture(TreeOptions::default().tail_policy(TailPolicy::Never))?;
    let (mut file, original, _) = file_with_blocks(&fx.tree, KeyVersion::V1, 109, 2)?;
    let report = fx.tree.truncate(&mut file, 1100, false)?;
    assert!(!report.converted);
    let items = items_of(&fx.tree, &file)?;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].head.pointer_count(), 2);
    assert_eq!(fx.tree.read_content(&file)?, original[..1100]);
    Ok(())
}

#[test]
fn directories_truncate_only_when_empty() -> Result<()> {
    let fx = fixture(TreeOptions::default())?;
    let root = Key::stat_data(0, 1, KeyVersion::V2);
    let mut dir = fx.tree.create_directory(Key::stat_data(1, 200, KeyVersion::V2), &root)?;
    let child = Key::stat_data(200, 201, KeyVersion::V2);
    fx.tree.add_entry(&mut dir, b"notes.txt", &child)?;

    let result = fx.tree.truncate(&mut dir, 0, false);
    assert!(matches!(result, Err(StreeError::Invalid(_))));
    assert_eq!(fx.tree.list_entries(&dir)?.len(), 3);

    fx.tree.remove_entry(&mut dir, b"notes.txt")?;
    let report = fx.tree.truncate(&mut dir, 0, false)?;
    assert_eq!(report.cuts, 1);
    assert!(fx.tree.list_entries(&dir)?.is_empty());

    let again = fx.tree.truncate(&mut dir, 0, false)?;
    assert_eq!(again.cuts, 0);

    let key = dir.key;
    fx.tree.delete_object(dir)?;
    assert!(matches!(fx.tree.load_object(&key), Err(StreeError::NotFound)));
    Ok(())
}

#[test]
fn deleting_a_file_frees_every_block() -> Result<()> {
    let fx = fixture(TreeOptions::default())?;
    let baseline = fx.pager.stats().allocated;
    let (mut file, _, _) = file_with_blocks(&fx.tree, KeyVersion::V2, 110, 5)?;
    fx.tree.write_tail(&mut file, &[7; 200])?;
    let key = file.key;

    fx.tree.delete_object(file)?;
    assert!(matches!(fx.tree.load_object(&key), Err(StreeError::NotFound)));
    assert_eq!(fx.pager.stats().allocated, baseline);
    assert_eq!(fx.pager.pinned(), 0);
    Ok(())
}
