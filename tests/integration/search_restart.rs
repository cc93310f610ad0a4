#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use stree::primitives::pager::{BlockCache, Pager, PagerOptions};
use stree::primitives::wal::MemJournal;
use stree::storage::tree::node::NodeView;
use stree::storage::tree::{Item, Key, KeyType, KeyVersion, STree};
use stree::storage::TreeOptions;
use stree::types::{BlockId, Result, StreeError};

struct Fixture {
    pager: Arc<Pager>,
    tree: Arc<STree>,
}

fn fixture(options: TreeOptions) -> Result<Fixture> {
    let pager = Arc::new(Pager::new(PagerOptions {
        block_size: 512,
        capacity_blocks: 1024,
    })?);
    let cache: Arc<dyn BlockCache> = pager.clone();
    let journal = Arc::new(MemJournal::new(Arc::clone(&cache)));
    let tree = STree::builder(cache, journal).options(options).create()?;
    Ok(Fixture {
        pager,
        tree: Arc::new(tree),
    })
}

fn key(object_id: u32) -> Key {
    Key::new(1, object_id, 1, KeyType::Direct, KeyVersion::V2)
}

fn item(object_id: u32) -> Result<Item> {
    Item::new(key(object_id), 0, vec![object_id as u8; 40])
}

fn seed(tree: &STree, count: u32) -> Result<Vec<Key>> {
    let mut txn = tree.begin()?;
    let mut keys = Vec::new();
    for i in 1..=count {
        tree.insert(&mut txn, &item(i * 10)?)?;
        keys.push(key(i * 10));
    }
    tree.end(txn)?;
    Ok(keys)
}

/// A key that is not the first item of its leaf, with that leaf's id.
fn pick_target(tree: &STree, keys: &[Key]) -> Result<(Key, BlockId)> {
    for candidate in &keys[keys.len() / 2..] {
        let (path, pos) = tree.search_item(candidate)?;
        if pos.is_found() && pos.index() > 0 {
            return Ok((*candidate, path.leaf()?.id()));
        }
    }
    Err(StreeError::NotFound)
}

fn leaf_keys(pager: &Pager, leaf: BlockId) -> Result<Vec<Key>> {
    let block = pager.pin(leaf)?;
    let data = block.data();
    let view = NodeView::new(&data)?;
    (0..view.nr_items()).map(|i| view.key(i)).collect()
}

/// Runs `action` once, from inside the next load of `target`.
fn mutate_on_load<F>(fx: &Fixture, target: BlockId, action: F) -> Arc<AtomicBool>
where
    F: Fn(&STree) -> Result<()> + Send + Sync + 'static,
{
    let armed = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&armed);
    let weak = Arc::downgrade(&fx.tree);
    fx.pager.set_load_hook(Some(Arc::new(move |id| {
        if id != target || !flag.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(tree) = weak.upgrade() {
            action(&tree).expect("mutation during load");
        }
    })));
    armed
}

#[test]
fn split_during_load_restarts_and_finds_the_moved_item() -> Result<()> {
    let fx = fixture(TreeOptions::default())?;
    let keys = seed(&fx.tree, 100)?;
    assert!(fx.tree.root().height >= 2);
    let (target, leaf) = pick_target(&fx.tree, &keys)?;
    let object = target.object_id;
    let before = fx.tree.stats().restarts();

    let armed = mutate_on_load(&fx, leaf, move |tree| {
        let mut txn = tree.begin()?;
        for id in object - 9..=object - 3 {
            tree.insert(&mut txn, &item(id)?)?;
        }
        tree.end(txn)
    });
    let (path, pos) = fx.tree.search_item(&target)?;
    assert!(!armed.load(Ordering::SeqCst));
    assert!(pos.is_found());
    assert_ne!(path.leaf()?.id(), leaf);
    assert_eq!(path.item_head()?.key.object_id, object);
    drop(path);

    assert!(fx.tree.stats().restarts() > before);
    fx.pager.set_load_hook(None);
    assert_eq!(fx.pager.pinned(), 0);
    Ok(())
}

#[test]
fn change_inside_the_bounds_needs_no_restart() -> Result<()> {
    let fx = fixture(TreeOptions::default())?;
    let keys = seed(&fx.tree, 100)?;
    let (target, leaf) = pick_target(&fx.tree, &keys)?;
    let before = fx.tree.stats().restarts();

    mutate_on_load(&fx, leaf, move |tree| {
        let mut txn = tree.begin()?;
        tree.delete(&mut txn, &target)?;
        tree.end(txn)
    });
    let (path, pos) = fx.tree.search_item(&target)?;
    assert!(!pos.is_found());
    assert_eq!(path.leaf()?.id(), leaf);
    drop(path);

    assert_eq!(fx.tree.stats().restarts(), before);
    fx.pager.set_load_hook(None);
    assert_eq!(fx.pager.pinned(), 0);
    Ok(())
}

#[test]
fn emptied_leaf_restarts_from_the_root() -> Result<()> {
    let fx = fixture(TreeOptions::default())?;
    let keys = seed(&fx.tree, 100)?;
    let (target, leaf) = pick_target(&fx.tree, &keys)?;
    let doomed = leaf_keys(&fx.pager, leaf)?;
    let before = fx.tree.stats().restarts();

    let victims = doomed.clone();
    mutate_on_load(&fx, leaf, move |tree| {
        let mut txn = tree.begin()?;
        for key in &victims {
            tree.delete(&mut txn, key)?;
        }
        tree.end(txn)
    });
    let (path, pos) = fx.tree.search_item(&target)?;
    assert!(!pos.is_found());
    assert_ne!(path.leaf()?.id(), leaf);
    drop(path);

    assert!(fx.tree.stats().restarts() > before);
    assert!(!fx.pager.is_allocated(leaf));
    fx.pager.set_load_hook(None);
    for key in &keys {
        let (_, pos) = fx.tree.search_item(key)?;
        assert_eq!(pos.is_found(), !doomed.contains(key), "{key}");
    }
    assert_eq!(fx.pager.pinned(), 0);
    Ok(())
}

#[test]
fn node_that_keeps_leaving_the_tree_exhausts_the_restart_budget() -> Result<()> {
    let fx = fixture(TreeOptions {
        max_restarts: 3,
        ..TreeOptions::default()
    })?;
    let keys = seed(&fx.tree, 100)?;
    let (target, leaf) = pick_target(&fx.tree, &keys)?;
    let held = fx.pager.pin(leaf)?;
    let before = fx.tree.stats().restarts();

    let detached = held.clone();
    let weak = Arc::downgrade(&fx.tree);
    fx.pager.set_load_hook(Some(Arc::new(move |id| {
        if id != leaf {
            return;
        }
        detached.set_in_tree(false);
        if let Some(tree) = weak.upgrade() {
            tree.context().generation().bump();
        }
    })));

    let result = fx.tree.search_item(&target);
    assert!(matches!(result, Err(StreeError::Busy { block }) if block == leaf));
    assert_eq!(fx.tree.stats().restarts() - before, 4);

    fx.pager.set_load_hook(None);
    held.set_in_tree(true);
    drop(held);
    let (path, pos) = fx.tree.search_item(&target)?;
    assert!(pos.is_found());
    drop(path);
    assert_eq!(fx.pager.pinned(), 0);
    Ok(())
}

#[test]
fn readers_never_miss_settled_keys_while_leaves_split_and_empty() -> Result<()> {
    let fx = fixture(TreeOptions {
        max_restarts: 100_000,
        ..TreeOptions::default()
    })?;
    let settled = seed(&fx.tree, 60)?;
    let transient: Vec<Item> = (0..60).map(|i| item(i * 10 + 5)).collect::<Result<_>>()?;
    let stop = AtomicBool::new(false);

    let searches = std::thread::scope(|scope| -> Result<u64> {
        let readers: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(|| -> Result<u64> {
                    let mut searches = 0;
                    loop {
                        for key in &settled {
                            let (_, pos) = fx.tree.search_item(key)?;
                            if !pos.is_found() {
                                return Err(StreeError::NotFound);
                            }
                            searches += 1;
                        }
                        if stop.load(Ordering::Acquire) {
                            return Ok(searches);
                        }
                    }
                })
            })
            .collect();

        let churn = (|| -> Result<()> {
            for _ in 0..40 {
                let mut txn = fx.tree.begin()?;
                for item in &transient {
                    fx.tree.insert(&mut txn, item)?;
                }
                fx.tree.end(txn)?;
                let mut txn = fx.tree.begin()?;
                for item in &transient {
                    fx.tree.delete(&mut txn, &item.head.key)?;
                }
                fx.tree.end(txn)?;
            }
            Ok(())
        })();
        stop.store(true, Ordering::Release);
        let mut total = 0;
        for reader in readers {
            total += reader.join().expect("reader thread")?;
        }
        churn.map(|()| total)
    })?;

    assert!(searches > 0);
    assert!(fx.tree.context().generation().snapshot().is_stable());
    assert_eq!(fx.pager.pinned(), 0);
    Ok(())
}
