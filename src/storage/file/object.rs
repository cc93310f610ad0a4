use tracing::{debug, info};

use super::stat::{StatData, S_IFDIR, S_IFREG};
use super::tail::max_direct_item_len;
use crate::primitives::pager::FrameUse;
use crate::primitives::wal::Transaction;
use crate::storage::tree::entry::{decode_entries, encode_entries, name_hash, MAX_GENERATION};
use crate::storage::tree::item::{decode_pointers, encode_pointers, UNFM_P_SIZE};
use crate::storage::tree::key::{DOT_DOT_OFFSET, DOT_OFFSET};
use crate::storage::tree::node::{max_item_len, NodeView};
use crate::storage::tree::{DirEntry, Item, Key, KeyType, KeyVersion, PositionResult, STree};
use crate::types::{BlockId, Result, StreeError};

/// An open file or directory: its stat-data key plus the in-memory copy of
/// its metadata.
#[derive(Clone, Debug)]
pub struct FileObject {
    /// Stat-data key; its version is the object's item version.
    pub key: Key,
    /// Metadata as last loaded or written.
    pub stat: StatData,
    /// Open handles. Tail packing needs exactly one.
    pub handle_count: u32,
    /// Keeps tails in unformatted blocks regardless of policy.
    pub nopack: bool,
}

impl FileObject {
    fn new(key: Key, stat: StatData) -> Self {
        Self {
            key,
            stat,
            handle_count: 1,
            nopack: false,
        }
    }

    /// Item key version.
    pub fn version(&self) -> KeyVersion {
        self.key.version
    }

    /// Returns `true` for directories.
    pub fn is_dir(&self) -> bool {
        self.stat.is_dir()
    }

    /// Logical size in bytes.
    pub fn size(&self) -> u64 {
        self.stat.size
    }

    /// Key of an item of this object.
    pub fn item_key(&self, kind: KeyType, offset: u64) -> Key {
        Key::new(self.key.dir_id, self.key.object_id, offset, kind, self.key.version)
    }
}

impl STree {
    /// Creates an empty regular file whose stat-data key is `key`.
    pub fn create_object(&self, key: Key) -> Result<FileObject> {
        let object = FileObject::new(stat_key(key)?, StatData::new(S_IFREG | 0o644));
        self.with_unit(|txn| self.insert_stat_data(txn, &object))?;
        info!(target: "stree::tree", object = %object.key, "created file");
        Ok(object)
    }

    /// Creates a directory holding `.` and `..`; `parent` is the stat-data
    /// key of the directory above it.
    pub fn create_directory(&self, key: Key, parent: &Key) -> Result<FileObject> {
        let mut object = FileObject::new(stat_key(key)?, StatData::new(S_IFDIR | 0o755));
        object.stat.nlink = 2;
        let entries = [
            DirEntry {
                offset: DOT_OFFSET as u32,
                dir_id: object.key.dir_id,
                object_id: object.key.object_id,
                name: b".".to_vec(),
            },
            DirEntry {
                offset: DOT_DOT_OFFSET as u32,
                dir_id: parent.dir_id,
                object_id: parent.object_id,
                name: b"..".to_vec(),
            },
        ];
        let body = encode_entries(&entries)?;
        object.stat.size = body.len() as u64;
        let item = Item::new(object.item_key(KeyType::DirEntry, DOT_OFFSET), 2, body)?;
        self.with_unit(|txn| {
            self.insert_stat_data(txn, &object)?;
            self.insert(txn, &item)
        })?;
        info!(target: "stree::tree", object = %object.key, "created directory");
        Ok(object)
    }

    /// Reads an object's stat data.
    pub fn load_object(&self, key: &Key) -> Result<FileObject> {
        let key = stat_key(*key)?;
        let (path, pos) = self.search_item(&key)?;
        if !pos.is_found() {
            return Err(StreeError::NotFound);
        }
        let head = path.item_head()?;
        let stat = {
            let data = path.leaf()?.data();
            StatData::decode(NodeView::new(&data)?.item_body(&head)?, head.version())?
        };
        Ok(FileObject::new(head.key, stat))
    }

    /// Overwrites the stat-data item with `object.stat`.
    pub fn update_stat_data(&self, txn: &mut Transaction, object: &FileObject) -> Result<()> {
        let body = object.stat.encode(object.version())?;
        let (path, pos) = self.search_item(&object.key)?;
        if !pos.is_found() {
            return Err(StreeError::NotFound);
        }
        let head = path.item_head()?;
        if usize::from(head.len) != body.len() {
            return Err(StreeError::Corruption("stat data changed size"));
        }
        let leaf = path.leaf()?;
        {
            let mut data = leaf.data_mut();
            let start = usize::from(head.location);
            data[start..start + body.len()].copy_from_slice(&body);
        }
        txn.mark_dirty(leaf);
        Ok(())
    }

    /// Adds `name` to `dir`, pointing at the object whose stat-data key is
    /// `target`, and returns the entry offset it was given.
    ///
    /// Entries are pasted into the directory item that covers their offset.
    /// A full item only takes new entries past its last one, which start a
    /// new item.
    pub fn add_entry(&self, dir: &mut FileObject, name: &[u8], target: &Key) -> Result<u32> {
        if !dir.is_dir() {
            return Err(StreeError::Invalid("not a directory"));
        }
        if name.is_empty() || name == b"." || name == b".." {
            return Err(StreeError::Invalid("reserved or empty entry name"));
        }
        if self.find_entry(dir, name)?.is_some() {
            return Err(StreeError::Duplicate);
        }
        let hash = name_hash(name);
        let mut chosen = None;
        for generation in 0..=MAX_GENERATION {
            let offset = hash | generation;
            let (path, result) = self.search_for_position(&dir.item_key(KeyType::DirEntry, u64::from(offset)))?;
            match result {
                PositionResult::PositionFound => continue,
                PositionResult::FileNotFound => {
                    return Err(StreeError::Corruption("directory has no entry item"))
                }
                PositionResult::PositionNotFound => {
                    let head = path.item_head()?;
                    chosen = Some((offset, head, path.pos_in_item()));
                    break;
                }
            }
        }
        let Some((offset, head, index)) = chosen else {
            return Err(StreeError::OutOfSpace);
        };
        let entry = DirEntry {
            offset,
            dir_id: target.dir_id,
            object_id: target.object_id,
            name: name.to_vec(),
        };
        let bytes = encode_entries(std::slice::from_ref(&entry))?;
        let key = dir.item_key(KeyType::DirEntry, u64::from(offset));
        let fits = usize::from(head.len) + bytes.len() <= max_item_len(self.block_size());
        self.with_unit(|txn| {
            if fits {
                self.paste(txn, &key, &bytes)?;
            } else if index == usize::from(head.entry_count()) {
                self.insert(txn, &Item::new(key, 1, bytes.clone())?)?;
            } else {
                return Err(StreeError::OutOfSpace);
            }
            dir.stat.size += entry.encoded_len() as u64;
            dir.stat.touch();
            self.update_stat_data(txn, dir)
        })?;
        debug!(target: "stree::tree", dir = %dir.key, offset, "added entry");
        Ok(offset)
    }

    /// Every entry of `dir` in offset order.
    pub fn list_entries(&self, dir: &FileObject) -> Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for item in self.object_items(dir)? {
            if item.head.kind() == KeyType::DirEntry {
                entries.extend(decode_entries(&item.head, &item.body)?);
            }
        }
        Ok(entries)
    }

    /// Looks an entry up by name.
    pub fn find_entry(&self, dir: &FileObject, name: &[u8]) -> Result<Option<DirEntry>> {
        let hash = name_hash(name);
        Ok(self
            .list_entries(dir)?
            .into_iter()
            .find(|entry| entry.offset & !MAX_GENERATION == hash && entry.name == name))
    }

    /// Removes the entry called `name` from `dir`.
    pub fn remove_entry(&self, dir: &mut FileObject, name: &[u8]) -> Result<DirEntry> {
        if name == b"." || name == b".." {
            return Err(StreeError::Invalid("cannot remove dot entries"));
        }
        let entry = self.find_entry(dir, name)?.ok_or(StreeError::NotFound)?;
        let key = dir.item_key(KeyType::DirEntry, u64::from(entry.offset));
        self.with_unit(|txn| {
            self.delete(txn, &key)?;
            dir.stat.size = dir.stat.size.saturating_sub(entry.encoded_len() as u64);
            dir.stat.touch();
            self.update_stat_data(txn, dir)
        })?;
        debug!(target: "stree::tree", dir = %dir.key, offset = entry.offset, "removed entry");
        Ok(entry)
    }

    /// Appends one full block of content to a file without a tail and
    /// returns the block it landed in. `data` shorter than a block is
    /// zero-padded.
    pub fn append_block(&self, file: &mut FileObject, data: &[u8]) -> Result<BlockId> {
        let block_size = self.block_size();
        if file.is_dir() {
            return Err(StreeError::Invalid("not a regular file"));
        }
        if data.len() > block_size {
            return Err(StreeError::Invalid("data larger than one block"));
        }
        if file.stat.size % block_size as u64 != 0 {
            return Err(StreeError::Invalid("file ends in a tail"));
        }
        let key = file.item_key(KeyType::Indirect, file.stat.size + 1);
        let (path, result) = self.search_for_position(&key)?;
        let head = match result {
            PositionResult::PositionFound => return Err(StreeError::Duplicate),
            PositionResult::FileNotFound => return Err(StreeError::NotFound),
            PositionResult::PositionNotFound => path.item_head()?,
        };
        drop(path);
        let extend = head.kind() == KeyType::Indirect
            && head.key.offset + head.op_bytes(block_size) == key.offset
            && usize::from(head.len) + UNFM_P_SIZE <= max_item_len(block_size);

        let block = self.context().cache().allocate(FrameUse::Unformatted)?;
        block.data_mut()[..data.len()].copy_from_slice(data);
        let id = block.id();
        let pointer = encode_pointers(&[id]);
        let mut linked = false;
        let result = self.with_unit(|txn| {
            txn.mark_dirty(&block);
            if extend {
                self.paste(txn, &key, &pointer)?;
            } else {
                self.insert(txn, &Item::new(key, 0, pointer.clone())?)?;
            }
            linked = true;
            file.stat.size += block_size as u64;
            file.stat.blocks += (block_size / 512) as u32;
            file.stat.touch();
            self.update_stat_data(txn, file)
        });
        drop(block);
        if let Err(err) = result {
            if !linked {
                self.context().cache().free(id)?;
            }
            return Err(err);
        }
        Ok(id)
    }

    /// Appends `bytes` as direct items to a file whose size is block
    /// aligned.
    pub fn write_tail(&self, file: &mut FileObject, bytes: &[u8]) -> Result<()> {
        let block_size = self.block_size();
        if file.is_dir() {
            return Err(StreeError::Invalid("not a regular file"));
        }
        if file.stat.size % block_size as u64 != 0 {
            return Err(StreeError::Invalid("file already ends in a tail"));
        }
        if bytes.is_empty() || bytes.len() >= block_size {
            return Err(StreeError::Invalid("tail must be shorter than a block"));
        }
        let chunk_len = max_direct_item_len(block_size);
        self.with_unit(|txn| {
            for (i, chunk) in bytes.chunks(chunk_len).enumerate() {
                let offset = file.stat.size + 1 + (i * chunk_len) as u64;
                self.insert(txn, &Item::new(file.item_key(KeyType::Direct, offset), 0, chunk.to_vec())?)?;
            }
            file.stat.size += bytes.len() as u64;
            file.stat.touch();
            self.update_stat_data(txn, file)
        })
    }

    /// Reads the file content up to its logical size. Holes read as zeros.
    pub fn read_content(&self, file: &FileObject) -> Result<Vec<u8>> {
        let size = usize::try_from(file.stat.size)
            .map_err(|_| StreeError::Invalid("file too large to read into memory"))?;
        let block_size = self.block_size();
        let mut content = vec![0u8; size];
        for item in self.object_items(file)? {
            let start = (item.head.key.offset.max(1) - 1) as usize;
            match item.head.kind() {
                KeyType::Direct => copy_clipped(&mut content, start, &item.body),
                KeyType::Indirect => {
                    for (i, pointer) in decode_pointers(&item.body).into_iter().enumerate() {
                        if pointer.is_null() {
                            continue;
                        }
                        let block = self.context().cache().pin(pointer)?;
                        copy_clipped(&mut content, start + i * block_size, &block.data());
                    }
                }
                KeyType::StatData | KeyType::DirEntry | KeyType::Any => {}
            }
        }
        Ok(content)
    }

    /// Removes the object: its content, then its stat data.
    pub fn delete_object(&self, object: FileObject) -> Result<()> {
        let mut object = object;
        self.truncate(&mut object, 0, false)?;
        self.with_unit(|txn| self.delete(txn, &object.key).map(|_| ()))?;
        info!(target: "stree::tree", object = %object.key, "deleted object");
        Ok(())
    }

    /// Items of `object` past its stat data, in key order.
    pub(crate) fn object_items(&self, object: &FileObject) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        let mut cursor = object.key;
        while let Some(item) = self.next_item(&cursor)? {
            if !item.head.key.same_object(&object.key) {
                break;
            }
            cursor = item.head.key;
            items.push(item);
        }
        Ok(items)
    }

    fn insert_stat_data(&self, txn: &mut Transaction, object: &FileObject) -> Result<()> {
        let body = object.stat.encode(object.version())?;
        self.insert(txn, &Item::new(object.key, 0, body)?)
    }

    /// Runs `op` inside its own journal unit. The unit is ended even when
    /// `op` fails.
    pub(crate) fn with_unit<T>(&self, op: impl FnOnce(&mut Transaction) -> Result<T>) -> Result<T> {
        let mut txn = self.begin()?;
        let result = op(&mut txn);
        self.end(txn)?;
        result
    }
}

fn stat_key(key: Key) -> Result<Key> {
    if key.object_id == 0 {
        return Err(StreeError::Invalid("object id 0 is reserved"));
    }
    Ok(Key::stat_data(key.dir_id, key.object_id, key.version))
}

fn copy_clipped(content: &mut [u8], start: usize, bytes: &[u8]) {
    if start >= content.len() {
        return;
    }
    let end = (start + bytes.len()).min(content.len());
    content[start..end].copy_from_slice(&bytes[..end - start]);
}
