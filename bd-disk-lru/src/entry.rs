// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./entry_test.rs"]
mod entry_test;

use crate::journal::{JOURNAL_FILE, JOURNAL_FILE_BACKUP, JOURNAL_FILE_TMP};
use ahash::AHashMap;
use std::collections::BTreeMap;
use std::collections::hash_map::Entry as MapEntry;
use std::path::{Path, PathBuf};

//
// EditorId
//

/// Identifies the editor that currently owns an entry. Editors compare their own id against the
/// entry before touching it so that an editor detached by `close` can't complete someone else's
/// edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditorId(u64);

impl EditorId {
  /// Marker for a `DIRTY` record seen during replay. No live editor ever owns it.
  pub const REPLAYED: Self = Self(0);

  pub const fn new(id: u64) -> Self {
    Self(id)
  }
}

//
// Entry
//

#[derive(Debug)]
pub struct Entry {
  lengths: Box<[u64]>,

  /// True once the entry has been committed at least once.
  pub readable: bool,

  pub current_editor: Option<EditorId>,

  /// Bumped on every successful commit. Lets a snapshot detect that it has gone stale.
  pub sequence_number: u64,

  // Position in the LRU order, see `EntryTable::lru`.
  order: u64,
}

impl Entry {
  fn new(value_count: usize, order: u64) -> Self {
    Self {
      lengths: vec![0; value_count].into_boxed_slice(),
      readable: false,
      current_editor: None,
      sequence_number: 0,
      order,
    }
  }

  #[must_use]
  pub fn lengths(&self) -> &[u64] {
    &self.lengths
  }

  pub fn set_lengths(&mut self, lengths: &[u64]) {
    self.lengths.copy_from_slice(lengths);
  }

  pub fn set_length(&mut self, index: usize, length: u64) {
    self.lengths[index] = length;
  }

  #[must_use]
  pub fn total_length(&self) -> u64 {
    self.lengths.iter().sum()
  }
}

//
// EntryTable
//

/// Key to entry map with an explicit access order. Every touch moves the key to the back of
/// `lru`, so iterating `lru` front to back visits the least recently used key first.
#[derive(Debug)]
pub struct EntryTable {
  value_count: usize,
  entries: AHashMap<String, Entry>,
  lru: BTreeMap<u64, String>,
  next_order: u64,
}

impl EntryTable {
  #[must_use]
  pub fn new(value_count: usize) -> Self {
    Self {
      value_count,
      entries: AHashMap::new(),
      lru: BTreeMap::new(),
      next_order: 0,
    }
  }

  #[must_use]
  pub fn get(&self, key: &str) -> Option<&Entry> {
    self.entries.get(key)
  }

  pub fn get_mut(&mut self, key: &str) -> Option<&mut Entry> {
    self.entries.get_mut(key)
  }

  fn allocate_order(&mut self) -> u64 {
    let order = self.next_order;
    self.next_order += 1;
    order
  }

  /// Move `key` to the most recently used position, creating an empty entry for it if needed.
  pub fn touch_or_insert(&mut self, key: &str) -> &mut Entry {
    let order = self.allocate_order();
    self.lru.insert(order, key.to_string());

    match self.entries.entry(key.to_string()) {
      MapEntry::Occupied(occupied) => {
        let entry = occupied.into_mut();
        self.lru.remove(&entry.order);
        entry.order = order;
        entry
      },
      MapEntry::Vacant(vacant) => vacant.insert(Entry::new(self.value_count, order)),
    }
  }

  /// Move `key` to the most recently used position. Returns false if the key is unknown.
  pub fn touch(&mut self, key: &str) -> bool {
    if !self.entries.contains_key(key) {
      return false;
    }
    self.touch_or_insert(key);
    true
  }

  pub fn remove(&mut self, key: &str) -> Option<Entry> {
    let entry = self.entries.remove(key)?;
    self.lru.remove(&entry.order);
    Some(entry)
  }

  /// Number of entries in the table, including ones whose first edit is still in progress.
  #[must_use]
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  /// Iterate entries from least to most recently used.
  pub fn iter_lru(&self) -> impl Iterator<Item = (&str, &Entry)> {
    self
      .lru
      .values()
      .filter_map(|key| self.entries.get(key).map(|entry| (key.as_str(), entry)))
  }

  /// Sum of the lengths of every readable entry, or `None` if it doesn't fit in a `u64`.
  #[must_use]
  pub fn readable_size(&self) -> Option<u64> {
    self
      .entries
      .values()
      .filter(|entry| entry.readable)
      .try_fold(0u64, |size, entry| size.checked_add(entry.total_length()))
  }
}

//
// Layout
//

/// Names of the files that make up a cache directory.
#[derive(Debug, Clone)]
pub struct Layout {
  pub directory: PathBuf,
  pub value_count: usize,
}

impl Layout {
  #[must_use]
  pub const fn new(directory: PathBuf, value_count: usize) -> Self {
    Self {
      directory,
      value_count,
    }
  }

  #[must_use]
  pub fn journal(&self) -> PathBuf {
    self.directory.join(JOURNAL_FILE)
  }

  #[must_use]
  pub fn journal_tmp(&self) -> PathBuf {
    self.directory.join(JOURNAL_FILE_TMP)
  }

  #[must_use]
  pub fn journal_backup(&self) -> PathBuf {
    self.directory.join(JOURNAL_FILE_BACKUP)
  }

  /// The committed value of slot `index`.
  #[must_use]
  pub fn clean_file(&self, key: &str, index: usize) -> PathBuf {
    self.directory.join(format!("{key}.{index}"))
  }

  /// The value of slot `index` staged by an in progress edit.
  #[must_use]
  pub fn dirty_file(&self, key: &str, index: usize) -> PathBuf {
    self.directory.join(format!("{key}.{index}.tmp"))
  }

  /// Whether `file_name` is the committed value file of a slot, returning its key if so.
  #[must_use]
  pub fn parse_clean_file<'a>(&self, file_name: &'a str) -> Option<&'a str> {
    let (key, index) = file_name.rsplit_once('.')?;
    if key.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
      return None;
    }
    let index: usize = index.parse().ok()?;
    (index < self.value_count && file_name == format!("{key}.{index}")).then_some(key)
  }

  pub fn delete_clean_files(&self, key: &str) -> std::io::Result<()> {
    for index in 0 .. self.value_count {
      remove_file_if_exists(&self.clean_file(key, index))?;
    }
    Ok(())
  }

  pub fn delete_dirty_files(&self, key: &str) -> std::io::Result<()> {
    for index in 0 .. self.value_count {
      remove_file_if_exists(&self.dirty_file(key, index))?;
    }
    Ok(())
  }
}

/// Flush the entries of `directory` so that renames inside it survive a power loss.
#[cfg(unix)]
pub fn sync_directory(directory: &Path) -> std::io::Result<()> {
  std::fs::File::open(directory)?.sync_all()
}

// Directories can't be opened for syncing on other platforms.
#[cfg(not(unix))]
pub fn sync_directory(_directory: &Path) -> std::io::Result<()> {
  Ok(())
}

pub fn remove_file_if_exists(path: &Path) -> std::io::Result<()> {
  match std::fs::remove_file(path) {
    Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
    _ => Ok(()),
  }
}
