// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::config::{CacheConfig, validate_max_size};
use crate::editor::Editor;
use crate::entry::{EditorId, EntryTable, Layout};
use crate::journal::{self, JournalWriter, Record, validate_key};
use crate::recovery::{self, DataLoss};
use crate::snapshot::Snapshot;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::borrow::Cow;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

/// A cache that stores a bounded number of bytes on the filesystem.
///
/// Each entry has a string key and a fixed number of values, each stored in its own file. The
/// cache evicts the least recently used entries once the total size of all values exceeds
/// `max_size`. Entries that are being edited are never evicted, so the bound is soft.
///
/// Every change to the entry table is recorded in an append-only journal inside the cache
/// directory. Opening the cache replays the journal, and anything the journal doesn't account for
/// (for example the files of an edit interrupted by a crash) is deleted.
///
/// Only one `DiskLruCache` may use a directory at a time. The cache is safe to share between
/// threads; all journal affecting operations are serialized by a single lock.
pub struct DiskLruCache {
  shared: Arc<Shared>,
}

pub(crate) struct Shared {
  pub(crate) layout: Layout,
  pub(crate) state: Mutex<State>,
}

pub(crate) struct State {
  table: EntryTable,
  size: u64,
  max_size: u64,
  rebuild_threshold: usize,
  redundant_ops: usize,

  // None once the cache has been closed.
  journal: Option<JournalWriter>,

  next_editor_id: u64,
  next_sequence_number: u64,
  data_loss: DataLoss,
}

pub(crate) enum EditOutcome<'a> {
  /// Publish the slots flagged in the slice.
  Commit(&'a [bool]),
  Abort,
}

impl DiskLruCache {
  /// Open the cache in `directory`, creating the directory if it doesn't exist.
  ///
  /// # Errors
  /// Returns [`Error::InvalidArgument`] if `value_count` or `max_size` is zero, and an I/O error
  /// if the directory can't be prepared.
  pub fn open(directory: impl AsRef<Path>, value_count: usize, max_size: u64) -> Result<Self> {
    Self::open_with_config(directory, CacheConfig::new(value_count, max_size))
  }

  /// Open the cache in `directory` with the full set of options.
  ///
  /// # Errors
  /// Returns [`Error::InvalidArgument`] for an invalid configuration, and an I/O error if the
  /// directory can't be prepared.
  pub fn open_with_config(directory: impl AsRef<Path>, config: CacheConfig) -> Result<Self> {
    config.validate()?;

    let layout = Layout::new(directory.as_ref().to_path_buf(), config.value_count);
    let recovered = recovery::recover(&layout)?;
    let journal = JournalWriter::open(&layout.journal())?;

    let mut state = State {
      size: recovered.size,
      table: recovered.table,
      max_size: config.max_size,
      rebuild_threshold: config.rebuild_threshold,
      redundant_ops: recovered.redundant_ops,
      journal: Some(journal),
      next_editor_id: 1,
      next_sequence_number: 1,
      data_loss: recovered.data_loss,
    };

    if recovered.needs_rebuild {
      state.rebuild_journal(&layout)?;
    }
    state.trim_to_size(&layout)?;
    state.rebuild_if_needed(&layout)?;

    log::info!(
      "opened disk cache in {}: {} entries, {}/{} bytes",
      layout.directory.display(),
      state.table.len(),
      state.size,
      state.max_size
    );

    Ok(Self {
      shared: Arc::new(Shared {
        layout,
        state: Mutex::new(state),
      }),
    })
  }

  /// Returns a snapshot of the entry named `key`, or `None` if it doesn't exist or isn't
  /// currently readable. A returned snapshot keeps reading the values it was opened with even if
  /// the entry is later updated or removed.
  ///
  /// # Errors
  /// Returns [`Error::InvalidKey`] for malformed keys and [`Error::Closed`] once the cache is
  /// closed.
  pub fn get(&self, key: &str) -> Result<Option<Snapshot>> {
    validate_key(key)?;
    let layout = &self.shared.layout;
    let mut state = self.shared.state.lock();
    state.check_open()?;

    let Some(entry) = state.table.get(key).filter(|entry| entry.readable) else {
      return Ok(None);
    };

    let mut files = Vec::with_capacity(layout.value_count);
    for index in 0 .. layout.value_count {
      match File::open(layout.clean_file(key, index)) {
        Ok(file) => files.push(file),
        // The file was deleted behind our back.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
      }
    }

    let snapshot = Snapshot::new(
      key.to_string(),
      entry.sequence_number,
      entry.lengths().into(),
      files,
    );

    state.redundant_ops += 1;
    state.append(&Record::Read(key))?;
    state.table.touch(key);
    state.rebuild_if_needed(layout)?;

    Ok(Some(snapshot))
  }

  /// Start an edit of the entry named `key`. Returns `None` if another edit of the entry is in
  /// progress.
  ///
  /// # Errors
  /// Returns [`Error::InvalidKey`] for malformed keys, [`Error::Closed`] once the cache is closed,
  /// and an I/O error if the journal can't be written.
  pub fn edit(&self, key: &str) -> Result<Option<Editor>> {
    self.edit_if_sequence(key, None)
  }

  /// Start an edit of the entry `snapshot` was taken from. Returns `None` if the entry has been
  /// committed again or removed since, or if another edit is in progress.
  ///
  /// # Errors
  /// Same as [`Self::edit`].
  pub fn edit_snapshot(&self, snapshot: &Snapshot) -> Result<Option<Editor>> {
    self.edit_if_sequence(snapshot.key(), Some(snapshot.sequence_number()))
  }

  fn edit_if_sequence(&self, key: &str, expected_sequence: Option<u64>) -> Result<Option<Editor>> {
    validate_key(key)?;
    let mut state = self.shared.state.lock();
    state.check_open()?;

    let entry = state.table.get(key);
    if let Some(expected) = expected_sequence
      && entry.is_none_or(|entry| entry.sequence_number != expected)
    {
      return Ok(None);
    }
    if entry.is_some_and(|entry| entry.current_editor.is_some()) {
      return Ok(None);
    }

    // The DIRTY record must be durable before any value file is created.
    state.append(&Record::Dirty(key))?;

    let id = EditorId::new(state.next_editor_id);
    state.next_editor_id += 1;
    state.table.touch_or_insert(key).current_editor = Some(id);

    Ok(Some(Editor::new(
      Arc::clone(&self.shared),
      key.to_string(),
      id,
    )))
  }

  /// Remove the entry named `key`. Returns false if there is no such entry or it is currently
  /// being edited.
  ///
  /// # Errors
  /// Returns [`Error::InvalidKey`] for malformed keys, [`Error::Closed`] once the cache is closed,
  /// and an I/O error if the value files can't be deleted.
  pub fn remove(&self, key: &str) -> Result<bool> {
    validate_key(key)?;
    let layout = &self.shared.layout;
    let mut state = self.shared.state.lock();
    state.check_open()?;

    if state
      .table
      .get(key)
      .is_none_or(|entry| entry.current_editor.is_some())
    {
      return Ok(false);
    }

    state.remove_entry(layout, key)?;
    state.rebuild_if_needed(layout)?;
    Ok(true)
  }

  /// The number of bytes currently used by readable entries. May exceed [`Self::max_size`] while
  /// edits are outstanding or before a pending trim completes.
  #[must_use]
  pub fn size(&self) -> u64 {
    self.shared.state.lock().size
  }

  #[must_use]
  pub fn max_size(&self) -> u64 {
    self.shared.state.lock().max_size
  }

  /// Change the maximum size and immediately evict entries until the cache fits.
  ///
  /// # Errors
  /// Returns [`Error::InvalidArgument`] if `max_size` is zero and [`Error::Closed`] once the cache
  /// is closed.
  pub fn set_max_size(&self, max_size: u64) -> Result<()> {
    validate_max_size(max_size)?;
    let mut state = self.shared.state.lock();
    state.check_open()?;
    state.max_size = max_size;
    state.trim_to_size(&self.shared.layout)
  }

  #[must_use]
  pub fn value_count(&self) -> usize {
    self.shared.layout.value_count
  }

  #[must_use]
  pub fn directory(&self) -> &Path {
    &self.shared.layout.directory
  }

  /// Number of readable entries.
  #[must_use]
  pub fn len(&self) -> usize {
    self
      .shared
      .state
      .lock()
      .table
      .iter_lru()
      .filter(|(_, entry)| entry.readable)
      .count()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// What was lost while opening the cache directory.
  #[must_use]
  pub fn data_loss(&self) -> DataLoss {
    self.shared.state.lock().data_loss
  }

  #[must_use]
  pub fn is_closed(&self) -> bool {
    self.shared.state.lock().journal.is_none()
  }

  /// Evict entries down to the size bound and force the journal to durable storage.
  ///
  /// # Errors
  /// Returns [`Error::Closed`] once the cache is closed, or the I/O error that failed the flush.
  pub fn flush(&self) -> Result<()> {
    let mut state = self.shared.state.lock();
    state.check_open()?;
    state.trim_to_size(&self.shared.layout)?;
    state.journal_writer()?.sync()?;
    Ok(())
  }

  /// Compact the journal to one record per entry.
  ///
  /// # Errors
  /// Returns [`Error::Closed`] once the cache is closed, or the I/O error that failed the rebuild.
  pub fn rebuild_journal(&self) -> Result<()> {
    let mut state = self.shared.state.lock();
    state.check_open()?;
    state.rebuild_journal(&self.shared.layout)
  }

  /// Abort outstanding edits, evict down to the size bound and close the journal. Calling this on
  /// a closed cache does nothing.
  ///
  /// # Errors
  /// Returns the I/O error that stopped the journal from being finalized. The cache is closed
  /// either way.
  pub fn close(&self) -> Result<()> {
    let layout = &self.shared.layout;
    let mut state = self.shared.state.lock();
    if state.journal.is_none() {
      return Ok(());
    }

    let result = state.close(layout);
    state.journal = None;
    log::info!("closed disk cache in {}", layout.directory.display());
    result
  }

  /// Close the cache and delete its directory, including any files the cache didn't create.
  ///
  /// # Errors
  /// Returns an I/O error if the directory can't be removed.
  pub fn delete(self) -> Result<()> {
    if let Err(e) = self.close() {
      log::warn!("failed to close disk cache before deleting it: {e}");
    }
    std::fs::remove_dir_all(&self.shared.layout.directory)?;
    Ok(())
  }
}

// Skip the state, which would require taking the lock.
impl std::fmt::Debug for DiskLruCache {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DiskLruCache")
      .field("directory", &self.shared.layout.directory)
      .field("value_count", &self.shared.layout.value_count)
      .finish_non_exhaustive()
  }
}

impl Drop for DiskLruCache {
  fn drop(&mut self) {
    if let Err(e) = self.close() {
      log::warn!(
        "failed to close disk cache in {}: {e}",
        self.shared.layout.directory.display()
      );
    }
  }
}

//
// State
//

fn journal_writer(journal: &mut Option<JournalWriter>) -> Result<&mut JournalWriter> {
  journal.as_mut().ok_or(Error::Closed)
}

impl State {
  fn check_open(&self) -> Result<()> {
    if self.journal.is_none() {
      return Err(Error::Closed);
    }
    Ok(())
  }

  fn journal_writer(&mut self) -> Result<&mut JournalWriter> {
    journal_writer(&mut self.journal)
  }

  fn append(&mut self, record: &Record<'_>) -> Result<()> {
    self.journal_writer()?.append(record)?;
    Ok(())
  }

  /// Whether `id` still owns the entry named `key`.
  pub(crate) fn is_current_editor(&self, key: &str, id: EditorId) -> bool {
    self
      .table
      .get(key)
      .is_some_and(|entry| entry.current_editor == Some(id))
  }

  /// Whether the entry named `key` has a committed version.
  pub(crate) fn is_readable(&self, key: &str) -> bool {
    self.table.get(key).is_some_and(|entry| entry.readable)
  }

  /// Finish the edit `id` of `key`, either publishing the flagged slots or discarding them.
  ///
  /// A first edit that doesn't write every slot can't be committed; it is aborted and an
  /// [`Error::IllegalState`] returned. If a rename fails while publishing, the slots that were
  /// already renamed stay published and the error is returned.
  pub(crate) fn complete_edit(
    &mut self,
    layout: &Layout,
    key: &str,
    id: EditorId,
    outcome: EditOutcome<'_>,
  ) -> Result<()> {
    if !self.is_current_editor(key, id) {
      return Err(Error::IllegalState(
        "editor has already been detached from its entry",
      ));
    }

    let mut committed = false;
    let mut result = Ok(());
    if let EditOutcome::Commit(written) = outcome {
      if !self.is_readable(key) && written.contains(&false) {
        result = Err(Error::IllegalState(
          "the first commit of an entry must write every value",
        ));
      } else {
        result = self.publish(layout, key, written);
        committed = result.is_ok();
      }
    }

    if let Err(e) = layout.delete_dirty_files(key) {
      log::warn!("failed to delete staged values of {key:?}: {e}");
    }

    self.redundant_ops += 1;
    let next_sequence_number = self.next_sequence_number;
    let Some(entry) = self.table.get_mut(key) else {
      return result;
    };
    entry.current_editor = None;

    if entry.readable || committed {
      if committed {
        if !entry.readable {
          entry.readable = true;
          self.size += entry.total_length();
        }
        entry.sequence_number = next_sequence_number;
        self.next_sequence_number += 1;
      }
      journal_writer(&mut self.journal)?.append(&Record::Clean {
        key,
        lengths: Cow::Borrowed(entry.lengths()),
      })?;
      self.table.touch(key);
    } else {
      // A first edit that never became readable leaves no trace besides the REMOVE record.
      layout.delete_clean_files(key)?;
      self.table.remove(key);
      self.append(&Record::Remove(key))?;
    }

    self.trim_to_size(layout)?;
    self.rebuild_if_needed(layout)?;
    result
  }

  /// Rename the staged values of `key` over the committed ones and record their new lengths.
  ///
  /// Nothing is renamed if the new lengths would push the cache size past `u64::MAX`. A first
  /// commit counts every staged length, since the entry becomes readable once it succeeds.
  fn publish(&mut self, layout: &Layout, key: &str, written: &[bool]) -> Result<()> {
    let Some(entry) = self.table.get(key) else {
      return Err(Error::IllegalState("entry disappeared while committing"));
    };

    let mut staged = Vec::new();
    let mut size = self.size;
    for (index, _) in written.iter().enumerate().filter(|(_, written)| **written) {
      let length = std::fs::metadata(layout.dirty_file(key, index))?.len();
      let previous = if entry.readable {
        entry.lengths()[index]
      } else {
        0
      };
      size = (size - previous)
        .checked_add(length)
        .ok_or(Error::IllegalState("committed values overflow the cache size"))?;
      staged.push((index, length));
    }

    for (index, length) in staged {
      std::fs::rename(layout.dirty_file(key, index), layout.clean_file(key, index))?;

      let Some(entry) = self.table.get_mut(key) else {
        return Err(Error::IllegalState("entry disappeared while committing"));
      };
      let previous = entry.lengths()[index];
      entry.set_length(index, length);
      if entry.readable {
        self.size = self.size - previous + length;
      }
    }
    Ok(())
  }

  /// Delete the entry named `key` and its values.
  fn remove_entry(&mut self, layout: &Layout, key: &str) -> Result<()> {
    layout.delete_clean_files(key)?;
    self.redundant_ops += 1;
    self.append(&Record::Remove(key))?;
    if let Some(entry) = self.table.remove(key)
      && entry.readable
    {
      self.size -= entry.total_length();
    }
    Ok(())
  }

  /// Evict least recently used entries until the size bound holds. Entries with an outstanding
  /// editor are skipped.
  fn trim_to_size(&mut self, layout: &Layout) -> Result<()> {
    while self.size > self.max_size {
      let Some(key) = self
        .table
        .iter_lru()
        .find(|(_, entry)| entry.readable && entry.current_editor.is_none())
        .map(|(key, _)| key.to_string())
      else {
        log::debug!(
          "cache is over its size bound ({} > {}) but every entry is being edited",
          self.size,
          self.max_size
        );
        break;
      };

      log::debug!("evicting {key:?}");
      self.remove_entry(layout, &key)?;
    }
    Ok(())
  }

  fn rebuild_if_needed(&mut self, layout: &Layout) -> Result<()> {
    if self.redundant_ops >= self.rebuild_threshold && self.redundant_ops >= self.table.len() {
      self.rebuild_journal(layout)?;
    }
    Ok(())
  }

  /// Replace the journal with one that holds a single record per entry.
  fn rebuild_journal(&mut self, layout: &Layout) -> Result<()> {
    // Buffered READ records are still appended to the old journal so a failed rebuild loses
    // nothing.
    self.journal_writer()?.sync()?;

    let records = self.table.iter_lru().map(|(key, entry)| {
      if entry.current_editor.is_some() {
        Record::Dirty(key)
      } else {
        Record::Clean {
          key,
          lengths: Cow::Borrowed(entry.lengths()),
        }
      }
    });
    let journal_path = layout.journal();
    let backup_path = layout.journal_backup();
    journal::write_journal(&layout.journal_tmp(), layout.value_count, records)?;

    if journal_path.try_exists()? {
      std::fs::rename(&journal_path, &backup_path)?;
    }
    std::fs::rename(layout.journal_tmp(), &journal_path)?;
    crate::entry::sync_directory(&layout.directory)?;
    crate::entry::remove_file_if_exists(&backup_path)?;

    self.journal = Some(JournalWriter::open(&journal_path)?);
    log::debug!(
      "rebuilt journal with {} entries, dropped {} redundant records",
      self.table.len(),
      self.redundant_ops
    );
    self.redundant_ops = 0;
    Ok(())
  }

  fn close(&mut self, layout: &Layout) -> Result<()> {
    let editing: Vec<(String, EditorId)> = self
      .table
      .iter_lru()
      .filter_map(|(key, entry)| {
        entry
          .current_editor
          .map(|editor| (key.to_string(), editor))
      })
      .collect();
    for (key, editor) in editing {
      log::debug!("aborting outstanding edit of {key:?}");
      self.complete_edit(layout, &key, editor, EditOutcome::Abort)?;
    }

    self.trim_to_size(layout)?;
    self.journal_writer()?.sync()?;
    Ok(())
  }
}
