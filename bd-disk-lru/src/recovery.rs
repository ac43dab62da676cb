// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./recovery_test.rs"]
mod recovery_test;

use crate::entry::{EditorId, EntryTable, Layout};
use crate::journal::{self, JOURNAL_FILE, Record, TornTail};
use crate::{Error, Result};
use std::path::Path;

/// How much previously committed data was lost while opening a cache directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataLoss {
  /// The journal could not be read and the directory was wiped.
  Total,
  /// The journal was usable but ended in a torn record or held edits that never completed.
  Partial,
  None,
}

/// The outcome of replaying a cache directory.
#[derive(Debug)]
pub struct Recovered {
  pub table: EntryTable,

  /// Sum of the lengths of every readable entry in `table`.
  pub size: u64,

  /// Journal records that no longer describe a live entry.
  pub redundant_ops: usize,

  /// The journal ends in a torn record and must be rewritten before anything is appended to it.
  pub needs_rebuild: bool,

  pub data_loss: DataLoss,
}

impl Recovered {
  fn empty(value_count: usize, data_loss: DataLoss) -> Self {
    Self {
      table: EntryTable::new(value_count),
      size: 0,
      redundant_ops: 0,
      needs_rebuild: false,
      data_loss,
    }
  }
}

/// Bring the cache directory into a consistent state and rebuild the entry table from its
/// journal. On return the journal file exists and every file in the directory belongs either to
/// the journal or to a readable entry.
///
/// # Errors
/// Corrupt journals are not an error: the directory is wiped and an empty table returned. I/O
/// errors while reading the directory or writing the fresh journal are returned.
pub fn recover(layout: &Layout) -> Result<Recovered> {
  std::fs::create_dir_all(&layout.directory)?;
  finish_interrupted_rebuild(layout)?;

  let journal_path = layout.journal();
  if !journal_path.try_exists()? {
    log::info!(
      "no journal in {}, starting with an empty cache",
      layout.directory.display()
    );
    return start_fresh(layout, DataLoss::None);
  }

  let mut table = EntryTable::new(layout.value_count);
  let replay = match journal::replay(&journal_path, layout.value_count, |record| {
    apply(&mut table, &record);
  }) {
    Ok(replay) => replay,
    Err(Error::CorruptJournal(reason)) => {
      log::warn!(
        "cache journal in {} is corrupt, removing directory contents: {reason}",
        layout.directory.display()
      );
      return start_fresh(layout, DataLoss::Total);
    },
    Err(e) => return Err(e),
  };

  let incomplete = discard_incomplete_entries(layout, &mut table);
  let Some(size) = table.readable_size() else {
    log::warn!(
      "cache journal in {} records more bytes than fit in a u64, removing directory contents",
      layout.directory.display()
    );
    return start_fresh(layout, DataLoss::Total);
  };
  remove_unreferenced_files(layout, &table)?;

  let needs_rebuild = replay.torn_tail == TornTail::Yes;
  let data_loss = if needs_rebuild || incomplete > 0 {
    DataLoss::Partial
  } else {
    DataLoss::None
  };

  log::debug!(
    "replayed {} journal records into {} entries, discarded {incomplete} incomplete edits",
    replay.record_count,
    table.len()
  );

  Ok(Recovered {
    redundant_ops: replay.record_count.saturating_sub(table.len()),
    table,
    size,
    needs_rebuild,
    data_loss,
  })
}

fn apply(table: &mut EntryTable, record: &Record<'_>) {
  match record {
    Record::Dirty(key) => {
      table.touch_or_insert(key).current_editor = Some(EditorId::REPLAYED);
    },
    Record::Clean { key, lengths } => {
      let entry = table.touch_or_insert(key);
      entry.readable = true;
      entry.current_editor = None;
      entry.set_lengths(lengths);
    },
    Record::Remove(key) => {
      table.remove(key);
    },
    Record::Read(key) => {
      table.touch(key);
    },
  }
}

fn start_fresh(layout: &Layout, data_loss: DataLoss) -> Result<Recovered> {
  clear_directory(&layout.directory)?;
  journal::write_journal(&layout.journal(), layout.value_count, std::iter::empty())?;
  Ok(Recovered::empty(layout.value_count, data_loss))
}

/// Resolve the journal files a crashed rebuild may have left behind. A rebuild writes
/// `journal.tmp`, moves `journal` to `journal.bkp`, moves `journal.tmp` to `journal` and finally
/// deletes `journal.bkp`.
fn finish_interrupted_rebuild(layout: &Layout) -> Result<()> {
  let journal_path = layout.journal();
  let backup_path = layout.journal_backup();
  let tmp_path = layout.journal_tmp();

  if backup_path.try_exists()? {
    if journal_path.try_exists()? {
      std::fs::remove_file(&backup_path)?;
    } else {
      log::debug!("restoring journal from backup");
      std::fs::rename(&backup_path, &journal_path)?;
    }
  }

  if tmp_path.try_exists()? {
    let complete = !journal_path.try_exists()?
      && journal::replay(&tmp_path, layout.value_count, |_| {})
        .is_ok_and(|replay| replay.torn_tail == TornTail::No);
    if complete {
      log::debug!("promoting completed journal rebuild");
      std::fs::rename(&tmp_path, &journal_path)?;
      crate::entry::sync_directory(&layout.directory)?;
    } else {
      std::fs::remove_file(&tmp_path)?;
    }
  }

  Ok(())
}

/// Drop every entry whose last record is a `DIRTY`, deleting whatever files it left on disk.
fn discard_incomplete_entries(layout: &Layout, table: &mut EntryTable) -> usize {
  let incomplete: Vec<String> = table
    .iter_lru()
    .filter(|(_, entry)| entry.current_editor.is_some())
    .map(|(key, _)| key.to_string())
    .collect();

  for key in &incomplete {
    log::debug!("discarding incomplete edit of {key:?}");
    table.remove(key);
    if let Err(e) = layout
      .delete_clean_files(key)
      .and_then(|()| layout.delete_dirty_files(key))
    {
      log::warn!("failed to delete files of incomplete entry {key:?}: {e}");
    }
  }

  incomplete.len()
}

/// Delete everything in the directory besides the journal and the value files of readable
/// entries.
fn remove_unreferenced_files(layout: &Layout, table: &EntryTable) -> Result<()> {
  for dir_entry in std::fs::read_dir(&layout.directory)? {
    let dir_entry = dir_entry?;
    let file_name = dir_entry.file_name();
    // A directory is never referenced, even if its name matches a value file.
    let is_file = dir_entry.file_type()?.is_file();
    let referenced = is_file
      && file_name.to_str().is_some_and(|name| {
        name == JOURNAL_FILE
          || layout
            .parse_clean_file(name)
            .and_then(|key| table.get(key))
            .is_some_and(|entry| entry.readable)
      });
    if referenced {
      continue;
    }

    log::debug!("removing unreferenced cache file {file_name:?}");
    if let Err(e) = remove_path(&dir_entry.path()) {
      log::warn!("failed to remove unreferenced cache file {file_name:?}: {e}");
    }
  }

  Ok(())
}

/// Remove everything inside `directory`, leaving the directory itself in place.
pub fn clear_directory(directory: &Path) -> std::io::Result<()> {
  for dir_entry in std::fs::read_dir(directory)? {
    remove_path(&dir_entry?.path())?;
  }
  Ok(())
}

fn remove_path(path: &Path) -> std::io::Result<()> {
  if path.symlink_metadata()?.is_dir() {
    std::fs::remove_dir_all(path)
  } else {
    std::fs::remove_file(path)
  }
}
