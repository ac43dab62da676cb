// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::{Error, Result};
use std::fs::File;
use std::io::Read;

/// The values of an entry as they were when the snapshot was taken.
///
/// The snapshot holds an open file per value, so it keeps reading the same bytes even if the entry
/// is updated or evicted afterwards. This relies on renames and deletes leaving open files intact,
/// which holds on unix. On windows a commit can fail to replace a value that a snapshot still has
/// open.
#[derive(Debug)]
pub struct Snapshot {
  key: String,
  sequence_number: u64,
  lengths: Box<[u64]>,

  // Empty once the snapshot has been closed.
  files: Vec<File>,
}

impl Snapshot {
  pub(crate) fn new(
    key: String,
    sequence_number: u64,
    lengths: Box<[u64]>,
    files: Vec<File>,
  ) -> Self {
    Self {
      key,
      sequence_number,
      lengths,
      files,
    }
  }

  #[must_use]
  pub fn key(&self) -> &str {
    &self.key
  }

  /// Identifies the committed version of the entry this snapshot reads. See
  /// [`crate::DiskLruCache::edit_snapshot`].
  #[must_use]
  pub const fn sequence_number(&self) -> u64 {
    self.sequence_number
  }

  /// The byte length of value `index`.
  ///
  /// # Errors
  /// Returns [`Error::SlotOutOfRange`] if `index` is not a valid slot.
  pub fn length(&self, index: usize) -> Result<u64> {
    self
      .lengths
      .get(index)
      .copied()
      .ok_or(Error::SlotOutOfRange {
        index,
        value_count: self.lengths.len(),
      })
  }

  /// A reader over value `index`, positioned at its first byte. Readers are independent of each
  /// other, so the same value can be read any number of times.
  ///
  /// # Errors
  /// Returns [`Error::SlotOutOfRange`] for an invalid slot and [`Error::IllegalState`] after
  /// [`Self::close`].
  pub fn new_reader(&self, index: usize) -> Result<SlotReader<'_>> {
    self.length(index)?;
    let file = self
      .files
      .get(index)
      .ok_or(Error::IllegalState("snapshot has been closed"))?;
    Ok(SlotReader { file, position: 0 })
  }

  /// Read value `index` as a UTF-8 string.
  ///
  /// # Errors
  /// Same as [`Self::new_reader`], plus an I/O error if the value can't be read or isn't UTF-8.
  pub fn get_string(&self, index: usize) -> Result<String> {
    let mut value = String::new();
    self.new_reader(index)?.read_to_string(&mut value)?;
    Ok(value)
  }

  /// Release the open value files. Closing an already closed snapshot does nothing.
  pub fn close(&mut self) {
    self.files.clear();
  }

  #[must_use]
  pub fn is_closed(&self) -> bool {
    self.files.is_empty()
  }
}

//
// SlotReader
//

/// Reads a single value of a [`Snapshot`] using positional reads, leaving the shared file offset
/// untouched.
#[derive(Debug)]
pub struct SlotReader<'a> {
  file: &'a File,
  position: u64,
}

impl Read for SlotReader<'_> {
  fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
    let read = read_at(self.file, buf, self.position)?;
    self.position += read as u64;
    Ok(read)
  }
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
  std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
  std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}
