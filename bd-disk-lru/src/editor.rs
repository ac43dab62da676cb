// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::cache::{EditOutcome, Shared, State};
use crate::entry::EditorId;
use crate::{Error, Result};
use parking_lot::MutexGuard;
use std::fs::File;
use std::io::{Read, Write};
use std::marker::PhantomData;
use std::sync::Arc;

/// An exclusive edit of one entry.
///
/// Values are staged in temporary files next to the committed ones and only become visible to
/// [`crate::DiskLruCache::get`] on [`Self::commit`]. Slots that are not written keep their
/// previously committed value. Dropping an editor without committing aborts it.
pub struct Editor {
  shared: Arc<Shared>,
  key: String,
  id: EditorId,
  written: Vec<bool>,
  done: bool,
}

impl Editor {
  pub(crate) fn new(shared: Arc<Shared>, key: String, id: EditorId) -> Self {
    let written = vec![false; shared.layout.value_count];
    Self {
      shared,
      key,
      id,
      written,
      done: false,
    }
  }

  #[must_use]
  pub fn key(&self) -> &str {
    &self.key
  }

  fn check_index(&self, index: usize) -> Result<()> {
    if index >= self.written.len() {
      return Err(Error::SlotOutOfRange {
        index,
        value_count: self.written.len(),
      });
    }
    Ok(())
  }

  /// Lock the cache state, failing unless this editor still owns its entry.
  fn lock_attached(&self) -> Result<MutexGuard<'_, State>> {
    if self.done {
      return Err(Error::IllegalState("editor has already been completed"));
    }
    let state = self.shared.state.lock();
    if !state.is_current_editor(&self.key, self.id) {
      return Err(Error::IllegalState(
        "editor has already been detached from its entry",
      ));
    }
    Ok(state)
  }

  /// Fail unless this editor still owns its entry. Returns whether the entry has a committed
  /// version.
  fn check_attached(&self) -> Result<bool> {
    Ok(self.lock_attached()?.is_readable(&self.key))
  }

  /// Open a writer that replaces value `index`. The value is staged until [`Self::commit`] and
  /// the writer must be dropped before committing.
  ///
  /// # Errors
  /// Returns [`Error::SlotOutOfRange`] for an invalid slot, [`Error::IllegalState`] if the edit
  /// is finished, and an I/O error if the staging file can't be created.
  pub fn new_writer(&mut self, index: usize) -> Result<SlotWriter<'_>> {
    self.check_index(index)?;

    // A close that aborts this edit between the check and the create would orphan the file.
    let file = {
      let _state = self.lock_attached()?;
      File::create(self.shared.layout.dirty_file(&self.key, index))?
    };
    self.written[index] = true;
    Ok(SlotWriter {
      file,
      _editor: PhantomData,
    })
  }

  /// Replace value `index` with `value`.
  ///
  /// # Errors
  /// Same as [`Self::new_writer`], plus any error writing the value.
  pub fn set(&mut self, index: usize, value: impl AsRef<[u8]>) -> Result<()> {
    let mut writer = self.new_writer(index)?;
    writer.write_all(value.as_ref())?;
    writer.flush()?;
    Ok(())
  }

  /// Open the last committed value of slot `index`, or `None` if the entry has never been
  /// committed. Values staged by this editor are not visible here.
  ///
  /// # Errors
  /// Returns [`Error::SlotOutOfRange`] for an invalid slot, [`Error::IllegalState`] if the edit
  /// is finished, and an I/O error if the value can't be opened.
  pub fn new_reader(&self, index: usize) -> Result<Option<File>> {
    self.check_index(index)?;
    if !self.check_attached()? {
      return Ok(None);
    }

    match File::open(self.shared.layout.clean_file(&self.key, index)) {
      Ok(file) => Ok(Some(file)),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(e.into()),
    }
  }

  /// Read the last committed value of slot `index` as a UTF-8 string.
  ///
  /// # Errors
  /// Same as [`Self::new_reader`], plus an I/O error if the value isn't UTF-8.
  pub fn get_string(&self, index: usize) -> Result<Option<String>> {
    let Some(mut file) = self.new_reader(index)? else {
      return Ok(None);
    };
    let mut value = String::new();
    file.read_to_string(&mut value)?;
    Ok(Some(value))
  }

  /// Publish the written values. The first commit of an entry must write every slot.
  ///
  /// # Errors
  /// Returns [`Error::IllegalState`] if the edit is already finished or a first commit is missing
  /// a value (in which case the edit is aborted), and an I/O error if the values can't be
  /// published or the journal written.
  pub fn commit(&mut self) -> Result<()> {
    self.complete(true)
  }

  /// Discard the written values. The entry keeps its last committed version, if any.
  ///
  /// # Errors
  /// Returns [`Error::IllegalState`] if the edit is already finished, and an I/O error if the
  /// journal can't be written.
  pub fn abort(&mut self) -> Result<()> {
    self.complete(false)
  }

  fn complete(&mut self, commit: bool) -> Result<()> {
    if self.done {
      return Err(Error::IllegalState("editor has already been completed"));
    }
    self.done = true;

    let outcome = if commit {
      EditOutcome::Commit(&self.written)
    } else {
      EditOutcome::Abort
    };
    self
      .shared
      .state
      .lock()
      .complete_edit(&self.shared.layout, &self.key, self.id, outcome)
  }
}

impl std::fmt::Debug for Editor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Editor")
      .field("key", &self.key)
      .field("id", &self.id)
      .field("written", &self.written)
      .field("done", &self.done)
      .finish_non_exhaustive()
  }
}

impl Drop for Editor {
  fn drop(&mut self) {
    if self.done {
      return;
    }
    if let Err(e) = self.abort() {
      log::debug!("failed to abort dropped editor for {:?}: {e}", self.key);
    }
  }
}

//
// SlotWriter
//

/// Writes a staged value. Borrows the editor so the edit can't complete while a write is in
/// progress.
#[derive(Debug)]
pub struct SlotWriter<'a> {
  file: File,
  _editor: PhantomData<&'a mut Editor>,
}

impl Write for SlotWriter<'_> {
  fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
    self.file.write(buf)
  }

  fn flush(&mut self) -> std::io::Result<()> {
    self.file.flush()
  }
}
