// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

//! Text format of the cache journal.
//!
//! ```text
//! libcore.io.DiskLruCache
//! 1
//! 2
//!
//! DIRTY avatar-42
//! CLEAN avatar-42 3934 212
//! DIRTY banner
//! CLEAN banner 1600 88
//! READ avatar-42
//! REMOVE banner
//! ```
//!
//! The first four lines form the header: the magic string, the journal version, the number of
//! values per entry and a blank line. Every following line is a single [`Record`]. Fields are
//! separated by exactly one space and every line, including the last, is terminated by `\n`.

#[cfg(test)]
#[path = "./journal_test.rs"]
mod journal_test;

use crate::{Error, Result};
use std::borrow::Cow;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

pub const JOURNAL_FILE: &str = "journal";
pub const JOURNAL_FILE_TMP: &str = "journal.tmp";
pub const JOURNAL_FILE_BACKUP: &str = "journal.bkp";
pub const MAGIC: &str = "libcore.io.DiskLruCache";
pub const VERSION: &str = "1";

const HEADER_LINES: usize = 4;

const CLEAN: &str = "CLEAN";
const DIRTY: &str = "DIRTY";
const REMOVE: &str = "REMOVE";
const READ: &str = "READ";

/// Check that `key` can be used both as a journal field and as a file name prefix.
///
/// # Errors
/// Returns [`Error::InvalidKey`] if the key is empty, contains whitespace, or contains a path
/// separator or NUL.
pub fn validate_key(key: &str) -> Result<()> {
  let reason = if key.is_empty() {
    "keys must not be empty"
  } else if key.chars().any(char::is_whitespace) {
    "keys must not contain spaces, tabs or newlines"
  } else if key.contains(['/', '\\', '\0']) {
    "keys must not contain path separators or NUL"
  } else {
    return Ok(());
  };

  Err(Error::InvalidKey {
    key: key.to_string(),
    reason,
  })
}

//
// Record
//

/// A single journal line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record<'a> {
  /// An edit of the entry started. Must be followed by `Clean` or `Remove` for the same key,
  /// otherwise the edit never completed.
  Dirty(&'a str),
  /// An edit was published. Carries the byte length of every value slot.
  Clean {
    key: &'a str,
    lengths: Cow<'a, [u64]>,
  },
  /// The entry was removed, either explicitly, by eviction, or by an aborted first edit.
  Remove(&'a str),
  /// The entry was read. Only affects LRU order.
  Read(&'a str),
}

impl<'a> Record<'a> {
  #[must_use]
  pub const fn key(&self) -> &'a str {
    match *self {
      Self::Dirty(key) | Self::Remove(key) | Self::Read(key) | Self::Clean { key, .. } => key,
    }
  }

  /// Whether the record must reach the OS before the operation that wrote it returns. Only
  /// `READ` records are allowed to sit in the write buffer.
  #[must_use]
  pub const fn requires_flush(&self) -> bool {
    !matches!(self, Self::Read(_))
  }

  /// Parse a single journal line, without its terminating newline.
  ///
  /// # Errors
  /// Returns [`Error::CorruptJournal`] for unknown record kinds, wrong field counts, empty fields,
  /// keys that could not have been written by the cache, size fields that are not unsigned
  /// decimal integers and sizes whose sum doesn't fit in a `u64`.
  pub fn parse(line: &'a str, value_count: usize) -> Result<Self> {
    let mut fields = line.split(' ');
    let kind = fields.next().unwrap_or_default();
    let Some(key) = fields.next().filter(|key| validate_key(key).is_ok()) else {
      return Err(corrupt_line(line));
    };

    let record = match kind {
      DIRTY => Self::Dirty(key),
      REMOVE => Self::Remove(key),
      READ => Self::Read(key),
      CLEAN => {
        let lengths = fields
          .by_ref()
          .take(value_count)
          .map(parse_length)
          .collect::<Option<Vec<_>>>()
          .ok_or_else(|| corrupt_line(line))?;
        if lengths.len() != value_count
          || lengths
            .iter()
            .try_fold(0u64, |total, length| total.checked_add(*length))
            .is_none()
        {
          return Err(corrupt_line(line));
        }

        Self::Clean {
          key,
          lengths: Cow::Owned(lengths),
        }
      },
      _ => return Err(corrupt_line(line)),
    };

    if fields.next().is_some() {
      return Err(corrupt_line(line));
    }

    Ok(record)
  }
}

impl fmt::Display for Record<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Dirty(key) => write!(f, "{DIRTY} {key}"),
      Self::Remove(key) => write!(f, "{REMOVE} {key}"),
      Self::Read(key) => write!(f, "{READ} {key}"),
      Self::Clean { key, lengths } => {
        write!(f, "{CLEAN} {key}")?;
        for length in lengths.iter() {
          write!(f, " {length}")?;
        }
        Ok(())
      },
    }
  }
}

fn parse_length(field: &str) -> Option<u64> {
  // u64::from_str accepts a leading '+', the journal grammar does not.
  if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
    return None;
  }
  field.parse().ok()
}

fn corrupt_line(line: &str) -> Error {
  Error::CorruptJournal(format!("unexpected journal line: {line:?}"))
}

//
// Reading
//

/// Whether the journal ended in the middle of a line. A torn final line is the remains of an
/// append that was interrupted by a crash and is dropped rather than treated as corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TornTail {
  Yes,
  No,
}

/// Summary of a successful journal replay.
#[derive(Debug)]
pub struct Replay {
  /// Number of complete record lines that were replayed.
  pub record_count: usize,
  pub torn_tail: TornTail,
}

/// Validate the journal header at `path` and invoke `f` for every complete record line in order.
///
/// If an error is returned `f` may already have observed a prefix of the records; callers are
/// expected to throw away whatever they built from them.
///
/// # Errors
/// Returns [`Error::CorruptJournal`] if the header does not match `value_count` or any complete
/// line fails to parse, and [`Error::Io`] if the file cannot be read.
pub fn replay(path: &Path, value_count: usize, mut f: impl FnMut(Record<'_>)) -> Result<Replay> {
  let bytes = std::fs::read(path)?;
  let contents = std::str::from_utf8(&bytes)
    .map_err(|e| Error::CorruptJournal(format!("journal is not valid UTF-8: {e}")))?;

  // The final element is whatever follows the last newline, which is empty for a well formed
  // journal.
  let mut lines: Vec<&str> = contents.split('\n').collect();
  let tail = lines.pop().unwrap_or_default();

  if lines.len() < HEADER_LINES {
    return Err(Error::CorruptJournal(format!(
      "journal header is truncated: {} complete lines",
      lines.len()
    )));
  }

  let expected_value_count = value_count.to_string();
  let header = &lines[.. HEADER_LINES];
  if header != [MAGIC, VERSION, expected_value_count.as_str(), ""] {
    return Err(Error::CorruptJournal(format!(
      "unexpected journal header: {header:?}"
    )));
  }

  let body = &lines[HEADER_LINES ..];
  for line in body {
    f(Record::parse(line, value_count)?);
  }

  let torn_tail = if tail.is_empty() {
    TornTail::No
  } else {
    log::debug!("discarding torn journal line: {tail:?}");
    TornTail::Yes
  };

  Ok(Replay {
    record_count: body.len(),
    torn_tail,
  })
}

//
// Writing
//

fn write_header(writer: &mut impl Write, value_count: usize) -> std::io::Result<()> {
  writeln!(writer, "{MAGIC}")?;
  writeln!(writer, "{VERSION}")?;
  writeln!(writer, "{value_count}")?;
  writeln!(writer)
}

/// Write a complete journal (header followed by `records`) to `path`, replacing any existing file,
/// and sync it to disk before returning.
///
/// # Errors
/// Returns an error if the file cannot be created, written or synced.
pub fn write_journal<'a>(
  path: &Path,
  value_count: usize,
  records: impl IntoIterator<Item = Record<'a>>,
) -> std::io::Result<()> {
  let mut writer = BufWriter::new(File::create(path)?);
  write_header(&mut writer, value_count)?;
  for record in records {
    writeln!(writer, "{record}")?;
  }
  writer.flush()?;
  writer.get_ref().sync_all()
}

//
// JournalWriter
//

/// Append-only writer for an existing journal.
pub struct JournalWriter {
  writer: BufWriter<File>,
}

impl JournalWriter {
  /// Open the journal at `path` for appending. The header must already be present.
  ///
  /// # Errors
  /// Returns an error if the file cannot be opened.
  pub fn open(path: &Path) -> std::io::Result<Self> {
    let file = File::options().append(true).open(path)?;
    Ok(Self {
      writer: BufWriter::new(file),
    })
  }

  /// Append a record. Records other than `READ` are flushed to the OS before returning.
  ///
  /// # Errors
  /// Returns an error if the record cannot be written.
  pub fn append(&mut self, record: &Record<'_>) -> std::io::Result<()> {
    log::trace!("journal append: {record}");
    writeln!(self.writer, "{record}")?;
    if record.requires_flush() {
      self.writer.flush()?;
    }
    Ok(())
  }

  /// Flush buffered records and sync the journal to durable storage.
  ///
  /// # Errors
  /// Returns an error if the flush or sync fails.
  pub fn sync(&mut self) -> std::io::Result<()> {
    self.writer.flush()?;
    self.writer.get_ref().sync_data()
  }
}
