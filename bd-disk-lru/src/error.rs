// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[derive(thiserror::Error, Debug)]
pub enum Error {
  #[error("Invalid key {key:?}: {reason}")]
  InvalidKey { key: String, reason: &'static str },
  #[error("Invalid argument: {0}")]
  InvalidArgument(String),
  #[error("Slot index {index} out of range, entries have {value_count} values")]
  SlotOutOfRange { index: usize, value_count: usize },
  #[error("Illegal state: {0}")]
  IllegalState(&'static str),
  #[error("Cache is closed")]
  Closed,
  #[error("Corrupt journal: {0}")]
  CorruptJournal(String),
  #[error("An I/O error occurred: {0}")]
  Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
