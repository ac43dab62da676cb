// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

use crate::{Error, Result};

/// Redundant journal records tolerated before the journal is rebuilt.
pub const DEFAULT_REBUILD_THRESHOLD: usize = 2000;

/// Configuration supplied when opening a [`crate::DiskLruCache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
  /// Number of value slots per entry. Fixed for the lifetime of a cache directory; reopening with
  /// a different count discards the directory contents.
  pub value_count: usize,

  /// Maximum number of bytes the cache should use to store its values. This is a soft bound:
  /// entries that are being edited are never evicted.
  pub max_size: u64,

  /// Number of redundant journal records that must accumulate (and exceed the number of live
  /// entries) before the journal is compacted.
  pub rebuild_threshold: usize,
}

impl CacheConfig {
  #[must_use]
  pub const fn new(value_count: usize, max_size: u64) -> Self {
    Self {
      value_count,
      max_size,
      rebuild_threshold: DEFAULT_REBUILD_THRESHOLD,
    }
  }

  /// Reject configurations the cache cannot operate with.
  ///
  /// # Errors
  /// Returns [`Error::InvalidArgument`] if any field is zero.
  pub fn validate(&self) -> Result<()> {
    if self.value_count < 1 {
      return Err(Error::InvalidArgument(format!(
        "value_count must be at least 1, got {}",
        self.value_count
      )));
    }
    validate_max_size(self.max_size)?;
    if self.rebuild_threshold < 1 {
      return Err(Error::InvalidArgument(
        "rebuild_threshold must be at least 1".to_string(),
      ));
    }
    Ok(())
  }
}

pub(crate) fn validate_max_size(max_size: u64) -> Result<()> {
  if max_size < 1 {
    return Err(Error::InvalidArgument(format!(
      "max_size must be at least 1, got {max_size}"
    )));
  }
  Ok(())
}
