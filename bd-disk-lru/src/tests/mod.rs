// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

//! Cache level tests for bd-disk-lru

#![allow(
  clippy::unwrap_used,
  clippy::panic,
  clippy::manual_assert,
  clippy::items_after_statements
)]

use crate::journal::{MAGIC, VERSION};
use crate::{CacheConfig, DiskLruCache};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub mod concurrency_test;

/// A cache with two values per entry in a temporary directory.
pub struct Setup {
  pub cache: DiskLruCache,
  pub directory: PathBuf,
  _temp_dir: TempDir,
}

impl Setup {
  pub fn new() -> Self {
    Self::with_config(CacheConfig::new(2, u64::MAX))
  }

  pub fn with_max_size(max_size: u64) -> Self {
    Self::with_config(CacheConfig::new(2, max_size))
  }

  pub fn with_config(config: CacheConfig) -> Self {
    let temp_dir = TempDir::new().unwrap();
    let directory = temp_dir.path().join("cache");
    let cache = DiskLruCache::open_with_config(&directory, config).unwrap();
    Self {
      cache,
      directory,
      _temp_dir: temp_dir,
    }
  }

  /// Close the current cache and open the directory again.
  pub fn reopen(&mut self, max_size: u64) {
    self.reopen_with_config(CacheConfig::new(2, max_size));
  }

  pub fn reopen_with_config(&mut self, config: CacheConfig) {
    self.cache.close().unwrap();
    self.cache = DiskLruCache::open_with_config(&self.directory, config).unwrap();
  }

  /// Close the current cache so the test can tamper with the directory.
  pub fn close(&self) {
    self.cache.close().unwrap();
  }

  pub fn set(&self, key: &str, value0: &str, value1: &str) {
    let mut editor = self.cache.edit(key).unwrap().unwrap();
    editor.set(0, value0).unwrap();
    editor.set(1, value1).unwrap();
    editor.commit().unwrap();
  }

  pub fn clean_file(&self, key: &str, index: usize) -> PathBuf {
    self.directory.join(format!("{key}.{index}"))
  }

  pub fn dirty_file(&self, key: &str, index: usize) -> PathBuf {
    self.directory.join(format!("{key}.{index}.tmp"))
  }

  pub fn journal_file(&self) -> PathBuf {
    self.directory.join("journal")
  }

  pub fn assert_value(&self, key: &str, value0: &str, value1: &str) {
    let snapshot = self.cache.get(key).unwrap().unwrap();
    assert_eq!(snapshot.get_string(0).unwrap(), value0);
    assert_eq!(snapshot.get_string(1).unwrap(), value1);
    assert!(self.clean_file(key, 0).exists());
    assert!(self.clean_file(key, 1).exists());
  }

  pub fn assert_absent(&self, key: &str) {
    assert!(self.cache.get(key).unwrap().is_none(), "{key} is present");
    for index in 0 .. 2 {
      assert!(!self.clean_file(key, index).exists());
      assert!(!self.dirty_file(key, index).exists());
    }
  }

  pub fn journal_body(&self) -> Vec<String> {
    read_journal_body(&self.journal_file())
  }

  pub fn write_journal(&self, body: &[&str]) {
    write_journal_with_header(&self.journal_file(), MAGIC, VERSION, "2", "", body);
  }
}

pub fn write_journal_with_header(
  path: &Path,
  magic: &str,
  version: &str,
  value_count: &str,
  blank: &str,
  body: &[&str],
) {
  let mut contents = format!("{magic}\n{version}\n{value_count}\n{blank}\n");
  for line in body {
    contents.push_str(line);
    contents.push('\n');
  }
  std::fs::write(path, contents).unwrap();
}

/// The journal lines after the header, which is checked against a two value cache.
pub fn read_journal_body(path: &Path) -> Vec<String> {
  let contents = std::fs::read_to_string(path).unwrap();
  let lines: Vec<String> = contents.lines().map(str::to_string).collect();
  assert_eq!(lines[.. 4], [MAGIC, VERSION, "2", ""]);
  lines[4 ..].to_vec()
}
