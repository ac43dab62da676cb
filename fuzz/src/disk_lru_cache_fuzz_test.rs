// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::key;
use arbitrary::Arbitrary;
use bd_disk_lru::journal::JOURNAL_FILE;
use bd_disk_lru::{CacheConfig, DataLoss, DiskLruCache, Snapshot};
use std::collections::BTreeMap;
use std::io::Read;
use tempfile::TempDir;

const MAX_VALUE_LEN: usize = 32;

#[derive(Arbitrary, Debug)]
enum Action {
  Set { key: u8, values: Vec<Vec<u8>> },
  // Rewrite a single slot of a readable entry.
  Update { key: u8, index: u8, value: Vec<u8> },
  Abort { key: u8, value: Vec<u8> },
  Get { key: u8 },
  Remove { key: u8 },
  SetMaxSize { max_size: u16 },
  Flush,
  RebuildJournal,
  Reopen,
  // Overwrite one byte of the journal while the cache is closed.
  ReopenWithCorruption { offset: u32, byte: u8 },
}

#[derive(Arbitrary, Debug)]
pub struct DiskLruCacheFuzzTestCase {
  value_count: u8,
  max_size: u16,
  rebuild_threshold: u8,
  actions: Vec<Action>,
}

type Values = Vec<Vec<u8>>;

pub struct DiskLruCacheFuzzTest {
  actions: Vec<Action>,
  config: CacheConfig,
  temp_dir: TempDir,

  // The last committed values of every key. Entries may since have been evicted, so a key in the
  // model may be missing from the cache, but a key present in the cache must hold these values.
  model: BTreeMap<&'static str, Values>,

  // Set once the journal has been corrupted. From then on the recorded lengths can't be trusted.
  corrupted: bool,
}

impl DiskLruCacheFuzzTest {
  #[must_use]
  pub fn new(test_case: DiskLruCacheFuzzTestCase) -> Self {
    let mut config = CacheConfig::new(
      1 + usize::from(test_case.value_count % 3),
      1 + u64::from(test_case.max_size % 512),
    );
    // A low threshold makes journal rebuilds part of most runs.
    config.rebuild_threshold = 1 + usize::from(test_case.rebuild_threshold % 32);

    Self {
      actions: test_case.actions,
      config,
      temp_dir: TempDir::new().unwrap(),
      model: BTreeMap::new(),
      corrupted: false,
    }
  }

  fn open(&self) -> DiskLruCache {
    DiskLruCache::open_with_config(self.temp_dir.path(), self.config.clone()).unwrap()
  }

  fn truncated(value: &[u8]) -> Vec<u8> {
    value[.. value.len().min(MAX_VALUE_LEN)].to_vec()
  }

  fn read_values(&self, snapshot: &Snapshot) -> Values {
    (0 .. self.config.value_count)
      .map(|index| {
        let mut value = Vec::new();
        snapshot
          .new_reader(index)
          .unwrap()
          .read_to_end(&mut value)
          .unwrap();
        value
      })
      .collect()
  }

  fn check_key(&self, cache: &DiskLruCache, key: &'static str) -> Option<Values> {
    let snapshot = cache.get(key).unwrap()?;
    let values = self.read_values(&snapshot);

    let Some(expected) = self.model.get(key) else {
      assert!(self.corrupted, "{key} is readable but was never committed");
      return Some(values);
    };
    assert_eq!(&values, expected, "{key} holds stale values");
    if !self.corrupted {
      for (index, value) in values.iter().enumerate() {
        assert_eq!(snapshot.length(index).unwrap(), value.len() as u64);
      }
    }
    Some(values)
  }

  // Reads every key the model knows about and verifies the size accounting. Returns the entries
  // that were readable.
  fn check(&self, cache: &DiskLruCache) -> BTreeMap<&'static str, Values> {
    let keys: Vec<_> = self.model.keys().copied().collect();
    let present: BTreeMap<_, _> = keys
      .into_iter()
      .filter_map(|key| self.check_key(cache, key).map(|values| (key, values)))
      .collect();

    if !self.corrupted {
      let size: u64 = present.values().flatten().map(|v| v.len() as u64).sum();
      assert_eq!(cache.size(), size);
      assert_eq!(cache.len(), present.len());
      assert!(cache.size() <= cache.max_size());
    }
    present
  }

  fn corrupt_journal(&self, offset: u32, byte: u8) {
    let path = self.temp_dir.path().join(JOURNAL_FILE);
    let mut journal = std::fs::read(&path).unwrap();
    if journal.is_empty() {
      return;
    }
    let offset = offset as usize % journal.len();
    log::debug!("corrupting journal byte {offset}: {:?}", journal[offset]);
    journal[offset] = byte;
    std::fs::write(&path, journal).unwrap();
  }

  pub fn run(mut self) {
    let mut cache = self.open();
    let actions = std::mem::take(&mut self.actions);

    for action in actions {
      log::trace!("action: {action:?}");
      match action {
        Action::Set { key: k, values } => {
          let key = key(k);
          let values: Values = (0 .. self.config.value_count)
            .map(|index| values.get(index).map_or_else(Vec::new, |v| Self::truncated(v)))
            .collect();

          // Edits never overlap here, so the entry is always available.
          let mut editor = cache.edit(key).unwrap().unwrap();
          for (index, value) in values.iter().enumerate() {
            editor.set(index, value).unwrap();
          }
          editor.commit().unwrap();
          self.model.insert(key, values);
        },
        Action::Update {
          key: k,
          index,
          value,
        } => {
          let key = key(k);
          let Some(snapshot) = cache.get(key).unwrap() else {
            continue;
          };
          let mut values = self.read_values(&snapshot);
          let index = usize::from(index) % self.config.value_count;
          values[index] = Self::truncated(&value);

          let mut editor = cache.edit_snapshot(&snapshot).unwrap().unwrap();
          editor.set(index, &values[index]).unwrap();
          editor.commit().unwrap();
          self.model.insert(key, values);
        },
        Action::Abort { key: k, value } => {
          let key = key(k);
          let before = cache.get(key).unwrap().map(|s| self.read_values(&s));

          let mut editor = cache.edit(key).unwrap().unwrap();
          editor.set(0, Self::truncated(&value)).unwrap();
          editor.abort().unwrap();

          if !self.corrupted {
            let after = cache.get(key).unwrap().map(|s| self.read_values(&s));
            assert_eq!(before, after);
          }
        },
        Action::Get { key: k } => {
          self.check_key(&cache, key(k));
        },
        Action::Remove { key: k } => {
          let key = key(k);
          let removed = cache.remove(key).unwrap();
          if removed && !self.corrupted {
            assert!(self.model.contains_key(key));
          }
          self.model.remove(key);
          assert!(cache.get(key).unwrap().is_none());
        },
        Action::SetMaxSize { max_size } => {
          cache.set_max_size(1 + u64::from(max_size % 512)).unwrap();
        },
        Action::Flush => cache.flush().unwrap(),
        Action::RebuildJournal => cache.rebuild_journal().unwrap(),
        Action::Reopen => {
          let before = self.check(&cache);
          cache.close().unwrap();
          drop(cache);

          cache = self.open();
          if !self.corrupted {
            assert_eq!(cache.data_loss(), DataLoss::None);
            assert_eq!(self.check(&cache), before);
          }
        },
        Action::ReopenWithCorruption { offset, byte } => {
          cache.close().unwrap();
          drop(cache);

          self.corrupt_journal(offset, byte);
          self.corrupted = true;
          cache = self.open();
        },
      }

      if !self.corrupted {
        assert!(cache.size() <= cache.max_size());
      }
    }

    self.check(&cache);
    cache.close().unwrap();
  }
}

#[test]
fn run_all_corpus() {
  crate::run_all_corpus(
    "corpus/disk_lru_cache_fuzz_test",
    |input: DiskLruCacheFuzzTestCase| {
      DiskLruCacheFuzzTest::new(input).run();
    },
  );
}

#[test]
fn run_seeded() {
  let mut actions = 0;
  crate::run_seeded(|input: DiskLruCacheFuzzTestCase| {
    actions += input.actions.len();
    DiskLruCacheFuzzTest::new(input).run();
  });
  // An inert harness would only open and close an empty cache.
  assert!(actions > 0);
}
