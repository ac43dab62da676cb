// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::{CacheConfig, DiskLruCache};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::TempDir;

#[test]
fn concurrent_writers_on_distinct_keys() {
  let temp_dir = TempDir::new().unwrap();
  let mut config = CacheConfig::new(2, u64::MAX);
  config.rebuild_threshold = 16;
  let cache = Arc::new(DiskLruCache::open_with_config(temp_dir.path(), config.clone()).unwrap());

  let threads = 4;
  let per_thread = 25;
  let barrier = Arc::new(Barrier::new(threads));
  let handles: Vec<_> = (0 .. threads)
    .map(|thread_index| {
      let cache = Arc::clone(&cache);
      let barrier = Arc::clone(&barrier);
      thread::spawn(move || {
        barrier.wait();
        for i in 0 .. per_thread {
          let key = format!("t{thread_index}-{i}");
          let mut editor = cache.edit(&key).unwrap().unwrap();
          editor.set(0, &key).unwrap();
          editor.set(1, "v").unwrap();
          editor.commit().unwrap();

          let snapshot = cache.get(&key).unwrap().unwrap();
          assert_eq!(snapshot.get_string(0).unwrap(), key);
        }
      })
    })
    .collect();
  for handle in handles {
    handle.join().unwrap();
  }

  assert_eq!(cache.len(), threads * per_thread);
  let expected_size: u64 = (0 .. threads)
    .flat_map(|t| (0 .. per_thread).map(move |i| format!("t{t}-{i}").len() as u64 + 1))
    .sum();
  assert_eq!(cache.size(), expected_size);

  // Journal rebuilds happened concurrently with the writes; everything must still replay.
  cache.close().unwrap();
  drop(cache);
  let cache = DiskLruCache::open_with_config(temp_dir.path(), config).unwrap();
  assert_eq!(cache.len(), threads * per_thread);
  assert_eq!(cache.size(), expected_size);
}

#[test]
fn only_one_editor_wins_per_key() {
  let temp_dir = TempDir::new().unwrap();
  let cache = Arc::new(DiskLruCache::open(temp_dir.path(), 2, u64::MAX).unwrap());

  let threads = 8;
  let barrier = Arc::new(Barrier::new(threads));
  let winners = Arc::new(Mutex::new(HashSet::new()));
  let handles: Vec<_> = (0 .. threads)
    .map(|thread_index| {
      let cache = Arc::clone(&cache);
      let barrier = Arc::clone(&barrier);
      let winners = Arc::clone(&winners);
      thread::spawn(move || {
        barrier.wait();
        if let Some(editor) = cache.edit("shared").unwrap() {
          winners.lock().insert(thread_index);
          // Hold the edit until every thread has tried.
          barrier.wait();
          drop(editor);
        } else {
          barrier.wait();
        }
      })
    })
    .collect();
  for handle in handles {
    handle.join().unwrap();
  }

  assert_eq!(winners.lock().len(), 1);
  assert!(cache.get("shared").unwrap().is_none());
}

#[test]
fn readers_see_complete_versions_while_writer_updates() {
  let temp_dir = TempDir::new().unwrap();
  let cache = Arc::new(DiskLruCache::open(temp_dir.path(), 2, u64::MAX).unwrap());
  {
    let mut editor = cache.edit("k").unwrap().unwrap();
    editor.set(0, "0").unwrap();
    editor.set(1, "0").unwrap();
    editor.commit().unwrap();
  }

  let writer = {
    let cache = Arc::clone(&cache);
    thread::spawn(move || {
      for version in 1 .. 50 {
        let value = version.to_string();
        let mut editor = cache.edit("k").unwrap().unwrap();
        editor.set(0, &value).unwrap();
        editor.set(1, &value).unwrap();
        editor.commit().unwrap();
      }
    })
  };

  let readers: Vec<_> = (0 .. 3)
    .map(|_| {
      let cache = Arc::clone(&cache);
      thread::spawn(move || {
        for _ in 0 .. 50 {
          let Some(snapshot) = cache.get("k").unwrap() else {
            continue;
          };
          let first = snapshot.get_string(0).unwrap();
          let second = snapshot.get_string(1).unwrap();
          // Both values of a snapshot were opened under the same lock, so they come from the
          // same commit.
          assert_eq!(first, second);
        }
      })
    })
    .collect();

  writer.join().unwrap();
  for reader in readers {
    reader.join().unwrap();
  }
}
