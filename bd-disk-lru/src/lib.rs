// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#![deny(
  clippy::expect_used,
  clippy::panic,
  clippy::todo,
  clippy::unimplemented,
  clippy::unreachable,
  clippy::unwrap_used
)]

#[cfg(test)]
#[ctor::ctor]
fn test_global_init() {
  // Route `log` records through a test-captured subscriber. Set RUST_LOG to see them.
  let _ignored = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

#[cfg(test)]
mod tests;

mod cache;
pub mod config;
mod editor;
mod entry;
mod error;
pub mod journal;
mod recovery;
mod snapshot;

pub use cache::DiskLruCache;
pub use config::{CacheConfig, DEFAULT_REBUILD_THRESHOLD};
pub use editor::{Editor, SlotWriter};
pub use error::{Error, Result};
pub use recovery::DataLoss;
pub use snapshot::{Snapshot, SlotReader};
