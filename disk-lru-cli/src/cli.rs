// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Options {
  /// Cache directory
  #[clap(env = "DISK_LRU_DIR", long)]
  pub directory: PathBuf,

  /// Number of values stored per entry
  #[clap(env = "DISK_LRU_VALUE_COUNT", long, required = false, default_value = "1")]
  pub value_count: usize,

  /// Maximum number of bytes the cache may hold
  #[clap(
    env = "DISK_LRU_MAX_SIZE",
    long,
    required = false,
    default_value = "10485760"
  )]
  pub max_size: u64,

  /// Command to run
  #[command(subcommand)]
  pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Store an entry, replacing any existing one
  Set(SetCommand),

  /// Print the values of an entry
  Get(GetCommand),

  /// Remove an entry
  Remove(KeyCommand),

  /// Print cache size and entry count
  Stat,

  /// Rewrite the journal with one record per entry
  Compact,
}

#[derive(Args, Debug)]
pub struct SetCommand {
  /// Entry key
  pub key: String,

  /// One value per slot
  #[clap(action=ArgAction::Append, required = true)]
  pub values: Vec<String>,
}

#[derive(Args, Debug)]
pub struct GetCommand {
  /// Entry key
  pub key: String,

  /// Only print the value in this slot
  #[clap(long)]
  pub index: Option<usize>,
}

#[derive(Args, Debug)]
pub struct KeyCommand {
  /// Entry key
  pub key: String,
}
