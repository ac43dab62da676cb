// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::cli::{Command, GetCommand, Options, SetCommand};
use anyhow::{anyhow, bail};
use bd_disk_lru::{DataLoss, DiskLruCache};
use clap::Parser;
use std::io::{Read, Write};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

mod cli;

fn main() -> anyhow::Result<()> {
  // initialize console logging
  init_tracing();
  let args = Options::parse();

  let cache = DiskLruCache::open(&args.directory, args.value_count, args.max_size)?;
  if cache.data_loss() != DataLoss::None {
    log::warn!(
      "cache directory was repaired on open: {:?} data loss",
      cache.data_loss()
    );
  }

  match args.command {
    Command::Set(cmd) => set(&cache, &cmd)?,
    Command::Get(cmd) => get(&cache, &cmd)?,
    Command::Remove(cmd) => {
      if !cache.remove(&cmd.key)? {
        bail!("no removable entry for {:?}", cmd.key);
      }
    },
    Command::Stat => {
      println!("directory:   {}", cache.directory().display());
      println!("value count: {}", cache.value_count());
      println!("entries:     {}", cache.len());
      println!("size:        {}", cache.size());
      println!("max size:    {}", cache.max_size());
    },
    Command::Compact => cache.rebuild_journal()?,
  }

  cache.close()?;
  Ok(())
}

fn set(cache: &DiskLruCache, cmd: &SetCommand) -> anyhow::Result<()> {
  if cmd.values.len() != cache.value_count() {
    bail!(
      "expected {} values, got {}",
      cache.value_count(),
      cmd.values.len()
    );
  }

  let mut editor = cache
    .edit(&cmd.key)?
    .ok_or_else(|| anyhow!("{:?} is being edited", cmd.key))?;
  for (index, value) in cmd.values.iter().enumerate() {
    editor.set(index, value)?;
  }
  editor.commit()?;
  Ok(())
}

fn get(cache: &DiskLruCache, cmd: &GetCommand) -> anyhow::Result<()> {
  let snapshot = cache
    .get(&cmd.key)?
    .ok_or_else(|| anyhow!("no entry for {:?}", cmd.key))?;

  let mut stdout = std::io::stdout().lock();
  let indexes = match cmd.index {
    Some(index) => index ..= index,
    None => 0 ..= cache.value_count() - 1,
  };
  for index in indexes {
    let mut value = Vec::new();
    snapshot.new_reader(index)?.read_to_end(&mut value)?;
    if cmd.index.is_none() {
      write!(stdout, "{index}: ")?;
    }
    stdout.write_all(&value)?;
    writeln!(stdout)?;
  }
  Ok(())
}

fn init_tracing() {
  let stderr = tracing_subscriber::fmt::layer()
    .with_writer(std::io::stderr)
    .with_ansi(true)
    .with_line_number(true)
    .compact();

  let filter = EnvFilter::new(std::env::var("RUST_LOG").as_deref().unwrap_or("info"));

  Registry::default().with(filter).with(stderr).init();
}
