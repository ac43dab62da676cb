// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use arbitrary::Arbitrary;
use std::io::Read;

pub mod disk_lru_cache_fuzz_test;

#[cfg(test)]
#[ctor::ctor]
fn test_global_init() {
  let _ignored = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

/// Keys used by the fuzz tests. A small pool makes collisions between operations likely.
const KEYS: [&str; 8] = ["k0", "k1", "k2", "k3", "k4", "k5", "k6", "k7"];

#[must_use]
pub fn key(index: u8) -> &'static str {
  KEYS[usize::from(index) % KEYS.len()]
}

// Runs every file of a saved corpus through `fuzzer`. A missing corpus directory runs nothing.
pub fn run_all_corpus<T: for<'a> Arbitrary<'a>>(corpus_path: &str, fuzzer: impl Fn(T)) {
  let Ok(dir) = std::fs::read_dir(corpus_path) else {
    log::info!("no corpus at {corpus_path}");
    return;
  };
  for path in dir {
    let path = path.unwrap().path();
    let mut file = std::fs::File::open(path.clone()).unwrap();
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer).unwrap();
    log::info!("running corpus file: {}", path.display());
    let corpus = T::arbitrary(&mut arbitrary::Unstructured::new(&buffer)).unwrap();
    fuzzer(corpus);
  }
}

// Runs `fuzzer` over inputs derived from a handful of fixed byte patterns so the harness is
// exercised by a plain test run. Inputs are decoded the way libfuzzer hands them to a target, so
// trailing collections take the rest of the pattern instead of being sized from its last bytes.
pub fn run_seeded<T: for<'a> Arbitrary<'a>>(mut fuzzer: impl FnMut(T)) {
  for seed in 0u8 .. 16 {
    let buffer: Vec<u8> = (0u16 .. 4096)
      .map(|i| {
        #[allow(clippy::cast_possible_truncation)]
        let byte = (i.wrapping_mul(u16::from(seed) * 2 + 1) >> 3) as u8;
        byte ^ seed.wrapping_mul(37)
      })
      .collect();
    let Ok(input) = T::arbitrary_take_rest(arbitrary::Unstructured::new(&buffer)) else {
      continue;
    };
    log::info!("running seed {seed}");
    fuzzer(input);
  }
}
