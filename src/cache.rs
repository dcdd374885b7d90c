//! On-disk cache of tokenized datasets
//!
//! Datasets are stored as JSON under the data root. A file's presence is
//! the only freshness signal: nothing is rebuilt while all expected files
//! exist. Files are written through a temporary file and renamed into
//! place, so a concurrent reader never observes a half-written dataset.

use crate::error::Result;
use crate::jsonl::write_atomic;
use serde::{de::DeserializeOwned, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const CACHE_EXTENSION: &str = "json";

/// Train, validation and test datasets, in that order.
pub type DatasetSplits<T> = (T, T, T);

/// Identifies one family of cached datasets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    tokenizer_name: String,
    num_clients: usize,
    variant: Option<String>,
}

impl CacheKey {
    pub fn new(tokenizer_name: &str, num_clients: usize) -> Self {
        Self {
            tokenizer_name: tokenizer_name.to_string(),
            num_clients,
            variant: None,
        }
    }

    pub fn variant(mut self, variant: &str) -> Self {
        self.variant = Some(variant.to_string());
        self
    }

    /// `{tokenizer}_{split}[_{variant}][_{num_clients}]`; only the train
    /// split carries the client count, so val/test are shared across runs
    /// with different numbers of clients.
    pub fn file_stem(&self, split: &str) -> String {
        let mut stem = format!("{}_{split}", self.tokenizer_name);
        if let Some(variant) = &self.variant {
            stem.push('_');
            stem.push_str(variant);
        }
        if split == "train" {
            stem.push_str(&format!("_{}", self.num_clients));
        }
        stem
    }

    pub fn file_stems(&self) -> [String; 3] {
        ["train", "val", "test"].map(|split| self.file_stem(split))
    }
}

#[derive(Debug, Clone)]
pub struct DatasetCache {
    root: PathBuf,
}

impl DatasetCache {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, stem: &str) -> PathBuf {
        self.root.join(format!("{stem}.{CACHE_EXTENSION}"))
    }

    pub fn paths(&self, key: &CacheKey) -> [PathBuf; 3] {
        key.file_stems().map(|stem| self.path(&stem))
    }

    /// Returns the cached splits for `key`, or builds and stores them.
    pub fn get_or_build<T, F>(&self, key: &CacheKey, build_fn: F) -> Result<DatasetSplits<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<DatasetSplits<T>>,
    {
        let [train_fp, val_fp, test_fp] = self.paths(key);
        if train_fp.exists() && val_fp.exists() && test_fp.exists() {
            debug!(path = %train_fp.display(), "loading cached datasets");
            return Ok((load(&train_fp)?, load(&val_fp)?, load(&test_fp)?));
        }

        let (train, val, test) = build_fn()?;
        store(&train_fp, &train)?;
        store(&val_fp, &val)?;
        store(&test_fp, &test)?;
        info!(path = %train_fp.display(), "cached tokenized datasets");
        Ok((train, val, test))
    }

    /// Single-file variant of [`DatasetCache::get_or_build`].
    pub fn get_or_build_one<T, F>(&self, stem: &str, build_fn: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T>,
    {
        let path = self.path(stem);
        if path.exists() {
            debug!(path = %path.display(), "loading cached dataset");
            return load(&path);
        }
        let dataset = build_fn()?;
        store(&path, &dataset)?;
        info!(path = %path.display(), "cached tokenized dataset");
        Ok(dataset)
    }
}

fn load<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

fn store<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    write_atomic(path, |out| {
        serde_json::to_writer(&mut *out, value)?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use rstest::*;
    use std::cell::Cell;
    use tempfile::tempdir;

    #[rstest]
    #[case(None, ["gpt2_train_3", "gpt2_val", "gpt2_test"])]
    #[case(Some("choice"), ["gpt2_train_choice_3", "gpt2_val_choice", "gpt2_test_choice"])]
    fn test_file_stems(#[case] variant: Option<&str>, #[case] expected: [&str; 3]) {
        let mut key = CacheKey::new("gpt2", 3);
        if let Some(variant) = variant {
            key = key.variant(variant);
        }
        assert_eq!(key.file_stems(), expected.map(String::from));
    }

    #[rstest]
    fn test_second_call_reads_cache_without_building() -> Result<()> {
        let dir = tempdir()?;
        let cache = DatasetCache::new(dir.path());
        let key = CacheKey::new("gpt2", 2);
        let builds = Cell::new(0);
        let build = || {
            builds.set(builds.get() + 1);
            Ok((vec![1_u32, 2, 3], vec![4_u32], vec![5_u32, 6]))
        };

        let first: DatasetSplits<Vec<u32>> = cache.get_or_build(&key, build)?;
        let bytes: Vec<Vec<u8>> = cache
            .paths(&key)
            .iter()
            .map(std::fs::read)
            .collect::<std::io::Result<_>>()?;

        let second: DatasetSplits<Vec<u32>> = cache.get_or_build(&key, || {
            builds.set(builds.get() + 1);
            Ok((vec![], vec![], vec![]))
        })?;

        assert_eq!(builds.get(), 1);
        assert_eq!(first, second);
        for (path, before) in cache.paths(&key).iter().zip(bytes) {
            assert_eq!(std::fs::read(path)?, before);
        }
        Ok(())
    }

    #[rstest]
    fn test_partial_cache_is_rebuilt() -> Result<()> {
        let dir = tempdir()?;
        let cache = DatasetCache::new(dir.path());
        let key = CacheKey::new("gpt2", 2);
        std::fs::write(cache.path(&key.file_stem("val")), "[9]")?;

        let (train, val, _): DatasetSplits<Vec<u32>> =
            cache.get_or_build(&key, || Ok((vec![1], vec![2], vec![3])))?;

        assert_eq!(train, vec![1]);
        assert_eq!(val, vec![2]);
        assert_eq!(std::fs::read_to_string(cache.path(&key.file_stem("val")))?, "[2]");
        Ok(())
    }

    #[rstest]
    fn test_get_or_build_one() -> Result<()> {
        let dir = tempdir()?;
        let cache = DatasetCache::new(dir.path());
        let first: Vec<String> =
            cache.get_or_build_one("gpt2_alpacafarm_human_choice", || Ok(vec!["x".into()]))?;
        let second: Vec<String> =
            cache.get_or_build_one("gpt2_alpacafarm_human_choice", || Ok(vec![]))?;
        assert_eq!(first, second);
        Ok(())
    }
}
