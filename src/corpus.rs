//! Raw corpus fetching and the on-disk JSONL record cache
//!
//! Records are fetched once from the Hugging Face hub and written to
//! `{root}/{task}_{split}.jsonl`; later runs read those files and never
//! touch the network. File existence is the only freshness check, so
//! delete the files to force a re-download.

use crate::error::{PipelineError, Result};
use crate::jsonl::{read_jsonl, write_atomic, write_jsonl};
use crate::records::{InstructionRecord, PreferenceRecord, PromptRecord, Splits};
use bytes::Bytes;
use polars::prelude::*;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const SHP_CORPUS: &str = "stanfordnlp/SHP";
pub const SAFE_RLHF_PROMPT_CORPUS: &str = "PKU-Alignment/PKU-SafeRLHF-prompt";
pub const DATASETS_SERVER_PARQUET_URL: &str = "https://datasets-server.huggingface.co/parquet";

/// Source split names paired with the suffix used for cache files.
const SPLIT_TAGS: [(&str, &str); 3] = [("train", "train"), ("validation", "val"), ("test", "test")];

/// Columnar frames keyed by split name (`train`, `validation`, `test`, ...)
pub type Corpus = BTreeMap<String, DataFrame>;

/// Where raw corpora come from
pub trait CorpusSource {
    /// Fetches every split of `corpus_id`. `config` selects a dataset
    /// configuration; `None` means the default one.
    fn fetch(&self, corpus_id: &str, config: Option<&str>) -> anyhow::Result<Corpus>;
}

#[derive(Debug, Deserialize)]
struct ParquetListing {
    parquet_files: Vec<ParquetFile>,
}

#[derive(Debug, Deserialize)]
struct ParquetFile {
    config: String,
    split: String,
    url: String,
    filename: String,
}

/// Fetches the parquet conversion of a hub dataset, keeping the shards
/// under `cache_dir` so a rebuild does not download them again.
pub struct HfParquetSource {
    cache_dir: PathBuf,
    listing_url: String,
}

impl HfParquetSource {
    pub fn new<P: AsRef<Path>>(cache_dir: P) -> Self {
        Self {
            cache_dir: cache_dir.as_ref().to_path_buf(),
            listing_url: DATASETS_SERVER_PARQUET_URL.to_string(),
        }
    }

    pub fn listing_url(mut self, listing_url: &str) -> Self {
        self.listing_url = listing_url.to_string();
        self
    }

    fn download_shard(&self, corpus_id: &str, shard: &ParquetFile) -> anyhow::Result<PathBuf> {
        let dir = self
            .cache_dir
            .join(corpus_id.replace('/', "__"))
            .join(&shard.config)
            .join(&shard.split);
        let file_path = dir.join(&shard.filename);
        if !file_path.exists() {
            info!(url = %shard.url, "downloading parquet shard");
            let resp = reqwest::blocking::get(&shard.url)?.error_for_status()?;
            let content: Bytes = resp.bytes()?;
            write_atomic(&file_path, |out| {
                out.write_all(&content)?;
                Ok(())
            })?;
        }
        Ok(file_path)
    }
}

impl CorpusSource for HfParquetSource {
    fn fetch(&self, corpus_id: &str, config: Option<&str>) -> anyhow::Result<Corpus> {
        let config = config.unwrap_or("default");
        let listing: ParquetListing = reqwest::blocking::Client::new()
            .get(&self.listing_url)
            .query(&[("dataset", corpus_id)])
            .send()?
            .error_for_status()?
            .json()?;

        let mut corpus = Corpus::new();
        for shard in listing.parquet_files.iter().filter(|f| f.config == config) {
            let path = self.download_shard(corpus_id, shard)?;
            let mut file = File::open(&path)?;
            let df = ParquetReader::new(&mut file).finish()?;
            match corpus.get_mut(&shard.split) {
                Some(existing) => {
                    existing.vstack_mut(&df)?;
                }
                None => {
                    corpus.insert(shard.split.clone(), df);
                }
            }
        }

        if corpus.is_empty() {
            anyhow::bail!("no parquet shards for {corpus_id} ({config})");
        }
        Ok(corpus)
    }
}

pub(crate) fn split_frame<'a>(corpus: &'a Corpus, split: &str) -> Result<&'a DataFrame> {
    corpus
        .get(split)
        .ok_or_else(|| PipelineError::validation(format!("corpus has no `{split}` split")))
}

pub(crate) fn string_column(df: &DataFrame, name: &str) -> Result<Vec<String>> {
    let series = df
        .column(name)
        .map_err(anyhow::Error::from)?
        .as_materialized_series();
    let values = series.str().map_err(anyhow::Error::from)?;
    values
        .into_iter()
        .map(|v| {
            v.map(str::to_string)
                .ok_or_else(|| PipelineError::validation(format!("null value in column `{name}`")))
        })
        .collect()
}

pub(crate) fn int_column(df: &DataFrame, name: &str) -> Result<Vec<i64>> {
    let series = df
        .column(name)
        .map_err(anyhow::Error::from)?
        .as_materialized_series()
        .cast(&DataType::Int64)
        .map_err(anyhow::Error::from)?;
    let values = series.i64().map_err(anyhow::Error::from)?;
    values
        .into_iter()
        .map(|v| {
            v.ok_or_else(|| PipelineError::validation(format!("null value in column `{name}`")))
        })
        .collect()
}

/// SHP domains look like `askculinary_train`; the category is the part before `_`.
fn domain_category(domain: &str) -> String {
    domain.split('_').next().unwrap_or(domain).to_string()
}

fn split_paths(root: &Path, task: &str) -> [PathBuf; 3] {
    SPLIT_TAGS.map(|(_, suffix)| root.join(format!("{task}_{suffix}.jsonl")))
}

fn read_cached<T: serde::de::DeserializeOwned>(paths: &[PathBuf; 3]) -> Result<Option<Splits<T>>> {
    if paths.iter().all(|p| p.exists()) {
        debug!(path = %paths[0].display(), "reading cached records");
        let [train, val, test] = paths;
        return Ok(Some((read_jsonl(train)?, read_jsonl(val)?, read_jsonl(test)?)));
    }
    Ok(None)
}

pub(crate) fn fetch_or_missing(
    source: &dyn CorpusSource,
    corpus_id: &str,
    config: Option<&str>,
    expected: &Path,
) -> Result<Corpus> {
    source
        .fetch(corpus_id, config)
        .map_err(|source| PipelineError::MissingAsset {
            path: expected.to_path_buf(),
            source,
        })
}

fn comparisons_from_frame(df: &DataFrame) -> Result<Vec<PreferenceRecord>> {
    let history = string_column(df, "history")?;
    let ref_a = string_column(df, "human_ref_A")?;
    let ref_b = string_column(df, "human_ref_B")?;
    let labels = int_column(df, "labels")?;
    let domains = string_column(df, "domain")?;

    Ok(itertools::izip!(history, ref_a, ref_b, labels, domains)
        .map(|(instruction, output_a, output_b, choice, domain)| PreferenceRecord {
            instruction,
            output_a,
            output_b,
            choice,
            category: domain_category(&domain),
            domain: None,
        })
        .collect())
}

/// Loads SHP pairwise comparisons as `(train, val, test)`.
pub fn load_comparison_records<P: AsRef<Path>>(
    root: P,
    source: &dyn CorpusSource,
) -> Result<Splits<PreferenceRecord>> {
    let paths = split_paths(root.as_ref(), "shp_cmpr");
    if let Some(cached) = read_cached(&paths)? {
        return Ok(cached);
    }

    let corpus = fetch_or_missing(source, SHP_CORPUS, None, &paths[0])?;
    let mut splits: Vec<Vec<PreferenceRecord>> = vec![];
    for ((tag, _), path) in SPLIT_TAGS.iter().zip(paths.iter()) {
        let records = comparisons_from_frame(split_frame(&corpus, tag)?)?;
        write_jsonl(path, &records)?;
        info!(split = tag, n = records.len(), path = %path.display(), "wrote comparison records");
        splits.push(records);
    }

    let test = splits.pop().unwrap_or_default();
    let val = splits.pop().unwrap_or_default();
    let train = splits.pop().unwrap_or_default();
    Ok((train, val, test))
}

/// Loads the unique SHP instructions as `(train, val, test)`.
///
/// An instruction is kept only at its first occurrence, scanning train,
/// then validation, then test, so no instruction appears in two splits.
pub fn load_dedup_instructions<P: AsRef<Path>>(
    root: P,
    source: &dyn CorpusSource,
) -> Result<Splits<InstructionRecord>> {
    let paths = split_paths(root.as_ref(), "shp_rlhf");
    if let Some(cached) = read_cached(&paths)? {
        return Ok(cached);
    }

    let corpus = fetch_or_missing(source, SHP_CORPUS, None, &paths[0])?;
    let mut seen: HashSet<String> = HashSet::new();
    let mut splits: Vec<Vec<InstructionRecord>> = vec![];
    for ((tag, _), path) in SPLIT_TAGS.iter().zip(paths.iter()) {
        let df = split_frame(&corpus, tag)?;
        let history = string_column(df, "history")?;
        let domains = string_column(df, "domain")?;
        let records = dedup_instructions(
            history.into_iter().zip(domains.iter().map(|d| domain_category(d))),
            &mut seen,
        );
        write_jsonl(path, &records)?;
        info!(split = tag, n = records.len(), path = %path.display(), "wrote unique instructions");
        splits.push(records);
    }

    let test = splits.pop().unwrap_or_default();
    let val = splits.pop().unwrap_or_default();
    let train = splits.pop().unwrap_or_default();
    Ok((train, val, test))
}

/// Keeps the first `(instruction, category)` for every instruction not yet in `seen`.
pub fn dedup_instructions<I>(pairs: I, seen: &mut HashSet<String>) -> Vec<InstructionRecord>
where
    I: IntoIterator<Item = (String, String)>,
{
    pairs
        .into_iter()
        .filter_map(|(instruction, category)| {
            if seen.insert(instruction.clone()) {
                Some(InstructionRecord {
                    instruction,
                    category,
                    categories: None,
                })
            } else {
                None
            }
        })
        .collect()
}

/// Unique instructions re-split for RLHF-style reuse.
///
/// The new train split is validation followed by test; the new validation
/// and test splits are the first and second halves of test. Validation
/// and test are cut to `max_num_test` when given.
pub fn load_rlhf_dataset<P: AsRef<Path>>(
    root: P,
    source: &dyn CorpusSource,
    max_num_test: Option<usize>,
) -> Result<Splits<InstructionRecord>> {
    let (_, val, test) = load_dedup_instructions(root, source)?;
    Ok(relabel_for_rlhf(val, test, max_num_test))
}

pub(crate) fn relabel_for_rlhf(
    val: Vec<InstructionRecord>,
    test: Vec<InstructionRecord>,
    max_num_test: Option<usize>,
) -> Splits<InstructionRecord> {
    let half = test.len() / 2;
    let mut new_val = test[..half].to_vec();
    let mut new_test = test[half..].to_vec();
    let mut train = val;
    train.extend(test);

    if let Some(n) = max_num_test {
        new_val.truncate(n);
        new_test.truncate(n);
    }
    (train, new_val, new_test)
}

/// Safety prompts (train split only)
pub fn load_safe_prompts(source: &dyn CorpusSource) -> Result<Vec<PromptRecord>> {
    let corpus = fetch_or_missing(
        source,
        SAFE_RLHF_PROMPT_CORPUS,
        None,
        Path::new(SAFE_RLHF_PROMPT_CORPUS),
    )?;
    let prompts = string_column(split_frame(&corpus, "train")?, "prompt")?;
    Ok(prompts
        .into_iter()
        .map(|instruction| PromptRecord { instruction })
        .collect())
}
