//! Summarization evaluation on the Reddit TL;DR test set

use crate::error::{PipelineError, Result};
use crate::jsonl::{read_jsonl, write_atomic};
use crate::prompt::{Fields, PromptFormatter, PromptTemplate};
use crate::rouge::{Aggregator, RougeScorer, RougeScores};
use anyhow::Context;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::io::Write;
use std::path::{Path, PathBuf};
use tqdm::tqdm;
use tracing::{info, warn};

pub const TLDR_TEST_URL: &str = "https://openaipublic.blob.core.windows.net/\
    summarize-from-feedback/datasets/tldr_3_filtered/test.jsonl";
pub const TLDR_TEST_FILE: &str = "reddit-tldr_test.jsonl";

/// A Reddit post with its human summary, plus the model's attempt once scored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TldrRecord {
    pub subreddit: String,
    pub title: String,
    pub post: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<RougeScores>,
}

impl TldrRecord {
    pub fn new(subreddit: &str, title: &str, post: &str, summary: &str) -> Self {
        Self {
            subreddit: subreddit.to_string(),
            title: title.to_string(),
            post: post.to_string(),
            summary: summary.to_string(),
            completion: None,
            score: None,
        }
    }
}

impl Fields for TldrRecord {
    fn field(&self, name: &str) -> Option<&str> {
        match name {
            "subreddit" => Some(&self.subreddit),
            "title" => Some(&self.title),
            "post" => Some(&self.post),
            "summary" => Some(&self.summary),
            _ => None,
        }
    }
}

impl Display for TldrRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let score = self
            .score
            .as_ref()
            .and_then(|s| serde_json::to_string(s).ok())
            .unwrap_or_default();
        write!(
            f,
            "Subreddit: r/{}\n\nTitle:\n{}\n\nPost:\n{}\n\nHuman summary:\n{}\n\n\
            Model-generated summary 0:\n{}\n\nScore:\n{}\n\n",
            self.subreddit,
            self.title,
            self.post,
            self.summary,
            self.completion.as_deref().unwrap_or_default(),
            score
        )
    }
}

/// Reads `{root}/reddit-tldr_test.jsonl`, downloading it on first use.
pub fn load_tldr_test<P: AsRef<Path>>(root: P) -> Result<Vec<TldrRecord>> {
    load_tldr_test_from(root, TLDR_TEST_URL)
}

pub fn load_tldr_test_from<P: AsRef<Path>>(root: P, url: &str) -> Result<Vec<TldrRecord>> {
    let path = root.as_ref().join(TLDR_TEST_FILE);
    if !path.exists() {
        let content = download(url).map_err(|source| PipelineError::MissingAsset {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, |out| {
            out.write_all(&content)?;
            Ok(())
        })?;
        info!(path = %path.display(), "downloaded TL;DR test set");
    }
    read_jsonl(&path)
}

fn download(url: &str) -> anyhow::Result<Bytes> {
    let resp = reqwest::blocking::get(url)
        .and_then(|r| r.error_for_status())
        .with_context(|| format!("downloading {url}"))?;
    Ok(resp.bytes()?)
}

/// A batch whose generation failed; its records stay unscored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchError {
    pub start: usize,
    pub len: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct EvalOutcome {
    pub results: Vec<TldrRecord>,
    pub errors: Vec<BatchError>,
    pub aggregate: RougeScores,
}

impl EvalOutcome {
    pub fn num_scored(&self) -> usize {
        self.results.iter().filter(|r| r.score.is_some()).count()
    }
}

/// Generates a summary for every record in batches of `batch_size` and
/// scores it against the human summary. A failing batch is recorded in
/// `errors` and evaluation moves on to the next one.
pub fn evaluate_summaries<F>(
    records: Vec<TldrRecord>,
    template: &PromptTemplate,
    scorer: &RougeScorer,
    batch_size: usize,
    mut generate: F,
) -> EvalOutcome
where
    F: FnMut(&[String]) -> Result<Vec<String>>,
{
    let batch_size = batch_size.max(1);
    let mut aggregator = Aggregator::default();
    let mut errors = vec![];
    let mut results = records;

    let starts: Vec<usize> = (0..results.len()).step_by(batch_size).collect();
    for start in tqdm(starts.into_iter()) {
        let end = (start + batch_size).min(results.len());
        let batch = &mut results[start..end];

        let outcome = batch
            .iter()
            .map(|r| template.format_input(r))
            .collect::<Result<Vec<_>>>()
            .and_then(|prompts| generate(&prompts))
            .and_then(|completions| {
                if completions.len() == batch.len() {
                    Ok(completions)
                } else {
                    Err(PipelineError::validation(format!(
                        "expected {} completions, got {}",
                        batch.len(),
                        completions.len()
                    )))
                }
            });

        match outcome {
            Ok(completions) => {
                for (record, completion) in batch.iter_mut().zip(completions) {
                    let score = scorer.score(&record.summary, &completion);
                    aggregator.add_scores(&score);
                    record.completion = Some(completion);
                    record.score = Some(score);
                }
            }
            Err(e) => {
                warn!(start, error = %e, "summarization batch failed");
                errors.push(BatchError {
                    start,
                    len: batch.len(),
                    message: e.to_string(),
                });
            }
        }
    }

    EvalOutcome {
        results,
        errors,
        aggregate: aggregator.aggregate(),
    }
}

/// Writes `{label}_summarization.txt` (one block per record, then the
/// aggregate and any batch errors) and `summarization.json`.
pub fn write_report<P: AsRef<Path>>(
    outdir: P,
    label: &str,
    outcome: &EvalOutcome,
) -> Result<(PathBuf, PathBuf)> {
    let outdir = outdir.as_ref();
    let txt_path = outdir.join(format!("{label}_summarization.txt"));
    let json_path = outdir.join("summarization.json");

    write_atomic(&txt_path, |out| {
        for record in outcome.results.iter().filter(|r| r.score.is_some()) {
            write!(out, "{record}")?;
            out.write_all(b"==========================\n\n")?;
        }
        serde_json::to_writer(&mut *out, &outcome.aggregate)?;
        out.write_all(b"\n")?;
        if !outcome.errors.is_empty() {
            writeln!(out, "\nErrors:")?;
            for error in outcome.errors.iter() {
                writeln!(
                    out,
                    "- records {}..{}: {}",
                    error.start,
                    error.start + error.len,
                    error.message
                )?;
            }
        }
        Ok(())
    })?;
    write_atomic(&json_path, |out| {
        serde_json::to_writer(&mut *out, &outcome.results)?;
        Ok(())
    })?;

    info!(
        scored = outcome.num_scored(),
        errors = outcome.errors.len(),
        path = %txt_path.display(),
        "wrote summarization report"
    );
    Ok((txt_path, json_path))
}
