//! SHP preference datasets for federated fine-tuning
//!
//! Comparisons are loaded from the record cache, their train split is
//! spread over clients by instruction, filtered by token budget and then
//! shaped into one of three dataset variants:
//!
//! * comparison: prompt with both completions, win/lose tokenized apart
//! * best: the win half of the comparison variant
//! * choice: both responses in the prompt, answered with `" A"` or `" B"`
//!
//! The AlpacaFarm eval set uses the same prompt with bare `"A"`/`"B"` answers.

use crate::cache::{CacheKey, DatasetCache, DatasetSplits};
use crate::config::{Config, DEFAULT_MAX_TOKENS};
use crate::corpus::{
    fetch_or_missing, int_column, load_comparison_records, load_dedup_instructions, split_frame,
    string_column, CorpusSource,
};
use crate::dataset::{ComparisonDataset, TokenizedDataset};
use crate::error::{PipelineError, Result};
use crate::filter::{filter_by_budget, ClientDomainSummary};
use crate::partition::{enrich, partition, CategoryVocab, Splitter};
use crate::prompt::{PromptFormatter, PromptTemplate};
use crate::records::{Choice, PreferenceRecord, Splits};
use crate::shaper::{shape_comparison, shape_letter_choice, LetterChoiceExample, WinExample};
use crate::tokenizer::Tokenize;
use std::path::{Path, PathBuf};
use tracing::info;

pub const ALPACA_FARM_CORPUS: &str = "tatsu-lab/alpaca_farm";
pub const ALPACA_FARM_HUMAN_CONFIG: &str = "alpaca_human_preference";

/// Builds SHP datasets under one data root.
pub struct ShpLoader<'a> {
    root: PathBuf,
    num_clients: usize,
    max_tokens: usize,
    max_num_test: Option<usize>,
    source: &'a dyn CorpusSource,
    splitter: &'a dyn Splitter,
}

impl<'a> ShpLoader<'a> {
    pub fn new<P: AsRef<Path>>(
        root: P,
        num_clients: usize,
        source: &'a dyn CorpusSource,
        splitter: &'a dyn Splitter,
    ) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            num_clients,
            max_tokens: DEFAULT_MAX_TOKENS,
            max_num_test: None,
            source,
            splitter,
        }
    }

    pub fn from_config(
        cfg: &Config,
        source: &'a dyn CorpusSource,
        splitter: &'a dyn Splitter,
    ) -> Self {
        Self::new(&cfg.data.root, cfg.federate.client_num, source, splitter)
            .max_tokens(cfg.data.max_tokens)
            .max_num_test(cfg.data.max_num_test)
    }

    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn max_num_test(mut self, max_num_test: Option<usize>) -> Self {
        self.max_num_test = max_num_test;
        self
    }

    fn cache(&self) -> DatasetCache {
        DatasetCache::new(&self.root)
    }

    /// Comparison records with the train split assigned to clients and
    /// filtered by token budget. Validation and test are returned as loaded.
    pub fn shp_dataset<T: Tokenize + ?Sized>(
        &self,
        tokenizer: &T,
    ) -> Result<Splits<PreferenceRecord>> {
        let (train, val, test) = load_comparison_records(&self.root, self.source)?;

        let (mut instructions, _, _) = load_dedup_instructions(&self.root, self.source)?;
        let vocab = CategoryVocab::from_records(&instructions);
        vocab.assign_codes(&mut instructions)?;
        info!(
            instructions = instructions.len(),
            categories = vocab.len(),
            num_clients = self.num_clients,
            "partitioning train instructions"
        );

        let assignment = partition(&instructions, self.num_clients, self.splitter)?;
        let train = enrich(train, &assignment)?;
        let train = filter_by_budget(train, tokenizer, self.max_tokens)?;

        ClientDomainSummary::from_records(&train, self.num_clients).log();
        Ok((train, val, test))
    }

    /// Win and lose completions of each comparison, tokenized under the
    /// `shp` prompt.
    pub fn load_comparison_dataset<T: Tokenize + ?Sized>(
        &self,
        tokenizer: &T,
    ) -> Result<DatasetSplits<ComparisonDataset>> {
        let key = CacheKey::new(&tokenizer.tokenizer_name(), self.num_clients);
        let (train, mut val, mut test) = self.cache().get_or_build(&key, || {
            let (train, val, test) = self.shp_dataset(tokenizer)?;
            let template = PromptTemplate::shp("shp")?;
            Ok((
                comparison_dataset(&train, &template, tokenizer)?,
                comparison_dataset(&val, &template, tokenizer)?,
                comparison_dataset(&test, &template, tokenizer)?,
            ))
        })?;

        if let Some(n) = self.max_num_test {
            val.truncate(n);
            test.truncate(n);
        }
        Ok((train, val, test))
    }

    /// Only the preferred completions.
    pub fn load_shp_best_dataset<T: Tokenize + ?Sized>(
        &self,
        tokenizer: &T,
    ) -> Result<DatasetSplits<TokenizedDataset>> {
        let (train, val, test) = self.load_comparison_dataset(tokenizer)?;
        Ok((
            train.into_win_dataset(),
            val.into_win_dataset(),
            test.into_win_dataset(),
        ))
    }

    /// Letter-choice datasets under the `shp_cmp` prompt; the train split
    /// is doubled with mirrored copies.
    pub fn load_shp_cmp_dataset_by_choice<T: Tokenize + ?Sized>(
        &self,
        tokenizer: &T,
    ) -> Result<DatasetSplits<TokenizedDataset>> {
        let key = CacheKey::new(&tokenizer.tokenizer_name(), self.num_clients).variant("choice");
        let (train, mut val, mut test) = self.cache().get_or_build(&key, || {
            let (train, val, test) = self.shp_dataset(tokenizer)?;
            let template = PromptTemplate::shp("shp_cmp")?;
            Ok((
                TokenizedDataset::new(&shape_letter_choice(&train, &template, true)?, tokenizer)?,
                TokenizedDataset::new(&shape_letter_choice(&val, &template, false)?, tokenizer)?,
                TokenizedDataset::new(&shape_letter_choice(&test, &template, false)?, tokenizer)?,
            ))
        })?;

        if let Some(n) = self.max_num_test {
            val.truncate(n);
            test.truncate(n);
        }
        Ok((train, val, test))
    }

    /// AlpacaFarm human preferences as a letter-choice test set, answered
    /// with a bare `"A"` or `"B"`.
    pub fn load_alpacafarm_human_for_eval<T: Tokenize + ?Sized>(
        &self,
        tokenizer: &T,
    ) -> Result<TokenizedDataset> {
        let stem = format!("{}_alpacafarm_human_choice", tokenizer.tokenizer_name());
        let cache = self.cache();
        let path = cache.path(&stem);
        cache.get_or_build_one(&stem, || {
            let corpus = fetch_or_missing(
                self.source,
                ALPACA_FARM_CORPUS,
                Some(ALPACA_FARM_HUMAN_CONFIG),
                &path,
            )?;
            let records = alpacafarm_records(split_frame(&corpus, "preference")?)?;
            let template = PromptTemplate::shp("shp_cmp")?;
            let examples = records
                .iter()
                .map(|record| {
                    Ok(LetterChoiceExample {
                        prompt: template.format_input(record)?,
                        answer: record.choice()?.bare_letter().to_string(),
                        category: record.category.clone(),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            TokenizedDataset::new(&examples, tokenizer)
        })
    }
}

fn comparison_dataset<T: Tokenize + ?Sized>(
    records: &[PreferenceRecord],
    template: &PromptTemplate,
    tokenizer: &T,
) -> Result<ComparisonDataset> {
    let examples = shape_comparison(records, template)?;
    let (wins, loses): (Vec<WinExample>, Vec<WinExample>) = examples
        .iter()
        .map(|e| (e.win_example(), e.lose_example()))
        .unzip();
    let choices = examples.iter().map(|e| e.preferred.index()).collect();
    ComparisonDataset::from_parts(
        TokenizedDataset::new(&wins, tokenizer)?,
        TokenizedDataset::new(&loses, tokenizer)?,
        choices,
    )
}

/// Preference `1` favours `output_1`, `2` favours `output_2`; a non-empty
/// `input` is appended to the instruction after a blank line.
fn alpacafarm_records(df: &polars::prelude::DataFrame) -> Result<Vec<PreferenceRecord>> {
    let instructions = string_column(df, "instruction")?;
    let inputs = string_column(df, "input")?;
    let outputs_1 = string_column(df, "output_1")?;
    let outputs_2 = string_column(df, "output_2")?;
    let preferences = int_column(df, "preference")?;

    itertools::izip!(instructions, inputs, outputs_1, outputs_2, preferences)
        .map(|(mut instruction, input, output_1, output_2, preference)| {
            let choice = match preference {
                1 => Choice::A,
                2 => Choice::B,
                other => {
                    return Err(PipelineError::validation(format!(
                        "alpaca_farm preference must be 1 or 2, got {other}"
                    )))
                }
            };
            if !input.is_empty() {
                instruction.push_str("\n\n");
                instruction.push_str(&input);
            }
            Ok(PreferenceRecord::new(
                &instruction,
                &output_1,
                &output_2,
                choice.index(),
                "alpaca_farm",
            ))
        })
        .collect()
}
