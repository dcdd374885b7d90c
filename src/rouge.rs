//! ROUGE-N, ROUGE-L and summary-level ROUGE-Lsum
//!
//! Text is lowercased and every run of characters outside `[a-z0-9]`
//! becomes a token boundary. No stemming is applied.

use crate::error::{PipelineError, Result};
use fancy_regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub const DEFAULT_ROUGE_TYPES: [&str; 4] = ["rouge1", "rouge2", "rougeL", "rougeLsum"];

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Score {
    pub precision: f64,
    pub recall: f64,
    pub fmeasure: f64,
}

impl Score {
    fn from_counts(hits: usize, pred_total: usize, target_total: usize) -> Self {
        let precision = hits as f64 / pred_total.max(1) as f64;
        let recall = hits as f64 / target_total.max(1) as f64;
        let fmeasure = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        Self {
            precision,
            recall,
            fmeasure,
        }
    }
}

/// Scores keyed by rouge type
pub type RougeScores = BTreeMap<String, Score>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RougeType {
    N(usize),
    L,
    LSum,
}

impl RougeType {
    fn parse(name: &str) -> Result<Self> {
        match name {
            "rougeL" => Ok(Self::L),
            "rougeLsum" => Ok(Self::LSum),
            _ => name
                .strip_prefix("rouge")
                .and_then(|n| n.parse::<usize>().ok())
                .filter(|&n| n > 0)
                .map(Self::N)
                .ok_or_else(|| PipelineError::validation(format!("unknown rouge type `{name}`"))),
        }
    }
}

pub struct RougeScorer {
    types: Vec<(String, RougeType)>,
    non_alnum: Regex,
}

impl RougeScorer {
    pub fn new(rouge_types: &[&str]) -> Result<Self> {
        let types = rouge_types
            .iter()
            .map(|name| Ok((name.to_string(), RougeType::parse(name)?)))
            .collect::<Result<Vec<_>>>()?;
        let non_alnum = Regex::new(r"[^a-z0-9]+").map_err(anyhow::Error::from)?;
        Ok(Self { types, non_alnum })
    }

    pub fn tokenize(&self, text: &str) -> Vec<String> {
        let lowered = text.to_lowercase();
        self.non_alnum
            .replace_all(&lowered, " ")
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    /// Scores `prediction` against `target` for every configured type.
    pub fn score(&self, target: &str, prediction: &str) -> RougeScores {
        let target_tokens = self.tokenize(target);
        let pred_tokens = self.tokenize(prediction);

        self.types
            .iter()
            .map(|(name, kind)| {
                let score = match kind {
                    RougeType::N(n) => score_ngrams(&target_tokens, &pred_tokens, *n),
                    RougeType::L => score_lcs(&target_tokens, &pred_tokens),
                    RougeType::LSum => {
                        let target_sents = self.sentences(target);
                        let pred_sents = self.sentences(prediction);
                        score_summary_lcs(&target_sents, &pred_sents)
                    }
                };
                (name.clone(), score)
            })
            .collect()
    }

    fn sentences(&self, text: &str) -> Vec<Vec<String>> {
        text.lines()
            .map(|line| self.tokenize(line))
            .filter(|tokens| !tokens.is_empty())
            .collect()
    }
}

fn ngram_counts(tokens: &[String], n: usize) -> HashMap<&[String], usize> {
    let mut counts = HashMap::new();
    if tokens.len() >= n {
        for gram in tokens.windows(n) {
            *counts.entry(gram).or_insert(0) += 1;
        }
    }
    counts
}

fn score_ngrams(target: &[String], prediction: &[String], n: usize) -> Score {
    let target_counts = ngram_counts(target, n);
    let pred_counts = ngram_counts(prediction, n);
    let hits: usize = target_counts
        .iter()
        .map(|(gram, &count)| count.min(pred_counts.get(gram).copied().unwrap_or(0)))
        .sum();
    Score::from_counts(
        hits,
        pred_counts.values().sum(),
        target_counts.values().sum(),
    )
}

fn lcs_table(target: &[String], prediction: &[String]) -> Vec<Vec<usize>> {
    let mut table = vec![vec![0_usize; prediction.len() + 1]; target.len() + 1];
    for i in 1..=target.len() {
        for j in 1..=prediction.len() {
            table[i][j] = if target[i - 1] == prediction[j - 1] {
                table[i - 1][j - 1] + 1
            } else {
                table[i - 1][j].max(table[i][j - 1])
            };
        }
    }
    table
}

fn score_lcs(target: &[String], prediction: &[String]) -> Score {
    if target.is_empty() || prediction.is_empty() {
        return Score::default();
    }
    let lcs = lcs_table(target, prediction)[target.len()][prediction.len()];
    Score::from_counts(lcs, prediction.len(), target.len())
}

/// Indices into `target` of one longest common subsequence.
fn lcs_indices(target: &[String], prediction: &[String]) -> Vec<usize> {
    let table = lcs_table(target, prediction);
    let (mut i, mut j) = (target.len(), prediction.len());
    let mut indices = vec![];
    while i > 0 && j > 0 {
        if target[i - 1] == prediction[j - 1] {
            indices.push(i - 1);
            i -= 1;
            j -= 1;
        } else if table[i][j - 1] > table[i - 1][j] {
            j -= 1;
        } else {
            i -= 1;
        }
    }
    indices.reverse();
    indices
}

fn score_summary_lcs(target: &[Vec<String>], prediction: &[Vec<String>]) -> Score {
    let target_total: usize = target.iter().map(Vec::len).sum();
    let pred_total: usize = prediction.iter().map(Vec::len).sum();
    if target_total == 0 || pred_total == 0 {
        return Score::default();
    }

    let mut target_counts: HashMap<&str, usize> = HashMap::new();
    for token in target.iter().flatten() {
        *target_counts.entry(token.as_str()).or_insert(0) += 1;
    }
    let mut pred_counts: HashMap<&str, usize> = HashMap::new();
    for token in prediction.iter().flatten() {
        *pred_counts.entry(token.as_str()).or_insert(0) += 1;
    }

    let mut hits = 0;
    for sentence in target {
        let union: BTreeSet<usize> = prediction
            .iter()
            .flat_map(|pred| lcs_indices(sentence, pred))
            .collect();
        for idx in union {
            let token = sentence[idx].as_str();
            let in_target = target_counts.get(token).copied().unwrap_or(0);
            let in_pred = pred_counts.get(token).copied().unwrap_or(0);
            if in_target > 0 && in_pred > 0 {
                hits += 1;
                target_counts.insert(token, in_target - 1);
                pred_counts.insert(token, in_pred - 1);
            }
        }
    }
    Score::from_counts(hits, pred_total, target_total)
}

/// Running mean of scores per rouge type
#[derive(Debug, Clone, Default)]
pub struct Aggregator {
    sums: BTreeMap<String, Score>,
    count: usize,
}

impl Aggregator {
    pub fn add_scores(&mut self, scores: &RougeScores) {
        for (name, score) in scores {
            let sum = self.sums.entry(name.clone()).or_default();
            sum.precision += score.precision;
            sum.recall += score.recall;
            sum.fmeasure += score.fmeasure;
        }
        self.count += 1;
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn aggregate(&self) -> RougeScores {
        let n = self.count.max(1) as f64;
        self.sums
            .iter()
            .map(|(name, sum)| {
                (
                    name.clone(),
                    Score {
                        precision: sum.precision / n,
                        recall: sum.recall / n,
                        fmeasure: sum.fmeasure / n,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use rstest::*;

    #[fixture]
    fn scorer() -> RougeScorer {
        RougeScorer::new(&DEFAULT_ROUGE_TYPES).unwrap()
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!((actual - expected).abs() < 1e-9, "{actual} != {expected}");
    }

    #[rstest]
    fn test_tokenize(scorer: RougeScorer) {
        assert_eq!(
            scorer.tokenize("The Sky's BLUE, isn't it? 42!"),
            vec!["the", "sky", "s", "blue", "isn", "t", "it", "42"]
        );
    }

    #[rstest]
    fn test_quick_brown_fox(scorer: RougeScorer) {
        let scores = scorer.score(
            "The quick brown fox jumps over the lazy dog",
            "The quick brown dog jumps on the log.",
        );
        assert_close(scores["rouge1"].precision, 0.75);
        assert_close(scores["rouge1"].recall, 6.0 / 9.0);
        assert_close(scores["rouge1"].fmeasure, 12.0 / 17.0);
        assert_close(scores["rougeL"].precision, 0.625);
        assert_close(scores["rougeL"].recall, 5.0 / 9.0);
        // single sentence: summary-level LCS equals LCS
        assert_eq!(scores["rougeLsum"], scores["rougeL"]);
        // "the quick", "quick brown"
        assert_close(scores["rouge2"].precision, 2.0 / 7.0);
    }

    #[rstest]
    fn test_identical_and_empty(scorer: RougeScorer) {
        let same = scorer.score("a cat sat", "A cat sat.");
        assert!(same.values().all(|s| (s.fmeasure - 1.0).abs() < 1e-9));

        let empty = scorer.score("a cat sat", "");
        assert!(empty.values().all(|s| *s == Score::default()));
    }

    #[rstest]
    fn test_rouge_lsum_unions_sentences(scorer: RougeScorer) {
        let scores = scorer.score("a b c\nd e", "a b\nc d e");
        assert_close(scores["rougeLsum"].recall, 1.0);
        assert_close(scores["rougeLsum"].precision, 1.0);
        assert!(scores["rougeL"].fmeasure <= 1.0);
    }

    #[rstest]
    fn test_unknown_type() {
        assert!(RougeScorer::new(&["rougeX"]).is_err());
        assert!(RougeScorer::new(&["rouge3"]).is_ok());
    }

    #[rstest]
    fn test_aggregator_means(scorer: RougeScorer) -> Result<()> {
        let mut agg = Aggregator::default();
        agg.add_scores(&scorer.score("a b", "a b"));
        agg.add_scores(&scorer.score("a b", "c d"));
        let mean = agg.aggregate();
        assert_eq!(agg.len(), 2);
        assert_close(mean["rouge1"].fmeasure, 0.5);
        Ok(())
    }
}
