//! Tokenized datasets for supervised and pairwise fine-tuning

use crate::error::{PipelineError, Result};
use crate::partition::client_label;
use crate::tokenizer::Tokenize;
use serde::{Deserialize, Serialize};

/// Label value ignored by the loss; used to mask prompt tokens.
pub const DEFAULT_IGNORE_INDEX: i64 = -100;

/// A prompt/target pair ready for tokenization
pub trait SupervisedExample {
    fn source(&self) -> &str;

    fn target(&self) -> &str;

    fn category(&self) -> &str;
}

/// Encodes `source + target` (plus EOS when the tokenizer has one) and
/// masks the label positions covered by `source`.
pub fn encode_example<T: Tokenize + ?Sized>(
    source: &str,
    target: &str,
    tokenizer: &T,
) -> Result<(Vec<u32>, Vec<i64>)> {
    let source_len = tokenizer.num_tokens(source)?;
    let mut input_ids = tokenizer.encode(&format!("{source}{target}"))?;
    if let Some(eos) = tokenizer.eos_token_id() {
        input_ids.push(eos);
    }
    let mut labels: Vec<i64> = input_ids.iter().map(|&id| id as i64).collect();
    let masked = source_len.min(labels.len());
    labels[..masked].fill(DEFAULT_IGNORE_INDEX);
    Ok((input_ids, labels))
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TokenizedDataset {
    input_ids: Vec<Vec<u32>>,
    labels: Vec<Vec<i64>>,
    categories: Vec<String>,
}

impl TokenizedDataset {
    pub fn new<E: SupervisedExample, T: Tokenize + ?Sized>(
        examples: &[E],
        tokenizer: &T,
    ) -> Result<Self> {
        let mut dataset = Self::default();
        for example in examples {
            let (input_ids, labels) =
                encode_example(example.source(), example.target(), tokenizer)?;
            dataset.input_ids.push(input_ids);
            dataset.labels.push(labels);
            dataset.categories.push(example.category().to_string());
        }
        Ok(dataset)
    }

    /// Gets the number of examples.
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    /// Checks whether the dataset has no examples.
    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    pub fn input_ids(&self) -> &Vec<Vec<u32>> {
        &self.input_ids
    }

    pub fn labels(&self) -> &Vec<Vec<i64>> {
        &self.labels
    }

    pub fn categories(&self) -> &Vec<String> {
        &self.categories
    }

    /// Returns the token ids and labels at the specified index
    pub fn get_item_at_index(&self, idx: usize) -> Result<(&Vec<u32>, &Vec<i64>)> {
        match (self.input_ids.get(idx), self.labels.get(idx)) {
            (Some(ids), Some(labels)) => Ok((ids, labels)),
            _ => Err(PipelineError::validation(format!(
                "index {idx} out of range for dataset of length {}",
                self.len()
            ))),
        }
    }

    /// Keeps only the first `max_len` examples.
    pub fn truncate(&mut self, max_len: usize) {
        self.input_ids.truncate(max_len);
        self.labels.truncate(max_len);
        self.categories.truncate(max_len);
    }

    /// Example indices per client, read from the `Client_{i}` categories.
    pub fn client_indices(&self, num_clients: usize) -> Vec<Vec<usize>> {
        (0..num_clients)
            .map(|client| {
                let label = client_label(client);
                self.categories
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| **c == label)
                    .map(|(idx, _)| idx)
                    .collect()
            })
            .collect()
    }
}

/// Two tokenized views over the same comparisons: index `i` of
/// `win_dataset` and `lose_dataset` come from the same example.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ComparisonDataset {
    pub win_dataset: TokenizedDataset,
    pub lose_dataset: TokenizedDataset,
    choices: Vec<i64>,
}

impl ComparisonDataset {
    pub fn from_parts(
        win_dataset: TokenizedDataset,
        lose_dataset: TokenizedDataset,
        choices: Vec<i64>,
    ) -> Result<Self> {
        if win_dataset.len() != lose_dataset.len() || win_dataset.len() != choices.len() {
            return Err(PipelineError::validation(format!(
                "comparison parts differ in length: win {}, lose {}, choices {}",
                win_dataset.len(),
                lose_dataset.len(),
                choices.len()
            )));
        }
        Ok(Self {
            win_dataset,
            lose_dataset,
            choices,
        })
    }

    pub fn len(&self) -> usize {
        self.choices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.choices.is_empty()
    }

    /// Preferred side per example (0 for `output_A`, 1 for `output_B`).
    pub fn choices(&self) -> &Vec<i64> {
        &self.choices
    }

    pub fn truncate(&mut self, max_len: usize) {
        self.win_dataset.truncate(max_len);
        self.lose_dataset.truncate(max_len);
        self.choices.truncate(max_len);
    }

    pub fn into_win_dataset(self) -> TokenizedDataset {
        self.win_dataset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::tests::gpt2;
    use crate::tokenizer::TiktokenTokenizer;
    use anyhow::Result;
    use rstest::*;

    struct Pair(&'static str, &'static str, &'static str);

    impl SupervisedExample for Pair {
        fn source(&self) -> &str {
            self.0
        }
        fn target(&self) -> &str {
            self.1
        }
        fn category(&self) -> &str {
            self.2
        }
    }

    #[rstest]
    fn test_encode_example_masks_prompt(gpt2: TiktokenTokenizer) -> Result<()> {
        let source = "### Instruction:\nSay hi.\n\n### Response:";
        let (ids, labels) = encode_example(source, " Hi there.", &gpt2)?;
        let source_len = gpt2.encode(source)?.len();

        assert_eq!(ids.len(), labels.len());
        assert_eq!(*ids.last().unwrap(), 50256);
        assert!(labels[..source_len].iter().all(|&l| l == DEFAULT_IGNORE_INDEX));
        assert!(labels[source_len..].iter().all(|&l| l >= 0));
        Ok(())
    }

    #[rstest]
    fn test_dataset_truncate_and_clients(gpt2: TiktokenTokenizer) -> Result<()> {
        let examples = vec![
            Pair("Q1", " A", "Client_0"),
            Pair("Q2", " B", "Client_1"),
            Pair("Q3", " A", "Client_0"),
        ];
        let mut dataset = TokenizedDataset::new(&examples, &gpt2)?;

        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.client_indices(2), vec![vec![0, 2], vec![1]]);
        assert!(dataset.get_item_at_index(3).is_err());

        dataset.truncate(2);
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.labels().len(), 2);
        assert_eq!(dataset.categories().len(), 2);
        Ok(())
    }

    #[rstest]
    fn test_comparison_parts_must_align(gpt2: TiktokenTokenizer) -> Result<()> {
        let win = TokenizedDataset::new(&[Pair("Q", " yes", "c")], &gpt2)?;
        let lose = TokenizedDataset::default();
        assert!(ComparisonDataset::from_parts(win, lose, vec![0]).is_err());
        Ok(())
    }
}
