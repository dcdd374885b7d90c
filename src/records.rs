//! Record types flowing through the pipeline

use crate::error::{PipelineError, Result};
use crate::prompt::Fields;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Train, validation and test partitions, in that order.
pub type Splits<T> = (Vec<T>, Vec<T>, Vec<T>);

/// A pairwise comparison between two human responses to one instruction.
///
/// Fresh from the loader `category` holds the source domain. After client
/// assignment (`partition::enrich`) the domain moves to `domain` and
/// `category` becomes the synthetic `Client_{i}` label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferenceRecord {
    pub instruction: String,
    #[serde(rename = "output_A")]
    pub output_a: String,
    #[serde(rename = "output_B")]
    pub output_b: String,
    pub choice: i64,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

impl PreferenceRecord {
    pub fn new(
        instruction: &str,
        output_a: &str,
        output_b: &str,
        choice: i64,
        category: &str,
    ) -> Self {
        Self {
            instruction: instruction.to_string(),
            output_a: output_a.to_string(),
            output_b: output_b.to_string(),
            choice,
            category: category.to_string(),
            domain: None,
        }
    }

    pub fn choice(&self) -> Result<Choice> {
        Choice::try_from(self.choice)
    }

    /// The same comparison with the responses swapped and the label flipped.
    pub fn mirrored(&self) -> Result<Self> {
        let flipped = self.choice()?.flipped();
        Ok(Self {
            output_a: self.output_b.clone(),
            output_b: self.output_a.clone(),
            choice: flipped.index(),
            ..self.clone()
        })
    }
}

impl Fields for PreferenceRecord {
    fn field(&self, name: &str) -> Option<&str> {
        match name {
            "instruction" => Some(&self.instruction),
            "output_A" => Some(&self.output_a),
            "output_B" => Some(&self.output_b),
            "category" => Some(&self.category),
            "domain" => self.domain.as_deref(),
            _ => None,
        }
    }
}

impl Display for PreferenceRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Instruction: {}\nResponse A: {}\nResponse B: {}\nChoice: {}",
            self.instruction, self.output_a, self.output_b, self.choice
        )
    }
}

/// One unique instruction with its category label and, once coded, the
/// integer category used by the client splitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionRecord {
    pub instruction: String,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categories: Option<usize>,
}

impl InstructionRecord {
    pub fn new(instruction: &str, category: &str) -> Self {
        Self {
            instruction: instruction.to_string(),
            category: category.to_string(),
            categories: None,
        }
    }
}

impl Fields for InstructionRecord {
    fn field(&self, name: &str) -> Option<&str> {
        match name {
            "instruction" => Some(&self.instruction),
            "category" => Some(&self.category),
            _ => None,
        }
    }
}

/// A bare prompt (safety prompt sets carry nothing else)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptRecord {
    pub instruction: String,
}

impl Fields for PromptRecord {
    fn field(&self, name: &str) -> Option<&str> {
        match name {
            "instruction" => Some(&self.instruction),
            _ => None,
        }
    }
}

/// Preferred side of a comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Choice {
    A,
    B,
}

impl Choice {
    pub fn index(self) -> i64 {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }

    pub fn flipped(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    /// Single-token answer text: a leading space and the capital letter.
    pub fn letter(self) -> &'static str {
        match self {
            Self::A => " A",
            Self::B => " B",
        }
    }

    /// The capital letter alone, as AlpacaFarm answers are written.
    pub fn bare_letter(self) -> &'static str {
        self.letter().trim_start()
    }
}

impl TryFrom<i64> for Choice {
    type Error = PipelineError;

    fn try_from(value: i64) -> Result<Self> {
        match value {
            0 => Ok(Self::A),
            1 => Ok(Self::B),
            other => Err(PipelineError::validation(format!(
                "choice must be 0 or 1, got {other}"
            ))),
        }
    }
}
