//! Turning preference records into training examples

use crate::dataset::SupervisedExample;
use crate::error::Result;
use crate::prompt::PromptFormatter;
use crate::records::{Choice, PreferenceRecord};

/// One prompt with both completions and the preferred side.
#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonExample {
    pub prompt: String,
    pub completions: [String; 2],
    pub preferred: Choice,
    pub category: String,
}

impl ComparisonExample {
    pub fn win(&self) -> &str {
        &self.completions[self.preferred.index() as usize]
    }

    pub fn lose(&self) -> &str {
        &self.completions[self.preferred.flipped().index() as usize]
    }

    pub fn win_example(&self) -> WinExample {
        WinExample {
            prompt: self.prompt.clone(),
            completion: self.win().to_string(),
            category: self.category.clone(),
        }
    }

    pub fn lose_example(&self) -> WinExample {
        WinExample {
            prompt: self.prompt.clone(),
            completion: self.lose().to_string(),
            category: self.category.clone(),
        }
    }
}

/// A prompt paired with a single completion.
#[derive(Debug, Clone, PartialEq)]
pub struct WinExample {
    pub prompt: String,
    pub completion: String,
    pub category: String,
}

impl SupervisedExample for WinExample {
    fn source(&self) -> &str {
        &self.prompt
    }

    fn target(&self) -> &str {
        &self.completion
    }

    fn category(&self) -> &str {
        &self.category
    }
}

/// A comparison prompt answered with `" A"` or `" B"`.
#[derive(Debug, Clone, PartialEq)]
pub struct LetterChoiceExample {
    pub prompt: String,
    pub answer: String,
    pub category: String,
}

impl SupervisedExample for LetterChoiceExample {
    fn source(&self) -> &str {
        &self.prompt
    }

    fn target(&self) -> &str {
        &self.answer
    }

    fn category(&self) -> &str {
        &self.category
    }
}

/// Formats the instruction of each record; completions are space-prefixed.
pub fn shape_comparison<P: PromptFormatter>(
    records: &[PreferenceRecord],
    template: &P,
) -> Result<Vec<ComparisonExample>> {
    records
        .iter()
        .map(|record| {
            Ok(ComparisonExample {
                prompt: template.format_input(record)?,
                completions: [
                    format!(" {}", record.output_a),
                    format!(" {}", record.output_b),
                ],
                preferred: record.choice()?,
                category: record.category.clone(),
            })
        })
        .collect()
}

/// The preferred completion of every comparison, in order.
pub fn extract_wins(examples: &[ComparisonExample]) -> Vec<WinExample> {
    examples.iter().map(ComparisonExample::win_example).collect()
}

/// Embeds both responses in the prompt and answers with the preferred
/// letter. With `mirror`, a copy of every record with swapped responses
/// and flipped label is appended after the originals.
pub fn shape_letter_choice<P: PromptFormatter>(
    records: &[PreferenceRecord],
    template: &P,
    mirror: bool,
) -> Result<Vec<LetterChoiceExample>> {
    let choices = records
        .iter()
        .map(PreferenceRecord::choice)
        .collect::<Result<Vec<_>>>()?;

    let mut examples = Vec::with_capacity(if mirror { 2 } else { 1 } * records.len());
    for (record, choice) in records.iter().zip(choices.iter()) {
        examples.push(LetterChoiceExample {
            prompt: template.format_input(record)?,
            answer: choice.letter().to_string(),
            category: record.category.clone(),
        });
    }
    if mirror {
        for record in records {
            let mirrored = record.mirrored()?;
            examples.push(LetterChoiceExample {
                prompt: template.format_input(&mirrored)?,
                answer: mirrored.choice()?.letter().to_string(),
                category: mirrored.category.clone(),
            });
        }
    }
    Ok(examples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::prompt::PromptTemplate;
    use anyhow::Result;
    use rstest::*;

    #[fixture]
    fn records() -> Vec<PreferenceRecord> {
        vec![
            PreferenceRecord::new("Why is the sky blue?", "Rayleigh.", "Magic.", 0, "Client_0"),
            PreferenceRecord::new("How do I sear tuna?", "Boil it.", "Hot pan.", 1, "Client_1"),
        ]
    }

    #[rstest]
    fn test_wins_follow_choice(records: Vec<PreferenceRecord>) -> Result<()> {
        let examples = shape_comparison(&records, &PromptTemplate::shp("shp")?)?;
        let wins = extract_wins(&examples);

        assert_eq!(wins.len(), records.len());
        assert_eq!(wins[0].completion, " Rayleigh.");
        assert_eq!(wins[1].completion, " Hot pan.");
        assert_eq!(examples[1].lose(), " Boil it.");
        assert_eq!(wins[1].category, "Client_1");
        assert!(wins[0].prompt.contains("Why is the sky blue?"));
        Ok(())
    }

    #[rstest]
    fn test_letter_choice_mirror(records: Vec<PreferenceRecord>) -> Result<()> {
        let template = PromptTemplate::shp("shp_cmp")?;
        let plain = shape_letter_choice(&records, &template, false)?;
        let mirrored = shape_letter_choice(&records, &template, true)?;

        assert_eq!(plain.len(), records.len());
        assert_eq!(mirrored.len(), 2 * records.len());
        assert_eq!(&mirrored[..records.len()], &plain[..]);

        let n = records.len();
        for i in 0..n {
            let (orig, copy) = (&mirrored[i], &mirrored[i + n]);
            assert_ne!(orig.answer, copy.answer);
            assert!(["A", "B"].contains(&orig.answer.trim()));
            assert!(copy.prompt.contains(&format!(
                "### RESPONSE A: {}\n### RESPONSE B: {}",
                records[i].output_b, records[i].output_a
            )));
        }
        assert_eq!(plain[0].answer, " A");
        assert_eq!(plain[1].answer, " B");
        Ok(())
    }

    #[rstest]
    fn test_letter_choice_rejects_bad_choice(mut records: Vec<PreferenceRecord>) -> Result<()> {
        records[1].choice = 2;
        let template = PromptTemplate::shp("shp_cmp")?;
        assert!(matches!(
            shape_letter_choice(&records, &template, false),
            Err(PipelineError::Validation(_))
        ));
        assert!(shape_comparison(&records, &template).is_err());
        Ok(())
    }
}
