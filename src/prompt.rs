//! Prompt templates with named `{placeholder}` fields

use crate::error::{PipelineError, Result};
use phf::phf_map;
use std::collections::HashMap;

/// Prompt templates for SHP tasks, keyed by task name
pub static SHP_PROMPT_DICT: phf::Map<&'static str, &'static str> = phf_map! {
    "shp" => "Below is an instruction that describes a task. \
        Write a response that appropriately completes the request.\n\n\
        ### Instruction:\n{instruction}\n\n\
        ### Response:",
    "shp_cmp" => "Below is a query followed by two responses. Pick a \
        helpful response that is precise, concise, and casual. \
        State your choice with a single capital letter, \
        i.e., \"A\" if RESPONSE A is better, \
        \"B\" if RESPONSE B is better.\n\n\
        ### QUERY: {instruction}\n\
        ### RESPONSE A: {output_A}\n\
        ### RESPONSE B: {output_B}\n\
        ### YOUR CHOICE:",
    "mix_cmp" => "Below is an instruction that describes a task. \
        There are two responses that complete the request. \
        Pick an appropriate response and state your choice with \
        a single capital letter, i.e., \
        \"A\" if RESPONSE A is better and more appropriate, \
        \"B\" if RESPONSE B is better and more appropriate.\n\n\
        ### Instruction:\n{instruction}\n\n\
        ### RESPONSE A: {output_A}\n\
        ### RESPONSE B: {output_B}\n\
        ### YOUR CHOICE:",
};

pub const TLDR_SUMMARY_PROMPT: &str = "Below is a forum post. Write a precise and \
    concise summary that includes the most important points of the post.\n\n\
    ### SUBREDDIT: r/{subreddit}\n\
    ### TITLE: {title}\n\
    ### POST: {post}\n\
    ### TL;DR:";

/// Anything that can supply named text fields to a template
pub trait Fields {
    fn field(&self, name: &str) -> Option<&str>;
}

impl Fields for HashMap<String, String> {
    fn field(&self, name: &str) -> Option<&str> {
        self.get(name).map(String::as_str)
    }
}

pub trait PromptFormatter {
    fn format_input<T: Fields + ?Sized>(&self, entry: &T) -> Result<String>;
}

/// A named template; `{{` and `}}` render literal braces.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptTemplate {
    name: String,
    template: String,
}

impl PromptTemplate {
    pub fn new(name: &str, template: &str) -> Self {
        Self {
            name: name.to_string(),
            template: template.to_string(),
        }
    }

    /// Looks up one of the SHP task templates.
    pub fn shp(name: &str) -> Result<Self> {
        SHP_PROMPT_DICT
            .get(name)
            .map(|t| Self::new(name, t))
            .ok_or_else(|| PipelineError::validation(format!("unknown SHP prompt `{name}`")))
    }

    pub fn tldr_summary() -> Self {
        Self::new("tldr_summary", TLDR_SUMMARY_PROMPT)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Placeholder names in order of appearance.
    pub fn placeholders(&self) -> Vec<String> {
        let mut names = vec![];
        let mut chars = self.template.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '{' {
                if chars.peek() == Some(&'{') {
                    chars.next();
                    continue;
                }
                let name: String = chars.by_ref().take_while(|&c| c != '}').collect();
                names.push(name);
            }
        }
        names
    }
}

impl PromptFormatter for PromptTemplate {
    fn format_input<T: Fields + ?Sized>(&self, entry: &T) -> Result<String> {
        let mut out = String::with_capacity(self.template.len());
        let mut chars = self.template.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    out.push('{');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        name.push(c);
                    }
                    if !closed {
                        return Err(PipelineError::validation(format!(
                            "unterminated placeholder in template `{}`",
                            self.name
                        )));
                    }
                    let value = entry.field(&name).ok_or_else(|| PipelineError::Formatting {
                        template: self.name.clone(),
                        field: name.clone(),
                    })?;
                    out.push_str(value);
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    out.push('}');
                }
                c => out.push(c),
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::PreferenceRecord;
    use anyhow::Result;
    use rstest::*;

    #[fixture]
    fn record() -> PreferenceRecord {
        PreferenceRecord::new("Here is a fake query.", "Answer one.", "Answer two.", 1, "askscience")
    }

    #[rstest]
    fn test_shp_prompt(record: PreferenceRecord) -> Result<()> {
        let prompt = PromptTemplate::shp("shp")?.format_input(&record)?;
        let expected = "Below is an instruction that describes a task. Write a \
        response that appropriately completes the request.\n\n\
        ### Instruction:\n\
        Here is a fake query.\n\n\
        ### Response:";
        assert_eq!(prompt, expected);
        Ok(())
    }

    #[rstest]
    fn test_shp_cmp_prompt_embeds_both_responses(record: PreferenceRecord) -> Result<()> {
        let prompt = PromptTemplate::shp("shp_cmp")?.format_input(&record)?;
        assert!(prompt.ends_with(
            "### QUERY: Here is a fake query.\n\
            ### RESPONSE A: Answer one.\n\
            ### RESPONSE B: Answer two.\n\
            ### YOUR CHOICE:"
        ));
        Ok(())
    }

    #[rstest]
    fn test_missing_field_is_formatting_error() {
        let fields: HashMap<String, String> =
            HashMap::from([("instruction".to_string(), "hi".to_string())]);
        let err = PromptTemplate::shp("mix_cmp")
            .unwrap()
            .format_input(&fields)
            .unwrap_err();
        match err {
            PipelineError::Formatting { template, field } => {
                assert_eq!(template, "mix_cmp");
                assert_eq!(field, "output_A");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[rstest]
    fn test_escaped_braces() -> Result<()> {
        let template = PromptTemplate::new("braces", "{{literal}} {instruction} }}");
        let fields: HashMap<String, String> =
            HashMap::from([("instruction".to_string(), "x".to_string())]);
        assert_eq!(template.format_input(&fields)?, "{literal} x }");
        assert_eq!(template.placeholders(), vec!["instruction".to_string()]);
        Ok(())
    }

    #[rstest]
    fn test_tldr_placeholders() {
        assert_eq!(
            PromptTemplate::tldr_summary().placeholders(),
            vec!["subreddit", "title", "post"]
        );
    }
}
