//! Chat and batch generation over a fine-tuned checkpoint
//!
//! A run saves checkpoints as `{dir}/{prefix}{basename}` where the prefix
//! is `final_` for the last round and `{round}_` for intermediate ones. A
//! session walks those candidates from newest to oldest and can fall back
//! to the untuned base model.

use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::prompt::{PromptFormatter, PromptTemplate};
use crate::records::PromptRecord;
use crate::tokenizer::Tokenize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Decoding knobs handed to the model backend. Decoding is greedy unless
/// `do_sample` is set; `temperature` and `top_p` only shape sampling.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub do_sample: bool,
    pub seed: Option<u64>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_new_tokens: 60,
            temperature: 0.0,
            top_p: 1.0,
            do_sample: false,
            seed: None,
        }
    }
}

impl GenerationOptions {
    /// Greedy decoding, as used for chat and evaluation.
    pub fn greedy(max_new_tokens: usize) -> Self {
        Self {
            max_new_tokens,
            ..Default::default()
        }
    }
}

/// A causal language model working on token ids.
pub trait LanguageModel {
    /// Returns one or more output sequences, each starting with `input_ids`.
    fn generate(&self, input_ids: &[u32], options: &GenerationOptions) -> Result<Vec<Vec<u32>>>;
}

/// Builds models from checkpoints.
pub trait ModelLoader {
    type Model: LanguageModel;

    /// `None` loads the base model without fine-tuned weights.
    fn load(&self, checkpoint: Option<&Path>) -> Result<Self::Model>;

    fn checkpoint_exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// Checkpoint prefixes, newest first: `final_`, then every `save_freq`
/// rounds counting down to `0_`, then the bare basename.
pub fn checkpoint_prefixes(total_round_num: usize, save_freq: usize) -> Vec<String> {
    let mut prefixes = vec!["final_".to_string()];
    if save_freq > 0 {
        let num_ckpt = total_round_num / save_freq;
        prefixes.extend((0..=num_ckpt).rev().map(|k| format!("{}_", k * save_freq)));
    }
    prefixes.push(String::new());
    prefixes
}

/// First candidate whose `{dir}/{prefix}{basename}` exists, with its index.
pub fn resolve_checkpoint<F>(
    dir: &Path,
    basename: &str,
    candidates: &[String],
    exists: F,
) -> Option<(usize, PathBuf)>
where
    F: Fn(&Path) -> bool,
{
    candidates
        .iter()
        .map(|prefix| dir.join(format!("{prefix}{basename}")))
        .enumerate()
        .find(|(_, path)| exists(path.as_path()))
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointState {
    Uninitialized,
    Loaded { prefix: String, path: PathBuf },
    Raw,
    Exhausted,
}

impl CheckpointState {
    /// Short tag naming the weights in use, for report file names.
    pub fn label(&self) -> &str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Loaded { prefix, .. } if prefix.is_empty() => "latest",
            Self::Loaded { prefix, .. } => prefix.trim_end_matches('_'),
            Self::Raw => "raw",
            Self::Exhausted => "exhausted",
        }
    }
}

/// A model, its tokenizer and the conversation so far.
pub struct ChatSession<L: ModelLoader, T: Tokenize> {
    loader: L,
    tokenizer: T,
    model: Option<L::Model>,
    state: CheckpointState,
    dir: PathBuf,
    basename: String,
    prefixes: Vec<String>,
    cursor: usize,
    allow_raw_fallback: bool,
    options: GenerationOptions,
    prompt: PromptTemplate,
    max_history_len: usize,
    history: Vec<Vec<u32>>,
}

impl<L: ModelLoader, T: Tokenize> ChatSession<L, T> {
    /// Loads the newest available checkpoint named by `federate.save_to`.
    pub fn new(cfg: &Config, tokenizer: T, loader: L) -> Result<Self> {
        let save_to = &cfg.federate.save_to;
        let dir = save_to
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let basename = save_to
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| {
                PipelineError::validation(format!(
                    "checkpoint path has no file name: {}",
                    save_to.display()
                ))
            })?;

        let mut session = Self {
            loader,
            tokenizer,
            model: None,
            state: CheckpointState::Uninitialized,
            dir,
            basename,
            prefixes: checkpoint_prefixes(cfg.federate.total_round_num, cfg.federate.save_freq),
            cursor: 0,
            allow_raw_fallback: cfg.llm.chat.allow_raw_fallback,
            options: GenerationOptions::greedy(cfg.llm.chat.max_len),
            prompt: PromptTemplate::shp("shp")?,
            max_history_len: cfg.llm.chat.max_history_len,
            history: vec![],
        };
        session.next_model()?;
        Ok(session)
    }

    /// Session on the base model, skipping checkpoint lookup.
    pub fn with_raw_model(cfg: &Config, tokenizer: T, loader: L) -> Result<Self> {
        let model = loader.load(None)?;
        info!("using raw model");
        let save_to = &cfg.federate.save_to;
        Ok(Self {
            loader,
            tokenizer,
            model: Some(model),
            state: CheckpointState::Raw,
            dir: save_to.parent().map(Path::to_path_buf).unwrap_or_default(),
            basename: save_to
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            prefixes: vec![],
            cursor: 0,
            allow_raw_fallback: false,
            options: GenerationOptions::greedy(cfg.llm.chat.max_len),
            prompt: PromptTemplate::shp("shp")?,
            max_history_len: cfg.llm.chat.max_history_len,
            history: vec![],
        })
    }

    pub fn state(&self) -> &CheckpointState {
        &self.state
    }

    pub fn tokenizer(&self) -> &T {
        &self.tokenizer
    }

    pub fn history(&self) -> &[Vec<u32>] {
        &self.history
    }

    /// Moves to the next older checkpoint. When none is left the base model
    /// is used once, if allowed; after that the session is exhausted.
    pub fn next_model(&mut self) -> Result<&CheckpointState> {
        self.model = None;
        self.history.clear();
        let remaining = &self.prefixes[self.cursor.min(self.prefixes.len())..];

        let exists = |path: &Path| self.loader.checkpoint_exists(path);
        match resolve_checkpoint(&self.dir, &self.basename, remaining, exists) {
            Some((idx, path)) => {
                let prefix = remaining[idx].clone();
                self.model = Some(self.loader.load(Some(&path))?);
                info!(path = %path.display(), "model loaded from checkpoint");
                self.cursor += idx + 1;
                self.state = CheckpointState::Loaded { prefix, path };
            }
            None if remaining.len() > 1 && self.allow_raw_fallback => {
                warn!(basename = %self.basename, "no checkpoint found, using raw model");
                self.model = Some(self.loader.load(None)?);
                self.cursor = self.prefixes.len();
                self.state = CheckpointState::Raw;
            }
            None => {
                let tried = remaining
                    .iter()
                    .map(|prefix| format!("{prefix}{}", self.basename))
                    .collect();
                self.cursor = self.prefixes.len();
                self.state = CheckpointState::Exhausted;
                return Err(PipelineError::ModelUnavailable {
                    basename: self.basename.clone(),
                    tried,
                });
            }
        }
        Ok(&self.state)
    }

    fn model(&self) -> Result<&L::Model> {
        self.model
            .as_ref()
            .ok_or_else(|| PipelineError::ModelUnavailable {
                basename: self.basename.clone(),
                tried: vec![],
            })
    }

    fn decode_completion(&self, output: &[u32], input_len: usize) -> Result<String> {
        let eos = self.tokenizer.eos_token_id();
        let completion: Vec<u32> = output
            .iter()
            .skip(input_len)
            .copied()
            .filter(|&id| Some(id) != eos)
            .collect();
        self.tokenizer.decode(&completion)
    }

    /// Replies to one user turn. With `use_history`, the last
    /// `max_history_len` turns (prompts and full model outputs) form the
    /// model input.
    pub fn predict(&mut self, text: &str, use_history: bool, use_prompt: bool) -> Result<String> {
        let text = if use_prompt {
            self.prompt.format_input(&PromptRecord {
                instruction: text.to_string(),
            })?
        } else {
            text.to_string()
        };
        let text_ids = self.tokenizer.encode(&text)?;
        self.history.push(text_ids.clone());

        let input_ids: Vec<u32> = if use_history {
            let start = self.history.len().saturating_sub(self.max_history_len);
            self.history[start..].concat()
        } else {
            text_ids
        };

        let outputs = self.model()?.generate(&input_ids, &self.options)?;
        let output = outputs
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::validation("model returned no sequences"))?;
        let reply = self.decode_completion(&output, input_ids.len())?;
        self.history.push(output);
        Ok(reply)
    }

    /// Completes every text independently, without touching the history.
    pub fn generate(&self, texts: &[String], options: &GenerationOptions) -> Result<Vec<String>> {
        let model = self.model()?;
        texts
            .iter()
            .map(|text| {
                let input_ids = self.tokenizer.encode(text)?;
                let outputs = model.generate(&input_ids, options)?;
                match outputs.first() {
                    Some(output) => self.decode_completion(output, input_ids.len()),
                    None => Ok(String::new()),
                }
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::tokenizer::tests::WhitespaceTokenizer;
    use anyhow::Result;
    use rstest::*;
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::rc::Rc;

    /// Appends a fixed reply and records what it was asked.
    pub(crate) struct EchoModel {
        pub(crate) reply: Vec<u32>,
        pub(crate) inputs: Rc<RefCell<Vec<Vec<u32>>>>,
    }

    impl LanguageModel for EchoModel {
        fn generate(
            &self,
            input_ids: &[u32],
            _options: &GenerationOptions,
        ) -> crate::error::Result<Vec<Vec<u32>>> {
            self.inputs.borrow_mut().push(input_ids.to_vec());
            let mut out = input_ids.to_vec();
            out.extend_from_slice(&self.reply);
            Ok(vec![out])
        }
    }

    /// Treats a fixed set of paths as existing checkpoints.
    pub(crate) struct FakeLoader {
        pub(crate) existing: HashSet<PathBuf>,
        pub(crate) loaded: Rc<RefCell<Vec<Option<PathBuf>>>>,
        pub(crate) inputs: Rc<RefCell<Vec<Vec<u32>>>>,
    }

    impl FakeLoader {
        pub(crate) fn new(existing: &[&str]) -> Self {
            Self {
                existing: existing.iter().map(PathBuf::from).collect(),
                loaded: Rc::new(RefCell::new(vec![])),
                inputs: Rc::new(RefCell::new(vec![])),
            }
        }
    }

    impl ModelLoader for FakeLoader {
        type Model = EchoModel;

        fn load(&self, checkpoint: Option<&Path>) -> crate::error::Result<EchoModel> {
            self.loaded.borrow_mut().push(checkpoint.map(Path::to_path_buf));
            // WhitespaceTokenizer decodes 2 as "xx"; 0 is its EOS
            Ok(EchoModel {
                reply: vec![2, 0],
                inputs: Rc::clone(&self.inputs),
            })
        }

        fn checkpoint_exists(&self, path: &Path) -> bool {
            self.existing.contains(path)
        }
    }

    #[fixture]
    pub(crate) fn cfg() -> Config {
        let mut cfg = Config::shp_default();
        cfg.federate.save_to = PathBuf::from("ckpt/shp.ckpt");
        cfg.federate.total_round_num = 300;
        cfg.federate.save_freq = 100;
        cfg.llm.chat.max_history_len = 2;
        cfg
    }

    #[rstest]
    #[case(500, 100, vec!["final_", "500_", "400_", "300_", "200_", "100_", "0_", ""])]
    #[case(250, 100, vec!["final_", "200_", "100_", "0_", ""])]
    #[case(10, 0, vec!["final_", ""])]
    fn test_checkpoint_prefixes(
        #[case] total: usize,
        #[case] freq: usize,
        #[case] expected: Vec<&str>,
    ) {
        assert_eq!(checkpoint_prefixes(total, freq), expected);
    }

    #[rstest]
    fn test_resolve_checkpoint_takes_first_existing() {
        let candidates = checkpoint_prefixes(300, 100);
        let exists =
            |p: &Path| p == Path::new("ckpt/200_shp.ckpt") || p == Path::new("ckpt/0_shp.ckpt");
        let found = resolve_checkpoint(Path::new("ckpt"), "shp.ckpt", &candidates, exists);
        assert_eq!(found, Some((2, PathBuf::from("ckpt/200_shp.ckpt"))));
        assert_eq!(
            resolve_checkpoint(Path::new("ckpt"), "shp.ckpt", &candidates, |_| false),
            None
        );
    }

    #[rstest]
    fn test_session_walks_checkpoints_then_raw(cfg: Config) -> Result<()> {
        let loader = FakeLoader::new(&["ckpt/final_shp.ckpt", "ckpt/100_shp.ckpt"]);
        let loaded = Rc::clone(&loader.loaded);
        let mut session = ChatSession::new(&cfg, WhitespaceTokenizer, loader)?;

        assert_eq!(session.state().label(), "final");
        session.next_model()?;
        assert_eq!(
            session.state(),
            &CheckpointState::Loaded {
                prefix: "100_".to_string(),
                path: PathBuf::from("ckpt/100_shp.ckpt"),
            }
        );
        // "0_" and "" remain, so the base model is still allowed
        assert_eq!(session.next_model()?, &CheckpointState::Raw);
        assert!(matches!(
            session.next_model(),
            Err(PipelineError::ModelUnavailable { .. })
        ));
        assert_eq!(session.state(), &CheckpointState::Exhausted);
        assert_eq!(loaded.borrow().last(), Some(&None));
        Ok(())
    }

    #[rstest]
    fn test_no_checkpoint_without_fallback_is_unavailable(mut cfg: Config) {
        cfg.llm.chat.allow_raw_fallback = false;
        let result = ChatSession::new(&cfg, WhitespaceTokenizer, FakeLoader::new(&[]));
        match result {
            Err(PipelineError::ModelUnavailable { basename, tried }) => {
                assert_eq!(basename, "shp.ckpt");
                assert_eq!(tried.first().map(String::as_str), Some("final_shp.ckpt"));
                assert_eq!(tried.last().map(String::as_str), Some("shp.ckpt"));
            }
            _ => panic!("expected ModelUnavailable"),
        }
    }

    #[rstest]
    fn test_predict_keeps_bounded_history(cfg: Config) -> Result<()> {
        let loader = FakeLoader::new(&["ckpt/final_shp.ckpt"]);
        let inputs = Rc::clone(&loader.inputs);
        let mut session = ChatSession::new(&cfg, WhitespaceTokenizer, loader)?;

        assert_eq!(session.predict("hi there", true, false)?, "xx");
        assert_eq!(session.history().len(), 2);
        session.predict("again", true, false)?;

        // max_history_len = 2: the previous output, then the new prompt
        assert_eq!(inputs.borrow()[1], vec![2, 5, 2, 0, 5]);

        session.predict("solo", false, false)?;
        assert_eq!(inputs.borrow()[2], vec![4]);

        session.clear();
        assert!(session.history().is_empty());
        Ok(())
    }

    #[rstest]
    fn test_generate_strips_prompt(cfg: Config) -> Result<()> {
        let session = ChatSession::new(
            &cfg,
            WhitespaceTokenizer,
            FakeLoader::new(&["ckpt/shp.ckpt"]),
        )?;
        assert_eq!(session.state().label(), "latest");
        let texts = vec!["a bb ccc".to_string(), "dddd".to_string()];
        let out = session.generate(&texts, &GenerationOptions::greedy(8))?;
        assert_eq!(out, vec!["xx", "xx"]);
        Ok(())
    }
}
