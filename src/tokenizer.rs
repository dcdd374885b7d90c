//! Tokenizer backends
//!
//! The pipeline only needs a tokenizer to count tokens, encode prompts and
//! decode generations. `Tokenize` is that seam; it is implemented for the
//! tiktoken BPEs (`gpt2`, `cl100k_base`, ...) and for Hugging Face
//! `tokenizer.json` files pulled from the hub.

use crate::error::Result;
use anyhow::anyhow;
use std::path::Path;
use std::rc::Rc;
use tiktoken_rs::CoreBPE;

pub const ENDOFTEXT: &str = "<|endoftext|>";

pub trait Tokenize {
    /// Identity of the tokenizer as it was requested (model name or path).
    fn name_or_path(&self) -> &str;

    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    fn decode(&self, ids: &[u32]) -> Result<String>;

    fn eos_token_id(&self) -> Option<u32>;

    /// Base name used in cache file names, e.g. `Llama-2-7b-hf` for
    /// `meta-llama/Llama-2-7b-hf`.
    fn tokenizer_name(&self) -> String {
        Path::new(self.name_or_path())
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.name_or_path().to_string())
    }

    fn num_tokens(&self, text: &str) -> Result<usize> {
        Ok(self.encode(text)?.len())
    }
}

impl<T: Tokenize + ?Sized> Tokenize for Rc<T> {
    fn name_or_path(&self) -> &str {
        (**self).name_or_path()
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        (**self).encode(text)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        (**self).decode(ids)
    }

    fn eos_token_id(&self) -> Option<u32> {
        (**self).eos_token_id()
    }
}

impl<T: Tokenize + ?Sized> Tokenize for &T {
    fn name_or_path(&self) -> &str {
        (**self).name_or_path()
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        (**self).encode(text)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        (**self).decode(ids)
    }

    fn eos_token_id(&self) -> Option<u32> {
        (**self).eos_token_id()
    }
}

/// A tiktoken BPE together with the name it was loaded under
pub struct TiktokenTokenizer {
    name: String,
    bpe: CoreBPE,
    eos_token_id: Option<u32>,
}

impl TiktokenTokenizer {
    pub fn new(name: &str) -> Result<Self> {
        let bpe = match name {
            "r50k_base" => tiktoken_rs::r50k_base()?,
            "p50k_base" => tiktoken_rs::p50k_base()?,
            "cl100k_base" => tiktoken_rs::cl100k_base()?,
            "o200k_base" => tiktoken_rs::o200k_base()?,
            model => tiktoken_rs::get_bpe_from_model(model)?,
        };
        let eos = bpe.encode_with_special_tokens(ENDOFTEXT);
        let eos_token_id = match eos[..] {
            [id] => Some(id),
            _ => None,
        };
        Ok(Self {
            name: name.to_string(),
            bpe,
            eos_token_id,
        })
    }
}

impl Tokenize for TiktokenTokenizer {
    fn name_or_path(&self) -> &str {
        &self.name
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(self.bpe.encode_with_special_tokens(text))
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        Ok(self.bpe.decode(ids.to_vec())?)
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }
}

/// A Hugging Face `tokenizers::Tokenizer`
pub struct HfTokenizer {
    name_or_path: String,
    inner: tokenizers::Tokenizer,
    eos_token_id: Option<u32>,
}

const EOS_CANDIDATES: [&str; 5] = ["</s>", ENDOFTEXT, "<|eot_id|>", "<|end_of_text|>", "<eos>"];

impl HfTokenizer {
    pub fn from_file<P: AsRef<Path>>(name_or_path: &str, file: P) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(file.as_ref()).map_err(|e| anyhow!(e))?;
        let eos_token_id = EOS_CANDIDATES
            .iter()
            .find_map(|tok| inner.token_to_id(tok));
        Ok(Self {
            name_or_path: name_or_path.to_string(),
            inner,
            eos_token_id,
        })
    }

    /// Downloads `tokenizer.json` for `repo_id` from the hub (cached by `hf-hub`).
    pub fn from_hub(repo_id: &str) -> Result<Self> {
        let api = hf_hub::api::sync::Api::new().map_err(anyhow::Error::from)?;
        let file = api
            .model(repo_id.to_string())
            .get("tokenizer.json")
            .map_err(anyhow::Error::from)?;
        Self::from_file(repo_id, file)
    }
}

impl Tokenize for HfTokenizer {
    fn name_or_path(&self) -> &str {
        &self.name_or_path
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self.inner.encode(text, false).map_err(|e| anyhow!(e))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        Ok(self.inner.decode(ids, true).map_err(|e| anyhow!(e))?)
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }
}

/// Either backend, picked from the configured tokenizer name
pub enum AnyTokenizer {
    Tiktoken(TiktokenTokenizer),
    HuggingFace(HfTokenizer),
}

impl AnyTokenizer {
    /// `gpt2`-style names and tiktoken encodings go to tiktoken, local
    /// `tokenizer.json` paths and hub repo ids go to `tokenizers`.
    pub fn load(name_or_path: &str) -> Result<Self> {
        let path = Path::new(name_or_path);
        if path.is_file() {
            return Ok(Self::HuggingFace(HfTokenizer::from_file(
                name_or_path,
                path,
            )?));
        }
        if !name_or_path.contains('/') {
            if let Ok(tok) = TiktokenTokenizer::new(name_or_path) {
                return Ok(Self::Tiktoken(tok));
            }
        }
        Ok(Self::HuggingFace(HfTokenizer::from_hub(name_or_path)?))
    }

    fn inner(&self) -> &dyn Tokenize {
        match self {
            Self::Tiktoken(tok) => tok,
            Self::HuggingFace(tok) => tok,
        }
    }
}

impl Tokenize for AnyTokenizer {
    fn name_or_path(&self) -> &str {
        self.inner().name_or_path()
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        self.inner().encode(text)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner().decode(ids)
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.inner().eos_token_id()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::Result;
    use rstest::*;

    /// Splits on whitespace; every word is one token. Ids are word lengths so
    /// tests can reason about budgets without a real vocabulary.
    pub(crate) struct WhitespaceTokenizer;

    impl Tokenize for WhitespaceTokenizer {
        fn name_or_path(&self) -> &str {
            "tests/whitespace"
        }

        fn encode(&self, text: &str) -> crate::error::Result<Vec<u32>> {
            Ok(text.split_whitespace().map(|w| w.len() as u32).collect())
        }

        fn decode(&self, ids: &[u32]) -> crate::error::Result<String> {
            Ok(ids
                .iter()
                .map(|&n| "x".repeat(n as usize))
                .collect::<Vec<_>>()
                .join(" "))
        }

        fn eos_token_id(&self) -> Option<u32> {
            Some(0)
        }
    }

    #[fixture]
    pub(crate) fn gpt2() -> TiktokenTokenizer {
        TiktokenTokenizer::new("gpt2").unwrap()
    }

    #[rstest]
    fn test_gpt2_eos_is_endoftext(gpt2: TiktokenTokenizer) {
        assert_eq!(gpt2.eos_token_id(), Some(50256));
    }

    #[rstest]
    fn test_encode_and_decode(gpt2: TiktokenTokenizer) -> Result<()> {
        let txt = "In the heart of the city";
        let ids = gpt2.encode(txt)?;
        assert_eq!(gpt2.num_tokens(txt)?, ids.len());
        assert_eq!(gpt2.decode(&ids)?, txt);
        Ok(())
    }

    #[rstest]
    #[case("gpt2", "gpt2")]
    #[case("meta-llama/Llama-2-7b-hf", "Llama-2-7b-hf")]
    fn test_tokenizer_name_is_basename(#[case] name: &str, #[case] expected: &str) {
        struct Named(String);
        impl Tokenize for Named {
            fn name_or_path(&self) -> &str {
                &self.0
            }
            fn encode(&self, _: &str) -> crate::error::Result<Vec<u32>> {
                Ok(vec![])
            }
            fn decode(&self, _: &[u32]) -> crate::error::Result<String> {
                Ok(String::new())
            }
            fn eos_token_id(&self) -> Option<u32> {
                None
            }
        }
        assert_eq!(Named(name.to_string()).tokenizer_name(), expected);
    }

    #[rstest]
    fn test_any_tokenizer_picks_tiktoken_for_gpt2() -> Result<()> {
        let tok = AnyTokenizer::load("gpt2")?;
        assert!(matches!(tok, AnyTokenizer::Tiktoken(_)));
        assert_eq!(tok.tokenizer_name(), "gpt2");
        Ok(())
    }
}
