//! Ollama-served models
//!
//! Fine-tuned checkpoints are expected to be imported into a local Ollama
//! server under their file name (e.g. `final_shp.ckpt`). Prompts are sent in
//! raw mode so the server applies no chat template of its own. Decoding
//! is greedy or sampled; Ollama has no beam search.

use crate::chat::{GenerationOptions, LanguageModel, ModelLoader};
use crate::config::OllamaConfig;
use crate::error::{PipelineError, Result};
use crate::tokenizer::Tokenize;
use anyhow::{anyhow, Context};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    raw: bool,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    num_predict: usize,
    temperature: f64,
    top_p: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

impl From<&GenerationOptions> for GenerateOptions {
    fn from(options: &GenerationOptions) -> Self {
        Self {
            num_predict: options.max_new_tokens,
            temperature: if options.do_sample {
                options.temperature
            } else {
                0.0
            },
            top_p: options.top_p,
            seed: options.seed,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<ModelTag>,
}

#[derive(Debug, Deserialize)]
struct ModelTag {
    name: String,
}

/// One model on an Ollama server, speaking token ids through `tokenizer`.
pub struct OllamaModel<T: Tokenize> {
    client: Client,
    base_url: String,
    model: String,
    tokenizer: T,
}

impl<T: Tokenize> OllamaModel<T> {
    pub fn new(base_url: &str, model: &str, tokenizer: T) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            tokenizer,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Raw text completion.
    pub fn complete(&self, prompt: String, options: &GenerationOptions) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);
        debug!(model = %self.model, prompt_len = prompt.len(), "ollama generate");
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            raw: true,
            stream: false,
            options: options.into(),
        };
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .with_context(|| format!("ollama not reachable at {}", self.base_url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(anyhow!("ollama returned {status} for model {}: {body}", self.model).into());
        }
        let body: GenerateResponse = response.json().map_err(anyhow::Error::from)?;
        Ok(body.response)
    }
}

impl<T: Tokenize> LanguageModel for OllamaModel<T> {
    fn generate(&self, input_ids: &[u32], options: &GenerationOptions) -> Result<Vec<Vec<u32>>> {
        let prompt = self.tokenizer.decode(input_ids)?;
        let completion = self.complete(prompt, options)?;
        let mut output = input_ids.to_vec();
        output.extend(self.tokenizer.encode(&completion)?);
        Ok(vec![output])
    }
}

/// Maps checkpoint paths to Ollama model names; `None` is the base model.
pub struct OllamaLoader<T: Tokenize + Clone> {
    client: Client,
    base_url: String,
    base_model: String,
    tokenizer: T,
}

impl<T: Tokenize + Clone> OllamaLoader<T> {
    pub fn new(cfg: &OllamaConfig, tokenizer: T) -> Self {
        Self {
            client: Client::new(),
            base_url: cfg.url.trim_end_matches('/').to_string(),
            base_model: cfg.base_model.clone(),
            tokenizer,
        }
    }

    fn model_name(checkpoint: &Path) -> Result<String> {
        checkpoint
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| {
                PipelineError::validation(format!(
                    "checkpoint path has no file name: {}",
                    checkpoint.display()
                ))
            })
    }

    /// Names of the models the server has, as listed by `/api/tags`.
    pub fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("listing models at {}", self.base_url))?;
        let tags: TagsResponse = response.json().map_err(anyhow::Error::from)?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}

impl<T: Tokenize + Clone> ModelLoader for OllamaLoader<T> {
    type Model = OllamaModel<T>;

    fn load(&self, checkpoint: Option<&Path>) -> Result<Self::Model> {
        let model = match checkpoint {
            Some(path) => Self::model_name(path)?,
            None => self.base_model.clone(),
        };
        Ok(OllamaModel {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            model,
            tokenizer: self.tokenizer.clone(),
        })
    }

    fn checkpoint_exists(&self, path: &Path) -> bool {
        let Ok(name) = Self::model_name(path) else {
            return false;
        };
        match self.list_models() {
            Ok(models) => models
                .iter()
                .any(|m| *m == name || m.strip_suffix(":latest") == Some(name.as_str())),
            Err(e) => {
                warn!(error = %e, "could not list ollama models");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::tests::gpt2;
    use crate::tokenizer::TiktokenTokenizer;
    use anyhow::Result;
    use mockito::Matcher;
    use rstest::*;
    use serde_json::json;
    use std::rc::Rc;

    fn ollama_cfg(url: &str) -> OllamaConfig {
        OllamaConfig {
            url: url.to_string(),
            base_model: "llama3.2".to_string(),
        }
    }

    #[rstest]
    fn test_generate_appends_completion(gpt2: TiktokenTokenizer) -> Result<()> {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/api/generate")
            .match_body(Matcher::PartialJson(json!({
                "model": "final_shp.ckpt",
                "prompt": "The sky is",
                "raw": true,
                "stream": false,
                "options": {"num_predict": 5, "temperature": 0.0},
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"model":"final_shp.ckpt","response":" blue.","done":true}"#)
            .create();

        let tokenizer = Rc::new(gpt2);
        let loader = OllamaLoader::new(&ollama_cfg(&server.url()), Rc::clone(&tokenizer));
        let model = loader.load(Some(Path::new("ckpt/final_shp.ckpt")))?;

        let input_ids = tokenizer.encode("The sky is")?;
        let outputs = model.generate(&input_ids, &GenerationOptions::greedy(5))?;

        mock.assert();
        assert_eq!(outputs.len(), 1);
        assert_eq!(&outputs[0][..input_ids.len()], &input_ids[..]);
        assert_eq!(tokenizer.decode(&outputs[0][input_ids.len()..])?, " blue.");
        Ok(())
    }

    #[rstest]
    fn test_every_generation_option_is_forwarded() -> Result<()> {
        let sampled = GenerationOptions {
            max_new_tokens: 8,
            temperature: 0.7,
            top_p: 0.9,
            do_sample: true,
            seed: Some(5),
        };
        assert_eq!(
            serde_json::to_value(GenerateOptions::from(&sampled))?,
            json!({"num_predict": 8, "temperature": 0.7, "top_p": 0.9, "seed": 5})
        );
        assert_eq!(
            serde_json::to_value(GenerateOptions::from(&GenerationOptions::greedy(3)))?,
            json!({"num_predict": 3, "temperature": 0.0, "top_p": 1.0})
        );
        Ok(())
    }

    #[rstest]
    fn test_checkpoint_exists_reads_tags(gpt2: TiktokenTokenizer) {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("GET", "/api/tags")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"models":[{"name":"100_shp.ckpt:latest"},{"name":"llama3.2:latest"}]}"#)
            .expect_at_least(1)
            .create();

        let loader = OllamaLoader::new(&ollama_cfg(&server.url()), Rc::new(gpt2));
        assert!(loader.checkpoint_exists(Path::new("ckpt/100_shp.ckpt")));
        assert!(!loader.checkpoint_exists(Path::new("ckpt/final_shp.ckpt")));
    }

    #[rstest]
    fn test_server_error_is_reported(gpt2: TiktokenTokenizer) -> Result<()> {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/api/generate")
            .with_status(404)
            .with_body(r#"{"error":"model not found"}"#)
            .create();

        let loader = OllamaLoader::new(&ollama_cfg(&server.url()), Rc::new(gpt2));
        let model = loader.load(None)?;
        assert_eq!(model.model(), "llama3.2");
        assert!(model.generate(&[464], &GenerationOptions::default()).is_err());
        Ok(())
    }

    #[rstest]
    fn test_unreachable_server_means_no_checkpoint(gpt2: TiktokenTokenizer) {
        let loader = OllamaLoader::new(&ollama_cfg("http://127.0.0.1:9"), Rc::new(gpt2));
        assert!(!loader.checkpoint_exists(Path::new("ckpt/final_shp.ckpt")));
    }
}
