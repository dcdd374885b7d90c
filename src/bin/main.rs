use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::Table;
use fedllm_preference_rs::{
    chat::{ChatSession, GenerationOptions},
    config::Config,
    corpus::{load_rlhf_dataset, load_safe_prompts, HfParquetSource},
    eval::{evaluate_summaries, load_tldr_test, write_report},
    ollama::OllamaLoader,
    partition::DirichletSplitter,
    prompt::PromptTemplate,
    rouge::{RougeScorer, RougeScores, DEFAULT_ROUGE_TYPES},
    shp::ShpLoader,
    tokenizer::{AnyTokenizer, Tokenize},
};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::rc::Rc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// CLI
#[derive(Debug, Parser)]
#[command(name = "fedllm-preference-rs")]
#[command(about = "Prepare SHP preference datasets and evaluate fine-tuned checkpoints.", long_about = None)]
struct Cli {
    /// TOML run configuration; flags below override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Data root holding record and dataset caches
    #[arg(long, global = true)]
    data_root: Option<PathBuf>,

    /// Tokenizer (tiktoken name or Hugging Face repo id)
    #[arg(long, global = true)]
    tokenizer: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Variant {
    /// Win and lose completions under the `shp` prompt
    Comparison,
    /// Preferred completions only
    Best,
    /// Letter-choice answers under the `shp_cmp` prompt
    Choice,
    /// Unique instructions re-split for RLHF
    Rlhf,
    /// Safety prompts
    Safe,
    /// AlpacaFarm human preferences as a choice eval set
    Alpacafarm,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build (or load from cache) one dataset variant
    Prepare {
        #[arg(value_enum)]
        variant: Variant,
        /// Number of simulated clients
        #[arg(long)]
        clients: Option<usize>,
        /// Concentration of the Dirichlet split
        #[arg(long)]
        alpha: Option<f64>,
        /// Keep at most this many val/test examples
        #[arg(long)]
        max_num_test: Option<usize>,
    },
    /// Chat with the newest checkpoint
    Chat {
        /// Use the base model instead of a checkpoint
        #[arg(long)]
        raw: bool,
    },
    /// Score generated summaries on the Reddit TL;DR test set
    EvalSummarization {
        #[arg(long)]
        raw: bool,
        #[arg(long, default_value_t = 1)]
        batch_size: usize,
        /// Evaluate only the first N posts
        #[arg(long)]
        limit: Option<usize>,
        /// Directory for the report files
        #[arg(long)]
        outdir: Option<PathBuf>,
    },
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut cfg = match &cli.config {
        Some(path) => Config::from_toml_file(path)?,
        None => Config::shp_default(),
    };
    if let Some(root) = &cli.data_root {
        cfg.data.root = root.clone();
    }
    if let Some(tokenizer) = &cli.tokenizer {
        cfg.llm.tokenizer = tokenizer.clone();
    }
    Ok(cfg)
}

fn print_sizes(rows: &[(&str, usize)]) {
    let mut table = Table::new();
    table.set_header(vec!["split", "examples"]);
    for (split, n) in rows {
        table.add_row(vec![split.to_string(), n.to_string()]);
    }
    println!("{table}");
}

fn print_scores(scores: &RougeScores) {
    let mut table = Table::new();
    table.set_header(vec!["metric", "precision", "recall", "fmeasure"]);
    for (name, s) in scores {
        table.add_row(vec![
            name.clone(),
            format!("{:.4}", s.precision),
            format!("{:.4}", s.recall),
            format!("{:.4}", s.fmeasure),
        ]);
    }
    println!("{table}");
}

fn load_tokenizer(cfg: &Config) -> anyhow::Result<AnyTokenizer> {
    let tokenizer = AnyTokenizer::load(&cfg.llm.tokenizer)?;
    info!(tokenizer = %tokenizer.name_or_path(), "loaded tokenizer");
    Ok(tokenizer)
}

fn prepare(cfg: &Config, variant: Variant) -> anyhow::Result<()> {
    let source = HfParquetSource::new(cfg.data.root.join("parquet"));
    let splitter = DirichletSplitter::new(cfg.data.alpha)
        .min_size(cfg.data.min_client_size)
        .seed(cfg.seed);
    let loader = ShpLoader::from_config(cfg, &source, &splitter);
    info!(?variant, root = %cfg.data.root.display(), "preparing dataset");

    match variant {
        Variant::Comparison => {
            let tokenizer = load_tokenizer(cfg)?;
            let (train, val, test) = loader.load_comparison_dataset(&tokenizer)?;
            print_sizes(&[("train", train.len()), ("val", val.len()), ("test", test.len())]);
        }
        Variant::Best => {
            let tokenizer = load_tokenizer(cfg)?;
            let (train, val, test) = loader.load_shp_best_dataset(&tokenizer)?;
            print_sizes(&[("train", train.len()), ("val", val.len()), ("test", test.len())]);
        }
        Variant::Choice => {
            let tokenizer = load_tokenizer(cfg)?;
            let (train, val, test) = loader.load_shp_cmp_dataset_by_choice(&tokenizer)?;
            print_sizes(&[("train", train.len()), ("val", val.len()), ("test", test.len())]);
        }
        Variant::Alpacafarm => {
            let tokenizer = load_tokenizer(cfg)?;
            let test = loader.load_alpacafarm_human_for_eval(&tokenizer)?;
            print_sizes(&[("test", test.len())]);
        }
        Variant::Rlhf => {
            let (train, val, test) =
                load_rlhf_dataset(&cfg.data.root, &source, cfg.data.max_num_test)?;
            print_sizes(&[("train", train.len()), ("val", val.len()), ("test", test.len())]);
        }
        Variant::Safe => {
            let prompts = load_safe_prompts(&source)?;
            print_sizes(&[("train", prompts.len())]);
        }
    }
    Ok(())
}

type OllamaSession = ChatSession<OllamaLoader<Rc<AnyTokenizer>>, Rc<AnyTokenizer>>;

fn session(cfg: &Config, raw: bool) -> anyhow::Result<OllamaSession> {
    let tokenizer = Rc::new(AnyTokenizer::load(&cfg.llm.tokenizer)?);
    let loader = OllamaLoader::new(&cfg.llm.ollama, Rc::clone(&tokenizer));
    let session = if raw {
        ChatSession::with_raw_model(cfg, tokenizer, loader)?
    } else {
        ChatSession::new(cfg, tokenizer, loader)?
    };
    info!(weights = session.state().label(), "chat session ready");
    Ok(session)
}

fn chat(cfg: &Config, raw: bool) -> anyhow::Result<()> {
    let mut session = session(cfg, raw)?;
    let welcome = "Welcome to the chat bot, `clear` to clear history, `quit` to end chat.";
    println!("{welcome}");

    let stdin = io::stdin();
    loop {
        print!("\nUser: ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        match line.trim() {
            "quit" => break,
            "clear" => {
                session.clear();
                println!("{welcome}");
            }
            text => println!("\nBot: {}", session.predict(text, true, true)?),
        }
    }
    Ok(())
}

fn eval_summarization(
    cfg: &Config,
    raw: bool,
    batch_size: usize,
    limit: Option<usize>,
) -> anyhow::Result<()> {
    let session = session(cfg, raw)?;
    let mut records = load_tldr_test(&cfg.data.root)?;
    if let Some(n) = limit {
        records.truncate(n);
    }

    let scorer = RougeScorer::new(&DEFAULT_ROUGE_TYPES)?;
    let options = GenerationOptions::greedy(cfg.llm.max_new_token);
    let outcome = evaluate_summaries(
        records,
        &PromptTemplate::tldr_summary(),
        &scorer,
        batch_size,
        |prompts| session.generate(prompts, &options),
    );

    let (txt, json) = write_report(&cfg.outdir, session.state().label(), &outcome)?;
    print_scores(&outcome.aggregate);
    println!(
        "{} scored, {} failed batches; wrote {} and {}",
        outcome.num_scored(),
        outcome.errors.len(),
        txt.display(),
        json.display()
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut cfg = load_config(&cli)?;
    match cli.command {
        Commands::Prepare {
            variant,
            clients,
            alpha,
            max_num_test,
        } => {
            if let Some(n) = clients {
                cfg.federate.client_num = n;
            }
            if let Some(alpha) = alpha {
                cfg.data.alpha = alpha;
            }
            if max_num_test.is_some() {
                cfg.data.max_num_test = max_num_test;
            }
            prepare(&cfg, variant)
        }
        Commands::Chat { raw } => chat(&cfg, raw),
        Commands::EvalSummarization {
            raw,
            batch_size,
            limit,
            outdir,
        } => {
            if let Some(outdir) = outdir {
                cfg.outdir = outdir;
            }
            eval_summarization(&cfg, raw, batch_size, limit)
        }
    }
}
