//! Command-line interface for the standards QA engine
//!
//! Subcommands: `index-bm25` builds the lexical artifact, `search` runs
//! retrieval only, `ask` produces a cited answer or refusal, `agent-ask`
//! runs the bounded controller, `eval-run` writes deterministic evaluation
//! reports. Configuration errors exit with code 2.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use standards_rag::agent::{write_trace, AgentLoop};
use standards_rag::config::Settings;
use standards_rag::error::Error;
use standards_rag::eval::{run_eval, EvalOptions};
use standards_rag::generation::{build_cited_answer, Generator, HttpGenerator};
use standards_rag::index::{Bm25Index, ChunkStore};
use standards_rag::retrieval::{
    Backend, DenseRetriever, FlatDenseIndex, HttpEmbedder, Mode, RetrievalOptions, Retriever,
};
use standards_rag::types::AnswerResult;

#[derive(Parser)]
#[command(
    name = "standards-rag",
    version,
    about = "Citation-grounded question answering over a standards corpus"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct RetrievalArgs {
    /// Retrieval mode: base (single backend) or hybrid (dense + bm25)
    #[arg(long)]
    mode: Option<String>,
    /// Base-mode backend: faiss or bm25
    #[arg(long)]
    backend: Option<String>,
    /// Final number of hits
    #[arg(long)]
    k: Option<usize>,
    /// Candidate expansion factor before fusion
    #[arg(long)]
    candidate_multiplier: Option<usize>,
    /// RRF constant in 1/(k0 + rank)
    #[arg(long)]
    k0: Option<usize>,
    /// Disable deterministic query variant fusion
    #[arg(long)]
    no_query_fusion: bool,
    /// Disable the lexical rerank over fused candidates
    #[arg(long)]
    no_rerank: bool,
    /// Fused pool size considered before rerank truncation
    #[arg(long)]
    rerank_pool: Option<usize>,
}

impl RetrievalArgs {
    fn apply(&self, settings: &Settings) -> Result<RetrievalOptions, Error> {
        let mut opts = RetrievalOptions::from_config(&settings.retrieval)?;
        if let Some(mode) = &self.mode {
            opts.mode = mode.parse()?;
        }
        if let Some(backend) = &self.backend {
            opts.backend = backend.parse()?;
        }
        if let Some(k) = self.k {
            opts.k = k;
        }
        if let Some(multiplier) = self.candidate_multiplier {
            opts.candidate_multiplier = multiplier;
        }
        if let Some(k0) = self.k0 {
            opts.k0 = k0;
        }
        if self.no_query_fusion {
            opts.query_fusion = false;
        }
        if self.no_rerank {
            opts.enable_rerank = false;
        }
        if let Some(pool) = self.rerank_pool {
            opts.rerank_pool = pool;
        }
        opts.validate()?;
        Ok(opts)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Build and persist the BM25 artifact from the chunk store
    IndexBm25 {
        #[arg(long)]
        chunk_store: Option<PathBuf>,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long, default_value_t = Bm25Index::DEFAULT_K1)]
        k1: f64,
        #[arg(long, default_value_t = Bm25Index::DEFAULT_B)]
        b: f64,
    },
    /// Print top-k hits for a query
    Search {
        /// Question text (wrap in quotes recommended)
        #[arg(required = true)]
        query: Vec<String>,
        #[command(flatten)]
        retrieval: RetrievalArgs,
    },
    /// Produce a cited answer or the refusal sentinel
    Ask {
        /// Question text (wrap in quotes recommended)
        #[arg(required = true)]
        question: Vec<String>,
        /// Print the structured payload as JSON
        #[arg(long)]
        json: bool,
        /// Print retrieved evidence before answering
        #[arg(long)]
        show_evidence: bool,
        /// Also write the structured payload to a file
        #[arg(long)]
        save_json: Option<PathBuf>,
        #[command(flatten)]
        retrieval: RetrievalArgs,
    },
    /// Run the bounded retrieve-assess-refine-answer controller
    AgentAsk {
        question: String,
        /// Trace output directory
        #[arg(long, default_value = "runs/agent")]
        out_dir: PathBuf,
        /// Do not write a trace file
        #[arg(long)]
        no_trace: bool,
        /// Print the full agent state as JSON
        #[arg(long)]
        json: bool,
    },
    /// Evaluate retrieval (and optionally answers) on a labeled question set
    EvalRun {
        #[arg(long, default_value = "eval/questions.jsonl")]
        dataset: PathBuf,
        #[arg(long, default_value = "reports/eval")]
        outdir: PathBuf,
        /// Comma-separated k values for retrieval metrics
        #[arg(long, default_value = "1,3,5,8")]
        ks: String,
        /// Also run the ask pipeline and score citation/refusal metrics
        #[arg(long)]
        with_answers: bool,
        /// Page slack for relaxed diagnostics
        #[arg(long, default_value_t = 1)]
        near_page_tolerance: u32,
        /// Allow answerable=true questions with empty gold spans
        #[arg(long)]
        allow_unlabeled: bool,
        #[command(flatten)]
        retrieval: RetrievalArgs,
    },
}

fn parse_ks(raw: &str) -> Result<Vec<usize>, Error> {
    let mut ks = Vec::new();
    for token in raw.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let value: usize = token
            .parse()
            .map_err(|_| Error::config(format!("Invalid k value in --ks: {token:?}")))?;
        if value == 0 {
            return Err(Error::config("All --ks values must be > 0"));
        }
        ks.push(value);
    }
    if ks.is_empty() {
        return Err(Error::config("--ks produced no valid k values"));
    }
    Ok(ks)
}

/// Load the read-only indexes once; dense only when the options need it.
fn build_retriever(settings: &Settings, opts: &RetrievalOptions) -> Result<Retriever, Error> {
    let store = Arc::new(ChunkStore::load(settings.data.chunk_store_path())?);
    let bm25 = Arc::new(Bm25Index::load(settings.data.bm25_path())?);

    let needs_dense = opts.mode == Mode::Hybrid || opts.backend == Backend::Faiss;
    let dense = if needs_dense {
        let embedder = Arc::new(HttpEmbedder::new(&settings.llm)?);
        let index = FlatDenseIndex::load(settings.data.dense_path(), embedder)?;
        Some(DenseRetriever::new(Arc::new(index), Arc::clone(&store)))
    } else {
        None
    };

    Ok(Retriever::new(store, bm25, dense))
}

fn print_citations(result: &AnswerResult) {
    println!("\n=== Citations ===");
    if result.citations.is_empty() {
        println!("(none)");
        return;
    }
    for c in &result.citations {
        println!(
            "[{}] {} p{}-p{} chunk_id={}",
            c.key, c.doc_id, c.start_page, c.end_page, c.chunk_id
        );
    }
}

async fn run(cli: Cli) -> Result<(), Error> {
    let settings = Settings::from_env()?;

    match cli.command {
        Commands::IndexBm25 { chunk_store, out, k1, b } => {
            let store_path = chunk_store.unwrap_or_else(|| settings.data.chunk_store_path());
            let out_path = out.unwrap_or_else(|| settings.data.bm25_path());
            let store = ChunkStore::load(&store_path)?;
            let index = Bm25Index::build(&store, k1, b)?;
            index.save(&out_path)?;
            println!(
                "[OK] saved {} docs={} vocab={} avgdl={:.2}",
                out_path.display(),
                index.doc_count,
                index.vocab.len(),
                index.avgdl
            );
        }

        Commands::Search { query, retrieval } => {
            let opts = retrieval.apply(&settings)?;
            let retriever = build_retriever(&settings, &opts)?;
            let qtext = query.join(" ");
            let hits = retriever.retrieve(&qtext, &opts).await?;

            println!("\nQuery: {qtext}\n");
            for (i, h) in hits.iter().enumerate() {
                println!(
                    "[{}] score={:.6}  {}  p{}-p{}  ({})",
                    i + 1,
                    h.score,
                    h.doc_id,
                    h.start_page,
                    h.end_page,
                    h.chunk_id
                );
                if !h.text.is_empty() {
                    let preview: String = h.text.chars().take(300).collect();
                    println!("    {}...", preview.replace('\n', " "));
                }
                println!();
            }
        }

        Commands::Ask { question, json, show_evidence, save_json, retrieval } => {
            let opts = retrieval.apply(&settings)?;
            let retriever = build_retriever(&settings, &opts)?;
            let qtext = question.join(" ");
            if qtext.trim().is_empty() {
                return Err(Error::config("Empty question."));
            }

            let hits = retriever.retrieve(&qtext, &opts).await?;
            if show_evidence {
                println!("\n=== Evidence (top hits) ===");
                for (i, h) in hits.iter().enumerate() {
                    let preview: String = h.text.trim().chars().take(220).collect();
                    println!(
                        "{:02}. score={:.4} {} p{}-p{} chunk_id={}",
                        i + 1,
                        h.score,
                        h.doc_id,
                        h.start_page,
                        h.end_page,
                        h.chunk_id
                    );
                    println!("    {}", preview.replace('\n', " "));
                }
            }

            let generator = HttpGenerator::new(&settings.llm)?;
            let result = build_cited_answer(
                &qtext,
                &hits,
                Some(retriever.store()),
                &generator,
                &settings.answer,
            )
            .await?;

            if let Some(path) = &save_json {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, serde_json::to_string_pretty(&result)?)?;
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("\n=== Answer ===");
                println!("{}", result.answer);
                print_citations(&result);
            }
        }

        Commands::AgentAsk { question, out_dir, no_trace, json } => {
            let opts = RetrievalOptions::from_config(&settings.retrieval)?;
            let retriever = build_retriever(&settings, &opts)?;
            let generator = HttpGenerator::new(&settings.llm)?;
            let agent = AgentLoop::new(
                &settings.agent,
                &settings.answer,
                &retriever,
                opts,
                &generator as &dyn Generator,
            );

            let state = agent.run(&question).await;

            if json {
                println!("{}", serde_json::to_string_pretty(&state)?);
            } else {
                println!("{}", state.final_answer);
                println!();
                if state.citations.is_empty() {
                    println!("Citations: (none)");
                } else {
                    println!("Citations:");
                    for c in &state.citations {
                        println!(
                            "- [{}] {} p{}-p{} (chunk={})",
                            c.key, c.doc_id, c.start_page, c.end_page, c.chunk_id
                        );
                    }
                }
            }

            if !no_trace {
                let path = write_trace(&state, &out_dir)?;
                println!();
                println!("Trace saved: {}", path.display());
            }
        }

        Commands::EvalRun {
            dataset,
            outdir,
            ks,
            with_answers,
            near_page_tolerance,
            allow_unlabeled,
            retrieval,
        } => {
            let opts = retrieval.apply(&settings)?;
            let retriever = build_retriever(&settings, &opts)?;
            let metric_ks = parse_ks(&ks)?;
            let eval_opts = EvalOptions {
                dataset,
                outdir,
                ks: metric_ks,
                primary_k: opts.k,
                near_page_tolerance,
                allow_unlabeled,
                with_answers,
            };

            let generator = if with_answers {
                Some(HttpGenerator::new(&settings.llm)?)
            } else {
                None
            };
            let artifacts = run_eval(
                &retriever,
                &opts,
                &settings.answer,
                generator.as_ref().map(|g| g as &dyn Generator),
                &eval_opts,
            )
            .await?;

            println!("[OK] wrote {}", artifacts.per_question.display());
            println!("[OK] wrote {}", artifacts.summary_json.display());
            println!("[OK] wrote {}", artifacts.summary_md.display());
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "standards_rag=info".into()),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ Error::Config(_)) => {
            eprintln!("{e}");
            ExitCode::from(2)
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
