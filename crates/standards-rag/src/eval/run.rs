//! Evaluation runner: deterministic per-question and summary reports
//!
//! Two runs over the same dataset and corpus produce byte-identical JSON:
//! artifact names are fixed, struct field order pins JSON key order, and no
//! timestamps or run ids are embedded.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::AnswerConfig;
use crate::error::{Error, Result};
use crate::eval::dataset::{load_questions, qid_sort_key, GoldSpan, QuestionRow};
use crate::eval::metrics::{
    compute_retrieval_metrics, evaluate_answer, hit_matches_gold, hit_matches_gold_doc_only,
    hit_matches_gold_with_tolerance, safe_mean, AnswerMetrics, RetrievalMetrics,
};
use crate::generation::answer::build_cited_answer;
use crate::generation::generator::Generator;
use crate::retrieval::fusion::{Mode, RankedHit, RetrievalOptions, Retriever};
use crate::types::AnswerResult;

/// Harness knobs beyond the retrieval options.
#[derive(Debug, Clone)]
pub struct EvalOptions {
    pub dataset: PathBuf,
    pub outdir: PathBuf,
    pub ks: Vec<usize>,
    pub primary_k: usize,
    pub near_page_tolerance: u32,
    pub allow_unlabeled: bool,
    pub with_answers: bool,
}

impl EvalOptions {
    fn metric_ks(&self) -> Result<Vec<usize>> {
        let mut ks: Vec<usize> = self.ks.iter().copied().filter(|&k| k > 0).collect();
        ks.sort_unstable();
        ks.dedup();
        if ks.is_empty() {
            return Err(Error::config("--ks produced no valid k values"));
        }
        Ok(ks)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TopHitId {
    rank: usize,
    doc_id: String,
    pages: String,
    chunk_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct PerQuestionRetrieval {
    metrics: Option<BTreeMap<String, RetrievalMetrics>>,
    gold_hit_ranks: Vec<usize>,
    doc_hit_ranks: Vec<usize>,
    near_page_hit_ranks: Vec<usize>,
    has_gold_in_primary_k: Option<bool>,
    top_hit_ids: Vec<TopHitId>,
    hits: Vec<RankedHit>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PerQuestionAnswer {
    #[serde(skip_serializing_if = "Option::is_none")]
    metrics: Option<AnswerMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<AnswerResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PerQuestionRow {
    qid: String,
    question: String,
    answerable: bool,
    gold: Vec<GoldSpan>,
    retrieval: PerQuestionRetrieval,
    #[serde(skip_serializing_if = "Option::is_none")]
    answer: Option<PerQuestionAnswer>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MissedQuestion {
    qid: String,
    question: String,
    gold: Vec<GoldSpan>,
    gold_hit_ranks: Vec<usize>,
    top_hit_ids: Vec<TopHitId>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AtK {
    recall: Option<f64>,
    mrr: Option<f64>,
    ndcg: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct HitRates {
    strict_page_overlap: Option<f64>,
    doc_only: Option<f64>,
    near_page_tolerance: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SecondaryDiagnostics {
    near_page_tolerance: u32,
    hit_rate_at_k: BTreeMap<String, HitRates>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RetrievalSummary {
    scoring_scope: String,
    metric_ks: Vec<usize>,
    primary_k: usize,
    n_questions: usize,
    skipped_unanswerable_qids: Vec<String>,
    skipped_unlabeled_answerable_qids: Vec<String>,
    at_k: BTreeMap<String, AtK>,
    recall_at_k: Option<f64>,
    mrr_at_k: Option<f64>,
    ndcg_at_k: Option<f64>,
    n_questions_with_gold_in_primary_k: usize,
    n_questions_without_gold_in_primary_k: usize,
    questions_with_gold_in_primary_k_qids: Vec<String>,
    questions_without_gold_in_primary_k: Vec<MissedQuestion>,
    secondary_diagnostics: SecondaryDiagnostics,
}

#[derive(Debug, Serialize, Deserialize)]
struct AnswerSummary {
    enabled: bool,
    citation_presence_rate: Option<f64>,
    inline_citation_sentence_rate: Option<f64>,
    refusal_accuracy: Option<f64>,
    answer_errors: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct RunConfig {
    mode: String,
    backend: String,
    k: usize,
    ks: Vec<usize>,
    retrieval_depth: usize,
    near_page_tolerance: u32,
    k0: usize,
    candidate_multiplier: usize,
    fusion: bool,
    rerank: bool,
    rerank_pool: usize,
    with_answers: bool,
    allow_unlabeled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct Counts {
    total_questions: usize,
    answerable_questions: usize,
    unanswerable_questions: usize,
    labeled_answerable_questions: usize,
    unlabeled_answerable_questions: usize,
    retrieval_evaluated_questions: usize,
    answer_evaluated_questions: usize,
    answer_errors: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct Summary {
    dataset_path: String,
    run_config: RunConfig,
    counts: Counts,
    retrieval: RetrievalSummary,
    answer: AnswerSummary,
}

/// Paths of the artifacts one run produced.
#[derive(Debug)]
pub struct EvalArtifacts {
    pub per_question: PathBuf,
    pub summary_json: PathBuf,
    pub summary_md: PathBuf,
}

fn matching_ranks(
    hits: &[RankedHit],
    gold: &[GoldSpan],
    depth: usize,
    matcher: impl Fn(&RankedHit, &GoldSpan) -> bool,
) -> Vec<usize> {
    hits.iter()
        .take(depth)
        .filter(|hit| gold.iter().any(|g| matcher(hit, g)))
        .map(|hit| hit.rank)
        .collect()
}

fn top_hit_ids(hits: &[RankedHit], limit: usize) -> Vec<TopHitId> {
    hits.iter()
        .take(limit)
        .map(|h| TopHitId {
            rank: h.rank,
            doc_id: h.doc_id.clone(),
            pages: format!("p{}-p{}", h.start_page, h.end_page),
            chunk_id: h.chunk_id.clone(),
        })
        .collect()
}

fn hit_rate_at_k(rank_lists: &[Vec<usize>], k: usize) -> Option<f64> {
    if rank_lists.is_empty() {
        return None;
    }
    let hits = rank_lists
        .iter()
        .filter(|ranks| ranks.iter().any(|&r| r <= k))
        .count();
    Some(hits as f64 / rank_lists.len() as f64)
}

fn fmt_metric(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{v:.4}"),
        None => "n/a".to_string(),
    }
}

fn build_summary_markdown(summary: &Summary) -> String {
    let retrieval = &summary.retrieval;
    let mut lines = vec![
        "# Evaluation Summary".to_string(),
        String::new(),
        format!("- dataset: {}", summary.dataset_path),
        format!("- total_questions: {}", summary.counts.total_questions),
        format!("- answerable_questions: {}", summary.counts.answerable_questions),
        format!("- unanswerable_questions: {}", summary.counts.unanswerable_questions),
        String::new(),
        "## Retrieval".to_string(),
        format!("- scoring_scope: {}", retrieval.scoring_scope),
        format!("- primary_k: {}", retrieval.primary_k),
        format!("- Recall@k: {}", fmt_metric(retrieval.recall_at_k)),
        format!("- MRR@k: {}", fmt_metric(retrieval.mrr_at_k)),
        format!("- nDCG@k: {}", fmt_metric(retrieval.ndcg_at_k)),
        String::new(),
        "### Retrieval By K".to_string(),
    ];

    for k in &retrieval.metric_ks {
        if let Some(row) = retrieval.at_k.get(&format!("k{k}")) {
            lines.push(format!(
                "- k{k}: recall={}, mrr={}, ndcg={}",
                fmt_metric(row.recall),
                fmt_metric(row.mrr),
                fmt_metric(row.ndcg),
            ));
        }
    }

    lines.extend([
        String::new(),
        "### Secondary Diagnostics".to_string(),
        format!(
            "- near_page_tolerance: {}",
            retrieval.secondary_diagnostics.near_page_tolerance
        ),
    ]);
    for k in &retrieval.metric_ks {
        if let Some(diag) = retrieval.secondary_diagnostics.hit_rate_at_k.get(&format!("k{k}")) {
            lines.push(format!(
                "- k{k}: strict={}, doc_only={}, near_page={}",
                fmt_metric(diag.strict_page_overlap),
                fmt_metric(diag.doc_only),
                fmt_metric(diag.near_page_tolerance),
            ));
        }
    }

    lines.extend([
        String::new(),
        "### Questions Missing Gold In Top-k".to_string(),
        format!("- count: {}", retrieval.n_questions_without_gold_in_primary_k),
    ]);
    if retrieval.questions_without_gold_in_primary_k.is_empty() {
        lines.push("- none".to_string());
    } else {
        for row in &retrieval.questions_without_gold_in_primary_k {
            lines.push(format!("- {}: {}", row.qid, row.question));
        }
    }

    lines.extend([
        String::new(),
        "## Answer".to_string(),
        format!("- enabled: {}", summary.answer.enabled),
        format!("- answer_evaluated: {}", summary.counts.answer_evaluated_questions),
        format!(
            "- citation_presence_rate: {}",
            fmt_metric(summary.answer.citation_presence_rate)
        ),
        format!(
            "- inline_citation_sentence_rate: {}",
            fmt_metric(summary.answer.inline_citation_sentence_rate)
        ),
        format!("- refusal_accuracy: {}", fmt_metric(summary.answer.refusal_accuracy)),
    ]);

    lines.join("\n") + "\n"
}

fn write_jsonl<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::File::create(path)?;
    for row in rows {
        let line = serde_json::to_string(row)?;
        writeln!(file, "{line}")?;
    }
    Ok(())
}

/// Run the evaluation and write `per_question.jsonl`, `summary.json`, and
/// `summary.md` into the output directory.
pub async fn run_eval(
    retriever: &Retriever,
    retrieval_opts: &RetrievalOptions,
    answer_config: &AnswerConfig,
    generator: Option<&dyn Generator>,
    opts: &EvalOptions,
) -> Result<EvalArtifacts> {
    let metric_ks = opts.metric_ks()?;
    let retrieval_depth = opts.primary_k.max(*metric_ks.last().expect("non-empty ks"));
    let primary_k = if metric_ks.contains(&opts.primary_k) {
        opts.primary_k
    } else {
        *metric_ks.last().expect("non-empty ks")
    };

    let questions = load_questions(&opts.dataset, !opts.allow_unlabeled)?;

    let depth_opts = RetrievalOptions {
        k: retrieval_depth,
        ..retrieval_opts.clone()
    };

    let mut per_question: Vec<PerQuestionRow> = Vec::new();
    let mut rows_by_k: BTreeMap<usize, Vec<RetrievalMetrics>> =
        metric_ks.iter().map(|&k| (k, Vec::new())).collect();
    let mut eval_qids: Vec<String> = Vec::new();
    let mut skipped_unanswerable: Vec<String> = Vec::new();
    let mut skipped_unlabeled: Vec<String> = Vec::new();
    let mut strict_rank_lists: Vec<Vec<usize>> = Vec::new();
    let mut doc_only_rank_lists: Vec<Vec<usize>> = Vec::new();
    let mut near_page_rank_lists: Vec<Vec<usize>> = Vec::new();
    let mut with_gold_qids: Vec<String> = Vec::new();
    let mut without_gold: Vec<MissedQuestion> = Vec::new();
    let mut answer_rows: Vec<AnswerMetrics> = Vec::new();
    let mut answer_errors = 0usize;

    for row in &questions {
        let hits = retriever.retrieve_for_eval(&row.question, &depth_opts).await?;
        let top = top_hit_ids(&hits, 10.min(retrieval_depth));

        let labeled = row.answerable && !row.gold.is_empty();
        let mut metrics_by_k: Option<BTreeMap<String, RetrievalMetrics>> = None;
        let mut gold_hit_ranks: Vec<usize> = Vec::new();
        let mut doc_hit_ranks: Vec<usize> = Vec::new();
        let mut near_page_hit_ranks: Vec<usize> = Vec::new();
        let mut has_gold_in_primary_k: Option<bool> = None;

        if labeled {
            let mut by_k = BTreeMap::new();
            for &k in &metric_ks {
                let metrics = compute_retrieval_metrics(&hits, &row.gold, k);
                rows_by_k.get_mut(&k).expect("known k").push(metrics);
                by_k.insert(format!("k{k}"), metrics);
            }
            metrics_by_k = Some(by_k);
            eval_qids.push(row.qid.clone());

            gold_hit_ranks = matching_ranks(&hits, &row.gold, retrieval_depth, hit_matches_gold);
            doc_hit_ranks =
                matching_ranks(&hits, &row.gold, retrieval_depth, hit_matches_gold_doc_only);
            near_page_hit_ranks = matching_ranks(&hits, &row.gold, retrieval_depth, |h, g| {
                hit_matches_gold_with_tolerance(h, g, opts.near_page_tolerance)
            });
            strict_rank_lists.push(gold_hit_ranks.clone());
            doc_only_rank_lists.push(doc_hit_ranks.clone());
            near_page_rank_lists.push(near_page_hit_ranks.clone());

            let found = gold_hit_ranks.iter().any(|&r| r <= primary_k);
            has_gold_in_primary_k = Some(found);
            if found {
                with_gold_qids.push(row.qid.clone());
            } else {
                without_gold.push(MissedQuestion {
                    qid: row.qid.clone(),
                    question: row.question.clone(),
                    gold: row.gold.clone(),
                    gold_hit_ranks: gold_hit_ranks.clone(),
                    top_hit_ids: top_hit_ids(&hits, 10.min(retrieval_depth)),
                });
            }
        } else if !row.answerable {
            skipped_unanswerable.push(row.qid.clone());
        } else {
            skipped_unlabeled.push(row.qid.clone());
        }

        let answer = if opts.with_answers {
            Some(self::answer_section(
                row,
                retriever,
                retrieval_opts,
                answer_config,
                generator,
                &mut answer_rows,
                &mut answer_errors,
            )
            .await)
        } else {
            None
        };

        per_question.push(PerQuestionRow {
            qid: row.qid.clone(),
            question: row.question.clone(),
            answerable: row.answerable,
            gold: row.gold.clone(),
            retrieval: PerQuestionRetrieval {
                metrics: metrics_by_k,
                gold_hit_ranks,
                doc_hit_ranks,
                near_page_hit_ranks,
                has_gold_in_primary_k,
                top_hit_ids: top,
                hits,
            },
            answer,
        });
    }

    let mut at_k = BTreeMap::new();
    for &k in &metric_ks {
        let rows_k = &rows_by_k[&k];
        at_k.insert(
            format!("k{k}"),
            AtK {
                recall: safe_mean(rows_k.iter().map(|m| m.recall)),
                mrr: safe_mean(rows_k.iter().map(|m| m.mrr)),
                ndcg: safe_mean(rows_k.iter().map(|m| m.ndcg)),
            },
        );
    }
    let primary = at_k.get(&format!("k{primary_k}"));
    let (recall_at_k, mrr_at_k, ndcg_at_k) = match primary {
        Some(m) => (m.recall, m.mrr, m.ndcg),
        None => (None, None, None),
    };

    let mut hit_rate_by_k = BTreeMap::new();
    for &k in &metric_ks {
        hit_rate_by_k.insert(
            format!("k{k}"),
            HitRates {
                strict_page_overlap: hit_rate_at_k(&strict_rank_lists, k),
                doc_only: hit_rate_at_k(&doc_only_rank_lists, k),
                near_page_tolerance: hit_rate_at_k(&near_page_rank_lists, k),
            },
        );
    }

    without_gold.sort_by_key(|r| qid_sort_key(&r.qid));
    with_gold_qids.sort_by_key(|q| qid_sort_key(q));
    per_question.sort_by_key(|r| qid_sort_key(&r.qid));

    let labeled_answerable = questions.iter().filter(|q| q.answerable && !q.gold.is_empty()).count();
    let unlabeled_answerable = questions.iter().filter(|q| q.answerable && q.gold.is_empty()).count();

    let summary = Summary {
        dataset_path: opts.dataset.display().to_string(),
        run_config: RunConfig {
            mode: match retrieval_opts.mode {
                Mode::Base => "base".to_string(),
                Mode::Hybrid => "hybrid".to_string(),
            },
            backend: match retrieval_opts.backend {
                crate::retrieval::fusion::Backend::Faiss => "faiss".to_string(),
                crate::retrieval::fusion::Backend::Bm25 => "bm25".to_string(),
            },
            k: opts.primary_k,
            ks: metric_ks.clone(),
            retrieval_depth,
            near_page_tolerance: opts.near_page_tolerance,
            k0: retrieval_opts.k0,
            candidate_multiplier: retrieval_opts.candidate_multiplier,
            fusion: retrieval_opts.query_fusion,
            rerank: retrieval_opts.enable_rerank,
            rerank_pool: retrieval_opts.rerank_pool,
            with_answers: opts.with_answers,
            allow_unlabeled: opts.allow_unlabeled,
        },
        counts: Counts {
            total_questions: questions.len(),
            answerable_questions: questions.iter().filter(|q| q.answerable).count(),
            unanswerable_questions: questions.iter().filter(|q| !q.answerable).count(),
            labeled_answerable_questions: labeled_answerable,
            unlabeled_answerable_questions: unlabeled_answerable,
            retrieval_evaluated_questions: eval_qids.len(),
            answer_evaluated_questions: answer_rows.len(),
            answer_errors,
        },
        retrieval: RetrievalSummary {
            scoring_scope: "answerable_with_non_empty_gold_only".to_string(),
            metric_ks: metric_ks.clone(),
            primary_k,
            n_questions: eval_qids.len(),
            skipped_unanswerable_qids: skipped_unanswerable,
            skipped_unlabeled_answerable_qids: skipped_unlabeled,
            at_k,
            recall_at_k,
            mrr_at_k,
            ndcg_at_k,
            n_questions_with_gold_in_primary_k: with_gold_qids.len(),
            n_questions_without_gold_in_primary_k: without_gold.len(),
            questions_with_gold_in_primary_k_qids: with_gold_qids,
            questions_without_gold_in_primary_k: without_gold,
            secondary_diagnostics: SecondaryDiagnostics {
                near_page_tolerance: opts.near_page_tolerance,
                hit_rate_at_k: hit_rate_by_k,
            },
        },
        answer: AnswerSummary {
            enabled: opts.with_answers,
            citation_presence_rate: safe_mean(
                answer_rows
                    .iter()
                    .map(|m| if m.citation_presence_ok { 1.0 } else { 0.0 }),
            ),
            inline_citation_sentence_rate: safe_mean(
                answer_rows
                    .iter()
                    .filter_map(|m| m.inline_citation_sentence_rate),
            ),
            refusal_accuracy: safe_mean(answer_rows.iter().map(|m| m.refusal_accuracy)),
            answer_errors,
        },
    };

    fs::create_dir_all(&opts.outdir)?;
    let artifacts = EvalArtifacts {
        per_question: opts.outdir.join("per_question.jsonl"),
        summary_json: opts.outdir.join("summary.json"),
        summary_md: opts.outdir.join("summary.md"),
    };

    write_jsonl(&artifacts.per_question, &per_question)?;
    fs::write(
        &artifacts.summary_json,
        serde_json::to_string_pretty(&summary)?,
    )?;
    fs::write(&artifacts.summary_md, build_summary_markdown(&summary))?;

    tracing::info!(
        per_question = %artifacts.per_question.display(),
        summary = %artifacts.summary_json.display(),
        "evaluation artifacts written"
    );
    Ok(artifacts)
}

async fn answer_section(
    row: &QuestionRow,
    retriever: &Retriever,
    retrieval_opts: &RetrievalOptions,
    answer_config: &AnswerConfig,
    generator: Option<&dyn Generator>,
    answer_rows: &mut Vec<AnswerMetrics>,
    answer_errors: &mut usize,
) -> PerQuestionAnswer {
    let Some(generator) = generator else {
        *answer_errors += 1;
        return PerQuestionAnswer {
            metrics: None,
            payload: None,
            error: Some("no generator configured for --with-answers".to_string()),
        };
    };

    let outcome = async {
        let hits = retriever.retrieve(&row.question, retrieval_opts).await?;
        build_cited_answer(
            &row.question,
            &hits,
            Some(retriever.store()),
            generator,
            answer_config,
        )
        .await
    }
    .await;

    match outcome {
        Ok(result) => {
            let metrics = evaluate_answer(&result, row.answerable);
            answer_rows.push(metrics.clone());
            PerQuestionAnswer {
                metrics: Some(metrics),
                payload: Some(result),
                error: None,
            }
        }
        Err(e) => {
            *answer_errors += 1;
            PerQuestionAnswer {
                metrics: None,
                payload: None,
                error: Some(e.to_string()),
            }
        }
    }
}
