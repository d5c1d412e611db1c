use crate::batch::{BatchEvaluator, FailurePolicy, RetryPolicy};
use crate::cache::EvaluationCache;
use crate::config::{Config, RunConfig};
use crate::corpus::Corpus;
use crate::history::RunHistory;
use crate::judge::{Judge, build_judge};
use crate::ledger::CostLedger;
use crate::models::EvaluatedRow;
use crate::output::{BufferedSink, TsvFileSink, write_table};
use anyhow::{Context, Result, anyhow};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{error, info, warn};

/// Everything a finished run produced
#[derive(Debug)]
pub struct RunReport {
    pub rows: Vec<EvaluatedRow>,
    pub ledger: CostLedger,
}

/// Orchestrates one batch: history, corpus, judge, output
pub struct Runner {
    config: Config,
    /// Receives the table when no output path is configured
    table_out: Mutex<Box<dyn Write + Send>>,
}

impl Runner {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            table_out: Mutex::new(Box::new(std::io::stdout())),
        }
    }

    pub fn with_table_output(mut self, out: Box<dyn Write + Send>) -> Self {
        self.table_out = Mutex::new(out);
        self
    }

    /// Run the batch against the configured judge backend
    pub async fn run(&self) -> Result<RunReport> {
        let judge = build_judge(&self.config.settings.judge, &self.config.api_key)
            .context("Failed to set up the judge")?;
        self.run_with_judge(judge).await
    }

    pub async fn run_with_judge(&self, judge: Box<dyn Judge>) -> Result<RunReport> {
        let run = &self.config.settings.run;

        let cache = self.load_cache()?;
        let corpus = Corpus::from_path(&run.corpus)
            .with_context(|| format!("Failed to load corpus: {}", run.corpus.display()))?;
        info!(rows = corpus.rows.len(), path = %run.corpus.display(), "loaded corpus");

        let mut evaluator = BatchEvaluator::new(judge, cache)
            .with_retry_policy(retry_policy(run))
            .with_failure_policy(if run.keep_going {
                FailurePolicy::KeepGoing
            } else {
                FailurePolicy::Abort
            })
            .with_passage_fingerprints(run.fingerprint_passages);

        let (outcome, printed) = match &run.output {
            Some(path) => {
                let mut sink = TsvFileSink::new(path, corpus.headers.clone());
                let outcome = evaluator.run(&corpus.rows, run.completions, &mut sink).await;
                (outcome, Ok(()))
            }
            None => {
                let mut sink = BufferedSink::default();
                let outcome = evaluator.run(&corpus.rows, run.completions, &mut sink).await;
                // Rows finished before an abort are printed too
                (outcome, self.print_table(&corpus.headers, sink.rows()))
            }
        };

        // Paid results are persisted even when the batch stopped early
        let stored = self.store_history_if_configured(evaluator.cache());
        let rows = match outcome {
            Ok(rows) => rows,
            Err(batch_error) => {
                if let Err(store_error) = stored {
                    error!(error = %format!("{:#}", store_error), "history could not be saved");
                }
                if let Err(print_error) = printed {
                    error!(error = %format!("{:#}", print_error), "finished rows could not be printed");
                }
                return Err(batch_error).context("Batch evaluation stopped");
            }
        };
        stored?;
        printed?;

        let ledger = CostLedger::from_rows(&rows);
        info!(
            total_cost = ledger.total_cost,
            total_saved = ledger.total_saved,
            "batch complete"
        );

        Ok(RunReport { rows, ledger })
    }

    fn print_table(&self, headers: &[String], rows: &[EvaluatedRow]) -> Result<()> {
        let mut out = self
            .table_out
            .lock()
            .map_err(|_| anyhow!("table output is poisoned"))?;
        write_table(&mut *out, headers, rows).context("Failed to write results to stdout")?;
        out.flush().context("Failed to write results to stdout")
    }

    /// Cache seeded from the history file, or empty for a run-local cache
    fn load_cache(&self) -> Result<EvaluationCache> {
        let run = &self.config.settings.run;
        let Some(path) = run.history.as_deref().filter(|_| !run.no_cache) else {
            return Ok(EvaluationCache::new());
        };

        let Some(history) = RunHistory::load(path)? else {
            info!(path = %path.display(), "no history yet, starting with an empty cache");
            return Ok(EvaluationCache::new());
        };

        let current = &self.config.settings.judge.model;
        if &history.settings.judge.model != current {
            warn!(
                recorded = %history.settings.judge.model,
                current = %current,
                "history was recorded with a different judge model"
            );
        }

        let cache = history.into_cache();
        info!(entries = cache.len(), path = %path.display(), "restored evaluation cache");
        Ok(cache)
    }

    fn store_history_if_configured(&self, cache: &EvaluationCache) -> Result<()> {
        let run = &self.config.settings.run;
        if run.no_cache {
            return Ok(());
        }
        if let Some(path) = &run.history {
            self.store_history(cache, path)?;
        }
        Ok(())
    }

    fn store_history(&self, cache: &EvaluationCache, path: &Path) -> Result<()> {
        RunHistory::new(self.config.settings.clone(), cache)
            .save(path)
            .with_context(|| format!("Failed to store history to: {}", path.display()))?;
        info!(entries = cache.len(), path = %path.display(), "history stored");
        Ok(())
    }
}

fn retry_policy(run: &RunConfig) -> RetryPolicy {
    RetryPolicy {
        single_sample_delay: Duration::from_secs(run.retry_delay_secs),
        multi_sample_delay: Duration::from_secs(run.multi_sample_retry_delay_secs),
    }
}
