use crate::aggregate::aggregate;
use crate::cache::EvaluationCache;
use crate::error::{BatchError, JudgeError};
use crate::judge::Judge;
use crate::models::{CorpusRow, DocumentKey, EvaluatedRow, EvaluationResult, Outcome, Verdict};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long to wait before the single retry of a failed judge call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub single_sample_delay: Duration,
    pub multi_sample_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            single_sample_delay: Duration::from_secs(30),
            multi_sample_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, sample_count: u32) -> Duration {
        if sample_count > 1 {
            self.multi_sample_delay
        } else {
            self.single_sample_delay
        }
    }
}

/// What to do with a row whose retry also failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Stop the batch and surface the error
    #[default]
    Abort,
    /// Record the row as failed and move on
    KeepGoing,
}

/// Receives the whole evaluated prefix after every row
pub trait ProgressSink {
    fn on_progress(&mut self, rows: &[EvaluatedRow]) -> anyhow::Result<()>;
}

impl<F> ProgressSink for F
where
    F: FnMut(&[EvaluatedRow]) -> anyhow::Result<()>,
{
    fn on_progress(&mut self, rows: &[EvaluatedRow]) -> anyhow::Result<()> {
        self(rows)
    }
}

/// Judges corpus rows one at a time, in input order, through the cache
pub struct BatchEvaluator {
    judge: Box<dyn Judge>,
    cache: EvaluationCache,
    retry: RetryPolicy,
    failure_policy: FailurePolicy,
    fingerprint_passages: bool,
}

impl BatchEvaluator {
    pub fn new(judge: Box<dyn Judge>, cache: EvaluationCache) -> Self {
        Self {
            judge,
            cache,
            retry: RetryPolicy::default(),
            failure_policy: FailurePolicy::default(),
            fingerprint_passages: false,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    pub fn with_passage_fingerprints(mut self, enabled: bool) -> Self {
        self.fingerprint_passages = enabled;
        self
    }

    pub fn cache(&self) -> &EvaluationCache {
        &self.cache
    }

    pub fn into_cache(self) -> EvaluationCache {
        self.cache
    }

    pub fn document_key(&self, row: &CorpusRow) -> DocumentKey {
        if self.fingerprint_passages {
            DocumentKey::with_fingerprint(&row.query, &row.passage_id, &row.passage)
        } else {
            DocumentKey::new(&row.query, &row.passage_id)
        }
    }

    /// Evaluate every row in order. The sink is called after each row with
    /// everything evaluated so far. On abort the cache keeps every result
    /// obtained before the failing row.
    pub async fn run(
        &mut self,
        rows: &[CorpusRow],
        sample_count: u32,
        sink: &mut dyn ProgressSink,
    ) -> Result<Vec<EvaluatedRow>, BatchError> {
        let total = rows.len();
        let mut evaluated = Vec::with_capacity(total);
        info!(
            total,
            sample_count,
            model = self.judge.model_name(),
            cached = self.cache.len(),
            "starting batch"
        );

        for (index, row) in rows.iter().enumerate() {
            let position = index + 1;
            let key = self.document_key(row);

            let outcome = match self.cache.lookup(&key) {
                Some(cached) => {
                    debug!(row = position, key = %key, "cache hit");
                    Outcome::Cached(cached.as_cache_hit())
                }
                None => match self.judge_with_retry(row, sample_count, position).await {
                    Ok(result) => {
                        self.cache.insert(key.clone(), result.clone())?;
                        Outcome::Judged(result)
                    }
                    Err(source) => match self.failure_policy {
                        FailurePolicy::Abort => {
                            return Err(BatchError::Judge {
                                row: position,
                                key: key.to_string(),
                                source,
                            });
                        }
                        FailurePolicy::KeepGoing => {
                            warn!(row = position, key = %key, error = %source, "giving up on row");
                            Outcome::Failed(source.to_string())
                        }
                    },
                },
            };

            log_row(position, total, &outcome);
            evaluated.push(EvaluatedRow {
                row: row.clone(),
                outcome,
            });
            sink.on_progress(&evaluated).map_err(BatchError::Sink)?;
        }

        Ok(evaluated)
    }

    async fn judge_with_retry(
        &self,
        row: &CorpusRow,
        sample_count: u32,
        position: usize,
    ) -> Result<EvaluationResult, JudgeError> {
        match self.judge_once(row, sample_count).await {
            Ok(result) => Ok(result),
            Err(first) => {
                let delay = self.retry.delay_for(sample_count);
                warn!(
                    row = position,
                    error = %first,
                    delay_secs = delay.as_secs_f64(),
                    "judge call failed, retrying once"
                );
                tokio::time::sleep(delay).await;
                self.judge_once(row, sample_count).await
            }
        }
    }

    async fn judge_once(
        &self,
        row: &CorpusRow,
        sample_count: u32,
    ) -> Result<EvaluationResult, JudgeError> {
        let mut result = self
            .judge
            .evaluate(&row.query, &row.passage, sample_count)
            .await?;

        if let Verdict::Multi { samples, score } = &mut result.verdict {
            *score = aggregate(samples);
            if score.is_none() {
                warn!(samples = samples.len(), "no sample carried a score");
            }
        }

        Ok(result)
    }
}

fn log_row(position: usize, total: usize, outcome: &Outcome) {
    match outcome {
        Outcome::Judged(result) => info!(
            row = position,
            total,
            score = ?result.score(),
            cost = result.cost,
            "judged"
        ),
        Outcome::Cached(result) => info!(
            row = position,
            total,
            score = ?result.score(),
            saved_cost = result.saved_cost,
            "reused cached result"
        ),
        Outcome::Failed(_) => info!(row = position, total, "failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Sample, TokenUsage};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn single(score: i64, cost: f64) -> EvaluationResult {
        EvaluationResult {
            verdict: Verdict::Single {
                score: Some(score),
                reasoning: Some("fine".to_string()),
            },
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
            cost,
            duration: 0.1,
            saved_cost: 0.0,
        }
    }

    /// Replays scripted replies, then answers score 2 at cost 0.01
    struct MockJudge {
        calls: Arc<AtomicUsize>,
        script: Mutex<VecDeque<Result<EvaluationResult, JudgeError>>>,
    }

    impl MockJudge {
        fn new(calls: Arc<AtomicUsize>) -> Self {
            Self {
                calls,
                script: Mutex::new(VecDeque::new()),
            }
        }

        fn then(self, reply: Result<EvaluationResult, JudgeError>) -> Self {
            self.script.lock().unwrap().push_back(reply);
            self
        }
    }

    #[async_trait]
    impl Judge for MockJudge {
        async fn evaluate(
            &self,
            _query: &str,
            _passage: &str,
            _sample_count: u32,
        ) -> Result<EvaluationResult, JudgeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let scripted = self.script.lock().unwrap().pop_front();
            scripted.unwrap_or_else(|| Ok(single(2, 0.01)))
        }

        fn model_name(&self) -> &str {
            "mock"
        }
    }

    fn row(query: &str, passage_id: &str, passage: &str) -> CorpusRow {
        CorpusRow {
            query: query.to_string(),
            passage: passage.to_string(),
            passage_id: passage_id.to_string(),
            columns: vec![query.to_string(), passage.to_string(), passage_id.to_string()],
        }
    }

    fn rows() -> Vec<CorpusRow> {
        vec![
            row("q1", "p1", "first"),
            row("q1", "p2", "second"),
            row("q2", "p1", "third"),
        ]
    }

    fn no_wait() -> RetryPolicy {
        RetryPolicy {
            single_sample_delay: Duration::ZERO,
            multi_sample_delay: Duration::ZERO,
        }
    }

    fn evaluator(judge: MockJudge, cache: EvaluationCache) -> BatchEvaluator {
        BatchEvaluator::new(Box::new(judge), cache).with_retry_policy(no_wait())
    }

    fn ignore(_: &[EvaluatedRow]) -> anyhow::Result<()> {
        Ok(())
    }

    #[test]
    fn test_retry_delay_depends_on_sample_count() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for(5), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_rows_keep_input_order_and_sink_sees_prefixes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let judge = MockJudge::new(calls.clone())
            .then(Ok(single(3, 0.01)))
            .then(Ok(single(0, 0.01)))
            .then(Ok(single(1, 0.01)));
        let mut batch = evaluator(judge, EvaluationCache::new());

        let mut seen = Vec::new();
        let mut sink = |rows: &[EvaluatedRow]| -> anyhow::Result<()> {
            seen.push(rows.len());
            Ok(())
        };
        let evaluated = batch.run(&rows(), 1, &mut sink).await.unwrap();

        assert_eq!(seen, vec![1, 2, 3]);
        let scores: Vec<_> = evaluated
            .iter()
            .map(|r| r.result().unwrap().score())
            .collect();
        assert_eq!(scores, vec![Some(3), Some(0), Some(1)]);
        assert_eq!(evaluated[1].row.passage_id, "p2");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(batch.cache().len(), 3);
    }

    #[tokio::test]
    async fn test_second_run_is_served_from_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut first = evaluator(MockJudge::new(calls.clone()), EvaluationCache::new());
        first.run(&rows(), 1, &mut ignore).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let mut second = evaluator(MockJudge::new(calls.clone()), first.into_cache());
        let evaluated = second.run(&rows(), 1, &mut ignore).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        for row in &evaluated {
            match &row.outcome {
                Outcome::Cached(result) => {
                    assert_eq!(result.cost, 0.0);
                    assert_eq!(result.saved_cost, 0.01);
                }
                other => panic!("expected cache hit, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_repeated_key_in_one_batch_is_judged_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut batch = evaluator(MockJudge::new(calls.clone()), EvaluationCache::new());
        let corpus = vec![row("q", "p1", "text"), row("q", "p1", "text")];

        let evaluated = batch.run(&corpus, 1, &mut ignore).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(evaluated[0].outcome, Outcome::Judged(_)));
        assert!(matches!(evaluated[1].outcome, Outcome::Cached(_)));

        let paid = evaluated[0].result().unwrap();
        let reused = evaluated[1].result().unwrap();
        assert_eq!(paid.cost, 0.01);
        assert_eq!(paid.saved_cost, 0.0);
        assert_eq!(reused.cost, 0.0);
        assert_eq!(reused.saved_cost, paid.cost);
    }

    #[tokio::test]
    async fn test_rate_limited_row_makes_exactly_two_requests() {
        use crate::config::Backend;
        use crate::judge::build_judge;
        use crate::judge::test_support::judge_config;

        let mut server = mockito::Server::new_async().await;
        let limited = server
            .mock("POST", "/chat/completions")
            .with_status(429)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"error": {"message": "Rate limit reached", "type": "requests", "param": null, "code": "rate_limit_exceeded"}}"#,
            )
            .expect(2)
            .create_async()
            .await;

        let judge = build_judge(&judge_config(Backend::Chat, &server.url()), "sk-test").unwrap();
        let mut batch = BatchEvaluator::new(judge, EvaluationCache::new()).with_retry_policy(no_wait());

        let err = tokio::time::timeout(
            Duration::from_secs(10),
            batch.run(&[row("q", "p1", "text")], 1, &mut ignore),
        )
        .await
        .expect("judge kept retrying the rate limit")
        .unwrap_err();

        assert!(matches!(err, BatchError::Judge { row: 1, .. }));
        assert_eq!(batch.cache().len(), 0);
        limited.assert_async().await;
    }

    #[tokio::test]
    async fn test_fingerprints_separate_edited_passages() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut batch = evaluator(MockJudge::new(calls.clone()), EvaluationCache::new())
            .with_passage_fingerprints(true);
        let corpus = vec![row("q", "p1", "old text"), row("q", "p1", "new text")];

        batch.run(&corpus, 1, &mut ignore).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_single_failure_is_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let judge = MockJudge::new(calls.clone())
            .then(Err(JudgeError::MissingUsage))
            .then(Ok(single(1, 0.02)));
        let mut batch = evaluator(judge, EvaluationCache::new());

        let evaluated = batch.run(&rows()[..1], 1, &mut ignore).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(evaluated[0].result().unwrap().score(), Some(1));
    }

    #[tokio::test]
    async fn test_second_failure_aborts_after_flushing_prefix() {
        let calls = Arc::new(AtomicUsize::new(0));
        let judge = MockJudge::new(calls.clone())
            .then(Ok(single(3, 0.01)))
            .then(Err(JudgeError::MissingUsage))
            .then(Err(JudgeError::MissingUsage));
        let mut batch = evaluator(judge, EvaluationCache::new());

        let mut flushed = 0;
        let mut sink = |rows: &[EvaluatedRow]| -> anyhow::Result<()> {
            flushed = rows.len();
            Ok(())
        };
        let err = batch.run(&rows(), 1, &mut sink).await.unwrap_err();

        match err {
            BatchError::Judge { row, key, source } => {
                assert_eq!(row, 2);
                assert_eq!(key, "q1_p2");
                assert!(matches!(source, JudgeError::MissingUsage));
            }
            other => panic!("expected judge error, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(flushed, 1);
        assert_eq!(batch.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_keep_going_records_failure_without_caching() {
        let calls = Arc::new(AtomicUsize::new(0));
        let judge = MockJudge::new(calls.clone())
            .then(Err(JudgeError::MissingUsage))
            .then(Err(JudgeError::MissingUsage));
        let mut batch =
            evaluator(judge, EvaluationCache::new()).with_failure_policy(FailurePolicy::KeepGoing);

        let evaluated = batch.run(&rows(), 1, &mut ignore).await.unwrap();

        assert_eq!(evaluated.len(), 3);
        assert!(matches!(evaluated[0].outcome, Outcome::Failed(_)));
        assert!(evaluated[1].result().is_some());
        assert!(batch.cache().lookup(&DocumentKey::new("q1", "p1")).is_none());
        assert_eq!(batch.cache().len(), 2);
    }

    #[tokio::test]
    async fn test_multi_sample_verdict_is_aggregated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let samples = [Some(1), Some(2), None, Some(2)]
            .into_iter()
            .map(|score| Sample {
                score,
                reasoning: None,
            })
            .collect();
        let multi = EvaluationResult {
            verdict: Verdict::Multi {
                samples,
                score: None,
            },
            ..single(0, 0.05)
        };
        let mut batch = evaluator(MockJudge::new(calls).then(Ok(multi)), EvaluationCache::new());

        let evaluated = batch.run(&rows()[..1], 4, &mut ignore).await.unwrap();

        assert_eq!(evaluated[0].result().unwrap().score(), Some(2));
        let cached = batch.cache().lookup(&DocumentKey::new("q1", "p1")).unwrap();
        assert_eq!(cached.score(), Some(2));
    }

    #[tokio::test]
    async fn test_sink_failure_stops_batch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut batch = evaluator(MockJudge::new(calls.clone()), EvaluationCache::new());
        let mut sink = |_: &[EvaluatedRow]| -> anyhow::Result<()> { anyhow::bail!("disk full") };

        let err = batch.run(&rows(), 1, &mut sink).await.unwrap_err();

        assert!(matches!(err, BatchError::Sink(_)));
        assert!(err.to_string().contains("disk full"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
