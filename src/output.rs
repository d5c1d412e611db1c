use crate::batch::ProgressSink;
use crate::ledger::CostLedger;
use crate::models::{EvaluatedRow, Outcome, Verdict};
use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Columns appended after the input columns, in order
const RESULT_COLUMNS: &[&str] = &[
    "score",
    "reasoning",
    "samples",
    "usage.prompt_tokens",
    "usage.completion_tokens",
    "usage.total_tokens",
    "cost",
    "saved_cost",
    "duration",
];

/// Only present when at least one row failed
const ERROR_COLUMN: &str = "error";

/// Summary format options
#[derive(Debug, Clone, Copy, ValueEnum, Serialize, Deserialize)]
pub enum OutputFormat {
    Plain,
    Json,
}

/// Write the evaluated rows as one tab-separated table
pub fn write_table<W: Write>(writer: W, headers: &[String], rows: &[EvaluatedRow]) -> Result<()> {
    let with_errors = rows
        .iter()
        .any(|row| matches!(row.outcome, Outcome::Failed(_)));

    let mut table = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(writer);

    let mut header: Vec<&str> = headers.iter().map(String::as_str).collect();
    header.extend_from_slice(RESULT_COLUMNS);
    if with_errors {
        header.push(ERROR_COLUMN);
    }
    table.write_record(&header)?;

    for row in rows {
        let mut record = row.row.columns.clone();
        record.extend(result_cells(row)?);
        if with_errors {
            record.push(match &row.outcome {
                Outcome::Failed(reason) => reason.clone(),
                _ => String::new(),
            });
        }
        table.write_record(&record)?;
    }

    table.flush()?;
    Ok(())
}

fn result_cells(row: &EvaluatedRow) -> Result<Vec<String>> {
    let Some(result) = row.result() else {
        return Ok(vec![String::new(); RESULT_COLUMNS.len()]);
    };

    let (reasoning, samples) = match &result.verdict {
        Verdict::Single { reasoning, .. } => (reasoning.clone().unwrap_or_default(), String::new()),
        Verdict::Multi { samples, .. } => (
            String::new(),
            serde_json::to_string(samples).context("Failed to serialize samples")?,
        ),
    };

    Ok(vec![
        result.score().map(|score| score.to_string()).unwrap_or_default(),
        reasoning,
        samples,
        result.usage.prompt_tokens.to_string(),
        result.usage.completion_tokens.to_string(),
        result.usage.total_tokens.to_string(),
        result.cost.to_string(),
        result.saved_cost.to_string(),
        result.duration.to_string(),
    ])
}

/// Replace `path` with `contents` through a temporary file in the same directory
pub fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;

    let mut file = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temporary file in: {}", dir.display()))?;
    file.write_all(contents)
        .with_context(|| format!("Failed to write temporary file for: {}", path.display()))?;
    file.persist(path)
        .with_context(|| format!("Failed to replace: {}", path.display()))?;

    Ok(())
}

/// Rewrites the whole output table after every row
pub struct TsvFileSink {
    path: PathBuf,
    headers: Vec<String>,
}

impl TsvFileSink {
    pub fn new(path: impl Into<PathBuf>, headers: Vec<String>) -> Self {
        Self {
            path: path.into(),
            headers,
        }
    }
}

impl ProgressSink for TsvFileSink {
    fn on_progress(&mut self, rows: &[EvaluatedRow]) -> Result<()> {
        let mut buffer: Vec<u8> = Vec::new();
        write_table(&mut buffer, &self.headers, rows)?;
        write_atomically(&self.path, &buffer)
    }
}

/// Keeps the evaluated prefix for a table printed once the batch is over,
/// including a batch that stopped early
#[derive(Debug, Default)]
pub struct BufferedSink {
    rows: Vec<EvaluatedRow>,
}

impl BufferedSink {
    pub fn rows(&self) -> &[EvaluatedRow] {
        &self.rows
    }
}

impl ProgressSink for BufferedSink {
    fn on_progress(&mut self, rows: &[EvaluatedRow]) -> Result<()> {
        // The prefix only grows, so only the new rows are copied
        let new_rows = rows.get(self.rows.len()..).unwrap_or_default();
        self.rows.extend_from_slice(new_rows);
        Ok(())
    }
}

/// Print the run totals in the specified format
pub fn print_summary(ledger: &CostLedger, format: OutputFormat, out: &mut dyn Write) -> Result<()> {
    match format {
        OutputFormat::Plain => print_plain(ledger, out),
        OutputFormat::Json => print_json(ledger, out),
    }
}

fn print_plain(ledger: &CostLedger, out: &mut dyn Write) -> Result<()> {
    writeln!(
        out,
        "Rows: {} (judged {}, cached {}, failed {})",
        ledger.rows, ledger.judged, ledger.cache_hits, ledger.failed
    )?;
    writeln!(out, "Total cost: ${:.4}", ledger.total_cost)?;
    writeln!(out, "Saved cost: ${:.4}", ledger.total_saved)?;
    Ok(())
}

fn print_json(ledger: &CostLedger, out: &mut dyn Write) -> Result<()> {
    let json = serde_json::to_string_pretty(ledger).context("Failed to serialize summary to JSON")?;
    writeln!(out, "{}", json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CorpusRow, EvaluationResult, Sample, TokenUsage};
    use tempfile::tempdir;

    fn headers() -> Vec<String> {
        vec!["query".to_string(), "passage".to_string(), "passage_id".to_string()]
    }

    fn corpus_row(query: &str, passage: &str, passage_id: &str) -> CorpusRow {
        CorpusRow {
            query: query.to_string(),
            passage: passage.to_string(),
            passage_id: passage_id.to_string(),
            columns: vec![query.to_string(), passage.to_string(), passage_id.to_string()],
        }
    }

    fn judged(verdict: Verdict) -> Outcome {
        Outcome::Judged(EvaluationResult {
            verdict,
            usage: TokenUsage {
                prompt_tokens: 100,
                completion_tokens: 10,
                total_tokens: 110,
            },
            cost: 0.25,
            duration: 1.5,
            saved_cost: 0.0,
        })
    }

    fn table(rows: &[EvaluatedRow]) -> String {
        let mut buffer: Vec<u8> = Vec::new();
        write_table(&mut buffer, &headers(), rows).unwrap();
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn test_single_sample_row() {
        let rows = vec![EvaluatedRow {
            row: corpus_row("capital?", "Paris.", "p1"),
            outcome: judged(Verdict::Single {
                score: Some(3),
                reasoning: Some("Direct answer.".to_string()),
            }),
        }];

        let text = table(&rows);
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(
            lines[0],
            "query\tpassage\tpassage_id\tscore\treasoning\tsamples\tusage.prompt_tokens\t\
             usage.completion_tokens\tusage.total_tokens\tcost\tsaved_cost\tduration"
        );
        assert_eq!(
            lines[1],
            "capital?\tParis.\tp1\t3\tDirect answer.\t\t100\t10\t110\t0.25\t0\t1.5"
        );
    }

    #[test]
    fn test_multi_sample_row_lists_samples() {
        let rows = vec![EvaluatedRow {
            row: corpus_row("q", "p", "id"),
            outcome: judged(Verdict::Multi {
                samples: vec![
                    Sample {
                        score: Some(1),
                        reasoning: Some("meh".to_string()),
                    },
                    Sample::unparsed(),
                ],
                score: Some(1),
            }),
        }];

        let text = table(&rows);
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .from_reader(text.as_bytes());
        let record = reader.records().next().unwrap().unwrap();

        assert_eq!(&record[3], "1");
        assert_eq!(&record[4], "");
        let samples: Vec<Sample> = serde_json::from_str(&record[5]).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1], Sample::unparsed());
    }

    #[test]
    fn test_error_column_only_with_failures() {
        let ok = EvaluatedRow {
            row: corpus_row("q", "p", "id"),
            outcome: judged(Verdict::Single {
                score: Some(2),
                reasoning: None,
            }),
        };
        assert!(!table(&[ok.clone()]).lines().next().unwrap().ends_with("error"));

        let failed = EvaluatedRow {
            row: corpus_row("q2", "p2", "id2"),
            outcome: Outcome::Failed("rate limited".to_string()),
        };
        let text = table(&[ok, failed]);
        let lines: Vec<&str> = text.lines().collect();

        assert!(lines[0].ends_with("\terror"));
        assert!(lines[1].ends_with("\t1.5\t"));
        assert_eq!(lines[2], "q2\tp2\tid2\t\t\t\t\t\t\t\t\t\trate limited");
    }

    #[test]
    fn test_buffered_sink_keeps_latest_prefix() {
        let first = EvaluatedRow {
            row: corpus_row("q1", "p", "a"),
            outcome: judged(Verdict::Single {
                score: Some(1),
                reasoning: None,
            }),
        };
        let second = EvaluatedRow {
            row: corpus_row("q2", "p", "b"),
            ..first.clone()
        };
        let mut sink = BufferedSink::default();

        sink.on_progress(&[first.clone()]).unwrap();
        sink.on_progress(&[first.clone(), second.clone()]).unwrap();

        assert_eq!(sink.rows(), &[first, second][..]);
    }

    #[test]
    fn test_file_sink_rewrites_whole_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("judged.tsv");
        let mut sink = TsvFileSink::new(&path, headers());

        let first = EvaluatedRow {
            row: corpus_row("q1", "p", "a"),
            outcome: judged(Verdict::Single {
                score: Some(1),
                reasoning: None,
            }),
        };
        let second = EvaluatedRow {
            row: corpus_row("q2", "p", "b"),
            ..first.clone()
        };

        sink.on_progress(&[first.clone()]).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);

        sink.on_progress(&[first, second]).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 3);
        assert!(content.lines().nth(2).unwrap().starts_with("q2\t"));
    }

    #[test]
    fn test_plain_summary() {
        let ledger = CostLedger {
            rows: 3,
            judged: 2,
            cache_hits: 1,
            failed: 0,
            total_cost: 0.12,
            total_saved: 0.06,
        };
        let mut out: Vec<u8> = Vec::new();
        print_summary(&ledger, OutputFormat::Plain, &mut out).unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Rows: 3 (judged 2, cached 1, failed 0)\nTotal cost: $0.1200\nSaved cost: $0.0600\n"
        );
    }

    #[test]
    fn test_json_summary() {
        let ledger = CostLedger {
            rows: 1,
            judged: 1,
            total_cost: 0.5,
            ..Default::default()
        };
        let mut out: Vec<u8> = Vec::new();
        print_summary(&ledger, OutputFormat::Json, &mut out).unwrap();

        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["total_cost"], 0.5);
        assert_eq!(value["total_saved"], 0.0);
        assert_eq!(value["cache_hits"], 0);
    }
}
