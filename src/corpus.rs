use crate::error::CorpusError;
use crate::models::CorpusRow;
use std::io::Read;
use std::path::Path;

const QUERY_COLUMN: &str = "query";
const PASSAGE_COLUMN: &str = "passage";
const PASSAGE_ID_COLUMN: &str = "passage_id";

/// Query/passage pairs read from a tab-separated file with a header row
#[derive(Debug, Clone, PartialEq)]
pub struct Corpus {
    pub headers: Vec<String>,
    pub rows: Vec<CorpusRow>,
}

impl Corpus {
    pub fn from_path(path: &Path) -> Result<Self, CorpusError> {
        let reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .from_path(path)?;
        Self::read(reader)
    }

    pub fn from_reader<R: Read>(input: R) -> Result<Self, CorpusError> {
        let reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .from_reader(input);
        Self::read(reader)
    }

    /// Every row is checked before any is returned, so a malformed corpus
    /// fails before the first judge call
    fn read<R: Read>(mut reader: csv::Reader<R>) -> Result<Self, CorpusError> {
        let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();

        let column = |name: &'static str| {
            headers
                .iter()
                .position(|h| h == name)
                .ok_or(CorpusError::MissingColumn(name))
        };
        let query_at = column(QUERY_COLUMN)?;
        let passage_at = column(PASSAGE_COLUMN)?;
        let passage_id_at = column(PASSAGE_ID_COLUMN)?;

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| {
                let short_line = match e.kind() {
                    csv::ErrorKind::UnequalLengths { pos, .. } => {
                        Some(pos.as_ref().map(|p| p.line()).unwrap_or_default())
                    }
                    _ => None,
                };
                match short_line {
                    Some(line) => CorpusError::MalformedRow {
                        line,
                        reason: e.to_string(),
                    },
                    None => CorpusError::Csv(e),
                }
            })?;
            let line = record.position().map(|p| p.line()).unwrap_or_default();

            let cell = |at: usize| record.get(at).unwrap_or_default().to_string();
            let query = cell(query_at);
            let passage_id = cell(passage_id_at);

            if query.trim().is_empty() {
                return Err(CorpusError::MalformedRow {
                    line,
                    reason: "empty query".to_string(),
                });
            }
            if passage_id.trim().is_empty() {
                return Err(CorpusError::MalformedRow {
                    line,
                    reason: "empty passage_id".to_string(),
                });
            }

            rows.push(CorpusRow {
                query,
                passage: cell(passage_at),
                passage_id,
                columns: record.iter().map(str::to_string).collect(),
            });
        }

        Ok(Corpus { headers, rows })
    }
}
