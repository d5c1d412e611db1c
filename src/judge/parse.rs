use crate::error::ConfigError;
use crate::models::Sample;
use regex::Regex;
use tracing::warn;

/// Turns a raw judge reply into a scored sample using the configured pattern.
///
/// The pattern is matched at the start of the reply. Group 1 is the
/// reasoning, group 2 the numeric score.
#[derive(Debug, Clone)]
pub struct ResponseParser {
    regex: Regex,
}

impl ResponseParser {
    pub fn new(pattern: &str) -> Result<Self, ConfigError> {
        let regex = Regex::new(&format!("^(?:{})", pattern))?;

        let groups = regex.captures_len() - 1;
        if groups < 2 {
            return Err(ConfigError::RegexGroups(groups));
        }

        Ok(Self { regex })
    }

    /// Parse one reply. A reply that does not match yields an unscored sample.
    pub fn parse(&self, reply: &str) -> Sample {
        let Some(captures) = self.regex.captures(reply) else {
            warn!(reply = %reply, "judge reply did not match result pattern");
            return Sample::unparsed();
        };

        let reasoning = captures.get(1).map(|m| m.as_str().to_string());
        let score = captures
            .get(2)
            .and_then(|m| m.as_str().trim().parse::<f64>().ok())
            .filter(|value| value.is_finite())
            .map(|value| value.round() as i64);

        match (score, reasoning) {
            (Some(score), Some(reasoning)) => Sample {
                score: Some(score),
                reasoning: Some(reasoning),
            },
            _ => {
                warn!(reply = %reply, "judge reply matched but score or reasoning is unusable");
                Sample::unparsed()
            }
        }
    }
}
