use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SessionError;
use crate::types::ThresholdBinaryMarket;

/// Turns a filtered candidate list into the ids the operator wants watched.
/// Called once per discovery pass; the session validates every returned id
/// against the catalog before subscribing.
#[async_trait]
pub trait SelectionProvider: Send + Sync {
    async fn select(&self, candidates: &[ThresholdBinaryMarket]) -> anyhow::Result<Vec<String>>;
}

/// Fixed id list, typically from `SELECT_IDS`.
pub struct ScriptedSelection {
    ids: Vec<String>,
}

impl ScriptedSelection {
    pub fn new(ids: Vec<String>) -> Self {
        Self { ids }
    }
}

#[async_trait]
impl SelectionProvider for ScriptedSelection {
    async fn select(&self, _candidates: &[ThresholdBinaryMarket]) -> anyhow::Result<Vec<String>> {
        Ok(self.ids.clone())
    }
}

type LineReader = Arc<dyn Fn() -> std::io::Result<Option<String>> + Send + Sync>;

/// Prints the candidates and reads answer lines until one parses. A token
/// that names no candidate re-prompts instead of ending the session; end of
/// input or too many bad answers selects nothing.
pub struct PromptSelection {
    read_line: LineReader,
    max_attempts: usize,
}

impl PromptSelection {
    const MAX_ATTEMPTS: usize = 3;

    pub fn stdin() -> Self {
        Self {
            read_line: Arc::new(|| {
                let mut buf = String::new();
                let n = std::io::stdin().read_line(&mut buf)?;
                Ok((n > 0).then_some(buf))
            }),
            max_attempts: Self::MAX_ATTEMPTS,
        }
    }

    #[cfg(test)]
    fn from_lines(lines: &[&str]) -> Self {
        let lines = std::sync::Mutex::new(lines.iter().map(|l| l.to_string()).collect::<std::collections::VecDeque<_>>());
        Self {
            read_line: Arc::new(move || Ok(lines.lock().unwrap().pop_front())),
            max_attempts: Self::MAX_ATTEMPTS,
        }
    }

    pub fn render(candidates: &[ThresholdBinaryMarket]) -> String {
        let mut out = String::new();
        for (i, m) in candidates.iter().enumerate() {
            out.push_str(&format!(
                "{:>3}. [{}] {}  ({} {} {} by {})\n",
                i + 1,
                m.id(),
                m.title(),
                m.underlying(),
                m.direction().as_str(),
                m.strike(),
                m.expiry()
            ));
        }
        out
    }
}

#[async_trait]
impl SelectionProvider for PromptSelection {
    async fn select(&self, candidates: &[ThresholdBinaryMarket]) -> anyhow::Result<Vec<String>> {
        if candidates.is_empty() {
            return Ok(vec![]);
        }
        print!("{}", Self::render(candidates));

        for attempt in 1..=self.max_attempts {
            println!("Pick markets (numbers or ids, comma separated, or 'all'):");
            let read_line = self.read_line.clone();
            let Some(line) = tokio::task::spawn_blocking(move || read_line()).await?? else {
                tracing::warn!("selection input closed");
                return Ok(vec![]);
            };
            match parse_selection(&line, candidates) {
                Ok(ids) => return Ok(ids),
                Err(e) => {
                    println!("{e}, try again");
                    tracing::warn!(error = %e, attempt, "selection rejected");
                }
            }
        }

        tracing::warn!(attempts = self.max_attempts, "no valid selection entered");
        Ok(vec![])
    }
}

/// Accepts 1-based indices into `candidates`, market ids, or `all`.
/// An exact id match wins over an index. Repeats are dropped, first order kept.
pub fn parse_selection(input: &str, candidates: &[ThresholdBinaryMarket]) -> Result<Vec<String>, SessionError> {
    let tokens: Vec<&str> = input
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .collect();

    if tokens.iter().any(|t| t.eq_ignore_ascii_case("all")) {
        return Ok(candidates.iter().map(|m| m.id().to_string()).collect());
    }

    let mut out: Vec<String> = Vec::with_capacity(tokens.len());
    for t in tokens {
        let id = if let Some(m) = candidates.iter().find(|m| m.id() == t) {
            m.id()
        } else {
            match t.parse::<usize>() {
                Ok(i) if (1..=candidates.len()).contains(&i) => candidates[i - 1].id(),
                _ => return Err(SessionError::UnknownMarket(t.to_string())),
            }
        };
        if !out.iter().any(|x| x == id) {
            out.push(id.to_string());
        }
    }
    Ok(out)
}
