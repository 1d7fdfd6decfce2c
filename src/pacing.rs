//! Typing-effect pacing for document writes
//!
//! A run of text is cut into increments at natural boundaries (a fixed
//! number of characters, a few words, or one line) and written with a short
//! pause in between. The pause is cosmetic and always cancellable.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{RelayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingPolicy {
    /// Write each run in one piece
    Off,
    /// `chunk` characters per increment
    Chars { chunk: usize, delay: Duration },
    /// `per_chunk` words per increment (trailing whitespace included)
    Words { per_chunk: usize, delay: Duration },
    /// One line per increment
    Lines { delay: Duration },
}

impl Default for PacingPolicy {
    fn default() -> Self {
        PacingPolicy::Chars {
            chunk: 50,
            delay: Duration::from_millis(50),
        }
    }
}

impl PacingPolicy {
    pub fn delay(&self) -> Duration {
        match self {
            PacingPolicy::Off => Duration::ZERO,
            PacingPolicy::Chars { delay, .. }
            | PacingPolicy::Words { delay, .. }
            | PacingPolicy::Lines { delay } => *delay,
        }
    }

    /// Cut `text` into increments. Concatenating the pieces gives `text` back.
    pub fn split(&self, text: &str) -> Vec<String> {
        if text.is_empty() {
            return Vec::new();
        }
        match *self {
            PacingPolicy::Off => vec![text.to_string()],
            PacingPolicy::Chars { chunk, .. } => split_chars(text, chunk.max(1)),
            PacingPolicy::Words { per_chunk, .. } => split_words(text, per_chunk.max(1)),
            PacingPolicy::Lines { .. } => text.split_inclusive('\n').map(str::to_string).collect(),
        }
    }
}

fn split_chars(text: &str, chunk: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(chunk).map(|c| c.iter().collect()).collect()
}

fn split_words(text: &str, per_chunk: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut words = 0;
    let mut prev_space = true;

    for (i, c) in text.char_indices() {
        let space = c.is_whitespace();
        if prev_space && !space {
            if words == per_chunk {
                pieces.push(text[start..i].to_string());
                start = i;
                words = 0;
            }
            words += 1;
        }
        prev_space = space;
    }
    pieces.push(text[start..].to_string());
    pieces
}

/// Write `text` through `write` one increment at a time.
///
/// Sleeps `policy.delay()` between increments (never after the last one).
/// Returns the number of characters written. A cancel during a pause stops
/// the write with [`RelayError::Cancelled`]; what was written stays written.
pub async fn paced_write<F>(
    policy: PacingPolicy,
    text: &str,
    cancel: &CancellationToken,
    mut write: F,
) -> Result<usize>
where
    F: FnMut(&str) -> Result<()>,
{
    let pieces = policy.split(text);
    let delay = policy.delay();
    let mut written = 0;

    for (i, piece) in pieces.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(RelayError::Cancelled);
        }
        write(piece)?;
        written += piece.chars().count();

        let last = i + 1 == pieces.len();
        if !last && !delay.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RelayError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn test_split_chars() {
        let policy = PacingPolicy::Chars { chunk: 3, delay: MS };
        assert_eq!(policy.split("abcdefg"), vec!["abc", "def", "g"]);
        assert_eq!(policy.split("héllo"), vec!["hél", "lo"]);
        assert!(policy.split("").is_empty());
    }

    #[test]
    fn test_split_words_keeps_whitespace() {
        let policy = PacingPolicy::Words {
            per_chunk: 2,
            delay: MS,
        };
        let text = "one two  three four\nfive";
        let pieces = policy.split(text);
        assert_eq!(pieces, vec!["one two  ", "three four\n", "five"]);
        assert_eq!(pieces.concat(), text);
    }

    #[test]
    fn test_split_words_leading_whitespace() {
        let policy = PacingPolicy::Words {
            per_chunk: 1,
            delay: MS,
        };
        assert_eq!(policy.split("  a b"), vec!["  a ", "b"]);
    }

    #[test]
    fn test_split_lines() {
        let policy = PacingPolicy::Lines { delay: MS };
        assert_eq!(policy.split("a\nb\nc"), vec!["a\n", "b\n", "c"]);
    }

    #[test]
    fn test_off_is_one_piece() {
        assert_eq!(PacingPolicy::Off.split("a b c"), vec!["a b c"]);
        assert_eq!(PacingPolicy::Off.delay(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_paced_write_in_order() {
        let policy = PacingPolicy::Chars { chunk: 2, delay: MS };
        let mut seen = Vec::new();
        let written = paced_write(policy, "abcde", &CancellationToken::new(), |piece| {
            seen.push(piece.to_string());
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(written, 5);
        assert_eq!(seen, vec!["ab", "cd", "e"]);
    }

    #[tokio::test]
    async fn test_cancel_stops_between_increments() {
        let policy = PacingPolicy::Chars {
            chunk: 1,
            delay: Duration::from_secs(30),
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let mut seen = Vec::new();

        let result = paced_write(policy, "abc", &cancel, |piece| {
            seen.push(piece.to_string());
            trigger.cancel();
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(RelayError::Cancelled)));
        assert_eq!(seen, vec!["a"]);
    }

    #[tokio::test]
    async fn test_write_error_propagates() {
        let result = paced_write(PacingPolicy::Off, "abc", &CancellationToken::new(), |_| {
            Err(RelayError::Sink("disk full".to_string()))
        })
        .await;
        assert!(matches!(result, Err(RelayError::Sink(_))));
    }
}
