use std::borrow::Cow;
use std::path::Path;

use thiserror::Error;
use tokenizers::Tokenizer;
use tracing::warn;
use unicode_normalization::UnicodeNormalization;

#[derive(Error, Debug)]
pub enum ShingleError {
    #[error("failed to load tokenizer model from {path}: {details}")]
    ModelLoad { path: String, details: String },
    #[error("tokenizer failed: {0}")]
    Tokenize(String),
}

/// NFC-normalizes, lowercases and collapses whitespace runs to single
/// spaces. Shingling always operates on the normalized form; document
/// lengths are taken from the raw text.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for ch in text.nfc() {
        if ch.is_whitespace() {
            if !out.is_empty() {
                pending_space = true;
            }
        } else {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
        }
    }
    out
}

/// Turns a document into word shingles: fixed windows of `size` consecutive
/// tokens joined by the delimiter.
///
/// The generic path slices the original string between delimiter positions,
/// so no per-token allocation happens and the delimiter bytes inside a
/// window are preserved verbatim. The tokenizer path (CJK data) runs the
/// text through a subword model and joins the produced pieces; any failure
/// there downgrades that one document to the generic path.
pub struct Shingler {
    size: usize,
    delimiter: String,
    tokenizer: Option<Tokenizer>,
}

impl Shingler {
    pub fn new(size: usize, delimiter: impl Into<String>) -> Self {
        Self {
            size,
            delimiter: delimiter.into(),
            tokenizer: None,
        }
    }

    /// Builds a shingler that tokenizes with a subword model loaded from
    /// `model_path`. The model is loaded once; workers construct their own
    /// shingler so the load happens once per worker.
    pub fn with_tokenizer(
        size: usize,
        delimiter: impl Into<String>,
        model_path: &Path,
    ) -> Result<Self, ShingleError> {
        let tokenizer = Tokenizer::from_file(model_path).map_err(|e| ShingleError::ModelLoad {
            path: model_path.display().to_string(),
            details: e.to_string(),
        })?;
        Ok(Self {
            size,
            delimiter: delimiter.into(),
            tokenizer: Some(tokenizer),
        })
    }

    /// Shingles one normalized document. Empty input produces an empty list;
    /// such documents are never compared against anything downstream.
    pub fn shingles<'a>(&self, text: &'a str) -> Vec<Cow<'a, str>> {
        if text.is_empty() {
            return Vec::new();
        }
        if let Some(tokenizer) = &self.tokenizer {
            match self.subword_shingles(tokenizer, text) {
                Ok(shingles) => return shingles,
                Err(e) => {
                    warn!(error = %e, "subword shingling failed, using delimiter shingles");
                }
            }
        }
        self.delimiter_shingles(text)
    }

    fn delimiter_shingles<'a>(&self, text: &'a str) -> Vec<Cow<'a, str>> {
        let dlen = self.delimiter.len();
        let separators: Vec<usize> = text
            .match_indices(self.delimiter.as_str())
            .map(|(i, _)| i)
            .collect();
        // Token count is separators + 1; short documents are one shingle.
        if separators.len() + 1 <= self.size {
            return vec![Cow::Borrowed(text)];
        }
        let windows = separators.len() + 2 - self.size;
        let mut out = Vec::with_capacity(windows);
        for i in 0..windows {
            let start = if i == 0 { 0 } else { separators[i - 1] + dlen };
            let end = separators
                .get(i + self.size - 1)
                .copied()
                .unwrap_or(text.len());
            out.push(Cow::Borrowed(&text[start..end]));
        }
        out
    }

    fn subword_shingles<'a>(
        &self,
        tokenizer: &Tokenizer,
        text: &str,
    ) -> Result<Vec<Cow<'a, str>>, ShingleError> {
        let encoding = tokenizer
            .encode(text, false)
            .map_err(|e| ShingleError::Tokenize(e.to_string()))?;
        let pieces = encoding.get_tokens();
        if pieces.is_empty() {
            return Ok(Vec::new());
        }
        let windows = pieces.len().saturating_sub(self.size - 1).max(1);
        let mut out = Vec::with_capacity(windows);
        for i in 0..windows {
            let end = (i + self.size).min(pieces.len());
            out.push(Cow::Owned(pieces[i..end].join(&self.delimiter)));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_lowercases_and_collapses_whitespace() {
        assert_eq!(normalize("  The\tQuick \n Brown  "), "the quick brown");
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("   \n "), "");
    }

    #[test]
    fn test_short_document_is_one_shingle() {
        let shingler = Shingler::new(5, " ");
        let shingles = shingler.shingles("only three tokens");
        assert_eq!(shingles, vec!["only three tokens"]);
    }

    #[test]
    fn test_window_count_and_content() {
        let shingler = Shingler::new(3, " ");
        let shingles = shingler.shingles("a b c d e");
        assert_eq!(shingles, vec!["a b c", "b c d", "c d e"]);
    }

    #[test]
    fn test_delimiter_preserved_inside_windows() {
        let shingler = Shingler::new(2, "--");
        let shingles = shingler.shingles("aa--bb--cc");
        assert_eq!(shingles, vec!["aa--bb", "bb--cc"]);
    }

    #[test]
    fn test_empty_input_yields_no_shingles() {
        let shingler = Shingler::new(3, " ");
        assert!(shingler.shingles("").is_empty());
    }

    #[test]
    fn test_exact_window_size_is_one_shingle() {
        let shingler = Shingler::new(3, " ");
        assert_eq!(shingler.shingles("x y z"), vec!["x y z"]);
    }
}
