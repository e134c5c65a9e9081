//! Final text materialization.
//!
//! Collapses a merged token history into output ids and hands them to a
//! tokenizer. Pure functions of the current history; calling them again
//! after more merges simply reflects the longer history.

use crate::streaming::frame::TokenId;
use crate::streaming::model::DecodingKind;
use tracing::trace;

/// SentencePiece word-boundary marker.
const WORD_BOUNDARY: char = '\u{2581}';

/// Converts token ids to text.
pub trait Tokenizer: Send {
    fn ids_to_text(&self, ids: &[TokenId]) -> String;
}

impl<F> Tokenizer for F
where
    F: Fn(&[TokenId]) -> String + Send,
{
    fn ids_to_text(&self, ids: &[TokenId]) -> String {
        self(ids)
    }
}

/// Table-based tokenizer over a SentencePiece-style vocabulary.
#[derive(Debug, Clone, Default)]
pub struct Vocabulary {
    pieces: Vec<String>,
}

impl Vocabulary {
    pub fn new(pieces: Vec<String>) -> Self {
        Self { pieces }
    }

    /// One piece per line; the line number is the token id.
    pub fn from_lines(text: &str) -> Self {
        Self::new(text.lines().map(str::to_string).collect())
    }

    pub fn piece(&self, id: TokenId) -> Option<&str> {
        self.pieces.get(id as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }
}

impl Tokenizer for Vocabulary {
    fn ids_to_text(&self, ids: &[TokenId]) -> String {
        let mut text = String::new();
        for &id in ids {
            match self.piece(id) {
                Some(piece) => text.push_str(piece),
                None => trace!(id, "Token id outside vocabulary"),
            }
        }
        text.replace(WORD_BOUNDARY, " ").trim().to_string()
    }
}

/// Greedy CTC collapse.
///
/// A token is kept if it differs from the previous token or the previous
/// token was blank; blanks are never kept.
pub fn greedy_collapse(tokens: &[TokenId], blank_id: TokenId) -> Vec<TokenId> {
    let mut collapsed = Vec::new();
    let mut previous = blank_id;
    for &token in tokens {
        if (token != previous || previous == blank_id) && token != blank_id {
            collapsed.push(token);
        }
        previous = token;
    }
    collapsed
}

/// Turns a stream's merged history into output ids and text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranscriptAssembler {
    blank_id: TokenId,
    decoding: DecodingKind,
}

impl TranscriptAssembler {
    pub fn new(blank_id: TokenId, decoding: DecodingKind) -> Self {
        Self { blank_id, decoding }
    }

    /// Output ids for a history.
    ///
    /// Frame-level (CTC) histories are greedily collapsed; transducer
    /// histories only lose their blanks, since consecutive repeats there are
    /// real tokens.
    pub fn token_ids(&self, history: &[TokenId]) -> Vec<TokenId> {
        match self.decoding {
            DecodingKind::Ctc => greedy_collapse(history, self.blank_id),
            DecodingKind::Transducer => history
                .iter()
                .copied()
                .filter(|&token| token != self.blank_id)
                .collect(),
        }
    }

    pub fn text(&self, history: &[TokenId], tokenizer: &dyn Tokenizer) -> String {
        tokenizer.ids_to_text(&self.token_ids(history))
    }
}
