//! Boundary-aware document chunking.
//!
//! Splitting prefers natural boundaries: paragraphs first, then sentences,
//! then words, and only degenerates to raw character windows for pathological
//! unbroken runs. No chunk exceeds the configured character budget.

use unicode_segmentation::UnicodeSegmentation;
use url::Url;

use crate::types::{Chunk, Document};

/// Splits a document into chunks no larger than `max_chars`.
///
/// Chunk indices are strictly increasing in document position and ids are
/// deterministic, so re-chunking an unchanged document yields identical
/// output.
pub fn split_document(document: &Document, max_chars: usize) -> Vec<Chunk> {
    let max_chars = max_chars.max(1);
    let mut pieces: Vec<String> = Vec::new();
    let mut current = String::new();

    for paragraph in document.content.split("\n\n") {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }

        if paragraph.len() > max_chars {
            flush(&mut pieces, &mut current);
            split_oversized(paragraph, max_chars, &mut pieces);
            continue;
        }

        // +2 accounts for the paragraph separator that gets re-inserted.
        if !current.is_empty() && current.len() + paragraph.len() + 2 > max_chars {
            flush(&mut pieces, &mut current);
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
    }
    flush(&mut pieces, &mut current);

    pieces
        .into_iter()
        .enumerate()
        .map(|(index, content)| Chunk::new(&document.source, index, content))
        .collect()
}

fn flush(pieces: &mut Vec<String>, current: &mut String) {
    if !current.is_empty() {
        pieces.push(std::mem::take(current));
    }
}

/// Splits a single paragraph that exceeds the budget, preferring sentence
/// boundaries, then word boundaries.
fn split_oversized(paragraph: &str, max_chars: usize, pieces: &mut Vec<String>) {
    let mut current = String::new();
    for sentence in paragraph.unicode_sentences() {
        if sentence.len() > max_chars {
            flush(pieces, &mut current);
            split_by_words(sentence, max_chars, pieces);
            continue;
        }
        if !current.is_empty() && current.len() + sentence.len() > max_chars {
            flush(pieces, &mut current);
        }
        current.push_str(sentence);
    }
    flush(pieces, &mut current);
}

fn split_by_words(sentence: &str, max_chars: usize, pieces: &mut Vec<String>) {
    let mut current = String::new();
    for word in sentence.split_word_bounds() {
        if word.len() > max_chars {
            flush(pieces, &mut current);
            // Unbroken run longer than the budget: hard character windows.
            let chars: Vec<char> = word.chars().collect();
            for window in chars.chunks(max_chars) {
                pieces.push(window.iter().collect());
            }
            continue;
        }
        if !current.is_empty() && current.len() + word.len() > max_chars {
            flush(pieces, &mut current);
        }
        current.push_str(word);
    }
    flush(pieces, &mut current);
}

/// Convenience for callers that already hold raw text rather than a document.
pub fn split_text(source: &Url, text: &str, max_chars: usize) -> Vec<Chunk> {
    split_document(&Document::new(source.clone(), text), max_chars)
}
