//! Segment chunking
//!
//! Forms ordered segments of bounded length from normalized text:
//! - Paragraphs split on blank lines, sentences on terminal punctuation
//! - Sentences packed greedily up to a target length
//! - Overlong sentences split on clause boundaries, then words
//! - Trailing undersized segments merged into their predecessor

/// Sentence-ending punctuation characters
const SENTENCE_ENDINGS: &[char] = &['.', '!', '?', '\u{2026}'];

/// Clause-separating punctuation (for fallback splitting)
const CLAUSE_SEPARATORS: &[char] = &[',', ';', ':'];

/// Chunking limits
#[derive(Debug, Clone, Copy)]
pub struct ChunkOptions {
    /// Preferred segment length in chars
    pub target_chars: usize,
    /// Hard bound on segment length (single unbreakable words excepted)
    pub max_chars: usize,
    /// Segments below this merge into the previous one
    pub min_chars: usize,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            target_chars: 300,
            max_chars: 500,
            min_chars: 60,
        }
    }
}

/// Chunk normalized text into ordered segments
pub fn chunk_text(text: &str, options: &ChunkOptions) -> Vec<String> {
    let mut segments = Vec::new();
    for paragraph in text.split("\n\n") {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }
        segments.extend(chunk_paragraph(paragraph, options));
    }
    merge_small_segments(segments, options.min_chars)
}

fn chunk_paragraph(paragraph: &str, options: &ChunkOptions) -> Vec<String> {
    let mut sentences = Vec::new();
    for sentence in split_sentences(paragraph) {
        if char_len(&sentence) > options.max_chars {
            sentences.extend(split_long_sentence(&sentence, options.max_chars));
        } else {
            sentences.push(sentence);
        }
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    for sentence in sentences {
        if current.is_empty() {
            current = sentence;
            continue;
        }
        let candidate_len = char_len(&current) + 1 + char_len(&sentence);
        if candidate_len <= options.target_chars {
            current.push(' ');
            current.push_str(&sentence);
        } else if candidate_len <= options.max_chars && char_len(&current) < options.target_chars {
            // The target is soft: take one more sentence while the hard
            // bound still holds and the chunk has not reached the target.
            current.push(' ');
            current.push_str(&sentence);
        } else {
            chunks.push(std::mem::replace(&mut current, sentence));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Split a paragraph into sentences, keeping terminal punctuation attached
pub fn split_sentences(paragraph: &str) -> Vec<String> {
    let chars: Vec<char> = paragraph.chars().collect();
    let mut sentences = Vec::new();
    let mut current = String::new();

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        current.push(c);
        if SENTENCE_ENDINGS.contains(&c) {
            // Swallow any punctuation run ("...", "?!") before deciding
            while i + 1 < chars.len() && SENTENCE_ENDINGS.contains(&chars[i + 1]) {
                i += 1;
                current.push(chars[i]);
            }
            // Also keep a closing quote with its sentence
            if i + 1 < chars.len() && (chars[i + 1] == '"' || chars[i + 1] == '\'') {
                i += 1;
                current.push(chars[i]);
            }
            let boundary = i + 1 >= chars.len() || chars[i + 1].is_whitespace();
            if boundary {
                let trimmed = current.trim();
                if !trimmed.is_empty() {
                    sentences.push(trimmed.to_string());
                }
                current.clear();
            }
        }
        i += 1;
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
    sentences
}

/// Split an overlong sentence on clause boundaries, then on words.
///
/// Clause splits are skipped inside quoted or parenthesized spans when a
/// split outside them is available.
fn split_long_sentence(sentence: &str, max_chars: usize) -> Vec<String> {
    let clauses = split_clauses(sentence);
    let mut parts = Vec::new();
    let mut current = String::new();
    for clause in clauses {
        let clause_len = char_len(&clause);
        if clause_len > max_chars {
            if !current.is_empty() {
                parts.push(std::mem::take(&mut current));
            }
            parts.extend(split_words(&clause, max_chars));
            continue;
        }
        if current.is_empty() {
            current = clause;
        } else if char_len(&current) + 1 + clause_len <= max_chars {
            current.push(' ');
            current.push_str(&clause);
        } else {
            parts.push(std::mem::replace(&mut current, clause));
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

/// Split on clause separators at quote/paren depth zero, separator attached
fn split_clauses(sentence: &str) -> Vec<String> {
    let mut clauses = Vec::new();
    let mut current = String::new();
    let mut paren_depth = 0i32;
    let mut in_quotes = false;

    for c in sentence.chars() {
        current.push(c);
        match c {
            '(' | '[' => paren_depth += 1,
            ')' | ']' => paren_depth = (paren_depth - 1).max(0),
            '"' => in_quotes = !in_quotes,
            _ => {}
        }
        if CLAUSE_SEPARATORS.contains(&c) && paren_depth == 0 && !in_quotes {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                clauses.push(trimmed.to_string());
            }
            current.clear();
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        clauses.push(trimmed.to_string());
    }

    // No usable boundary outside quotes: fall back to splitting anywhere
    if clauses.len() <= 1 && sentence.chars().any(|c| CLAUSE_SEPARATORS.contains(&c)) {
        return split_clauses_any(sentence);
    }
    clauses
}

fn split_clauses_any(sentence: &str) -> Vec<String> {
    let mut clauses = Vec::new();
    let mut current = String::new();
    for c in sentence.chars() {
        current.push(c);
        if CLAUSE_SEPARATORS.contains(&c) {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                clauses.push(trimmed.to_string());
            }
            current.clear();
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        clauses.push(trimmed.to_string());
    }
    clauses
}

/// Last-resort split on word boundaries
fn split_words(text: &str, max_chars: usize) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0usize;
    for word in text.split_whitespace() {
        let word_chars = char_len(word);
        let sep = usize::from(!current.is_empty());
        if current_chars + sep + word_chars <= max_chars {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
            current_chars += sep + word_chars;
        } else {
            if !current.is_empty() {
                parts.push(std::mem::take(&mut current));
                current_chars = 0;
            }
            // A single word over the bound is emitted whole
            current.push_str(word);
            current_chars = word_chars;
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

/// Merge undersized segments into their predecessor (or successor for the
/// first segment).
///
/// A forward merge can itself produce an undersized segment ("A." + "B." is
/// still short), so the pass runs twice; the second pass folds those
/// leftovers into their neighbors.
fn merge_small_segments(segments: Vec<String>, min_chars: usize) -> Vec<String> {
    if min_chars == 0 || segments.len() <= 1 {
        return segments;
    }
    let merged = merge_small_pass(segments, min_chars);
    if merged.len() <= 1 {
        return merged;
    }
    merge_small_pass(merged, min_chars)
}

fn merge_small_pass(segments: Vec<String>, min_chars: usize) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(segments.len());
    let mut iter = segments.into_iter().peekable();
    while let Some(segment) = iter.next() {
        if char_len(&segment) >= min_chars {
            merged.push(segment);
            continue;
        }
        if let Some(prev) = merged.last_mut() {
            prev.push(' ');
            prev.push_str(&segment);
        } else if let Some(next) = iter.next() {
            merged.push(format!("{} {}", segment, next));
        } else {
            merged.push(segment);
        }
    }
    merged
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(target: usize, max: usize, min: usize) -> ChunkOptions {
        ChunkOptions {
            target_chars: target,
            max_chars: max,
            min_chars: min,
        }
    }

    #[test]
    fn test_single_sentence_single_segment() {
        let segments = chunk_text("Gojo meets Sukuna.", &options(300, 500, 0));
        assert_eq!(segments, vec!["Gojo meets Sukuna.".to_string()]);
    }

    #[test]
    fn test_sentences_pack_to_target() {
        let text = "One sentence here. Another sentence there. And a third one.";
        let segments = chunk_text(text, &options(300, 500, 0));
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0], text);
    }

    #[test]
    fn test_split_on_target_boundary() {
        let text = "Aaaa bbbb cccc dddd. Eeee ffff gggg hhhh. Iiii jjjj kkkk llll.";
        let segments = chunk_text(text, &options(25, 30, 0));
        assert!(segments.len() >= 2);
        for segment in &segments {
            assert!(segment.chars().count() <= 30, "segment too long: {}", segment);
        }
    }

    #[test]
    fn test_terminal_punctuation_preserved() {
        let segments = chunk_text("Really? Yes! Fine.", &options(8, 10, 0));
        assert!(segments.iter().any(|s| s.contains('?')));
        assert!(segments.iter().any(|s| s.contains('!')));
        let rejoined = segments.join(" ");
        assert_eq!(rejoined, "Really? Yes! Fine.");
    }

    #[test]
    fn test_overlong_sentence_splits_on_clauses() {
        let sentence = "First clause goes here, second clause follows it, and the third clause closes.";
        let segments = chunk_text(sentence, &options(30, 40, 0));
        assert!(segments.len() > 1);
        let rejoined = segments.join(" ");
        assert_eq!(rejoined, sentence);
    }

    #[test]
    fn test_overlong_sentence_without_clauses_splits_on_words() {
        let sentence = "word ".repeat(40).trim().to_string() + ".";
        let segments = chunk_text(&sentence, &options(50, 60, 0));
        assert!(segments.len() > 1);
        for segment in &segments {
            assert!(segment.chars().count() <= 60);
        }
        // Concatenation equals the input modulo whitespace policy
        assert_eq!(segments.join(" "), sentence);
    }

    #[test]
    fn test_clause_split_avoids_quotes() {
        let sentence = "He said \"wait, stop\" and then carried on walking, until nightfall came.";
        let clauses = split_clauses(sentence);
        // The comma inside the quotes must not produce the first boundary
        assert_eq!(clauses[0], "He said \"wait, stop\" and then carried on walking,");
    }

    #[test]
    fn test_paragraph_boundaries_respected() {
        let text = "Short one.\n\nShort two.";
        let segments = chunk_text(text, &options(300, 500, 0));
        assert_eq!(segments.len(), 2);
    }

    #[test]
    fn test_min_segment_merging() {
        let text = "A long enough opening sentence that easily clears the minimum bar set here.\n\nTiny.";
        let segments = chunk_text(text, &options(300, 500, 20));
        assert_eq!(segments.len(), 1);
        assert!(segments[0].ends_with("Tiny."));
    }

    #[test]
    fn test_first_segment_small_merges_forward() {
        let text = "Hi.\n\nA second paragraph that is comfortably longer than the minimum.";
        let segments = chunk_text(text, &options(300, 500, 10));
        assert_eq!(segments.len(), 1);
        assert!(segments[0].starts_with("Hi."));
    }

    #[test]
    fn test_cascading_undersized_segments_fold_into_neighbor() {
        // The forward merge of the two leading fragments is still short and
        // must fold into the long trailing segment on the second pass
        let long = "A closing paragraph that is comfortably longer than the sixty character minimum.";
        let text = format!("A.\n\nB.\n\n{}", long);
        let segments = chunk_text(&text, &options(300, 500, 60));
        assert_eq!(segments.len(), 1);
        assert!(segments[0].starts_with("A. B."));
        assert!(segments[0].ends_with("minimum."));
    }

    #[test]
    fn test_whitespace_paragraph_dropped() {
        let segments = chunk_text("One.\n\n   \n\nTwo.", &options(300, 500, 0));
        assert_eq!(segments.len(), 2);
    }

    #[test]
    fn test_empty_text() {
        assert!(chunk_text("", &ChunkOptions::default()).is_empty());
    }

    #[test]
    fn test_repeated_short_sentences_hit_many_segments() {
        // 200 repetitions of "A. " chunk into many segments when packing is tight
        let text = "A. ".repeat(200);
        let segments = chunk_text(text.trim(), &options(2, 2, 0));
        assert!(segments.len() > 120);
    }
}
