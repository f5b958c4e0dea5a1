//! Text normalization
//!
//! Normalizes input text by handling:
//! - Unicode NFKC folding
//! - Smart quote / dash / ellipsis replacement
//! - Whitespace collapsing with paragraph breaks preserved
//! - Number and acronym rendering per reading profile

use unicode_normalization::UnicodeNormalization;

use super::profile::{AcronymMode, NumberMode, ReadingProfile};

/// Normalize text for chunking and display.
///
/// Case is preserved; paragraph breaks (blank lines) survive as a single
/// `\n\n` so the chunker can honor them.
pub fn normalize_text(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let folded = fold_punctuation(&text.nfkc().collect::<String>());

    let mut paragraphs = Vec::new();
    for paragraph in split_paragraph_blocks(&folded) {
        let collapsed = collapse_whitespace(&paragraph);
        if !collapsed.is_empty() {
            paragraphs.push(collapsed);
        }
    }
    paragraphs.join("\n\n")
}

/// Canonical form used inside cache keys: normalized, lowercased, and with
/// paragraph breaks collapsed to single spaces.
pub fn canonical_text(text: &str) -> String {
    let normalized = normalize_text(text);
    collapse_whitespace(&normalized).to_lowercase()
}

fn fold_punctuation(text: &str) -> String {
    text.replace('\u{2019}', "'")
        .replace('\u{2018}', "'")
        .replace('\u{201C}', "\"")
        .replace('\u{201D}', "\"")
        .replace('\u{2026}', "...")
        .replace('\u{2014}', " - ")
        .replace('\u{2013}', " - ")
}

fn split_paragraph_blocks(text: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current = String::new();
    let mut blank_run = 0usize;
    for line in text.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            continue;
        }
        if blank_run > 0 && !current.is_empty() {
            blocks.push(std::mem::take(&mut current));
        }
        blank_run = 0;
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

fn collapse_whitespace(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut prev_was_space = true;
    for c in text.chars() {
        if c.is_whitespace() {
            if !prev_was_space {
                result.push(' ');
                prev_was_space = true;
            }
        } else {
            result.push(c);
            prev_was_space = false;
        }
    }
    if result.ends_with(' ') {
        result.pop();
    }
    result
}

/// Apply profile-driven rewrites (acronym spell-out, number rendering)
/// before pronunciation resolution.
pub fn apply_reading_modes(text: &str, profile: &ReadingProfile) -> String {
    let mut result = text.to_string();
    if profile.acronym_mode == AcronymMode::Spell {
        result = spell_acronyms(&result);
    }
    render_numbers(&result, profile.number_mode)
}

/// Split uppercase runs of length >= 2 into spaced letters ("NASA" -> "N A S A")
fn spell_acronyms(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut result = String::with_capacity(text.len() * 2);
    let mut i = 0;
    while i < chars.len() {
        let start = i;
        while i < chars.len() && chars[i].is_ascii_uppercase() {
            i += 1;
        }
        let run = i - start;
        // A run followed by a lowercase letter is a capitalized word, not an
        // acronym ("NASAs" keeps its trailing s; "Gojo" is left alone).
        let word_cap = run >= 1 && i < chars.len() && chars[i].is_ascii_lowercase();
        if run >= 2 && !word_cap {
            for (j, c) in chars[start..i].iter().enumerate() {
                if j > 0 {
                    result.push(' ');
                }
                result.push(*c);
            }
        } else {
            for c in &chars[start..i] {
                result.push(*c);
            }
        }
        if i == start {
            result.push(chars[i]);
            i += 1;
        }
    }
    result
}

/// Convert digit runs to their spoken form
fn render_numbers(text: &str, mode: NumberMode) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut result = String::with_capacity(text.len() * 2);
    let mut i = 0;
    while i < chars.len() {
        if chars[i].is_ascii_digit() {
            let start = i;
            let mut num_str = String::new();
            let mut has_decimal = false;
            while i < chars.len() && (chars[i].is_ascii_digit() || (chars[i] == '.' && !has_decimal))
            {
                if chars[i] == '.' {
                    // Trailing period is sentence punctuation, not a decimal
                    if i + 1 >= chars.len() || !chars[i + 1].is_ascii_digit() {
                        break;
                    }
                    has_decimal = true;
                }
                num_str.push(chars[i]);
                i += 1;
            }
            match number_to_words(&num_str, mode) {
                Some(words) => result.push_str(&words),
                None => {
                    for c in &chars[start..i] {
                        result.push(*c);
                    }
                }
            }
        } else {
            result.push(chars[i]);
            i += 1;
        }
    }
    result
}

fn number_to_words(num_str: &str, mode: NumberMode) -> Option<String> {
    if num_str.contains('.') {
        let (int_part, dec_part) = num_str.split_once('.')?;
        let integer = integer_to_words(int_part.parse().ok()?)?;
        return Some(format!("{} point {}", integer, digits_to_words(dec_part)));
    }

    let num: i64 = num_str.parse().ok()?;
    match mode {
        NumberMode::Cardinal => integer_to_words(num),
        NumberMode::Ordinal => integer_to_words(num).map(|w| cardinal_to_ordinal(&w)),
        NumberMode::Year => {
            if num_str.len() == 4 && num >= 1000 {
                year_to_words(num)
            } else {
                integer_to_words(num)
            }
        }
    }
}

const ONES: [&str; 20] = [
    "", "one", "two", "three", "four", "five", "six", "seven", "eight", "nine", "ten", "eleven",
    "twelve", "thirteen", "fourteen", "fifteen", "sixteen", "seventeen", "eighteen", "nineteen",
];
const TENS: [&str; 10] = [
    "", "", "twenty", "thirty", "forty", "fifty", "sixty", "seventy", "eighty", "ninety",
];

fn integer_to_words(num: i64) -> Option<String> {
    if num == 0 {
        return Some("zero".to_string());
    }
    if num < 0 {
        return integer_to_words(-num).map(|w| format!("negative {}", w));
    }

    let mut n = num;
    let mut result = Vec::new();

    if n >= 1_000_000_000 {
        result.push(format!("{} billion", integer_to_words(n / 1_000_000_000)?));
        n %= 1_000_000_000;
    }
    if n >= 1_000_000 {
        result.push(format!("{} million", integer_to_words(n / 1_000_000)?));
        n %= 1_000_000;
    }
    if n >= 1000 {
        result.push(format!("{} thousand", integer_to_words(n / 1000)?));
        n %= 1000;
    }
    if n >= 100 {
        result.push(format!("{} hundred", ONES[(n / 100) as usize]));
        n %= 100;
    }
    if n >= 20 {
        let t = (n / 10) as usize;
        let o = (n % 10) as usize;
        if o > 0 {
            result.push(format!("{}-{}", TENS[t], ONES[o]));
        } else {
            result.push(TENS[t].to_string());
        }
    } else if n > 0 {
        result.push(ONES[n as usize].to_string());
    }

    Some(result.join(" "))
}

fn digits_to_words(digits: &str) -> String {
    let digit_words = [
        "zero", "one", "two", "three", "four", "five", "six", "seven", "eight", "nine",
    ];
    digits
        .chars()
        .filter_map(|c| c.to_digit(10).map(|d| digit_words[d as usize]))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Rewrite the final word of a cardinal phrase into its ordinal form
fn cardinal_to_ordinal(cardinal: &str) -> String {
    let irregular = [
        ("one", "first"),
        ("two", "second"),
        ("three", "third"),
        ("five", "fifth"),
        ("eight", "eighth"),
        ("nine", "ninth"),
        ("twelve", "twelfth"),
    ];
    let split_at = cardinal
        .rfind(|c| c == ' ' || c == '-')
        .map(|i| i + 1)
        .unwrap_or(0);
    let (head, last) = cardinal.split_at(split_at);
    for (from, to) in irregular {
        if last == from {
            return format!("{}{}", head, to);
        }
    }
    if let Some(stem) = last.strip_suffix('y') {
        return format!("{}{}ieth", head, stem);
    }
    format!("{}{}th", head, last)
}

fn year_to_words(year: i64) -> Option<String> {
    let high = year / 100;
    let low = year % 100;
    if low == 0 {
        return Some(format!("{} hundred", integer_to_words(high)?));
    }
    if low < 10 {
        return Some(format!(
            "{} oh {}",
            integer_to_words(high)?,
            integer_to_words(low)?
        ));
    }
    Some(format!(
        "{} {}",
        integer_to_words(high)?,
        integer_to_words(low)?
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smart_quotes_folded() {
        assert_eq!(
            normalize_text("\u{201C}Hello\u{201D} \u{2018}there\u{2019}"),
            "\"Hello\" 'there'"
        );
    }

    #[test]
    fn test_dash_and_ellipsis() {
        assert_eq!(normalize_text("wait\u{2026} what"), "wait... what");
        assert_eq!(normalize_text("a\u{2014}b"), "a - b");
    }

    #[test]
    fn test_paragraph_breaks_preserved() {
        let result = normalize_text("First  paragraph.\n\n\nSecond   one.");
        assert_eq!(result, "First paragraph.\n\nSecond one.");
    }

    #[test]
    fn test_all_whitespace_paragraph_dropped() {
        let result = normalize_text("First.\n\n   \n\nSecond.");
        assert_eq!(result, "First.\n\nSecond.");
    }

    #[test]
    fn test_canonical_text_lowercases() {
        assert_eq!(canonical_text("Gojo  Meets\n\nSukuna"), "gojo meets sukuna");
    }

    #[test]
    fn test_cardinal_numbers() {
        let profile = ReadingProfile::default();
        assert_eq!(
            apply_reading_modes("I have 5 apples", &profile),
            "I have five apples"
        );
        assert_eq!(
            apply_reading_modes("chapter 21", &profile),
            "chapter twenty-one"
        );
    }

    #[test]
    fn test_trailing_period_not_a_decimal() {
        let profile = ReadingProfile::default();
        assert_eq!(apply_reading_modes("I am 30.", &profile), "I am thirty.");
        assert_eq!(
            apply_reading_modes("pi is 3.14", &profile),
            "pi is three point one four"
        );
    }

    #[test]
    fn test_ordinal_numbers() {
        let profile = ReadingProfile {
            number_mode: NumberMode::Ordinal,
            ..Default::default()
        };
        assert_eq!(apply_reading_modes("the 1", &profile), "the first");
        assert_eq!(apply_reading_modes("the 3", &profile), "the third");
        assert_eq!(
            apply_reading_modes("the 21", &profile),
            "the twenty-first"
        );
        assert_eq!(apply_reading_modes("the 20", &profile), "the twentieth");
    }

    #[test]
    fn test_year_numbers() {
        let profile = ReadingProfile {
            number_mode: NumberMode::Year,
            ..Default::default()
        };
        assert_eq!(
            apply_reading_modes("in 1984", &profile),
            "in nineteen eighty-four"
        );
        assert_eq!(
            apply_reading_modes("in 1900", &profile),
            "in nineteen hundred"
        );
        assert_eq!(
            apply_reading_modes("in 2005", &profile),
            "in twenty oh five"
        );
        // Short numbers fall back to cardinal
        assert_eq!(apply_reading_modes("room 42", &profile), "room forty-two");
    }

    #[test]
    fn test_acronym_spelling() {
        let profile = ReadingProfile {
            acronym_mode: AcronymMode::Spell,
            ..Default::default()
        };
        assert_eq!(apply_reading_modes("NASA", &profile), "N A S A");
        // Capitalized words are untouched
        assert_eq!(apply_reading_modes("Gojo", &profile), "Gojo");
        assert_eq!(
            apply_reading_modes("the FBI agent", &profile),
            "the F B I agent"
        );
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(normalize_text(""), "");
        assert_eq!(normalize_text("   "), "");
    }
}
