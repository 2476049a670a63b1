//! Paragraph-boundary text segmenter.
//!
//! When the extractor returns one block of text for a whole document,
//! the pipeline can split it into page-sized segments so that each
//! question-generation call sees a bounded amount of context. Splitting
//! occurs on paragraph boundaries (`\n\n`); a paragraph longer than the
//! limit is hard-split at the last newline or space before the limit.

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Split text into segments of at most `max_tokens` (approximate) each.
///
/// Always returns at least one segment; empty input yields one empty
/// segment so that page numbering stays defined.
pub fn segment_text(text: &str, max_tokens: usize) -> Vec<String> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;

    let mut segments = Vec::new();
    let mut current_buf = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if current_buf.is_empty() {
            trimmed.len()
        } else {
            current_buf.len() + 2 + trimmed.len()
        };

        if would_be > max_chars && !current_buf.is_empty() {
            segments.push(std::mem::take(&mut current_buf));
        }

        if trimmed.len() > max_chars {
            let mut remaining = trimmed;
            while !remaining.is_empty() {
                let split_at = floor_char_boundary(remaining, max_chars);
                let actual_split = if split_at < remaining.len() {
                    remaining[..split_at]
                        .rfind('\n')
                        .or_else(|| remaining[..split_at].rfind(' '))
                        .map(|pos| pos + 1)
                        .unwrap_or(split_at)
                } else {
                    split_at
                };
                let piece = remaining[..actual_split].trim();
                if !piece.is_empty() {
                    segments.push(piece.to_string());
                }
                remaining = &remaining[actual_split..];
            }
        } else {
            if !current_buf.is_empty() {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
        }
    }

    if !current_buf.is_empty() {
        segments.push(current_buf);
    }

    if segments.is_empty() {
        segments.push(text.trim().to_string());
    }

    segments
}

/// Largest char boundary `<= max` (and `> 0` when the text is non-empty).
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut idx = max;
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    if idx == 0 {
        // A single char wider than the limit.
        s.char_indices().nth(1).map(|(i, _)| i).unwrap_or(s.len())
    } else {
        idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_text_single_segment() {
        let segments = segment_text("Hello, world!", 700);
        assert_eq!(segments, vec!["Hello, world!"]);
    }

    #[test]
    fn test_empty_text() {
        assert_eq!(segment_text("", 700), vec![""]);
    }

    #[test]
    fn test_paragraphs_under_limit_are_joined() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let segments = segment_text(text, 700);
        assert_eq!(segments.len(), 1);
        assert!(segments[0].contains("First paragraph."));
        assert!(segments[0].contains("Third paragraph."));
    }

    #[test]
    fn test_paragraphs_over_limit_are_split() {
        // max_tokens=5 => max_chars=20
        let text = "This is paragraph one.\n\nThis is paragraph two.\n\nThis is paragraph three.";
        let segments = segment_text(text, 5);
        assert!(segments.len() > 1);
        for s in &segments {
            assert!(s.len() <= 20, "segment too long: {:?}", s);
        }
    }

    #[test]
    fn test_multibyte_text_does_not_panic() {
        let text = "é".repeat(100);
        let segments = segment_text(&text, 3);
        assert_eq!(segments.concat(), text);
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta";
        assert_eq!(segment_text(text, 2), segment_text(text, 2));
    }
}
