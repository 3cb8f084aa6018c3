/// Last `max_chars` characters of `text`, respecting UTF-8
/// boundaries. Console output is decoded lossily and can contain
/// multi-byte replacement characters, so a plain byte slice is not
/// safe here.
pub fn tail_chars(text: &str, max_chars: usize) -> &str {
    if max_chars == 0 {
        return "";
    }
    match text.char_indices().rev().nth(max_chars - 1) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::tail_chars;

    #[test]
    fn shorter_input_is_returned_whole() {
        assert_eq!(tail_chars("abc", 500), "abc");
    }

    #[test]
    fn tail_respects_char_boundaries() {
        let s = "x\u{fffd}\u{fffd}end";
        assert_eq!(tail_chars(s, 4), "\u{fffd}end");
        assert_eq!(tail_chars(s, 0), "");
    }
}
