pub fn now_us() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

/// Shortens `text` to at most `max_chars` characters for log output.
pub fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_keeps_short_text() {
        assert_eq!(preview("hello", 10), "hello");
    }

    #[test]
    fn preview_cuts_on_char_boundaries() {
        assert_eq!(preview("ñandú ñandú", 5), "ñandú...");
    }
}
