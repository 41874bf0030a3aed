//! Helpers for building prompts from untrusted text and for pulling
//! JSON out of model responses.

/// Slice out the first `{` .. last `}` span of a model response. Strips
/// fenced code blocks and prose the model wraps around its JSON.
pub(crate) fn extract_json(response: &str) -> Option<&str> {
    let start = response.find('{')?;
    let end = response.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&response[start..=end])
}

/// Clip untrusted text before embedding it in a prompt: cap the length,
/// escape angle brackets so delimiter tags stay unambiguous, and drop
/// control characters other than newline and tab.
pub(crate) fn clip_for_prompt(input: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(input.len().min(max_len));
    for ch in input.chars().take(max_len) {
        match ch {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c if c.is_control() && c != '\n' && c != '\t' => {}
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_strips_wrapping() {
        assert_eq!(
            extract_json("```json\n{\"a\": 1}\n```"),
            Some("{\"a\": 1}")
        );
        assert_eq!(extract_json("no braces here"), None);
        assert_eq!(extract_json("} reversed {"), None);
    }

    #[test]
    fn test_extract_json_spans_nested_objects() {
        let response = "Here you go: {\"outer\": {\"inner\": 2}} done";
        assert_eq!(extract_json(response), Some("{\"outer\": {\"inner\": 2}}"));
    }

    #[test]
    fn test_clip_for_prompt_escapes_and_caps() {
        assert_eq!(clip_for_prompt("a<b>c", 100), "a&lt;b&gt;c");
        assert_eq!(clip_for_prompt("abcdef", 3), "abc");
        assert_eq!(clip_for_prompt("a\u{0007}b\nc", 100), "ab\nc");
    }
}
