/// `@handle` tokens in order of first appearance, without duplicates.
///
/// A handle is letters, digits and `_`; the `@` must not follow a word
/// character, so e-mail addresses do not count.
pub fn extract_handles(content: &str) -> Vec<&str> {
    let mut handles: Vec<&str> = Vec::new();
    let mut prev: Option<char> = None;

    for (idx, c) in content.char_indices() {
        let after_word = prev.is_some_and(is_handle_char);
        prev = Some(c);
        if c != '@' || after_word {
            continue;
        }

        let start = idx + c.len_utf8();
        let len: usize = content[start..]
            .chars()
            .take_while(|ch| is_handle_char(*ch))
            .map(char::len_utf8)
            .sum();
        let handle = &content[start..start + len];
        if !handle.is_empty() && !handles.contains(&handle) {
            handles.push(handle);
        }
    }
    handles
}

fn is_handle_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_handles() {
        assert_eq!(extract_handles("hi @bob and @carol_2!"), vec!["bob", "carol_2"]);
        assert_eq!(extract_handles("@bob @bob @bob"), vec!["bob"]);
        assert_eq!(extract_handles("(@bob)"), vec!["bob"]);
    }

    #[test]
    fn test_ignores_emails_and_bare_at() {
        assert!(extract_handles("mail bob@example.com").is_empty());
        assert!(extract_handles("meet @ noon").is_empty());
        assert!(extract_handles("").is_empty());
    }
}
