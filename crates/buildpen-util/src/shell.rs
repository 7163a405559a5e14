/// Escape a string for safe inclusion in a POSIX shell command line.
///
/// Single-quoting: every `'` becomes `'\''`, the rest is wrapped in single
/// quotes verbatim. Strings that are already plain shell words are left
/// untouched so the escaped command stays readable in logs.
pub fn shell_escape(s: &str) -> String {
    if !s.is_empty() && s.bytes().all(is_safe_byte) {
        return s.to_owned();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn is_safe_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'+' | b'=' | b'.' | b'/' | b':' | b',' | b'@' | b'%')
}

/// Escape an argument vector into a single shell command line.
pub fn escape_args<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|a| shell_escape(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal POSIX word splitter, enough to re-parse our own escaping:
    /// handles single quotes, the `'\''` escape, and bare words.
    fn word_split(line: &str) -> Vec<String> {
        let mut words = Vec::new();
        let mut current = String::new();
        let mut in_word = false;
        let mut chars = line.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '\'' => {
                    in_word = true;
                    for q in chars.by_ref() {
                        if q == '\'' {
                            break;
                        }
                        current.push(q);
                    }
                }
                '\\' => {
                    in_word = true;
                    if let Some(&next) = chars.peek() {
                        current.push(next);
                        chars.next();
                    }
                }
                ' ' => {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                other => {
                    in_word = true;
                    current.push(other);
                }
            }
        }
        if in_word {
            words.push(current);
        }
        words
    }

    #[test]
    fn plain_words_pass_through() {
        assert_eq!(shell_escape("apt-get"), "apt-get");
        assert_eq!(shell_escape("/usr/bin/make"), "/usr/bin/make");
        assert_eq!(shell_escape("LANG=C"), "LANG=C");
    }

    #[test]
    fn empty_and_spaces_are_quoted() {
        assert_eq!(shell_escape(""), "''");
        assert_eq!(shell_escape("two words"), "'two words'");
    }

    #[test]
    fn single_quotes_are_escaped() {
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
    }

    #[test]
    fn injection_attempts_are_inert() {
        assert_eq!(shell_escape("$(rm -rf /)"), "'$(rm -rf /)'");
        assert_eq!(shell_escape("`whoami`"), "'`whoami`'");
        assert_eq!(shell_escape("a;b|c&d"), "'a;b|c&d'");
    }

    #[test]
    fn escape_then_split_round_trips() {
        let args = [
            "apt-get",
            "install",
            "two words",
            "it's",
            "tab\there",
            "new\nline",
            "naïve-ümlaut",
            "$(boom)",
            "",
        ];
        let line = escape_args(&args);
        let parsed = word_split(&line);
        assert_eq!(parsed, args);
    }

    #[test]
    fn escape_args_joins_with_spaces() {
        assert_eq!(escape_args(&["cd", "/build dir"]), "cd '/build dir'");
    }
}
