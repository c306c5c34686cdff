// ============================================================================
// SQL LIKE Matching
// ============================================================================
//
// `%` matches any run of characters, `_` exactly one, `\` escapes the next
// character. Terms are NOT escaped unless the caller asks for it, so `%` and
// `_` typed into a search box behave as wildcards.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(char),
    AnyOne,
    AnyMany,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LikePattern {
    tokens: Vec<Token>,
    case_insensitive: bool,
    source: String,
}

impl LikePattern {
    pub fn parse(pattern: &str, case_insensitive: bool) -> Self {
        let normalized = if case_insensitive { pattern.to_lowercase() } else { pattern.to_string() };

        let mut tokens = Vec::with_capacity(normalized.len());
        let mut chars = normalized.chars();
        while let Some(c) = chars.next() {
            let token = match c {
                '%' => Token::AnyMany,
                '_' => Token::AnyOne,
                // A trailing backslash is a literal backslash
                '\\' => Token::Literal(chars.next().unwrap_or('\\')),
                other => Token::Literal(other),
            };
            // Collapse runs of `%`
            if token == Token::AnyMany && tokens.last() == Some(&Token::AnyMany) {
                continue;
            }
            tokens.push(token);
        }

        Self {
            tokens,
            case_insensitive,
            source: pattern.to_string(),
        }
    }

    /// `%term%`, the substring pattern used by order search
    pub fn containing(term: &str, escape_wildcards: bool, case_insensitive: bool) -> Self {
        let term = if escape_wildcards { escape_like(term) } else { term.to_string() };
        Self::parse(&format!("%{}%", term), case_insensitive)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, text: &str) -> bool {
        let text: Vec<char> = if self.case_insensitive {
            text.to_lowercase().chars().collect()
        } else {
            text.chars().collect()
        };
        let pattern = &self.tokens;

        let (mut ti, mut pi) = (0usize, 0usize);
        // Last `%` seen and the text position it is currently absorbing up to
        let mut backtrack: Option<(usize, usize)> = None;

        while ti < text.len() {
            match pattern.get(pi) {
                Some(Token::AnyMany) => {
                    backtrack = Some((pi, ti));
                    pi += 1;
                    continue;
                }
                Some(Token::AnyOne) => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                Some(Token::Literal(c)) if *c == text[ti] => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                _ => {}
            }

            match backtrack {
                Some((star_pi, star_ti)) => {
                    pi = star_pi + 1;
                    ti = star_ti + 1;
                    backtrack = Some((star_pi, star_ti + 1));
                }
                None => return false,
            }
        }

        pattern[pi..].iter().all(|token| *token == Token::AnyMany)
    }
}

/// Escape `%`, `_` and `\` so the term matches literally
pub fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substring_match_is_case_insensitive() {
        let pattern = LikePattern::containing("smith", false, true);
        assert!(pattern.matches("Jane Smith"));
        assert!(pattern.matches("SMITHERS"));
        assert!(!pattern.matches("Smyth"));
    }

    #[test]
    fn test_case_sensitive_mode() {
        let pattern = LikePattern::containing("smith", false, false);
        assert!(!pattern.matches("Jane Smith"));
        assert!(pattern.matches("goldsmith"));
    }

    #[test]
    fn test_unescaped_wildcards_stay_wildcards() {
        let underscore = LikePattern::containing("a_c", false, true);
        assert!(underscore.matches("xxabcxx"));

        let percent = LikePattern::containing("j%n", false, true);
        assert!(percent.matches("John"));
        assert!(percent.matches("jan"));
    }

    #[test]
    fn test_escaped_wildcards_match_literally() {
        let pattern = LikePattern::containing("a_c", true, true);
        assert!(!pattern.matches("abc"));
        assert!(pattern.matches("code a_c here"));

        let percent = LikePattern::containing("50%", true, true);
        assert!(percent.matches("save 50% today"));
        assert!(!percent.matches("save 500 today"));
    }

    #[test]
    fn test_anchored_patterns() {
        let pattern = LikePattern::parse("ab%", false);
        assert!(pattern.matches("abc"));
        assert!(pattern.matches("ab"));
        assert!(!pattern.matches("cab"));

        let exact = LikePattern::parse("abc", false);
        assert!(exact.matches("abc"));
        assert!(!exact.matches("abcd"));
    }

    #[test]
    fn test_backtracking_across_repeated_prefix() {
        let pattern = LikePattern::parse("%aab%", false);
        assert!(pattern.matches("aaab"));
        assert!(!pattern.matches("abab"));
    }

    #[test]
    fn test_empty_term_matches_everything() {
        let pattern = LikePattern::containing("", false, true);
        assert!(pattern.matches(""));
        assert!(pattern.matches("anything"));
    }
}
