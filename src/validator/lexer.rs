use super::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Bare keyword or identifier.
    Word,
    /// `"x"`, `` `x` `` or `[x]`; `text` holds the unquoted name.
    QuotedIdent,
    /// `'...'`; `text` holds the raw literal.
    String,
    Number,
    /// Bind parameter (`?`, `?1`, `:name`, `@name`, `$name`).
    Param,
    Punct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    /// Byte span in the source text.
    pub start: usize,
    pub end: usize,
}

impl Token {
    pub fn is_word(&self, word: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(word)
    }

    pub fn is_punct(&self, punct: &str) -> bool {
        self.kind == TokenKind::Punct && self.text == punct
    }
}

const MULTI_CHAR_PUNCT: &[&str] = &["||", "<=", ">=", "<>", "!=", "==", "<<", ">>", "->>", "->"];

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || !c.is_ascii()
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$' || !c.is_ascii()
}

/// Split SQL text into tokens. Comments and whitespace are dropped.
pub fn tokenize(sql: &str) -> Result<Vec<Token>, ValidationError> {
    let chars: Vec<(usize, char)> = sql.char_indices().collect();
    let byte_at = |i: usize| chars.get(i).map(|(b, _)| *b).unwrap_or(sql.len());
    let char_at = |i: usize| chars.get(i).map(|(_, c)| *c);

    let mut tokens = Vec::new();
    let mut i = 0;

    while let Some(c) = char_at(i) {
        let start = i;

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        // -- line comment
        if c == '-' && char_at(i + 1) == Some('-') {
            while let Some(c) = char_at(i) {
                if c == '\n' {
                    break;
                }
                i += 1;
            }
            continue;
        }

        // /* block comment */
        if c == '/' && char_at(i + 1) == Some('*') {
            i += 2;
            loop {
                match (char_at(i), char_at(i + 1)) {
                    (Some('*'), Some('/')) => {
                        i += 2;
                        break;
                    }
                    (Some(_), _) => i += 1,
                    (None, _) => return Err(ValidationError::Syntax("unterminated comment".to_string())),
                }
            }
            continue;
        }

        if c == '\'' {
            i += 1;
            loop {
                match char_at(i) {
                    Some('\'') if char_at(i + 1) == Some('\'') => i += 2,
                    Some('\'') => {
                        i += 1;
                        break;
                    }
                    Some(_) => i += 1,
                    None => return Err(ValidationError::Syntax("unterminated string literal".to_string())),
                }
            }
            tokens.push(Token {
                kind: TokenKind::String,
                text: sql[byte_at(start)..byte_at(i)].to_string(),
                start: byte_at(start),
                end: byte_at(i),
            });
            continue;
        }

        if c == '"' || c == '`' || c == '[' {
            let close = if c == '[' { ']' } else { c };
            i += 1;
            let mut name = String::new();
            loop {
                match char_at(i) {
                    Some(ch) if ch == close && close != ']' && char_at(i + 1) == Some(close) => {
                        name.push(close);
                        i += 2;
                    }
                    Some(ch) if ch == close => {
                        i += 1;
                        break;
                    }
                    Some(ch) => {
                        name.push(ch);
                        i += 1;
                    }
                    None => return Err(ValidationError::Syntax("unterminated quoted identifier".to_string())),
                }
            }
            tokens.push(Token {
                kind: TokenKind::QuotedIdent,
                text: name,
                start: byte_at(start),
                end: byte_at(i),
            });
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && char_at(i + 1).is_some_and(|n| n.is_ascii_digit())) {
            if c == '0' && matches!(char_at(i + 1), Some('x') | Some('X')) {
                i += 2;
                while char_at(i).is_some_and(|h| h.is_ascii_hexdigit()) {
                    i += 1;
                }
            } else {
                while let Some(d) = char_at(i) {
                    let exponent_sign = matches!(d, '+' | '-') && matches!(char_at(i - 1), Some('e') | Some('E'));
                    if d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' || exponent_sign {
                        i += 1;
                    } else {
                        break;
                    }
                }
            }
            tokens.push(Token {
                kind: TokenKind::Number,
                text: sql[byte_at(start)..byte_at(i)].to_string(),
                start: byte_at(start),
                end: byte_at(i),
            });
            continue;
        }

        if is_ident_start(c) {
            while char_at(i).is_some_and(is_ident_char) {
                i += 1;
            }
            tokens.push(Token {
                kind: TokenKind::Word,
                text: sql[byte_at(start)..byte_at(i)].to_string(),
                start: byte_at(start),
                end: byte_at(i),
            });
            continue;
        }

        if matches!(c, '?' | ':' | '@' | '$') {
            i += 1;
            while char_at(i).is_some_and(is_ident_char) {
                i += 1;
            }
            tokens.push(Token {
                kind: TokenKind::Param,
                text: sql[byte_at(start)..byte_at(i)].to_string(),
                start: byte_at(start),
                end: byte_at(i),
            });
            continue;
        }

        let rest = &sql[byte_at(i)..];
        let width = MULTI_CHAR_PUNCT
            .iter()
            .find(|p| rest.starts_with(**p))
            .map(|p| p.chars().count())
            .unwrap_or(1);
        i += width;
        tokens.push(Token {
            kind: TokenKind::Punct,
            text: sql[byte_at(start)..byte_at(i)].to_string(),
            start: byte_at(start),
            end: byte_at(i),
        });
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(sql: &str) -> Vec<(TokenKind, String)> {
        tokenize(sql).unwrap().into_iter().map(|t| (t.kind, t.text)).collect()
    }

    #[test]
    fn test_tokenize_basic_select() {
        let tokens = kinds("SELECT MAX(alt) FROM t;");
        assert_eq!(
            tokens,
            vec![
                (TokenKind::Word, "SELECT".to_string()),
                (TokenKind::Word, "MAX".to_string()),
                (TokenKind::Punct, "(".to_string()),
                (TokenKind::Word, "alt".to_string()),
                (TokenKind::Punct, ")".to_string()),
                (TokenKind::Word, "FROM".to_string()),
                (TokenKind::Word, "t".to_string()),
                (TokenKind::Punct, ";".to_string()),
            ]
        );
    }

    #[test]
    fn test_comments_are_dropped() {
        let tokens = kinds("SELECT 1 -- DROP TABLE x\n /* DELETE ; */ + 2");
        let texts: Vec<_> = tokens.iter().map(|(_, t)| t.as_str()).collect();
        assert_eq!(texts, vec!["SELECT", "1", "+", "2"]);
    }

    #[test]
    fn test_string_literal_hides_keywords() {
        let tokens = kinds("SELECT 'it''s; DELETE' AS x");
        assert_eq!(tokens[1], (TokenKind::String, "'it''s; DELETE'".to_string()));
        assert_eq!(tokens.len(), 4);
    }

    #[test]
    fn test_quoted_identifiers() {
        let tokens = kinds(r#"SELECT "Alt ""m""", `b`, [c d]"#);
        assert_eq!(tokens[1], (TokenKind::QuotedIdent, "Alt \"m\"".to_string()));
        assert_eq!(tokens[3], (TokenKind::QuotedIdent, "b".to_string()));
        assert_eq!(tokens[5], (TokenKind::QuotedIdent, "c d".to_string()));
    }

    #[test]
    fn test_numbers_and_operators() {
        let tokens = kinds("1.5e-3 >= .5 <> 0x1F");
        assert_eq!(tokens[0], (TokenKind::Number, "1.5e-3".to_string()));
        assert_eq!(tokens[1], (TokenKind::Punct, ">=".to_string()));
        assert_eq!(tokens[2], (TokenKind::Number, ".5".to_string()));
        assert_eq!(tokens[3], (TokenKind::Punct, "<>".to_string()));
        assert_eq!(tokens[4], (TokenKind::Number, "0x1F".to_string()));
    }

    #[test]
    fn test_parameters() {
        let tokens = kinds("SELECT ?1, :name");
        assert_eq!(tokens[1].0, TokenKind::Param);
        assert_eq!(tokens[3], (TokenKind::Param, ":name".to_string()));
    }

    #[test]
    fn test_unterminated_input() {
        assert!(matches!(tokenize("SELECT 'abc"), Err(ValidationError::Syntax(_))));
        assert!(matches!(tokenize("SELECT /* abc"), Err(ValidationError::Syntax(_))));
        assert!(matches!(tokenize("SELECT \"abc"), Err(ValidationError::Syntax(_))));
    }

    #[test]
    fn test_spans_cover_source() {
        let sql = "SELECT alt FROM t ; -- trailing";
        let tokens = tokenize(sql).unwrap();
        assert_eq!(&sql[tokens[0].start..tokens[3].end], "SELECT alt FROM t");
    }
}
