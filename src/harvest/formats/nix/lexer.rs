//! Tokenizer for the Nix expression subset.
//!
//! Delimiter balance is enforced here, so the parser can be tolerant about
//! everything else: a file whose `{ [ ( ${` pairs do not match, or whose
//! string/comment never terminates, is rejected with the byte offset of the
//! offending character.

use crate::harvest::traits::FormatError;

/// Words with syntactic meaning; never treated as package identifiers.
pub const KEYWORDS: &[&str] = &[
    "let", "in", "rec", "with", "inherit", "if", "then", "else", "assert", "or",
];

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    /// String literal; escapes decoded, `${...}` interpolations kept verbatim.
    Str(String),
    Number(String),
    Path(String),
    Uri(String),
    /// `${ ... }` outside a string (dynamic attribute names), verbatim.
    Interp(String),
    Punct(&'static str),
    /// Character the subset does not know; the parser keeps it opaque.
    Unknown(char),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub offset: usize,
}

const PUNCT3: &[&str] = &["..."];
const PUNCT2: &[&str] = &["++", "//", "==", "!=", "<=", ">=", "&&", "||", "->"];
const PUNCT1: &[&str] = &[
    "{", "}", "[", "]", "(", ")", ";", "=", ":", ",", ".", "@", "?", "!", "+", "-", "*", "/",
    "<", ">",
];

pub fn tokenize(src: &str) -> Result<Vec<Token>, FormatError> {
    let mut lexer = Lexer {
        src,
        bytes: src.as_bytes(),
        pos: 0,
    };
    lexer.lex(false)
}

struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

fn malformed(offset: usize, reason: impl Into<String>) -> FormatError {
    FormatError::MalformedExpression {
        offset,
        reason: reason.into(),
    }
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'\''
}

fn is_path_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-' | b'+' | b'/')
}

fn is_uri_char(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'%' | b'/' | b'?' | b':' | b'@' | b'&' | b'=' | b'+' | b'$' | b',' | b'-' | b'_'
                | b'.' | b'!' | b'~' | b'*' | b'\''
        )
}

impl<'a> Lexer<'a> {
    fn peek(&self, ahead: usize) -> Option<u8> {
        self.bytes.get(self.pos + ahead).copied()
    }

    fn starts_with(&self, s: &str) -> bool {
        self.bytes[self.pos.min(self.bytes.len())..].starts_with(s.as_bytes())
    }

    /// Steps over one whole character; `pos` stays on a char boundary.
    fn bump_char(&mut self) {
        self.pos += self.src[self.pos..].chars().next().map_or(1, char::len_utf8);
    }

    /// Lexes until EOF, or, when `in_interpolation`, until the `}` closing
    /// the current `${`. Returns the tokens; `self.pos` is left after the
    /// closing brace in the latter case.
    fn lex(&mut self, in_interpolation: bool) -> Result<Vec<Token>, FormatError> {
        let mut tokens = Vec::new();
        let mut open: Vec<(u8, usize)> = Vec::new();

        while let Some(b) = self.peek(0) {
            let start = self.pos;
            match b {
                b' ' | b'\t' | b'\r' | b'\n' => self.pos += 1,
                b'\\' if matches!(self.peek(1), Some(b'\n')) => self.pos += 2,
                b'\\' if self.starts_with("\\\r\n") => self.pos += 3,
                b'#' => self.skip_line_comment(),
                b'/' if self.peek(1) == Some(b'*') => self.skip_block_comment()?,
                b'"' => {
                    let text = self.lex_string()?;
                    tokens.push(Token { kind: TokenKind::Str(text), offset: start });
                }
                b'\'' if self.peek(1) == Some(b'\'') => {
                    let text = self.lex_indented_string()?;
                    tokens.push(Token { kind: TokenKind::Str(text), offset: start });
                }
                b'$' if self.peek(1) == Some(b'{') => {
                    self.skip_interpolation()?;
                    tokens.push(Token {
                        kind: TokenKind::Interp(self.src[start..self.pos].to_string()),
                        offset: start,
                    });
                }
                _ if is_ident_start(b) => {
                    let kind = self.lex_word();
                    tokens.push(Token { kind, offset: start });
                }
                _ if b.is_ascii_digit() => {
                    self.pos += 1;
                    while let Some(c) = self.peek(0) {
                        let fraction = c == b'.' && self.peek(1).map_or(false, |d| d.is_ascii_digit());
                        if c.is_ascii_digit() || fraction || c == b'e' || c == b'E' {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                    tokens.push(Token {
                        kind: TokenKind::Number(self.src[start..self.pos].to_string()),
                        offset: start,
                    });
                }
                _ if self.at_path_start() => {
                    let path = self.lex_path()?;
                    tokens.push(Token { kind: TokenKind::Path(path), offset: start });
                }
                b'<' if self.search_path_len().is_some() => {
                    let len = self.search_path_len().unwrap_or(0);
                    self.pos += len;
                    tokens.push(Token {
                        kind: TokenKind::Path(self.src[start..self.pos].to_string()),
                        offset: start,
                    });
                }
                _ => {
                    if b == b'}' && in_interpolation && open.is_empty() {
                        self.pos += 1;
                        return Ok(tokens);
                    }
                    let punct = self.lex_punct();
                    match punct {
                        Some(p) => {
                            match p {
                                "{" | "[" | "(" => open.push((p.as_bytes()[0], start)),
                                "}" | "]" | ")" => {
                                    let expected = match p {
                                        "}" => b'{',
                                        "]" => b'[',
                                        _ => b'(',
                                    };
                                    match open.pop() {
                                        Some((opener, _)) if opener == expected => {}
                                        Some((opener, at)) => {
                                            return Err(malformed(
                                                start,
                                                format!(
                                                    "'{}' does not close '{}' opened at byte {}",
                                                    p, opener as char, at
                                                ),
                                            ))
                                        }
                                        None => {
                                            return Err(malformed(
                                                start,
                                                format!("unmatched '{}'", p),
                                            ))
                                        }
                                    }
                                }
                                _ => {}
                            }
                            tokens.push(Token { kind: TokenKind::Punct(p), offset: start });
                        }
                        None => {
                            let ch = self.src[start..].chars().next().unwrap_or('\u{FFFD}');
                            self.pos += ch.len_utf8();
                            tokens.push(Token { kind: TokenKind::Unknown(ch), offset: start });
                        }
                    }
                }
            }
        }

        if let Some((opener, at)) = open.pop() {
            return Err(malformed(at, format!("unclosed '{}'", opener as char)));
        }
        if in_interpolation {
            return Err(malformed(self.pos, "unterminated '${' interpolation"));
        }
        Ok(tokens)
    }

    fn skip_line_comment(&mut self) {
        while let Some(b) = self.peek(0) {
            if b == b'\n' {
                break;
            }
            self.pos += 1;
        }
    }

    fn skip_block_comment(&mut self) -> Result<(), FormatError> {
        let start = self.pos;
        match self.src[self.pos + 2..].find("*/") {
            Some(end) => {
                self.pos += 2 + end + 2;
                Ok(())
            }
            None => Err(malformed(start, "unterminated block comment")),
        }
    }

    /// Skips a `${ ... }` starting at `self.pos`, including nested strings
    /// and interpolations.
    fn skip_interpolation(&mut self) -> Result<(), FormatError> {
        let start = self.pos;
        let len = self.bytes.len();
        self.pos += 2;
        self.lex(true).map_err(|e| match e {
            FormatError::MalformedExpression { offset, reason } if offset >= len => {
                malformed(start, reason)
            }
            other => other,
        })?;
        Ok(())
    }

    fn lex_string(&mut self) -> Result<String, FormatError> {
        let start = self.pos;
        self.pos += 1;
        let mut out = String::new();
        let mut chunk = self.pos;
        loop {
            match self.peek(0) {
                None => return Err(malformed(start, "unterminated string")),
                Some(b'"') => {
                    out.push_str(&self.src[chunk..self.pos]);
                    self.pos += 1;
                    return Ok(out);
                }
                Some(b'\\') => {
                    out.push_str(&self.src[chunk..self.pos]);
                    let escaped = self.src[self.pos + 1..].chars().next();
                    match escaped {
                        None => return Err(malformed(start, "unterminated string")),
                        Some(c) => {
                            out.push(match c {
                                'n' => '\n',
                                't' => '\t',
                                'r' => '\r',
                                other => other,
                            });
                            self.pos += 1 + c.len_utf8();
                        }
                    }
                    chunk = self.pos;
                }
                Some(b'$') if self.peek(1) == Some(b'{') => {
                    out.push_str(&self.src[chunk..self.pos]);
                    let interp_start = self.pos;
                    self.skip_interpolation()?;
                    out.push_str(&self.src[interp_start..self.pos]);
                    chunk = self.pos;
                }
                Some(_) => self.bump_char(),
            }
        }
    }

    fn lex_indented_string(&mut self) -> Result<String, FormatError> {
        let start = self.pos;
        self.pos += 2;
        let mut out = String::new();
        let mut chunk = self.pos;
        loop {
            if self.pos >= self.bytes.len() {
                return Err(malformed(start, "unterminated indented string"));
            }
            if self.starts_with("'''") {
                out.push_str(&self.src[chunk..self.pos]);
                out.push_str("''");
                self.pos += 3;
                chunk = self.pos;
            } else if self.starts_with("''$") {
                out.push_str(&self.src[chunk..self.pos]);
                out.push('$');
                self.pos += 3;
                chunk = self.pos;
            } else if self.starts_with("''\\") {
                out.push_str(&self.src[chunk..self.pos]);
                self.pos += 3;
                match self.src[self.pos..].chars().next() {
                    Some(c) => {
                        out.push(c);
                        self.pos += c.len_utf8();
                    }
                    None => return Err(malformed(start, "unterminated indented string")),
                }
                chunk = self.pos;
            } else if self.starts_with("''") {
                out.push_str(&self.src[chunk..self.pos]);
                self.pos += 2;
                return Ok(out);
            } else if self.starts_with("${") {
                out.push_str(&self.src[chunk..self.pos]);
                let interp_start = self.pos;
                self.skip_interpolation()?;
                out.push_str(&self.src[interp_start..self.pos]);
                chunk = self.pos;
            } else {
                self.bump_char();
            }
        }
    }

    fn lex_word(&mut self) -> TokenKind {
        let start = self.pos;
        // scheme:rest is a URI literal (e.g. https://example.org/x.tar.gz)
        let mut scheme_end = self.pos;
        while let Some(b) = self.bytes.get(scheme_end) {
            if b.is_ascii_alphanumeric() || matches!(b, b'+' | b'.' | b'-') {
                scheme_end += 1;
            } else {
                break;
            }
        }
        if self.bytes.get(scheme_end) == Some(&b':') && self.bytes.get(scheme_end + 1) == Some(&b'/')
        {
            self.pos = scheme_end + 1;
            while let Some(b) = self.peek(0) {
                if is_uri_char(b) {
                    self.pos += 1;
                } else {
                    break;
                }
            }
            return TokenKind::Uri(self.src[start..self.pos].to_string());
        }

        while let Some(b) = self.peek(0) {
            if is_ident_char(b) {
                self.pos += 1;
            } else {
                break;
            }
        }
        TokenKind::Ident(self.src[start..self.pos].to_string())
    }

    fn at_path_start(&self) -> bool {
        let next_is_path = |n: usize| self.peek(n).map_or(false, |b| is_path_char(b) && b != b'/');
        if self.starts_with("./") || self.starts_with("~/") {
            return true;
        }
        if self.starts_with("../") {
            return true;
        }
        // `/abs/path`, but not `//` (update) or `/ x` (division)
        self.peek(0) == Some(b'/') && self.peek(1) != Some(b'/') && next_is_path(1)
    }

    fn lex_path(&mut self) -> Result<String, FormatError> {
        let start = self.pos;
        loop {
            match self.peek(0) {
                Some(b'$') if self.peek(1) == Some(b'{') => self.skip_interpolation()?,
                Some(b) if is_path_char(b) || b == b'~' => self.pos += 1,
                _ => break,
            }
        }
        // A path never ends in '/'; give the slash back (e.g. `./.`)
        Ok(self.src[start..self.pos].to_string())
    }

    /// Length of a `<nixpkgs>`-style search path at `self.pos`, if any.
    fn search_path_len(&self) -> Option<usize> {
        let rest = &self.bytes[self.pos..];
        let close = rest.iter().position(|b| *b == b'>')?;
        if close < 2 {
            return None;
        }
        if rest[1..close].iter().all(|b| is_path_char(*b)) && is_ident_start(rest[1]) {
            Some(close + 1)
        } else {
            None
        }
    }

    fn lex_punct(&mut self) -> Option<&'static str> {
        for set in [PUNCT3, PUNCT2, PUNCT1] {
            for p in set {
                if self.starts_with(p) {
                    self.pos += p.len();
                    return Some(p);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_basic_tokens() {
        assert_eq!(
            kinds("{ buildInputs = [ glib ]; }"),
            vec![
                TokenKind::Punct("{"),
                TokenKind::Ident("buildInputs".into()),
                TokenKind::Punct("="),
                TokenKind::Punct("["),
                TokenKind::Ident("glib".into()),
                TokenKind::Punct("]"),
                TokenKind::Punct(";"),
                TokenKind::Punct("}"),
            ]
        );
    }

    #[test]
    fn test_comments_skipped() {
        let toks = kinds("a # line\n/* block\n comment */ b");
        assert_eq!(toks, vec![TokenKind::Ident("a".into()), TokenKind::Ident("b".into())]);
    }

    #[test]
    fn test_nested_interpolation_in_string() {
        let toks = kinds(r#"x = "v${lib.concat "${a}" "}"}";"#);
        assert_eq!(toks[2], TokenKind::Str(r#"v${lib.concat "${a}" "}"}"#.into()));
        assert_eq!(toks.len(), 4);
    }

    #[test]
    fn test_indented_string_escapes() {
        let toks = kinds("''\n  echo '''quoted''' ''${HOME}\n''");
        assert_eq!(toks, vec![TokenKind::Str("\n  echo ''quoted'' ${HOME}\n".into())]);
    }

    #[test]
    fn test_paths_and_uris() {
        let toks = kinds("import ./pkgs/foo.nix <nixpkgs> https://example.org/a.tar.gz");
        assert_eq!(toks[1], TokenKind::Path("./pkgs/foo.nix".into()));
        assert_eq!(toks[2], TokenKind::Path("<nixpkgs>".into()));
        assert_eq!(toks[3], TokenKind::Uri("https://example.org/a.tar.gz".into()));
    }

    #[test]
    fn test_operators() {
        let toks = kinds("a ++ b // c -> d ... ? e");
        assert!(toks.contains(&TokenKind::Punct("++")));
        assert!(toks.contains(&TokenKind::Punct("//")));
        assert!(toks.contains(&TokenKind::Punct("->")));
        assert!(toks.contains(&TokenKind::Punct("...")));
    }

    #[test]
    fn test_line_continuation_ignored() {
        assert_eq!(kinds("a \\\n b").len(), 2);
    }

    #[test]
    fn test_unbalanced_reports_offset() {
        let err = tokenize("{ a = [ b ); }").unwrap_err();
        assert_eq!(
            err,
            FormatError::MalformedExpression {
                offset: 10,
                reason: "')' does not close '[' opened at byte 6".into()
            }
        );
        assert!(matches!(
            tokenize("{ a = 1;"),
            Err(FormatError::MalformedExpression { offset: 0, .. })
        ));
        assert!(matches!(
            tokenize("x = \"open"),
            Err(FormatError::MalformedExpression { offset: 4, .. })
        ));
    }

    #[test]
    fn test_multibyte_text_in_strings() {
        assert_eq!(
            kinds("''é ''${x} ü'' \"ß ${y}\""),
            vec![
                TokenKind::Str("é ${x} ü".to_string()),
                TokenKind::Str("ß ${y}".to_string()),
            ]
        );
    }
}
