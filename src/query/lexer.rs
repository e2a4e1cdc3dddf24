//! Tokenizer for the query language
//!
//! Keywords are case-insensitive, identifiers may be back-quoted, strings
//! take single or double quotes. Every token carries its byte offset.

use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LexError {
    #[error("Unterminated string starting at offset {0}")]
    UnterminatedString(usize),

    #[error("Unterminated quoted identifier starting at offset {0}")]
    UnterminatedIdentifier(usize),

    #[error("Unterminated block comment starting at offset {0}")]
    UnterminatedComment(usize),

    #[error("Invalid escape sequence at offset {0}")]
    InvalidEscape(usize),

    #[error("Invalid number '{text}' at offset {offset}")]
    InvalidNumber { text: String, offset: usize },

    #[error("Unexpected character '{ch}' at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },
}

impl LexError {
    pub fn offset(&self) -> usize {
        match self {
            LexError::UnterminatedString(o)
            | LexError::UnterminatedIdentifier(o)
            | LexError::UnterminatedComment(o)
            | LexError::InvalidEscape(o) => *o,
            LexError::InvalidNumber { offset, .. } | LexError::UnexpectedChar { offset, .. } => *offset,
        }
    }
}

pub type LexResult<T> = Result<T, LexError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyword {
    Match,
    Optional,
    Where,
    Return,
    With,
    Create,
    Merge,
    On,
    Set,
    Remove,
    Delete,
    Detach,
    Unwind,
    As,
    Foreach,
    Call,
    Yield,
    Union,
    All,
    Distinct,
    Order,
    By,
    Asc,
    Desc,
    Skip,
    Limit,
    And,
    Or,
    Xor,
    Not,
    In,
    Starts,
    Ends,
    Contains,
    Is,
    Null,
    True,
    False,
    Case,
    When,
    Then,
    Else,
    End,
    Explain,
    Index,
    Drop,
}

impl Keyword {
    fn lookup(word: &str) -> Option<Keyword> {
        let kw = match word.to_ascii_uppercase().as_str() {
            "MATCH" => Keyword::Match,
            "OPTIONAL" => Keyword::Optional,
            "WHERE" => Keyword::Where,
            "RETURN" => Keyword::Return,
            "WITH" => Keyword::With,
            "CREATE" => Keyword::Create,
            "MERGE" => Keyword::Merge,
            "ON" => Keyword::On,
            "SET" => Keyword::Set,
            "REMOVE" => Keyword::Remove,
            "DELETE" => Keyword::Delete,
            "DETACH" => Keyword::Detach,
            "UNWIND" => Keyword::Unwind,
            "AS" => Keyword::As,
            "FOREACH" => Keyword::Foreach,
            "CALL" => Keyword::Call,
            "YIELD" => Keyword::Yield,
            "UNION" => Keyword::Union,
            "ALL" => Keyword::All,
            "DISTINCT" => Keyword::Distinct,
            "ORDER" => Keyword::Order,
            "BY" => Keyword::By,
            "ASC" | "ASCENDING" => Keyword::Asc,
            "DESC" | "DESCENDING" => Keyword::Desc,
            "SKIP" => Keyword::Skip,
            "LIMIT" => Keyword::Limit,
            "AND" => Keyword::And,
            "OR" => Keyword::Or,
            "XOR" => Keyword::Xor,
            "NOT" => Keyword::Not,
            "IN" => Keyword::In,
            "STARTS" => Keyword::Starts,
            "ENDS" => Keyword::Ends,
            "CONTAINS" => Keyword::Contains,
            "IS" => Keyword::Is,
            "NULL" => Keyword::Null,
            "TRUE" => Keyword::True,
            "FALSE" => Keyword::False,
            "CASE" => Keyword::Case,
            "WHEN" => Keyword::When,
            "THEN" => Keyword::Then,
            "ELSE" => Keyword::Else,
            "END" => Keyword::End,
            "EXPLAIN" => Keyword::Explain,
            "INDEX" => Keyword::Index,
            "DROP" => Keyword::Drop,
            _ => return None,
        };
        Some(kw)
    }
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", format!("{:?}", self).to_ascii_uppercase())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Keyword, with the spelling used in the source
    Keyword(Keyword, String),
    Ident(String),
    Integer(i64),
    Float(f64),
    Str(String),
    Param(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Semicolon,
    Dot,
    DotDot,
    Pipe,
    Plus,
    PlusEq,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    RegexMatch,
    /// `->`
    ArrowRight,
    /// `<-`
    ArrowLeft,
    /// `<->`
    ArrowBoth,
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TokenKind::Keyword(kw, _) => write!(f, "{}", kw),
            TokenKind::Ident(name) => write!(f, "identifier '{}'", name),
            TokenKind::Integer(i) => write!(f, "integer {}", i),
            TokenKind::Float(x) => write!(f, "float {}", x),
            TokenKind::Str(s) => write!(f, "string {:?}", s),
            TokenKind::Param(p) => write!(f, "parameter ${}", p),
            TokenKind::Eof => write!(f, "end of input"),
            other => {
                let sym = match other {
                    TokenKind::LParen => "(",
                    TokenKind::RParen => ")",
                    TokenKind::LBracket => "[",
                    TokenKind::RBracket => "]",
                    TokenKind::LBrace => "{",
                    TokenKind::RBrace => "}",
                    TokenKind::Comma => ",",
                    TokenKind::Colon => ":",
                    TokenKind::Semicolon => ";",
                    TokenKind::Dot => ".",
                    TokenKind::DotDot => "..",
                    TokenKind::Pipe => "|",
                    TokenKind::Plus => "+",
                    TokenKind::PlusEq => "+=",
                    TokenKind::Minus => "-",
                    TokenKind::Star => "*",
                    TokenKind::Slash => "/",
                    TokenKind::Percent => "%",
                    TokenKind::Caret => "^",
                    TokenKind::Eq => "=",
                    TokenKind::Neq => "<>",
                    TokenKind::Lt => "<",
                    TokenKind::Le => "<=",
                    TokenKind::Gt => ">",
                    TokenKind::Ge => ">=",
                    TokenKind::RegexMatch => "=~",
                    TokenKind::ArrowRight => "->",
                    TokenKind::ArrowLeft => "<-",
                    TokenKind::ArrowBoth => "<->",
                    _ => "?",
                };
                write!(f, "'{}'", sym)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte offset of the first character
    pub offset: usize,
    /// Byte offset just past the last character
    pub end: usize,
}

struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

/// Split `src` into tokens, ending with [`TokenKind::Eof`]
pub fn tokenize(src: &str) -> LexResult<Vec<Token>> {
    let mut lexer = Lexer {
        src,
        bytes: src.as_bytes(),
        pos: 0,
    };
    let mut tokens = Vec::new();
    loop {
        lexer.skip_trivia()?;
        let start = lexer.pos;
        let Some(c) = lexer.peek_char() else {
            tokens.push(Token {
                kind: TokenKind::Eof,
                offset: start,
                end: start,
            });
            return Ok(tokens);
        };
        let kind = lexer.token(c)?;
        tokens.push(Token {
            kind,
            offset: start,
            end: lexer.pos,
        });
    }
}

impl<'a> Lexer<'a> {
    fn peek_char(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn byte_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn skip_trivia(&mut self) -> LexResult<()> {
        loop {
            match (self.byte_at(0), self.byte_at(1)) {
                (Some(b), _) if b.is_ascii_whitespace() => self.pos += 1,
                (Some(b'/'), Some(b'/')) => {
                    while let Some(b) = self.byte_at(0) {
                        if b == b'\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                (Some(b'/'), Some(b'*')) => {
                    let start = self.pos;
                    self.pos += 2;
                    loop {
                        match (self.byte_at(0), self.byte_at(1)) {
                            (Some(b'*'), Some(b'/')) => {
                                self.pos += 2;
                                break;
                            }
                            (Some(_), _) => self.pos += 1,
                            (None, _) => return Err(LexError::UnterminatedComment(start)),
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn token(&mut self, c: char) -> LexResult<TokenKind> {
        let start = self.pos;
        let next = self.byte_at(1);
        let (kind, width) = match c {
            '(' => (TokenKind::LParen, 1),
            ')' => (TokenKind::RParen, 1),
            '[' => (TokenKind::LBracket, 1),
            ']' => (TokenKind::RBracket, 1),
            '{' => (TokenKind::LBrace, 1),
            '}' => (TokenKind::RBrace, 1),
            ',' => (TokenKind::Comma, 1),
            ':' => (TokenKind::Colon, 1),
            ';' => (TokenKind::Semicolon, 1),
            '|' => (TokenKind::Pipe, 1),
            '*' => (TokenKind::Star, 1),
            '/' => (TokenKind::Slash, 1),
            '%' => (TokenKind::Percent, 1),
            '^' => (TokenKind::Caret, 1),
            '.' if next == Some(b'.') => (TokenKind::DotDot, 2),
            '.' => (TokenKind::Dot, 1),
            '+' if next == Some(b'=') => (TokenKind::PlusEq, 2),
            '+' => (TokenKind::Plus, 1),
            '-' if next == Some(b'>') => (TokenKind::ArrowRight, 2),
            '-' => (TokenKind::Minus, 1),
            '=' if next == Some(b'~') => (TokenKind::RegexMatch, 2),
            '=' => (TokenKind::Eq, 1),
            '!' if next == Some(b'=') => (TokenKind::Neq, 2),
            '<' => match (next, self.byte_at(2)) {
                (Some(b'-'), Some(b'>')) => (TokenKind::ArrowBoth, 3),
                (Some(b'-'), _) => (TokenKind::ArrowLeft, 2),
                (Some(b'>'), _) => (TokenKind::Neq, 2),
                (Some(b'='), _) => (TokenKind::Le, 2),
                _ => (TokenKind::Lt, 1),
            },
            '>' if next == Some(b'=') => (TokenKind::Ge, 2),
            '>' => (TokenKind::Gt, 1),
            '\'' | '"' => return self.string(c as u8),
            '`' => return self.quoted_ident(),
            '$' => {
                self.pos += 1;
                let name = self.word();
                if name.is_empty() {
                    return Err(LexError::UnexpectedChar { ch: '$', offset: start });
                }
                return Ok(TokenKind::Param(name.to_string()));
            }
            c if c.is_ascii_digit() => return self.number(),
            c if c.is_alphabetic() || c == '_' => {
                let word = self.word();
                return Ok(match Keyword::lookup(word) {
                    Some(kw) => TokenKind::Keyword(kw, word.to_string()),
                    None => TokenKind::Ident(word.to_string()),
                });
            }
            other => return Err(LexError::UnexpectedChar { ch: other, offset: start }),
        };
        self.pos += width;
        Ok(kind)
    }

    fn word(&mut self) -> &'a str {
        let start = self.pos;
        let rest = &self.src[start..];
        let len = rest
            .char_indices()
            .find(|(_, c)| !(c.is_alphanumeric() || *c == '_'))
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        self.pos += len;
        &self.src[start..start + len]
    }

    fn number(&mut self) -> LexResult<TokenKind> {
        let start = self.pos;
        let digits = |lexer: &mut Self| {
            while lexer.byte_at(0).map(|b| b.is_ascii_digit()).unwrap_or(false) {
                lexer.pos += 1;
            }
        };
        digits(self);
        let mut is_float = false;
        // `1..3` is a range, not a float
        if self.byte_at(0) == Some(b'.') && self.byte_at(1).map(|b| b.is_ascii_digit()).unwrap_or(false) {
            is_float = true;
            self.pos += 1;
            digits(self);
        }
        if matches!(self.byte_at(0), Some(b'e') | Some(b'E')) {
            let sign = matches!(self.byte_at(1), Some(b'+') | Some(b'-'));
            let digit_at = if sign { 2 } else { 1 };
            if self.byte_at(digit_at).map(|b| b.is_ascii_digit()).unwrap_or(false) {
                is_float = true;
                self.pos += digit_at;
                digits(self);
            }
        }
        if self.peek_char().map(|c| c.is_alphabetic() || c == '_').unwrap_or(false) {
            self.word();
            return Err(LexError::InvalidNumber {
                text: self.src[start..self.pos].to_string(),
                offset: start,
            });
        }
        let src = self.src;
        let text = &src[start..self.pos];
        let invalid = || LexError::InvalidNumber {
            text: text.to_string(),
            offset: start,
        };
        if is_float {
            text.parse::<f64>().map(TokenKind::Float).map_err(|_| invalid())
        } else {
            match text.parse::<i64>() {
                Ok(i) => Ok(TokenKind::Integer(i)),
                // 2^63 only fits negated; the parser accepts it after a unary minus
                Err(_) if text.parse::<u64>().ok() == Some(i64::MIN.unsigned_abs()) => {
                    Ok(TokenKind::Integer(i64::MIN))
                }
                Err(_) => Err(invalid()),
            }
        }
    }

    fn string(&mut self, quote: u8) -> LexResult<TokenKind> {
        let start = self.pos;
        self.pos += 1;
        let mut out = String::new();
        loop {
            let Some(c) = self.peek_char() else {
                return Err(LexError::UnterminatedString(start));
            };
            let at = self.pos;
            self.pos += c.len_utf8();
            if c as u32 == quote as u32 {
                return Ok(TokenKind::Str(out));
            }
            if c != '\\' {
                out.push(c);
                continue;
            }
            let Some(esc) = self.peek_char() else {
                return Err(LexError::UnterminatedString(start));
            };
            self.pos += esc.len_utf8();
            match esc {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                'b' => out.push('\u{8}'),
                'f' => out.push('\u{c}'),
                '0' => out.push('\0'),
                '\\' => out.push('\\'),
                '\'' => out.push('\''),
                '"' => out.push('"'),
                'u' => {
                    let hex = self.src.get(self.pos..self.pos + 4).ok_or(LexError::InvalidEscape(at))?;
                    let code = u32::from_str_radix(hex, 16).map_err(|_| LexError::InvalidEscape(at))?;
                    let ch = char::from_u32(code).ok_or(LexError::InvalidEscape(at))?;
                    out.push(ch);
                    self.pos += 4;
                }
                _ => return Err(LexError::InvalidEscape(at)),
            }
        }
    }

    fn quoted_ident(&mut self) -> LexResult<TokenKind> {
        let start = self.pos;
        self.pos += 1;
        let mut out = String::new();
        loop {
            let Some(c) = self.peek_char() else {
                return Err(LexError::UnterminatedIdentifier(start));
            };
            self.pos += c.len_utf8();
            if c == '`' {
                // a doubled backquote is a literal backquote
                if self.byte_at(0) == Some(b'`') {
                    self.pos += 1;
                    out.push('`');
                    continue;
                }
                return Ok(TokenKind::Ident(out));
            }
            out.push(c);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_keywords_are_case_insensitive() {
        let toks = kinds("match (n) ReTuRn n");
        assert!(matches!(toks[0], TokenKind::Keyword(Keyword::Match, _)));
        assert!(matches!(toks[4], TokenKind::Keyword(Keyword::Return, _)));
        assert_eq!(toks.last(), Some(&TokenKind::Eof));
    }

    #[test]
    fn test_arrows_and_ranges() {
        assert_eq!(
            kinds("-[*1..3]->"),
            vec![
                TokenKind::Minus,
                TokenKind::LBracket,
                TokenKind::Star,
                TokenKind::Integer(1),
                TokenKind::DotDot,
                TokenKind::Integer(3),
                TokenKind::RBracket,
                TokenKind::ArrowRight,
                TokenKind::Eof
            ]
        );
        assert_eq!(kinds("<-")[0], TokenKind::ArrowLeft);
        assert_eq!(kinds("<->")[0], TokenKind::ArrowBoth);
        assert_eq!(kinds("<-->")[..2], [TokenKind::ArrowLeft, TokenKind::ArrowRight]);
        assert_eq!(kinds("<>")[0], TokenKind::Neq);
        assert_eq!(kinds("=~")[0], TokenKind::RegexMatch);
    }

    #[test]
    fn test_literals() {
        assert_eq!(
            kinds(r#"42 3.5 1e3 'it\'s' "tab\there" "é" $name `weird name`"#),
            vec![
                TokenKind::Integer(42),
                TokenKind::Float(3.5),
                TokenKind::Float(1000.0),
                TokenKind::Str("it's".to_string()),
                TokenKind::Str("tab\there".to_string()),
                TokenKind::Str("é".to_string()),
                TokenKind::Param("name".to_string()),
                TokenKind::Ident("weird name".to_string()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            kinds("RETURN // trailing\n 1 /* block\n comment */ + 2"),
            kinds("RETURN 1 + 2")
        );
    }

    #[test]
    fn test_offsets() {
        let toks = tokenize("MATCH  (abc)").unwrap();
        assert_eq!((toks[1].offset, toks[1].end), (7, 8));
        assert_eq!((toks[2].offset, toks[2].end), (8, 11));
    }

    #[test]
    fn test_errors_carry_offsets() {
        assert_eq!(tokenize("RETURN 'abc").unwrap_err(), LexError::UnterminatedString(7));
        assert_eq!(
            tokenize("RETURN 1 # 2").unwrap_err(),
            LexError::UnexpectedChar { ch: '#', offset: 9 }
        );
        assert_eq!(tokenize("/* open").unwrap_err().offset(), 0);
        assert!(matches!(tokenize("'\\q'"), Err(LexError::InvalidEscape(1))));
        assert!(matches!(tokenize("12abc"), Err(LexError::InvalidNumber { .. })));
        assert!(matches!(tokenize("99999999999999999999"), Err(LexError::InvalidNumber { .. })));
        assert!(matches!(tokenize("9223372036854775809"), Err(LexError::InvalidNumber { .. })));
    }

    #[test]
    fn test_largest_magnitude_integer() {
        assert_eq!(
            kinds("-9223372036854775808"),
            vec![TokenKind::Minus, TokenKind::Integer(i64::MIN), TokenKind::Eof]
        );
    }
}
