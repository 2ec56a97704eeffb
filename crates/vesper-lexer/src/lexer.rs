//! Tokenizer for Vesper source code.

use thiserror::Error;

use crate::token::{keyword_or_ident, Pos, Token, TokenKind};

/// Errors produced while tokenizing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LexError {
    #[error("invalid number literal \"{literal}\" at line {line}, column {column}")]
    BadNumber {
        literal: String,
        line: usize,
        column: usize,
    },

    #[error("unterminated string literal at line {line}, column {column}")]
    UnterminatedString { line: usize, column: usize },

    #[error("unterminated template literal at line {line}, column {column}")]
    UnterminatedTemplate { line: usize, column: usize },

    #[error("invalid escape sequence \\{ch} at line {line}, column {column}")]
    BadEscape {
        ch: char,
        line: usize,
        column: usize,
    },

    #[error("invalid hex escape sequence at line {line}, column {column}")]
    BadHexEscape { line: usize, column: usize },
}

/// Snapshot of scanner progress, used by the parser for backtracking.
#[derive(Debug, Clone)]
pub struct LexerState {
    at: usize,
    next: usize,
    ch: char,
    line: usize,
    column: isize,
    line_start: usize,
}

/// Scanner over a source string.
pub struct Lexer {
    source: String,
    chars: Vec<char>,
    at: usize,
    next: usize,
    ch: char,
    line: usize,
    column: isize,
    line_start: usize,
    token_start: Pos,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        let chars: Vec<char> = source.chars().collect();
        let mut lexer = Self {
            source: source.to_string(),
            chars,
            at: 0,
            next: 0,
            ch: '\0',
            line: 0,
            column: -1,
            line_start: 0,
            token_start: Pos::default(),
        };
        lexer.bump();
        lexer
    }

    /// Capture scanner state so the parser can rewind after speculation.
    pub fn save(&self) -> LexerState {
        LexerState {
            at: self.at,
            next: self.next,
            ch: self.ch,
            line: self.line,
            column: self.column,
            line_start: self.line_start,
        }
    }

    /// Rewind to a previously captured state.
    pub fn restore(&mut self, state: LexerState) {
        self.at = state.at;
        self.next = state.next;
        self.ch = state.ch;
        self.line = state.line;
        self.column = state.column;
        self.line_start = state.line_start;
    }

    fn here(&self) -> Pos {
        Pos::new(
            self.at,
            self.line_start,
            self.line,
            self.column.max(0) as usize,
        )
    }

    fn bump(&mut self) {
        self.ch = self.chars.get(self.next).copied().unwrap_or('\0');
        self.at = self.next;
        self.next += 1;
        self.column += 1;
    }

    fn peek(&self) -> char {
        self.chars.get(self.next).copied().unwrap_or('\0')
    }

    fn peek_at(&self, n: usize) -> char {
        self.chars.get(self.at + n).copied().unwrap_or('\0')
    }

    fn skip_blanks(&mut self) {
        while self.ch == ' ' || self.ch == '\t' {
            self.bump();
        }
    }

    fn skip_rest_of_line(&mut self) {
        while self.ch != '\n' && self.ch != '\0' {
            self.bump();
        }
    }

    fn record_newline(&mut self) {
        self.line += 1;
        self.column = -1;
        self.line_start = self.next;
    }

    fn begin_token(&mut self) {
        self.token_start = self.here();
    }

    fn finish(&self, kind: TokenKind, literal: String) -> Token {
        Token::new(kind, literal, self.token_start, self.here().advance(1))
    }

    /// Produce the next token.
    pub fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_blanks();

        // Shebang line at the very top of the file
        if self.line == 0 && self.at <= 1 && self.ch == '#' && self.peek() == '!' {
            self.skip_rest_of_line();
            self.skip_blanks();
        }

        // Comments
        while self.ch == '/' {
            if self.peek() == '/' {
                self.skip_rest_of_line();
                self.skip_blanks();
            } else if self.peek() == '*' {
                self.bump();
                self.bump();
                while !(self.ch == '*' && self.peek() == '/') && self.ch != '\0' {
                    if self.ch == '\n' {
                        self.record_newline();
                    }
                    self.bump();
                }
                if self.ch != '\0' {
                    self.bump();
                    self.bump();
                }
                self.skip_blanks();
            } else {
                break;
            }
        }

        self.begin_token();

        if self.ch == '\0' {
            return Ok(self.finish(TokenKind::Eof, String::new()));
        }

        if self.ch == '\n' {
            self.record_newline();
            self.bump();
            return Ok(self.finish(TokenKind::Newline, "\n".to_string()));
        }

        // \r\n collapses into a single newline token
        if self.ch == '\r' {
            self.bump();
            if self.ch == '\n' {
                self.record_newline();
                self.bump();
            }
            return Ok(self.finish(TokenKind::Newline, "\n".to_string()));
        }

        if self.ch == '"' || self.ch == '\'' {
            return self.scan_string(self.ch);
        }

        if self.ch == '`' {
            return self.scan_template();
        }

        if self.ch.is_ascii_digit() {
            return self.scan_number();
        }

        if is_ident_start(self.ch) {
            return Ok(self.scan_word());
        }

        if let Some(token) = self.scan_operator() {
            return Ok(token);
        }

        let ch = self.ch;
        self.bump();
        Ok(self.finish(TokenKind::Illegal, ch.to_string()))
    }

    fn scan_word(&mut self) -> Token {
        let start = self.at;
        while is_ident_start(self.ch) || self.ch.is_ascii_digit() {
            self.bump();
        }
        let literal: String = self.chars[start..self.at].iter().collect();
        let kind = keyword_or_ident(&literal);
        self.finish(kind, literal)
    }

    fn scan_number(&mut self) -> Result<Token, LexError> {
        let start = self.at;

        if self.ch == '0' {
            let marker = self.peek().to_ascii_lowercase();
            if marker == 'x' {
                self.bump();
                self.bump();
                while self.ch.is_ascii_hexdigit() {
                    self.bump();
                }
                let literal: String = self.chars[start..self.at].iter().collect();
                self.reject_trailing_letters(&literal)?;
                return Ok(self.finish(TokenKind::Int, literal));
            }
            if marker == 'b' {
                self.bump();
                self.bump();
                while self.ch == '0' || self.ch == '1' {
                    self.bump();
                }
                let literal: String = self.chars[start..self.at].iter().collect();
                self.reject_trailing_letters(&literal)?;
                return Ok(self.finish(TokenKind::Int, literal));
            }
            if marker.is_ascii_digit() {
                // Leading-zero octal
                self.bump();
                while is_octal(self.ch) {
                    self.bump();
                }
                let literal: String = self.chars[start..self.at].iter().collect();
                self.reject_trailing_letters(&literal)?;
                return Ok(self.finish(TokenKind::Int, literal));
            }
        }

        while self.ch.is_ascii_digit() {
            self.bump();
        }

        let mut is_float = false;
        if self.ch == '.' && self.peek().is_ascii_digit() {
            is_float = true;
            self.bump();
            while self.ch.is_ascii_digit() {
                self.bump();
            }
        }

        if self.ch == 'e' || self.ch == 'E' {
            is_float = true;
            self.bump();
            if self.ch == '+' || self.ch == '-' {
                self.bump();
            }
            while self.ch.is_ascii_digit() {
                self.bump();
            }
        }

        let literal: String = self.chars[start..self.at].iter().collect();
        self.reject_trailing_letters(&literal)?;
        let kind = if is_float {
            TokenKind::Float
        } else {
            TokenKind::Int
        };
        Ok(self.finish(kind, literal))
    }

    fn reject_trailing_letters(&self, literal: &str) -> Result<(), LexError> {
        if is_ident_start(self.ch) {
            return Err(LexError::BadNumber {
                literal: format!("{}{}", literal, self.ch),
                line: self.here().line_number(),
                column: self.here().column_number(),
            });
        }
        Ok(())
    }

    fn scan_string(&mut self, quote: char) -> Result<Token, LexError> {
        let mut text = Vec::new();
        self.bump();

        while self.ch != quote && self.ch != '\0' && self.ch != '\n' {
            if self.ch == '\\' {
                self.bump();
                text.push(self.scan_escape()?);
            } else {
                text.push(self.ch);
                self.bump();
            }
        }

        if self.ch != quote {
            return Err(LexError::UnterminatedString {
                line: self.here().line_number(),
                column: self.here().column_number(),
            });
        }

        self.bump();
        Ok(self.finish(TokenKind::Str, text.into_iter().collect()))
    }

    fn scan_escape(&mut self) -> Result<char, LexError> {
        let ch = self.ch;
        self.bump();
        match ch {
            'n' => Ok('\n'),
            'r' => Ok('\r'),
            't' => Ok('\t'),
            '\\' => Ok('\\'),
            '"' => Ok('"'),
            '\'' => Ok('\''),
            'a' => Ok('\x07'),
            'b' => Ok('\x08'),
            'f' => Ok('\x0C'),
            'v' => Ok('\x0B'),
            'e' => Ok('\x1B'),
            '0' | '1' | '2' | '3' => self.scan_octal_escape(ch),
            'x' => self.scan_hex_escape(2),
            'u' => self.scan_hex_escape(4),
            'U' => self.scan_hex_escape(8),
            other => Err(LexError::BadEscape {
                ch: other,
                line: self.here().line_number(),
                column: self.here().column_number(),
            }),
        }
    }

    fn scan_octal_escape(&mut self, first: char) -> Result<char, LexError> {
        let mut value = first.to_digit(8).unwrap_or(0);
        for _ in 0..2 {
            if !is_octal(self.ch) {
                break;
            }
            value = value * 8 + self.ch.to_digit(8).unwrap_or(0);
            self.bump();
        }
        Ok(char::from_u32(value).unwrap_or('\u{FFFD}'))
    }

    fn scan_hex_escape(&mut self, digits: usize) -> Result<char, LexError> {
        let mut hex = String::new();
        for _ in 0..digits {
            if !self.ch.is_ascii_hexdigit() {
                return Err(LexError::BadHexEscape {
                    line: self.here().line_number(),
                    column: self.here().column_number(),
                });
            }
            hex.push(self.ch);
            self.bump();
        }
        let value = u32::from_str_radix(&hex, 16).unwrap_or(0xFFFD);
        Ok(char::from_u32(value).unwrap_or('\u{FFFD}'))
    }

    /// Backtick templates keep their raw text; interpolation is split out
    /// by the parser.
    fn scan_template(&mut self) -> Result<Token, LexError> {
        let mut text = Vec::new();
        self.bump();

        while self.ch != '`' && self.ch != '\0' {
            if self.ch == '\n' {
                self.record_newline();
            }
            text.push(self.ch);
            self.bump();
        }

        if self.ch != '`' {
            return Err(LexError::UnterminatedTemplate {
                line: self.here().line_number(),
                column: self.here().column_number(),
            });
        }

        self.bump();
        Ok(self.finish(TokenKind::Template, text.into_iter().collect()))
    }

    fn scan_operator(&mut self) -> Option<Token> {
        let ch = self.ch;
        let next = self.peek();

        if ch == '.' && next == '.' && self.peek_at(2) == '.' {
            self.bump();
            self.bump();
            self.bump();
            return Some(self.finish(TokenKind::Ellipsis, "...".to_string()));
        }

        let pair = match (ch, next) {
            ('=', '=') => Some((TokenKind::EqEq, "==")),
            ('=', '>') => Some((TokenKind::Arrow, "=>")),
            ('!', '=') => Some((TokenKind::BangEq, "!=")),
            ('<', '=') => Some((TokenKind::Le, "<=")),
            ('<', '<') => Some((TokenKind::Shl, "<<")),
            ('>', '=') => Some((TokenKind::Ge, ">=")),
            ('>', '>') => Some((TokenKind::Shr, ">>")),
            ('&', '&') => Some((TokenKind::AmpAmp, "&&")),
            ('|', '|') => Some((TokenKind::PipePipe, "||")),
            ('|', '>') => Some((TokenKind::PipeGt, "|>")),
            ('+', '+') => Some((TokenKind::PlusPlus, "++")),
            ('+', '=') => Some((TokenKind::PlusEq, "+=")),
            ('-', '-') => Some((TokenKind::MinusMinus, "--")),
            ('-', '=') => Some((TokenKind::MinusEq, "-=")),
            ('*', '*') => Some((TokenKind::StarStar, "**")),
            ('*', '=') => Some((TokenKind::StarEq, "*=")),
            ('/', '=') => Some((TokenKind::SlashEq, "/=")),
            ('?', '?') => Some((TokenKind::QuestionQuestion, "??")),
            ('?', '.') => Some((TokenKind::QuestionDot, "?.")),
            _ => None,
        };
        if let Some((kind, literal)) = pair {
            self.bump();
            self.bump();
            return Some(self.finish(kind, literal.to_string()));
        }

        let single = match ch {
            '+' => Some(TokenKind::Plus),
            '-' => Some(TokenKind::Minus),
            '*' => Some(TokenKind::Star),
            '/' => Some(TokenKind::Slash),
            '%' => Some(TokenKind::Percent),
            '=' => Some(TokenKind::Eq),
            '!' => Some(TokenKind::Bang),
            '<' => Some(TokenKind::Lt),
            '>' => Some(TokenKind::Gt),
            '&' => Some(TokenKind::Amp),
            '|' => Some(TokenKind::Pipe),
            '^' => Some(TokenKind::Caret),
            '(' => Some(TokenKind::LParen),
            ')' => Some(TokenKind::RParen),
            '[' => Some(TokenKind::LBracket),
            ']' => Some(TokenKind::RBracket),
            '{' => Some(TokenKind::LBrace),
            '}' => Some(TokenKind::RBrace),
            ',' => Some(TokenKind::Comma),
            ';' => Some(TokenKind::Semicolon),
            ':' => Some(TokenKind::Colon),
            '.' => Some(TokenKind::Dot),
            '?' => Some(TokenKind::Question),
            _ => None,
        };
        if let Some(kind) = single {
            self.bump();
            return Some(self.finish(kind, ch.to_string()));
        }

        None
    }

    /// The text of the line containing `pos`, without its newline.
    pub fn line_text(&self, pos: &Pos) -> &str {
        let start = pos.line_start.min(self.source.len());
        let end = self.source[start..]
            .find('\n')
            .map(|i| start + i)
            .unwrap_or(self.source.len());
        &self.source[start..end]
    }
}

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}

fn is_octal(ch: char) -> bool {
    ('0'..='7').contains(&ch)
}

/// Tokenize an entire input, including the trailing EOF token.
pub fn tokenize(source: &str) -> Result<Vec<Token>, LexError> {
    let mut lexer = Lexer::new(source);
    let mut tokens = Vec::new();
    loop {
        let token = lexer.next_token()?;
        let done = token.kind == TokenKind::Eof;
        tokens.push(token);
        if done {
            return Ok(tokens);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).unwrap().iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(kinds(""), vec![TokenKind::Eof]);
    }

    #[test]
    fn test_identifiers_and_keywords() {
        let tokens = tokenize("let foo = _bar").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Let);
        assert_eq!(tokens[1].kind, TokenKind::Ident);
        assert_eq!(tokens[1].literal, "foo");
        assert_eq!(tokens[2].kind, TokenKind::Eq);
        assert_eq!(tokens[3].literal, "_bar");
    }

    #[test]
    fn test_numbers() {
        let tokens = tokenize("42 3.14 1e-5 0xFF 0b1010 0755").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Int);
        assert_eq!(tokens[1].kind, TokenKind::Float);
        assert_eq!(tokens[2].kind, TokenKind::Float);
        assert_eq!(tokens[3].kind, TokenKind::Int);
        assert_eq!(tokens[3].literal, "0xFF");
        assert_eq!(tokens[4].literal, "0b1010");
        assert_eq!(tokens[5].literal, "0755");
    }

    #[test]
    fn test_bad_number() {
        assert!(matches!(
            tokenize("123abc"),
            Err(LexError::BadNumber { .. })
        ));
    }

    #[test]
    fn test_strings_and_escapes() {
        let tokens = tokenize(r#""a\nb" 'c' "\x41B""#).unwrap();
        assert_eq!(tokens[0].literal, "a\nb");
        assert_eq!(tokens[1].literal, "c");
        assert_eq!(tokens[2].literal, "AB");
    }

    #[test]
    fn test_octal_escape() {
        let tokens = tokenize(r#""\101\102""#).unwrap();
        assert_eq!(tokens[0].literal, "AB");
    }

    #[test]
    fn test_unterminated_string() {
        assert!(matches!(
            tokenize("\"oops"),
            Err(LexError::UnterminatedString { .. })
        ));
    }

    #[test]
    fn test_bad_escape() {
        assert!(matches!(
            tokenize(r#""\z""#),
            Err(LexError::BadEscape { .. })
        ));
    }

    #[test]
    fn test_template_is_raw() {
        let tokens = tokenize(r"`a\nb`").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Template);
        assert_eq!(tokens[0].literal, r"a\nb");
    }

    #[test]
    fn test_template_multiline() {
        let tokens = tokenize("`x\ny` z").unwrap();
        assert_eq!(tokens[0].literal, "x\ny");
        assert_eq!(tokens[1].kind, TokenKind::Ident);
        assert_eq!(tokens[1].start.line, 1);
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            kinds("+ - * / % ** == != < > <= >= && || ! & | ^ << >>"),
            vec![
                TokenKind::Plus,
                TokenKind::Minus,
                TokenKind::Star,
                TokenKind::Slash,
                TokenKind::Percent,
                TokenKind::StarStar,
                TokenKind::EqEq,
                TokenKind::BangEq,
                TokenKind::Lt,
                TokenKind::Gt,
                TokenKind::Le,
                TokenKind::Ge,
                TokenKind::AmpAmp,
                TokenKind::PipePipe,
                TokenKind::Bang,
                TokenKind::Amp,
                TokenKind::Pipe,
                TokenKind::Caret,
                TokenKind::Shl,
                TokenKind::Shr,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_pipe_operator_distinct_from_bitwise_or() {
        assert_eq!(
            kinds("a |> f | g"),
            vec![
                TokenKind::Ident,
                TokenKind::PipeGt,
                TokenKind::Ident,
                TokenKind::Pipe,
                TokenKind::Ident,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_special_operators() {
        assert_eq!(
            kinds("=> ?? ?. ... ++ -- += -= *= /= ?"),
            vec![
                TokenKind::Arrow,
                TokenKind::QuestionQuestion,
                TokenKind::QuestionDot,
                TokenKind::Ellipsis,
                TokenKind::PlusPlus,
                TokenKind::MinusMinus,
                TokenKind::PlusEq,
                TokenKind::MinusEq,
                TokenKind::StarEq,
                TokenKind::SlashEq,
                TokenKind::Question,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_comments_and_shebang() {
        assert_eq!(
            kinds("#!/usr/bin/env vesper\nfoo // end of line\nbar /* block\n */ baz"),
            vec![
                TokenKind::Newline,
                TokenKind::Ident,
                TokenKind::Newline,
                TokenKind::Ident,
                TokenKind::Ident,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_newlines_and_crlf() {
        assert_eq!(
            kinds("a\r\nb\nc"),
            vec![
                TokenKind::Ident,
                TokenKind::Newline,
                TokenKind::Ident,
                TokenKind::Newline,
                TokenKind::Ident,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_position_tracking() {
        let tokens = tokenize("ab\ncd").unwrap();
        assert_eq!(tokens[0].start.line, 0);
        assert_eq!(tokens[0].start.column, 0);
        assert_eq!(tokens[2].start.line, 1);
        assert_eq!(tokens[2].start.column, 0);
        assert_eq!(tokens[2].start.line_start, 3);
    }

    #[test]
    fn test_save_restore() {
        let mut lexer = Lexer::new("one two three");
        assert_eq!(lexer.next_token().unwrap().literal, "one");
        let state = lexer.save();
        assert_eq!(lexer.next_token().unwrap().literal, "two");
        lexer.restore(state);
        assert_eq!(lexer.next_token().unwrap().literal, "two");
    }

    #[test]
    fn test_line_text() {
        let lexer = Lexer::new("first\nsecond line\nthird");
        let pos = Pos::new(8, 6, 1, 2);
        assert_eq!(lexer.line_text(&pos), "second line");
    }
}
