//! Lexer for the Vesper scripting language.

mod lexer;
mod token;

pub use lexer::{tokenize, LexError, Lexer, LexerState};
pub use token::{keyword_or_ident, Pos, Token, TokenKind};
