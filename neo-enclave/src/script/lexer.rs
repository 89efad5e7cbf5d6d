//! Tokenizer for the script language.

use crate::error::{ExecutionError, ExecutionResult};

const KEYWORDS: &[&str] = &[
    "function", "return", "let", "const", "var", "if", "else", "while", "for", "of", "break",
    "continue", "throw", "true", "false", "null", "undefined", "typeof",
];

// Longest first so that greedy matching picks `===` over `==`.
const PUNCTUATORS: &[&str] = &[
    "===", "!==", "==", "!=", "<=", ">=", "&&", "||", "??", "+=", "-=", "*=", "/=", "%=", "++",
    "--", "{", "}", "(", ")", "[", "]", ";", ",", ".", "?", ":", "<", ">", "+", "-", "*", "/",
    "%", "!", "=",
];

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Number(f64),
    String(String),
    Identifier(String),
    Keyword(&'static str),
    Punct(&'static str),
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub column: usize,
}

pub struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    source: &'a str,
    offset: usize,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
            source,
            offset: 0,
            line: 1,
            column: 1,
        }
    }

    /// Tokenize the whole source. The last token is always [`TokenKind::Eof`].
    pub fn tokenize(mut self) -> ExecutionResult<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia()?;
            let (line, column) = (self.line, self.column);
            let Some(&c) = self.chars.peek() else {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    line,
                    column,
                });
                return Ok(tokens);
            };

            let kind = if c.is_ascii_digit()
                || (c == '.' && self.rest().chars().nth(1).is_some_and(|d| d.is_ascii_digit()))
            {
                self.number(line, column)?
            } else if c == '"' || c == '\'' {
                self.string(c, line, column)?
            } else if is_ident_start(c) {
                let word = self.take_while(is_ident_part);
                match KEYWORDS.iter().find(|k| **k == word) {
                    Some(keyword) => TokenKind::Keyword(keyword),
                    None => TokenKind::Identifier(word),
                }
            } else {
                self.punctuator(line, column)?
            };
            tokens.push(Token { kind, line, column });
        }
    }

    fn rest(&self) -> &'a str {
        &self.source[self.offset..]
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        self.offset += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> String {
        let mut out = String::new();
        while let Some(&c) = self.chars.peek() {
            if !pred(c) {
                break;
            }
            out.push(c);
            self.bump();
        }
        out
    }

    fn skip_trivia(&mut self) -> ExecutionResult<()> {
        loop {
            let rest = self.rest();
            if rest.starts_with("//") {
                while let Some(c) = self.bump() {
                    if c == '\n' {
                        break;
                    }
                }
            } else if rest.starts_with("/*") {
                let (line, column) = (self.line, self.column);
                self.bump();
                self.bump();
                loop {
                    if self.rest().starts_with("*/") {
                        self.bump();
                        self.bump();
                        break;
                    }
                    if self.bump().is_none() {
                        return Err(syntax("unterminated comment", line, column));
                    }
                }
            } else if self.chars.peek().is_some_and(|c| c.is_whitespace()) {
                self.bump();
            } else {
                return Ok(());
            }
        }
    }

    fn number(&mut self, line: usize, column: usize) -> ExecutionResult<TokenKind> {
        let rest = self.rest();
        if rest.starts_with("0x") || rest.starts_with("0X") {
            self.bump();
            self.bump();
            let digits = self.take_while(|c| c.is_ascii_hexdigit());
            return u64::from_str_radix(&digits, 16)
                .map(|n| TokenKind::Number(n as f64))
                .map_err(|_| syntax("invalid hex literal", line, column));
        }

        let mut text = self.take_while(|c| c.is_ascii_digit());
        if self.chars.peek() == Some(&'.') {
            self.bump();
            text.push('.');
            text.push_str(&self.take_while(|c| c.is_ascii_digit()));
        }
        if matches!(self.chars.peek(), Some('e') | Some('E')) {
            self.bump();
            text.push('e');
            if let Some(&sign) = self.chars.peek().filter(|c| **c == '+' || **c == '-') {
                self.bump();
                text.push(sign);
            }
            text.push_str(&self.take_while(|c| c.is_ascii_digit()));
        }
        if self.chars.peek().is_some_and(|c| is_ident_start(*c)) {
            return Err(syntax("identifier directly after number", line, column));
        }
        text.parse::<f64>()
            .map(TokenKind::Number)
            .map_err(|_| syntax("invalid number literal", line, column))
    }

    fn string(&mut self, quote: char, line: usize, column: usize) -> ExecutionResult<TokenKind> {
        self.bump();
        let mut out = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => return Err(syntax("unterminated string", line, column)),
                Some(c) if c == quote => return Ok(TokenKind::String(out)),
                Some('\\') => {
                    let escaped = match self.bump() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('r') => '\r',
                        Some('0') => '\0',
                        Some('b') => '\u{8}',
                        Some('f') => '\u{c}',
                        Some('v') => '\u{b}',
                        Some('u') => self.unicode_escape(line, column)?,
                        Some('\n') => continue,
                        Some(other) => other,
                        None => return Err(syntax("unterminated string", line, column)),
                    };
                    out.push(escaped);
                }
                Some(c) => out.push(c),
            }
        }
    }

    fn unicode_escape(&mut self, line: usize, column: usize) -> ExecutionResult<char> {
        let mut digits = String::with_capacity(4);
        for _ in 0..4 {
            match self.bump() {
                Some(c) if c.is_ascii_hexdigit() => digits.push(c),
                _ => return Err(syntax("invalid unicode escape", line, column)),
            }
        }
        u32::from_str_radix(&digits, 16)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| syntax("invalid unicode escape", line, column))
    }

    fn punctuator(&mut self, line: usize, column: usize) -> ExecutionResult<TokenKind> {
        let rest = self.rest();
        let Some(punct) = PUNCTUATORS.iter().find(|p| rest.starts_with(**p)) else {
            let c = rest.chars().next().unwrap_or(' ');
            return Err(syntax(format!("unexpected character '{}'", c), line, column));
        };
        for _ in 0..punct.len() {
            self.bump();
        }
        Ok(TokenKind::Punct(punct))
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

fn is_ident_part(c: char) -> bool {
    is_ident_start(c) || c.is_ascii_digit()
}

pub(crate) fn syntax(message: impl Into<String>, line: usize, column: usize) -> ExecutionError {
    ExecutionError::Syntax {
        message: message.into(),
        line,
        column,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Lexer::new(source)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_tokens() {
        assert_eq!(
            kinds("let x = a.b === 1.5e2; // done"),
            vec![
                TokenKind::Keyword("let"),
                TokenKind::Identifier("x".into()),
                TokenKind::Punct("="),
                TokenKind::Identifier("a".into()),
                TokenKind::Punct("."),
                TokenKind::Identifier("b".into()),
                TokenKind::Punct("==="),
                TokenKind::Number(150.0),
                TokenKind::Punct(";"),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds(r#"'a\'b' "A\n""#),
            vec![
                TokenKind::String("a'b".into()),
                TokenKind::String("A\n".into()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_positions() {
        let tokens = Lexer::new("a\n  /* c */ b").tokenize().unwrap();
        assert_eq!((tokens[1].line, tokens[1].column), (2, 11));
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            Lexer::new("'open").tokenize(),
            Err(ExecutionError::Syntax { line: 1, column: 1, .. })
        ));
        assert!(Lexer::new("a # b").tokenize().is_err());
        assert!(Lexer::new("/* never closed").tokenize().is_err());
        assert!(Lexer::new("12abc").tokenize().is_err());
    }

    #[test]
    fn test_hex_and_leading_dot() {
        assert_eq!(
            kinds("0xff .5"),
            vec![TokenKind::Number(255.0), TokenKind::Number(0.5), TokenKind::Eof]
        );
    }
}
