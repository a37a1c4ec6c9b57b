//! Tokenizer for the assertion language.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,

    Bang,
    Minus,
    Plus,
    Star,
    Slash,
    Lt,
    Gt,
    Eq,
    NotEq,
    And,
    Or,

    Comma,
    Colon,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,

    Illegal(String),
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Int(i) => write!(f, "{i}"),
            Token::Float(v) => write!(f, "{v:?}"),
            Token::Str(s) => write!(f, "{s:?}"),
            Token::Ident(name) => f.write_str(name),
            Token::True => f.write_str("true"),
            Token::False => f.write_str("false"),
            Token::Null => f.write_str("null"),
            Token::Bang => f.write_str("!"),
            Token::Minus => f.write_str("-"),
            Token::Plus => f.write_str("+"),
            Token::Star => f.write_str("*"),
            Token::Slash => f.write_str("/"),
            Token::Lt => f.write_str("<"),
            Token::Gt => f.write_str(">"),
            Token::Eq => f.write_str("=="),
            Token::NotEq => f.write_str("!="),
            Token::And => f.write_str("&&"),
            Token::Or => f.write_str("||"),
            Token::Comma => f.write_str(","),
            Token::Colon => f.write_str(":"),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::LBracket => f.write_str("["),
            Token::RBracket => f.write_str("]"),
            Token::LBrace => f.write_str("{"),
            Token::RBrace => f.write_str("}"),
            Token::Illegal(s) => write!(f, "illegal token {s:?}"),
            Token::Eof => f.write_str("end of input"),
        }
    }
}

pub struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    src: &'a str,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self {
            chars: src.char_indices().peekable(),
            src,
        }
    }

    /// Tokenize the whole input; the last token is always [`Token::Eof`].
    pub fn tokenize(mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        loop {
            let tok = self.next_token();
            let done = tok == Token::Eof;
            tokens.push(tok);
            if done {
                return tokens;
            }
        }
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, c)| *c)
    }

    fn next_token(&mut self) -> Token {
        while self.peek_char().is_some_and(char::is_whitespace) {
            self.chars.next();
        }

        let Some((start, ch)) = self.chars.next() else {
            return Token::Eof;
        };

        match ch {
            '!' => self.with_eq(Token::NotEq, Token::Bang),
            '=' => self.with_eq(Token::Eq, Token::Illegal("=".into())),
            '&' => self.doubled('&', Token::And),
            '|' => self.doubled('|', Token::Or),
            '-' => Token::Minus,
            '+' => Token::Plus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '<' => Token::Lt,
            '>' => Token::Gt,
            ',' => Token::Comma,
            ':' => Token::Colon,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            '{' => Token::LBrace,
            '}' => Token::RBrace,
            '"' => self.read_string(),
            c if c.is_ascii_digit() => self.read_number(start),
            c if is_ident_start(c) => self.read_ident(start),
            other => Token::Illegal(other.to_string()),
        }
    }

    fn with_eq(&mut self, matched: Token, single: Token) -> Token {
        if self.peek_char() == Some('=') {
            self.chars.next();
            matched
        } else {
            single
        }
    }

    fn doubled(&mut self, expect: char, matched: Token) -> Token {
        if self.peek_char() == Some(expect) {
            self.chars.next();
            matched
        } else {
            Token::Illegal(expect.to_string())
        }
    }

    fn read_string(&mut self) -> Token {
        let mut out = String::new();
        while let Some((_, c)) = self.chars.next() {
            match c {
                '"' => return Token::Str(out),
                '\\' => match self.chars.next() {
                    Some((_, 'n')) => out.push('\n'),
                    Some((_, 't')) => out.push('\t'),
                    Some((_, 'r')) => out.push('\r'),
                    Some((_, other)) => out.push(other),
                    None => break,
                },
                other => out.push(other),
            }
        }
        Token::Illegal("unterminated string".into())
    }

    fn read_number(&mut self, start: usize) -> Token {
        let mut end = start + 1;
        let mut is_float = false;
        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                end += 1;
                self.chars.next();
            } else if c == '.' && !is_float {
                is_float = true;
                end += 1;
                self.chars.next();
            } else {
                break;
            }
        }
        let text = &self.src[start..end];
        if is_float {
            text.parse::<f64>()
                .map(Token::Float)
                .unwrap_or_else(|_| Token::Illegal(text.to_string()))
        } else {
            text.parse::<i64>()
                .map(Token::Int)
                .unwrap_or_else(|_| Token::Illegal(text.to_string()))
        }
    }

    /// Identifiers may carry dotted suffixes (`headers.Content-Type`,
    /// `cookies.sid.value`). A `-` is only part of the identifier once a
    /// dot has been seen, so `a-b` still lexes as a subtraction.
    fn read_ident(&mut self, start: usize) -> Token {
        let mut end = start + self.src[start..].chars().next().map_or(1, char::len_utf8);
        let mut dotted = false;
        while let Some(c) = self.peek_char() {
            let accept = is_ident_continue(c) || c == '.' || (c == '-' && dotted);
            if !accept {
                break;
            }
            if c == '.' {
                dotted = true;
            }
            end += c.len_utf8();
            self.chars.next();
        }
        match &self.src[start..end] {
            "true" => Token::True,
            "false" => Token::False,
            "null" => Token::Null,
            name => Token::Ident(name.to_string()),
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(src: &str) -> Vec<Token> {
        Lexer::new(src).tokenize()
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            lex("a == 1 && !b || c != 2.5"),
            vec![
                Token::Ident("a".into()),
                Token::Eq,
                Token::Int(1),
                Token::And,
                Token::Bang,
                Token::Ident("b".into()),
                Token::Or,
                Token::Ident("c".into()),
                Token::NotEq,
                Token::Float(2.5),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_dotted_identifiers_with_dash() {
        assert_eq!(
            lex("headers.Content-Type"),
            vec![Token::Ident("headers.Content-Type".into()), Token::Eof]
        );
        assert_eq!(
            lex("a-b"),
            vec![
                Token::Ident("a".into()),
                Token::Minus,
                Token::Ident("b".into()),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_strings_and_escapes() {
        assert_eq!(
            lex(r#""a\"b""#),
            vec![Token::Str("a\"b".into()), Token::Eof]
        );
        assert!(matches!(lex("\"open")[0], Token::Illegal(_)));
    }

    #[test]
    fn test_single_equals_is_illegal() {
        assert!(matches!(lex("a = b")[1], Token::Illegal(_)));
    }
}
