//! Pratt parser over the token stream.

use super::ast::{InfixOp, Node, PrefixOp, Program};
use super::lexer::{Lexer, Token};
use super::ExprError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    Lowest,
    Or,
    And,
    Equals,
    LessGreater,
    Sum,
    Product,
    Prefix,
    Call,
}

fn precedence_of(token: &Token) -> Precedence {
    match token {
        Token::Or => Precedence::Or,
        Token::And => Precedence::And,
        Token::Eq | Token::NotEq => Precedence::Equals,
        Token::Lt | Token::Gt => Precedence::LessGreater,
        Token::Plus | Token::Minus => Precedence::Sum,
        Token::Star | Token::Slash => Precedence::Product,
        Token::LParen => Precedence::Call,
        _ => Precedence::Lowest,
    }
}

fn infix_op(token: &Token) -> Option<InfixOp> {
    Some(match token {
        Token::Plus => InfixOp::Add,
        Token::Minus => InfixOp::Sub,
        Token::Star => InfixOp::Mul,
        Token::Slash => InfixOp::Div,
        Token::Lt => InfixOp::Lt,
        Token::Gt => InfixOp::Gt,
        Token::Eq => InfixOp::Eq,
        Token::NotEq => InfixOp::NotEq,
        Token::And => InfixOp::And,
        Token::Or => InfixOp::Or,
        _ => return None,
    })
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(src: &str) -> Self {
        Self {
            tokens: Lexer::new(src).tokenize(),
            pos: 0,
        }
    }

    pub fn parse_program(mut self, src: &str) -> Result<Program, ExprError> {
        if self.current() == &Token::Eof {
            return Err(ExprError::Parse("empty expression".into()));
        }
        let root = self.parse_expression(Precedence::Lowest)?;
        self.advance();
        if self.current() != &Token::Eof {
            return Err(ExprError::Parse(format!(
                "unexpected {} after expression",
                self.current()
            )));
        }
        Ok(Program {
            source: src.to_string(),
            root,
        })
    }

    fn current(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos + 1).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
    }

    fn expect_peek(&mut self, expected: Token) -> Result<(), ExprError> {
        if *self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(ExprError::Parse(format!(
                "expected {expected}, got {}",
                self.peek()
            )))
        }
    }

    /// Parse starting at the current token; on return the current token is
    /// the last one consumed by the expression.
    fn parse_expression(&mut self, precedence: Precedence) -> Result<Node, ExprError> {
        let mut left = self.parse_prefix()?;

        while *self.peek() != Token::Eof && precedence < precedence_of(self.peek()) {
            if *self.peek() == Token::LParen {
                let name = match left {
                    Node::Ident(name) => name,
                    other => {
                        return Err(ExprError::Parse(format!(
                            "only identifiers can be called, got {other}"
                        )))
                    }
                };
                self.advance();
                let args = self.parse_list(Token::RParen)?;
                left = Node::Call { name, args };
                continue;
            }

            let Some(op) = infix_op(self.peek()) else {
                return Ok(left);
            };
            self.advance();
            let prec = precedence_of(self.current());
            self.advance();
            let right = self.parse_expression(prec)?;
            left = Node::Infix {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_prefix(&mut self) -> Result<Node, ExprError> {
        let node = match self.current().clone() {
            Token::Int(i) => Node::Int(i),
            Token::Float(f) => Node::Float(f),
            Token::Str(s) => Node::Str(s),
            Token::True => Node::Bool(true),
            Token::False => Node::Bool(false),
            Token::Null => Node::Null,
            Token::Ident(name) => Node::Ident(name),
            Token::Bang | Token::Minus => {
                let op = if *self.current() == Token::Bang {
                    PrefixOp::Not
                } else {
                    PrefixOp::Neg
                };
                self.advance();
                let right = self.parse_expression(Precedence::Prefix)?;
                Node::Prefix {
                    op,
                    right: Box::new(right),
                }
            }
            Token::LParen => {
                self.advance();
                let inner = self.parse_expression(Precedence::Lowest)?;
                self.expect_peek(Token::RParen)?;
                inner
            }
            Token::LBracket => Node::Array(self.parse_list(Token::RBracket)?),
            Token::LBrace => self.parse_object()?,
            Token::Illegal(text) => {
                return Err(ExprError::Parse(format!("illegal token {text:?}")))
            }
            other => {
                return Err(ExprError::Parse(format!("unexpected {other}")));
            }
        };
        Ok(node)
    }

    /// Parse a comma separated list. The current token is the opening
    /// delimiter; on return it is `end`.
    fn parse_list(&mut self, end: Token) -> Result<Vec<Node>, ExprError> {
        let mut items = Vec::new();
        if *self.peek() == end {
            self.advance();
            return Ok(items);
        }
        self.advance();
        items.push(self.parse_expression(Precedence::Lowest)?);
        while *self.peek() == Token::Comma {
            self.advance();
            self.advance();
            items.push(self.parse_expression(Precedence::Lowest)?);
        }
        self.expect_peek(end)?;
        Ok(items)
    }

    fn parse_object(&mut self) -> Result<Node, ExprError> {
        let mut entries = Vec::new();
        while *self.peek() != Token::RBrace {
            self.advance();
            let key = match self.current() {
                Token::Str(s) | Token::Ident(s) => s.clone(),
                other => {
                    return Err(ExprError::Parse(format!("invalid object key {other}")))
                }
            };
            self.expect_peek(Token::Colon)?;
            self.advance();
            let value = self.parse_expression(Precedence::Lowest)?;
            entries.push((key, value));
            if *self.peek() != Token::RBrace {
                self.expect_peek(Token::Comma)?;
            }
        }
        self.advance();
        Ok(Node::Object(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Program {
        Parser::new(src).parse_program(src).unwrap()
    }

    #[test]
    fn test_precedence() {
        assert_eq!(parse("1+2*3").to_string(), "(1+(2*3))");
        assert_eq!(parse("a<b==c>d").to_string(), "((a<b)==(c>d))");
        assert_eq!(parse("a||b&&c").to_string(), "(a||(b&&c))");
        assert_eq!(parse("-a*b").to_string(), "((-a)*b)");
        assert_eq!(parse("!a==b").to_string(), "((!a)==b)");
    }

    #[test]
    fn test_grouping() {
        assert_eq!(parse("(1+2)*3").to_string(), "((1+2)*3)");
    }

    #[test]
    fn test_calls_and_literals() {
        assert_eq!(
            parse(r#"in(status_code,[200,201])"#).to_string(),
            r#"in(status_code,[200,201])"#
        );
        assert_eq!(
            parse(r#"equals(json_path("a.b"),{"k":1})"#).to_string(),
            r#"equals(json_path("a.b"),{"k":1})"#
        );
        assert_eq!(parse("f()").to_string(), "f()");
    }

    #[test]
    fn test_round_trip_without_whitespace() {
        let cases = [
            "status_code==200",
            "response_time<500&&response_size>10",
            r#"contains(body,"ok")"#,
            "not(equals(headers.Content-Type,\"text/html\"))",
            "p99(iteration_duration)<2.5",
        ];
        for src in cases {
            let printed = parse(src).to_string();
            let stripped: String = printed.chars().filter(|c| *c != '(' && *c != ')').collect();
            let expected: String = src.chars().filter(|c| *c != '(' && *c != ')').collect();
            assert_eq!(stripped, expected, "round trip of {src}");
        }
    }

    #[test]
    fn test_errors() {
        for src in ["", "1 +", "(1", "a b", "1(2)", "[1,", "a = b"] {
            assert!(
                matches!(Parser::new(src).parse_program(src), Err(ExprError::Parse(_))),
                "{src} should not parse"
            );
        }
    }
}
