//! Syntax tree for the assertion language.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfixOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Gt,
    Eq,
    NotEq,
    And,
    Or,
}

impl InfixOp {
    pub fn symbol(self) -> &'static str {
        match self {
            InfixOp::Add => "+",
            InfixOp::Sub => "-",
            InfixOp::Mul => "*",
            InfixOp::Div => "/",
            InfixOp::Lt => "<",
            InfixOp::Gt => ">",
            InfixOp::Eq => "==",
            InfixOp::NotEq => "!=",
            InfixOp::And => "&&",
            InfixOp::Or => "||",
        }
    }
}

/// A node of the expression tree. The set of kinds is closed; evaluation
/// is a single `match`.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Null,
    Ident(String),
    Prefix {
        op: PrefixOp,
        right: Box<Node>,
    },
    Infix {
        op: InfixOp,
        left: Box<Node>,
        right: Box<Node>,
    },
    Call {
        name: String,
        args: Vec<Node>,
    },
    Array(Vec<Node>),
    Object(Vec<(String, Node)>),
}

/// Source form of a node. Infix and prefix expressions are wrapped in
/// parentheses so the grouping chosen by the parser is visible; no
/// whitespace is emitted.
impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Int(i) => write!(f, "{i}"),
            Node::Float(v) => write!(f, "{v:?}"),
            Node::Str(s) => write!(f, "{s:?}"),
            Node::Bool(b) => write!(f, "{b}"),
            Node::Null => f.write_str("null"),
            Node::Ident(name) => f.write_str(name),
            Node::Prefix { op, right } => match op {
                PrefixOp::Not => write!(f, "(!{right})"),
                PrefixOp::Neg => write!(f, "(-{right})"),
            },
            Node::Infix { op, left, right } => {
                write!(f, "({left}{}{right})", op.symbol())
            }
            Node::Call { name, args } => {
                write!(f, "{name}(")?;
                write_list(f, args)?;
                f.write_str(")")
            }
            Node::Array(items) => {
                f.write_str("[")?;
                write_list(f, items)?;
                f.write_str("]")
            }
            Node::Object(entries) => {
                f.write_str("{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{key:?}:{value}")?;
                }
                f.write_str("}")
            }
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, nodes: &[Node]) -> fmt::Result {
    for (i, node) in nodes.iter().enumerate() {
        if i > 0 {
            f.write_str(",")?;
        }
        write!(f, "{node}")?;
    }
    Ok(())
}

/// A parsed assertion: the top-level expression statement plus the text it
/// was parsed from.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub source: String,
    pub root: Node,
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root)
    }
}
