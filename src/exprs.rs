//! Boolean word expressions.
//!
//! Tests enable or disable themselves with small boolean expressions over
//! words: keyword expressions (`"fast and not fail"`), platform enable
//! expressions (`"Linux or Darwin"`), option expressions (`"dbg"`), and
//! dependency result expressions (`"pass or diff"`). An expression is
//! parsed once and evaluated many times against a caller-supplied word
//! predicate.
//!
//! Grammar: `expr := or`, `or := and ("or" and)*`,
//! `and := unary ("and" unary)*`, `unary := "not" unary | "(" expr ")" |
//! word`. Words containing `*` or `?` match as shell globs.

use std::fmt;

use globset::{Glob, GlobMatcher};
use thiserror::Error;

/// Errors produced while parsing a word expression.
#[derive(Debug, Error)]
pub enum ExprError {
    #[error("empty expression")]
    Empty,

    #[error("unbalanced parentheses in expression: {0}")]
    Unbalanced(String),

    #[error("unexpected token {token:?} in expression: {expr}")]
    UnexpectedToken { token: String, expr: String },

    #[error("invalid wildcard word {word:?}: {source}")]
    BadWildcard {
        word: String,
        source: globset::Error,
    },
}

#[derive(Debug, Clone)]
enum Node {
    Word(String),
    Wildcard(String, GlobMatcher),
    Not(Box<Node>),
    And(Vec<Node>),
    Or(Vec<Node>),
}

/// A parsed boolean expression over words.
///
/// # Example
///
/// ```
/// use gantry::exprs::WordExpression;
///
/// let wx = WordExpression::parse("fast and not ( fail or diff )").unwrap();
/// let keywords = ["fast", "3d"];
/// assert!(wx.evaluate(|w| keywords.contains(&w)));
/// ```
#[derive(Debug, Clone)]
pub struct WordExpression {
    source: String,
    root: Node,
}

impl WordExpression {
    /// Parses an expression string. The empty string is rejected; callers
    /// represent "no expression" as `Option::None`.
    pub fn parse(expr: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(expr);
        if tokens.is_empty() {
            return Err(ExprError::Empty);
        }
        let mut pos = 0;
        let root = parse_or(&tokens, &mut pos, expr)?;
        if pos != tokens.len() {
            return Err(ExprError::UnexpectedToken {
                token: tokens[pos].clone(),
                expr: expr.to_string(),
            });
        }
        Ok(Self {
            source: expr.to_string(),
            root,
        })
    }

    /// Evaluates the expression; `word_true` decides each word. Wildcard
    /// words are passed to the predicate as their pattern text; use
    /// [`WordExpression::evaluate_tokens`] when glob matching against a
    /// token set is wanted.
    pub fn evaluate<F>(&self, word_true: F) -> bool
    where
        F: Fn(&str) -> bool,
    {
        eval_node(&self.root, &|node| match node {
            Node::Word(w) => word_true(w),
            Node::Wildcard(pat, _) => word_true(pat),
            _ => unreachable!(),
        })
    }

    /// Evaluates against a token set: a plain word is true when present in
    /// `tokens`; a wildcard word is true when it glob-matches any token.
    pub fn evaluate_tokens(&self, tokens: &[&str]) -> bool {
        eval_node(&self.root, &|node| match node {
            Node::Word(w) => tokens.iter().any(|t| t == w),
            Node::Wildcard(_, matcher) => tokens.iter().any(|t| matcher.is_match(t)),
            _ => unreachable!(),
        })
    }

    /// The original expression text.
    pub fn source(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for WordExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn eval_node(node: &Node, leaf: &dyn Fn(&Node) -> bool) -> bool {
    match node {
        Node::Word(_) | Node::Wildcard(..) => leaf(node),
        Node::Not(inner) => !eval_node(inner, leaf),
        Node::And(kids) => kids.iter().all(|k| eval_node(k, leaf)),
        Node::Or(kids) => kids.iter().any(|k| eval_node(k, leaf)),
    }
}

fn tokenize(expr: &str) -> Vec<String> {
    let spaced = expr.replace('(', " ( ").replace(')', " ) ");
    spaced.split_whitespace().map(|s| s.to_string()).collect()
}

fn parse_or(tokens: &[String], pos: &mut usize, expr: &str) -> Result<Node, ExprError> {
    let mut kids = vec![parse_and(tokens, pos, expr)?];
    while *pos < tokens.len() && tokens[*pos] == "or" {
        *pos += 1;
        kids.push(parse_and(tokens, pos, expr)?);
    }
    Ok(if kids.len() == 1 {
        kids.pop().unwrap()
    } else {
        Node::Or(kids)
    })
}

fn parse_and(tokens: &[String], pos: &mut usize, expr: &str) -> Result<Node, ExprError> {
    let mut kids = vec![parse_unary(tokens, pos, expr)?];
    while *pos < tokens.len() && tokens[*pos] == "and" {
        *pos += 1;
        kids.push(parse_unary(tokens, pos, expr)?);
    }
    Ok(if kids.len() == 1 {
        kids.pop().unwrap()
    } else {
        Node::And(kids)
    })
}

fn parse_unary(tokens: &[String], pos: &mut usize, expr: &str) -> Result<Node, ExprError> {
    if *pos >= tokens.len() {
        return Err(ExprError::Unbalanced(expr.to_string()));
    }
    let tok = tokens[*pos].as_str();
    match tok {
        "not" => {
            *pos += 1;
            Ok(Node::Not(Box::new(parse_unary(tokens, pos, expr)?)))
        }
        "(" => {
            *pos += 1;
            let inner = parse_or(tokens, pos, expr)?;
            if *pos >= tokens.len() || tokens[*pos] != ")" {
                return Err(ExprError::Unbalanced(expr.to_string()));
            }
            *pos += 1;
            Ok(inner)
        }
        ")" | "and" | "or" => Err(ExprError::UnexpectedToken {
            token: tok.to_string(),
            expr: expr.to_string(),
        }),
        word => {
            *pos += 1;
            if word.contains('*') || word.contains('?') {
                let matcher = Glob::new(word)
                    .map_err(|source| ExprError::BadWildcard {
                        word: word.to_string(),
                        source,
                    })?
                    .compile_matcher();
                Ok(Node::Wildcard(word.to_string(), matcher))
            } else {
                Ok(Node::Word(word.to_string()))
            }
        }
    }
}
