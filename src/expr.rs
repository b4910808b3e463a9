//! Tree-query expressions over template trees.
//!
//! The engine never walks template trees by ad-hoc string matching; every
//! `xpath` value, `xbytes`, `xmax`, `xtarget` and edit-rule `from` goes through
//! an [`Evaluator`]. [`PathEvaluator`] implements the XPath 1.0 subset that
//! templates use in practice:
//!
//! - location paths: `/`, `//`, `.`, `..`, `*`, names, `@attr`, `@*`,
//!   `text()`, `node()`, and explicit axes such as `following-sibling::item`
//! - predicates: `[2]`, `[@name]`, `[@name='len']`, `[last()]`
//! - literals, numbers, `+ - * div mod`, `= != < <= > >=`, `and`, `or`, `|`
//! - functions: `string`, `number`, `boolean`, `not`, `true`, `false`,
//!   `count`, `sum`, `concat`, `string-length`, `contains`, `starts-with`,
//!   `substring`, `normalize-space`, `position`, `last`, `name`, `floor`,
//!   `ceiling`, `round`
//!
//! Computed node state (`result`, `result-bytes`, `seq`, `repeat-id`) reads
//! like ordinary attributes.
//!
//! ## Examples
//!
//! ```rust
//! use binform::expr::{Evaluator, PathEvaluator};
//! use binform::tree::Template;
//!
//! let template = Template::parse("<f><item name='a'/><item name='b'/></f>").unwrap();
//! let eval = PathEvaluator::new();
//! let value = eval
//!     .evaluate(&template.tree, template.root.into(), "count(item) * 2")
//!     .unwrap();
//! assert_eq!(value, "4");
//! ```

use crate::error::{Error, Result};
use crate::tree::{NodeId, Tree};
use indexmap::IndexSet;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// A node an expression can select.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum NodeRef {
    /// The document containing the given root element.
    Document(NodeId),
    Element(NodeId),
    Attribute(NodeId, String),
    /// The text content of the given element.
    Text(NodeId),
}

impl From<NodeId> for NodeRef {
    fn from(id: NodeId) -> Self {
        NodeRef::Element(id)
    }
}

impl NodeRef {
    /// String value in the XPath sense.
    pub fn string_value(&self, tree: &Tree) -> String {
        match self {
            NodeRef::Document(id) | NodeRef::Element(id) => tree.string_value(*id),
            NodeRef::Attribute(id, name) => tree
                .attribute(*id, name)
                .map(|v| v.into_owned())
                .unwrap_or_default(),
            NodeRef::Text(id) => tree.text(*id).to_string(),
        }
    }

    fn element(&self) -> Option<NodeId> {
        match self {
            NodeRef::Element(id) => Some(*id),
            _ => None,
        }
    }
}

/// Expression-evaluation collaborator.
pub trait Evaluator {
    /// Evaluates `expr` against `context` and converts the result to a string.
    fn evaluate(&self, tree: &Tree, context: NodeRef, expr: &str) -> Result<String>;

    /// Evaluates `expr`, which must produce a node set.
    fn select_nodes(&self, tree: &Tree, context: NodeRef, expr: &str) -> Result<Vec<NodeRef>>;

    /// Like [`Evaluator::select_nodes`], keeping element nodes only.
    fn select_elements(&self, tree: &Tree, context: NodeRef, expr: &str) -> Result<Vec<NodeId>> {
        Ok(self
            .select_nodes(tree, context, expr)?
            .iter()
            .filter_map(NodeRef::element)
            .collect())
    }
}

/// XPath-subset evaluator with a per-instance cache of compiled expressions.
#[derive(Debug, Default)]
pub struct PathEvaluator {
    cache: RefCell<HashMap<String, Rc<Expr>>>,
}

impl PathEvaluator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn compile(&self, expr: &str) -> Result<Rc<Expr>> {
        if let Some(compiled) = self.cache.borrow().get(expr) {
            return Ok(Rc::clone(compiled));
        }
        let tokens = tokenize(expr)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            source: expr,
        };
        let compiled = Rc::new(parser.parse()?);
        self.cache
            .borrow_mut()
            .insert(expr.to_string(), Rc::clone(&compiled));
        Ok(compiled)
    }

    fn run(&self, tree: &Tree, context: NodeRef, expr: &str) -> Result<Value> {
        let compiled = self.compile(expr)?;
        let ctx = Context {
            tree,
            node: context,
            position: 1,
            size: 1,
        };
        ctx.eval(&compiled)
            .map_err(|e| e.with_context(|| format!("expression {:?}", expr)))
    }
}

impl Evaluator for PathEvaluator {
    fn evaluate(&self, tree: &Tree, context: NodeRef, expr: &str) -> Result<String> {
        Ok(self.run(tree, context, expr)?.into_string(tree))
    }

    fn select_nodes(&self, tree: &Tree, context: NodeRef, expr: &str) -> Result<Vec<NodeRef>> {
        match self.run(tree, context, expr)? {
            Value::Nodes(nodes) => Ok(nodes),
            _ => Err(Error::format(
                format!("expression {:?} does not select nodes", expr),
                None,
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Slash,
    DoubleSlash,
    Dot,
    DotDot,
    At,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Pipe,
    Plus,
    Minus,
    Multiply,
    Star,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    DoubleColon,
    And,
    Or,
    Div,
    Mod,
    Literal(String),
    Number(f64),
    Name(String),
}

impl Token {
    /// Whether a following `*` or operator name must be read as an operator.
    fn ends_operand(&self) -> bool {
        matches!(
            self,
            Token::RParen
                | Token::RBracket
                | Token::Dot
                | Token::DotDot
                | Token::Star
                | Token::Literal(_)
                | Token::Number(_)
                | Token::Name(_)
        )
    }
}

fn is_name_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.')
}

fn tokenize(expr: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = expr.chars().collect();
    let mut tokens: Vec<Token> = Vec::new();
    let mut i = 0;
    let syntax = |msg: String| Error::format(format!("{} in expression {:?}", msg, expr), None);

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let next = chars.get(i + 1).copied();
        let operand_before = tokens.last().is_some_and(Token::ends_operand);

        let paired = match (c, next) {
            ('/', Some('/')) => Some(Token::DoubleSlash),
            ('.', Some('.')) => Some(Token::DotDot),
            ('!', Some('=')) => Some(Token::Neq),
            ('<', Some('=')) => Some(Token::Le),
            ('>', Some('=')) => Some(Token::Ge),
            (':', Some(':')) => Some(Token::DoubleColon),
            _ => None,
        };
        if let Some(token) = paired {
            tokens.push(token);
            i += 2;
            continue;
        }

        let single = match c {
            '/' => Some(Token::Slash),
            '.' if !next.is_some_and(|n| n.is_ascii_digit()) => Some(Token::Dot),
            '@' => Some(Token::At),
            ',' => Some(Token::Comma),
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            '[' => Some(Token::LBracket),
            ']' => Some(Token::RBracket),
            '|' => Some(Token::Pipe),
            '+' => Some(Token::Plus),
            '-' => Some(Token::Minus),
            '=' => Some(Token::Eq),
            '<' => Some(Token::Lt),
            '>' => Some(Token::Gt),
            '*' if operand_before => Some(Token::Multiply),
            '*' => Some(Token::Star),
            _ => None,
        };
        if let Some(token) = single {
            tokens.push(token);
            i += 1;
            continue;
        }

        let token = match c {
            '\'' | '"' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&q| q == c)
                    .ok_or_else(|| syntax("unterminated string literal".to_string()))?;
                let literal: String = chars[i + 1..i + 1 + end].iter().collect();
                i += end + 2;
                Token::Literal(literal)
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| syntax(format!("bad number {:?}", text)))?;
                Token::Number(number)
            }
            c if is_name_start(c) => {
                let start = i;
                while i < chars.len() && is_name_char(chars[i]) {
                    i += 1;
                }
                let name: String = chars[start..i].iter().collect();
                match name.as_str() {
                    "and" if operand_before => Token::And,
                    "or" if operand_before => Token::Or,
                    "div" if operand_before => Token::Div,
                    "mod" if operand_before => Token::Mod,
                    _ => Token::Name(name),
                }
            }
            other => return Err(syntax(format!("unexpected character '{}'", other))),
        };
        tokens.push(token);
    }
    Ok(tokens)
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Axis {
    Child,
    Descendant,
    DescendantOrSelf,
    SelfAxis,
    Parent,
    Ancestor,
    AncestorOrSelf,
    Attribute,
    FollowingSibling,
    PrecedingSibling,
}

impl Axis {
    fn from_name(name: &str) -> Option<Axis> {
        Some(match name {
            "child" => Axis::Child,
            "descendant" => Axis::Descendant,
            "descendant-or-self" => Axis::DescendantOrSelf,
            "self" => Axis::SelfAxis,
            "parent" => Axis::Parent,
            "ancestor" => Axis::Ancestor,
            "ancestor-or-self" => Axis::AncestorOrSelf,
            "attribute" => Axis::Attribute,
            "following-sibling" => Axis::FollowingSibling,
            "preceding-sibling" => Axis::PrecedingSibling,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
enum NodeTest {
    Name(String),
    Any,
    Text,
    Node,
}

#[derive(Clone, Debug)]
struct Step {
    axis: Axis,
    test: NodeTest,
    predicates: Vec<Expr>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum BinOp {
    Or,
    And,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Clone, Debug)]
enum Expr {
    Literal(String),
    Number(f64),
    Path {
        absolute: bool,
        steps: Vec<Step>,
    },
    Filter {
        primary: Box<Expr>,
        predicates: Vec<Expr>,
        steps: Vec<Step>,
    },
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Negate(Box<Expr>),
    Union(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    source: &'a str,
}

impl Parser<'_> {
    fn parse(&mut self) -> Result<Expr> {
        let expr = self.or_expr()?;
        match self.peek() {
            None => Ok(expr),
            Some(token) => Err(self.error(format!("unexpected {:?}", token))),
        }
    }

    fn error(&self, msg: String) -> Error {
        Error::format(format!("{} in expression {:?}", msg, self.source), None)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<()> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(self.error(format!("expected {:?}", token)))
        }
    }

    fn binary_level(
        &mut self,
        ops: &[(Token, BinOp)],
        next: fn(&mut Self) -> Result<Expr>,
    ) -> Result<Expr> {
        let mut lhs = next(self)?;
        'outer: loop {
            for (token, op) in ops {
                if self.eat(token) {
                    let rhs = next(self)?;
                    lhs = Expr::Binary(*op, Box::new(lhs), Box::new(rhs));
                    continue 'outer;
                }
            }
            return Ok(lhs);
        }
    }

    fn or_expr(&mut self) -> Result<Expr> {
        self.binary_level(&[(Token::Or, BinOp::Or)], Self::and_expr)
    }

    fn and_expr(&mut self) -> Result<Expr> {
        self.binary_level(&[(Token::And, BinOp::And)], Self::equality_expr)
    }

    fn equality_expr(&mut self) -> Result<Expr> {
        self.binary_level(
            &[(Token::Eq, BinOp::Eq), (Token::Neq, BinOp::Neq)],
            Self::relational_expr,
        )
    }

    fn relational_expr(&mut self) -> Result<Expr> {
        self.binary_level(
            &[
                (Token::Le, BinOp::Le),
                (Token::Lt, BinOp::Lt),
                (Token::Ge, BinOp::Ge),
                (Token::Gt, BinOp::Gt),
            ],
            Self::additive_expr,
        )
    }

    fn additive_expr(&mut self) -> Result<Expr> {
        self.binary_level(
            &[(Token::Plus, BinOp::Add), (Token::Minus, BinOp::Sub)],
            Self::multiplicative_expr,
        )
    }

    fn multiplicative_expr(&mut self) -> Result<Expr> {
        self.binary_level(
            &[
                (Token::Multiply, BinOp::Mul),
                (Token::Div, BinOp::Div),
                (Token::Mod, BinOp::Mod),
            ],
            Self::unary_expr,
        )
    }

    fn unary_expr(&mut self) -> Result<Expr> {
        if self.eat(&Token::Minus) {
            return Ok(Expr::Negate(Box::new(self.unary_expr()?)));
        }
        let mut lhs = self.path_expr()?;
        while self.eat(&Token::Pipe) {
            let rhs = self.path_expr()?;
            lhs = Expr::Union(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn path_expr(&mut self) -> Result<Expr> {
        let starts_filter = match self.peek() {
            Some(Token::Literal(_)) | Some(Token::Number(_)) | Some(Token::LParen) => true,
            Some(Token::Name(name)) => {
                self.peek_at(1) == Some(&Token::LParen)
                    && !matches!(name.as_str(), "text" | "node")
            }
            _ => false,
        };
        if !starts_filter {
            return self.location_path();
        }

        let primary = self.primary_expr()?;
        let predicates = self.predicates()?;
        let mut steps = Vec::new();
        self.continue_path(&mut steps)?;
        if predicates.is_empty() && steps.is_empty() {
            Ok(primary)
        } else {
            Ok(Expr::Filter {
                primary: Box::new(primary),
                predicates,
                steps,
            })
        }
    }

    fn primary_expr(&mut self) -> Result<Expr> {
        match self.peek().cloned() {
            Some(Token::Literal(text)) => {
                self.pos += 1;
                Ok(Expr::Literal(text))
            }
            Some(Token::Number(n)) => {
                self.pos += 1;
                Ok(Expr::Number(n))
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.or_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Name(name)) => {
                self.pos += 1;
                self.expect(Token::LParen)?;
                let mut args = Vec::new();
                if !self.eat(&Token::RParen) {
                    loop {
                        args.push(self.or_expr()?);
                        if self.eat(&Token::RParen) {
                            break;
                        }
                        self.expect(Token::Comma)?;
                    }
                }
                Ok(Expr::Call(name, args))
            }
            other => Err(self.error(format!("unexpected {:?}", other))),
        }
    }

    fn location_path(&mut self) -> Result<Expr> {
        let mut steps = Vec::new();
        let absolute = match self.peek() {
            Some(Token::Slash) => {
                self.pos += 1;
                if self.starts_step() {
                    steps.push(self.step()?);
                }
                true
            }
            Some(Token::DoubleSlash) => {
                self.pos += 1;
                steps.push(descendant_or_self());
                steps.push(self.step()?);
                true
            }
            _ => {
                steps.push(self.step()?);
                false
            }
        };
        self.continue_path(&mut steps)?;
        Ok(Expr::Path { absolute, steps })
    }

    fn continue_path(&mut self, steps: &mut Vec<Step>) -> Result<()> {
        loop {
            if self.eat(&Token::Slash) {
                steps.push(self.step()?);
            } else if self.eat(&Token::DoubleSlash) {
                steps.push(descendant_or_self());
                steps.push(self.step()?);
            } else {
                return Ok(());
            }
        }
    }

    fn starts_step(&self) -> bool {
        matches!(
            self.peek(),
            Some(Token::Dot | Token::DotDot | Token::At | Token::Star | Token::Name(_))
        )
    }

    fn step(&mut self) -> Result<Step> {
        if self.eat(&Token::Dot) {
            return Ok(Step {
                axis: Axis::SelfAxis,
                test: NodeTest::Node,
                predicates: Vec::new(),
            });
        }
        if self.eat(&Token::DotDot) {
            return Ok(Step {
                axis: Axis::Parent,
                test: NodeTest::Node,
                predicates: Vec::new(),
            });
        }

        let axis = if self.eat(&Token::At) {
            Axis::Attribute
        } else if let (Some(Token::Name(name)), Some(Token::DoubleColon)) =
            (self.peek(), self.peek_at(1))
        {
            let axis = Axis::from_name(name)
                .ok_or_else(|| self.error(format!("unsupported axis '{}'", name)))?;
            self.pos += 2;
            axis
        } else {
            Axis::Child
        };

        let test = match self.peek().cloned() {
            Some(Token::Star) => {
                self.pos += 1;
                NodeTest::Any
            }
            Some(Token::Name(name)) => {
                self.pos += 1;
                if self.peek() == Some(&Token::LParen) && matches!(name.as_str(), "text" | "node")
                {
                    self.pos += 1;
                    self.expect(Token::RParen)?;
                    if name == "text" {
                        NodeTest::Text
                    } else {
                        NodeTest::Node
                    }
                } else {
                    NodeTest::Name(name)
                }
            }
            other => return Err(self.error(format!("expected a node test, found {:?}", other))),
        };

        Ok(Step {
            axis,
            test,
            predicates: self.predicates()?,
        })
    }

    fn predicates(&mut self) -> Result<Vec<Expr>> {
        let mut predicates = Vec::new();
        while self.eat(&Token::LBracket) {
            predicates.push(self.or_expr()?);
            self.expect(Token::RBracket)?;
        }
        Ok(predicates)
    }
}

fn descendant_or_self() -> Step {
    Step {
        axis: Axis::DescendantOrSelf,
        test: NodeTest::Node,
        predicates: Vec::new(),
    }
}

#[derive(Clone, Debug)]
enum Value {
    Nodes(Vec<NodeRef>),
    Str(String),
    Num(f64),
    Bool(bool),
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        (if n > 0.0 { "Infinity" } else { "-Infinity" }).to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e18 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

fn parse_number(s: &str) -> f64 {
    s.trim().parse::<f64>().unwrap_or(f64::NAN)
}

impl Value {
    fn into_string(self, tree: &Tree) -> String {
        match self {
            Value::Nodes(nodes) => nodes
                .first()
                .map(|n| n.string_value(tree))
                .unwrap_or_default(),
            Value::Str(s) => s,
            Value::Num(n) => format_number(n),
            Value::Bool(b) => b.to_string(),
        }
    }

    fn to_number(&self, tree: &Tree) -> f64 {
        match self {
            Value::Num(n) => *n,
            Value::Bool(b) => f64::from(u8::from(*b)),
            other => parse_number(&other.clone().into_string(tree)),
        }
    }

    fn to_bool(&self) -> bool {
        match self {
            Value::Nodes(nodes) => !nodes.is_empty(),
            Value::Str(s) => !s.is_empty(),
            Value::Num(n) => *n != 0.0 && !n.is_nan(),
            Value::Bool(b) => *b,
        }
    }
}

struct Context<'t> {
    tree: &'t Tree,
    node: NodeRef,
    position: usize,
    size: usize,
}

impl<'t> Context<'t> {
    fn with_node(&self, node: NodeRef, position: usize, size: usize) -> Context<'t> {
        Context {
            tree: self.tree,
            node,
            position,
            size,
        }
    }

    fn eval(&self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Literal(s) => Ok(Value::Str(s.clone())),
            Expr::Number(n) => Ok(Value::Num(*n)),
            Expr::Path { absolute, steps } => {
                let start = if *absolute {
                    vec![self.document()]
                } else {
                    vec![self.node.clone()]
                };
                Ok(Value::Nodes(self.walk(start, steps)?))
            }
            Expr::Filter {
                primary,
                predicates,
                steps,
            } => {
                let nodes = match self.eval(primary)? {
                    Value::Nodes(nodes) => nodes,
                    _ => {
                        return Err(Error::format(
                            "predicates and paths need a node set",
                            None,
                        ))
                    }
                };
                let nodes = self.filter(nodes, predicates)?;
                Ok(Value::Nodes(self.walk(nodes, steps)?))
            }
            Expr::Binary(op, lhs, rhs) => self.binary(*op, lhs, rhs),
            Expr::Negate(inner) => Ok(Value::Num(-self.eval(inner)?.to_number(self.tree))),
            Expr::Union(lhs, rhs) => match (self.eval(lhs)?, self.eval(rhs)?) {
                (Value::Nodes(a), Value::Nodes(b)) => {
                    let set: IndexSet<NodeRef> = a.into_iter().chain(b).collect();
                    Ok(Value::Nodes(set.into_iter().collect()))
                }
                _ => Err(Error::format("'|' needs node sets on both sides", None)),
            },
            Expr::Call(name, args) => self.call(name, args),
        }
    }

    fn document(&self) -> NodeRef {
        let anchor = match &self.node {
            NodeRef::Document(id)
            | NodeRef::Element(id)
            | NodeRef::Attribute(id, _)
            | NodeRef::Text(id) => *id,
        };
        NodeRef::Document(self.tree.root_of(anchor))
    }

    fn walk(&self, mut nodes: Vec<NodeRef>, steps: &[Step]) -> Result<Vec<NodeRef>> {
        for step in steps {
            let mut next: IndexSet<NodeRef> = IndexSet::new();
            for node in &nodes {
                let candidates: Vec<NodeRef> = self
                    .axis(node, step.axis)
                    .into_iter()
                    .filter(|c| self.matches(c, step))
                    .collect();
                next.extend(self.filter(candidates, &step.predicates)?);
            }
            nodes = next.into_iter().collect();
        }
        Ok(nodes)
    }

    fn filter(&self, mut nodes: Vec<NodeRef>, predicates: &[Expr]) -> Result<Vec<NodeRef>> {
        for predicate in predicates {
            let size = nodes.len();
            let mut kept = Vec::with_capacity(size);
            for (index, node) in nodes.into_iter().enumerate() {
                let ctx = self.with_node(node.clone(), index + 1, size);
                let keep = match ctx.eval(predicate)? {
                    Value::Num(n) => n == (index + 1) as f64,
                    other => other.to_bool(),
                };
                if keep {
                    kept.push(node);
                }
            }
            nodes = kept;
        }
        Ok(nodes)
    }

    fn matches(&self, node: &NodeRef, step: &Step) -> bool {
        match (&step.test, node) {
            (NodeTest::Node, _) => true,
            (NodeTest::Text, NodeRef::Text(_)) => true,
            (NodeTest::Any, NodeRef::Attribute(..)) => step.axis == Axis::Attribute,
            (NodeTest::Any, NodeRef::Element(_)) => step.axis != Axis::Attribute,
            (NodeTest::Name(want), NodeRef::Attribute(_, name)) => {
                step.axis == Axis::Attribute && want == name
            }
            (NodeTest::Name(want), NodeRef::Element(id)) => {
                step.axis != Axis::Attribute && self.tree.name(*id) == want
            }
            _ => false,
        }
    }

    fn children(&self, node: &NodeRef) -> Vec<NodeRef> {
        match node {
            NodeRef::Document(root) => vec![NodeRef::Element(*root)],
            NodeRef::Element(id) => {
                let mut out = Vec::new();
                if !self.tree.text(*id).is_empty() {
                    out.push(NodeRef::Text(*id));
                }
                out.extend(self.tree.children(*id).iter().map(|&c| NodeRef::Element(c)));
                out
            }
            _ => Vec::new(),
        }
    }

    fn parent(&self, node: &NodeRef) -> Option<NodeRef> {
        match node {
            NodeRef::Document(_) => None,
            NodeRef::Element(id) => Some(match self.tree.parent(*id) {
                Some(parent) => NodeRef::Element(parent),
                None => NodeRef::Document(*id),
            }),
            NodeRef::Attribute(id, _) | NodeRef::Text(id) => Some(NodeRef::Element(*id)),
        }
    }

    fn axis(&self, node: &NodeRef, axis: Axis) -> Vec<NodeRef> {
        match axis {
            Axis::Child => self.children(node),
            Axis::SelfAxis => vec![node.clone()],
            Axis::Descendant | Axis::DescendantOrSelf => {
                let mut out = Vec::new();
                if axis == Axis::DescendantOrSelf {
                    out.push(node.clone());
                }
                let mut stack: Vec<NodeRef> = self.children(node).into_iter().rev().collect();
                while let Some(next) = stack.pop() {
                    stack.extend(self.children(&next).into_iter().rev());
                    out.push(next);
                }
                out
            }
            Axis::Parent => self.parent(node).into_iter().collect(),
            Axis::Ancestor | Axis::AncestorOrSelf => {
                let mut out = Vec::new();
                if axis == Axis::AncestorOrSelf {
                    out.push(node.clone());
                }
                let mut cursor = self.parent(node);
                while let Some(next) = cursor {
                    cursor = self.parent(&next);
                    out.push(next);
                }
                out
            }
            Axis::Attribute => match node {
                NodeRef::Element(id) => self
                    .tree
                    .attribute_names(*id)
                    .into_iter()
                    .map(|name| NodeRef::Attribute(*id, name))
                    .collect(),
                _ => Vec::new(),
            },
            Axis::FollowingSibling | Axis::PrecedingSibling => {
                let Some(id) = node.element() else {
                    return Vec::new();
                };
                let step: fn(&Tree, NodeId) -> Option<NodeId> = if axis == Axis::FollowingSibling {
                    Tree::next_sibling
                } else {
                    Tree::previous_sibling
                };
                let mut out = Vec::new();
                let mut cursor = step(self.tree, id);
                while let Some(next) = cursor {
                    out.push(NodeRef::Element(next));
                    cursor = step(self.tree, next);
                }
                out
            }
        }
    }

    fn binary(&self, op: BinOp, lhs: &Expr, rhs: &Expr) -> Result<Value> {
        match op {
            BinOp::Or => {
                return Ok(Value::Bool(
                    self.eval(lhs)?.to_bool() || self.eval(rhs)?.to_bool(),
                ))
            }
            BinOp::And => {
                return Ok(Value::Bool(
                    self.eval(lhs)?.to_bool() && self.eval(rhs)?.to_bool(),
                ))
            }
            _ => {}
        }

        let left = self.eval(lhs)?;
        let right = self.eval(rhs)?;
        let tree = self.tree;
        let number = |op: BinOp, a: f64, b: f64| match op {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            BinOp::Div => a / b,
            _ => a % b,
        };
        match op {
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => Ok(Value::Num(
                number(op, left.to_number(tree), right.to_number(tree)),
            )),
            _ => Ok(Value::Bool(self.compare(op, &left, &right))),
        }
    }

    /// Comparison with node-set existential semantics.
    fn compare(&self, op: BinOp, left: &Value, right: &Value) -> bool {
        let tree = self.tree;
        let atoms = |value: &Value| -> Vec<Value> {
            match value {
                Value::Nodes(nodes) => nodes
                    .iter()
                    .map(|n| Value::Str(n.string_value(tree)))
                    .collect(),
                other => vec![other.clone()],
            }
        };
        let (lefts, rights) = (atoms(left), atoms(right));
        let compare_atoms = |a: &Value, b: &Value| -> bool {
            match op {
                BinOp::Eq | BinOp::Neq => {
                    let equal = match (a, b) {
                        (Value::Bool(_), _) | (_, Value::Bool(_)) => a.to_bool() == b.to_bool(),
                        (Value::Num(_), _) | (_, Value::Num(_)) => {
                            a.to_number(tree) == b.to_number(tree)
                        }
                        _ => a.clone().into_string(tree) == b.clone().into_string(tree),
                    };
                    equal == (op == BinOp::Eq)
                }
                _ => {
                    let (x, y) = (a.to_number(tree), b.to_number(tree));
                    match op {
                        BinOp::Lt => x < y,
                        BinOp::Le => x <= y,
                        BinOp::Gt => x > y,
                        _ => x >= y,
                    }
                }
            }
        };
        if let (Value::Bool(_), _) | (_, Value::Bool(_)) = (left, right) {
            return compare_atoms(&Value::Bool(left.to_bool()), &Value::Bool(right.to_bool()));
        }
        lefts
            .iter()
            .any(|a| rights.iter().any(|b| compare_atoms(a, b)))
    }

    fn call(&self, name: &str, args: &[Expr]) -> Result<Value> {
        let tree = self.tree;
        let values = args
            .iter()
            .map(|a| self.eval(a))
            .collect::<Result<Vec<Value>>>()?;
        let arity = |min: usize, max: usize| -> Result<()> {
            if values.len() < min || values.len() > max {
                Err(Error::format(
                    format!("{}() takes {}..={} arguments, got {}", name, min, max, values.len()),
                    None,
                ))
            } else {
                Ok(())
            }
        };
        let string_arg = |index: usize| -> String {
            match values.get(index) {
                Some(v) => v.clone().into_string(tree),
                None => self.node.string_value(tree),
            }
        };

        let value = match name {
            "string" => {
                arity(0, 1)?;
                Value::Str(string_arg(0))
            }
            "number" => {
                arity(0, 1)?;
                match values.first() {
                    Some(v) => Value::Num(v.to_number(tree)),
                    None => Value::Num(parse_number(&string_arg(0))),
                }
            }
            "boolean" => {
                arity(1, 1)?;
                Value::Bool(values[0].to_bool())
            }
            "not" => {
                arity(1, 1)?;
                Value::Bool(!values[0].to_bool())
            }
            "true" => {
                arity(0, 0)?;
                Value::Bool(true)
            }
            "false" => {
                arity(0, 0)?;
                Value::Bool(false)
            }
            "count" => {
                arity(1, 1)?;
                Value::Num(node_set(name, &values, 0)?.len() as f64)
            }
            "sum" => {
                arity(1, 1)?;
                Value::Num(
                    node_set(name, &values, 0)?
                        .iter()
                        .map(|n| parse_number(&n.string_value(tree)))
                        .sum(),
                )
            }
            "concat" => {
                arity(2, usize::MAX)?;
                Value::Str((0..values.len()).map(&string_arg).collect())
            }
            "string-length" => {
                arity(0, 1)?;
                Value::Num(string_arg(0).chars().count() as f64)
            }
            "normalize-space" => {
                arity(0, 1)?;
                Value::Str(string_arg(0).split_whitespace().collect::<Vec<_>>().join(" "))
            }
            "contains" => {
                arity(2, 2)?;
                Value::Bool(string_arg(0).contains(string_arg(1).as_str()))
            }
            "starts-with" => {
                arity(2, 2)?;
                Value::Bool(string_arg(0).starts_with(string_arg(1).as_str()))
            }
            "substring" => {
                arity(2, 3)?;
                let text: Vec<char> = string_arg(0).chars().collect();
                let start = values[1].to_number(tree).round();
                let end = match values.get(2) {
                    Some(len) => start + len.to_number(tree).round(),
                    None => f64::INFINITY,
                };
                Value::Str(
                    text.iter()
                        .enumerate()
                        .filter(|(i, _)| {
                            let position = (*i + 1) as f64;
                            position >= start && position < end
                        })
                        .map(|(_, c)| c)
                        .collect(),
                )
            }
            "position" => {
                arity(0, 0)?;
                Value::Num(self.position as f64)
            }
            "last" => {
                arity(0, 0)?;
                Value::Num(self.size as f64)
            }
            "name" | "local-name" => {
                arity(0, 1)?;
                let node = match values.first() {
                    Some(Value::Nodes(nodes)) => nodes.first().cloned(),
                    Some(_) => return Err(Error::format(format!("{}() expects a node set", name), None)),
                    None => Some(self.node.clone()),
                };
                Value::Str(match node {
                    Some(NodeRef::Element(id)) => tree.name(id).to_string(),
                    Some(NodeRef::Attribute(_, attr)) => attr,
                    _ => String::new(),
                })
            }
            "floor" => {
                arity(1, 1)?;
                Value::Num(values[0].to_number(tree).floor())
            }
            "ceiling" => {
                arity(1, 1)?;
                Value::Num(values[0].to_number(tree).ceil())
            }
            "round" => {
                arity(1, 1)?;
                Value::Num((values[0].to_number(tree) + 0.5).floor())
            }
            other => {
                return Err(Error::format(format!("unknown function {}()", other), None));
            }
        };
        Ok(value)
    }
}

fn node_set<'v>(function: &str, values: &'v [Value], index: usize) -> Result<&'v [NodeRef]> {
    match values.get(index) {
        Some(Value::Nodes(nodes)) => Ok(nodes),
        _ => Err(Error::format(
            format!("{}() expects a node set", function),
            None,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::Template;

    const DOC: &str = r#"
        <format>
            <item name="len" bytes="1"/>
            <item name="body" bytes="4"><value>abcd</value></item>
            <items name="grp">
                <item name="x">7</item>
                <item name="y">5</item>
            </items>
        </format>"#;

    fn eval(expr: &str) -> String {
        let template = Template::parse(DOC).unwrap();
        PathEvaluator::new()
            .evaluate(&template.tree, template.root.into(), expr)
            .unwrap()
    }

    #[test]
    fn test_paths_and_predicates() {
        assert_eq!(eval("item[@name='body']/value"), "abcd");
        assert_eq!(eval("/format/item[2]/@bytes"), "4");
        assert_eq!(eval("//item[@name='y']"), "5");
        assert_eq!(eval("items/item[last()]/@name"), "y");
        assert_eq!(eval("items/item[. = '7']/@name"), "x");
        assert_eq!(eval("name(*[3])"), "items");
    }

    #[test]
    fn test_arithmetic_and_functions() {
        assert_eq!(eval("sum(items/item) + 1"), "13");
        assert_eq!(eval("item[2]/@bytes * 2"), "8");
        assert_eq!(eval("7 div 2"), "3.5");
        assert_eq!(eval("7 mod 4"), "3");
        assert_eq!(eval("-item[1]/@bytes"), "-1");
        assert_eq!(eval("string-length(item[2]/value)"), "4");
        assert_eq!(eval("concat('a', item[1]/@name, 'b')"), "alenb");
        assert_eq!(eval("count(//item)"), "4");
        assert_eq!(eval("substring('binform', 2, 3)"), "inf");
        assert_eq!(eval("item[1]/@bytes != 1"), "false");
    }

    #[test]
    fn test_hyphenated_names_and_computed_state() {
        let mut template = Template::parse(DOC).unwrap();
        let body = template.tree.children(template.root)[1];
        template.tree.state_mut(body).result_bytes = Some(4);
        let eval = PathEvaluator::new();
        let ctx = template.tree.children(template.root)[0];
        let value = eval
            .evaluate(
                &template.tree,
                ctx.into(),
                "../item[@name='body']/@result-bytes + 1",
            )
            .unwrap();
        assert_eq!(value, "5");
    }

    #[test]
    fn test_select_nodes_kinds() {
        let template = Template::parse(DOC).unwrap();
        let eval = PathEvaluator::new();
        let tree = &template.tree;
        let root = template.root.into();
        let attrs = eval.select_nodes(tree, root, "//item/@name").unwrap();
        assert_eq!(attrs.len(), 4);
        let texts = eval.select_nodes(tree, template.root.into(), "//value/text()").unwrap();
        assert!(matches!(texts.as_slice(), [NodeRef::Text(_)]));
        let elements = eval.select_elements(tree, template.root.into(), "items/*").unwrap();
        assert_eq!(elements.len(), 2);
        assert!(eval.select_nodes(tree, template.root.into(), "1 + 1").is_err());
    }

    #[test]
    fn test_document_context() {
        let template = Template::parse(DOC).unwrap();
        let eval = PathEvaluator::new();
        let value = eval
            .evaluate(
                &template.tree,
                NodeRef::Document(template.root),
                "format/items/item[1]",
            )
            .unwrap();
        assert_eq!(value, "7");
    }

    #[test]
    fn test_syntax_errors() {
        let template = Template::parse(DOC).unwrap();
        let eval = PathEvaluator::new();
        for bad in ["item[", "'open", "foo(", "item/", "#"] {
            let err = eval
                .evaluate(&template.tree, template.root.into(), bad)
                .unwrap_err();
            assert!(err.is_format(), "{} gave {}", bad, err);
        }
    }
}
