//! Recursive-descent parser producing a [`NixNode`] tree.
//!
//! The parser never evaluates anything. Constructs it does not model are
//! kept as [`NixNode::Opaque`]; only lexer-level problems (unbalanced
//! delimiters, unterminated literals) are errors.

use super::lexer::{tokenize, Token, TokenKind, KEYWORDS};
use crate::harvest::traits::FormatError;

/// Node of a parsed Nix expression.
#[derive(Debug, Clone, PartialEq)]
pub enum NixNode {
    AttrSet {
        recursive: bool,
        bindings: Vec<Binding>,
    },
    List(Vec<NixNode>),
    Str(String),
    /// Identifier, with attribute selection collapsed (`pkgs.glib`).
    Ident(String),
    Path(String),
    Call {
        function: Box<NixNode>,
        args: Vec<NixNode>,
    },
    Lambda {
        params: Vec<String>,
        body: Box<NixNode>,
    },
    Let {
        bindings: Vec<Binding>,
        body: Box<NixNode>,
    },
    With {
        scope: Box<NixNode>,
        body: Box<NixNode>,
    },
    If {
        condition: Box<NixNode>,
        then_branch: Box<NixNode>,
        else_branch: Box<NixNode>,
    },
    BinOp {
        op: &'static str,
        lhs: Box<NixNode>,
        rhs: Box<NixNode>,
    },
    Unary {
        op: &'static str,
        operand: Box<NixNode>,
    },
    /// Anything unresolvable, kept as source text.
    Opaque(String),
}

/// `path = value;` or an `inherit`ed name.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub path: Vec<String>,
    pub value: NixNode,
    pub inherited: bool,
}

impl NixNode {
    /// Direct children, in source order.
    pub fn children(&self) -> Vec<&NixNode> {
        match self {
            NixNode::AttrSet { bindings, .. } => bindings.iter().map(|b| &b.value).collect(),
            NixNode::List(items) => items.iter().collect(),
            NixNode::Call { function, args } => {
                let mut out = vec![function.as_ref()];
                out.extend(args.iter());
                out
            }
            NixNode::Lambda { body, .. } => vec![body.as_ref()],
            NixNode::Let { bindings, body } => {
                let mut out: Vec<&NixNode> = bindings.iter().map(|b| &b.value).collect();
                out.push(body.as_ref());
                out
            }
            NixNode::With { scope, body } => vec![scope.as_ref(), body.as_ref()],
            NixNode::If {
                condition,
                then_branch,
                else_branch,
            } => vec![condition.as_ref(), then_branch.as_ref(), else_branch.as_ref()],
            NixNode::BinOp { lhs, rhs, .. } => vec![lhs.as_ref(), rhs.as_ref()],
            NixNode::Unary { operand, .. } => vec![operand.as_ref()],
            NixNode::Str(_) | NixNode::Ident(_) | NixNode::Path(_) | NixNode::Opaque(_) => {
                Vec::new()
            }
        }
    }

    /// Bindings declared directly by this node (attribute sets and `let`).
    pub fn bindings(&self) -> &[Binding] {
        match self {
            NixNode::AttrSet { bindings, .. } | NixNode::Let { bindings, .. } => bindings,
            _ => &[],
        }
    }
}

/// Nesting levels (brackets, lambda bodies, operator chains) accepted
/// before an expression is rejected.
const MAX_DEPTH: usize = 200;

/// Parses `src` into one or more top-level nodes.
///
/// # Errors
///
/// [`FormatError::MalformedExpression`] on an unterminated string or
/// comment, or when nesting exceeds [`MAX_DEPTH`].
pub fn parse(src: &str) -> Result<Vec<NixNode>, FormatError> {
    let tokens = tokenize(src)?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        depth: 0,
        too_deep: None,
    };
    let nodes = parser.parse_document();
    match parser.too_deep {
        Some(offset) => Err(FormatError::MalformedExpression {
            offset,
            reason: format!("nesting deeper than {} levels", MAX_DEPTH),
        }),
        None => Ok(nodes),
    }
}

struct Parser<'t> {
    tokens: &'t [Token],
    pos: usize,
    depth: usize,
    /// Offset where nesting exceeded [`MAX_DEPTH`].
    too_deep: Option<usize>,
}

fn is_keyword(name: &str) -> bool {
    KEYWORDS.contains(&name)
}

/// Binding power of infix operators; higher binds tighter.
fn infix_precedence(op: &str) -> Option<(u8, bool)> {
    // (precedence, right-associative)
    Some(match op {
        "->" => (1, true),
        "||" => (2, false),
        "&&" => (3, false),
        "==" | "!=" => (4, false),
        "<" | ">" | "<=" | ">=" => (5, false),
        "//" => (6, true),
        "+" | "-" => (8, false),
        "*" | "/" => (9, false),
        "++" => (10, true),
        "?" => (11, false),
        _ => return None,
    })
}

impl<'t> Parser<'t> {
    /// Runs `f` one nesting level deeper. Past [`MAX_DEPTH`] the rest of
    /// the input is abandoned.
    fn nested(&mut self, f: impl FnOnce(&mut Self) -> NixNode) -> NixNode {
        if self.depth >= MAX_DEPTH {
            if self.too_deep.is_none() {
                let offset = self
                    .tokens
                    .get(self.pos)
                    .or(self.tokens.last())
                    .map_or(0, |t| t.offset);
                self.too_deep = Some(offset);
            }
            self.pos = self.tokens.len();
            return NixNode::Opaque(String::new());
        }
        self.depth += 1;
        let node = f(self);
        self.depth -= 1;
        node
    }

    fn peek(&self) -> Option<&'t TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn peek_at(&self, n: usize) -> Option<&'t TokenKind> {
        self.tokens.get(self.pos + n).map(|t| &t.kind)
    }

    fn bump(&mut self) -> Option<&'t TokenKind> {
        let tok = self.tokens.get(self.pos).map(|t| &t.kind);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn at_punct(&self, p: &str) -> bool {
        matches!(self.peek(), Some(TokenKind::Punct(q)) if *q == p)
    }

    fn at_keyword(&self, k: &str) -> bool {
        matches!(self.peek(), Some(TokenKind::Ident(name)) if name == k)
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if self.at_punct(p) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, k: &str) -> bool {
        if self.at_keyword(k) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Tokens that end an expression without belonging to it.
    fn at_terminator(&self) -> bool {
        match self.peek() {
            None => true,
            Some(TokenKind::Punct(p)) => matches!(*p, "}" | "]" | ")" | ";" | ","),
            Some(TokenKind::Ident(k)) => matches!(k.as_str(), "in" | "then" | "else"),
            _ => false,
        }
    }

    fn parse_document(&mut self) -> Vec<NixNode> {
        let mut nodes = Vec::new();
        while self.pos < self.tokens.len() {
            let before = self.pos;
            if self.at_binding_start() {
                let bindings = self.parse_bindings();
                nodes.push(NixNode::AttrSet {
                    recursive: true,
                    bindings,
                });
            } else {
                nodes.push(self.parse_expr());
            }
            if self.pos == before {
                // Stray closer or separator at top level.
                self.bump();
            }
        }
        nodes
    }

    /// `attr.path =` or `inherit` at the current position.
    fn at_binding_start(&self) -> bool {
        if self.at_keyword("inherit") {
            return true;
        }
        let mut i = 0;
        loop {
            match self.peek_at(i) {
                Some(TokenKind::Ident(name)) if !is_keyword(name) => {}
                Some(TokenKind::Str(_)) | Some(TokenKind::Interp(_)) => {}
                _ => return false,
            }
            i += 1;
            match self.peek_at(i) {
                Some(TokenKind::Punct("=")) => return true,
                Some(TokenKind::Punct(".")) => i += 1,
                _ => return false,
            }
        }
    }

    fn parse_expr(&mut self) -> NixNode {
        self.nested(Self::expr)
    }

    fn expr(&mut self) -> NixNode {
        if let Some(lambda) = self.try_parse_lambda() {
            return lambda;
        }
        match self.peek() {
            Some(TokenKind::Ident(k)) if k == "let" && !matches!(self.peek_at(1), Some(TokenKind::Punct("{"))) => {
                self.bump();
                let bindings = self.parse_bindings();
                self.eat_keyword("in");
                let body = self.parse_expr();
                NixNode::Let {
                    bindings,
                    body: Box::new(body),
                }
            }
            Some(TokenKind::Ident(k)) if k == "with" => {
                self.bump();
                let scope = self.parse_expr();
                self.eat_punct(";");
                let body = self.parse_expr();
                NixNode::With {
                    scope: Box::new(scope),
                    body: Box::new(body),
                }
            }
            Some(TokenKind::Ident(k)) if k == "assert" => {
                self.bump();
                let _condition = self.parse_expr();
                self.eat_punct(";");
                self.parse_expr()
            }
            Some(TokenKind::Ident(k)) if k == "if" => {
                self.bump();
                let condition = self.parse_expr();
                self.eat_keyword("then");
                let then_branch = self.parse_expr();
                self.eat_keyword("else");
                let else_branch = self.parse_expr();
                NixNode::If {
                    condition: Box::new(condition),
                    then_branch: Box::new(then_branch),
                    else_branch: Box::new(else_branch),
                }
            }
            _ => self.parse_binop(0),
        }
    }

    fn try_parse_lambda(&mut self) -> Option<NixNode> {
        match (self.peek(), self.peek_at(1)) {
            // x: body
            (Some(TokenKind::Ident(name)), Some(TokenKind::Punct(":"))) if !is_keyword(name) => {
                let name = name.clone();
                self.pos += 2;
                let body = self.parse_expr();
                Some(NixNode::Lambda {
                    params: vec![name],
                    body: Box::new(body),
                })
            }
            // args @ { ... }: body
            (Some(TokenKind::Ident(name)), Some(TokenKind::Punct("@"))) if !is_keyword(name) => {
                let name = name.clone();
                self.pos += 2;
                let mut params = self.parse_formals();
                params.push(name);
                self.eat_punct(":");
                let body = self.parse_expr();
                Some(NixNode::Lambda {
                    params,
                    body: Box::new(body),
                })
            }
            // { a, b ? x, ... } (@ args)?: body
            (Some(TokenKind::Punct("{")), _) if self.formals_ahead() => {
                let mut params = self.parse_formals();
                if self.eat_punct("@") {
                    if let Some(TokenKind::Ident(name)) = self.bump() {
                        params.push(name.clone());
                    }
                }
                self.eat_punct(":");
                let body = self.parse_expr();
                Some(NixNode::Lambda {
                    params,
                    body: Box::new(body),
                })
            }
            _ => None,
        }
    }

    /// `true` if the `{` at the current position opens a formals pattern,
    /// i.e. its matching `}` is followed by `:` or `@`.
    fn formals_ahead(&self) -> bool {
        match self.matching_close(self.pos) {
            Some(close) => matches!(
                self.tokens.get(close + 1).map(|t| &t.kind),
                Some(TokenKind::Punct(":")) | Some(TokenKind::Punct("@"))
            ),
            None => false,
        }
    }

    /// Index of the delimiter closing the opener at `open`.
    fn matching_close(&self, open: usize) -> Option<usize> {
        let mut depth = 0usize;
        for (i, tok) in self.tokens.iter().enumerate().skip(open) {
            match tok.kind {
                TokenKind::Punct("{") | TokenKind::Punct("[") | TokenKind::Punct("(") => depth += 1,
                TokenKind::Punct("}") | TokenKind::Punct("]") | TokenKind::Punct(")") => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        return Some(i);
                    }
                }
                _ => {}
            }
        }
        None
    }

    fn parse_formals(&mut self) -> Vec<String> {
        let mut params = Vec::new();
        if !self.eat_punct("{") {
            return params;
        }
        while !self.at_punct("}") && self.peek().is_some() {
            let before = self.pos;
            match self.peek() {
                Some(TokenKind::Ident(name)) => {
                    params.push(name.clone());
                    self.bump();
                    if self.eat_punct("?") {
                        let _default = self.parse_expr();
                    }
                }
                Some(TokenKind::Punct(",")) | Some(TokenKind::Punct("...")) => {
                    self.bump();
                }
                _ => {}
            }
            if self.pos == before {
                self.skip_one();
            }
        }
        self.eat_punct("}");
        params
    }

    fn parse_binop(&mut self, min_prec: u8) -> NixNode {
        self.nested(|p| p.binop(min_prec))
    }

    fn binop(&mut self, min_prec: u8) -> NixNode {
        let mut lhs = self.parse_unary();
        loop {
            let op = match self.peek() {
                Some(TokenKind::Punct(p)) => *p,
                _ => break,
            };
            let (prec, right_assoc) = match infix_precedence(op) {
                Some(p) => p,
                None => break,
            };
            if prec < min_prec {
                break;
            }
            self.bump();
            let rhs = if op == "?" {
                self.parse_attr_path_text()
            } else {
                self.parse_binop(if right_assoc { prec } else { prec + 1 })
            };
            lhs = NixNode::BinOp {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        lhs
    }

    fn parse_unary(&mut self) -> NixNode {
        self.nested(Self::unary)
    }

    fn unary(&mut self) -> NixNode {
        if self.eat_punct("!") {
            let operand = self.parse_binop(7);
            return NixNode::Unary {
                op: "!",
                operand: Box::new(operand),
            };
        }
        if self.eat_punct("-") {
            let operand = self.parse_unary();
            return NixNode::Unary {
                op: "-",
                operand: Box::new(operand),
            };
        }
        self.parse_app()
    }

    fn starts_operand(&self) -> bool {
        match self.peek() {
            Some(TokenKind::Ident(name)) => !is_keyword(name) || name == "rec",
            Some(TokenKind::Str(_))
            | Some(TokenKind::Number(_))
            | Some(TokenKind::Path(_))
            | Some(TokenKind::Uri(_))
            | Some(TokenKind::Interp(_)) => true,
            Some(TokenKind::Punct(p)) => matches!(*p, "{" | "[" | "("),
            _ => false,
        }
    }

    fn parse_app(&mut self) -> NixNode {
        let function = self.parse_select();
        let mut args = Vec::new();
        while self.starts_operand() {
            // `name: body` cannot be an argument; it starts a new lambda
            if matches!(self.peek_at(1), Some(TokenKind::Punct(":")))
                && matches!(self.peek(), Some(TokenKind::Ident(_)))
            {
                break;
            }
            let before = self.pos;
            args.push(self.parse_select());
            if self.pos == before {
                break;
            }
        }
        if args.is_empty() {
            function
        } else {
            NixNode::Call {
                function: Box::new(function),
                args,
            }
        }
    }

    fn parse_select(&mut self) -> NixNode {
        self.nested(Self::select)
    }

    fn select(&mut self) -> NixNode {
        let mut node = self.parse_primary();
        while self.at_punct(".") {
            let attr = match self.peek_at(1) {
                Some(TokenKind::Ident(name)) => name.clone(),
                Some(TokenKind::Str(s)) => s.clone(),
                Some(TokenKind::Interp(raw)) => raw.clone(),
                _ => break,
            };
            self.pos += 2;
            node = match node {
                NixNode::Ident(base) => NixNode::Ident(format!("{}.{}", base, attr)),
                other => NixNode::BinOp {
                    op: ".",
                    lhs: Box::new(other),
                    rhs: Box::new(NixNode::Ident(attr)),
                },
            };
        }
        if self.eat_keyword("or") {
            let default = self.parse_select();
            node = NixNode::BinOp {
                op: "or",
                lhs: Box::new(node),
                rhs: Box::new(default),
            };
        }
        node
    }

    fn parse_primary(&mut self) -> NixNode {
        if self.at_terminator() {
            return NixNode::Opaque(String::new());
        }
        let Some(tok) = self.peek() else {
            return NixNode::Opaque(String::new());
        };
        match tok {
            TokenKind::Ident(name) if name == "rec" => {
                self.bump();
                if self.at_punct("{") {
                    self.parse_attrset(true)
                } else {
                    NixNode::Opaque("rec".to_string())
                }
            }
            TokenKind::Ident(name) if name == "let" && matches!(self.peek_at(1), Some(TokenKind::Punct("{"))) => {
                // Legacy `let { ... }`
                self.bump();
                self.parse_attrset(true)
            }
            TokenKind::Ident(name) if matches!(name.as_str(), "let" | "with" | "assert" | "if") => {
                self.parse_expr()
            }
            TokenKind::Ident(name) => {
                self.bump();
                if is_keyword(name) {
                    NixNode::Opaque(name.clone())
                } else {
                    NixNode::Ident(name.clone())
                }
            }
            TokenKind::Str(s) => {
                self.bump();
                NixNode::Str(s.clone())
            }
            TokenKind::Uri(u) => {
                self.bump();
                NixNode::Str(u.clone())
            }
            TokenKind::Path(p) => {
                self.bump();
                NixNode::Path(p.clone())
            }
            TokenKind::Number(n) => {
                self.bump();
                NixNode::Opaque(n.clone())
            }
            TokenKind::Interp(raw) => {
                self.bump();
                NixNode::Opaque(raw.clone())
            }
            TokenKind::Punct("(") => {
                self.bump();
                let inner = self.parse_expr();
                self.close_with(")");
                inner
            }
            TokenKind::Punct("[") => self.parse_list(),
            TokenKind::Punct("{") => self.parse_attrset(false),
            TokenKind::Punct(p) => {
                self.bump();
                NixNode::Opaque(p.to_string())
            }
            TokenKind::Unknown(c) => {
                self.bump();
                NixNode::Opaque(c.to_string())
            }
        }
    }

    fn parse_list(&mut self) -> NixNode {
        self.eat_punct("[");
        let mut items = Vec::new();
        while !self.at_punct("]") && self.peek().is_some() {
            if self.eat_punct(",") {
                continue;
            }
            let before = self.pos;
            let item = self.parse_select();
            if self.pos == before {
                self.skip_one();
                continue;
            }
            items.push(item);
        }
        self.eat_punct("]");
        NixNode::List(items)
    }

    fn parse_attrset(&mut self, recursive: bool) -> NixNode {
        self.eat_punct("{");
        let bindings = self.parse_bindings();
        self.close_with("}");
        NixNode::AttrSet {
            recursive,
            bindings,
        }
    }

    /// Parses bindings up to `}`, `in`, or end of input (not consumed).
    fn parse_bindings(&mut self) -> Vec<Binding> {
        let mut bindings = Vec::new();
        loop {
            match self.peek() {
                None => break,
                Some(TokenKind::Punct("}")) | Some(TokenKind::Punct("]")) | Some(TokenKind::Punct(")")) => break,
                Some(TokenKind::Ident(k)) if k == "in" => break,
                Some(TokenKind::Punct(";")) | Some(TokenKind::Punct(",")) => {
                    self.bump();
                    continue;
                }
                _ => {}
            }

            let before = self.pos;
            if self.eat_keyword("inherit") {
                self.parse_inherit(&mut bindings);
            } else if self.at_binding_start() {
                let path = self.parse_attr_path();
                self.eat_punct("=");
                let value = self.parse_expr();
                self.eat_punct(";");
                bindings.push(Binding {
                    path,
                    value,
                    inherited: false,
                });
            } else {
                self.skip_statement();
            }
            if self.pos == before {
                self.skip_one();
            }
        }
        bindings
    }

    fn parse_inherit(&mut self, bindings: &mut Vec<Binding>) {
        let scope = if self.at_punct("(") {
            self.bump();
            let scope = self.parse_expr();
            self.close_with(")");
            Some(scope)
        } else {
            None
        };
        while let Some(tok) = self.peek() {
            let name = match tok {
                TokenKind::Ident(name) if !is_keyword(name) => name.clone(),
                TokenKind::Str(s) => s.clone(),
                _ => break,
            };
            self.bump();
            let value = match &scope {
                Some(NixNode::Ident(base)) => NixNode::Ident(format!("{}.{}", base, name)),
                Some(other) => NixNode::BinOp {
                    op: ".",
                    lhs: Box::new(other.clone()),
                    rhs: Box::new(NixNode::Ident(name.clone())),
                },
                None => NixNode::Ident(name.clone()),
            };
            bindings.push(Binding {
                path: vec![name],
                value,
                inherited: true,
            });
        }
        self.eat_punct(";");
    }

    fn parse_attr_path(&mut self) -> Vec<String> {
        let mut path = Vec::new();
        loop {
            match self.peek() {
                Some(TokenKind::Ident(name)) => path.push(name.clone()),
                Some(TokenKind::Str(s)) => path.push(s.clone()),
                Some(TokenKind::Interp(raw)) => path.push(raw.clone()),
                _ => break,
            }
            self.bump();
            if !self.eat_punct(".") {
                break;
            }
        }
        path
    }

    /// Right-hand side of `?`: an attribute path, kept as text.
    fn parse_attr_path_text(&mut self) -> NixNode {
        NixNode::Opaque(self.parse_attr_path().join("."))
    }

    /// Skips tokens up to and including the next `;` at this nesting level,
    /// stopping before a closer or `in`.
    fn skip_statement(&mut self) {
        while let Some(tok) = self.peek() {
            match tok {
                TokenKind::Punct(";") => {
                    self.bump();
                    return;
                }
                TokenKind::Punct("}") | TokenKind::Punct("]") | TokenKind::Punct(")") => return,
                TokenKind::Ident(k) if k == "in" => return,
                _ => self.skip_one(),
            }
        }
    }

    /// Skips one token, or one whole bracketed group.
    fn skip_one(&mut self) {
        match self.peek() {
            Some(TokenKind::Punct("{")) | Some(TokenKind::Punct("[")) | Some(TokenKind::Punct("(")) => {
                match self.matching_close(self.pos) {
                    Some(close) => self.pos = close + 1,
                    None => self.pos = self.tokens.len(),
                }
            }
            Some(_) => self.pos += 1,
            None => {}
        }
    }

    /// Consumes `closer`, skipping anything left over before it.
    fn close_with(&mut self, closer: &str) {
        while let Some(tok) = self.peek() {
            match tok {
                TokenKind::Punct(p) if *p == closer => {
                    self.bump();
                    return;
                }
                TokenKind::Punct("}") | TokenKind::Punct("]") | TokenKind::Punct(")") => return,
                _ => self.skip_one(),
            }
        }
    }
}
