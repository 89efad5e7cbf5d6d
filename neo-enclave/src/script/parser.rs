//! Recursive-descent parser.
//!
//! Nesting of statements and expressions is bounded so that hostile input
//! cannot exhaust the native stack before any gas is charged.

use super::ast::{
    AssignOp, BinaryOp, DeclKind, Expr, FunctionDecl, LogicalOp, Program, Stmt, UnaryOp,
};
use super::lexer::{syntax, Lexer, Token, TokenKind};
use super::value::format_number;
use crate::error::{ExecutionError, ExecutionResult};
use std::rc::Rc;

/// Maximum combined nesting of statements and expressions.
pub const MAX_NESTING_DEPTH: usize = 128;

/// Parse a complete script.
pub fn parse(source: &str) -> ExecutionResult<Program> {
    let tokens = Lexer::new(source).tokenize()?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let mut body = Vec::new();
    while !parser.at_eof() {
        body.push(parser.statement()?);
    }
    Ok(Program { body })
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn peek_at(&self, offset: usize) -> &TokenKind {
        let index = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[index].kind
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn at_eof(&self) -> bool {
        self.peek().kind == TokenKind::Eof
    }

    fn is_punct(&self, punct: &str) -> bool {
        matches!(self.peek().kind, TokenKind::Punct(p) if p == punct)
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek().kind, TokenKind::Keyword(k) if k == keyword)
    }

    fn eat_punct(&mut self, punct: &str) -> bool {
        if self.is_punct(punct) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, punct: &str) -> ExecutionResult<()> {
        if self.eat_punct(punct) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("expected '{}'", punct)))
        }
    }

    fn expect_identifier(&mut self) -> ExecutionResult<String> {
        match self.peek().kind.clone() {
            TokenKind::Identifier(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected("expected identifier")),
        }
    }

    fn unexpected(&self, context: &str) -> ExecutionError {
        let token = self.peek();
        let found = match &token.kind {
            TokenKind::Number(n) => format!("number {}", format_number(*n)),
            TokenKind::String(_) => "string".to_string(),
            TokenKind::Identifier(name) => format!("identifier '{}'", name),
            TokenKind::Keyword(k) => format!("'{}'", k),
            TokenKind::Punct(p) => format!("'{}'", p),
            TokenKind::Eof => "end of input".to_string(),
        };
        syntax(format!("{}, found {}", context, found), token.line, token.column)
    }

    fn enter(&mut self) -> ExecutionResult<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            let token = self.peek();
            return Err(syntax("nesting too deep", token.line, token.column));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn semicolon(&mut self) {
        self.eat_punct(";");
    }

    fn statement(&mut self) -> ExecutionResult<Stmt> {
        self.enter()?;
        let stmt = self.statement_inner();
        self.leave();
        stmt
    }

    fn statement_inner(&mut self) -> ExecutionResult<Stmt> {
        match self.peek().kind {
            TokenKind::Punct("{") => Ok(Stmt::Block(self.block()?)),
            TokenKind::Punct(";") => {
                self.advance();
                Ok(Stmt::Empty)
            }
            TokenKind::Keyword("function") => Ok(Stmt::Function(self.function(true)?)),
            TokenKind::Keyword("let") | TokenKind::Keyword("const") | TokenKind::Keyword("var") => {
                let stmt = self.declaration()?;
                self.semicolon();
                Ok(stmt)
            }
            TokenKind::Keyword("return") => {
                self.advance();
                let value = if self.is_punct(";") || self.is_punct("}") || self.at_eof() {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.semicolon();
                Ok(Stmt::Return(value))
            }
            TokenKind::Keyword("if") => {
                self.advance();
                self.expect_punct("(")?;
                let test = self.expression()?;
                self.expect_punct(")")?;
                let consequent = Box::new(self.statement()?);
                let alternate = if self.is_keyword("else") {
                    self.advance();
                    Some(Box::new(self.statement()?))
                } else {
                    None
                };
                Ok(Stmt::If {
                    test,
                    consequent,
                    alternate,
                })
            }
            TokenKind::Keyword("while") => {
                self.advance();
                self.expect_punct("(")?;
                let test = self.expression()?;
                self.expect_punct(")")?;
                let body = Box::new(self.statement()?);
                Ok(Stmt::While { test, body })
            }
            TokenKind::Keyword("for") => self.for_statement(),
            TokenKind::Keyword("break") => {
                self.advance();
                self.semicolon();
                Ok(Stmt::Break)
            }
            TokenKind::Keyword("continue") => {
                self.advance();
                self.semicolon();
                Ok(Stmt::Continue)
            }
            TokenKind::Keyword("throw") => {
                self.advance();
                let value = self.expression()?;
                self.semicolon();
                Ok(Stmt::Throw(value))
            }
            _ => {
                let expr = self.expression()?;
                self.semicolon();
                Ok(Stmt::Expr(expr))
            }
        }
    }

    fn block(&mut self) -> ExecutionResult<Vec<Stmt>> {
        self.expect_punct("{")?;
        let mut body = Vec::new();
        while !self.is_punct("}") && !self.at_eof() {
            body.push(self.statement()?);
        }
        self.expect_punct("}")?;
        Ok(body)
    }

    fn decl_kind(&self) -> Option<DeclKind> {
        match self.peek().kind {
            TokenKind::Keyword("let") => Some(DeclKind::Let),
            TokenKind::Keyword("const") => Some(DeclKind::Const),
            TokenKind::Keyword("var") => Some(DeclKind::Var),
            _ => None,
        }
    }

    fn declaration(&mut self) -> ExecutionResult<Stmt> {
        let kind = self
            .decl_kind()
            .ok_or_else(|| self.unexpected("expected declaration"))?;
        self.advance();

        let mut declarations = Vec::new();
        loop {
            let name = self.expect_identifier()?;
            let init = if self.eat_punct("=") {
                Some(self.assignment()?)
            } else if kind == DeclKind::Const {
                return Err(self.unexpected("missing initializer in const declaration"));
            } else {
                None
            };
            declarations.push((name, init));
            if !self.eat_punct(",") {
                break;
            }
        }
        Ok(Stmt::Declare { kind, declarations })
    }

    fn for_statement(&mut self) -> ExecutionResult<Stmt> {
        self.advance();
        self.expect_punct("(")?;

        if let Some(kind) = self.decl_kind() {
            let is_for_of = matches!(self.peek_at(1), TokenKind::Identifier(_))
                && matches!(self.peek_at(2), TokenKind::Keyword("of"));
            if is_for_of {
                self.advance();
                let binding = self.expect_identifier()?;
                self.advance();
                let iterable = self.expression()?;
                self.expect_punct(")")?;
                let body = Box::new(self.statement()?);
                return Ok(Stmt::ForOf {
                    kind,
                    binding,
                    iterable,
                    body,
                });
            }
        }

        let init = if self.is_punct(";") {
            None
        } else if self.decl_kind().is_some() {
            Some(Box::new(self.declaration()?))
        } else {
            Some(Box::new(Stmt::Expr(self.expression()?)))
        };
        self.expect_punct(";")?;
        let test = if self.is_punct(";") {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect_punct(";")?;
        let update = if self.is_punct(")") {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect_punct(")")?;
        let body = Box::new(self.statement()?);
        Ok(Stmt::For {
            init,
            test,
            update,
            body,
        })
    }

    fn function(&mut self, require_name: bool) -> ExecutionResult<Rc<FunctionDecl>> {
        self.advance();
        let name = match self.peek().kind.clone() {
            TokenKind::Identifier(name) => {
                self.advance();
                Some(name)
            }
            _ if require_name => return Err(self.unexpected("expected function name")),
            _ => None,
        };

        self.expect_punct("(")?;
        let mut params = Vec::new();
        while !self.is_punct(")") {
            params.push(self.expect_identifier()?);
            if !self.eat_punct(",") {
                break;
            }
        }
        self.expect_punct(")")?;
        let body = self.block()?;
        Ok(Rc::new(FunctionDecl { name, params, body }))
    }

    fn expression(&mut self) -> ExecutionResult<Expr> {
        self.assignment()
    }

    fn assignment(&mut self) -> ExecutionResult<Expr> {
        self.enter()?;
        let result = self.assignment_inner();
        self.leave();
        result
    }

    fn assignment_inner(&mut self) -> ExecutionResult<Expr> {
        let target = self.conditional()?;
        let op = match self.peek().kind {
            TokenKind::Punct("=") => AssignOp::Assign,
            TokenKind::Punct("+=") => AssignOp::Compound(BinaryOp::Add),
            TokenKind::Punct("-=") => AssignOp::Compound(BinaryOp::Sub),
            TokenKind::Punct("*=") => AssignOp::Compound(BinaryOp::Mul),
            TokenKind::Punct("/=") => AssignOp::Compound(BinaryOp::Div),
            TokenKind::Punct("%=") => AssignOp::Compound(BinaryOp::Rem),
            _ => return Ok(target),
        };
        if !target.is_assignable() {
            return Err(self.unexpected("invalid assignment target"));
        }
        self.advance();
        let value = self.assignment()?;
        Ok(Expr::Assign {
            op,
            target: Box::new(target),
            value: Box::new(value),
        })
    }

    fn conditional(&mut self) -> ExecutionResult<Expr> {
        let test = self.logical_or()?;
        if !self.eat_punct("?") {
            return Ok(test);
        }
        let consequent = self.assignment()?;
        self.expect_punct(":")?;
        let alternate = self.assignment()?;
        Ok(Expr::Conditional {
            test: Box::new(test),
            consequent: Box::new(consequent),
            alternate: Box::new(alternate),
        })
    }

    fn logical_or(&mut self) -> ExecutionResult<Expr> {
        let mut left = self.logical_and()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Punct("||") => LogicalOp::Or,
                TokenKind::Punct("??") => LogicalOp::Nullish,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.logical_and()?;
            left = Expr::Logical {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn logical_and(&mut self) -> ExecutionResult<Expr> {
        let mut left = self.equality()?;
        while self.eat_punct("&&") {
            let right = self.equality()?;
            left = Expr::Logical {
                op: LogicalOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn binary_level(
        &mut self,
        operators: &[(&str, BinaryOp)],
        next: fn(&mut Self) -> ExecutionResult<Expr>,
    ) -> ExecutionResult<Expr> {
        let mut left = next(self)?;
        loop {
            let op = match &self.peek().kind {
                TokenKind::Punct(p) => operators.iter().find(|(text, _)| text == p).map(|(_, op)| *op),
                _ => None,
            };
            let Some(op) = op else {
                return Ok(left);
            };
            self.advance();
            let right = next(self)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn equality(&mut self) -> ExecutionResult<Expr> {
        self.binary_level(
            &[
                ("===", BinaryOp::Eq),
                ("==", BinaryOp::Eq),
                ("!==", BinaryOp::NotEq),
                ("!=", BinaryOp::NotEq),
            ],
            Self::relational,
        )
    }

    fn relational(&mut self) -> ExecutionResult<Expr> {
        self.binary_level(
            &[
                ("<", BinaryOp::Lt),
                ("<=", BinaryOp::LtEq),
                (">", BinaryOp::Gt),
                (">=", BinaryOp::GtEq),
            ],
            Self::additive,
        )
    }

    fn additive(&mut self) -> ExecutionResult<Expr> {
        self.binary_level(&[("+", BinaryOp::Add), ("-", BinaryOp::Sub)], Self::multiplicative)
    }

    fn multiplicative(&mut self) -> ExecutionResult<Expr> {
        self.binary_level(
            &[("*", BinaryOp::Mul), ("/", BinaryOp::Div), ("%", BinaryOp::Rem)],
            Self::unary,
        )
    }

    fn unary(&mut self) -> ExecutionResult<Expr> {
        self.enter()?;
        let result = self.unary_inner();
        self.leave();
        result
    }

    fn unary_inner(&mut self) -> ExecutionResult<Expr> {
        let op = match self.peek().kind {
            TokenKind::Punct("!") => Some(UnaryOp::Not),
            TokenKind::Punct("-") => Some(UnaryOp::Negate),
            TokenKind::Punct("+") => Some(UnaryOp::Plus),
            TokenKind::Keyword("typeof") => Some(UnaryOp::TypeOf),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.unary()?;
            return Ok(Expr::Unary {
                op,
                operand: Box::new(operand),
            });
        }

        if self.is_punct("++") || self.is_punct("--") {
            let increment = self.is_punct("++");
            self.advance();
            let target = self.unary()?;
            if !target.is_assignable() {
                return Err(self.unexpected("invalid update target"));
            }
            return Ok(Expr::Update {
                increment,
                prefix: true,
                target: Box::new(target),
            });
        }

        let expr = self.call_member()?;
        if expr.is_assignable() && (self.is_punct("++") || self.is_punct("--")) {
            let increment = self.is_punct("++");
            self.advance();
            return Ok(Expr::Update {
                increment,
                prefix: false,
                target: Box::new(expr),
            });
        }
        Ok(expr)
    }

    fn call_member(&mut self) -> ExecutionResult<Expr> {
        let mut expr = self.primary()?;
        loop {
            if self.eat_punct(".") {
                let property = match self.advance().kind {
                    TokenKind::Identifier(name) => name,
                    TokenKind::Keyword(k) => k.to_string(),
                    _ => return Err(self.unexpected("expected property name")),
                };
                expr = Expr::Member {
                    object: Box::new(expr),
                    property,
                };
            } else if self.eat_punct("[") {
                let index = self.expression()?;
                self.expect_punct("]")?;
                expr = Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                };
            } else if self.eat_punct("(") {
                let mut args = Vec::new();
                while !self.is_punct(")") {
                    args.push(self.assignment()?);
                    if !self.eat_punct(",") {
                        break;
                    }
                }
                self.expect_punct(")")?;
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args,
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> ExecutionResult<Expr> {
        match self.peek().kind.clone() {
            TokenKind::Number(n) => {
                self.advance();
                Ok(Expr::Number(n))
            }
            TokenKind::String(s) => {
                self.advance();
                Ok(Expr::String(s))
            }
            TokenKind::Identifier(name) => {
                self.advance();
                Ok(Expr::Identifier(name))
            }
            TokenKind::Keyword("true") => {
                self.advance();
                Ok(Expr::Bool(true))
            }
            TokenKind::Keyword("false") => {
                self.advance();
                Ok(Expr::Bool(false))
            }
            TokenKind::Keyword("null") => {
                self.advance();
                Ok(Expr::Null)
            }
            TokenKind::Keyword("undefined") => {
                self.advance();
                Ok(Expr::Undefined)
            }
            TokenKind::Keyword("function") => Ok(Expr::Function(self.function(false)?)),
            TokenKind::Punct("(") => {
                self.advance();
                let expr = self.expression()?;
                self.expect_punct(")")?;
                Ok(expr)
            }
            TokenKind::Punct("[") => {
                self.advance();
                let mut elements = Vec::new();
                while !self.is_punct("]") {
                    elements.push(self.assignment()?);
                    if !self.eat_punct(",") {
                        break;
                    }
                }
                self.expect_punct("]")?;
                Ok(Expr::Array(elements))
            }
            TokenKind::Punct("{") => self.object_literal(),
            _ => Err(self.unexpected("unexpected token")),
        }
    }

    fn object_literal(&mut self) -> ExecutionResult<Expr> {
        self.advance();
        let mut properties = Vec::new();
        while !self.is_punct("}") {
            let token = self.advance();
            let (key, shorthand) = match token.kind {
                TokenKind::Identifier(name) => (name, true),
                TokenKind::Keyword(k) => (k.to_string(), false),
                TokenKind::String(s) => (s, false),
                TokenKind::Number(n) => (format_number(n), false),
                _ => {
                    return Err(syntax(
                        "expected property name",
                        token.line,
                        token.column,
                    ))
                }
            };
            let value = if self.eat_punct(":") {
                self.assignment()?
            } else if shorthand {
                Expr::Identifier(key.clone())
            } else {
                return Err(self.unexpected("expected ':'"));
            };
            properties.push((key, value));
            if !self.eat_punct(",") {
                break;
            }
        }
        self.expect_punct("}")?;
        Ok(Expr::Object(properties))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence() {
        let program = parse("1 + 2 * 3;").unwrap();
        let Stmt::Expr(Expr::Binary { op, right, .. }) = &program.body[0] else {
            panic!("expected binary expression");
        };
        assert_eq!(*op, BinaryOp::Add);
        assert!(matches!(**right, Expr::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn test_function_and_loops() {
        let program = parse(
            r#"
            function main(input) {
                let total = 0;
                for (let i = 0; i < input.n; i++) { total += i; }
                for (const x of input.items) { if (x) continue; else break; }
                while (false) {}
                return { total, ok: true, "quoted": [1, 2,] };
            }
            "#,
        )
        .unwrap();
        let Stmt::Function(decl) = &program.body[0] else {
            panic!("expected function");
        };
        assert_eq!(decl.name.as_deref(), Some("main"));
        assert_eq!(decl.params, vec!["input"]);
        assert_eq!(decl.body.len(), 5);
        assert!(matches!(decl.body[2], Stmt::ForOf { .. }));
    }

    #[test]
    fn test_syntax_errors_report_position() {
        let err = parse("let x = ;").unwrap_err();
        assert!(matches!(err, ExecutionError::Syntax { line: 1, column: 9, .. }));

        assert!(parse("function () {}").is_err());
        assert!(parse("const x;").is_err());
        assert!(parse("1 = 2;").is_err());
        assert!(parse("if (x {").is_err());
    }

    #[test]
    fn test_nesting_is_bounded() {
        let deep = format!("{}1{}", "(".repeat(500), ")".repeat(500));
        let err = parse(&deep).unwrap_err();
        assert!(err.to_string().contains("nesting too deep"));

        let blocks = format!("{}{}", "{".repeat(500), "}".repeat(500));
        assert!(parse(&blocks).is_err());
    }
}
