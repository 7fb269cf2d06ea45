//! Parser
//!
//! Recursive descent with Pratt precedence climbing for expressions.
//! The parser keeps the current and one lookahead token; `cur` is
//! always the first unconsumed token. Errors are pushed onto the
//! shared list with the offending token's position, and parsing
//! resynchronizes at the next statement boundary so several errors
//! can be reported from one pass.

use brio_core::{BrioError, ErrorList, Pos};

use crate::ast::{Expr, ExprKind, FnLit, Ident, IfCase, Operator, Stmt, StmtKind};
use crate::lexer::Lexer;
use crate::token::{Token, TokenKind};

/// Recursion guard for pathological nesting.
const MAX_EXPR_DEPTH: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    Lowest,
    Assign,
    Ternary,
    LogicalOr,
    LogicalAnd,
    BitOr,
    BitXor,
    BitAnd,
    Equals,
    LessGreater,
    Shift,
    Sum,
    Product,
    Prefix,
    Incdec,
    Postfix,
    Highest,
}

fn precedence_of(kind: TokenKind) -> Precedence {
    use TokenKind::*;
    match kind {
        Assign | PlusAssign | MinusAssign | AsteriskAssign | SlashAssign | PercentAssign
        | BitAndAssign | BitOrAssign | BitXorAssign | LshiftAssign | RshiftAssign => {
            Precedence::Assign
        }
        Question => Precedence::Ternary,
        Or => Precedence::LogicalOr,
        And => Precedence::LogicalAnd,
        BitOr => Precedence::BitOr,
        BitXor => Precedence::BitXor,
        BitAnd => Precedence::BitAnd,
        Eq | NotEq => Precedence::Equals,
        Lt | Lte | Gt | Gte => Precedence::LessGreater,
        Lshift | Rshift => Precedence::Shift,
        Plus | Minus => Precedence::Sum,
        Asterisk | Slash | Percent => Precedence::Product,
        PlusPlus | MinusMinus => Precedence::Incdec,
        Lparen | Lbracket | Dot => Precedence::Postfix,
        _ => Precedence::Lowest,
    }
}

pub struct Parser<'a> {
    lexer: Lexer,
    errors: &'a mut ErrorList,
    repl_mode: bool,
    /// Block nesting depth; the repl map-vs-block exception only
    /// applies at depth 0.
    depth: usize,
    expr_depth: usize,
    cur: Token,
    peek: Token,
}

impl<'a> Parser<'a> {
    pub fn new(mut lexer: Lexer, repl_mode: bool, errors: &'a mut ErrorList) -> Parser<'a> {
        let cur = lexer.next_token();
        let peek = lexer.next_token();
        Parser {
            lexer,
            errors,
            repl_mode,
            depth: 0,
            expr_depth: 0,
            cur,
            peek,
        }
    }

    pub fn parse_program(&mut self) -> Vec<Stmt> {
        let mut statements = Vec::new();
        while !self.cur_is(TokenKind::Eof) {
            if self.errors.len() >= brio_core::error::MAX_ERRORS {
                break;
            }
            match self.parse_statement() {
                Some(stmt) => statements.push(stmt),
                None => self.synchronize(),
            }
        }
        statements
    }

    // ------------------------------------------------------------------
    // Token plumbing
    // ------------------------------------------------------------------

    fn advance(&mut self) {
        self.cur = std::mem::replace(&mut self.peek, self.lexer.next_token());
    }

    fn cur_is(&self, kind: TokenKind) -> bool {
        self.cur.kind == kind
    }

    fn peek_is(&self, kind: TokenKind) -> bool {
        self.peek.kind == kind
    }

    fn expect(&mut self, kind: TokenKind) -> Option<()> {
        if self.cur_is(kind) {
            self.advance();
            Some(())
        } else {
            self.error(format!(
                "expected '{}', got '{}'",
                kind.name(),
                self.cur.literal
            ));
            None
        }
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors
            .push(BrioError::parsing(message, self.cur.pos.clone()));
    }

    /// Skip to the next statement boundary after an error.
    fn synchronize(&mut self) {
        if self.cur_is(TokenKind::Eof) {
            return;
        }
        self.advance();
        while !self.cur_is(TokenKind::Eof)
            && !self.cur_is(TokenKind::Semicolon)
            && !self.cur_is(TokenKind::Rbrace)
        {
            self.advance();
        }
        if self.cur_is(TokenKind::Semicolon) {
            self.advance();
        }
    }

    fn skip_semicolon(&mut self) {
        if self.cur_is(TokenKind::Semicolon) {
            self.advance();
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn parse_statement(&mut self) -> Option<Stmt> {
        let stmt = match self.cur.kind {
            TokenKind::Var | TokenKind::Const => {
                let s = self.parse_define()?;
                self.skip_semicolon();
                s
            }
            TokenKind::Function if self.peek_is(TokenKind::Ident) => {
                self.parse_function_declaration()?
            }
            TokenKind::If => self.parse_if()?,
            TokenKind::Return => self.parse_return()?,
            TokenKind::While => self.parse_while()?,
            TokenKind::For => self.parse_for()?,
            TokenKind::Break => {
                let pos = self.cur.pos.clone();
                self.advance();
                self.skip_semicolon();
                Stmt::new(StmtKind::Break, pos)
            }
            TokenKind::Continue => {
                let pos = self.cur.pos.clone();
                self.advance();
                self.skip_semicolon();
                Stmt::new(StmtKind::Continue, pos)
            }
            TokenKind::Import => self.parse_import()?,
            TokenKind::Recover => self.parse_recover()?,
            TokenKind::Lbrace if !(self.repl_mode && self.depth == 0) => {
                let pos = self.cur.pos.clone();
                let body = self.parse_block()?;
                Stmt::new(StmtKind::Block(body), pos)
            }
            _ => self.parse_expression_statement()?,
        };
        Some(stmt)
    }

    fn parse_define(&mut self) -> Option<Stmt> {
        let pos = self.cur.pos.clone();
        let assignable = self.cur_is(TokenKind::Var);
        self.advance();
        let name = self.parse_ident()?;
        self.expect(TokenKind::Assign)?;
        let mut value = self.parse_expression(Precedence::Lowest)?;
        if let ExprKind::FnLit(f) = &mut value.kind {
            if f.name.is_none() {
                f.name = Some(name.name.clone());
            }
        }
        Some(Stmt::new(
            StmtKind::Define {
                name,
                value: Box::new(value),
                assignable,
            },
            pos,
        ))
    }

    /// `fn name(params) { ... }` is sugar for a non-assignable
    /// definition binding a named function literal.
    fn parse_function_declaration(&mut self) -> Option<Stmt> {
        let pos = self.cur.pos.clone();
        self.advance(); // fn
        let name = self.parse_ident()?;
        let (params, body) = self.parse_function_signature()?;
        let fnlit = FnLit {
            name: Some(name.name.clone()),
            params,
            body,
        };
        Some(Stmt::new(
            StmtKind::Define {
                name,
                value: Box::new(Expr::new(ExprKind::FnLit(fnlit), pos.clone())),
                assignable: false,
            },
            pos,
        ))
    }

    fn parse_if(&mut self) -> Option<Stmt> {
        let pos = self.cur.pos.clone();
        self.advance(); // if
        let mut cases = vec![self.parse_if_case()?];
        let mut alternative = None;
        while self.cur_is(TokenKind::Else) {
            if self.peek_is(TokenKind::If) {
                self.advance();
                self.advance();
                cases.push(self.parse_if_case()?);
            } else {
                self.advance();
                alternative = Some(self.parse_block()?);
                break;
            }
        }
        Some(Stmt::new(StmtKind::If { cases, alternative }, pos))
    }

    fn parse_if_case(&mut self) -> Option<IfCase> {
        self.expect(TokenKind::Lparen)?;
        let test = self.parse_expression(Precedence::Lowest)?;
        self.expect(TokenKind::Rparen)?;
        let consequence = self.parse_block()?;
        Some(IfCase { test, consequence })
    }

    fn parse_return(&mut self) -> Option<Stmt> {
        let pos = self.cur.pos.clone();
        self.advance();
        let value = if self.cur_is(TokenKind::Semicolon)
            || self.cur_is(TokenKind::Rbrace)
            || self.cur_is(TokenKind::Eof)
        {
            None
        } else {
            Some(self.parse_expression(Precedence::Lowest)?)
        };
        self.skip_semicolon();
        Some(Stmt::new(StmtKind::Return(value), pos))
    }

    fn parse_while(&mut self) -> Option<Stmt> {
        let pos = self.cur.pos.clone();
        self.advance();
        self.expect(TokenKind::Lparen)?;
        let test = self.parse_expression(Precedence::Lowest)?;
        self.expect(TokenKind::Rparen)?;
        let body = self.parse_block()?;
        Some(Stmt::new(StmtKind::While { test, body }, pos))
    }

    fn parse_for(&mut self) -> Option<Stmt> {
        let pos = self.cur.pos.clone();
        self.advance();
        self.expect(TokenKind::Lparen)?;

        if self.cur_is(TokenKind::Ident) && self.peek_is(TokenKind::In) {
            let iterator = self.parse_ident()?;
            self.advance(); // in
            let source = self.parse_expression(Precedence::Lowest)?;
            self.expect(TokenKind::Rparen)?;
            let body = self.parse_block()?;
            return Some(Stmt::new(
                StmtKind::Foreach {
                    iterator,
                    source,
                    body,
                },
                pos,
            ));
        }

        let init = if self.cur_is(TokenKind::Semicolon) {
            self.advance();
            None
        } else {
            let stmt = if self.cur_is(TokenKind::Var) || self.cur_is(TokenKind::Const) {
                self.parse_define()?
            } else {
                let expr_pos = self.cur.pos.clone();
                let expr = self.parse_expression(Precedence::Lowest)?;
                Stmt::new(StmtKind::Expression(expr), expr_pos)
            };
            self.expect(TokenKind::Semicolon)?;
            Some(Box::new(stmt))
        };

        let test = if self.cur_is(TokenKind::Semicolon) {
            None
        } else {
            Some(self.parse_expression(Precedence::Lowest)?)
        };
        self.expect(TokenKind::Semicolon)?;

        let update = if self.cur_is(TokenKind::Rparen) {
            None
        } else {
            Some(self.parse_expression(Precedence::Lowest)?)
        };
        self.expect(TokenKind::Rparen)?;

        let body = self.parse_block()?;
        Some(Stmt::new(
            StmtKind::For {
                init,
                test,
                update,
                body,
            },
            pos,
        ))
    }

    fn parse_import(&mut self) -> Option<Stmt> {
        let pos = self.cur.pos.clone();
        self.advance();
        if !self.cur_is(TokenKind::String) {
            self.error("expected module path string after 'import'");
            return None;
        }
        let path = process_escapes(&self.cur.literal);
        self.advance();
        self.skip_semicolon();
        Some(Stmt::new(StmtKind::Import { path }, pos))
    }

    fn parse_recover(&mut self) -> Option<Stmt> {
        let pos = self.cur.pos.clone();
        self.advance();
        self.expect(TokenKind::Lparen)?;
        let error_ident = self.parse_ident()?;
        self.expect(TokenKind::Rparen)?;
        let body = self.parse_block()?;
        Some(Stmt::new(StmtKind::Recover { error_ident, body }, pos))
    }

    fn parse_expression_statement(&mut self) -> Option<Stmt> {
        let pos = self.cur.pos.clone();
        let expr = self.parse_expression(Precedence::Lowest)?;
        if !(self.repl_mode && self.depth == 0)
            && !matches!(expr.kind, ExprKind::Call { .. } | ExprKind::Assign { .. })
        {
            self.errors.push(BrioError::parsing(
                "only assignments and function calls can be used as statements",
                pos,
            ));
            return None;
        }
        self.skip_semicolon();
        Some(Stmt::new(StmtKind::Expression(expr), pos))
    }

    fn parse_block(&mut self) -> Option<Vec<Stmt>> {
        self.expect(TokenKind::Lbrace)?;
        self.depth += 1;
        let mut statements = Vec::new();
        while !self.cur_is(TokenKind::Rbrace) && !self.cur_is(TokenKind::Eof) {
            if self.errors.len() >= brio_core::error::MAX_ERRORS {
                break;
            }
            match self.parse_statement() {
                Some(stmt) => statements.push(stmt),
                None => self.synchronize(),
            }
        }
        self.depth -= 1;
        self.expect(TokenKind::Rbrace)?;
        Some(statements)
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn parse_expression(&mut self, prec: Precedence) -> Option<Expr> {
        if self.expr_depth >= MAX_EXPR_DEPTH {
            self.error("expression nested too deeply");
            return None;
        }
        self.expr_depth += 1;
        let result = self.parse_expression_inner(prec);
        self.expr_depth -= 1;
        result
    }

    fn parse_expression_inner(&mut self, prec: Precedence) -> Option<Expr> {
        let mut left = self.parse_prefix()?;
        while prec < precedence_of(self.cur.kind) {
            left = self.parse_infix(left)?;
        }
        Some(left)
    }

    fn parse_prefix(&mut self) -> Option<Expr> {
        let pos = self.cur.pos.clone();
        match self.cur.kind {
            TokenKind::Ident => {
                let ident = Ident {
                    name: self.cur.literal.clone(),
                    pos: pos.clone(),
                };
                self.advance();
                Some(Expr::new(ExprKind::Ident(ident), pos))
            }
            TokenKind::Number => {
                let Some(n) = parse_number_literal(&self.cur.literal) else {
                    self.error(format!("invalid number literal '{}'", self.cur.literal));
                    return None;
                };
                self.advance();
                Some(Expr::new(ExprKind::NumberLit(n), pos))
            }
            TokenKind::String => {
                let s = process_escapes(&self.cur.literal);
                self.advance();
                Some(Expr::new(ExprKind::StringLit(s), pos))
            }
            TokenKind::TemplateString => self.parse_template(),
            TokenKind::True | TokenKind::False => {
                let b = self.cur_is(TokenKind::True);
                self.advance();
                Some(Expr::new(ExprKind::BoolLit(b), pos))
            }
            TokenKind::Null => {
                self.advance();
                Some(Expr::new(ExprKind::NullLit, pos))
            }
            TokenKind::Bang | TokenKind::Minus => {
                let op = if self.cur_is(TokenKind::Bang) {
                    Operator::Bang
                } else {
                    Operator::Minus
                };
                self.advance();
                let right = self.parse_expression(Precedence::Prefix)?;
                Some(Expr::new(
                    ExprKind::Prefix {
                        op,
                        right: Box::new(right),
                    },
                    pos,
                ))
            }
            TokenKind::PlusPlus | TokenKind::MinusMinus => {
                let op = if self.cur_is(TokenKind::PlusPlus) {
                    Operator::Plus
                } else {
                    Operator::Minus
                };
                self.advance();
                let dest = self.parse_expression(Precedence::Prefix)?;
                Some(self.make_incdec(dest, op, false, pos))
            }
            TokenKind::Lparen => {
                self.advance();
                let expr = self.parse_expression(Precedence::Lowest)?;
                self.expect(TokenKind::Rparen)?;
                Some(expr)
            }
            TokenKind::Lbracket => self.parse_array_literal(),
            TokenKind::Lbrace => self.parse_map_literal(),
            TokenKind::Function => {
                self.advance();
                let (params, body) = self.parse_function_signature()?;
                Some(Expr::new(
                    ExprKind::FnLit(FnLit {
                        name: None,
                        params,
                        body,
                    }),
                    pos,
                ))
            }
            TokenKind::UnterminatedString => {
                self.error("unterminated string literal");
                None
            }
            _ => {
                self.error(format!("unexpected token '{}'", self.cur.literal));
                None
            }
        }
    }

    fn parse_infix(&mut self, left: Expr) -> Option<Expr> {
        let pos = self.cur.pos.clone();
        match self.cur.kind {
            TokenKind::Plus
            | TokenKind::Minus
            | TokenKind::Asterisk
            | TokenKind::Slash
            | TokenKind::Percent
            | TokenKind::Eq
            | TokenKind::NotEq
            | TokenKind::Lt
            | TokenKind::Lte
            | TokenKind::Gt
            | TokenKind::Gte
            | TokenKind::BitAnd
            | TokenKind::BitOr
            | TokenKind::BitXor
            | TokenKind::Lshift
            | TokenKind::Rshift => {
                let op = binary_operator_of(self.cur.kind);
                let prec = precedence_of(self.cur.kind);
                self.advance();
                let right = self.parse_expression(prec)?;
                Some(Expr::new(
                    ExprKind::Infix {
                        op,
                        left: Box::new(left),
                        right: Box::new(right),
                    },
                    pos,
                ))
            }
            TokenKind::And | TokenKind::Or => {
                let op = if self.cur_is(TokenKind::And) {
                    Operator::LogicalAnd
                } else {
                    Operator::LogicalOr
                };
                let prec = precedence_of(self.cur.kind);
                self.advance();
                let right = self.parse_expression(prec)?;
                Some(Expr::new(
                    ExprKind::Logical {
                        op,
                        left: Box::new(left),
                        right: Box::new(right),
                    },
                    pos,
                ))
            }
            TokenKind::Lparen => self.parse_call(left),
            TokenKind::Lbracket => {
                self.advance();
                let index = self.parse_expression(Precedence::Lowest)?;
                self.expect(TokenKind::Rbracket)?;
                Some(Expr::new(
                    ExprKind::Index {
                        left: Box::new(left),
                        index: Box::new(index),
                    },
                    pos,
                ))
            }
            TokenKind::Dot => {
                self.advance();
                let name = self.parse_ident()?;
                let key = Expr::new(ExprKind::StringLit(name.name), name.pos);
                Some(Expr::new(
                    ExprKind::Index {
                        left: Box::new(left),
                        index: Box::new(key),
                    },
                    pos,
                ))
            }
            TokenKind::Question => {
                self.advance();
                let if_true = self.parse_expression(Precedence::Lowest)?;
                self.expect(TokenKind::Colon)?;
                let if_false = self.parse_expression(Precedence::Lowest)?;
                Some(Expr::new(
                    ExprKind::Ternary {
                        test: Box::new(left),
                        if_true: Box::new(if_true),
                        if_false: Box::new(if_false),
                    },
                    pos,
                ))
            }
            TokenKind::Assign => {
                self.advance();
                let source = self.parse_expression(Precedence::Lowest)?;
                self.check_assignable(&left)?;
                Some(Expr::new(
                    ExprKind::Assign {
                        dest: Box::new(left),
                        source: Box::new(source),
                        is_postfix: false,
                    },
                    pos,
                ))
            }
            TokenKind::PlusAssign
            | TokenKind::MinusAssign
            | TokenKind::AsteriskAssign
            | TokenKind::SlashAssign
            | TokenKind::PercentAssign
            | TokenKind::BitAndAssign
            | TokenKind::BitOrAssign
            | TokenKind::BitXorAssign
            | TokenKind::LshiftAssign
            | TokenKind::RshiftAssign => {
                let op = compound_operator_of(self.cur.kind);
                self.advance();
                let source = self.parse_expression(Precedence::Lowest)?;
                self.check_assignable(&left)?;
                let combined = Expr::new(
                    ExprKind::Infix {
                        op,
                        left: Box::new(left.clone()),
                        right: Box::new(source),
                    },
                    pos.clone(),
                );
                Some(Expr::new(
                    ExprKind::Assign {
                        dest: Box::new(left),
                        source: Box::new(combined),
                        is_postfix: false,
                    },
                    pos,
                ))
            }
            TokenKind::PlusPlus | TokenKind::MinusMinus => {
                let op = if self.cur_is(TokenKind::PlusPlus) {
                    Operator::Plus
                } else {
                    Operator::Minus
                };
                self.advance();
                self.check_assignable(&left)?;
                Some(self.make_incdec(left, op, true, pos))
            }
            _ => {
                self.error(format!("unexpected token '{}'", self.cur.literal));
                None
            }
        }
    }

    /// `x++` / `--x` desugar to an assignment of `x op 1` with the
    /// postfix flag selecting pre- or post-value.
    fn make_incdec(&mut self, dest: Expr, op: Operator, is_postfix: bool, pos: Pos) -> Expr {
        let one = Expr::new(ExprKind::NumberLit(1.0), pos.clone());
        let source = Expr::new(
            ExprKind::Infix {
                op,
                left: Box::new(dest.clone()),
                right: Box::new(one),
            },
            pos.clone(),
        );
        Expr::new(
            ExprKind::Assign {
                dest: Box::new(dest),
                source: Box::new(source),
                is_postfix,
            },
            pos,
        )
    }

    fn check_assignable(&mut self, dest: &Expr) -> Option<()> {
        match dest.kind {
            ExprKind::Ident(_) | ExprKind::Index { .. } => Some(()),
            _ => {
                self.errors.push(BrioError::parsing(
                    "invalid assignment target",
                    dest.pos.clone(),
                ));
                None
            }
        }
    }

    fn parse_call(&mut self, function: Expr) -> Option<Expr> {
        let pos = self.cur.pos.clone();
        self.advance(); // (
        let mut args = Vec::new();
        while !self.cur_is(TokenKind::Rparen) && !self.cur_is(TokenKind::Eof) {
            args.push(self.parse_expression(Precedence::Lowest)?);
            if !self.cur_is(TokenKind::Comma) {
                break;
            }
            self.advance();
        }
        self.expect(TokenKind::Rparen)?;
        Some(Expr::new(
            ExprKind::Call {
                function: Box::new(function),
                args,
            },
            pos,
        ))
    }

    fn parse_array_literal(&mut self) -> Option<Expr> {
        let pos = self.cur.pos.clone();
        self.advance(); // [
        let mut elements = Vec::new();
        while !self.cur_is(TokenKind::Rbracket) && !self.cur_is(TokenKind::Eof) {
            elements.push(self.parse_expression(Precedence::Lowest)?);
            if !self.cur_is(TokenKind::Comma) {
                break;
            }
            self.advance();
        }
        self.expect(TokenKind::Rbracket)?;
        Some(Expr::new(ExprKind::ArrayLit(elements), pos))
    }

    fn parse_map_literal(&mut self) -> Option<Expr> {
        let pos = self.cur.pos.clone();
        self.advance(); // {
        let mut keys = Vec::new();
        let mut values = Vec::new();
        while !self.cur_is(TokenKind::Rbrace) && !self.cur_is(TokenKind::Eof) {
            // Bare identifier keys are string sugar: {a: 1} == {"a": 1}.
            let key = if self.cur_is(TokenKind::Ident) && self.peek_is(TokenKind::Colon) {
                let key_pos = self.cur.pos.clone();
                let key = Expr::new(ExprKind::StringLit(self.cur.literal.clone()), key_pos);
                self.advance();
                key
            } else {
                self.parse_expression(Precedence::Lowest)?
            };
            self.expect(TokenKind::Colon)?;
            let value = self.parse_expression(Precedence::Lowest)?;
            keys.push(key);
            values.push(value);
            if !self.cur_is(TokenKind::Comma) {
                break;
            }
            self.advance();
        }
        self.expect(TokenKind::Rbrace)?;
        Some(Expr::new(ExprKind::MapLit { keys, values }, pos))
    }

    fn parse_function_signature(&mut self) -> Option<(Vec<Ident>, Vec<Stmt>)> {
        self.expect(TokenKind::Lparen)?;
        let mut params = Vec::new();
        while !self.cur_is(TokenKind::Rparen) && !self.cur_is(TokenKind::Eof) {
            params.push(self.parse_ident()?);
            if !self.cur_is(TokenKind::Comma) {
                break;
            }
            self.advance();
        }
        self.expect(TokenKind::Rparen)?;
        let body = self.parse_block()?;
        Some((params, body))
    }

    /// A template-string token desugars to
    /// `(head + to_str(inner)) + rest`: after the inner expression's
    /// closing `}` the parser pushes the over-read token back into the
    /// lexer, switches it into template mode, and parses the rest of
    /// the string (possibly another template segment) at the highest
    /// precedence.
    fn parse_template(&mut self) -> Option<Expr> {
        let pos = self.cur.pos.clone();
        let head = Expr::new(
            ExprKind::StringLit(process_escapes(&self.cur.literal)),
            pos.clone(),
        );
        self.advance();
        self.expect(TokenKind::Lbrace)?;
        let inner = self.parse_expression(Precedence::Lowest)?;
        if !self.cur_is(TokenKind::Rbrace) {
            self.error(format!("expected '}}', got '{}'", self.cur.literal));
            return None;
        }
        // `peek` was lexed as ordinary code but belongs to the string:
        // push it back and resume the template scan after the '}'.
        self.lexer.rewind();
        self.lexer.continue_template_string();
        self.cur = self.lexer.next_token();
        self.peek = self.lexer.next_token();

        let rest = self.parse_expression(Precedence::Highest)?;

        let to_str_call = Expr::new(
            ExprKind::Call {
                function: Box::new(Expr::new(
                    ExprKind::Ident(Ident {
                        name: "to_str".to_string(),
                        pos: inner.pos.clone(),
                    }),
                    inner.pos.clone(),
                )),
                args: vec![inner],
            },
            pos.clone(),
        );
        let left = Expr::new(
            ExprKind::Infix {
                op: Operator::Plus,
                left: Box::new(head),
                right: Box::new(to_str_call),
            },
            pos.clone(),
        );
        Some(Expr::new(
            ExprKind::Infix {
                op: Operator::Plus,
                left: Box::new(left),
                right: Box::new(rest),
            },
            pos,
        ))
    }

    fn parse_ident(&mut self) -> Option<Ident> {
        if !self.cur_is(TokenKind::Ident) {
            self.error(format!("expected identifier, got '{}'", self.cur.literal));
            return None;
        }
        let ident = Ident {
            name: self.cur.literal.clone(),
            pos: self.cur.pos.clone(),
        };
        self.advance();
        Some(ident)
    }
}

fn binary_operator_of(kind: TokenKind) -> Operator {
    match kind {
        TokenKind::Plus => Operator::Plus,
        TokenKind::Minus => Operator::Minus,
        TokenKind::Asterisk => Operator::Asterisk,
        TokenKind::Slash => Operator::Slash,
        TokenKind::Percent => Operator::Modulus,
        TokenKind::Eq => Operator::Eq,
        TokenKind::NotEq => Operator::NotEq,
        TokenKind::Lt => Operator::Lt,
        TokenKind::Lte => Operator::Lte,
        TokenKind::Gt => Operator::Gt,
        TokenKind::Gte => Operator::Gte,
        TokenKind::BitAnd => Operator::BitAnd,
        TokenKind::BitOr => Operator::BitOr,
        TokenKind::BitXor => Operator::BitXor,
        TokenKind::Lshift => Operator::Lshift,
        TokenKind::Rshift => Operator::Rshift,
        _ => unreachable!("not a binary operator token"),
    }
}

fn compound_operator_of(kind: TokenKind) -> Operator {
    match kind {
        TokenKind::PlusAssign => Operator::Plus,
        TokenKind::MinusAssign => Operator::Minus,
        TokenKind::AsteriskAssign => Operator::Asterisk,
        TokenKind::SlashAssign => Operator::Slash,
        TokenKind::PercentAssign => Operator::Modulus,
        TokenKind::BitAndAssign => Operator::BitAnd,
        TokenKind::BitOrAssign => Operator::BitOr,
        TokenKind::BitXorAssign => Operator::BitXor,
        TokenKind::LshiftAssign => Operator::Lshift,
        TokenKind::RshiftAssign => Operator::Rshift,
        _ => unreachable!("not a compound assignment token"),
    }
}

fn parse_number_literal(literal: &str) -> Option<f64> {
    if let Some(hex) = literal
        .strip_prefix("0x")
        .or_else(|| literal.strip_prefix("0X"))
    {
        return i64::from_str_radix(hex, 16).ok().map(|v| v as f64);
    }
    literal.parse::<f64>().ok()
}

/// Process the escape sequences the language defines; any other
/// escaped character stands for itself (which covers `\"`, `\'`,
/// `` \` ``, `\\`, `\/`, and `\$`).
fn process_escapes(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('b') => out.push('\u{0008}'),
            Some('f') => out.push('\u{000C}'),
            Some('0') => out.push('\0'),
            Some(other) => out.push(other),
            None => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> (Vec<Stmt>, ErrorList) {
        let mut errors = ErrorList::new();
        let lexer = Lexer::new(source, None);
        let program = Parser::new(lexer, false, &mut errors).parse_program();
        (program, errors)
    }

    fn parse_repl(source: &str) -> (Vec<Stmt>, ErrorList) {
        let mut errors = ErrorList::new();
        let lexer = Lexer::new(source, None);
        let program = Parser::new(lexer, true, &mut errors).parse_program();
        (program, errors)
    }

    fn parse_ok(source: &str) -> Vec<Stmt> {
        let (program, errors) = parse(source);
        assert!(!errors.has_errors(), "unexpected errors: {:?}", errors);
        program
    }

    #[test]
    fn test_define_statement() {
        let program = parse_ok("var x = 5; const y = 6;");
        assert_eq!(program.len(), 2);
        match &program[0].kind {
            StmtKind::Define {
                name, assignable, ..
            } => {
                assert_eq!(name.name, "x");
                assert!(*assignable);
            }
            other => panic!("expected define, got {:?}", other),
        }
        match &program[1].kind {
            StmtKind::Define { assignable, .. } => assert!(!*assignable),
            other => panic!("expected define, got {:?}", other),
        }
    }

    #[test]
    fn test_precedence_shapes() {
        let program = parse_ok("var r = 1 + 2 * 3;");
        let StmtKind::Define { value, .. } = &program[0].kind else {
            panic!();
        };
        let ExprKind::Infix { op, right, .. } = &value.kind else {
            panic!("expected infix, got {:?}", value.kind);
        };
        assert_eq!(*op, Operator::Plus);
        assert!(matches!(
            right.kind,
            ExprKind::Infix {
                op: Operator::Asterisk,
                ..
            }
        ));
    }

    #[test]
    fn test_dot_is_index_sugar() {
        let program = parse_ok("var v = m.key;");
        let StmtKind::Define { value, .. } = &program[0].kind else {
            panic!();
        };
        let ExprKind::Index { index, .. } = &value.kind else {
            panic!("expected index, got {:?}", value.kind);
        };
        assert!(matches!(&index.kind, ExprKind::StringLit(s) if s == "key"));
    }

    #[test]
    fn test_compound_assign_desugars() {
        let program = parse_ok("x += 2;");
        let StmtKind::Expression(expr) = &program[0].kind else {
            panic!();
        };
        let ExprKind::Assign {
            source, is_postfix, ..
        } = &expr.kind
        else {
            panic!("expected assign, got {:?}", expr.kind);
        };
        assert!(!is_postfix);
        assert!(matches!(
            source.kind,
            ExprKind::Infix {
                op: Operator::Plus,
                ..
            }
        ));
    }

    #[test]
    fn test_postfix_incdec() {
        let program = parse_ok("x++;");
        let StmtKind::Expression(expr) = &program[0].kind else {
            panic!();
        };
        assert!(matches!(
            expr.kind,
            ExprKind::Assign {
                is_postfix: true,
                ..
            }
        ));
    }

    #[test]
    fn test_function_declaration_sugar() {
        let program = parse_ok("fn add(a, b) { return a + b }");
        let StmtKind::Define {
            name,
            value,
            assignable,
        } = &program[0].kind
        else {
            panic!();
        };
        assert_eq!(name.name, "add");
        assert!(!assignable);
        let ExprKind::FnLit(f) = &value.kind else {
            panic!();
        };
        assert_eq!(f.name.as_deref(), Some("add"));
        assert_eq!(f.params.len(), 2);
    }

    #[test]
    fn test_fn_literal_inherits_define_name() {
        let program = parse_ok("const fact = fn(n) { return n };");
        let StmtKind::Define { value, .. } = &program[0].kind else {
            panic!();
        };
        let ExprKind::FnLit(f) = &value.kind else {
            panic!();
        };
        assert_eq!(f.name.as_deref(), Some("fact"));
    }

    #[test]
    fn test_if_else_chain() {
        let program = parse_ok("if (a()) { b() } else if (c()) { d() } else { e() }");
        let StmtKind::If { cases, alternative } = &program[0].kind else {
            panic!();
        };
        assert_eq!(cases.len(), 2);
        assert!(alternative.is_some());
    }

    #[test]
    fn test_for_variants() {
        let program = parse_ok("for (var i = 0; i < 3; i++) { f(i) } for (x in xs) { f(x) }");
        assert!(matches!(program[0].kind, StmtKind::For { .. }));
        assert!(matches!(program[1].kind, StmtKind::Foreach { .. }));
    }

    #[test]
    fn test_for_empty_clauses() {
        let program = parse_ok("for (;;) { break }");
        let StmtKind::For {
            init, test, update, ..
        } = &program[0].kind
        else {
            panic!();
        };
        assert!(init.is_none() && test.is_none() && update.is_none());
    }

    #[test]
    fn test_ternary_and_logical() {
        let program = parse_ok("var r = a && b ? c() : d || e;");
        let StmtKind::Define { value, .. } = &program[0].kind else {
            panic!();
        };
        assert!(matches!(value.kind, ExprKind::Ternary { .. }));
    }

    #[test]
    fn test_template_string_desugars() {
        let program = parse_ok("var s = `hello ${name}`;");
        let StmtKind::Define { value, .. } = &program[0].kind else {
            panic!();
        };
        // (("hello " + to_str(name)) + "")
        let ExprKind::Infix { left, right, .. } = &value.kind else {
            panic!("expected infix, got {:?}", value.kind);
        };
        assert!(matches!(&right.kind, ExprKind::StringLit(s) if s.is_empty()));
        let ExprKind::Infix {
            left: head,
            right: call,
            ..
        } = &left.kind
        else {
            panic!();
        };
        assert!(matches!(&head.kind, ExprKind::StringLit(s) if s == "hello "));
        let ExprKind::Call { function, args } = &call.kind else {
            panic!();
        };
        assert!(matches!(&function.kind, ExprKind::Ident(i) if i.name == "to_str"));
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn test_template_with_middle_and_tail() {
        let program = parse_ok("var s = `a${x}b${y}c`;");
        let StmtKind::Define { value, .. } = &program[0].kind else {
            panic!();
        };
        // ("a" + to_str(x)) + (("b" + to_str(y)) + "c")
        let ExprKind::Infix { right, .. } = &value.kind else {
            panic!();
        };
        assert!(matches!(right.kind, ExprKind::Infix { .. }));
    }

    #[test]
    fn test_expression_statement_restriction() {
        let (_, errors) = parse("1 + 2;");
        assert!(errors.has_errors());
        let (_, errors) = parse_repl("1 + 2;");
        assert!(!errors.has_errors());
        // Nested depth rejects bare expressions even in repl mode.
        let (_, errors) = parse_repl("if (x()) { 1 + 2 }");
        assert!(errors.has_errors());
    }

    #[test]
    fn test_repl_brace_is_map() {
        let (program, errors) = parse_repl("{a: 1}");
        assert!(!errors.has_errors(), "{:?}", errors);
        let StmtKind::Expression(expr) = &program[0].kind else {
            panic!("expected expression, got {:?}", program[0].kind);
        };
        assert!(matches!(expr.kind, ExprKind::MapLit { .. }));

        let program = parse_ok("{ f() }");
        assert!(matches!(program[0].kind, StmtKind::Block(_)));
    }

    #[test]
    fn test_recover_statement() {
        let program = parse_ok("fn f() { recover (e) { return e } crash() }");
        let StmtKind::Define { value, .. } = &program[0].kind else {
            panic!();
        };
        let ExprKind::FnLit(f) = &value.kind else {
            panic!();
        };
        assert!(matches!(&f.body[0].kind, StmtKind::Recover { error_ident, .. }
            if error_ident.name == "e"));
    }

    #[test]
    fn test_error_accumulation() {
        let (_, errors) = parse("var = 1; var y 2; f()");
        assert!(errors.len() >= 2);
    }

    #[test]
    fn test_string_escapes() {
        let program = parse_ok(r#"var s = "a\n\t\"b\\";"#);
        let StmtKind::Define { value, .. } = &program[0].kind else {
            panic!();
        };
        assert!(matches!(&value.kind, ExprKind::StringLit(s) if s == "a\n\t\"b\\"));
    }

    #[test]
    fn test_unterminated_string_reports() {
        let (_, errors) = parse("var s = \"abc");
        assert!(errors.iter().any(|e| e.message.contains("unterminated")));
    }

    #[test]
    fn test_hex_number() {
        let program = parse_ok("var h = 0x1F;");
        let StmtKind::Define { value, .. } = &program[0].kind else {
            panic!();
        };
        assert!(matches!(value.kind, ExprKind::NumberLit(n) if n == 31.0));
    }

    #[test]
    fn test_invalid_number_rejected() {
        let (_, errors) = parse("var n = 12abc;");
        assert!(errors.has_errors());
    }
}
