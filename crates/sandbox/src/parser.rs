use crate::ast::{
    BinOp, BoolOp, CmpOp, Comprehension, Const, Expr, ExprKind, FPart, Lambda, Program, Stmt,
    StmtKind, Target, UnaryOp,
};
use crate::error::{Result, SandboxError};
use crate::lexer::{tokenize, Tok, Token};
use std::rc::Rc;

const MAX_NESTING: usize = 64;

const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class", "continue",
    "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if", "import",
    "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try", "while",
    "with", "yield",
];

pub fn parse(source: &str) -> Result<Program> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        nesting: 0,
    };
    let mut body = Vec::new();
    while !parser.at(&Tok::Eof) {
        if parser.eat(&Tok::Newline) {
            continue;
        }
        parser.statement(&mut body)?;
    }
    Ok(Program { body })
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    nesting: usize,
}

fn is_keyword(name: &str) -> bool {
    KEYWORDS.contains(&name)
}

impl Parser {
    fn peek(&self) -> &Token {
        let last = self.tokens.len() - 1;
        &self.tokens[self.pos.min(last)]
    }

    fn peek_nth(&self, n: usize) -> &Tok {
        let last = self.tokens.len() - 1;
        &self.tokens[(self.pos + n).min(last)].tok
    }

    fn line(&self) -> usize {
        self.peek().line
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn at(&self, tok: &Tok) -> bool {
        &self.peek().tok == tok
    }

    fn at_op(&self, op: &str) -> bool {
        matches!(&self.peek().tok, Tok::Op(o) if *o == op)
    }

    fn at_keyword(&self, kw: &str) -> bool {
        matches!(&self.peek().tok, Tok::Name(n) if n == kw)
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.at(tok) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.at_op(op) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.at_keyword(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error(&self, message: impl Into<String>) -> SandboxError {
        let token = self.peek();
        SandboxError::ParseError {
            line: token.line,
            column: token.column,
            message: message.into(),
        }
    }

    fn expect_op(&mut self, op: &str) -> Result<()> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.error(format!("expected `{op}`, found {}", describe(&self.peek().tok))))
        }
    }

    fn expect_name(&mut self) -> Result<String> {
        match &self.peek().tok {
            Tok::Name(name) if !is_keyword(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            other => Err(self.error(format!("expected a name, found {}", describe(other)))),
        }
    }

    fn enter(&mut self) -> Result<()> {
        self.nesting += 1;
        if self.nesting > MAX_NESTING {
            return Err(self.error("expression nested too deeply"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.nesting -= 1;
    }

    // ---- statements -------------------------------------------------------

    fn statement(&mut self, out: &mut Vec<Stmt>) -> Result<()> {
        let line = self.line();
        let keyword = match &self.peek().tok {
            Tok::Name(name) => Some(name.clone()),
            Tok::Indent => return Err(self.error("unexpected indent")),
            _ => None,
        };

        let compound = match keyword.as_deref() {
            Some("if") => Some(self.if_statement()?),
            Some("for") => Some(self.for_statement()?),
            Some("while") => Some(self.while_statement()?),
            Some("def") => Some(self.skip_compound(StmtKind::FunctionDef)?),
            Some("class") => Some(self.skip_compound(StmtKind::ClassDef)?),
            Some("with") => Some(self.skip_compound(StmtKind::With)?),
            Some("try") => Some(self.try_statement()?),
            Some("async") => Some(self.skip_compound(StmtKind::FunctionDef)?),
            _ => None,
        };
        if let Some(kind) = compound {
            out.push(Stmt { kind, line });
            return Ok(());
        }
        if self.at_op("@") {
            // decorator line followed by a definition
            self.skip_line();
            return self.statement(out);
        }

        loop {
            let line = self.line();
            let kind = self.simple_statement()?;
            out.push(Stmt { kind, line });
            if !self.eat_op(";") {
                break;
            }
            if self.at(&Tok::Newline) || self.at(&Tok::Eof) {
                break;
            }
        }
        if !self.eat(&Tok::Newline) && !self.at(&Tok::Eof) {
            return Err(self.error(format!(
                "expected end of statement, found {}",
                describe(&self.peek().tok)
            )));
        }
        Ok(())
    }

    fn simple_statement(&mut self) -> Result<StmtKind> {
        if let Tok::Name(name) = &self.peek().tok {
            match name.as_str() {
                "pass" => {
                    self.advance();
                    return Ok(StmtKind::Pass);
                }
                "break" => {
                    self.advance();
                    return Ok(StmtKind::Break);
                }
                "continue" => {
                    self.advance();
                    return Ok(StmtKind::Continue);
                }
                "return" => {
                    self.advance();
                    let value = self.optional_expression_list()?;
                    return Ok(StmtKind::Return(value));
                }
                "raise" => {
                    self.advance();
                    let value = self.optional_expression_list()?;
                    self.skip_to_statement_end();
                    return Ok(StmtKind::Raise(value));
                }
                "import" => {
                    self.skip_to_statement_end();
                    return Ok(StmtKind::Import);
                }
                "from" => {
                    self.skip_to_statement_end();
                    return Ok(StmtKind::ImportFrom);
                }
                "global" => {
                    self.skip_to_statement_end();
                    return Ok(StmtKind::Global);
                }
                "nonlocal" => {
                    self.skip_to_statement_end();
                    return Ok(StmtKind::Nonlocal);
                }
                "del" => {
                    self.advance();
                    let expr = self.expression_list()?;
                    let target = self.to_target(expr)?;
                    let targets = match target {
                        Target::Tuple(items) => items,
                        single => vec![single],
                    };
                    return Ok(StmtKind::Delete(targets));
                }
                "assert" => {
                    self.advance();
                    let test = self.expression()?;
                    if self.eat_op(",") {
                        self.expression()?;
                    }
                    return Ok(StmtKind::Assert(test));
                }
                _ => {}
            }
        }

        let first = self.expression_list()?;

        if let Some(op) = self.augmented_op() {
            self.advance();
            let target = self.to_target(first)?;
            if matches!(target, Target::Tuple(_) | Target::Starred(_)) {
                return Err(self.error("illegal target for augmented assignment"));
            }
            let value = self.expression_list()?;
            return Ok(StmtKind::AugAssign { target, op, value });
        }

        if self.at_op("=") {
            let mut exprs = vec![first];
            while self.eat_op("=") {
                exprs.push(self.expression_list()?);
            }
            let value = exprs.pop().ok_or_else(|| self.error("missing assignment value"))?;
            let targets = exprs
                .into_iter()
                .map(|e| self.to_target(e))
                .collect::<Result<Vec<_>>>()?;
            return Ok(StmtKind::Assign { targets, value });
        }

        if self.at_op(":") {
            return Err(self.error("annotations are not supported"));
        }

        Ok(StmtKind::Expr(first))
    }

    fn augmented_op(&self) -> Option<BinOp> {
        let Tok::Op(op) = &self.peek().tok else {
            return None;
        };
        Some(match *op {
            "+=" => BinOp::Add,
            "-=" => BinOp::Sub,
            "*=" => BinOp::Mul,
            "/=" => BinOp::Div,
            "//=" => BinOp::FloorDiv,
            "%=" => BinOp::Mod,
            "**=" => BinOp::Pow,
            "@=" => BinOp::MatMul,
            "<<=" => BinOp::LShift,
            ">>=" => BinOp::RShift,
            "&=" => BinOp::BitAnd,
            "|=" => BinOp::BitOr,
            "^=" => BinOp::BitXor,
            _ => return None,
        })
    }

    fn optional_expression_list(&mut self) -> Result<Option<Expr>> {
        if self.at(&Tok::Newline) || self.at(&Tok::Eof) || self.at_op(";") {
            Ok(None)
        } else {
            Ok(Some(self.expression_list()?))
        }
    }

    fn skip_to_statement_end(&mut self) {
        while !self.at(&Tok::Newline) && !self.at(&Tok::Eof) && !self.at_op(";") {
            self.advance();
        }
    }

    fn skip_line(&mut self) {
        while !self.at(&Tok::Newline) && !self.at(&Tok::Eof) {
            self.advance();
        }
        self.eat(&Tok::Newline);
    }

    /// Consume a construct the evaluator never runs: its header up to the
    /// block colon, then the block itself.
    fn skip_compound(&mut self, kind: StmtKind) -> Result<StmtKind> {
        self.skip_header()?;
        self.skip_suite()?;
        Ok(kind)
    }

    fn try_statement(&mut self) -> Result<StmtKind> {
        self.skip_header()?;
        self.skip_suite()?;
        while self.at_keyword("except") || self.at_keyword("finally") || self.at_keyword("else") {
            self.skip_header()?;
            self.skip_suite()?;
        }
        Ok(StmtKind::Try)
    }

    fn skip_header(&mut self) -> Result<()> {
        let mut depth = 0usize;
        loop {
            match &self.peek().tok {
                Tok::Eof | Tok::Newline => return Err(self.error("expected `:`")),
                Tok::Op("(" | "[" | "{") => depth += 1,
                Tok::Op(")" | "]" | "}") => depth = depth.saturating_sub(1),
                Tok::Op(":") if depth == 0 => {
                    self.advance();
                    return Ok(());
                }
                _ => {}
            }
            self.advance();
        }
    }

    fn skip_suite(&mut self) -> Result<()> {
        if !self.eat(&Tok::Newline) {
            self.skip_line();
            return Ok(());
        }
        if !self.eat(&Tok::Indent) {
            return Err(self.error("expected an indented block"));
        }
        let mut depth = 1usize;
        while depth > 0 {
            match self.advance().tok {
                Tok::Indent => depth += 1,
                Tok::Dedent => depth -= 1,
                Tok::Eof => return Ok(()),
                _ => {}
            }
        }
        Ok(())
    }

    fn block(&mut self) -> Result<Vec<Stmt>> {
        self.expect_op(":")?;
        let mut body = Vec::new();
        if !self.eat(&Tok::Newline) {
            // one-line suite: `if x: y = 1; z = 2`
            let line = self.line();
            loop {
                let kind = self.simple_statement()?;
                body.push(Stmt { kind, line });
                if !self.eat_op(";") || self.at(&Tok::Newline) {
                    break;
                }
            }
            if !self.eat(&Tok::Newline) && !self.at(&Tok::Eof) {
                return Err(self.error("expected end of statement"));
            }
            return Ok(body);
        }

        if !self.eat(&Tok::Indent) {
            return Err(self.error("expected an indented block"));
        }
        self.enter()?;
        while !self.eat(&Tok::Dedent) {
            if self.at(&Tok::Eof) {
                break;
            }
            if self.eat(&Tok::Newline) {
                continue;
            }
            self.statement(&mut body)?;
        }
        self.leave();
        Ok(body)
    }

    fn if_statement(&mut self) -> Result<StmtKind> {
        self.advance();
        let test = self.named_expression()?;
        let body = self.block()?;
        let orelse = if self.at_keyword("elif") {
            let line = self.line();
            let kind = self.if_statement()?;
            vec![Stmt { kind, line }]
        } else if self.eat_keyword("else") {
            self.block()?
        } else {
            Vec::new()
        };
        Ok(StmtKind::If { test, body, orelse })
    }

    fn for_statement(&mut self) -> Result<StmtKind> {
        self.advance();
        let target = self.target_list()?;
        if !self.eat_keyword("in") {
            return Err(self.error("expected `in`"));
        }
        let iter = self.expression_list()?;
        let body = self.block()?;
        let orelse = if self.eat_keyword("else") {
            self.block()?
        } else {
            Vec::new()
        };
        Ok(StmtKind::For {
            target,
            iter,
            body,
            orelse,
        })
    }

    fn while_statement(&mut self) -> Result<StmtKind> {
        self.advance();
        let test = self.named_expression()?;
        let body = self.block()?;
        let orelse = if self.eat_keyword("else") {
            self.block()?
        } else {
            Vec::new()
        };
        Ok(StmtKind::While { test, body, orelse })
    }

    /// Targets of `for` and comprehension clauses: stop before `in`.
    fn target_list(&mut self) -> Result<Target> {
        let line = self.line();
        let mut items = vec![self.star_or(Self::bit_or)?];
        let mut tuple = false;
        while self.eat_op(",") {
            tuple = true;
            if self.at_keyword("in") {
                break;
            }
            items.push(self.star_or(Self::bit_or)?);
        }
        let expr = if tuple {
            Expr {
                kind: ExprKind::Tuple(items),
                line,
            }
        } else {
            items.remove(0)
        };
        self.to_target(expr)
    }

    fn to_target(&self, expr: Expr) -> Result<Target> {
        match expr.kind {
            ExprKind::Name(name) => Ok(Target::Name(name)),
            ExprKind::Subscript { value, index } => Ok(Target::Subscript { value, index }),
            ExprKind::Attribute { value, attr } => Ok(Target::Attribute { value, attr }),
            ExprKind::Tuple(items) | ExprKind::List(items) => Ok(Target::Tuple(
                items
                    .into_iter()
                    .map(|item| self.to_target(item))
                    .collect::<Result<Vec<_>>>()?,
            )),
            ExprKind::Starred(inner) => Ok(Target::Starred(Box::new(self.to_target(*inner)?))),
            _ => Err(SandboxError::ParseError {
                line: expr.line,
                column: 0,
                message: "cannot assign to expression".to_string(),
            }),
        }
    }

    // ---- expressions ------------------------------------------------------

    /// Comma-separated expressions; more than one (or a trailing comma)
    /// makes a tuple.
    fn expression_list(&mut self) -> Result<Expr> {
        let line = self.line();
        if self.at_keyword("yield") {
            return self.yield_expression();
        }
        let first = self.star_or(Self::expression)?;
        if !self.at_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.ends_expression_list() {
                break;
            }
            items.push(self.star_or(Self::expression)?);
        }
        Ok(Expr {
            kind: ExprKind::Tuple(items),
            line,
        })
    }

    fn ends_expression_list(&self) -> bool {
        match &self.peek().tok {
            Tok::Newline | Tok::Eof => true,
            Tok::Op(op) => matches!(*op, "=" | ")" | "]" | "}" | ";" | ":") || self.augmented_op().is_some(),
            _ => false,
        }
    }

    fn yield_expression(&mut self) -> Result<Expr> {
        let line = self.line();
        self.advance();
        self.eat_keyword("from");
        let value = if self.ends_expression_list() {
            None
        } else {
            Some(Box::new(self.expression_list()?))
        };
        Ok(Expr {
            kind: ExprKind::Yield(value),
            line,
        })
    }

    fn star_or(&mut self, inner: fn(&mut Self) -> Result<Expr>) -> Result<Expr> {
        let line = self.line();
        if self.eat_op("*") {
            let value = self.bit_or()?;
            return Ok(Expr {
                kind: ExprKind::Starred(Box::new(value)),
                line,
            });
        }
        inner(self)
    }

    fn named_expression(&mut self) -> Result<Expr> {
        if let (Tok::Name(name), Tok::Op(":=")) = (&self.peek().tok, self.peek_nth(1)) {
            let line = self.line();
            let target = name.clone();
            self.advance();
            self.advance();
            let value = self.expression()?;
            return Ok(Expr {
                kind: ExprKind::NamedExpr {
                    target,
                    value: Box::new(value),
                },
                line,
            });
        }
        self.expression()
    }

    fn expression(&mut self) -> Result<Expr> {
        self.enter()?;
        let result = self.expression_inner();
        self.leave();
        result
    }

    fn expression_inner(&mut self) -> Result<Expr> {
        if self.at_keyword("lambda") {
            return self.lambda();
        }
        let line = self.line();
        let body = self.disjunction()?;
        if self.eat_keyword("if") {
            let test = self.disjunction()?;
            if !self.eat_keyword("else") {
                return Err(self.error("expected `else` in conditional expression"));
            }
            let orelse = self.expression()?;
            return Ok(Expr {
                kind: ExprKind::IfExp {
                    test: Box::new(test),
                    body: Box::new(body),
                    orelse: Box::new(orelse),
                },
                line,
            });
        }
        Ok(body)
    }

    fn lambda(&mut self) -> Result<Expr> {
        let line = self.line();
        self.advance();
        let mut params = Vec::new();
        while !self.at_op(":") {
            if self.at_op("*") || self.at_op("**") {
                return Err(self.error("variadic lambda parameters are not supported"));
            }
            let name = self.expect_name()?;
            if self.at_op("=") {
                return Err(self.error("default lambda parameters are not supported"));
            }
            if params.contains(&name) {
                return Err(self.error(format!("duplicate parameter `{name}`")));
            }
            params.push(name);
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(":")?;
        let body = self.expression()?;
        Ok(Expr {
            kind: ExprKind::Lambda(Rc::new(Lambda { params, body })),
            line,
        })
    }

    fn disjunction(&mut self) -> Result<Expr> {
        let line = self.line();
        let first = self.conjunction()?;
        if !self.at_keyword("or") {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat_keyword("or") {
            values.push(self.conjunction()?);
        }
        Ok(Expr {
            kind: ExprKind::BoolOp {
                op: BoolOp::Or,
                values,
            },
            line,
        })
    }

    fn conjunction(&mut self) -> Result<Expr> {
        let line = self.line();
        let first = self.inversion()?;
        if !self.at_keyword("and") {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat_keyword("and") {
            values.push(self.inversion()?);
        }
        Ok(Expr {
            kind: ExprKind::BoolOp {
                op: BoolOp::And,
                values,
            },
            line,
        })
    }

    fn inversion(&mut self) -> Result<Expr> {
        let line = self.line();
        if self.eat_keyword("not") {
            self.enter()?;
            let operand = self.inversion();
            self.leave();
            return Ok(Expr {
                kind: ExprKind::UnaryOp {
                    op: UnaryOp::Not,
                    operand: Box::new(operand?),
                },
                line,
            });
        }
        self.comparison()
    }

    fn comparison_op(&mut self) -> Option<CmpOp> {
        let op = match &self.peek().tok {
            Tok::Op("==") => CmpOp::Eq,
            Tok::Op("!=") => CmpOp::NotEq,
            Tok::Op("<") => CmpOp::Lt,
            Tok::Op("<=") => CmpOp::LtE,
            Tok::Op(">") => CmpOp::Gt,
            Tok::Op(">=") => CmpOp::GtE,
            Tok::Name(n) if n == "in" => CmpOp::In,
            Tok::Name(n) if n == "not" && matches!(self.peek_nth(1), Tok::Name(m) if m == "in") => {
                self.advance();
                CmpOp::NotIn
            }
            Tok::Name(n) if n == "is" => {
                if matches!(self.peek_nth(1), Tok::Name(m) if m == "not") {
                    self.advance();
                    CmpOp::IsNot
                } else {
                    CmpOp::Is
                }
            }
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    fn comparison(&mut self) -> Result<Expr> {
        let line = self.line();
        let left = self.bit_or()?;
        let mut ops = Vec::new();
        while let Some(op) = self.comparison_op() {
            ops.push((op, self.bit_or()?));
        }
        if ops.is_empty() {
            return Ok(left);
        }
        Ok(Expr {
            kind: ExprKind::Compare {
                left: Box::new(left),
                ops,
            },
            line,
        })
    }

    fn binary_level(
        &mut self,
        next: fn(&mut Self) -> Result<Expr>,
        table: &[(&str, BinOp)],
    ) -> Result<Expr> {
        let line = self.line();
        let mut left = next(self)?;
        'outer: loop {
            for (symbol, op) in table {
                if self.eat_op(symbol) {
                    let right = next(self)?;
                    left = Expr {
                        kind: ExprKind::BinOp {
                            op: *op,
                            left: Box::new(left),
                            right: Box::new(right),
                        },
                        line,
                    };
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }

    fn bit_or(&mut self) -> Result<Expr> {
        self.binary_level(Self::bit_xor, &[("|", BinOp::BitOr)])
    }

    fn bit_xor(&mut self) -> Result<Expr> {
        self.binary_level(Self::bit_and, &[("^", BinOp::BitXor)])
    }

    fn bit_and(&mut self) -> Result<Expr> {
        self.binary_level(Self::shift, &[("&", BinOp::BitAnd)])
    }

    fn shift(&mut self) -> Result<Expr> {
        self.binary_level(Self::sum, &[("<<", BinOp::LShift), (">>", BinOp::RShift)])
    }

    fn sum(&mut self) -> Result<Expr> {
        self.binary_level(Self::term, &[("+", BinOp::Add), ("-", BinOp::Sub)])
    }

    fn term(&mut self) -> Result<Expr> {
        self.binary_level(
            Self::factor,
            &[
                ("*", BinOp::Mul),
                ("/", BinOp::Div),
                ("//", BinOp::FloorDiv),
                ("%", BinOp::Mod),
                ("@", BinOp::MatMul),
            ],
        )
    }

    fn factor(&mut self) -> Result<Expr> {
        let line = self.line();
        let op = if self.eat_op("-") {
            Some(UnaryOp::Neg)
        } else if self.eat_op("+") {
            Some(UnaryOp::Pos)
        } else if self.eat_op("~") {
            Some(UnaryOp::Invert)
        } else {
            None
        };
        match op {
            Some(op) => {
                self.enter()?;
                let operand = self.factor();
                self.leave();
                Ok(Expr {
                    kind: ExprKind::UnaryOp {
                        op,
                        operand: Box::new(operand?),
                    },
                    line,
                })
            }
            None => self.power(),
        }
    }

    fn power(&mut self) -> Result<Expr> {
        let line = self.line();
        let base = if self.eat_keyword("await") {
            let inner = self.primary()?;
            Expr {
                kind: ExprKind::Await(Box::new(inner)),
                line,
            }
        } else {
            self.primary()?
        };
        if self.eat_op("**") {
            self.enter()?;
            let exponent = self.factor();
            self.leave();
            return Ok(Expr {
                kind: ExprKind::BinOp {
                    op: BinOp::Pow,
                    left: Box::new(base),
                    right: Box::new(exponent?),
                },
                line,
            });
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Expr> {
        let mut expr = self.atom()?;
        loop {
            let line = self.line();
            if self.eat_op(".") {
                let attr = match &self.peek().tok {
                    Tok::Name(name) => name.clone(),
                    other => {
                        return Err(self.error(format!("expected attribute name, found {}", describe(other))))
                    }
                };
                self.advance();
                expr = Expr {
                    kind: ExprKind::Attribute {
                        value: Box::new(expr),
                        attr,
                    },
                    line,
                };
            } else if self.eat_op("(") {
                self.enter()?;
                let call = self.call_arguments(expr, line);
                self.leave();
                expr = call?;
            } else if self.eat_op("[") {
                self.enter()?;
                let index = self.subscript();
                self.leave();
                let index = index?;
                self.expect_op("]")?;
                expr = Expr {
                    kind: ExprKind::Subscript {
                        value: Box::new(expr),
                        index: Box::new(index),
                    },
                    line,
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn call_arguments(&mut self, func: Expr, line: usize) -> Result<Expr> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        while !self.at_op(")") {
            let arg_line = self.line();
            if self.eat_op("**") {
                let value = self.expression()?;
                args.push(Expr {
                    kind: ExprKind::DoubleStarred(Box::new(value)),
                    line: arg_line,
                });
            } else if let (Tok::Name(name), Tok::Op("=")) = (&self.peek().tok, self.peek_nth(1)) {
                let name = name.clone();
                self.advance();
                self.advance();
                if kwargs.iter().any(|(k, _)| *k == name) {
                    return Err(self.error(format!("keyword argument repeated: {name}")));
                }
                kwargs.push((name, self.expression()?));
            } else {
                let value = self.star_or(Self::named_expression)?;
                if self.at_keyword("for") {
                    let generators = self.comprehension_clauses()?;
                    args.push(Expr {
                        kind: ExprKind::GeneratorExp {
                            elt: Box::new(value),
                            generators,
                        },
                        line: arg_line,
                    });
                } else {
                    if !kwargs.is_empty() {
                        return Err(self.error("positional argument follows keyword argument"));
                    }
                    args.push(value);
                }
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        Ok(Expr {
            kind: ExprKind::Call {
                func: Box::new(func),
                args,
                kwargs,
            },
            line,
        })
    }

    fn subscript(&mut self) -> Result<Expr> {
        let line = self.line();
        let first = self.slice_item()?;
        if !self.at_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_op("]") {
                break;
            }
            items.push(self.slice_item()?);
        }
        Ok(Expr {
            kind: ExprKind::Tuple(items),
            line,
        })
    }

    fn slice_item(&mut self) -> Result<Expr> {
        let line = self.line();
        let lower = if self.at_op(":") {
            None
        } else {
            let expr = self.named_expression()?;
            if !self.at_op(":") {
                return Ok(expr);
            }
            Some(Box::new(expr))
        };
        self.expect_op(":")?;
        let upper = if self.at_op(":") || self.at_op("]") || self.at_op(",") {
            None
        } else {
            Some(Box::new(self.expression()?))
        };
        let step = if self.eat_op(":") && !self.at_op("]") && !self.at_op(",") {
            Some(Box::new(self.expression()?))
        } else {
            None
        };
        Ok(Expr {
            kind: ExprKind::Slice { lower, upper, step },
            line,
        })
    }

    fn comprehension_clauses(&mut self) -> Result<Vec<Comprehension>> {
        let mut generators = Vec::new();
        loop {
            if self.at_keyword("async") {
                return Err(self.error("async comprehensions are not supported"));
            }
            if !self.eat_keyword("for") {
                break;
            }
            let target = self.target_list()?;
            if !self.eat_keyword("in") {
                return Err(self.error("expected `in`"));
            }
            let iter = self.disjunction()?;
            let mut ifs = Vec::new();
            while self.eat_keyword("if") {
                ifs.push(self.disjunction()?);
            }
            generators.push(Comprehension { target, iter, ifs });
        }
        Ok(generators)
    }

    fn atom(&mut self) -> Result<Expr> {
        let token = self.peek().clone();
        let line = token.line;
        let kind = match token.tok {
            Tok::Int(value) => {
                self.advance();
                ExprKind::Const(Const::Int(value))
            }
            Tok::Float(value) => {
                self.advance();
                ExprKind::Const(Const::Float(value))
            }
            Tok::Str(_) | Tok::FStr(_) => return self.strings(),
            Tok::Name(name) => {
                self.advance();
                match name.as_str() {
                    "None" => ExprKind::Const(Const::None),
                    "True" => ExprKind::Const(Const::Bool(true)),
                    "False" => ExprKind::Const(Const::Bool(false)),
                    "yield" => {
                        self.pos -= 1;
                        return self.yield_expression();
                    }
                    "lambda" => {
                        self.pos -= 1;
                        return self.lambda();
                    }
                    other if is_keyword(other) => {
                        return Err(SandboxError::ParseError {
                            line,
                            column: token.column,
                            message: format!("unexpected keyword `{other}`"),
                        })
                    }
                    _ => ExprKind::Name(name),
                }
            }
            Tok::Op("(") => {
                self.advance();
                self.enter()?;
                let inner = self.parenthesized(line);
                self.leave();
                return inner;
            }
            Tok::Op("[") => {
                self.advance();
                self.enter()?;
                let inner = self.list_display(line);
                self.leave();
                return inner;
            }
            Tok::Op("{") => {
                self.advance();
                self.enter()?;
                let inner = self.brace_display(line);
                self.leave();
                return inner;
            }
            Tok::Op("...") => {
                self.advance();
                ExprKind::Ellipsis
            }
            other => return Err(self.error(format!("unexpected {}", describe(&other)))),
        };
        Ok(Expr { kind, line })
    }

    fn parenthesized(&mut self, line: usize) -> Result<Expr> {
        if self.eat_op(")") {
            return Ok(Expr {
                kind: ExprKind::Tuple(Vec::new()),
                line,
            });
        }
        if self.at_keyword("yield") {
            let value = self.yield_expression()?;
            self.expect_op(")")?;
            return Ok(value);
        }
        let first = self.star_or(Self::named_expression)?;
        if self.at_keyword("for") {
            let generators = self.comprehension_clauses()?;
            self.expect_op(")")?;
            return Ok(Expr {
                kind: ExprKind::GeneratorExp {
                    elt: Box::new(first),
                    generators,
                },
                line,
            });
        }
        if self.eat_op(")") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_op(")") {
                break;
            }
            items.push(self.star_or(Self::named_expression)?);
        }
        self.expect_op(")")?;
        Ok(Expr {
            kind: ExprKind::Tuple(items),
            line,
        })
    }

    fn list_display(&mut self, line: usize) -> Result<Expr> {
        if self.eat_op("]") {
            return Ok(Expr {
                kind: ExprKind::List(Vec::new()),
                line,
            });
        }
        let first = self.star_or(Self::named_expression)?;
        if self.at_keyword("for") {
            let generators = self.comprehension_clauses()?;
            self.expect_op("]")?;
            return Ok(Expr {
                kind: ExprKind::ListComp {
                    elt: Box::new(first),
                    generators,
                },
                line,
            });
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_op("]") {
                break;
            }
            items.push(self.star_or(Self::named_expression)?);
        }
        self.expect_op("]")?;
        Ok(Expr {
            kind: ExprKind::List(items),
            line,
        })
    }

    fn brace_display(&mut self, line: usize) -> Result<Expr> {
        if self.eat_op("}") {
            return Ok(Expr {
                kind: ExprKind::Dict(Vec::new()),
                line,
            });
        }

        if self.eat_op("**") {
            let value = self.bit_or()?;
            return Err(SandboxError::ParseError {
                line: value.line,
                column: 0,
                message: "dict unpacking is not supported".to_string(),
            });
        }

        let first = self.star_or(Self::expression)?;
        if self.eat_op(":") {
            let value = self.expression()?;
            if self.at_keyword("for") {
                let generators = self.comprehension_clauses()?;
                self.expect_op("}")?;
                return Ok(Expr {
                    kind: ExprKind::DictComp {
                        key: Box::new(first),
                        value: Box::new(value),
                        generators,
                    },
                    line,
                });
            }
            let mut pairs = vec![(first, value)];
            while self.eat_op(",") {
                if self.at_op("}") {
                    break;
                }
                let key = self.expression()?;
                self.expect_op(":")?;
                pairs.push((key, self.expression()?));
            }
            self.expect_op("}")?;
            return Ok(Expr {
                kind: ExprKind::Dict(pairs),
                line,
            });
        }

        if self.at_keyword("for") {
            let generators = self.comprehension_clauses()?;
            self.expect_op("}")?;
            return Ok(Expr {
                kind: ExprKind::SetComp {
                    elt: Box::new(first),
                    generators,
                },
                line,
            });
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_op("}") {
                break;
            }
            items.push(self.star_or(Self::expression)?);
        }
        self.expect_op("}")?;
        Ok(Expr {
            kind: ExprKind::Set(items),
            line,
        })
    }

    /// Adjacent string literals concatenate; any f-string among them turns
    /// the whole run into one joined string.
    fn strings(&mut self) -> Result<Expr> {
        let line = self.line();
        let mut parts: Vec<FPart> = Vec::new();
        let mut formatted = false;
        loop {
            match self.peek().tok.clone() {
                Tok::Str(text) => {
                    self.advance();
                    push_literal(&mut parts, &text);
                }
                Tok::FStr(text) => {
                    let (row, column) = (self.peek().line, self.peek().column);
                    self.advance();
                    formatted = true;
                    for part in parse_fstring(&text, row, column)? {
                        match part {
                            FPart::Lit(lit) => push_literal(&mut parts, &lit),
                            field => parts.push(field),
                        }
                    }
                }
                _ => break,
            }
        }
        let kind = if formatted {
            ExprKind::JoinedStr(parts)
        } else {
            let text = match parts.pop() {
                Some(FPart::Lit(text)) => text,
                _ => String::new(),
            };
            ExprKind::Const(Const::Str(Rc::from(text)))
        };
        Ok(Expr { kind, line })
    }
}

fn push_literal(parts: &mut Vec<FPart>, text: &str) {
    if let Some(FPart::Lit(last)) = parts.last_mut() {
        last.push_str(text);
    } else {
        parts.push(FPart::Lit(text.to_string()));
    }
}

/// Split an f-string body into literal runs and parsed replacement fields.
fn parse_fstring(text: &str, line: usize, column: usize) -> Result<Vec<FPart>> {
    let err = |message: &str| SandboxError::ParseError {
        line,
        column,
        message: format!("f-string: {message}"),
    };

    let chars: Vec<char> = text.chars().collect();
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut i = 0usize;
    while i < chars.len() {
        let c = chars[i];
        if c == '{' && chars.get(i + 1) == Some(&'{') {
            literal.push('{');
            i += 2;
            continue;
        }
        if c == '}' {
            if chars.get(i + 1) == Some(&'}') {
                literal.push('}');
                i += 2;
                continue;
            }
            return Err(err("single `}` is not allowed"));
        }
        if c != '{' {
            literal.push(c);
            i += 1;
            continue;
        }

        // replacement field: scan to the matching close brace
        let start = i + 1;
        let mut depth = 0usize;
        let mut quote: Option<char> = None;
        let mut conv_at = None;
        let mut spec_at = None;
        let mut j = start;
        while j < chars.len() {
            let d = chars[j];
            if let Some(q) = quote {
                if d == q {
                    quote = None;
                }
            } else {
                match d {
                    '\'' | '"' => quote = Some(d),
                    '(' | '[' | '{' => depth += 1,
                    ')' | ']' => depth = depth.saturating_sub(1),
                    '}' if depth == 0 => break,
                    '}' => depth -= 1,
                    '!' if depth == 0 && spec_at.is_none() && chars.get(j + 1) != Some(&'=') => {
                        conv_at.get_or_insert(j);
                    }
                    ':' if depth == 0 && spec_at.is_none() => spec_at = Some(j),
                    _ => {}
                }
            }
            j += 1;
        }
        if j >= chars.len() {
            return Err(err("expected `}`"));
        }

        let expr_end = conv_at.or(spec_at).unwrap_or(j);
        let source: String = chars[start..expr_end].iter().collect();
        if source.trim().is_empty() {
            return Err(err("empty expression"));
        }
        let conversion = match conv_at {
            Some(at) => {
                let conv_end = spec_at.unwrap_or(j);
                let conv: String = chars[at + 1..conv_end].iter().collect();
                match conv.as_str() {
                    "r" => Some('r'),
                    "s" => Some('s'),
                    "a" => Some('a'),
                    _ => return Err(err("invalid conversion character")),
                }
            }
            None => None,
        };
        let spec: String = match spec_at {
            Some(at) => chars[at + 1..j].iter().collect(),
            None => String::new(),
        };
        if spec.contains('{') {
            return Err(err("nested replacement fields are not supported"));
        }

        let program = parse(&format!("({})", source.trim()))?;
        let expr = match program.body.into_iter().next().map(|stmt| stmt.kind) {
            Some(StmtKind::Expr(mut expr)) => {
                expr.line = line;
                expr
            }
            _ => return Err(err("expected an expression")),
        };

        if !literal.is_empty() {
            parts.push(FPart::Lit(std::mem::take(&mut literal)));
        }
        parts.push(FPart::Field {
            expr,
            conversion,
            spec,
        });
        i = j + 1;
    }
    if !literal.is_empty() {
        parts.push(FPart::Lit(literal));
    }
    Ok(parts)
}

fn describe(tok: &Tok) -> String {
    match tok {
        Tok::Name(name) => format!("`{name}`"),
        Tok::Int(value) => format!("`{value}`"),
        Tok::Float(value) => format!("`{value}`"),
        Tok::Str(_) | Tok::FStr(_) => "string".to_string(),
        Tok::Op(op) => format!("`{op}`"),
        Tok::Newline => "end of line".to_string(),
        Tok::Indent => "indent".to_string(),
        Tok::Dedent => "dedent".to_string(),
        Tok::Eof => "end of input".to_string(),
    }
}
