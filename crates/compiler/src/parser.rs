//! Pratt-style expression parser plus a recursive-descent statement parser.
//!
//! Desugarings performed here rather than in the compiler: compound
//! assignment (`a += b` → `a = a + b`), `.` access (`a.b` → `a["b"]`), named
//! function statements (`fn f(){}` → `const f = fn(){}`), and template
//! strings (`` `a${b}c` `` → `"a" + to_str(b) + "c"`).

use crate::ast::*;
use crate::lexer::Lexer;
use crate::token::{Token, TokenType};
use loom_core::{ErrorKind, ErrorList, LangError, SourcePosition};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum Precedence {
    Lowest,
    Assign,
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
    Call,
    Index,
    Dot,
}

fn precedence_of(kind: TokenType) -> Precedence {
    use TokenType::*;
    match kind {
        Assign | PlusAssign | MinusAssign | StarAssign | SlashAssign | PercentAssign
        | AmpAssign | PipeAssign | CaretAssign | LShiftAssign | RShiftAssign => Precedence::Assign,
        Or => Precedence::LogicalOr,
        And => Precedence::LogicalAnd,
        Pipe => Precedence::BitOr,
        Caret => Precedence::BitXor,
        Amp => Precedence::BitAnd,
        Eq | NotEq => Precedence::Equals,
        Lt | LtEq | Gt | GtEq => Precedence::LessGreater,
        LShift | RShift => Precedence::Shift,
        Plus | Minus => Precedence::Sum,
        Star | Slash | Percent => Precedence::Product,
        LParen => Precedence::Call,
        LBracket => Precedence::Index,
        Dot => Precedence::Dot,
        _ => Precedence::Lowest,
    }
}

pub struct Parser {
    lexer: Lexer,
    file: Option<PathBuf>,
    cur: Token,
    next: Token,
    pub errors: ErrorList,
    repl_mode: bool,
}

impl Parser {
    pub fn new(source: &str, file: Option<PathBuf>) -> Self {
        let mut lexer = Lexer::new(source);
        let cur = lexer.next_token();
        let next = lexer.next_token();
        Self {
            lexer,
            file,
            cur,
            next,
            errors: ErrorList::default(),
            repl_mode: false,
        }
    }

    pub fn set_repl_mode(&mut self, repl: bool) {
        self.repl_mode = repl;
    }

    fn advance(&mut self) {
        std::mem::swap(&mut self.cur, &mut self.next);
        self.next = self.lexer.next_token();
    }

    fn loc(&self) -> SourceLocation {
        SourceLocation {
            file: self.file.clone(),
            line: self.cur.line,
            column: self.cur.column,
        }
    }

    fn error(&mut self, message: impl Into<String>) {
        let pos = SourcePosition::new(self.file.clone(), self.cur.line, self.cur.column);
        self.errors.push(LangError::new(ErrorKind::Parsing, message, pos));
    }

    fn expect(&mut self, kind: TokenType) -> bool {
        if self.cur.kind == kind {
            self.advance();
            true
        } else {
            self.error(format!("expected {kind}, got {} ({:?})", self.cur.kind, self.cur.literal));
            false
        }
    }

    pub fn parse_program(&mut self) -> Program {
        let mut statements = Vec::new();
        while self.cur.kind != TokenType::Eof {
            if let Some(stmt) = self.parse_statement() {
                statements.push(stmt);
            } else {
                self.advance();
            }
        }
        Program { statements }
    }

    fn skip_semicolons(&mut self) {
        while self.cur.kind == TokenType::Semicolon {
            self.advance();
        }
    }

    fn parse_statement(&mut self) -> Option<Statement> {
        let stmt = match self.cur.kind {
            TokenType::Var => self.parse_var_def(),
            TokenType::Const => self.parse_const_def(),
            TokenType::Function if self.next.kind == TokenType::Ident => self.parse_named_function(),
            TokenType::Return => self.parse_return(),
            TokenType::If => self.parse_if(),
            TokenType::While => self.parse_while(),
            TokenType::For => self.parse_for(),
            TokenType::Break => {
                let loc = self.loc();
                self.advance();
                Some(Statement::Break(loc))
            }
            TokenType::Continue => {
                let loc = self.loc();
                self.advance();
                Some(Statement::Continue(loc))
            }
            TokenType::LBrace => self.parse_block(),
            TokenType::Import => self.parse_import(),
            TokenType::Recover => self.parse_recover(),
            _ => self.parse_expression_statement(),
        };
        self.skip_semicolons();
        stmt
    }

    fn parse_var_def(&mut self) -> Option<Statement> {
        let loc = self.loc();
        self.advance(); // var
        let name = self.parse_ident_name()?;
        self.expect(TokenType::Assign);
        let value = self.parse_expression(Precedence::Lowest)?;
        Some(Statement::VarDef { name, value, loc })
    }

    fn parse_const_def(&mut self) -> Option<Statement> {
        let loc = self.loc();
        self.advance(); // const
        let name = self.parse_ident_name()?;
        self.expect(TokenType::Assign);
        let value = self.parse_expression(Precedence::Lowest)?;
        Some(Statement::ConstDef { name, value, loc })
    }

    fn parse_named_function(&mut self) -> Option<Statement> {
        let loc = self.loc();
        self.advance(); // fn
        let name = self.parse_ident_name()?;
        let func = self.parse_function_tail(Some(name.clone()), loc.clone())?;
        Some(Statement::ConstDef {
            name,
            value: func,
            loc,
        })
    }

    fn parse_ident_name(&mut self) -> Option<String> {
        if self.cur.kind != TokenType::Ident {
            self.error(format!("expected identifier, got {:?}", self.cur.kind));
            return None;
        }
        let name = self.cur.literal.clone();
        self.advance();
        Some(name)
    }

    fn parse_return(&mut self) -> Option<Statement> {
        let loc = self.loc();
        self.advance();
        if matches!(self.cur.kind, TokenType::Semicolon | TokenType::RBrace | TokenType::Eof) {
            return Some(Statement::Return(None, loc));
        }
        let value = self.parse_expression(Precedence::Lowest)?;
        Some(Statement::Return(Some(value), loc))
    }

    fn parse_if(&mut self) -> Option<Statement> {
        let loc = self.loc();
        self.advance(); // if
        let mut cases = Vec::new();
        self.expect(TokenType::LParen);
        let cond = self.parse_expression(Precedence::Lowest)?;
        self.expect(TokenType::RParen);
        let body = self.parse_block()?;
        cases.push((cond, body));
        let mut alternative = None;
        while self.cur.kind == TokenType::Else {
            self.advance();
            if self.cur.kind == TokenType::If {
                self.advance();
                self.expect(TokenType::LParen);
                let cond = self.parse_expression(Precedence::Lowest)?;
                self.expect(TokenType::RParen);
                let body = self.parse_block()?;
                cases.push((cond, body));
            } else {
                alternative = Some(Box::new(self.parse_block()?));
                break;
            }
        }
        Some(Statement::If {
            cases,
            alternative,
            loc,
        })
    }

    fn parse_while(&mut self) -> Option<Statement> {
        let loc = self.loc();
        self.advance();
        self.expect(TokenType::LParen);
        let condition = self.parse_expression(Precedence::Lowest)?;
        self.expect(TokenType::RParen);
        let body = Box::new(self.parse_block()?);
        Some(Statement::While {
            condition,
            body,
            loc,
        })
    }

    fn parse_for(&mut self) -> Option<Statement> {
        let loc = self.loc();
        self.advance();
        self.expect(TokenType::LParen);
        // foreach: for (ident in expr)
        if self.cur.kind == TokenType::Ident && self.next.kind == TokenType::In {
            let ident = self.cur.literal.clone();
            self.advance();
            self.advance(); // in
            let source = self.parse_expression(Precedence::Lowest)?;
            self.expect(TokenType::RParen);
            let body = Box::new(self.parse_block()?);
            return Some(Statement::ForEach {
                ident,
                source,
                body,
                loc,
            });
        }
        let init = if self.cur.kind == TokenType::Semicolon {
            None
        } else {
            self.parse_statement().map(Box::new)
        };
        if self.cur.kind == TokenType::Semicolon {
            self.advance();
        }
        let condition = if self.cur.kind == TokenType::Semicolon {
            None
        } else {
            self.parse_expression(Precedence::Lowest)
        };
        if self.cur.kind == TokenType::Semicolon {
            self.advance();
        }
        let update = if self.cur.kind == TokenType::RParen {
            None
        } else {
            self.parse_statement().map(Box::new)
        };
        self.expect(TokenType::RParen);
        let body = Box::new(self.parse_block()?);
        Some(Statement::ClassicFor {
            init,
            condition,
            update,
            body,
            loc,
        })
    }

    fn parse_block(&mut self) -> Option<Statement> {
        let loc = self.loc();
        self.expect(TokenType::LBrace);
        let mut statements = Vec::new();
        while self.cur.kind != TokenType::RBrace && self.cur.kind != TokenType::Eof {
            if let Some(stmt) = self.parse_statement() {
                statements.push(stmt);
            } else {
                self.advance();
            }
        }
        self.expect(TokenType::RBrace);
        Some(Statement::Block(statements, loc))
    }

    fn parse_import(&mut self) -> Option<Statement> {
        let loc = self.loc();
        self.advance();
        if self.cur.kind != TokenType::String {
            self.error("expected a string path after import");
            return None;
        }
        let path = self.cur.literal.clone();
        self.advance();
        Some(Statement::Import { path, loc })
    }

    fn parse_recover(&mut self) -> Option<Statement> {
        let loc = self.loc();
        self.advance();
        self.expect(TokenType::LParen);
        let err_name = self.parse_ident_name()?;
        self.expect(TokenType::RParen);
        let body = Box::new(self.parse_block()?);
        Some(Statement::Recover {
            err_name,
            body,
            loc,
        })
    }

    fn parse_expression_statement(&mut self) -> Option<Statement> {
        let loc = self.loc();
        let expr = self.parse_expression(Precedence::Lowest)?;
        if !self.repl_mode && !matches!(expr, Expression::Assign { .. } | Expression::Call { .. }) {
            self.error("only assignments and calls are allowed as statements outside REPL mode");
        }
        Some(Statement::ExpressionStmt(expr, loc))
    }

    fn parse_expression(&mut self, precedence: Precedence) -> Option<Expression> {
        let mut left = self.parse_prefix()?;
        while self.cur.kind != TokenType::Semicolon && precedence < precedence_of(self.cur.kind) {
            left = match self.cur.kind {
                TokenType::LParen => self.parse_call(left)?,
                TokenType::LBracket => self.parse_index(left)?,
                TokenType::Dot => self.parse_dot(left)?,
                TokenType::And | TokenType::Or => self.parse_logical(left)?,
                TokenType::Assign => self.parse_assign(left)?,
                TokenType::PlusAssign => self.parse_compound_assign(left, InfixOp::Add)?,
                TokenType::MinusAssign => self.parse_compound_assign(left, InfixOp::Sub)?,
                TokenType::StarAssign => self.parse_compound_assign(left, InfixOp::Mul)?,
                TokenType::SlashAssign => self.parse_compound_assign(left, InfixOp::Div)?,
                TokenType::PercentAssign => self.parse_compound_assign(left, InfixOp::Mod)?,
                TokenType::AmpAssign => self.parse_compound_assign(left, InfixOp::BitAnd)?,
                TokenType::PipeAssign => self.parse_compound_assign(left, InfixOp::BitOr)?,
                TokenType::CaretAssign => self.parse_compound_assign(left, InfixOp::BitXor)?,
                TokenType::LShiftAssign => self.parse_compound_assign(left, InfixOp::LShift)?,
                TokenType::RShiftAssign => self.parse_compound_assign(left, InfixOp::RShift)?,
                _ => self.parse_infix(left)?,
            };
        }
        Some(left)
    }

    fn parse_prefix(&mut self) -> Option<Expression> {
        let loc = self.loc();
        match self.cur.kind {
            TokenType::Ident => {
                let name = self.cur.literal.clone();
                self.advance();
                Some(Expression::Identifier(name, loc))
            }
            TokenType::Number => {
                let text = self.cur.literal.clone();
                self.advance();
                let n = parse_number_literal(&text);
                Some(Expression::Number(n, loc))
            }
            TokenType::String => {
                let s = self.cur.literal.clone();
                self.advance();
                Some(Expression::StringLiteral(s, loc))
            }
            TokenType::True => {
                self.advance();
                Some(Expression::Boolean(true, loc))
            }
            TokenType::False => {
                self.advance();
                Some(Expression::Boolean(false, loc))
            }
            TokenType::Null => {
                self.advance();
                Some(Expression::Null(loc))
            }
            TokenType::Minus => {
                self.advance();
                let right = Box::new(self.parse_expression(Precedence::Prefix)?);
                Some(Expression::Prefix {
                    operator: PrefixOp::Negate,
                    right,
                    loc,
                })
            }
            TokenType::Bang => {
                self.advance();
                let right = Box::new(self.parse_expression(Precedence::Prefix)?);
                Some(Expression::Prefix {
                    operator: PrefixOp::Not,
                    right,
                    loc,
                })
            }
            TokenType::LParen => {
                self.advance();
                let expr = self.parse_expression(Precedence::Lowest)?;
                self.expect(TokenType::RParen);
                Some(expr)
            }
            TokenType::LBracket => self.parse_array_literal(loc),
            TokenType::LBrace => self.parse_map_literal(loc),
            TokenType::Function => {
                self.advance();
                self.parse_function_tail(None, loc)
            }
            TokenType::TemplateString => {
                let text = self.cur.literal.clone();
                self.advance();
                Some(Expression::TemplateString(
                    Box::new(Expression::StringLiteral(text, loc.clone())),
                    loc,
                ))
            }
            TokenType::TemplateStringStart => self.parse_template_string(loc),
            _ => {
                self.error(format!("unexpected token {:?} in expression", self.cur.kind));
                None
            }
        }
    }

    fn parse_array_literal(&mut self, loc: SourceLocation) -> Option<Expression> {
        self.advance(); // [
        let mut items = Vec::new();
        while self.cur.kind != TokenType::RBracket {
            items.push(self.parse_expression(Precedence::Lowest)?);
            if self.cur.kind == TokenType::Comma {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(TokenType::RBracket);
        Some(Expression::ArrayLiteral(items, loc))
    }

    fn parse_map_literal(&mut self, loc: SourceLocation) -> Option<Expression> {
        self.advance(); // {
        let mut pairs = Vec::new();
        while self.cur.kind != TokenType::RBrace {
            let key = if self.cur.kind == TokenType::Ident {
                let name = self.cur.literal.clone();
                let key_loc = self.loc();
                self.advance();
                Expression::StringLiteral(name, key_loc)
            } else {
                self.parse_expression(Precedence::Lowest)?
            };
            self.expect(TokenType::Colon);
            let value = self.parse_expression(Precedence::Lowest)?;
            pairs.push((key, value));
            if self.cur.kind == TokenType::Comma {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(TokenType::RBrace);
        Some(Expression::MapLiteral(pairs, loc))
    }

    fn parse_function_tail(&mut self, name: Option<String>, loc: SourceLocation) -> Option<Expression> {
        self.expect(TokenType::LParen);
        let mut params = Vec::new();
        while self.cur.kind != TokenType::RParen {
            params.push(self.parse_ident_name()?);
            if self.cur.kind == TokenType::Comma {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(TokenType::RParen);
        let body = Box::new(self.parse_block()?);
        Some(Expression::FunctionLiteral {
            name,
            params,
            body,
            loc,
        })
    }

    /// Parses the rest of a template string after the lexer has already
    /// yielded the initial `TemplateStringStart` token. The lexer itself
    /// emits `TemplateStringMiddle`/`TemplateStringEnd` in place of the
    /// hole-closing `RBrace`, so once `parse_expression` returns, `self.cur`
    /// already holds the next template chunk — no separate resume step.
    fn parse_template_string(&mut self, loc: SourceLocation) -> Option<Expression> {
        let first_text = self.cur.literal.clone();
        let mut chain: Expression = Expression::StringLiteral(first_text, loc.clone());
        loop {
            self.advance(); // move past the Start/Middle token into the interpolated expr
            let interpolated = self.parse_expression(Precedence::Lowest)?;
            chain = Expression::Infix {
                left: Box::new(chain),
                operator: InfixOp::Add,
                right: Box::new(wrap_to_str(interpolated, loc.clone())),
                loc: loc.clone(),
            };
            match self.cur.kind {
                TokenType::TemplateStringEnd => {
                    let text = self.cur.literal.clone();
                    chain = Expression::Infix {
                        left: Box::new(chain),
                        operator: InfixOp::Add,
                        right: Box::new(Expression::StringLiteral(text, loc.clone())),
                        loc: loc.clone(),
                    };
                    self.advance();
                    break;
                }
                TokenType::TemplateStringMiddle => {
                    let text = self.cur.literal.clone();
                    chain = Expression::Infix {
                        left: Box::new(chain),
                        operator: InfixOp::Add,
                        right: Box::new(Expression::StringLiteral(text, loc.clone())),
                        loc: loc.clone(),
                    };
                    continue;
                }
                _ => {
                    self.error("malformed template string");
                    return None;
                }
            }
        }
        Some(Expression::TemplateString(Box::new(chain), loc))
    }

    fn parse_call(&mut self, function: Expression) -> Option<Expression> {
        let loc = self.loc();
        self.advance(); // (
        let mut args = Vec::new();
        while self.cur.kind != TokenType::RParen {
            args.push(self.parse_expression(Precedence::Lowest)?);
            if self.cur.kind == TokenType::Comma {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(TokenType::RParen);
        Some(Expression::Call {
            function: Box::new(function),
            args,
            loc,
        })
    }

    fn parse_index(&mut self, left: Expression) -> Option<Expression> {
        let loc = self.loc();
        self.advance(); // [
        let index = self.parse_expression(Precedence::Lowest)?;
        self.expect(TokenType::RBracket);
        Some(Expression::Index {
            left: Box::new(left),
            index: Box::new(index),
            loc,
        })
    }

    /// `a.b` desugars to `a["b"]`.
    fn parse_dot(&mut self, left: Expression) -> Option<Expression> {
        let loc = self.loc();
        self.advance(); // .
        let name = self.parse_ident_name()?;
        Some(Expression::Index {
            left: Box::new(left),
            index: Box::new(Expression::StringLiteral(name, loc.clone())),
            loc,
        })
    }

    fn parse_logical(&mut self, left: Expression) -> Option<Expression> {
        let loc = self.loc();
        let (operator, tok_kind) = if self.cur.kind == TokenType::And {
            (LogicalOp::And, TokenType::And)
        } else {
            (LogicalOp::Or, TokenType::Or)
        };
        let precedence = precedence_of(tok_kind);
        self.advance();
        let right = self.parse_expression(precedence)?;
        Some(Expression::Logical {
            left: Box::new(left),
            operator,
            right: Box::new(right),
            loc,
        })
    }

    /// `a = b` is right-associative, so the RHS is parsed down at `Lowest`
    /// rather than at `Assign`, letting a nested `=` bind before returning.
    fn parse_assign(&mut self, target: Expression) -> Option<Expression> {
        let loc = self.loc();
        self.advance(); // =
        let value = self.parse_expression(Precedence::Lowest)?;
        Some(Expression::Assign {
            target: Box::new(target),
            value: Box::new(value),
            loc,
        })
    }

    /// Desugars `target OP= value` into `target = target OP value`.
    fn parse_compound_assign(&mut self, target: Expression, op: InfixOp) -> Option<Expression> {
        let loc = self.loc();
        self.advance();
        let rhs = self.parse_expression(Precedence::Lowest)?;
        let combined = Expression::Infix {
            left: Box::new(target.clone()),
            operator: op,
            right: Box::new(rhs),
            loc: loc.clone(),
        };
        Some(Expression::Assign {
            target: Box::new(target),
            value: Box::new(combined),
            loc,
        })
    }

    fn parse_infix(&mut self, left: Expression) -> Option<Expression> {
        let loc = self.loc();
        let op_tok = self.cur.kind;
        let operator = infix_op(op_tok)?;
        let precedence = precedence_of(op_tok);
        self.advance();
        let right = self.parse_expression(precedence)?;
        Some(Expression::Infix {
            left: Box::new(left),
            operator,
            right: Box::new(right),
            loc,
        })
    }
}

fn infix_op(kind: TokenType) -> Option<InfixOp> {
    use TokenType::*;
    Some(match kind {
        Plus => InfixOp::Add,
        Minus => InfixOp::Sub,
        Star => InfixOp::Mul,
        Slash => InfixOp::Div,
        Percent => InfixOp::Mod,
        Pipe => InfixOp::BitOr,
        Caret => InfixOp::BitXor,
        Amp => InfixOp::BitAnd,
        LShift => InfixOp::LShift,
        RShift => InfixOp::RShift,
        Lt => InfixOp::Lt,
        LtEq => InfixOp::LtEq,
        Gt => InfixOp::Gt,
        GtEq => InfixOp::GtEq,
        Eq => InfixOp::Eq,
        NotEq => InfixOp::NotEq,
        _ => return None,
    })
}

fn parse_number_literal(text: &str) -> f64 {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).unwrap_or(0) as f64;
    }
    text.parse().unwrap_or(f64::NAN)
}

fn wrap_to_str(expr: Expression, loc: SourceLocation) -> Expression {
    Expression::Call {
        function: Box::new(Expression::Identifier("to_str".to_string(), loc.clone())),
        args: vec![expr],
        loc,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Program {
        let mut parser = Parser::new(src, None);
        let program = parser.parse_program();
        assert!(
            parser.errors.is_empty(),
            "unexpected errors: {:?}",
            parser.errors.iter().collect::<Vec<_>>()
        );
        program
    }

    #[test]
    fn precedence_mul_binds_tighter_than_add() {
        let program = parse("1+2*3;");
        let Statement::ExpressionStmt(Expression::Infix { operator, right, .. }, _) = &program.statements[0] else {
            panic!("expected infix expression statement")
        };
        assert_eq!(*operator, InfixOp::Add);
        assert!(matches!(**right, Expression::Infix { operator: InfixOp::Mul, .. }));
    }

    #[test]
    fn assignment_is_right_associative() {
        let program = parse("a = b = c;");
        let Statement::ExpressionStmt(Expression::Assign { value, .. }, _) = &program.statements[0] else {
            panic!("expected assign")
        };
        assert!(matches!(**value, Expression::Assign { .. }));
    }

    #[test]
    fn dot_access_desugars_to_index() {
        let program = parse("a.b.c;");
        let Statement::ExpressionStmt(Expression::Index { left, index, .. }, _) = &program.statements[0] else {
            panic!("expected index")
        };
        assert!(matches!(**index, Expression::StringLiteral(ref s, _) if s == "c"));
        assert!(matches!(**left, Expression::Index { .. }));
    }

    #[test]
    fn compound_assignment_desugars() {
        let program = parse("a += 1;");
        let Statement::ExpressionStmt(Expression::Assign { value, .. }, _) = &program.statements[0] else {
            panic!("expected assign")
        };
        assert!(matches!(**value, Expression::Infix { operator: InfixOp::Add, .. }));
    }

    #[test]
    fn named_function_desugars_to_const() {
        let program = parse("fn add(a, b) { return a + b }");
        assert!(matches!(program.statements[0], Statement::ConstDef { ref name, .. } if name == "add"));
    }

    #[test]
    fn template_string_wraps_interpolation_in_to_str() {
        let program = parse("`hi ${name}`;");
        let Statement::ExpressionStmt(Expression::TemplateString(chain, _), _) = &program.statements[0] else {
            panic!("expected template string")
        };
        fn contains_to_str_call(expr: &Expression) -> bool {
            match expr {
                Expression::Call { function, .. } => {
                    matches!(**function, Expression::Identifier(ref n, _) if n == "to_str")
                }
                Expression::Infix { left, right, .. } => {
                    contains_to_str_call(left) || contains_to_str_call(right)
                }
                _ => false,
            }
        }
        assert!(contains_to_str_call(chain));
    }

    #[test]
    fn if_else_if_else_chain() {
        let program = parse("if (a) { return 1 } else if (b) { return 2 } else { return 3 }");
        let Statement::If { cases, alternative, .. } = &program.statements[0] else {
            panic!("expected if")
        };
        assert_eq!(cases.len(), 2);
        assert!(alternative.is_some());
    }

    #[test]
    fn foreach_loop_parses() {
        let program = parse("for (x in arr) { print(x) }");
        assert!(matches!(program.statements[0], Statement::ForEach { .. }));
    }

    #[test]
    fn array_and_map_literals() {
        let program = parse("[1, 2, 3];");
        assert!(matches!(
            program.statements[0],
            Statement::ExpressionStmt(Expression::ArrayLiteral(ref items, _), _) if items.len() == 3
        ));
    }
}
