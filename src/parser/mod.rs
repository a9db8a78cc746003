//! SQL Parser for basalt
//!
//! Implements a hand-written recursive descent parser for the statement
//! subset the pipeline consumes:
//! - CREATE DATABASE, CREATE TABLE
//! - INSERT, UPDATE (with WHERE)
//! - SELECT (single table or INNER JOIN, with WHERE)
//! - BEGIN, COMMIT, ROLLBACK
//!
//! The parser produces an Abstract Syntax Tree (AST) that the connection and
//! planner process; nothing downstream ever re-tokenizes statement text.

use crate::error::{BasaltError, Result};
use crate::lexer::{Lexer, Token};
use crate::types::ColumnType;

pub mod ast;
pub use self::ast::*;

//=============================================================================
// Parser
//=============================================================================

/// SQL Parser
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    /// Parse a SQL string into a statement
    pub fn parse(sql: &str) -> Result<Statement> {
        let mut lexer = Lexer::new(sql);
        let tokens = lexer.tokenize()?;
        let mut parser = Parser { tokens, pos: 0 };
        let stmt = parser.parse_statement()?;
        parser.expect_end()?;
        Ok(stmt)
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        if *self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(BasaltError::Parse(format!(
                "Expected {:?}, found {:?}",
                expected,
                self.peek()
            )))
        }
    }

    fn consume(&mut self, token: Token) -> bool {
        if *self.peek() == token {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_end(&mut self) -> Result<()> {
        self.consume(Token::Semicolon);
        if *self.peek() == Token::Eof {
            Ok(())
        } else {
            Err(BasaltError::Parse(format!(
                "Unexpected trailing input: {:?}",
                self.peek()
            )))
        }
    }

    fn consume_identifier(&mut self) -> Result<String> {
        match self.peek().clone() {
            Token::Identifier(name) => {
                self.advance();
                Ok(name)
            }
            // `id`, `key` and friends are not reserved here
            Token::Key => {
                self.advance();
                Ok("key".into())
            }
            other => Err(BasaltError::Parse(format!(
                "Expected identifier, found {:?}",
                other
            ))),
        }
    }

    fn parse_statement(&mut self) -> Result<Statement> {
        match self.peek() {
            Token::Create => self.parse_create(),
            Token::Insert => self.parse_insert(),
            Token::Update => self.parse_update(),
            Token::Select => self.parse_select(),
            Token::Begin => {
                self.advance();
                Ok(Statement::Begin)
            }
            Token::Commit => {
                self.advance();
                Ok(Statement::Commit)
            }
            Token::Rollback => {
                self.advance();
                Ok(Statement::Rollback)
            }
            other => Err(BasaltError::Parse(format!(
                "Not supported statement: {:?}",
                other
            ))),
        }
    }

    //=========================================================================
    // DDL
    //=========================================================================

    fn parse_create(&mut self) -> Result<Statement> {
        self.expect(Token::Create)?;
        match self.peek() {
            Token::Database => {
                self.advance();
                let name = self.consume_identifier()?;
                Ok(Statement::CreateDatabase(CreateDatabaseStmt { name }))
            }
            Token::Table => {
                self.advance();
                self.parse_create_table()
            }
            other => Err(BasaltError::Parse(format!(
                "Not supported CREATE target: {:?}",
                other
            ))),
        }
    }

    fn parse_create_table(&mut self) -> Result<Statement> {
        let (database, table) = self.parse_qualified_name()?;
        self.expect(Token::LeftParen)?;

        let mut columns = Vec::new();
        let mut primary_key = None;
        loop {
            if *self.peek() == Token::Primary {
                self.advance();
                self.expect(Token::Key)?;
                self.expect(Token::LeftParen)?;
                let col = self.consume_identifier()?;
                self.expect(Token::RightParen)?;
                primary_key = Some(col);
            } else {
                columns.push(self.parse_column_def()?);
            }

            if !self.consume(Token::Comma) {
                break;
            }
        }
        self.expect(Token::RightParen)?;

        if columns.is_empty() {
            return Err(BasaltError::Parse("Table needs at least one column".into()));
        }

        Ok(Statement::CreateTable(CreateTableStmt {
            database,
            table,
            columns,
            primary_key,
        }))
    }

    fn parse_column_def(&mut self) -> Result<ColumnDefAst> {
        let name = self.consume_identifier()?;

        let (mut column_type, length) = match self.peek() {
            Token::Int => {
                self.advance();
                (ColumnType::Int, 0)
            }
            Token::Varchar => {
                self.advance();
                self.expect(Token::LeftParen)?;
                let len = self.consume_number()?;
                self.expect(Token::RightParen)?;
                (ColumnType::VarChar, len as u32)
            }
            other => {
                return Err(BasaltError::Parse(format!(
                    "Not supported column type: {:?}",
                    other
                )))
            }
        };

        let mut allows_null = true;
        loop {
            match self.peek() {
                Token::AutoIncrement => {
                    if column_type != ColumnType::Int {
                        return Err(BasaltError::Parse(
                            "AUTO_INCREMENT is only valid for INT columns".into(),
                        ));
                    }
                    column_type = ColumnType::AutoIncrementInt;
                    self.advance();
                }
                Token::Not => {
                    self.advance();
                    self.expect(Token::Null)?;
                    allows_null = false;
                }
                _ => break,
            }
        }

        Ok(ColumnDefAst {
            name,
            column_type,
            length,
            allows_null,
        })
    }

    //=========================================================================
    // DML
    //=========================================================================

    fn parse_insert(&mut self) -> Result<Statement> {
        self.expect(Token::Insert)?;
        self.expect(Token::Into)?;
        let (database, table) = self.parse_qualified_name()?;

        self.expect(Token::LeftParen)?;
        let mut columns = Vec::new();
        loop {
            columns.push(self.consume_identifier()?);
            if !self.consume(Token::Comma) {
                break;
            }
        }
        self.expect(Token::RightParen)?;
        self.expect(Token::Values)?;

        let mut rows = Vec::new();
        loop {
            self.expect(Token::LeftParen)?;
            let mut values = Vec::new();
            loop {
                values.push(self.consume_literal()?);
                if !self.consume(Token::Comma) {
                    break;
                }
            }
            self.expect(Token::RightParen)?;

            if values.len() != columns.len() {
                return Err(BasaltError::Parse(format!(
                    "Column count doesn't match value count (expected {}, got {})",
                    columns.len(),
                    values.len()
                )));
            }
            rows.push(values);

            if !self.consume(Token::Comma) {
                break;
            }
        }

        Ok(Statement::Insert(InsertStmt {
            database,
            table,
            columns,
            rows,
        }))
    }

    fn parse_update(&mut self) -> Result<Statement> {
        self.expect(Token::Update)?;
        let (database, table) = self.parse_qualified_name()?;
        self.expect(Token::Set)?;

        let mut assignments = Vec::new();
        loop {
            let column = self.consume_identifier()?;
            self.expect(Token::Equal)?;
            let expr = self.parse_value_expr()?;
            assignments.push(Assignment { column, expr });
            if !self.consume(Token::Comma) {
                break;
            }
        }

        let where_clause = if self.consume(Token::Where) {
            Some(self.parse_condition()?)
        } else {
            None
        };

        Ok(Statement::Update(UpdateStmt {
            database,
            table,
            assignments,
            where_clause,
        }))
    }

    //=========================================================================
    // SELECT
    //=========================================================================

    fn parse_select(&mut self) -> Result<Statement> {
        self.expect(Token::Select)?;

        let mut columns = Vec::new();
        loop {
            if self.consume(Token::Star) {
                columns.push(SelectColumn::Star);
            } else {
                let (table, name) = self.parse_column_ref()?;
                columns.push(SelectColumn::Column { table, name });
            }
            if !self.consume(Token::Comma) {
                break;
            }
        }

        self.expect(Token::From)?;
        let from = self.parse_table_ref()?;

        let join = if self.consume(Token::Inner) {
            self.expect(Token::Join)?;
            let table = self.parse_table_ref()?;
            self.expect(Token::On)?;
            let on = self.parse_condition()?;
            Some(JoinClause { table, on })
        } else {
            None
        };

        let where_clause = if self.consume(Token::Where) {
            Some(self.parse_condition()?)
        } else {
            None
        };

        Ok(Statement::Select(SelectStmt {
            columns,
            from,
            join,
            where_clause,
        }))
    }

    fn parse_table_ref(&mut self) -> Result<TableRef> {
        let (database, table) = self.parse_qualified_name()?;
        let alias = if self.consume(Token::As) {
            Some(self.consume_identifier()?)
        } else if let Token::Identifier(_) = self.peek() {
            Some(self.consume_identifier()?)
        } else {
            None
        };
        Ok(TableRef {
            database,
            table,
            alias,
        })
    }

    //=========================================================================
    // Expressions
    //=========================================================================

    /// Condition grammar: comparison (AND comparison)*
    fn parse_condition(&mut self) -> Result<Expr> {
        let mut expr = self.parse_comparison()?;
        while self.consume(Token::And) {
            let right = self.parse_comparison()?;
            expr = Expr::And(Box::new(expr), Box::new(right));
        }
        Ok(expr)
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let left = self.parse_operand()?;
        let op = match self.peek() {
            Token::Equal => CompareOp::Eq,
            Token::NotEqual => CompareOp::NotEq,
            other => {
                return Err(BasaltError::Parse(format!(
                    "Not supported operator in condition: {:?}",
                    other
                )))
            }
        };
        self.advance();
        let right = self.parse_operand()?;
        Ok(Expr::Comparison {
            left: Box::new(left),
            op,
            right: Box::new(right),
        })
    }

    /// SET expression grammar: operand ((+|-) operand)?
    fn parse_value_expr(&mut self) -> Result<Expr> {
        let left = self.parse_operand()?;
        let op = match self.peek() {
            Token::Plus => Some(ArithOp::Add),
            Token::Minus => Some(ArithOp::Sub),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let right = self.parse_operand()?;
            Ok(Expr::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            })
        } else {
            Ok(left)
        }
    }

    fn parse_operand(&mut self) -> Result<Expr> {
        match self.peek().clone() {
            Token::StringLiteral(s) => {
                self.advance();
                Ok(Expr::Literal(s))
            }
            Token::NumberLiteral(n) => {
                self.advance();
                Ok(Expr::Literal(n))
            }
            Token::Identifier(_) | Token::Key => {
                let (table, name) = self.parse_column_ref()?;
                Ok(Expr::Column { table, name })
            }
            other => Err(BasaltError::Parse(format!(
                "Not supported expression: {:?}",
                other
            ))),
        }
    }

    fn consume_literal(&mut self) -> Result<String> {
        match self.peek().clone() {
            Token::StringLiteral(s) => {
                self.advance();
                Ok(s)
            }
            Token::NumberLiteral(n) => {
                self.advance();
                Ok(n)
            }
            other => Err(BasaltError::Parse(format!(
                "Expected literal, found {:?}",
                other
            ))),
        }
    }

    fn consume_number(&mut self) -> Result<u64> {
        match self.peek().clone() {
            Token::NumberLiteral(n) => {
                self.advance();
                n.parse()
                    .map_err(|_| BasaltError::Parse(format!("Invalid number: {}", n)))
            }
            other => Err(BasaltError::Parse(format!(
                "Expected number, found {:?}",
                other
            ))),
        }
    }

    /// `db.table`
    fn parse_qualified_name(&mut self) -> Result<(String, String)> {
        let first = self.consume_identifier()?;
        if self.consume(Token::Dot) {
            let second = self.consume_identifier()?;
            Ok((first, second))
        } else {
            Err(BasaltError::Parse(format!(
                "Table name must be database-qualified: {}",
                first
            )))
        }
    }

    /// `col`, `alias.col`
    fn parse_column_ref(&mut self) -> Result<(Option<String>, String)> {
        let first = self.consume_identifier()?;
        if self.consume(Token::Dot) {
            let second = self.consume_identifier()?;
            Ok((Some(first), second))
        } else {
            Ok((None, first))
        }
    }
}
