//! Formula Parser
//!
//! Converts the token stream from the lexer into an expression tree.
//! Precedence, loosest first: OR, AND, comparison, `&`, additive,
//! multiplicative, unary, primary.

use crate::formula_ast::*;
use crate::formula_lexer::{Lexer, Token};

pub struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

/// Parse formula text; a single leading `=` is optional
pub fn parse_formula(source: &str) -> Result<Expr, String> {
    let trimmed = source.trim();
    let body = trimmed.strip_prefix('=').unwrap_or(trimmed);
    if body.trim().is_empty() {
        return Err("Formula is empty".to_string());
    }
    Parser::parse(body)
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Parser {
            tokens,
            position: 0,
        }
    }

    pub fn parse(input: &str) -> Result<Expr, String> {
        let mut lexer = Lexer::new(input);
        let tokens = lexer.tokenize()?;
        let mut parser = Parser::new(tokens);
        let expr = parser.parse_expression()?;
        if parser.current() != &Token::Eof {
            return Err(format!("Unexpected {} after expression", parser.current()));
        }
        Ok(expr)
    }

    fn parse_expression(&mut self) -> Result<Expr, String> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;

        while self.current() == &Token::Or {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_comparison()?;

        while self.current() == &Token::And {
            self.advance();
            let right = self.parse_comparison()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_concat()?;

        loop {
            let op = match self.current() {
                Token::Equal => BinaryOp::Equal,
                Token::NotEqual => BinaryOp::NotEqual,
                Token::LessThan => BinaryOp::LessThan,
                Token::LessThanEq => BinaryOp::LessThanEq,
                Token::GreaterThan => BinaryOp::GreaterThan,
                Token::GreaterThanEq => BinaryOp::GreaterThanEq,
                _ => break,
            };
            self.advance();
            let right = self.parse_concat()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    fn parse_concat(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_additive()?;

        while self.current() == &Token::Ampersand {
            self.advance();
            let right = self.parse_additive()?;
            left = Expr::Binary(BinaryOp::Concat, Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_multiplicative()?;

        loop {
            let op = match self.current() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Subtract,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;

        loop {
            let op = match self.current() {
                Token::Star => BinaryOp::Multiply,
                Token::Slash => BinaryOp::Divide,
                Token::Percent => BinaryOp::Modulo,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        match self.current() {
            Token::Not => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Not, Box::new(self.parse_unary()?)))
            }
            Token::Minus => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Negate, Box::new(self.parse_unary()?)))
            }
            Token::Plus => {
                self.advance();
                self.parse_unary()
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.current().clone() {
            Token::Number(n) => {
                self.advance();
                Ok(Expr::Number(n))
            }
            Token::String(s) => {
                self.advance();
                Ok(Expr::Text(s))
            }
            Token::True => {
                self.advance();
                Ok(Expr::Boolean(true))
            }
            Token::False => {
                self.advance();
                Ok(Expr::Boolean(false))
            }
            Token::Null => {
                self.advance();
                Ok(Expr::Null)
            }
            Token::Column(name) => {
                self.advance();
                Ok(Expr::Column(name))
            }
            Token::Identifier(name) => {
                self.advance();
                self.parse_call(&name)
            }
            Token::LeftParen => {
                self.advance();
                let expr = self.parse_expression()?;
                self.expect(&Token::RightParen)?;
                Ok(expr)
            }
            other => Err(format!("Unexpected {} in expression", other)),
        }
    }

    /// Function call; the name has already been consumed
    fn parse_call(&mut self, name: &str) -> Result<Expr, String> {
        let function =
            Function::from_name(name).ok_or_else(|| format!("Unknown function '{}'", name))?;
        self.expect(&Token::LeftParen)?;

        let mut args = Vec::new();
        if self.current() != &Token::RightParen {
            loop {
                args.push(self.parse_expression()?);
                if self.current() == &Token::Comma {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(&Token::RightParen)?;

        let (min, max) = function.arity();
        let too_many = max.is_some_and(|max| args.len() > max);
        if args.len() < min || too_many {
            let expected = match max {
                Some(max) if max == min => format!("{}", min),
                Some(max) => format!("{} to {}", min, max),
                None => format!("at least {}", min),
            };
            return Err(format!(
                "{} expects {} argument(s), got {}",
                function,
                expected,
                args.len()
            ));
        }

        Ok(Expr::Call(function, args))
    }

    // Helper methods

    fn current(&self) -> &Token {
        self.tokens.get(self.position).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) {
        if self.position < self.tokens.len() {
            self.position += 1;
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), String> {
        if std::mem::discriminant(self.current()) == std::mem::discriminant(expected) {
            self.advance();
            Ok(())
        } else {
            Err(format!("Expected {}, got {}", expected, self.current()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence() {
        let expr = parse_formula("=[A] + [B] * 2 > 10 AND NOT [Done]").unwrap();
        match expr {
            Expr::Binary(BinaryOp::And, left, right) => {
                assert!(matches!(*left, Expr::Binary(BinaryOp::GreaterThan, _, _)));
                assert!(matches!(*right, Expr::Unary(UnaryOp::Not, _)));
            }
            other => panic!("unexpected tree: {:?}", other),
        }
    }

    #[test]
    fn test_leading_equals_optional() {
        assert_eq!(parse_formula("=1 + 2"), parse_formula("1 + 2"));
        assert!(parse_formula("=").is_err());
        assert!(parse_formula("   ").is_err());
    }

    #[test]
    fn test_function_arity_checked() {
        assert!(parse_formula("IF([A], 1)").is_ok());
        assert!(parse_formula("IF([A])").is_err());
        assert!(parse_formula("TODAY(1)").is_err());
        assert!(parse_formula("FROBNICATE(1)").is_err());
    }

    #[test]
    fn test_column_refs_deduplicated() {
        let expr = parse_formula("CONCAT([Name], \" \", [name], [Name])").unwrap();
        assert_eq!(expr.column_refs(), vec!["Name", "name"]);
    }

    #[test]
    fn test_trailing_tokens_rejected() {
        assert!(parse_formula("1 2").is_err());
        assert!(parse_formula("(1 + 2").is_err());
    }
}
