//! Formula Lexer
//!
//! Tokenizes formula expressions. Column references are written in square
//! brackets and may contain spaces:
//! ```text
//! =IF([Done], 0, [Estimate] * 1.5) & " pts"
//! ```

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Keywords
    And,
    Or,
    Not,
    True,
    False,
    Null,

    // Literals
    Identifier(String),
    Column(String),
    String(String),
    Number(f64),

    // Operators
    Equal,         // = or ==
    NotEqual,      // != or <>
    LessThan,      // <
    LessThanEq,    // <=
    GreaterThan,   // >
    GreaterThanEq, // >=
    Plus,          // +
    Minus,         // -
    Star,          // *
    Slash,         // /
    Percent,       // %
    Ampersand,     // &
    Comma,         // ,
    LeftParen,     // (
    RightParen,    // )

    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Identifier(s) => write!(f, "identifier '{}'", s),
            Token::Column(s) => write!(f, "column [{}]", s),
            Token::String(s) => write!(f, "string \"{}\"", s),
            Token::Number(n) => write!(f, "number {}", n),
            Token::Eof => write!(f, "end of formula"),
            _ => write!(f, "{:?}", self),
        }
    }
}

pub struct Lexer {
    input: Vec<char>,
    position: usize,
    current_char: Option<char>,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        let chars: Vec<char> = input.chars().collect();
        let current = chars.first().copied();
        Lexer {
            input: chars,
            position: 0,
            current_char: current,
        }
    }

    /// Tokenize the entire input
    pub fn tokenize(&mut self) -> Result<Vec<Token>, String> {
        let mut tokens = Vec::new();

        loop {
            let token = self.next_token()?;
            let done = token == Token::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }

        Ok(tokens)
    }

    pub fn next_token(&mut self) -> Result<Token, String> {
        self.skip_whitespace();

        match self.current_char {
            None => Ok(Token::Eof),
            Some(ch) => {
                if ch.is_alphabetic() || ch == '_' {
                    Ok(self.read_identifier())
                } else if ch.is_ascii_digit()
                    || (ch == '.' && self.peek().is_some_and(|c| c.is_ascii_digit()))
                {
                    self.read_number()
                } else if ch == '"' || ch == '\'' {
                    self.read_string()
                } else if ch == '[' {
                    self.read_column()
                } else {
                    self.read_operator()
                }
            }
        }
    }

    fn advance(&mut self) {
        self.position += 1;
        self.current_char = self.input.get(self.position).copied();
    }

    fn peek(&self) -> Option<char> {
        self.input.get(self.position + 1).copied()
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.current_char {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn read_identifier(&mut self) -> Token {
        let mut result = String::new();

        while let Some(ch) = self.current_char {
            if ch.is_alphanumeric() || ch == '_' {
                result.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        match result.to_uppercase().as_str() {
            "AND" => Token::And,
            "OR" => Token::Or,
            "NOT" => Token::Not,
            "TRUE" => Token::True,
            "FALSE" => Token::False,
            "NULL" => Token::Null,
            _ => Token::Identifier(result),
        }
    }

    fn read_number(&mut self) -> Result<Token, String> {
        let mut result = String::new();
        let mut seen_dot = false;
        let mut seen_exp = false;

        while let Some(ch) = self.current_char {
            if ch.is_ascii_digit() {
                result.push(ch);
                self.advance();
            } else if ch == '.' && !seen_dot && !seen_exp {
                seen_dot = true;
                result.push(ch);
                self.advance();
            } else if (ch == 'e' || ch == 'E') && !seen_exp {
                let next = self.peek();
                let signed = matches!(next, Some('+') | Some('-'));
                let digit_after = if signed {
                    self.input.get(self.position + 2).is_some_and(|c| c.is_ascii_digit())
                } else {
                    next.is_some_and(|c| c.is_ascii_digit())
                };
                if !digit_after {
                    break;
                }
                seen_exp = true;
                result.push(ch);
                self.advance();
                if signed {
                    if let Some(sign) = self.current_char {
                        result.push(sign);
                    }
                    self.advance();
                }
            } else {
                break;
            }
        }

        result
            .parse::<f64>()
            .map(Token::Number)
            .map_err(|e| format!("Invalid number '{}': {}", result, e))
    }

    fn read_string(&mut self) -> Result<Token, String> {
        let quote_char = self.current_char.unwrap_or('"');
        self.advance(); // skip opening quote

        let mut result = String::new();
        let mut escaped = false;

        while let Some(ch) = self.current_char {
            if escaped {
                match ch {
                    'n' => result.push('\n'),
                    't' => result.push('\t'),
                    '\\' => result.push('\\'),
                    '\'' => result.push('\''),
                    '"' => result.push('"'),
                    _ => {
                        result.push('\\');
                        result.push(ch);
                    }
                }
                escaped = false;
                self.advance();
            } else if ch == '\\' {
                escaped = true;
                self.advance();
            } else if ch == quote_char {
                self.advance();
                return Ok(Token::String(result));
            } else {
                result.push(ch);
                self.advance();
            }
        }

        Err("Unterminated string literal".to_string())
    }

    fn read_column(&mut self) -> Result<Token, String> {
        self.advance(); // skip [
        let mut name = String::new();

        while let Some(ch) = self.current_char {
            if ch == ']' {
                self.advance();
                let name = name.trim().to_string();
                if name.is_empty() {
                    return Err("Empty column reference []".to_string());
                }
                return Ok(Token::Column(name));
            }
            name.push(ch);
            self.advance();
        }

        Err(format!("Unterminated column reference [{}", name))
    }

    fn read_operator(&mut self) -> Result<Token, String> {
        let ch = self.current_char.unwrap_or('\0');
        let next = self.peek();

        let (token, width) = match (ch, next) {
            ('=', Some('=')) => (Token::Equal, 2),
            ('=', _) => (Token::Equal, 1),
            ('!', Some('=')) => (Token::NotEqual, 2),
            ('!', _) => (Token::Not, 1),
            ('<', Some('>')) => (Token::NotEqual, 2),
            ('<', Some('=')) => (Token::LessThanEq, 2),
            ('<', _) => (Token::LessThan, 1),
            ('>', Some('=')) => (Token::GreaterThanEq, 2),
            ('>', _) => (Token::GreaterThan, 1),
            ('&', Some('&')) => (Token::And, 2),
            ('&', _) => (Token::Ampersand, 1),
            ('|', Some('|')) => (Token::Or, 2),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('%', _) => (Token::Percent, 1),
            (',', _) => (Token::Comma, 1),
            ('(', _) => (Token::LeftParen, 1),
            (')', _) => (Token::RightParen, 1),
            _ => return Err(format!("Unexpected character '{}'", ch)),
        };

        for _ in 0..width {
            self.advance();
        }
        Ok(token)
    }
}
