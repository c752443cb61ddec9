//! Formula Abstract Syntax Tree

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Text(String),
    Boolean(bool),
    Null,
    /// `[Column Name]`, resolved to an id at compile time
    Column(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
}

impl Expr {
    /// Every column name referenced, in first-use order
    pub fn column_refs(&self) -> Vec<&str> {
        let mut refs = Vec::new();
        self.collect_refs(&mut refs);
        refs
    }

    fn collect_refs<'a>(&'a self, refs: &mut Vec<&'a str>) {
        match self {
            Expr::Column(name) => {
                if !refs.contains(&name.as_str()) {
                    refs.push(name);
                }
            }
            Expr::Unary(_, inner) => inner.collect_refs(refs),
            Expr::Binary(_, left, right) => {
                left.collect_refs(refs);
                right.collect_refs(refs);
            }
            Expr::Call(_, args) => {
                for arg in args {
                    arg.collect_refs(refs);
                }
            }
            Expr::Number(_) | Expr::Text(_) | Expr::Boolean(_) | Expr::Null => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Concat,
    Equal,
    NotEqual,
    LessThan,
    LessThanEq,
    GreaterThan,
    GreaterThanEq,
    And,
    Or,
}

/// Built-in functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    If,
    Concat,
    Upper,
    Lower,
    Len,
    Round,
    Abs,
    Sqrt,
    Pow,
    Min,
    Max,
    Today,
    Now,
    Year,
    Month,
    Day,
    DateDiff,
    IsEmpty,
}

impl Function {
    pub fn from_name(name: &str) -> Option<Self> {
        let function = match name.to_uppercase().as_str() {
            "IF" => Function::If,
            "CONCAT" => Function::Concat,
            "UPPER" => Function::Upper,
            "LOWER" => Function::Lower,
            "LEN" | "LENGTH" => Function::Len,
            "ROUND" => Function::Round,
            "ABS" => Function::Abs,
            "SQRT" => Function::Sqrt,
            "POW" | "POWER" => Function::Pow,
            "MIN" => Function::Min,
            "MAX" => Function::Max,
            "TODAY" => Function::Today,
            "NOW" => Function::Now,
            "YEAR" => Function::Year,
            "MONTH" => Function::Month,
            "DAY" => Function::Day,
            "DATE_DIFF" | "DATEDIFF" => Function::DateDiff,
            "ISEMPTY" | "IS_EMPTY" => Function::IsEmpty,
            _ => return None,
        };
        Some(function)
    }

    /// Accepted argument count as (min, max); `None` max means variadic
    pub fn arity(self) -> (usize, Option<usize>) {
        match self {
            Function::Today | Function::Now => (0, Some(0)),
            Function::Upper
            | Function::Lower
            | Function::Len
            | Function::Abs
            | Function::Sqrt
            | Function::Year
            | Function::Month
            | Function::Day
            | Function::IsEmpty => (1, Some(1)),
            Function::Round => (1, Some(2)),
            Function::Pow => (2, Some(2)),
            Function::If => (2, Some(3)),
            Function::DateDiff => (2, Some(3)),
            Function::Concat => (0, None),
            Function::Min | Function::Max => (1, None),
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Function::If => "IF",
            Function::Concat => "CONCAT",
            Function::Upper => "UPPER",
            Function::Lower => "LOWER",
            Function::Len => "LEN",
            Function::Round => "ROUND",
            Function::Abs => "ABS",
            Function::Sqrt => "SQRT",
            Function::Pow => "POW",
            Function::Min => "MIN",
            Function::Max => "MAX",
            Function::Today => "TODAY",
            Function::Now => "NOW",
            Function::Year => "YEAR",
            Function::Month => "MONTH",
            Function::Day => "DAY",
            Function::DateDiff => "DATE_DIFF",
            Function::IsEmpty => "ISEMPTY",
        };
        f.write_str(name)
    }
}
