//! Floating point expression evaluation for `#expr` and `#ifexpr`.
//!
//! A shunting-yard evaluator over `f64` with the operator set wikitext
//! arithmetic uses: the usual arithmetic and comparison operators, `mod`,
//! `round`, boolean words, scientific `e` notation, and a handful of unary
//! functions. Comparisons and boolean operators return `1` or `0`.

use arrayvec::ArrayVec;
use std::num::ParseFloatError;

/// The most operands or operators an expression may stack up.
const MAX_STACK: usize = 100;

/// An expression evaluation error.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum Error {
    /// Someone fed the evaluator something it does not speak.
    #[error("unknown token \"{0}\"")]
    UnknownToken(String),
    /// A number appeared where an operator was expected.
    #[error("unexpected number at offset {0}")]
    UnexpectedNumber(usize),
    /// An operator appeared where an operand was expected.
    #[error("unexpected operator \"{0}\"")]
    UnexpectedOperator(&'static str),
    /// An operator ran out of operands.
    #[error("missing operand for \"{0}\"")]
    MissingOperand(&'static str),
    /// Brackets did not balance.
    #[error("unbalanced brackets")]
    UnbalancedBrackets,
    /// Somebody divided by zero.
    #[error("division by zero in \"{0}\"")]
    DivisionByZero(&'static str),
    /// The expression nests deeper than the evaluator allows.
    #[error("expression too deep")]
    StackExhausted,
    /// A numeric literal did not parse.
    #[error("bad number: {0}")]
    ParseFloat(#[from] ParseFloatError),
}

/// An operator, in shunting-yard terms.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Op {
    /// The `(` stack marker.
    Open,
    /// Boolean `or`.
    Or,
    /// Boolean `and`.
    And,
    /// `=`.
    Eq,
    /// `!=` or `<>`.
    Ne,
    /// `<`.
    Lt,
    /// `>`.
    Gt,
    /// `<=`.
    Le,
    /// `>=`.
    Ge,
    /// `round`, digits on the right.
    Round,
    /// Binary `+`.
    Add,
    /// Binary `-`.
    Sub,
    /// `*`.
    Mul,
    /// `/`.
    Div,
    /// `mod`, on truncated integers.
    Mod,
    /// `^`.
    Pow,
    /// Scientific notation, `a e b` is `a * 10^b`.
    Sci,
    /// Boolean `not`.
    Not,
    /// Unary `+`.
    Plus,
    /// Unary `-`.
    Minus,
    /// `sin`.
    Sin,
    /// `cos`.
    Cos,
    /// `tan`.
    Tan,
    /// `asin`.
    Asin,
    /// `acos`.
    Acos,
    /// `atan`.
    Atan,
    /// `exp`.
    Exp,
    /// `ln`.
    Ln,
    /// `abs`.
    Abs,
    /// `sqrt`.
    Sqrt,
    /// `floor`.
    Floor,
    /// `ceil`.
    Ceil,
    /// `trunc`.
    Trunc,
}

impl Op {
    /// Binding strength; higher binds tighter.
    fn precedence(self) -> u8 {
        match self {
            Self::Open => 0,
            Self::Or => 2,
            Self::And => 3,
            Self::Eq | Self::Ne | Self::Lt | Self::Gt | Self::Le | Self::Ge => 4,
            Self::Round => 5,
            Self::Add | Self::Sub => 6,
            Self::Mul | Self::Div | Self::Mod => 7,
            Self::Pow => 8,
            Self::Not
            | Self::Plus
            | Self::Minus
            | Self::Sin
            | Self::Cos
            | Self::Tan
            | Self::Asin
            | Self::Acos
            | Self::Atan
            | Self::Exp
            | Self::Ln
            | Self::Abs
            | Self::Sqrt
            | Self::Floor
            | Self::Ceil
            | Self::Trunc => 9,
            Self::Sci => 10,
        }
    }

    /// The written form, for diagnostics.
    fn name(self) -> &'static str {
        match self {
            Self::Open => "(",
            Self::Or => "or",
            Self::And => "and",
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Le => "<=",
            Self::Ge => ">=",
            Self::Round => "round",
            Self::Add | Self::Plus => "+",
            Self::Sub | Self::Minus => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "mod",
            Self::Pow => "^",
            Self::Sci => "e",
            Self::Not => "not",
            Self::Sin => "sin",
            Self::Cos => "cos",
            Self::Tan => "tan",
            Self::Asin => "asin",
            Self::Acos => "acos",
            Self::Atan => "atan",
            Self::Exp => "exp",
            Self::Ln => "ln",
            Self::Abs => "abs",
            Self::Sqrt => "sqrt",
            Self::Floor => "floor",
            Self::Ceil => "ceil",
            Self::Trunc => "trunc",
        }
    }

    /// True for operators taking a single operand.
    fn is_unary(self) -> bool {
        matches!(
            self,
            Self::Not
                | Self::Plus
                | Self::Minus
                | Self::Sin
                | Self::Cos
                | Self::Tan
                | Self::Asin
                | Self::Acos
                | Self::Atan
                | Self::Exp
                | Self::Ln
                | Self::Abs
                | Self::Sqrt
                | Self::Floor
                | Self::Ceil
                | Self::Trunc
        )
    }
}

/// What the tokenizer expects to see next.
#[derive(Clone, Copy, Eq, PartialEq)]
enum Expecting {
    /// A number, constant, unary operator, or `(`.
    Operand,
    /// A binary operator or `)`.
    Operator,
}

/// Evaluates an expression. Returns `Ok(None)` for blank input.
pub fn do_expression(expr: &str) -> Result<Option<f64>, Error> {
    let expr = expr
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&minus;", "-")
        .replace('\u{2212}', "-");

    let mut operands = ArrayVec::<f64, MAX_STACK>::new_const();
    let mut operators = ArrayVec::<Op, MAX_STACK>::new_const();
    let mut expecting = Expecting::Operand;

    let mut iter = expr.char_indices().peekable();
    while let Some(&(pos, c)) = iter.peek() {
        if c.is_whitespace() {
            iter.next();
            continue;
        }

        if operands.len() + 1 >= MAX_STACK || operators.len() + 1 >= MAX_STACK {
            return Err(Error::StackExhausted);
        }

        if c.is_ascii_digit() || c == '.' {
            let mut end = pos;
            while let Some(&(next, c)) = iter.peek() {
                if c.is_ascii_digit() || c == '.' {
                    end = next + c.len_utf8();
                    iter.next();
                } else {
                    break;
                }
            }
            if expecting != Expecting::Operand {
                return Err(Error::UnexpectedNumber(pos));
            }
            operands.push(expr[pos..end].parse::<f64>()?);
            expecting = Expecting::Operator;
            continue;
        }

        if c.is_ascii_alphabetic() {
            let mut end = pos;
            while let Some(&(next, c)) = iter.peek() {
                if c.is_ascii_alphabetic() {
                    end = next + c.len_utf8();
                    iter.next();
                } else {
                    break;
                }
            }
            let word = expr[pos..end].to_ascii_lowercase();

            // Constants, which are operands rather than operators. `e` also
            // doubles as the scientific notation operator.
            match word.as_str() {
                "pi" => {
                    if expecting != Expecting::Operand {
                        return Err(Error::UnexpectedNumber(pos));
                    }
                    operands.push(std::f64::consts::PI);
                    expecting = Expecting::Operator;
                    continue;
                }
                "e" if expecting == Expecting::Operand => {
                    operands.push(std::f64::consts::E);
                    expecting = Expecting::Operator;
                    continue;
                }
                _ => {}
            }

            let op = match word.as_str() {
                "or" => Op::Or,
                "and" => Op::And,
                "not" => Op::Not,
                "mod" => Op::Mod,
                "round" => Op::Round,
                "e" => Op::Sci,
                "sin" => Op::Sin,
                "cos" => Op::Cos,
                "tan" => Op::Tan,
                "asin" => Op::Asin,
                "acos" => Op::Acos,
                "atan" => Op::Atan,
                "exp" => Op::Exp,
                "ln" => Op::Ln,
                "abs" => Op::Abs,
                "sqrt" => Op::Sqrt,
                "floor" => Op::Floor,
                "ceil" => Op::Ceil,
                "trunc" => Op::Trunc,
                _ => return Err(Error::UnknownToken(word)),
            };
            push_operator(op, &mut operands, &mut operators, &mut expecting)?;
            continue;
        }

        iter.next();
        let op = match c {
            '(' => {
                if expecting == Expecting::Operator {
                    return Err(Error::UnexpectedOperator("("));
                }
                operators.push(Op::Open);
                continue;
            }
            ')' => {
                loop {
                    match operators.pop() {
                        Some(Op::Open) => break,
                        Some(op) => apply(op, &mut operands)?,
                        None => return Err(Error::UnbalancedBrackets),
                    }
                }
                expecting = Expecting::Operator;
                continue;
            }
            '+' if expecting == Expecting::Operand => Op::Plus,
            '+' => Op::Add,
            '-' if expecting == Expecting::Operand => Op::Minus,
            '-' => Op::Sub,
            '*' => Op::Mul,
            '/' => Op::Div,
            '^' => Op::Pow,
            '=' => Op::Eq,
            '<' => match iter.peek() {
                Some((_, '=')) => {
                    iter.next();
                    Op::Le
                }
                Some((_, '>')) => {
                    iter.next();
                    Op::Ne
                }
                _ => Op::Lt,
            },
            '>' => {
                if iter.next_if(|&(_, c)| c == '=').is_some() {
                    Op::Ge
                } else {
                    Op::Gt
                }
            }
            '!' if iter.next_if(|&(_, c)| c == '=').is_some() => Op::Ne,
            other => return Err(Error::UnknownToken(other.to_string())),
        };
        push_operator(op, &mut operands, &mut operators, &mut expecting)?;
    }

    while let Some(op) = operators.pop() {
        if op == Op::Open {
            return Err(Error::UnbalancedBrackets);
        }
        apply(op, &mut operands)?;
    }

    Ok(operands.pop())
}

/// Pushes an operator, first applying anything on the stack that binds at
/// least as tightly.
fn push_operator(
    op: Op,
    operands: &mut ArrayVec<f64, MAX_STACK>,
    operators: &mut ArrayVec<Op, MAX_STACK>,
    expecting: &mut Expecting,
) -> Result<(), Error> {
    if op.is_unary() {
        if *expecting != Expecting::Operand {
            return Err(Error::UnexpectedOperator(op.name()));
        }
        operators.push(op);
        return Ok(());
    }

    if *expecting != Expecting::Operator {
        return Err(Error::UnexpectedOperator(op.name()));
    }
    while let Some(&top) = operators.last() {
        if top.precedence() >= op.precedence() {
            apply(top, operands)?;
            operators.pop();
        } else {
            break;
        }
    }
    operators.push(op);
    *expecting = Expecting::Operand;
    Ok(())
}

/// Applies one operator to the operand stack.
// Clippy: Truncation through `as i64` is the defined behavior of `mod`.
#[allow(clippy::cast_possible_truncation)]
fn apply(op: Op, operands: &mut ArrayVec<f64, MAX_STACK>) -> Result<(), Error> {
    if op.is_unary() {
        let x = operands.pop().ok_or(Error::MissingOperand(op.name()))?;
        operands.push(match op {
            Op::Not => f64::from(x == 0.0),
            Op::Plus => x,
            Op::Minus => -x,
            Op::Sin => x.sin(),
            Op::Cos => x.cos(),
            Op::Tan => x.tan(),
            Op::Asin => x.asin(),
            Op::Acos => x.acos(),
            Op::Atan => x.atan(),
            Op::Exp => x.exp(),
            Op::Ln => x.ln(),
            Op::Abs => x.abs(),
            Op::Sqrt => x.sqrt(),
            Op::Floor => x.floor(),
            Op::Ceil => x.ceil(),
            Op::Trunc => x.trunc(),
            _ => unreachable!("unary dispatch covers all unary operators"),
        });
        return Ok(());
    }

    let b = operands.pop().ok_or(Error::MissingOperand(op.name()))?;
    let a = operands.pop().ok_or(Error::MissingOperand(op.name()))?;
    operands.push(match op {
        Op::Or => f64::from(a != 0.0 || b != 0.0),
        Op::And => f64::from(a != 0.0 && b != 0.0),
        Op::Eq => f64::from(a == b),
        Op::Ne => f64::from(a != b),
        Op::Lt => f64::from(a < b),
        Op::Gt => f64::from(a > b),
        Op::Le => f64::from(a <= b),
        Op::Ge => f64::from(a >= b),
        Op::Add => a + b,
        Op::Sub => a - b,
        Op::Mul => a * b,
        Op::Div => {
            if b == 0.0 {
                return Err(Error::DivisionByZero("/"));
            }
            a / b
        }
        Op::Mod => {
            let divisor = b as i64;
            if divisor == 0 {
                return Err(Error::DivisionByZero("mod"));
            }
            // Clippy: Both sides truncate by definition.
            #[allow(clippy::cast_precision_loss)]
            {
                ((a as i64) % divisor) as f64
            }
        }
        Op::Pow => a.powf(b),
        Op::Sci => a * 10f64.powf(b),
        Op::Round => {
            let scale = 10f64.powi(b as i32);
            (a * scale).round() / scale
        }
        _ => unreachable!("only binary operators reach here"),
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(expr: &str) -> f64 {
        do_expression(expr).unwrap().unwrap()
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval("1 + 2 * 3"), 7.0, "multiplication binds tighter");
        assert_eq!(eval("(1 + 2) * 3"), 9.0);
        assert_eq!(eval("10 / 4"), 2.5);
        assert_eq!(eval("7 mod 3"), 1.0);
        assert_eq!(eval("2 ^ 10"), 1024.0);
        assert_eq!(eval("-3 + 5"), 2.0, "unary minus");
        assert_eq!(eval("2e3"), 2000.0, "scientific notation");
    }

    #[test]
    fn test_round() {
        assert_eq!(eval("3.14159 round 2"), 3.14);
        assert_eq!(eval("1234 round -2"), 1200.0);
    }

    #[test]
    fn test_comparisons_and_booleans() {
        assert_eq!(eval("2 > 1"), 1.0);
        assert_eq!(eval("1 >= 2"), 0.0);
        assert_eq!(eval("3 = 3"), 1.0);
        assert_eq!(eval("3 <> 4"), 1.0);
        assert_eq!(eval("1 and 0"), 0.0);
        assert_eq!(eval("1 or 0"), 1.0);
        assert_eq!(eval("not 0"), 1.0);
    }

    #[test]
    fn test_functions_and_constants() {
        assert_eq!(eval("abs(-4)"), 4.0);
        assert_eq!(eval("floor 2.7"), 2.0);
        assert_eq!(eval("ceil 2.2"), 3.0);
        assert_eq!(eval("sqrt 16"), 4.0);
        assert!((eval("pi") - std::f64::consts::PI).abs() < 1e-12);
        assert!((eval("ln e") - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_blank_input() {
        assert_eq!(do_expression(""), Ok(None));
        assert_eq!(do_expression("   "), Ok(None));
    }

    #[test]
    fn test_entity_forms() {
        assert_eq!(eval("2 &gt; 1"), 1.0, "entity-encoded comparisons work");
        assert_eq!(eval("5 &minus; 3"), 2.0);
    }

    #[test]
    fn test_errors() {
        assert_eq!(do_expression("1 / 0"), Err(Error::DivisionByZero("/")));
        assert_eq!(
            do_expression("bogus"),
            Err(Error::UnknownToken("bogus".to_string()))
        );
        assert_eq!(do_expression("(1"), Err(Error::UnbalancedBrackets));
        assert_eq!(do_expression("1 +"), Err(Error::MissingOperand("+")));
        assert!(matches!(
            do_expression("1 2"),
            Err(Error::UnexpectedNumber(_))
        ));
    }
}
