//! If-part, repetition-condition and timer expressions.
//!
//! The engine only talks to [`ExpressionEvaluator`]. The built-in
//! [`DefaultExpressionEvaluator`] understands a small `${…}` language:
//!
//! ```text
//! expr    := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | compare
//! compare := operand ( ("=="|"!="|"<="|">="|"<"|">") operand )?
//! operand := "(" expr ")" | number | 'string' | "string" | true | false | null | path
//! path    := ident ( "." ident )*
//! ```
//!
//! Unknown variables evaluate to `null`. Boolean operators never coerce.

use crate::types::Variables;
use nom::{
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{alpha1, alphanumeric1, char, digit1, multispace0},
    combinator::{all_consuming, map, opt, recognize, value},
    multi::{fold_many0, many0, separated_list1},
    sequence::{delimited, pair, preceded, tuple},
    Finish, IResult,
};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("parse error near '{0}'")]
    Parse(String),

    #[error("type error: {0}")]
    Type(String),

    #[error("expected a boolean, got {0}")]
    NotBoolean(Value),
}

/// Evaluates expressions against a variable scope.
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, scope: &Variables) -> Result<Value, ExpressionError>;

    fn evaluate_bool(&self, expression: &str, scope: &Variables) -> Result<bool, ExpressionError> {
        match self.evaluate(expression, scope)? {
            Value::Bool(b) => Ok(b),
            other => Err(ExpressionError::NotBoolean(other)),
        }
    }
}

// ─── AST ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Var(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
}

/// Parse an expression, with or without the `${…}` wrapper.
pub fn parse_expression(input: &str) -> Result<Expr, ExpressionError> {
    let text = input.trim();
    let body = text
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .unwrap_or(text);

    all_consuming(delimited(multispace0, or_expr, multispace0))(body)
        .finish()
        .map(|(_, expr)| expr)
        .map_err(|e| ExpressionError::Parse(e.input.to_string()))
}

fn or_expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = and_expr(input)?;
    fold_many0(
        preceded(delimited(multispace0, tag("||"), multispace0), and_expr),
        move || first.clone(),
        |acc, rhs| Expr::Or(Box::new(acc), Box::new(rhs)),
    )(input)
}

fn and_expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = unary(input)?;
    fold_many0(
        preceded(delimited(multispace0, tag("&&"), multispace0), unary),
        move || first.clone(),
        |acc, rhs| Expr::And(Box::new(acc), Box::new(rhs)),
    )(input)
}

fn unary(input: &str) -> IResult<&str, Expr> {
    alt((
        map(
            preceded(pair(char('!'), multispace0), unary),
            |e| Expr::Not(Box::new(e)),
        ),
        comparison,
    ))(input)
}

fn comparison(input: &str) -> IResult<&str, Expr> {
    let (input, lhs) = operand(input)?;
    let (input, rest) = opt(pair(
        delimited(multispace0, compare_op, multispace0),
        operand,
    ))(input)?;
    Ok((
        input,
        match rest {
            Some((op, rhs)) => Expr::Compare(op, Box::new(lhs), Box::new(rhs)),
            None => lhs,
        },
    ))
}

fn compare_op(input: &str) -> IResult<&str, CompareOp> {
    alt((
        value(CompareOp::Eq, tag("==")),
        value(CompareOp::Ne, tag("!=")),
        value(CompareOp::Le, tag("<=")),
        value(CompareOp::Ge, tag(">=")),
        value(CompareOp::Lt, tag("<")),
        value(CompareOp::Gt, tag(">")),
    ))(input)
}

fn operand(input: &str) -> IResult<&str, Expr> {
    alt((
        delimited(
            pair(char('('), multispace0),
            or_expr,
            pair(multispace0, char(')')),
        ),
        number,
        map(string_literal, |s| Expr::Literal(Value::String(s.to_string()))),
        path,
    ))(input)
}

fn number(input: &str) -> IResult<&str, Expr> {
    let (rest, text) = recognize(tuple((
        opt(char('-')),
        digit1,
        opt(pair(char('.'), digit1)),
    )))(input)?;
    let parsed = if text.contains('.') {
        text.parse::<f64>().ok().map(Value::from)
    } else {
        text.parse::<i64>().ok().map(Value::from)
    };
    match parsed {
        Some(v) => Ok((rest, Expr::Literal(v))),
        None => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Digit,
        ))),
    }
}

fn string_literal(input: &str) -> IResult<&str, &str> {
    alt((
        delimited(char('\''), take_while(|c| c != '\''), char('\'')),
        delimited(char('"'), take_while(|c| c != '"'), char('"')),
    ))(input)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0(alt((alphanumeric1, tag("_")))),
    ))(input)
}

fn path(input: &str) -> IResult<&str, Expr> {
    let (input, segments) = separated_list1(char('.'), identifier)(input)?;
    let expr = match segments.as_slice() {
        ["true"] => Expr::Literal(Value::Bool(true)),
        ["false"] => Expr::Literal(Value::Bool(false)),
        ["null"] => Expr::Literal(Value::Null),
        _ => Expr::Var(segments.iter().map(|s| s.to_string()).collect()),
    };
    Ok((input, expr))
}

// ─── Evaluation ───────────────────────────────────────────────

impl Expr {
    pub fn eval(&self, scope: &Variables) -> Result<Value, ExpressionError> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Var(segments) => Ok(lookup(scope, segments)),
            Expr::Not(inner) => Ok(Value::Bool(!as_bool(inner.eval(scope)?)?)),
            Expr::And(lhs, rhs) => {
                if !as_bool(lhs.eval(scope)?)? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(as_bool(rhs.eval(scope)?)?))
            }
            Expr::Or(lhs, rhs) => {
                if as_bool(lhs.eval(scope)?)? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(as_bool(rhs.eval(scope)?)?))
            }
            Expr::Compare(op, lhs, rhs) => {
                let l = lhs.eval(scope)?;
                let r = rhs.eval(scope)?;
                compare(*op, &l, &r).map(Value::Bool)
            }
        }
    }
}

fn lookup(scope: &Variables, segments: &[String]) -> Value {
    let Some((head, tail)) = segments.split_first() else {
        return Value::Null;
    };
    let mut current = match scope.get(head) {
        Some(v) => v,
        None => return Value::Null,
    };
    for segment in tail {
        match current.get(segment.as_str()) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn as_bool(v: Value) -> Result<bool, ExpressionError> {
    match v {
        Value::Bool(b) => Ok(b),
        other => Err(ExpressionError::NotBoolean(other)),
    }
}

fn compare(op: CompareOp, l: &Value, r: &Value) -> Result<bool, ExpressionError> {
    if let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) {
        return Ok(match op {
            CompareOp::Eq => a == b,
            CompareOp::Ne => a != b,
            CompareOp::Lt => a < b,
            CompareOp::Le => a <= b,
            CompareOp::Gt => a > b,
            CompareOp::Ge => a >= b,
        });
    }
    match op {
        CompareOp::Eq => Ok(l == r),
        CompareOp::Ne => Ok(l != r),
        _ => match (l.as_str(), r.as_str()) {
            (Some(a), Some(b)) => Ok(match op {
                CompareOp::Lt => a < b,
                CompareOp::Le => a <= b,
                CompareOp::Gt => a > b,
                _ => a >= b,
            }),
            _ => Err(ExpressionError::Type(format!(
                "cannot order {} and {}",
                l, r
            ))),
        },
    }
}

/// The built-in evaluator.
#[derive(Debug, Default, Clone)]
pub struct DefaultExpressionEvaluator;

impl ExpressionEvaluator for DefaultExpressionEvaluator {
    fn evaluate(&self, expression: &str, scope: &Variables) -> Result<Value, ExpressionError> {
        parse_expression(expression)?.eval(scope)
    }
}
