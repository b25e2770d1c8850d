//! Condition parser
//!
//! Conditions are SQL boolean expressions over a fixed set of fields:
//!
//! ```text
//! time BETWEEN '22:00' AND '07:00'        local time-of-day window
//! day IN ('mon', 'tue', 'weekends')       weekday set
//! value >= 90                             carried numeric value
//! detail ~ 'eth[0-9]'                     regex over the detail text (!~ negates)
//! count('5 minutes') > 3                  recent events of this event type
//! status = 'critical', previous != 'ok'   transition target / origin
//! ```
//!
//! combined with `AND`, `OR`, `NOT` and parentheses.

use chrono::Weekday;
use regex::Regex;
use sqlparser::ast::{
    BinaryOperator, Expr as SqlExpr, FunctionArg, FunctionArgExpr, UnaryOperator,
    Value as SqlValue,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;
use std::time::Duration;

use super::expr::{parse_clock, CmpOp, Expr, TimeWindow};
use crate::data::Status;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("SQL parse error: {0}")]
    SqlParser(#[from] sqlparser::parser::ParserError),

    #[error("Unexpected input after condition: {0}")]
    TrailingInput(String),

    #[error("Unknown field: {0}")]
    UnknownField(String),

    #[error("Unsupported function: {0}")]
    UnsupportedFunction(String),

    #[error("Unsupported expression: {0}")]
    UnsupportedExpression(String),

    #[error("Unsupported operator {op} for field {field}")]
    UnsupportedOperator { field: String, op: String },

    #[error("Expected a number, found {0}")]
    ExpectedNumber(String),

    #[error("Expected a string literal, found {0}")]
    ExpectedString(String),

    #[error("Invalid time: {0}")]
    InvalidTime(String),

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    #[error("Invalid regex: {0}")]
    Regex(#[from] regex::Error),

    #[error("Unknown day: {0}")]
    UnknownDay(String),

    #[error("Unknown status: {0}")]
    UnknownStatus(String),
}

/// Parse a condition string into an expression tree
pub fn parse_condition(input: &str) -> Result<Expr, ParseError> {
    let dialect = GenericDialect {};
    let mut parser = Parser::new(&dialect).try_with_sql(input)?;
    let expr = parser.parse_expr()?;

    let next = parser.peek_token().token;
    if next != Token::EOF {
        return Err(ParseError::TrailingInput(next.to_string()));
    }

    convert(&expr)
}

fn convert(expr: &SqlExpr) -> Result<Expr, ParseError> {
    match expr {
        SqlExpr::Nested(inner) => convert(inner),

        SqlExpr::UnaryOp {
            op: UnaryOperator::Not,
            expr,
        } => Ok(Expr::Not(Box::new(convert(expr)?))),

        SqlExpr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            let mut items = Vec::new();
            flatten(left, &BinaryOperator::And, &mut items)?;
            flatten(right, &BinaryOperator::And, &mut items)?;
            Ok(Expr::All(items))
        }

        SqlExpr::BinaryOp {
            left,
            op: BinaryOperator::Or,
            right,
        } => {
            let mut items = Vec::new();
            flatten(left, &BinaryOperator::Or, &mut items)?;
            flatten(right, &BinaryOperator::Or, &mut items)?;
            Ok(Expr::Any(items))
        }

        SqlExpr::BinaryOp { left, op, right } => parse_comparison(left, op, right),

        SqlExpr::Between {
            expr,
            negated,
            low,
            high,
        } => {
            let field = field_name(expr)?;
            if field != "time" {
                return Err(ParseError::UnsupportedOperator {
                    field,
                    op: "BETWEEN".to_string(),
                });
            }
            let window = TimeWindow::new(clock(low)?, clock(high)?);
            Ok(negate_if(*negated, Expr::TimeOfDay(window)))
        }

        SqlExpr::InList {
            expr,
            list,
            negated,
        } => {
            let field = field_name(expr)?;
            if field != "day" {
                return Err(ParseError::UnsupportedOperator {
                    field,
                    op: "IN".to_string(),
                });
            }
            let mut days = Vec::new();
            for item in list {
                for day in parse_days(&string_literal(item)?)? {
                    if !days.contains(&day) {
                        days.push(day);
                    }
                }
            }
            Ok(negate_if(*negated, Expr::Days(days)))
        }

        _ => Err(ParseError::UnsupportedExpression(expr.to_string())),
    }
}

/// Collect a chain of the same boolean operator into one list
fn flatten(expr: &SqlExpr, op: &BinaryOperator, items: &mut Vec<Expr>) -> Result<(), ParseError> {
    match expr {
        SqlExpr::BinaryOp {
            left,
            op: inner,
            right,
        } if inner == op => {
            flatten(left, op, items)?;
            flatten(right, op, items)
        }
        other => {
            items.push(convert(other)?);
            Ok(())
        }
    }
}

fn negate_if(negated: bool, expr: Expr) -> Expr {
    if negated {
        Expr::Not(Box::new(expr))
    } else {
        expr
    }
}

fn parse_comparison(
    left: &SqlExpr,
    op: &BinaryOperator,
    right: &SqlExpr,
) -> Result<Expr, ParseError> {
    if let SqlExpr::Function(func) = left {
        let name = func.name.to_string().to_lowercase();
        if name != "count" {
            return Err(ParseError::UnsupportedFunction(name));
        }
        let window = parse_count_args(&func.args)?;
        let count = extract_number(right)?;
        if count < 0.0 || count.fract() != 0.0 {
            return Err(ParseError::ExpectedNumber(right.to_string()));
        }
        return Ok(Expr::RecentCount {
            op: cmp_op("count", op)?,
            count: count as u64,
            window,
        });
    }

    let field = field_name(left)?;
    match field.as_str() {
        "value" => Ok(Expr::Value {
            op: cmp_op(&field, op)?,
            rhs: extract_number(right)?,
        }),
        "detail" => {
            let negate = match op {
                BinaryOperator::PGRegexMatch => false,
                BinaryOperator::PGRegexNotMatch => true,
                _ => {
                    return Err(ParseError::UnsupportedOperator {
                        field,
                        op: op.to_string(),
                    })
                }
            };
            let re = Regex::new(&string_literal(right)?)?;
            Ok(negate_if(negate, Expr::Detail(re)))
        }
        "status" | "previous" => {
            let negate = match op {
                BinaryOperator::Eq => false,
                BinaryOperator::NotEq => true,
                _ => {
                    return Err(ParseError::UnsupportedOperator {
                        field,
                        op: op.to_string(),
                    })
                }
            };
            let text = string_literal(right)?;
            let status: Status = text
                .parse()
                .map_err(|_| ParseError::UnknownStatus(text.clone()))?;
            if field == "status" {
                Ok(Expr::ToStatus { status, negate })
            } else {
                Ok(Expr::FromStatus { status, negate })
            }
        }
        "time" | "day" => Err(ParseError::UnsupportedOperator {
            field,
            op: op.to_string(),
        }),
        _ => Err(ParseError::UnknownField(field)),
    }
}

fn cmp_op(field: &str, op: &BinaryOperator) -> Result<CmpOp, ParseError> {
    match op {
        BinaryOperator::Gt => Ok(CmpOp::Gt),
        BinaryOperator::GtEq => Ok(CmpOp::GtEq),
        BinaryOperator::Lt => Ok(CmpOp::Lt),
        BinaryOperator::LtEq => Ok(CmpOp::LtEq),
        BinaryOperator::Eq => Ok(CmpOp::Eq),
        BinaryOperator::NotEq => Ok(CmpOp::NotEq),
        _ => Err(ParseError::UnsupportedOperator {
            field: field.to_string(),
            op: op.to_string(),
        }),
    }
}

fn field_name(expr: &SqlExpr) -> Result<String, ParseError> {
    match expr {
        SqlExpr::Identifier(ident) => Ok(ident.value.to_lowercase()),
        _ => Err(ParseError::UnsupportedExpression(expr.to_string())),
    }
}

fn extract_number(expr: &SqlExpr) -> Result<f64, ParseError> {
    match expr {
        SqlExpr::Value(SqlValue::Number(n, _)) => n
            .parse::<f64>()
            .map_err(|_| ParseError::ExpectedNumber(n.clone())),
        SqlExpr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => Ok(-extract_number(expr)?),
        SqlExpr::Nested(inner) => extract_number(inner),
        _ => Err(ParseError::ExpectedNumber(expr.to_string())),
    }
}

fn string_literal(expr: &SqlExpr) -> Result<String, ParseError> {
    match expr {
        SqlExpr::Value(SqlValue::SingleQuotedString(s))
        | SqlExpr::Value(SqlValue::DoubleQuotedString(s)) => Ok(s.clone()),
        _ => Err(ParseError::ExpectedString(expr.to_string())),
    }
}

fn clock(expr: &SqlExpr) -> Result<chrono::NaiveTime, ParseError> {
    let text = string_literal(expr)?;
    parse_clock(&text).map_err(ParseError::InvalidTime)
}

fn parse_count_args(args: &[FunctionArg]) -> Result<Duration, ParseError> {
    match args {
        [FunctionArg::Unnamed(FunctionArgExpr::Expr(expr))] => parse_interval(&string_literal(expr)?),
        _ => Err(ParseError::InvalidInterval(format!(
            "count() takes one interval such as '5 minutes', got {} arguments",
            args.len()
        ))),
    }
}

/// Parse `'5 minutes'`, `'30s'` and friends
fn parse_interval(s: &str) -> Result<Duration, ParseError> {
    let invalid = || ParseError::InvalidInterval(s.to_string());

    let trimmed = s.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(invalid)?;
    let (digits, unit) = trimmed.split_at(split);

    let value: u64 = digits.parse().map_err(|_| invalid())?;
    let multiplier_ms: u64 = match unit.trim().to_lowercase().as_str() {
        "ms" | "millisecond" | "milliseconds" => 1,
        "s" | "second" | "seconds" => 1000,
        "m" | "minute" | "minutes" => 60 * 1000,
        "h" | "hour" | "hours" => 3600 * 1000,
        "d" | "day" | "days" => 86400 * 1000,
        _ => return Err(invalid()),
    };

    let ms = value.checked_mul(multiplier_ms).ok_or_else(invalid)?;
    if ms == 0 {
        return Err(invalid());
    }
    Ok(Duration::from_millis(ms))
}

fn parse_days(name: &str) -> Result<Vec<Weekday>, ParseError> {
    match name.trim().to_lowercase().as_str() {
        "weekdays" => Ok(vec![
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
        ]),
        "weekends" => Ok(vec![Weekday::Sat, Weekday::Sun]),
        other => other
            .parse::<Weekday>()
            .map(|d| vec![d])
            .map_err(|_| ParseError::UnknownDay(name.to_string())),
    }
}
