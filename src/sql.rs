//! Predicate construction for the generated statements.
//!
//! Rule configurations drive predicate and projection building; assembling
//! them as a small typed tree keeps the emitters honest about parenthesizing
//! and NULL handling instead of string-gluing conditions in place.

use chrono::NaiveDateTime;

/// A boolean SQL expression over one or two row aliases.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    /// Plain equality of two rendered expressions; NULLs never match.
    Eq(String, String),
    /// Equality that also accepts NULL on both sides.
    NullEq(String, String),
    NotNull(String),
    /// Half-open datetime interval: `from <= field < to`.
    InWindow {
        field: String,
        from: NaiveDateTime,
        to: NaiveDateTime,
    },
    /// Closed numeric interval over a rendered expression.
    InTolerance {
        expr: String,
        from: f64,
        to: f64,
    },
    /// Date proximity: `left - right` lies within `[from_sec, to_sec]`.
    /// Collapses to plain equality for a zero envelope.
    Shifted {
        left: String,
        right: String,
        from_sec: i64,
        to_sec: i64,
    },
    /// A raw filter taken verbatim from the control configuration.
    Raw(String),
}

impl Predicate {
    pub fn render(&self) -> String {
        match self {
            Self::And(parts) => join_parts(parts, " and "),
            Self::Or(parts) => join_parts(parts, " or "),
            Self::Eq(left, right) => format!("{} = {}", left, right),
            Self::NullEq(left, right) => format!(
                "({left} = {right} or ({left} is null and {right} is null))",
                left = left,
                right = right
            ),
            Self::NotNull(expr) => format!("{} is not null", expr),
            Self::InWindow { field, from, to } => format!(
                "{} >= {} and {} < {}",
                field,
                datetime_literal(*from),
                field,
                datetime_literal(*to)
            ),
            Self::InTolerance { expr, from, to } => {
                format!("{} between {} and {}", expr, fmt_num(*from), fmt_num(*to))
            }
            Self::Shifted {
                left,
                right,
                from_sec,
                to_sec,
            } => {
                if *from_sec == 0 && *to_sec == 0 {
                    format!("{} = {}", left, right)
                } else {
                    format!(
                        "{left} between {right} + interval {from} second \
                         and {right} + interval {to} second",
                        left = left,
                        right = right,
                        from = from_sec,
                        to = to_sec
                    )
                }
            }
            Self::Raw(text) => format!("({})", text),
        }
    }
}

fn join_parts(parts: &[Predicate], separator: &str) -> String {
    match parts.len() {
        0 => "1 = 1".to_string(),
        1 => parts[0].render(),
        _ => {
            let rendered: Vec<String> = parts.iter().map(|p| format!("({})", p.render())).collect();
            rendered.join(separator)
        }
    }
}

/// Quote a datetime as a MySQL literal at second resolution.
pub fn datetime_literal(value: NaiveDateTime) -> String {
    format!("'{}'", value.format("%Y-%m-%d %H:%M:%S"))
}

/// Render a tolerance bound without trailing noise for integral values.
fn fmt_num(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

/// Quote a column reference with an alias prefix.
pub fn qualified(alias: &str, column: &str) -> String {
    format!("{}.`{}`", alias, column)
}
