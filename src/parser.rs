//! Injected query-parser collaborator.
//!
//! The frontend does not own a query language: it consumes a parser
//! through this trait and only needs to know whether an expression
//! produces samples (metrics) or log lines, which decides the shape of
//! empty responses for range queries.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("could not parse query: {0}")]
    Query(String),
}

/// A parsed query expression, reduced to its result shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expr {
    /// Evaluates to metric samples (matrix/vector results).
    Sample,
    /// Evaluates to log lines (stream results).
    Stream,
}

impl Expr {
    pub fn is_sample(&self) -> bool {
        matches!(self, Expr::Sample)
    }
}

pub trait Parser: Send + Sync {
    fn parse(&self, query: &str) -> Result<Expr, ParseError>;
}

/// Shape classifier based on the leading token.
///
/// Log queries start with a stream selector (`{...}`); sample queries
/// start with a function or aggregation name. This is sufficient for
/// the frontend, which never evaluates the expression.
pub struct SelectorParser;

impl Parser for SelectorParser {
    fn parse(&self, query: &str) -> Result<Expr, ParseError> {
        let trimmed = query.trim();
        if trimmed.is_empty() {
            return Err(ParseError::Query("empty query".to_string()));
        }
        if trimmed.starts_with('{') {
            Ok(Expr::Stream)
        } else {
            Ok(Expr::Sample)
        }
    }
}
