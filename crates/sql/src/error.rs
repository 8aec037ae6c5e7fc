use cosmosql_error::{CosmosError, ErrorCode, ErrorContext};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("Unexpected {found} at position {position}, expected {expected}")]
    UnexpectedToken {
        expected: String,
        found: String,
        position: usize,
    },

    #[error("Unexpected end of input, expected {expected}")]
    UnexpectedEnd { expected: String },

    #[error("Unterminated {what} starting at position {position}")]
    Unterminated { what: &'static str, position: usize },

    #[error("Unsupported construct: {construct}")]
    Unsupported { construct: String, position: usize },

    #[error("Invalid literal '{literal}' at position {position}")]
    InvalidLiteral { literal: String, position: usize },

    #[error("Placeholder error: {0}")]
    Placeholder(String),

    #[error("Unknown option '{name}'")]
    UnknownOption {
        name: String,
        suggestion: Option<String>,
    },

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
}

impl ParseError {
    pub fn unsupported(construct: impl Into<String>, position: usize) -> Self {
        Self::Unsupported {
            construct: construct.into(),
            position,
        }
    }

    pub fn position(&self) -> Option<usize> {
        match self {
            Self::UnexpectedToken { position, .. }
            | Self::Unterminated { position, .. }
            | Self::Unsupported { position, .. }
            | Self::InvalidLiteral { position, .. } => Some(*position),
            _ => None,
        }
    }

    /// Convert, quoting the region of `sql` the error points at.
    pub fn to_cosmos_error(self, sql: &str) -> CosmosError {
        let position = self.position();
        let mut err = CosmosError::from(self);
        if let Some(position) = position {
            let start = floor_char_boundary(sql, position.saturating_sub(20));
            let end = floor_char_boundary(sql, (position + 20).min(sql.len()));
            err = err.with_context(ErrorContext::Query {
                position,
                snippet: sql[start..end].to_string(),
            });
        }
        err
    }
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

impl From<ParseError> for CosmosError {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::Placeholder(_) => {
                CosmosError::new(ErrorCode::InvalidParameter, err.to_string())
            }
            ParseError::InvalidIdentifier(_) => {
                CosmosError::new(ErrorCode::InvalidArgument, err.to_string())
            }
            ParseError::UnknownOption {
                ref suggestion, ..
            } => {
                let hint = suggestion.as_ref().map(|s| format!("Did you mean '{}'?", s));
                let mut e = CosmosError::new(ErrorCode::UnsupportedQuery, err.to_string());
                if let Some(hint) = hint {
                    e = e.with_hint(hint);
                }
                e
            }
            ParseError::Unsupported { .. } => {
                CosmosError::new(ErrorCode::UnsupportedQuery, err.to_string())
                    .with_hint("The driver rejects constructs it cannot execute across partitions")
            }
            _ => CosmosError::new(ErrorCode::UnsupportedQuery, err.to_string()),
        }
    }
}
