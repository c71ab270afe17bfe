use std::path::PathBuf;

use thiserror::Error;

/// What was wrong with a malformed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseErrorKind {
    /// Expected the single integer digit of a literal.
    #[error("expected a leading digit")]
    MissingDigit,
    /// The integer digit was not followed by `.`.
    #[error("expected '.' after the leading digit")]
    MissingDecimalPoint,
    /// Exponent marker with no digits after it.
    #[error("malformed exponent")]
    BadExponent,
    /// Positive exponents would leave the (-10, 10) range.
    #[error("positive exponents are not supported")]
    PositiveExponent,
    /// Literals on a line must be separated by exactly one space.
    #[error("expected a single space between coordinates")]
    MissingSeparator,
    /// Something other than a newline followed the third literal.
    #[error("unexpected input after the third coordinate")]
    TrailingInput,
}

/// A malformed record. `offset` is relative to the start of the whole input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("malformed record at byte {offset}: {kind}")]
pub struct ParseError {
    pub offset: usize,
    pub kind: ParseErrorKind,
}

impl ParseError {
    pub fn new(offset: usize, kind: ParseErrorKind) -> Self {
        Self { offset, kind }
    }

    /// Rebase an error found in a sub-slice onto the enclosing input.
    pub(crate) fn shifted(self, base: usize) -> Self {
        Self {
            offset: self.offset + base,
            kind: self.kind,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("error loading config: {0}")]
    Config(#[from] Box<figment::Error>),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl From<figment::Error> for Error {
    fn from(e: figment::Error) -> Self {
        Error::Config(Box::new(e))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
