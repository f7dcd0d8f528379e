use std::{collections::VecDeque, ffi::c_int, fmt};

use parking_lot::Mutex;

use crate::api::tag_name;

/// How many errors `ErrorHistory` keeps before evicting the oldest.
pub const MAX_ERRORS: usize = 12;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IdentifierKind {
    Method,
    Constant,
    ClassVariable,
    Symbol,
}

/// A Ruby exception that escaped a protected call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exception {
    pub description: String,
    pub backtrace: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The VM could not be brought up, or is gone.
    Setup(String),
    /// A value was not of, or did not fit, the requested type.
    BadType(String),
    BadIdentifier { kind: IdentifierKind, id: String },
    DuplicateKwArg(String),
    BadParameter(String),
    /// A non-local exit other than an exception, e.g. a `break` with no iteration to stop.
    Jump(c_int),
    Exception(Exception),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IdentifierKind::Method => "method",
            IdentifierKind::Constant => "constant",
            IdentifierKind::ClassVariable => "class variable",
            IdentifierKind::Symbol => "symbol",
        };
        f.write_str(name)
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)?;
        for frame in &self.backtrace {
            write!(f, "\n\tfrom {frame}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Setup(msg) => write!(f, "Ruby VM setup error: {msg}"),
            Error::BadType(msg) => write!(f, "bad type: {msg}"),
            Error::BadIdentifier { kind, id } => write!(f, "bad {kind} identifier: '{id}'"),
            Error::DuplicateKwArg(name) => write!(f, "duplicate keyword argument: '{name}'"),
            Error::BadParameter(msg) => write!(f, "bad parameter: {msg}"),
            Error::Jump(tag) => write!(
                f,
                "unexpected non-local exit, tag {tag} ({})",
                tag_name(*tag)
            ),
            Error::Exception(exception) => exception.fmt(f),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn exception(&self) -> Option<&Exception> {
        match self {
            Error::Exception(exception) => Some(exception),
            _ => None,
        }
    }
}

/// Rolling record of the most recent errors handed to host code.
#[derive(Debug)]
pub struct ErrorHistory {
    capacity: usize,
    errors: Mutex<VecDeque<Error>>,
}

impl Default for ErrorHistory {
    fn default() -> Self {
        Self::new(MAX_ERRORS)
    }
}

impl ErrorHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            errors: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn record(&self, error: Error) {
        let mut errors = self.errors.lock();
        if errors.len() == self.capacity {
            errors.pop_front();
        }
        errors.push_back(error);
    }

    /// Oldest first.
    pub fn errors(&self) -> Vec<Error> {
        self.errors.lock().iter().cloned().collect()
    }

    pub fn most_recent(&self) -> Option<Error> {
        self.errors.lock().back().cloned()
    }

    pub fn len(&self) -> usize {
        self.errors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.errors.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_evicts_oldest_first() {
        let history = ErrorHistory::default();
        for i in 0..MAX_ERRORS + 5 {
            history.record(Error::BadParameter(format!("e{i}")));
        }

        assert_eq!(history.len(), MAX_ERRORS, "history must be capped");
        let errors = history.errors();
        assert_eq!(
            errors[0],
            Error::BadParameter("e5".to_string()),
            "the five oldest errors should have been evicted"
        );
        assert_eq!(
            history.most_recent(),
            Some(Error::BadParameter(format!("e{}", MAX_ERRORS + 4))),
            "most_recent must be the last error recorded"
        );
    }

    #[test]
    fn clear_empties_the_history() {
        let history = ErrorHistory::new(3);
        history.record(Error::Jump(crate::api::TAG_BREAK));
        history.clear();
        assert!(history.is_empty());
        assert_eq!(history.most_recent(), None);
    }

    #[test]
    fn exception_display_lists_backtrace() {
        let error = Error::Exception(Exception {
            description: "#<RuntimeError: boom>".to_string(),
            backtrace: vec!["a.rb:1".to_string(), "b.rb:2".to_string()],
        });
        assert_eq!(
            error.to_string(),
            "#<RuntimeError: boom>\n\tfrom a.rb:1\n\tfrom b.rb:2"
        );
    }

    #[test]
    fn jump_display_names_the_tag() {
        assert_eq!(
            Error::Jump(crate::api::TAG_BREAK).to_string(),
            "unexpected non-local exit, tag 2 (break)"
        );
    }
}
