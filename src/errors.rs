//! Error aggregation.
//!
//! Several operations in the installer keep going after a failure (cleanup
//! jobs, unmounting a chroot, running provisioning stages) and report every
//! failure at the end. [`MultiError`] is the container they report with.

use std::fmt;

use thiserror::Error;

/// A non-empty collection of errors gathered by a best-effort operation.
#[derive(Debug, Error, Default)]
pub struct MultiError {
    errors: Vec<anyhow::Error>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an error. Nested `MultiError`s are flattened so `errors()`
    /// always yields leaf errors.
    pub fn push(&mut self, err: anyhow::Error) {
        match err.downcast::<MultiError>() {
            Ok(nested) => self.errors.extend(nested.errors),
            Err(err) => self.errors.push(err),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[anyhow::Error] {
        &self.errors
    }

    /// `Ok(())` when nothing was collected, otherwise the whole set as one error.
    pub fn into_result(self) -> anyhow::Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.into())
        }
    }

    /// Same as [`into_result`](Self::into_result) but as an `Option`.
    pub fn into_error(self) -> Option<anyhow::Error> {
        self.into_result().err()
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.len() {
            0 => write!(f, "no errors"),
            1 => write!(f, "1 error occurred:\n\t* {:#}", self.errors[0]),
            n => {
                write!(f, "{} errors occurred:", n)?;
                for err in &self.errors {
                    write!(f, "\n\t* {:#}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl From<anyhow::Error> for MultiError {
    fn from(err: anyhow::Error) -> Self {
        let mut multi = MultiError::new();
        multi.push(err);
        multi
    }
}

/// Append `err` to an optional accumulated error, returning the new accumulation.
pub fn append(acc: Option<anyhow::Error>, err: anyhow::Error) -> Option<anyhow::Error> {
    let mut multi = match acc {
        Some(prev) => MultiError::from(prev),
        None => MultiError::new(),
    };
    multi.push(err);
    multi.into_error()
}

/// Combine two results. When both failed the first error leads and the
/// second is kept alongside it.
pub fn merge(first: anyhow::Result<()>, second: anyhow::Result<()>) -> anyhow::Result<()> {
    match (first, second) {
        (Ok(()), second) => second,
        (first, Ok(())) => first,
        (Err(first), Err(second)) => {
            let mut multi = MultiError::from(first);
            multi.push(second);
            multi.into_result()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_display_lists_every_error() {
        let mut multi = MultiError::new();
        multi.push(anyhow!("first"));
        multi.push(anyhow!("second"));
        let msg = multi.to_string();
        assert!(msg.starts_with("2 errors occurred"));
        assert!(msg.contains("first"));
        assert!(msg.contains("second"));
    }

    #[test]
    fn test_nested_errors_are_flattened() {
        let acc = append(None, anyhow!("one"));
        let acc = append(acc, anyhow!("two"));
        let acc = append(acc, anyhow!("three")).unwrap();
        let multi = acc.downcast::<MultiError>().unwrap();
        assert_eq!(multi.len(), 3);
    }

    #[test]
    fn test_merge_keeps_first_error_first() {
        assert!(merge(Ok(()), Ok(())).is_ok());
        let err = merge(Err(anyhow!("only")), Ok(())).unwrap_err();
        assert_eq!(err.to_string(), "only");

        let err = merge(Err(anyhow!("callback")), Err(anyhow!("close"))).unwrap_err();
        let multi = err.downcast_ref::<MultiError>().unwrap();
        assert_eq!(multi.errors()[0].to_string(), "callback");
        assert_eq!(multi.errors()[1].to_string(), "close");
    }

    #[test]
    fn test_empty_is_ok() {
        assert!(MultiError::new().into_result().is_ok());
    }
}
