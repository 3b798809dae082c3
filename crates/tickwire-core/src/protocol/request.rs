//! Worker call payload: `<procedure-name>,<encoded-argument-list>`.

use thiserror::Error;

/// Separator between the procedure name and its encoded arguments.
pub const PROCEDURE_DELIMITER: u8 = b',';

/// Errors raised while splitting an accumulated call payload.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    /// No comma separates the procedure name from its arguments.
    #[error("call payload has no procedure delimiter")]
    MissingDelimiter,

    /// The procedure name is empty.
    #[error("call payload has an empty procedure name")]
    EmptyProcedure,

    /// The procedure name is not valid UTF-8.
    #[error("procedure name is not valid UTF-8")]
    InvalidProcedureName,
}

/// One decoded logical call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRequest {
    /// Name looked up in the dispatch table.  Never contains a comma.
    pub procedure: String,
    /// Encoded argument list, still in the codec's wire form.
    pub arguments: Vec<u8>,
}

impl WorkerRequest {
    /// Splits an accumulated call payload at the first comma.
    ///
    /// # Errors
    ///
    /// Returns a [`RequestError`] if the payload has no delimiter or the name
    /// is empty or not UTF-8.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tickwire_core::protocol::WorkerRequest;
    ///
    /// let req = WorkerRequest::parse(b"echo,[\"a,b\"]").unwrap();
    /// assert_eq!(req.procedure, "echo");
    /// assert_eq!(req.arguments, b"[\"a,b\"]");
    /// ```
    pub fn parse(payload: &[u8]) -> Result<Self, RequestError> {
        let pos = payload
            .iter()
            .position(|b| *b == PROCEDURE_DELIMITER)
            .ok_or(RequestError::MissingDelimiter)?;
        if pos == 0 {
            return Err(RequestError::EmptyProcedure);
        }

        let procedure = std::str::from_utf8(&payload[..pos])
            .map_err(|_| RequestError::InvalidProcedureName)?
            .to_string();

        Ok(Self {
            procedure,
            arguments: payload[pos + 1..].to_vec(),
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_splits_on_first_comma_only() {
        let req = WorkerRequest::parse(b"sum,[1,2,3]").unwrap();
        assert_eq!(req.procedure, "sum");
        assert_eq!(req.arguments, b"[1,2,3]");
    }

    #[test]
    fn test_parse_allows_empty_arguments() {
        let req = WorkerRequest::parse(b"ping,").unwrap();
        assert_eq!(req.procedure, "ping");
        assert!(req.arguments.is_empty());
    }

    #[test]
    fn test_parse_without_delimiter_is_error() {
        assert_eq!(
            WorkerRequest::parse(b"nodelimiter"),
            Err(RequestError::MissingDelimiter)
        );
    }

    #[test]
    fn test_parse_with_leading_comma_is_error() {
        assert_eq!(
            WorkerRequest::parse(b",[]"),
            Err(RequestError::EmptyProcedure)
        );
    }

    #[test]
    fn test_parse_rejects_non_utf8_name() {
        assert_eq!(
            WorkerRequest::parse(&[0xFF, 0xFE, b',']),
            Err(RequestError::InvalidProcedureName)
        );
    }
}
