use super::delivery::Headers;
use super::request::Request;

/// How a processing task finished, and therefore what the broker is told.
///
/// - `Success`: acknowledge the delivery.
/// - `Discard`: expected per-message failure, nack without requeue.
/// - `Republish`: acknowledge, then publish a fresh copy of `request`.
/// - `Failure`: unknown cause, nack with requeue and raise the panic flag.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingOutcome {
    Success,

    Discard { reason: String },

    Republish { request: Box<Request>, headers: Headers },

    Failure { cause: String },
}

impl ProcessingOutcome {
    pub fn discard(reason: impl Into<String>) -> Self {
        Self::Discard {
            reason: reason.into(),
        }
    }

    pub fn republish(request: Request, headers: Headers) -> Self {
        Self::Republish {
            request: Box::new(request),
            headers,
        }
    }

    pub fn failure(cause: impl Into<String>) -> Self {
        Self::Failure {
            cause: cause.into(),
        }
    }

    /// Only unclassified failures are systemic, everything else is handled per message.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }

    /// Label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Discard { .. } => "discard",
            Self::Republish { .. } => "republish",
            Self::Failure { .. } => "failure",
        }
    }
}

impl std::fmt::Display for ProcessingOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "Processed successfully"),
            Self::Discard { reason } => write!(f, "Discarded: {}", reason),
            Self::Republish { request, .. } => write!(f, "Republish requested for {}", request.id),
            Self::Failure { cause } => write!(f, "Unclassified failure: {}", cause),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discard_outcome() {
        let outcome = ProcessingOutcome::discard("bad parameters");
        assert!(!outcome.is_fatal());
        assert_eq!(outcome.kind(), "discard");
        assert_eq!(outcome.to_string(), "Discarded: bad parameters");
    }

    #[test]
    fn test_failure_outcome() {
        let outcome = ProcessingOutcome::failure("worker crashed");
        assert!(outcome.is_fatal());
        assert_eq!(outcome.kind(), "failure");
    }

    #[test]
    fn test_republish_outcome() {
        let outcome = ProcessingOutcome::republish(Request::with_id("abc"), Headers::new());
        assert!(!outcome.is_fatal());
        assert_eq!(outcome.kind(), "republish");
        assert_eq!(outcome.to_string(), "Republish requested for abc");
    }
}
