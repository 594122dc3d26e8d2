//! Service call errors and their classification.

use std::time::Duration;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// How a failed service call should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceErrorKind {
    /// Throttling, timeouts, dropped connections and server errors. Retried with backoff.
    Transient,
    /// Access denied, missing objects, malformed requests, failed preconditions. Never retried.
    Permanent,
    /// The task never started because the batch was cancelled.
    Cancelled,
}

/// A failed storage, query or warehouse call.
///
/// Transient errors surface only after the retry policy gave up on them.
#[derive(Debug, thiserror::Error)]
#[error("{context}")]
pub struct ServiceError {
    kind: ServiceErrorKind,
    context: String,
    #[source]
    source: Option<BoxError>,
}

impl ServiceError {
    pub fn new(
        kind: ServiceErrorKind,
        context: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self {
            kind,
            context: context.into(),
            source: Some(source.into()),
        }
    }

    pub fn transient(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::new(ServiceErrorKind::Transient, context, source)
    }

    pub fn permanent(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::new(ServiceErrorKind::Permanent, context, source)
    }

    /// A permanent error without an underlying cause, e.g. a remote failure message.
    pub fn permanent_message(context: impl Into<String>) -> Self {
        Self {
            kind: ServiceErrorKind::Permanent,
            context: context.into(),
            source: None,
        }
    }

    pub fn cancelled(context: impl Into<String>) -> Self {
        Self {
            kind: ServiceErrorKind::Cancelled,
            context: context.into(),
            source: None,
        }
    }

    /// A call that did not complete within its timeout. Timeouts are transient.
    pub fn timeout(context: impl Into<String>, after: Duration) -> Self {
        Self {
            kind: ServiceErrorKind::Transient,
            context: format!("{} timed out after {:.1}s", context.into(), after.as_secs_f32()),
            source: None,
        }
    }

    /// Wraps an object store error, classifying it with [`classify`].
    pub fn from_store(context: impl Into<String>, err: object_store::Error) -> Self {
        let kind = classify(&err);
        Self::new(kind, context, err)
    }

    pub fn kind(&self) -> ServiceErrorKind {
        self.kind
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ServiceErrorKind::Transient
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ServiceErrorKind::Cancelled
    }

    /// Whether the underlying cause is an object store `NotFound` error.
    pub fn is_not_found(&self) -> bool {
        self.source
            .as_ref()
            .and_then(|source| source.downcast_ref::<object_store::Error>())
            .is_some_and(|err| matches!(err, object_store::Error::NotFound { .. }))
    }
}

/// HTTP statuses of throttled or failed server-side requests.
const TRANSIENT_STATUSES: &[&str] = &["429", "500", "502", "503", "504"];

/// Word sequences that mark a generic store error as transient.
const TRANSIENT_PHRASES: &[&[&str]] = &[
    &["slowdown"],
    &["slow", "down"],
    &["too", "many", "requests"],
    &["service", "unavailable"],
    &["internalerror"],
    &["internal", "error"],
    &["requesttimeout"],
    &["timeout"],
    &["timed", "out"],
    &["connection", "reset"],
    &["connection", "refused"],
    &["connection", "closed"],
    &["broken", "pipe"],
];

/// Classifies an object store error.
///
/// Only generic errors caused by a dropped connection, or whose message names a transient
/// condition, are transient. Every other variant (not found, permission denied,
/// unauthenticated, precondition, invalid path, ...) is permanent.
pub fn classify(err: &object_store::Error) -> ServiceErrorKind {
    match err {
        object_store::Error::Generic { .. }
            if has_transient_io_error(err) || is_transient_message(&error_chain(err)) =>
        {
            ServiceErrorKind::Transient
        }
        _ => ServiceErrorKind::Permanent,
    }
}

/// Whether an error message names a transient condition.
///
/// URLs are ignored, since object keys and run ids in them can contain anything. The rest is
/// matched word by word: a status must stand alone, so `part-00500` is not a 500.
pub fn is_transient_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    let words: Vec<&str> = message
        .split_whitespace()
        .filter(|word| !word.contains("://"))
        .flat_map(|word| word.split(|c: char| !c.is_ascii_alphanumeric()))
        .filter(|word| !word.is_empty())
        .collect();

    words
        .iter()
        .any(|word| word.starts_with("throttl") || TRANSIENT_STATUSES.contains(word))
        || TRANSIENT_PHRASES
            .iter()
            .any(|phrase| words.windows(phrase.len()).any(|window| window == *phrase))
}

fn has_transient_io_error(err: &(dyn std::error::Error + 'static)) -> bool {
    use std::io::ErrorKind;

    let mut current = Some(err);
    while let Some(cause) = current {
        if let Some(io) = cause.downcast_ref::<std::io::Error>()
            && matches!(
                io.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionRefused
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::TimedOut
            )
        {
            return true;
        }
        current = cause.source();
    }
    false
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut chain = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generic(message: &str) -> object_store::Error {
        object_store::Error::Generic {
            store: "S3",
            source: message.to_string().into(),
        }
    }

    #[test]
    fn classify_treats_throttling_and_server_errors_as_transient() {
        assert_eq!(
            classify(&generic("SlowDown: Please reduce your request rate")),
            ServiceErrorKind::Transient
        );
        assert_eq!(
            classify(&generic("Server returned non-2xx status code: 503 Service Unavailable")),
            ServiceErrorKind::Transient
        );
        assert_eq!(
            classify(&generic("error sending request: connection reset by peer")),
            ServiceErrorKind::Transient
        );
    }

    #[test]
    fn classify_ignores_status_digits_inside_urls_and_keys() {
        let err = generic(
            "Error performing PUT https://bucket.s3.amazonaws.com/sales/part-00500-0191a5003b2c-\
             7504-a429.snappy.parquet in 12ms: Server returned non-2xx status code: \
             400 Bad Request: MalformedXML",
        );
        assert_eq!(classify(&err), ServiceErrorKind::Permanent);

        let err = generic(
            "Error performing GET https://bucket.s3.amazonaws.com/timeout/part-00000.parquet: \
             Server returned non-2xx status code: 403 Forbidden: AccessDenied",
        );
        assert_eq!(classify(&err), ServiceErrorKind::Permanent);
    }

    #[test]
    fn classify_treats_dropped_connections_as_transient() {
        let err = object_store::Error::Generic {
            store: "S3",
            source: Box::new(std::io::Error::from(std::io::ErrorKind::ConnectionReset)),
        };
        assert_eq!(classify(&err), ServiceErrorKind::Transient);
    }

    #[test]
    fn classify_treats_other_errors_as_permanent() {
        assert_eq!(
            classify(&generic("Access Denied")),
            ServiceErrorKind::Permanent
        );
        assert_eq!(
            classify(&object_store::Error::NotFound {
                path: "a/b".into(),
                source: "missing".into(),
            }),
            ServiceErrorKind::Permanent
        );
        assert_eq!(
            classify(&object_store::Error::PermissionDenied {
                path: "a/b".into(),
                source: "denied".into(),
            }),
            ServiceErrorKind::Permanent
        );
    }

    #[test]
    fn is_not_found_inspects_store_source() {
        let err = ServiceError::from_store(
            "get 'a/b'",
            object_store::Error::NotFound {
                path: "a/b".into(),
                source: "missing".into(),
            },
        );
        assert!(err.is_not_found());
        assert!(!err.is_transient());
    }

    #[test]
    fn timeout_is_transient() {
        let err = ServiceError::timeout("put 'a/b'", Duration::from_secs(3));
        assert!(err.is_transient());
        assert_eq!(err.to_string(), "put 'a/b' timed out after 3.0s");
    }
}
