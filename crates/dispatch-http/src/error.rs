use crate::HttpResponse;
use dispatch_classifier::TransportCondition;
use std::fmt;
use std::time::Duration;

/// Failure surfaced by one HTTP attempt.
///
/// A 5xx response is still carried as a full [`HttpResponse`] — the
/// classifier needs its body and headers the same way it needs a 4xx
/// response's, it just arrives through the error path per the executor's
/// `status >= 500 raised as errors` contract.
#[derive(Debug)]
pub enum HttpError {
    Server(HttpResponse),
    Transport {
        condition: TransportCondition,
        duration: Duration,
        message: String,
    },
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpError::Server(resp) => write!(f, "server error, status {}", resp.status),
            HttpError::Transport { message, .. } => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for HttpError {}
