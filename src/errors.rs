//! Error-handling utilities.

use anyhow::Error;

/// Display an error, plus all the underlying "causes" (ie, wrapped errors), plus a
/// backtrace.
pub(crate) fn display_causes_and_backtrace(err: &Error) {
    eprintln!("Error: {}", err);
    for cause in err.chain().skip(1) {
        eprintln!("  caused by: {}", cause);
    }
    eprintln!("{}", err.backtrace());
}

/// Classify a `hyper` client error into a low-arity label for metrics.
pub(crate) fn hyper_error_description_for_metrics(err: &hyper::Error) -> &'static str {
    if err.is_connect() {
        "connect"
    } else if err.is_timeout() {
        "timeout"
    } else if err.is_canceled() {
        "canceled"
    } else if err.is_incomplete_message() {
        "incomplete_message"
    } else if err.is_closed() {
        "closed"
    } else if err.is_parse() {
        "parse"
    } else {
        "other"
    }
}
