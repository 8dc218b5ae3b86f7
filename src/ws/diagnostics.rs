//! Bounded record of the most recent traffic, used for error reports.

use std::backtrace::BacktraceStatus;
use std::error::Error as StdError;
use std::fmt::Write as _;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Local;

use crate::error::Error;

/// Maximum number of characters kept for each recorded payload.
pub const MAX_RECORDED_CHARS: usize = 1000;

/// Last sent and last received payloads of a connection.
///
/// Owned by the connection supervisor; handlers only ever see it by reference from
/// [`Handler::on_error`](crate::ws::Handler::on_error). The sent slot is shared with the
/// client so a packet is recorded when it is submitted, not when the socket gets to it.
#[non_exhaustive]
#[derive(Debug, Default)]
pub struct Diagnostics {
    last_sent: SentRecorder,
    last_received: String,
}

/// Writer side of the last sent slot, held by the client.
#[derive(Debug, Clone, Default)]
pub(crate) struct SentRecorder(Arc<Mutex<String>>);

impl SentRecorder {
    /// Record `text`, then hand it to `then` while the slot is still locked.
    ///
    /// Concurrent senders are serialized here, so the recorded payload is always the one
    /// queued last.
    pub(crate) fn record_then<R>(&self, text: String, then: impl FnOnce(String) -> R) -> R {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        record(&mut slot, &text);
        then(text)
    }

    fn get(&self) -> String {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Diagnostics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent outbound payload, at most [`MAX_RECORDED_CHARS`] characters.
    #[must_use]
    pub fn last_sent(&self) -> String {
        self.last_sent.get()
    }

    /// Most recent inbound payload, at most [`MAX_RECORDED_CHARS`] characters.
    #[must_use]
    pub fn last_received(&self) -> &str {
        &self.last_received
    }

    pub fn record_sent(&self, text: &str) {
        self.last_sent.record_then(text.to_owned(), drop);
    }

    pub fn record_received(&mut self, text: &str) {
        record(&mut self.last_received, text);
    }

    pub(crate) fn sent_recorder(&self) -> SentRecorder {
        self.last_sent.clone()
    }

    /// Human-readable report of `error` together with the recorded traffic.
    #[must_use]
    pub fn exception_detail(&self, error: &Error) -> String {
        let mut text = String::new();

        _ = writeln!(
            text,
            "[{}]: Unhandled WebSocket Error: {:?}",
            Local::now().format("%Y-%m-%dT%H:%M:%S%.6f"),
            error.kind()
        );
        _ = writeln!(text, "LastSentText:\n{}", self.last_sent());
        _ = writeln!(text, "LastReceivedText:\n{}", self.last_received);
        _ = writeln!(text, "Exception trace:");
        _ = writeln!(text, "{error}");

        let mut source = error.source();
        while let Some(cause) = source {
            _ = writeln!(text, "  caused by: {cause}");
            source = cause.source();
        }

        let backtrace = error.backtrace();
        if backtrace.status() == BacktraceStatus::Captured {
            _ = writeln!(text, "{backtrace}");
        } else {
            _ = writeln!(text, "(backtrace not captured, set RUST_BACKTRACE=1)");
        }

        text
    }

    /// Print the report for `error` to standard output.
    ///
    /// Never panics: if building the report fails, the raw error and backtrace are dumped
    /// instead.
    #[expect(
        clippy::print_stdout,
        reason = "Default error sink prints the report when no handler overrides it"
    )]
    pub fn report(&self, error: &Error) {
        #[cfg(feature = "tracing")]
        tracing::error!(kind = ?error.kind(), error = %error, "Unhandled WebSocket error");

        match catch_unwind(AssertUnwindSafe(|| self.exception_detail(error))) {
            Ok(detail) => {
                println!("WebSocket client on error{}", "-".repeat(10));
                println!("{detail}");
            }
            Err(_) => {
                _ = catch_unwind(AssertUnwindSafe(|| {
                    println!("WebSocket client failed to format error: {error:?}");
                    println!("{}", error.backtrace());
                }));
            }
        }
    }
}

fn record(slot: &mut String, text: &str) {
    slot.clear();
    slot.extend(text.chars().take(MAX_RECORDED_CHARS));
}
