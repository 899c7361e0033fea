//! Outputs handed to request callbacks.

use serde::Serialize;

use crate::core::request::{Request, RequestId, Statistics};
use crate::core::sequence::FinishReason;

/// Outcome class of a finished request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Ok,
    Cancelled,
    CapacityExceeded,
    InvalidArgument,
    Internal,
}

/// Terminal status of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::Ok, "")
    }

    pub fn cancelled() -> Self {
        Self::new(StatusCode::Cancelled, "request cancelled")
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    /// Status of a request whose sequences all reached a terminal state.
    ///
    /// Capacity failures win over executor failures, which win over
    /// cancellation.
    pub fn from_request(request: &Request) -> Self {
        let reasons: Vec<FinishReason> = request
            .sequences()
            .iter()
            .filter_map(|seq| seq.finish_reason())
            .collect();
        let message = |default: &str| {
            request
                .status_message()
                .unwrap_or(default)
                .to_string()
        };

        if reasons.contains(&FinishReason::CapacityExceeded) {
            Self::new(
                StatusCode::CapacityExceeded,
                message("request exceeds KV cache capacity"),
            )
        } else if reasons.contains(&FinishReason::Error) {
            Self::new(StatusCode::Internal, message("executor failure"))
        } else if reasons.contains(&FinishReason::Cancelled) {
            Self::cancelled()
        } else {
            Self::ok()
        }
    }
}

/// Output of one sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SequenceOutput {
    pub index: usize,
    /// Text produced since the previous output (the full text without
    /// streaming).
    pub text: String,
    /// Tokens produced since the previous output.
    pub token_ids: Vec<u32>,
    pub finish_reason: Option<FinishReason>,
}

/// One callback invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestOutput {
    pub request_id: RequestId,
    pub outputs: Vec<SequenceOutput>,
    /// Set on the terminal output only.
    pub status: Option<Status>,
    /// Set on the terminal output only.
    pub usage: Option<Statistics>,
    pub finished: bool,
}

impl RequestOutput {
    /// Terminal output for a request that never reached the scheduler.
    pub fn failed(request_id: RequestId, status: Status) -> Self {
        Self {
            request_id,
            outputs: Vec::new(),
            status: Some(status),
            usage: None,
            finished: true,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status.as_ref().map_or(true, Status::is_ok)
    }

    /// Rewrite a terminal output into a cancellation.
    pub(crate) fn into_cancelled(mut self) -> Self {
        self.status = Some(Status::cancelled());
        for output in &mut self.outputs {
            if output.finish_reason.is_some() {
                output.finish_reason = Some(FinishReason::Cancelled);
            }
        }
        self
    }
}

/// Callback receiving a request's outputs; returning `false` cancels it.
pub type OutputCallback = Box<dyn FnMut(RequestOutput) -> bool + Send>;
