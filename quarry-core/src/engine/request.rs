//! Request records.
//!
//! Every trigger attempt of a query or effect is recorded as a [`Request`]:
//! when it started, when it ended, how it ended. Records are for
//! observability (transient success/error banners, debugging panels); the
//! engine never makes decisions based on them.

use serde::Serialize;

use crate::clock::now_ms;
use crate::error::FetchError;
use crate::ids::RequestId;
use crate::store::Data;

/// Whether a request is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Success,
    Error,
}

/// What issued the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Query,
    Effect,
}

/// Start/end times in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Timing {
    pub start: u64,
    pub end: Option<u64>,
    pub duration: Option<u64>,
}

/// How a completed request ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Result(Data),
    Error(FetchError),
}

/// One trigger attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    id: RequestId,
    kind: RequestKind,
    args: Option<Data>,
    timing: Timing,
    status: RequestStatus,
    response: Option<Response>,
}

impl Request {
    /// Record a request starting now.
    pub(crate) fn start(kind: RequestKind, args: Option<Data>) -> Self {
        Self {
            id: RequestId::new(),
            kind,
            args,
            timing: Timing {
                start: now_ms(),
                end: None,
                duration: None,
            },
            status: RequestStatus::Pending,
            response: None,
        }
    }

    /// A copy of this request completed now with `outcome`.
    pub(crate) fn complete(&self, outcome: &Result<Data, FetchError>) -> Self {
        let end = now_ms();
        let (status, response) = match outcome {
            Ok(value) => (RequestStatus::Success, Response::Result(value.clone())),
            Err(error) => (RequestStatus::Error, Response::Error(error.clone())),
        };
        Self {
            timing: Timing {
                start: self.timing.start,
                end: Some(end),
                duration: Some(end.saturating_sub(self.timing.start)),
            },
            status,
            response: Some(response),
            ..self.clone()
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Call arguments (effects only).
    pub fn args(&self) -> Option<&Data> {
        self.args.as_ref()
    }

    pub fn timing(&self) -> Timing {
        self.timing
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    pub fn is_pending(&self) -> bool {
        self.status == RequestStatus::Pending
    }
}
