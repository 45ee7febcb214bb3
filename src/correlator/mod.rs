//! Request/response correlation over publish/subscribe
//!
//! Property and enrollment operations publish a request and wait for a reply
//! on a separate response topic. [`RequestTable`] holds what is in flight and
//! [`Correlator`] drives the subscribe, publish, wait and cleanup sequence.

pub mod requests;
pub mod table;

pub use requests::{enrollment_key, CorrelatedRequest, Correlator, Resolution};
pub use table::{
    EnrollmentClaim, KeySource, PendingRequest, Registration, RequestOutcome, RequestTable,
    RETIRED_KEY_CAPACITY,
};

use std::fmt;

/// Kind of a correlated request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    GetProperty,
    SetProperty,
    Enroll,
    EnrollCtrl,
}

impl RequestKind {
    pub fn is_enrollment(self) -> bool {
        matches!(self, RequestKind::Enroll | RequestKind::EnrollCtrl)
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestKind::GetProperty => "get-property",
            RequestKind::SetProperty => "set-property",
            RequestKind::Enroll => "enroll",
            RequestKind::EnrollCtrl => "enroll-ctrl",
        };
        f.write_str(name)
    }
}
