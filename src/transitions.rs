//! Request status transitions for the board pipeline.
//!
//! ```text
//! queue ──> active ──> review ──> done
//!   ^         │ ^        │          │
//!   └─────────┘ └────────┘          │
//!               ^                   │
//!               └──── reopen ───────┘
//! ```
//!
//! Moving a request within its current column is always allowed.

use thiserror::Error;

use crate::model::{RequestStatus, Role};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("cannot move request from '{}' to '{}'", .from.as_str(), .to.as_str())]
    NotAllowed {
        from: RequestStatus,
        to: RequestStatus,
    },
    #[error("clients may only approve or send back requests in review")]
    ClientNotPermitted,
}

pub fn allowed_transitions(from: RequestStatus) -> &'static [RequestStatus] {
    match from {
        RequestStatus::Queue => &[RequestStatus::Active],
        RequestStatus::Active => &[RequestStatus::Queue, RequestStatus::Review],
        RequestStatus::Review => &[RequestStatus::Active, RequestStatus::Done],
        RequestStatus::Done => &[RequestStatus::Active],
    }
}

pub fn validate_transition(from: RequestStatus, to: RequestStatus) -> Result<(), TransitionError> {
    if from == to || allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(TransitionError::NotAllowed { from, to })
    }
}

/// Clients may approve (`review -> done`) or request changes (`review -> active`).
pub fn client_may_transition(from: RequestStatus, to: RequestStatus) -> bool {
    from == to
        || matches!(
            (from, to),
            (RequestStatus::Review, RequestStatus::Done)
                | (RequestStatus::Review, RequestStatus::Active)
        )
}

/// Full check for a move performed by a user with `role`.
pub fn check_move(role: Role, from: RequestStatus, to: RequestStatus) -> Result<(), TransitionError> {
    validate_transition(from, to)?;
    if role == Role::Client && !client_may_transition(from, to) {
        return Err(TransitionError::ClientNotPermitted);
    }
    Ok(())
}
