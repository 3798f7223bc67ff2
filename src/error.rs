// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use thiserror::Error;

use crate::abi;
use crate::Guid;

/// The closed set of failures surfaced by the library. Win32 and TDH
/// status codes are translated into these at the call sites that receive
/// them; the raw status is preserved where it carries diagnostic value.
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("the trace session has already been registered")]
    SessionAlreadyRegistered,

    #[error("invalid parameter given")]
    InvalidParameter,

    #[error("administrator privileges are required")]
    NeedsElevation,

    #[error("could not find the schema for provider {provider} event {event_id} (status {status})")]
    SchemaNotFound {
        provider: Guid,
        event_id: u16,
        status: u32,
    },

    #[error("could not decode property '{property}': {reason}")]
    DecodeFailed {
        property: String,
        reason: &'static str,
    },

    #[error("{context} failed with status {status}")]
    UnknownHostError {
        status: u32,
        context: &'static str,
    },
}

impl TraceError {
    /// Maps a non-success Win32 status to the error taxonomy.
    /// `context` names the host call that produced the status.
    pub fn from_status(
        status: u32,
        context: &'static str) -> TraceError {
        match status {
            abi::ERROR_ALREADY_EXISTS => TraceError::SessionAlreadyRegistered,
            abi::ERROR_INVALID_PARAMETER => TraceError::InvalidParameter,
            abi::ERROR_ACCESS_DENIED => TraceError::NeedsElevation,
            other => TraceError::UnknownHostError {
                status: other,
                context,
            },
        }
    }
}

pub(crate) fn check_status(
    status: u32,
    context: &'static str) -> Result<(), TraceError> {
    if status == abi::ERROR_SUCCESS {
        return Ok(());
    }

    Err(TraceError::from_status(status, context))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_translation() {
        assert!(matches!(
            TraceError::from_status(abi::ERROR_ALREADY_EXISTS, "StartTraceW"),
            TraceError::SessionAlreadyRegistered));
        assert!(matches!(
            TraceError::from_status(abi::ERROR_INVALID_PARAMETER, "StartTraceW"),
            TraceError::InvalidParameter));
        assert!(matches!(
            TraceError::from_status(abi::ERROR_ACCESS_DENIED, "StartTraceW"),
            TraceError::NeedsElevation));
        assert!(matches!(
            TraceError::from_status(31, "EnableTraceEx2"),
            TraceError::UnknownHostError { status: 31, .. }));
    }

    #[test]
    fn success_is_not_an_error() {
        assert!(check_status(abi::ERROR_SUCCESS, "StartTraceW").is_ok());
        assert!(check_status(abi::ERROR_ACCESS_DENIED, "StartTraceW").is_err());
    }

    #[test]
    fn errors_carry_context() {
        let error = TraceError::SchemaNotFound {
            provider: Guid::from_u128(0x1234),
            event_id: 7937,
            status: abi::ERROR_NOT_FOUND,
        };

        let message = error.to_string();

        assert!(message.contains("7937"));
        assert!(message.contains("1168"));
    }
}
