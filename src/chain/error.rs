//! Typed chain client errors
//!
//! Node and contract failures are tagged with an [`ErrorCode`] at the point
//! where the RPC response is still structured, so pollers never have to guess
//! from a flattened string.

use alloy::transports::{RpcError, TransportErrorKind};
use thiserror::Error;

use crate::error_parser::ErrorCode;

#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct ChainError {
    pub code: ErrorCode,
    pub message: String,
}

impl ChainError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Fee estimation failures are always GAS_FEE_ERROR
    pub fn gas_fee(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::GasFeeError, message)
    }

    pub fn from_transport(err: &RpcError<TransportErrorKind>) -> Self {
        match err {
            RpcError::ErrorResp(payload) => {
                let message = payload.message.to_string();
                Self::new(
                    ErrorCode::from_rpc_message(Some(payload.code), &message),
                    message,
                )
            }
            RpcError::Transport(kind) => {
                let message = kind.to_string();
                let code = match ErrorCode::from_rpc_message(None, &message) {
                    ErrorCode::Timeout => ErrorCode::Timeout,
                    _ => ErrorCode::NetworkError,
                };
                Self::new(code, message)
            }
            RpcError::NullResp => Self::new(ErrorCode::ServerError, "null response from node"),
            other => {
                let message = other.to_string();
                Self::new(ErrorCode::from_rpc_message(None, &message), message)
            }
        }
    }

    /// A revert during gas estimation means the claim cannot be executed as-is
    pub fn from_estimation(err: &RpcError<TransportErrorKind>) -> Self {
        let mut error = Self::from_transport(err);
        if matches!(
            error.code,
            ErrorCode::ExecutionReverted | ErrorCode::CallException
        ) {
            error.code = ErrorCode::UnpredictableGasLimit;
        }
        error
    }

    pub fn from_contract(err: &alloy::contract::Error) -> Self {
        match err {
            alloy::contract::Error::TransportError(transport) => Self::from_transport(transport),
            other => Self::new(ErrorCode::CallException, other.to_string()),
        }
    }
}
