//! Error classification shared by every poller
//!
//! Maps a failure from a chain client or the message store onto a fixed retry
//! policy. This table is the single place where retry behaviour is decided.

use std::fmt;
use std::time::Duration;

use crate::chain::ChainError;
use crate::db::StoreAccessError;

/// Blocking delay applied to transient failures before the next tick
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(5);

/// Blocking delay while the signer has no funds to pay for gas
pub const INSUFFICIENT_FUNDS_RETRY_PERIOD: Duration = Duration::from_secs(30);

/// Error codes recognised by the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NetworkError,
    Timeout,
    ServerError,
    InsufficientFunds,
    ReplacementUnderpriced,
    NonceExpired,
    CallException,
    ExecutionReverted,
    OutOfGas,
    ActionRejected,
    UnpredictableGasLimit,
    GasFeeError,
    DatabaseError,
    UnknownError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::ServerError => "SERVER_ERROR",
            ErrorCode::InsufficientFunds => "INSUFFICIENT_FUNDS",
            ErrorCode::ReplacementUnderpriced => "REPLACEMENT_UNDERPRICED",
            ErrorCode::NonceExpired => "NONCE_EXPIRED",
            ErrorCode::CallException => "CALL_EXCEPTION",
            ErrorCode::ExecutionReverted => "EXECUTION_REVERTED",
            ErrorCode::OutOfGas => "OUT_OF_GAS",
            ErrorCode::ActionRejected => "ACTION_REJECTED",
            ErrorCode::UnpredictableGasLimit => "UNPREDICTABLE_GAS_LIMIT",
            ErrorCode::GasFeeError => "GAS_FEE_ERROR",
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// Classify a raw node error by its JSON-RPC code and message
    pub fn from_rpc_message(rpc_code: Option<i64>, message: &str) -> ErrorCode {
        let message = message.to_lowercase();

        if rpc_code == Some(4001) || message.contains("user rejected") || message.contains("user denied") {
            return ErrorCode::ActionRejected;
        }

        if message.contains("insufficient funds") {
            return ErrorCode::InsufficientFunds;
        }

        if message.contains("underpriced")
            || message.contains("replacement transaction")
            || message.contains("fee too low")
            || message.contains("gas price too low")
            || message.contains("max fee per gas less than")
        {
            return ErrorCode::ReplacementUnderpriced;
        }

        if message.contains("nonce too low")
            || message.contains("already known")
            || message.contains("nonce has already been used")
        {
            return ErrorCode::NonceExpired;
        }

        if message.contains("out of gas")
            || message.contains("intrinsic gas too low")
            || message.contains("gas required exceeds allowance")
        {
            return ErrorCode::OutOfGas;
        }

        if message.contains("cannot estimate gas") || message.contains("unpredictable gas limit") {
            return ErrorCode::UnpredictableGasLimit;
        }

        if rpc_code == Some(3) || message.contains("execution reverted") {
            return ErrorCode::ExecutionReverted;
        }

        if message.contains("call exception") || message.contains("reverted") {
            return ErrorCode::CallException;
        }

        if message.contains("timeout") || message.contains("timed out") {
            return ErrorCode::Timeout;
        }

        if message.contains("connection")
            || message.contains("network")
            || message.contains("rate limit")
            || message.contains("too many requests")
            || message.contains("503")
            || message.contains("502")
            || message.contains("temporarily unavailable")
        {
            return ErrorCode::NetworkError;
        }

        if rpc_code == Some(-32603) || rpc_code == Some(-32000) {
            return ErrorCode::ServerError;
        }

        ErrorCode::UnknownError
    }

    /// Fixed retry policy for each code
    pub fn mitigation(&self) -> Mitigation {
        match self {
            ErrorCode::NetworkError
            | ErrorCode::Timeout
            | ErrorCode::ServerError
            | ErrorCode::GasFeeError
            | ErrorCode::DatabaseError
            | ErrorCode::UnknownError => Mitigation::blocking(DEFAULT_RETRY_PERIOD),
            ErrorCode::InsufficientFunds => Mitigation::blocking(INSUFFICIENT_FUNDS_RETRY_PERIOD),
            ErrorCode::ReplacementUnderpriced
            | ErrorCode::NonceExpired
            | ErrorCode::CallException => Mitigation::retry(),
            ErrorCode::ExecutionReverted
            | ErrorCode::OutOfGas
            | ErrorCode::ActionRejected
            | ErrorCode::UnpredictableGasLimit => Mitigation::no_retry(),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a poller should do after a failed tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mitigation {
    pub should_retry: bool,
    pub retry_with_blocking: bool,
    pub retry_period: Option<Duration>,
}

impl Mitigation {
    fn retry() -> Self {
        Self {
            should_retry: true,
            retry_with_blocking: false,
            retry_period: None,
        }
    }

    fn blocking(period: Duration) -> Self {
        Self {
            should_retry: true,
            retry_with_blocking: true,
            retry_period: Some(period),
        }
    }

    fn no_retry() -> Self {
        Self {
            should_retry: false,
            retry_with_blocking: false,
            retry_period: None,
        }
    }

    /// Extra delay to wait before the next tick
    pub fn blocking_delay(&self) -> Option<Duration> {
        if self.retry_with_blocking {
            self.retry_period
        } else {
            None
        }
    }
}

/// Classification result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedError {
    pub code: ErrorCode,
    pub context: String,
    pub mitigation: Mitigation,
}

pub struct ErrorParser;

impl ErrorParser {
    /// Classify an error by walking its source chain.
    ///
    /// Structured errors (`ChainError`, `StoreAccessError`) win over message
    /// matching; anything unrecognised gets the default blocking retry.
    pub fn classify(error: &eyre::Report) -> ParsedError {
        for cause in error.chain() {
            if let Some(chain_error) = cause.downcast_ref::<ChainError>() {
                return Self::parsed(chain_error.code, chain_error.message.clone());
            }
            if let Some(store_error) = cause.downcast_ref::<StoreAccessError>() {
                return Self::parsed(ErrorCode::DatabaseError, store_error.to_string());
            }
        }

        let context = format!("{:#}", error);
        Self::parsed(ErrorCode::from_rpc_message(None, &context), context)
    }

    fn parsed(code: ErrorCode, context: String) -> ParsedError {
        ParsedError {
            code,
            context,
            mitigation: code.mitigation(),
        }
    }
}
