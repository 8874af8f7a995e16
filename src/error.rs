//! Error taxonomy for the transport engine and the modem/SIM FSMs (§7).

use thiserror::Error;

/// Standard QMI result TLV (type 0x02): `result` 0 = success, 1 = error,
/// in which case `error` carries one of the codes below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QmiResultTlv {
    pub result: u16,
    pub error: QmiErrorCode,
}

impl QmiResultTlv {
    pub fn success() -> Self {
        QmiResultTlv { result: 0, error: QmiErrorCode::None }
    }

    pub fn is_success(&self) -> bool {
        self.result == 0
    }
}

/// Protocol-level error codes carried in the result TLV's `error` word.
/// Not exhaustive of the real QMI error space; covers the codes this
/// crate's FSMs branch on plus a catch-all for everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QmiErrorCode {
    None,
    NoEffect,
    CallFailed,
    NotSupported,
    InvalidArgument,
    DeviceNotReady,
    AllocFailed,
    TidExhausted,
    Other(u16),
}

impl QmiErrorCode {
    pub fn from_code(code: u16) -> Self {
        match code {
            0x0000 => QmiErrorCode::None,
            0x0003 => QmiErrorCode::InvalidArgument,
            0x0005 => QmiErrorCode::NotSupported,
            0x001a => QmiErrorCode::NoEffect,
            0x0011 => QmiErrorCode::CallFailed,
            0x001d => QmiErrorCode::DeviceNotReady,
            other => QmiErrorCode::Other(other),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            QmiErrorCode::None => 0x0000,
            QmiErrorCode::InvalidArgument => 0x0003,
            QmiErrorCode::NotSupported => 0x0005,
            QmiErrorCode::NoEffect => 0x001a,
            QmiErrorCode::CallFailed => 0x0011,
            QmiErrorCode::DeviceNotReady => 0x001d,
            QmiErrorCode::AllocFailed => 0xffee,
            QmiErrorCode::TidExhausted => 0xffef,
            QmiErrorCode::Other(c) => *c,
        }
    }
}

/// Outcome of a completed `Request`. `Cancelled` is delivered through this
/// channel rather than as a `QmidError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QmiResultCode {
    Success,
    Protocol(QmiErrorCode),
    Cancelled,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("device read reached end of file")]
    Eof,
    #[error("device write failed: {0}")]
    Write(String),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}

#[derive(Debug, Error)]
pub enum FsmError {
    #[error("retry budget exhausted in state {state}")]
    RetriesExhausted { state: &'static str },
    #[error("unexpected event {event} in state {state}")]
    UnexpectedEvent { state: &'static str, event: &'static str },
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("transaction id space exhausted for service {0:?}")]
    TidExhausted(crate::codec::ServiceId),
    #[error("no such modem: {0}")]
    NoSuchModem(String),
    #[error("modem already exists: {0}")]
    ModemExists(String),
    #[error("missing prerequisite: {0}")]
    MissingPrerequisite(&'static str),
}

#[derive(Debug, Error)]
pub enum QmidError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("protocol error: {0:?}")]
    Protocol(QmiErrorCode),
    #[error("fsm error: {0}")]
    Fsm(#[from] FsmError),
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
}

pub type Result<T> = std::result::Result<T, QmidError>;
