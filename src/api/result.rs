//! Result envelope returned by every API call.
//!
//! Wire form: `{"code": <int>, "message"?: <string>, "data"?: <any>}`.
//! Handlers complete a result with [`ApiResult::ok`] or
//! [`ApiResult::error`]; nothing else writes the envelope.

use serde::ser::{Serialize, Serializer};
use serde_json::Value;

use crate::error::Error;

/// API result codes. Numeric values are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ApiCode {
    Ok = 0,
    InvalidArg = 1,
    NotFound = 2,
    Forbidden = 3,
    Busy = 4,
    Timeout = 5,
    NoMem = 6,
    Internal = 7,
    NotSupported = 8,
    Hardware = 9,
    Unauthorized = 10,
    InvalidState = 11,
}

impl ApiCode {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::InvalidArg => "INVALID_ARG",
            Self::NotFound => "NOT_FOUND",
            Self::Forbidden => "FORBIDDEN",
            Self::Busy => "BUSY",
            Self::Timeout => "TIMEOUT",
            Self::NoMem => "NO_MEM",
            Self::Internal => "INTERNAL",
            Self::NotSupported => "NOT_SUPPORTED",
            Self::Hardware => "HARDWARE",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::InvalidState => "INVALID_STATE",
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Ok,
            1 => Self::InvalidArg,
            2 => Self::NotFound,
            3 => Self::Forbidden,
            4 => Self::Busy,
            5 => Self::Timeout,
            6 => Self::NoMem,
            7 => Self::Internal,
            8 => Self::NotSupported,
            9 => Self::Hardware,
            10 => Self::Unauthorized,
            11 => Self::InvalidState,
            _ => return None,
        })
    }
}

impl core::fmt::Display for ApiCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for ApiCode {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u8(self.code())
    }
}

/// Envelope filled by a handler.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ApiResult {
    code: ApiCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(skip)]
    completed: bool,
}

impl ApiResult {
    /// Fresh, not yet completed result (code `OK`, no data).
    pub fn new() -> Self {
        Self {
            code: ApiCode::Ok,
            message: None,
            data: None,
            completed: false,
        }
    }

    /// Complete with success and a payload.
    pub fn ok(&mut self, data: Value) {
        self.code = ApiCode::Ok;
        self.message = None;
        self.data = Some(data);
        self.completed = true;
    }

    /// Complete with an error code and message.
    pub fn error(&mut self, code: ApiCode, message: impl Into<String>) {
        self.code = code;
        self.message = Some(message.into());
        self.data = None;
        self.completed = true;
    }

    /// Complete from a control-plane error. `InvalidArg` carries its field
    /// message verbatim.
    pub fn fail(&mut self, e: Error) {
        let message = match e {
            Error::InvalidArg(msg) => msg.to_owned(),
            other => other.to_string(),
        };
        self.error(e.api_code(), message);
    }

    pub fn code(&self) -> ApiCode {
        self.code
    }

    pub fn is_ok(&self) -> bool {
        self.code == ApiCode::Ok
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    pub fn into_data(self) -> Option<Value> {
        self.data
    }

    /// Serialized envelope.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| format!("{{\"code\":{}}}", ApiCode::Internal.code()))
    }
}

impl Default for ApiResult {
    fn default() -> Self {
        Self::new()
    }
}
