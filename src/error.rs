// MIT License - Copyright (c) 2026 initialed85

use std::fmt;

/// Error codes returned inside a reply frame by device firmware.
///
/// The code sits at header offset 0x22 as a little-endian signed short;
/// zero means success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareErrorCode {
    /// -1 - Authentication failed
    AuthenticationFailed,
    /// -2 - You have been logged out
    LoggedOut,
    /// -3 - The device is offline
    DeviceOffline,
    /// -4 - Command not supported
    CommandNotSupported,
    /// -5 - The device storage is full
    StorageFull,
    /// -6 - Structure is abnormal
    StructureAbnormal,
    /// -7 - Control key is expired
    ControlKeyExpired,
    /// -8 - Send error
    SendError,
    /// -9 - Write error
    WriteError,
    /// -10 - Read error
    ReadError,
    /// -11 - SSID could not be found in AP configuration
    SsidNotFound,
    /// Any code the firmware table does not name.
    Unknown(i16),
}

impl FirmwareErrorCode {
    /// Map a raw wire code to its variant. Zero is success and has no variant;
    /// callers check for it before constructing one of these.
    pub fn from_code(code: i16) -> Self {
        match code {
            -1 => Self::AuthenticationFailed,
            -2 => Self::LoggedOut,
            -3 => Self::DeviceOffline,
            -4 => Self::CommandNotSupported,
            -5 => Self::StorageFull,
            -6 => Self::StructureAbnormal,
            -7 => Self::ControlKeyExpired,
            -8 => Self::SendError,
            -9 => Self::WriteError,
            -10 => Self::ReadError,
            -11 => Self::SsidNotFound,
            other => Self::Unknown(other),
        }
    }

    /// The raw wire value.
    pub fn code(&self) -> i16 {
        match self {
            Self::AuthenticationFailed => -1,
            Self::LoggedOut => -2,
            Self::DeviceOffline => -3,
            Self::CommandNotSupported => -4,
            Self::StorageFull => -5,
            Self::StructureAbnormal => -6,
            Self::ControlKeyExpired => -7,
            Self::SendError => -8,
            Self::WriteError => -9,
            Self::ReadError => -10,
            Self::SsidNotFound => -11,
            Self::Unknown(code) => *code,
        }
    }

    /// Human-readable description of the error code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed => "Authentication failed",
            Self::LoggedOut => "You have been logged out",
            Self::DeviceOffline => "The device is offline",
            Self::CommandNotSupported => "Command not supported",
            Self::StorageFull => "The device storage is full",
            Self::StructureAbnormal => "Structure is abnormal",
            Self::ControlKeyExpired => "Control key is expired",
            Self::SendError => "Send error",
            Self::WriteError => "Write error",
            Self::ReadError => "Read error",
            Self::SsidNotFound => "SSID could not be found in AP configuration",
            Self::Unknown(_) => "Unknown error",
        }
    }
}

impl fmt::Display for FirmwareErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.description())
    }
}

/// All errors that can occur in the broadlink-lan-bridge library.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("call timed out waiting for a reply after {timeout:?}")]
    CallTimeout { timeout: std::time::Duration },

    #[error("transport has been shut down")]
    Shutdown,

    #[error("outgoing request queue unexpectedly full")]
    QueueFull,

    #[error("device firmware error: {0}")]
    Firmware(FirmwareErrorCode),

    #[error("reply too short: need {need} bytes, got {got}")]
    ShortReply { need: usize, got: usize },

    #[error("ciphertext shorter than one AES block ({0} bytes)")]
    ShortCiphertext(usize),

    #[error("AES key must be 16 bytes, got {len}")]
    InvalidKey { len: usize },

    #[error("not authenticated; call auth() first")]
    NotAuthenticated,

    #[error("session key failed self-test")]
    KeySelfTest,

    #[error("no device known for {wanted}; known: {known}")]
    DeviceNotFound { wanted: String, known: String },

    #[error("reply channel closed")]
    ChannelClosed,

    #[error("gave up restarting the transport after {attempts} attempts")]
    RestartsExhausted { attempts: u32 },

    #[error("invalid hardware address: {0:?}")]
    InvalidHardwareAddr(String),

    #[error("timed out after {timeout:?} waiting to receive an IR code")]
    LearnTimeout { timeout: std::time::Duration },
}

impl BridgeError {
    /// Whether this error is transient and the operation may succeed on retry
    /// (possibly after a re-auth or a transport restart).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::Io(_)
                | BridgeError::CallTimeout { .. }
                | BridgeError::Shutdown
                | BridgeError::QueueFull
                | BridgeError::ChannelClosed
                | BridgeError::NotAuthenticated
        )
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_firmware_code_round_trip() {
        for code in -11..=-1 {
            let parsed = FirmwareErrorCode::from_code(code);
            assert_eq!(parsed.code(), code);
            assert!(!matches!(parsed, FirmwareErrorCode::Unknown(_)));
        }
    }

    #[test]
    fn test_firmware_code_unknown() {
        let parsed = FirmwareErrorCode::from_code(-42);
        assert_eq!(parsed, FirmwareErrorCode::Unknown(-42));
        assert_eq!(parsed.code(), -42);
        assert_eq!(parsed.description(), "Unknown error");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(BridgeError::CallTimeout {
            timeout: std::time::Duration::from_secs(1)
        }
        .is_retryable());
        assert!(BridgeError::NotAuthenticated.is_retryable());
        assert!(!BridgeError::Firmware(FirmwareErrorCode::CommandNotSupported).is_retryable());
        assert!(!BridgeError::KeySelfTest.is_retryable());
    }
}
