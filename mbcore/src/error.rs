use core::fmt;

/// Core error kinds, independent of any particular subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    Failed,
    Cancelled,
    Aborted,
    Unsupported,
    NoPlugins,
    Unauthorized,
    InvalidArguments,
    InProgress,
    WrongState,
    Connected,
    TooMany,
    NotFound,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Failed => f.write_str("operation failed"),
            CoreError::Cancelled => f.write_str("operation cancelled"),
            CoreError::Aborted => f.write_str("operation aborted"),
            CoreError::Unsupported => f.write_str("operation unsupported"),
            CoreError::NoPlugins => f.write_str("no plugins available"),
            CoreError::Unauthorized => f.write_str("unauthorized"),
            CoreError::InvalidArguments => f.write_str("invalid arguments"),
            CoreError::InProgress => f.write_str("operation already in progress"),
            CoreError::WrongState => f.write_str("wrong state for operation"),
            CoreError::Connected => f.write_str("port is connected"),
            CoreError::TooMany => f.write_str("too many"),
            CoreError::NotFound => f.write_str("not found"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for CoreError {}

/// Errors raised by the serial port engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialError {
    Unknown,
    OpenFailed,
    SendFailed,
    ResponseTimeout,
    OpenFailedNoDevice,
    FlashFailed,
    NotOpen,
    ParseFailed,
}

impl fmt::Display for SerialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerialError::Unknown => f.write_str("unknown serial error"),
            SerialError::OpenFailed => f.write_str("failed to open serial port"),
            SerialError::SendFailed => f.write_str("failed to send to serial port"),
            SerialError::ResponseTimeout => f.write_str("timed out waiting for response"),
            SerialError::OpenFailedNoDevice => f.write_str("no such device"),
            SerialError::FlashFailed => f.write_str("flash operation failed"),
            SerialError::NotOpen => f.write_str("port is not open"),
            SerialError::ParseFailed => f.write_str("failed to parse response"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for SerialError {}

/// V.25 connection-result errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    Unknown,
    NoCarrier,
    NoDialtone,
    Busy,
    NoAnswer,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Unknown => f.write_str("unknown connection error"),
            ConnectionError::NoCarrier => f.write_str("no carrier"),
            ConnectionError::NoDialtone => f.write_str("no dialtone"),
            ConnectionError::Busy => f.write_str("busy"),
            ConnectionError::NoAnswer => f.write_str("no answer"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ConnectionError {}

/// 3GPP TS 27.005 §3.2.5 message (SMS stack) errors, by numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageError(pub u16);

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "message error {}", self.0)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for MessageError {}

/// 3GPP TS 27.007 mobile-equipment errors. Two subranges: general and GPRS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MobileEquipmentError {
    General(u16),
    Gprs(u16),
}

impl fmt::Display for MobileEquipmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MobileEquipmentError::General(code) => write!(f, "mobile equipment error {code}"),
            MobileEquipmentError::Gprs(code) => write!(f, "GPRS mobile equipment error {code}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for MobileEquipmentError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CdmaActivationError(pub u16);

impl fmt::Display for CdmaActivationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CDMA activation error {}", self.0)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for CdmaActivationError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkRejectionError(pub u16);

impl fmt::Display for NetworkRejectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "network rejection error {}", self.0)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for NetworkRejectionError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BearerIpFamilyError(pub u16);

impl fmt::Display for BearerIpFamilyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bearer IP family error {}", self.0)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for BearerIpFamilyError {}

/// The unified error type returned across the crate's public API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Core(CoreError),
    Serial(SerialError),
    Connection(ConnectionError),
    Message(MessageError),
    MobileEquipment(MobileEquipmentError),
    CdmaActivation(CdmaActivationError),
    NetworkRejection(NetworkRejectionError),
    BearerIpFamily(BearerIpFamilyError),
    /// An error from an external collaborator (I/O, device path, etc.),
    /// carrying a human-readable message since the underlying type (e.g.
    /// `io::Error`) is not `Clone`/`Eq`.
    External(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Core(e) => write!(f, "{e}"),
            Error::Serial(e) => write!(f, "{e}"),
            Error::Connection(e) => write!(f, "{e}"),
            Error::Message(e) => write!(f, "{e}"),
            Error::MobileEquipment(e) => write!(f, "{e}"),
            Error::CdmaActivation(e) => write!(f, "{e}"),
            Error::NetworkRejection(e) => write!(f, "{e}"),
            Error::BearerIpFamily(e) => write!(f, "{e}"),
            Error::External(msg) => f.write_str(msg),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

impl From<CoreError> for Error {
    fn from(e: CoreError) -> Self {
        Error::Core(e)
    }
}

impl From<SerialError> for Error {
    fn from(e: SerialError) -> Self {
        Error::Serial(e)
    }
}

impl From<ConnectionError> for Error {
    fn from(e: ConnectionError) -> Self {
        Error::Connection(e)
    }
}

impl From<MessageError> for Error {
    fn from(e: MessageError) -> Self {
        Error::Message(e)
    }
}

impl From<MobileEquipmentError> for Error {
    fn from(e: MobileEquipmentError) -> Self {
        Error::MobileEquipment(e)
    }
}

impl From<CdmaActivationError> for Error {
    fn from(e: CdmaActivationError) -> Self {
        Error::CdmaActivation(e)
    }
}

impl From<NetworkRejectionError> for Error {
    fn from(e: NetworkRejectionError) -> Self {
        Error::NetworkRejection(e)
    }
}

impl From<BearerIpFamilyError> for Error {
    fn from(e: BearerIpFamilyError) -> Self {
        Error::BearerIpFamily(e)
    }
}

#[cfg(feature = "std")]
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::External(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_each_kind() {
        assert_eq!(Error::from(CoreError::NotFound).to_string(), "not found");
        assert_eq!(
            Error::from(SerialError::ResponseTimeout).to_string(),
            "timed out waiting for response"
        );
        assert_eq!(
            Error::from(ConnectionError::NoCarrier).to_string(),
            "no carrier"
        );
    }

    #[test]
    fn wraps_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::External(_)));
    }
}
