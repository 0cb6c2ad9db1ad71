use std::collections::TryReserveError;
use std::fmt;
use std::io;

use thiserror::Error;

use crate::dsm::TreeError;

/// Result type used by the codecs and transports of this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Low-level errors raised by codecs and transports.
///
/// Backends translate these into a [`ClassifiedError`] before they reach a caller.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (socket, OS, etc.).
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A readiness wait or event wait ran out of time.
    #[error("timed out")]
    Timeout,

    /// The peer closed the connection or a read returned zero bytes.
    #[error("connection lost")]
    ConnectionLost,

    /// Peer responded with an unexpected or invalid message.
    #[error("protocol error: {0}")]
    Protocol(&'static str),

    /// Peer responded with an unexpected or invalid message.
    #[error("protocol error: {0}")]
    ProtocolOwned(String),

    /// TLS setup or handshake failure.
    #[error("tls error: {0}")]
    Tls(String),

    /// Pseudo-XML decoding or path lookup failure.
    #[error("tree decoder: {0}")]
    Tree(#[from] TreeError),

    /// The event API reported a non-zero condition.
    #[error("event api error: {}", crate::event::api_error_description(*.0))]
    Api(u32),

    /// Invalid caller-supplied argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A receive buffer could not be grown.
    #[error("cannot grow receive buffer: {0}")]
    Storage(#[from] TryReserveError),

    /// The peer asked for a receive buffer no larger than the current one.
    #[error("response buffer too small: {needed} bytes requested, {capacity} available")]
    BufferOverflow {
        /// Size the peer reported.
        needed: usize,
        /// Current buffer size.
        capacity: usize,
    },
}

impl Error {
    pub(crate) fn protocol_owned(msg: impl Into<String>) -> Self {
        Self::ProtocolOwned(msg.into())
    }
}

impl From<native_tls::Error> for Error {
    fn from(err: native_tls::Error) -> Self {
        Self::Tls(err.to_string())
    }
}

/// How serious a reported condition is.
///
/// Callers route `Ok` and `Warning` messages to standard output and the
/// rest to standard error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Severity {
    /// Informational.
    #[default]
    Ok,
    /// Completed, but something worth reporting happened.
    Warning,
    /// The step failed.
    Fatal,
    /// The server certificate could not be trusted.
    CertificateError,
}

/// The failure taxonomy shared by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No backend module for the declared server type.
    ModuleLoad,
    /// Connecting, sending or receiving failed.
    Connection,
    /// The endpoint rejected the credentials.
    Authentication,
    /// TLS peer certificate with no pinned fingerprint to compare against.
    CertificateUntrusted,
    /// TLS peer certificate does not match the pinned fingerprint.
    CertificateMismatch,
    /// The operator declined the presented certificate.
    CertificateRejected,
    /// Malformed, truncated or unexpected response.
    Protocol,
    /// The endpoint did not answer in time.
    Timeout,
    /// The parameter set was rejected before any I/O.
    Validation,
    /// A buffer could not be sized for the response.
    Storage,
    /// The loaded backend does not provide the requested operation.
    Unsupported,
    /// The endpoint reported a failure for the command.
    Command,
}

impl ErrorKind {
    /// Whether this kind belongs to the certificate family.
    ///
    /// Certificate failures are terminal and never trigger a login fallback.
    pub fn is_certificate(self) -> bool {
        matches!(
            self,
            Self::CertificateUntrusted | Self::CertificateMismatch | Self::CertificateRejected
        )
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::ModuleLoad => "module_load",
            Self::Connection => "connection",
            Self::Authentication => "authentication",
            Self::CertificateUntrusted => "certificate_untrusted",
            Self::CertificateMismatch => "certificate_mismatch",
            Self::CertificateRejected => "certificate_rejected",
            Self::Protocol => "protocol",
            Self::Timeout => "timeout",
            Self::Validation => "validation",
            Self::Storage => "storage",
            Self::Unsupported => "unsupported",
            Self::Command => "command",
        }
    }
}

/// Numeric result codes, used as process exit status by command-line callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ReturnCode {
    /// Unknown command-line parameter.
    UnknownParameter = 1,
    /// A parameter value is out of range or too long.
    InvalidParameterValue = 2,
    /// An option was given twice.
    DuplicateOption = 3,
    /// Options that cannot be combined.
    ConflictingOptions = 4,
    /// No image operation was requested.
    NoCommand = 5,
    /// Server address missing.
    MissingServer = 6,
    /// Image name missing.
    MissingImageName = 7,
    /// User id missing.
    MissingUserId = 8,
    /// Password missing.
    MissingPassword = 9,
    /// A configured image does not exist on the server.
    ServerImageMismatch = 10,
    /// The operation is limited to a single image.
    MoreThanOneImage = 22,
    /// Encrypted connection without a user name.
    NoUserName = 24,
    /// User name given for an unencrypted connection.
    UserNameEncryptionOff = 25,
    /// Backend module could not be resolved.
    LibLoadProblem = 30,
    /// The dialog worker could not be started.
    ForkProblem = 40,
    /// Console input failed.
    StdinProblem = 41,
    /// The event API reported a problem.
    HwmcaProblem = 50,
    /// A response did not fit the receive buffer.
    BufferOverflow = 60,
    /// Allocation failure.
    StorageProblem = 90,
    /// Internal error.
    InternalError = 99,
    /// Connection or server communication failure.
    ConnectionError = 100,
}

impl ReturnCode {
    /// Numeric value of the code.
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// A failure with its kind, numeric code, severity and accumulated messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedError {
    kind: ErrorKind,
    code: ReturnCode,
    severity: Severity,
    messages: Vec<String>,
}

impl ClassifiedError {
    /// Create a fatal error (certificate kinds get [`Severity::CertificateError`]).
    pub fn new(kind: ErrorKind, code: ReturnCode, message: impl Into<String>) -> Self {
        let severity = if kind.is_certificate() {
            Severity::CertificateError
        } else {
            Severity::Fatal
        };
        Self {
            kind,
            code,
            severity,
            messages: vec![message.into()],
        }
    }

    /// Build from a low-level error with an explicit result code.
    pub fn from_error(err: &Error, code: ReturnCode) -> Self {
        let kind = match err {
            Error::Io(_) | Error::ConnectionLost | Error::Tls(_) => ErrorKind::Connection,
            Error::Timeout => ErrorKind::Timeout,
            Error::Protocol(_) | Error::ProtocolOwned(_) | Error::Tree(_) => ErrorKind::Protocol,
            Error::Api(_) => ErrorKind::Command,
            Error::InvalidArgument(_) => ErrorKind::Validation,
            Error::Storage(_) => ErrorKind::Storage,
            Error::BufferOverflow { .. } => ErrorKind::Protocol,
        };
        Self::new(kind, code, err.to_string())
    }

    /// Append a message to the chain.
    pub fn push(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }

    /// Append a message and return `self`.
    pub fn context(mut self, message: impl Into<String>) -> Self {
        self.push(message);
        self
    }

    /// Prepend messages collected before this failure.
    pub(crate) fn preceded_by(mut self, earlier: Vec<String>) -> Self {
        let mut messages = earlier;
        messages.append(&mut self.messages);
        self.messages = messages;
        self
    }

    /// Taxonomy kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Numeric result code.
    pub fn code(&self) -> ReturnCode {
        self.code
    }

    /// Severity class.
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Diagnostic messages in the order they were produced.
    pub fn messages(&self) -> &[String] {
        &self.messages
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.messages.join("\n"))
    }
}

impl std::error::Error for ClassifiedError {}

impl From<Error> for ClassifiedError {
    fn from(err: Error) -> Self {
        let code = match &err {
            Error::Protocol(_) | Error::ProtocolOwned(_) | Error::Tree(_) => {
                ReturnCode::InternalError
            }
            Error::Api(_) => ReturnCode::HwmcaProblem,
            Error::InvalidArgument(_) => ReturnCode::InvalidParameterValue,
            Error::Storage(_) => ReturnCode::StorageProblem,
            Error::BufferOverflow { .. } => ReturnCode::BufferOverflow,
            _ => ReturnCode::ConnectionError,
        };
        Self::from_error(&err, code)
    }
}

/// The success value of a lifecycle step or image operation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Report {
    severity: Severity,
    messages: Vec<String>,
}

impl Report {
    /// An empty informational report.
    pub fn new() -> Self {
        Self::default()
    }

    /// An informational report with one message.
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Ok,
            messages: vec![message.into()],
        }
    }

    /// A warning report with one message.
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            messages: vec![message.into()],
        }
    }

    /// Append a message without changing severity.
    pub fn push(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }

    /// Raise severity to warning and append a message.
    pub fn warn(&mut self, message: impl Into<String>) {
        self.severity = Severity::Warning;
        self.messages.push(message.into());
    }

    /// Fold another report into this one.
    pub fn merge(&mut self, other: Report) {
        if other.severity == Severity::Warning {
            self.severity = Severity::Warning;
        }
        self.messages.extend(other.messages);
    }

    /// Severity class.
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Messages in the order they were produced.
    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    pub(crate) fn into_messages(self) -> Vec<String> {
        self.messages
    }
}

/// Collects validation findings; the last recorded code wins.
#[derive(Debug, Default)]
pub(crate) struct Findings {
    code: Option<ReturnCode>,
    messages: Vec<String>,
}

impl Findings {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail(&mut self, code: ReturnCode, message: impl Into<String>) {
        self.code = Some(code);
        self.messages.push(message.into());
    }

    pub(crate) fn into_result(self) -> std::result::Result<(), ClassifiedError> {
        let Some(code) = self.code else {
            return Ok(());
        };
        Err(ClassifiedError {
            kind: ErrorKind::Validation,
            code,
            severity: Severity::Fatal,
            messages: self.messages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn certificate_kinds_carry_certificate_severity() {
        let err = ClassifiedError::new(
            ErrorKind::CertificateMismatch,
            ReturnCode::ConnectionError,
            "fingerprints do not match",
        );
        assert_eq!(err.severity(), Severity::CertificateError);
        assert!(err.kind().is_certificate());

        let err = ClassifiedError::new(ErrorKind::Timeout, ReturnCode::ConnectionError, "late");
        assert_eq!(err.severity(), Severity::Fatal);
        assert!(!err.kind().is_certificate());
    }

    #[test]
    fn findings_keep_every_message_and_last_code() {
        let mut findings = Findings::new();
        findings.fail(ReturnCode::ConflictingOptions, "first");
        findings.fail(ReturnCode::InvalidParameterValue, "second");

        let err = findings.into_result().expect_err("expected failure");
        assert_eq!(err.code(), ReturnCode::InvalidParameterValue);
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.messages(), ["first", "second"]);
    }

    #[test]
    fn empty_findings_pass() {
        assert!(Findings::new().into_result().is_ok());
    }

    #[test]
    fn low_level_errors_map_to_kinds() {
        let err: ClassifiedError = Error::Timeout.into();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.code(), ReturnCode::ConnectionError);

        let err: ClassifiedError = Error::Protocol("short header").into();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(err.code(), ReturnCode::InternalError);
    }

    #[test]
    fn report_merge_raises_severity() {
        let mut report = Report::ok("a");
        report.merge(Report::warning("b"));
        assert_eq!(report.severity(), Severity::Warning);
        assert_eq!(report.messages(), ["a", "b"]);
    }
}
