use std::{error::Error, fmt};

use http::header::{HeaderMap, HeaderValue};
use percent_encoding::{percent_decode, percent_encode, AsciiSet, CONTROLS};
use tracing::{debug, trace, warn};

const GRPC_STATUS_HEADER_CODE: &str = "grpc-status";
const GRPC_STATUS_MESSAGE_HEADER: &str = "grpc-message";

/// The percent-encoding set for `grpc-message`: everything outside the
/// printable ASCII range plus `%` itself.
const ENCODING_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'%')
    .add(b'\x7f');

/// A "status" describing the result of an RPC.
#[derive(Clone)]
pub struct Status {
    /// The status code, carried in the `grpc-status` trailer.
    code: Code,
    /// A relevant error message, carried in the `grpc-message` trailer.
    message: String,
}

/// Status codes used by [`Status`].
///
/// This is the closed set defined by the protocol; unknown numeric values
/// decode as [`Code::Unknown`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Status {
    /// Create a new `Status` with the associated code and message.
    pub fn new(code: Code, message: impl Into<String>) -> Status {
        Status {
            code,
            message: message.into(),
        }
    }

    /// The operation completed successfully.
    pub fn ok() -> Status {
        Status::new(Code::Ok, "")
    }

    /// The operation was cancelled (typically by the caller).
    pub fn cancelled(message: impl Into<String>) -> Status {
        Status::new(Code::Cancelled, message)
    }

    /// Unknown error.
    pub fn unknown(message: impl Into<String>) -> Status {
        Status::new(Code::Unknown, message)
    }

    /// Client specified an invalid argument.
    pub fn invalid_argument(message: impl Into<String>) -> Status {
        Status::new(Code::InvalidArgument, message)
    }

    /// Deadline expired before the operation could complete.
    pub fn deadline_exceeded(message: impl Into<String>) -> Status {
        Status::new(Code::DeadlineExceeded, message)
    }

    /// The caller does not have permission to execute the operation.
    pub fn permission_denied(message: impl Into<String>) -> Status {
        Status::new(Code::PermissionDenied, message)
    }

    /// Some resource has been exhausted.
    pub fn resource_exhausted(message: impl Into<String>) -> Status {
        Status::new(Code::ResourceExhausted, message)
    }

    /// The system is not in a state required for the operation's execution.
    pub fn failed_precondition(message: impl Into<String>) -> Status {
        Status::new(Code::FailedPrecondition, message)
    }

    /// The operation is not implemented or not supported.
    pub fn unimplemented(message: impl Into<String>) -> Status {
        Status::new(Code::Unimplemented, message)
    }

    /// Internal invariant broken.
    pub fn internal(message: impl Into<String>) -> Status {
        Status::new(Code::Internal, message)
    }

    /// The service is currently unavailable.
    pub fn unavailable(message: impl Into<String>) -> Status {
        Status::new(Code::Unavailable, message)
    }

    /// Get the `Code` of this `Status`.
    pub fn code(&self) -> Code {
        self.code
    }

    /// Get the text error message of this `Status`.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the code is `Ok`.
    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }

    /// Extract a `Status` from an arbitrary error, walking the source chain,
    /// or fall back to `Unknown`.
    pub fn from_error(err: &(dyn Error + 'static)) -> Status {
        let mut cause = Some(err);
        while let Some(err) = cause {
            if let Some(status) = err.downcast_ref::<Status>() {
                return status.clone();
            }
            cause = err.source();
        }
        Status::new(Code::Unknown, err.to_string())
    }

    /// Rewrite a status produced by the control plane (resolver, LB policy,
    /// config selector) before it is surfaced to the application.
    ///
    /// The control plane is not allowed to fabricate data-plane codes; any
    /// status that is not already `Internal`, `Unavailable`,
    /// `ResourceExhausted` or `Unauthenticated` is re-coded `Internal` with
    /// the original code folded into the message.
    pub(crate) fn sanitize_control_plane(self) -> Status {
        match self.code {
            Code::Internal | Code::Unavailable | Code::ResourceExhausted | Code::Unauthenticated => {
                self
            }
            code => Status::new(
                Code::Internal,
                format!("control plane produced {:?}: {}", code, self.message),
            ),
        }
    }

    /// Build a transport-level error status: always `Unavailable`, naming the
    /// peer address and the underlying cause.
    pub(crate) fn from_transport_error(address: &str, cause: impl fmt::Display) -> Status {
        Status::new(
            Code::Unavailable,
            format!("transport error connecting to {address}: {cause}"),
        )
    }

    /// Decode a `Status` from a trailer (or headers-frame) map, if one is
    /// present.
    pub(crate) fn from_header_map(header_map: &HeaderMap) -> Option<Status> {
        header_map.get(GRPC_STATUS_HEADER_CODE).map(|code| {
            let code = Code::from_bytes(code.as_ref());
            let message = header_map
                .get(GRPC_STATUS_MESSAGE_HEADER)
                .map(|header| {
                    percent_decode(header.as_bytes())
                        .decode_utf8()
                        .map(|cow| cow.to_string())
                })
                .unwrap_or_else(|| Ok(String::new()));
            match message {
                Ok(message) => Status { code, message },
                Err(err) => {
                    warn!("error deserializing status message header: {}", err);
                    Status {
                        code: Code::Unknown,
                        message: format!("error deserializing status message header: {err}"),
                    }
                }
            }
        })
    }

    /// Encode this `Status` into `grpc-status` / `grpc-message` entries.
    pub(crate) fn add_header(&self, header_map: &mut HeaderMap) {
        header_map.insert(GRPC_STATUS_HEADER_CODE, self.code.to_header_value());

        if !self.message.is_empty() {
            let encoded = percent_encode(self.message.as_bytes(), ENCODING_SET).to_string();
            match HeaderValue::from_str(&encoded) {
                Ok(value) => {
                    header_map.insert(GRPC_STATUS_MESSAGE_HEADER, value);
                }
                Err(err) => {
                    debug!("invalid grpc-message header: {}", err);
                }
            }
        }
    }

    pub(crate) fn to_header_map(&self) -> HeaderMap {
        let mut header_map = HeaderMap::with_capacity(2);
        self.add_header(&mut header_map);
        header_map
    }
}

/// Take the `Status` from `trailers` if present, else infer one from the HTTP
/// response code.
pub(crate) fn infer_status(trailers: Option<&HeaderMap>, status_code: http::StatusCode) -> Status {
    if let Some(status) = trailers.and_then(Status::from_header_map) {
        return status;
    }
    trace!("trailers missing grpc-status");
    let code = match status_code {
        http::StatusCode::BAD_REQUEST => Code::Internal,
        http::StatusCode::UNAUTHORIZED => Code::Unauthenticated,
        http::StatusCode::FORBIDDEN => Code::PermissionDenied,
        http::StatusCode::NOT_FOUND => Code::Unimplemented,
        http::StatusCode::TOO_MANY_REQUESTS
        | http::StatusCode::BAD_GATEWAY
        | http::StatusCode::SERVICE_UNAVAILABLE
        | http::StatusCode::GATEWAY_TIMEOUT => Code::Unavailable,
        _ => Code::Unknown,
    };
    Status::new(
        code,
        format!(
            "grpc-status header missing, mapped from HTTP status code {}",
            status_code.as_u16(),
        ),
    )
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // A manual impl to reduce the noise of frequently empty fields.
        let mut builder = f.debug_struct("Status");
        builder.field("code", &self.code);
        if !self.message.is_empty() {
            builder.field("message", &self.message);
        }
        builder.finish()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "status: {:?}, message: {:?}",
            self.code(),
            self.message()
        )
    }
}

impl Error for Status {}

impl PartialEq for Status {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code && self.message == other.message
    }
}

// ===== impl Code =====

impl Code {
    /// Get the `Code` that represents the integer, if known.
    ///
    /// Unknown values map to `Code::Unknown`.
    pub fn from_i32(i: i32) -> Code {
        Code::from(i)
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Code {
        match bytes.len() {
            1 => match bytes[0] {
                b'0' => Code::Ok,
                b'1' => Code::Cancelled,
                b'2' => Code::Unknown,
                b'3' => Code::InvalidArgument,
                b'4' => Code::DeadlineExceeded,
                b'5' => Code::NotFound,
                b'6' => Code::AlreadyExists,
                b'7' => Code::PermissionDenied,
                b'8' => Code::ResourceExhausted,
                b'9' => Code::FailedPrecondition,
                _ => Code::parse_err(),
            },
            2 => match (bytes[0], bytes[1]) {
                (b'1', b'0') => Code::Aborted,
                (b'1', b'1') => Code::OutOfRange,
                (b'1', b'2') => Code::Unimplemented,
                (b'1', b'3') => Code::Internal,
                (b'1', b'4') => Code::Unavailable,
                (b'1', b'5') => Code::DataLoss,
                (b'1', b'6') => Code::Unauthenticated,
                _ => Code::parse_err(),
            },
            _ => Code::parse_err(),
        }
    }

    fn to_header_value(self) -> HeaderValue {
        match self {
            Code::Ok => HeaderValue::from_static("0"),
            Code::Cancelled => HeaderValue::from_static("1"),
            Code::Unknown => HeaderValue::from_static("2"),
            Code::InvalidArgument => HeaderValue::from_static("3"),
            Code::DeadlineExceeded => HeaderValue::from_static("4"),
            Code::NotFound => HeaderValue::from_static("5"),
            Code::AlreadyExists => HeaderValue::from_static("6"),
            Code::PermissionDenied => HeaderValue::from_static("7"),
            Code::ResourceExhausted => HeaderValue::from_static("8"),
            Code::FailedPrecondition => HeaderValue::from_static("9"),
            Code::Aborted => HeaderValue::from_static("10"),
            Code::OutOfRange => HeaderValue::from_static("11"),
            Code::Unimplemented => HeaderValue::from_static("12"),
            Code::Internal => HeaderValue::from_static("13"),
            Code::Unavailable => HeaderValue::from_static("14"),
            Code::DataLoss => HeaderValue::from_static("15"),
            Code::Unauthenticated => HeaderValue::from_static("16"),
        }
    }

    fn parse_err() -> Code {
        trace!("error parsing grpc-status");
        Code::Unknown
    }
}

impl From<i32> for Code {
    fn from(i: i32) -> Self {
        match i {
            0 => Code::Ok,
            1 => Code::Cancelled,
            2 => Code::Unknown,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            6 => Code::AlreadyExists,
            7 => Code::PermissionDenied,
            8 => Code::ResourceExhausted,
            9 => Code::FailedPrecondition,
            10 => Code::Aborted,
            11 => Code::OutOfRange,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            15 => Code::DataLoss,
            16 => Code::Unauthenticated,
            _ => Code::Unknown,
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Nested(crate::Error);

    impl fmt::Display for Nested {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "nested error: {}", self.0)
        }
    }

    impl Error for Nested {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            Some(&*self.0)
        }
    }

    #[test]
    fn from_error_status() {
        let orig = Status::new(Code::OutOfRange, "weeaboo");
        let found = Status::from_error(&orig);

        assert_eq!(orig.code(), found.code());
        assert_eq!(orig.message(), found.message());
    }

    #[test]
    fn from_error_nested() {
        let orig = Nested(Box::new(Status::new(Code::OutOfRange, "weeaboo")));
        let found = Status::from_error(&orig);

        assert_eq!(found.code(), Code::OutOfRange);
        assert_eq!(found.message(), "weeaboo");
    }

    #[test]
    fn code_from_i32() {
        // This for loop should catch if we ever add a new variant and don't
        // update From<i32>.
        for i in 0..=16 {
            let code = Code::from(i);
            assert_eq!(
                i, code as i32,
                "Code::from({}) returned {:?} which is {}",
                i, code, code as i32,
            );
        }

        assert_eq!(Code::from(-1), Code::Unknown);
        assert_eq!(Code::from(17), Code::Unknown);
    }

    #[test]
    fn trailer_round_trip() {
        let status = Status::new(Code::ResourceExhausted, "out of quota: 100%");
        let map = status.to_header_map();
        let decoded = Status::from_header_map(&map).unwrap();
        assert_eq!(decoded.code(), Code::ResourceExhausted);
        assert_eq!(decoded.message(), "out of quota: 100%");
    }

    #[test]
    fn control_plane_codes_are_rewritten() {
        let s = Status::new(Code::NotFound, "no such cluster").sanitize_control_plane();
        assert_eq!(s.code(), Code::Internal);
        assert!(s.message().contains("NotFound"));

        let s = Status::unavailable("resolver down").sanitize_control_plane();
        assert_eq!(s.code(), Code::Unavailable);
    }

    #[test]
    fn infer_from_http_code() {
        let s = infer_status(None, http::StatusCode::NOT_FOUND);
        assert_eq!(s.code(), Code::Unimplemented);
        let ok = Status::ok().to_header_map();
        assert!(infer_status(Some(&ok), http::StatusCode::OK).is_ok());
    }
}
