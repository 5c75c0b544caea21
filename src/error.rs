//! Error taxonomy shared by the volume and export domains.
//!
//! Domain code raises only these variants; the front-ends translate them into
//! their own status vocabularies through the fixed tables below (gRPC for the
//! CSI surface, HTTP for the management surface).

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the volume domain, the export manager, and the command
/// runner underneath them.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or missing input
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Referenced entity absent
    #[error("not found: {0}")]
    NotFound(String),

    /// Conflicting entity present
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Deletion blocked by active dependents
    #[error("in use: {0}")]
    AlreadyInUse(String),

    /// Unsupported option, e.g. an unavailable filesystem tool
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// External command exceeded its deadline
    #[error("timed out: {0}")]
    TimedOut(String),

    /// Invariant violation, e.g. a malformed continuation token
    #[error("aborted: {0}")]
    Aborted(String),

    /// External tool returned non-zero for an unrecognized reason
    #[error("command failed ({command}, exit {code}): {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    /// Anything else, including unclassified upstream errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Status code for the management HTTP surface.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::InvalidArgument(_) => 400,
            Error::NotFound(_) => 404,
            Error::AlreadyExists(_) => 409,
            Error::AlreadyInUse(_) => 409,
            Error::NotImplemented(_) => 501,
            Error::TimedOut(_) => 500,
            Error::Aborted(_) => 500,
            Error::CommandFailed { .. } => 500,
            Error::Internal(_) => 500,
        }
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        let msg = err.to_string();
        match err {
            Error::InvalidArgument(_) => tonic::Status::invalid_argument(msg),
            Error::NotFound(_) => tonic::Status::not_found(msg),
            // A busy target is reported the same way a duplicate would be,
            // matching the management surface.
            Error::AlreadyExists(_) | Error::AlreadyInUse(_) => {
                tonic::Status::already_exists(msg)
            }
            Error::NotImplemented(_) => tonic::Status::unimplemented(msg),
            Error::TimedOut(_) => tonic::Status::deadline_exceeded(msg),
            Error::Aborted(_) => tonic::Status::aborted(msg),
            Error::CommandFailed { .. } | Error::Internal(_) => tonic::Status::internal(msg),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(err.to_string()),
            std::io::ErrorKind::AlreadyExists => Error::AlreadyExists(err.to_string()),
            std::io::ErrorKind::TimedOut => Error::TimedOut(err.to_string()),
            _ => Error::Internal(err.to_string()),
        }
    }
}

/// Translate an upstream HTTP status code into a gRPC code.
///
/// Used when this plugin fronts a remote management endpoint instead of the
/// in-process domain layers; kept with the taxonomy so all status mapping
/// lives in one place.
pub fn grpc_code_for_http(status: u16) -> tonic::Code {
    match status {
        400 => tonic::Code::InvalidArgument,
        401 => tonic::Code::Unauthenticated,
        403 => tonic::Code::PermissionDenied,
        404 => tonic::Code::NotFound,
        408 => tonic::Code::DeadlineExceeded,
        409 => tonic::Code::AlreadyExists,
        429 => tonic::Code::ResourceExhausted,
        499 => tonic::Code::Cancelled,
        500 => tonic::Code::Internal,
        501 => tonic::Code::Unimplemented,
        503 => tonic::Code::Unavailable,
        504 => tonic::Code::DeadlineExceeded,
        _ => tonic::Code::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grpc_mapping() {
        let status: tonic::Status = Error::NotFound("vol01".into()).into();
        assert_eq!(status.code(), tonic::Code::NotFound);

        let status: tonic::Status = Error::TimedOut("lvs".into()).into();
        assert_eq!(status.code(), tonic::Code::DeadlineExceeded);

        let status: tonic::Status = Error::AlreadyInUse("client connected".into()).into();
        assert_eq!(status.code(), tonic::Code::AlreadyExists);

        let status: tonic::Status = Error::Aborted("bad token".into()).into();
        assert_eq!(status.code(), tonic::Code::Aborted);

        let status: tonic::Status = Error::CommandFailed {
            command: "lvcreate".into(),
            code: 5,
            stderr: "boom".into(),
        }
        .into();
        assert_eq!(status.code(), tonic::Code::Internal);
    }

    #[test]
    fn test_http_mapping() {
        assert_eq!(Error::InvalidArgument("x".into()).http_status(), 400);
        assert_eq!(Error::NotFound("x".into()).http_status(), 404);
        assert_eq!(Error::AlreadyExists("x".into()).http_status(), 409);
        assert_eq!(Error::AlreadyInUse("x".into()).http_status(), 409);
        assert_eq!(Error::NotImplemented("x".into()).http_status(), 501);
        assert_eq!(Error::TimedOut("x".into()).http_status(), 500);
    }

    #[test]
    fn test_upstream_http_table() {
        assert_eq!(grpc_code_for_http(400), tonic::Code::InvalidArgument);
        assert_eq!(grpc_code_for_http(401), tonic::Code::Unauthenticated);
        assert_eq!(grpc_code_for_http(403), tonic::Code::PermissionDenied);
        assert_eq!(grpc_code_for_http(404), tonic::Code::NotFound);
        assert_eq!(grpc_code_for_http(408), tonic::Code::DeadlineExceeded);
        assert_eq!(grpc_code_for_http(409), tonic::Code::AlreadyExists);
        assert_eq!(grpc_code_for_http(429), tonic::Code::ResourceExhausted);
        assert_eq!(grpc_code_for_http(499), tonic::Code::Cancelled);
        assert_eq!(grpc_code_for_http(503), tonic::Code::Unavailable);
        assert_eq!(grpc_code_for_http(504), tonic::Code::DeadlineExceeded);
        assert_eq!(grpc_code_for_http(418), tonic::Code::Unknown);
    }
}
