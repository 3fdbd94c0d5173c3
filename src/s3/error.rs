use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};

use crate::transfer::BackendError;

/// Error codes that mean the object, bucket or upload does not exist
const NOT_FOUND_CODES: &[&str] = &["NoSuchKey", "NoSuchBucket", "NoSuchUpload", "NotFound"];

/// Error codes worth retrying even when the status code alone would not say so
const TRANSIENT_CODES: &[&str] = &[
    "SlowDown",
    "RequestTimeout",
    "InternalError",
    "ServiceUnavailable",
    "Throttling",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    NotFound,
    Transient,
    Permanent,
}

fn classify_response(status: u16, code: Option<&str>) -> Kind {
    if status == 404 || code.is_some_and(|c| NOT_FOUND_CODES.contains(&c)) {
        Kind::NotFound
    } else if status == 429
        || (500..=599).contains(&status)
        || code.is_some_and(|c| TRANSIENT_CODES.contains(&c))
    {
        Kind::Transient
    } else {
        Kind::Permanent
    }
}

/// Map an SDK error onto the engine's retry classes.
///
/// Timeouts, connection failures and unparseable responses are transient;
/// service errors are sorted by status code and S3 error code.
pub fn classify<E>(err: SdkError<E, HttpResponse>, bucket: &str, key: &str) -> BackendError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let kind = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            Kind::Transient
        }
        SdkError::ServiceError(service) => {
            classify_response(service.raw().status().as_u16(), service.err().code())
        }
        _ => Kind::Permanent,
    };

    match kind {
        Kind::NotFound => BackendError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        },
        Kind::Transient => BackendError::Transient(DisplayErrorContext(&err).to_string()),
        Kind::Permanent => BackendError::Permanent(DisplayErrorContext(&err).to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::operation::get_object::GetObjectError;

    #[test]
    fn test_not_found() {
        assert_eq!(classify_response(404, None), Kind::NotFound);
        assert_eq!(classify_response(400, Some("NoSuchUpload")), Kind::NotFound);
        assert_eq!(classify_response(404, Some("NoSuchKey")), Kind::NotFound);
    }

    #[test]
    fn test_transient() {
        assert_eq!(classify_response(500, None), Kind::Transient);
        assert_eq!(classify_response(503, Some("SlowDown")), Kind::Transient);
        assert_eq!(classify_response(429, None), Kind::Transient);
        assert_eq!(classify_response(400, Some("RequestTimeout")), Kind::Transient);
    }

    #[test]
    fn test_permanent() {
        assert_eq!(classify_response(403, Some("AccessDenied")), Kind::Permanent);
        assert_eq!(classify_response(416, Some("InvalidRange")), Kind::Permanent);
        assert_eq!(classify_response(400, None), Kind::Permanent);
    }

    #[test]
    fn test_timeout_is_transient() {
        let err: SdkError<GetObjectError, HttpResponse> = SdkError::timeout_error("read timed out");
        assert!(classify(err, "bucket", "key").is_transient());
    }
}
