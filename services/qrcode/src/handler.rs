//! Request handling for QR code generation.
//!
//! A request is validated, rendered, uploaded, presigned and indexed, strictly
//! in that order. The first failing step aborts the rest; nothing already
//! written is rolled back.

use crate::encoder::ImageEncoder;
use crate::metadata_store::{MetadataStore, QrCodeRecord};
use crate::object_store::{s3_uri, ObjectStore};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

pub const PNG_CONTENT_TYPE: &str = "image/png";
pub const SUCCESS_MESSAGE: &str = "QR code generated successfully";
pub const FAILURE_MESSAGE: &str = "Error generating QR code";

const MAX_FILENAME_BYTES: usize = 255;

/// Errors surfaced to the caller
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("{0}")]
    MissingParameter(&'static str),

    #[error("{0}")]
    InvalidParameter(&'static str),

    #[error("{0}")]
    Internal(String),
}

impl HandlerError {
    pub fn status_code(&self) -> u16 {
        match self {
            HandlerError::MissingParameter(_) | HandlerError::InvalidParameter(_) => 400,
            HandlerError::Internal(_) => 500,
        }
    }

    fn internal(e: impl std::fmt::Display) -> Self {
        HandlerError::Internal(e.to_string())
    }

    /// Caller sees the root cause; the context chain goes to the log
    fn collaborator(e: anyhow::Error) -> Self {
        error!(error = %format!("{:#}", e), "Collaborator call failed");
        HandlerError::Internal(e.root_cause().to_string())
    }
}

/// Incoming invocation payload
///
/// Fields holding anything other than a JSON string count as missing, so
/// the required-field checks always run in their fixed order.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrCodeRequest {
    #[serde(default, deserialize_with = "string_or_missing")]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "string_or_missing")]
    pub bucket: Option<String>,
    #[serde(default, deserialize_with = "string_or_missing")]
    pub table_name: Option<String>,
    #[serde(default, deserialize_with = "string_or_missing")]
    pub filename: Option<String>,
}

fn string_or_missing<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(Some(s)),
        _ => Ok(None),
    }
}

/// Successful generation result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrCodeResponse {
    pub message: String,
    pub id: Uuid,
    pub s3_uri: String,
    pub presigned_url: String,
    pub url: String,
    pub created_at: String,
}

/// Error body; `error` is only present for internal failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&HandlerError> for ErrorBody {
    fn from(e: &HandlerError) -> Self {
        match e {
            HandlerError::MissingParameter(msg) | HandlerError::InvalidParameter(msg) => Self {
                message: (*msg).to_string(),
                error: None,
            },
            HandlerError::Internal(detail) => Self {
                message: FAILURE_MESSAGE.to_string(),
                error: Some(detail.clone()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseBody {
    Success(QrCodeResponse),
    Error(ErrorBody),
}

/// Status code plus JSON body, independent of the transport
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationResponse {
    pub status_code: u16,
    pub body: ResponseBody,
}

/// Serverless-style envelope with the body serialized as a string
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationEnvelope {
    pub status_code: u16,
    pub body: String,
}

impl InvocationResponse {
    pub fn success(response: QrCodeResponse) -> Self {
        Self {
            status_code: 200,
            body: ResponseBody::Success(response),
        }
    }

    pub fn from_error(e: &HandlerError) -> Self {
        Self {
            status_code: e.status_code(),
            body: ResponseBody::Error(e.into()),
        }
    }

    pub fn into_envelope(self) -> serde_json::Result<InvocationEnvelope> {
        Ok(InvocationEnvelope {
            status_code: self.status_code,
            body: serde_json::to_string(&self.body)?,
        })
    }
}

/// Request after validation, with the object filename resolved
#[derive(Debug, Clone, PartialEq)]
struct ValidatedRequest {
    url: String,
    bucket: String,
    table: String,
    filename: String,
}

fn required(value: Option<String>, message: &'static str) -> Result<String, HandlerError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or(HandlerError::MissingParameter(message))
}

impl QrCodeRequest {
    /// Check required fields in order (url, bucket, table) and resolve the filename
    fn validate(self, now: DateTime<Utc>) -> Result<ValidatedRequest, HandlerError> {
        let url = required(self.url, "URL is required")?;
        let bucket = required(self.bucket, "S3 bucket name is required")?;
        let table = required(self.table_name, "DynamoDB table name is required")?;

        let filename = match self.filename.filter(|f| !f.is_empty()) {
            Some(name) => {
                validate_filename(&name)?;
                name
            }
            None => derive_filename(now),
        };

        Ok(ValidatedRequest {
            url,
            bucket,
            table,
            filename,
        })
    }
}

/// ISO-8601 UTC with millisecond precision, e.g. `2024-01-15T10:30:45.123Z`
pub fn iso_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// `qrcode-<timestamp>.png` with `:` and `.` in the timestamp replaced by `-`
pub fn derive_filename(at: DateTime<Utc>) -> String {
    let timestamp = iso_timestamp(at).replace([':', '.'], "-");
    format!("qrcode-{}.png", timestamp)
}

/// Reject names that would escape the key prefix or are unusable as object keys
pub fn validate_filename(name: &str) -> Result<(), HandlerError> {
    let invalid = name == "."
        || name == ".."
        || name.len() > MAX_FILENAME_BYTES
        || name.chars().any(|c| c == '/' || c == '\\' || c.is_control());

    if invalid {
        Err(HandlerError::InvalidParameter("Invalid filename"))
    } else {
        Ok(())
    }
}

/// Runs the generate, upload, presign and index sequence
pub struct QrCodeHandler {
    encoder: Arc<dyn ImageEncoder>,
    object_store: Arc<dyn ObjectStore>,
    metadata_store: Arc<dyn MetadataStore>,
    key_prefix: String,
    presigned_url_expiry: Duration,
}

impl QrCodeHandler {
    pub fn new(
        encoder: Arc<dyn ImageEncoder>,
        object_store: Arc<dyn ObjectStore>,
        metadata_store: Arc<dyn MetadataStore>,
        key_prefix: impl Into<String>,
        presigned_url_expiry: Duration,
    ) -> Self {
        Self {
            encoder,
            object_store,
            metadata_store,
            key_prefix: key_prefix.into(),
            presigned_url_expiry,
        }
    }

    fn object_key(&self, filename: &str) -> String {
        let prefix = self.key_prefix.trim_end_matches('/');
        if prefix.is_empty() {
            filename.to_string()
        } else {
            format!("{}/{}", prefix, filename)
        }
    }

    /// Handle one invocation, translating every outcome into a response
    pub async fn handle(&self, request: QrCodeRequest) -> InvocationResponse {
        match self.generate(request).await {
            Ok(response) => {
                metrics::counter!("qrcode.requests.succeeded").increment(1);
                InvocationResponse::success(response)
            }
            Err(e @ HandlerError::Internal(_)) => {
                error!(error = %e, "Error generating QR code");
                metrics::counter!("qrcode.requests.failed").increment(1);
                InvocationResponse::from_error(&e)
            }
            Err(e) => {
                warn!(reason = %e, "Rejected QR code request");
                metrics::counter!("qrcode.requests.rejected").increment(1);
                InvocationResponse::from_error(&e)
            }
        }
    }

    /// Validate, render, upload, presign and index
    #[instrument(skip(self, request))]
    pub async fn generate(&self, request: QrCodeRequest) -> Result<QrCodeResponse, HandlerError> {
        let request = request.validate(Utc::now())?;
        let key = self.object_key(&request.filename);

        let started = Instant::now();
        let png = self
            .encoder
            .encode(&request.url)
            .map_err(HandlerError::internal)?;
        metrics::histogram!("qrcode.encode.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        let size_bytes = png.len();
        self.object_store
            .put_object(&request.bucket, &key, png, PNG_CONTENT_TYPE)
            .await
            .map_err(HandlerError::collaborator)?;
        metrics::counter!("qrcode.bytes.uploaded").increment(size_bytes as u64);

        let presigned_url = self
            .object_store
            .presigned_get_url(&request.bucket, &key, self.presigned_url_expiry)
            .await
            .map_err(HandlerError::collaborator)?;

        let record = QrCodeRecord {
            id: Uuid::new_v4(),
            url: request.url,
            s3_uri: s3_uri(&request.bucket, &key),
            created_at: iso_timestamp(Utc::now()),
        };

        self.metadata_store
            .put_record(&request.table, &record)
            .await
            .map_err(HandlerError::collaborator)?;

        info!(
            id = %record.id,
            s3_uri = %record.s3_uri,
            size_bytes = size_bytes,
            "QR code generated"
        );

        Ok(QrCodeResponse {
            message: SUCCESS_MESSAGE.to_string(),
            id: record.id,
            s3_uri: record.s3_uri,
            presigned_url,
            url: record.url,
            created_at: record.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{EncodeError, MockImageEncoder, QrPngEncoder};
    use crate::metadata_store::MockMetadataStore;
    use crate::object_store::MockObjectStore;
    use chrono::TimeZone;
    use std::sync::Mutex;

    const EXPIRY: Duration = Duration::from_secs(3600);

    fn request(url: &str, bucket: &str, table: &str, filename: Option<&str>) -> QrCodeRequest {
        QrCodeRequest {
            url: Some(url.to_string()),
            bucket: Some(bucket.to_string()),
            table_name: Some(table.to_string()),
            filename: filename.map(String::from),
        }
    }

    fn handler(
        encoder: impl ImageEncoder + 'static,
        object_store: MockObjectStore,
        metadata_store: MockMetadataStore,
    ) -> QrCodeHandler {
        QrCodeHandler::new(
            Arc::new(encoder),
            Arc::new(object_store),
            Arc::new(metadata_store),
            "qrcodes",
            EXPIRY,
        )
    }

    /// Object store that accepts uploads and signs with a fake URL
    fn accepting_object_store() -> MockObjectStore {
        let mut store = MockObjectStore::new();
        store.expect_put_object().returning(|_, _, _, _| Ok(()));
        store
            .expect_presigned_get_url()
            .returning(|bucket, key, expires_in| {
                Ok(format!(
                    "https://{bucket}.s3.amazonaws.com/{key}?X-Amz-Expires={}&X-Amz-Signature=abc",
                    expires_in.as_secs()
                ))
            });
        store
    }

    fn accepting_metadata_store() -> MockMetadataStore {
        let mut store = MockMetadataStore::new();
        store.expect_put_record().returning(|_, _| Ok(()));
        store
    }

    fn unreachable_object_store() -> MockObjectStore {
        let mut store = MockObjectStore::new();
        store.expect_put_object().never();
        store.expect_presigned_get_url().never();
        store
    }

    fn unreachable_metadata_store() -> MockMetadataStore {
        let mut store = MockMetadataStore::new();
        store.expect_put_record().never();
        store
    }

    fn error_body(response: &InvocationResponse) -> &ErrorBody {
        match &response.body {
            ResponseBody::Error(body) => body,
            other => panic!("expected error body, got {other:?}"),
        }
    }

    fn success_body(response: &InvocationResponse) -> &QrCodeResponse {
        match &response.body {
            ResponseBody::Success(body) => body,
            other => panic!("expected success body, got {other:?}"),
        }
    }

    /// Checks `YYYY-MM-DDTHH-MM-SS-mmmZ`
    fn is_dashed_timestamp(s: &str) -> bool {
        let bytes = s.as_bytes();
        bytes.len() == 24
            && bytes.iter().enumerate().all(|(i, b)| match i {
                4 | 7 | 13 | 16 | 19 => *b == b'-',
                10 => *b == b'T',
                23 => *b == b'Z',
                _ => b.is_ascii_digit(),
            })
    }

    #[test]
    fn test_derive_filename() {
        let at = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap()
            + chrono::Duration::milliseconds(123);
        assert_eq!(derive_filename(at), "qrcode-2024-01-15T10-30-45-123Z.png");
    }

    #[test]
    fn test_iso_timestamp() {
        let at = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap();
        assert_eq!(iso_timestamp(at), "2024-01-15T10:30:45.000Z");
    }

    #[test]
    fn test_validate_filename() {
        assert!(validate_filename("my-qrcode.png").is_ok());
        assert!(validate_filename("qr code (1).png").is_ok());
        assert!(validate_filename("../secret.png").is_err());
        assert!(validate_filename("nested/name.png").is_err());
        assert!(validate_filename("back\\slash.png").is_err());
        assert!(validate_filename("..").is_err());
        assert!(validate_filename("line\nbreak.png").is_err());
        assert!(validate_filename(&"a".repeat(256)).is_err());
    }

    #[test]
    fn test_validation_order() {
        let now = Utc::now();

        let err = QrCodeRequest::default().validate(now).unwrap_err();
        assert_eq!(err.to_string(), "URL is required");

        let err = QrCodeRequest {
            url: Some(String::new()),
            bucket: Some("b".into()),
            table_name: Some("t".into()),
            filename: None,
        }
        .validate(now)
        .unwrap_err();
        assert_eq!(err.to_string(), "URL is required");

        let err = QrCodeRequest {
            url: Some("https://aws.amazon.com".into()),
            ..Default::default()
        }
        .validate(now)
        .unwrap_err();
        assert_eq!(err.to_string(), "S3 bucket name is required");

        let err = QrCodeRequest {
            url: Some("https://aws.amazon.com".into()),
            bucket: Some("b".into()),
            ..Default::default()
        }
        .validate(now)
        .unwrap_err();
        assert_eq!(err.to_string(), "DynamoDB table name is required");
    }

    #[test]
    fn test_empty_filename_is_derived() {
        let validated = request("https://aws.amazon.com", "b", "t", Some(""))
            .validate(Utc::now())
            .unwrap();
        assert!(validated.filename.starts_with("qrcode-"));
    }

    #[tokio::test]
    async fn test_missing_parameters_return_400_without_side_effects() {
        let handler = handler(
            QrPngEncoder::default(),
            unreachable_object_store(),
            unreachable_metadata_store(),
        );

        let cases = [
            (
                QrCodeRequest {
                    bucket: Some("b".into()),
                    table_name: Some("t".into()),
                    ..Default::default()
                },
                "URL is required",
            ),
            (
                QrCodeRequest {
                    url: Some("https://aws.amazon.com".into()),
                    table_name: Some("t".into()),
                    ..Default::default()
                },
                "S3 bucket name is required",
            ),
            (
                QrCodeRequest {
                    url: Some("https://aws.amazon.com".into()),
                    bucket: Some("b".into()),
                    ..Default::default()
                },
                "DynamoDB table name is required",
            ),
        ];

        for (req, message) in cases {
            let response = handler.handle(req).await;
            assert_eq!(response.status_code, 400);
            assert_eq!(
                error_body(&response),
                &ErrorBody {
                    message: message.to_string(),
                    error: None
                }
            );
        }
    }

    #[tokio::test]
    async fn test_invalid_filename_returns_400() {
        let handler = handler(
            QrPngEncoder::default(),
            unreachable_object_store(),
            unreachable_metadata_store(),
        );

        let response = handler
            .handle(request("https://aws.amazon.com", "b", "t", Some("../escape.png")))
            .await;

        assert_eq!(response.status_code, 400);
        assert_eq!(error_body(&response).message, "Invalid filename");
    }

    #[tokio::test]
    async fn test_explicit_filename_sets_key_and_uri() {
        let mut object_store = MockObjectStore::new();
        object_store
            .expect_put_object()
            .withf(|bucket, key, body, content_type| {
                bucket == "b"
                    && key == "qrcodes/my-qrcode.png"
                    && body.starts_with(b"\x89PNG")
                    && content_type == "image/png"
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        object_store
            .expect_presigned_get_url()
            .withf(|bucket, key, expires_in| {
                bucket == "b" && key == "qrcodes/my-qrcode.png" && *expires_in == EXPIRY
            })
            .times(1)
            .returning(|_, _, _| Ok("https://signed.example/qrcodes/my-qrcode.png".to_string()));

        let mut metadata_store = MockMetadataStore::new();
        metadata_store
            .expect_put_record()
            .withf(|table, record| {
                table == "t"
                    && record.url == "https://aws.amazon.com"
                    && record.s3_uri == "s3://b/qrcodes/my-qrcode.png"
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let handler = handler(QrPngEncoder::default(), object_store, metadata_store);
        let response = handler
            .handle(request("https://aws.amazon.com", "b", "t", Some("my-qrcode.png")))
            .await;

        assert_eq!(response.status_code, 200);
        let body = success_body(&response);
        assert_eq!(body.message, SUCCESS_MESSAGE);
        assert_eq!(body.s3_uri, "s3://b/qrcodes/my-qrcode.png");
        assert_eq!(body.presigned_url, "https://signed.example/qrcodes/my-qrcode.png");
        assert_eq!(body.url, "https://aws.amazon.com");
    }

    #[tokio::test]
    async fn test_end_to_end_with_derived_filename() {
        let handler = handler(
            QrPngEncoder::default(),
            accepting_object_store(),
            accepting_metadata_store(),
        );

        let response = handler
            .handle(request("https://aws.amazon.com", "b", "t", None))
            .await;

        assert_eq!(response.status_code, 200);
        let body = success_body(&response);
        assert_eq!(body.id.to_string().len(), 36);
        assert!(body.s3_uri.starts_with("s3://b/qrcodes/qrcode-"), "{}", body.s3_uri);
        assert!(body.presigned_url.contains("X-Amz-Expires=3600"));
        assert!(DateTime::parse_from_rfc3339(&body.created_at).is_ok());

        let filename = body.s3_uri.trim_start_matches("s3://b/qrcodes/");
        let timestamp = filename
            .strip_prefix("qrcode-")
            .and_then(|rest| rest.strip_suffix(".png"))
            .unwrap();
        assert!(is_dashed_timestamp(timestamp), "{filename}");
    }

    #[tokio::test]
    async fn test_identical_requests_get_distinct_ids() {
        let ids = Arc::new(Mutex::new(Vec::new()));
        let recorded = ids.clone();

        let mut metadata_store = MockMetadataStore::new();
        metadata_store
            .expect_put_record()
            .times(2)
            .returning(move |_, record| {
                recorded.lock().unwrap().push(record.id);
                Ok(())
            });

        let handler = handler(QrPngEncoder::default(), accepting_object_store(), metadata_store);
        let req = request("https://aws.amazon.com", "b", "t", Some("same.png"));

        let first = handler.handle(req.clone()).await;
        let second = handler.handle(req).await;

        assert_eq!(success_body(&first).s3_uri, success_body(&second).s3_uri);
        assert_ne!(success_body(&first).id, success_body(&second).id);

        let ids = ids.lock().unwrap();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
    }

    #[tokio::test]
    async fn test_encoder_failure_skips_storage() {
        let mut encoder = MockImageEncoder::new();
        encoder
            .expect_encode()
            .times(1)
            .returning(|_| Err(EncodeError::DataTooLong));

        let handler = handler(
            encoder,
            unreachable_object_store(),
            unreachable_metadata_store(),
        );
        let response = handler
            .handle(request("https://aws.amazon.com", "b", "t", None))
            .await;

        assert_eq!(response.status_code, 500);
        assert_eq!(
            error_body(&response),
            &ErrorBody {
                message: FAILURE_MESSAGE.to_string(),
                error: Some("Data too long to fit in a QR code".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn test_upload_failure_skips_presign_and_index() {
        let mut object_store = MockObjectStore::new();
        object_store
            .expect_put_object()
            .times(1)
            .returning(|_, _, _, _| {
                Err(anyhow::anyhow!("Access Denied").context("Failed to upload QR code to S3"))
            });
        object_store.expect_presigned_get_url().never();

        let handler = handler(
            QrPngEncoder::default(),
            object_store,
            unreachable_metadata_store(),
        );
        let response = handler
            .handle(request("https://aws.amazon.com", "b", "t", None))
            .await;

        assert_eq!(response.status_code, 500);
        assert_eq!(error_body(&response).error.as_deref(), Some("Access Denied"));
    }

    #[tokio::test]
    async fn test_metadata_failure_after_upload_is_not_rolled_back() {
        // No delete capability exists; the upload stays in place
        let mut object_store = MockObjectStore::new();
        object_store
            .expect_put_object()
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        object_store
            .expect_presigned_get_url()
            .times(1)
            .returning(|_, _, _| Ok("https://signed.example/x".to_string()));

        let mut metadata_store = MockMetadataStore::new();
        metadata_store
            .expect_put_record()
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("ResourceNotFoundException")));

        let handler = handler(QrPngEncoder::default(), object_store, metadata_store);
        let response = handler
            .handle(request("https://aws.amazon.com", "b", "t", Some("kept.png")))
            .await;

        assert_eq!(response.status_code, 500);
        assert_eq!(
            error_body(&response).error.as_deref(),
            Some("ResourceNotFoundException")
        );
    }

    #[test]
    fn test_envelope_stringifies_body() {
        let response = InvocationResponse::from_error(&HandlerError::MissingParameter(
            "URL is required",
        ));
        let envelope = response.into_envelope().unwrap();

        assert_eq!(envelope.status_code, 400);
        assert_eq!(envelope.body, r#"{"message":"URL is required"}"#);
    }

    #[test]
    fn test_non_string_fields_count_as_missing() {
        let req: QrCodeRequest =
            serde_json::from_str(r#"{"bucket":123,"tableName":"t","filename":null}"#).unwrap();
        assert!(req.bucket.is_none());
        assert!(req.filename.is_none());

        let err = req.validate(Utc::now()).unwrap_err();
        assert_eq!(err.to_string(), "URL is required");

        let err = serde_json::from_str::<QrCodeRequest>(
            r#"{"url":"https://aws.amazon.com","bucket":["b"],"tableName":"t"}"#,
        )
        .unwrap()
        .validate(Utc::now())
        .unwrap_err();
        assert_eq!(err.to_string(), "S3 bucket name is required");
    }

    #[test]
    fn test_request_deserializes_camel_case() {
        let req: QrCodeRequest = serde_json::from_str(
            r#"{"url":"https://aws.amazon.com","bucket":"b","tableName":"t","filename":"my-qrcode.png"}"#,
        )
        .unwrap();

        assert_eq!(req.table_name.as_deref(), Some("t"));
        assert_eq!(req.filename.as_deref(), Some("my-qrcode.png"));
    }
}
