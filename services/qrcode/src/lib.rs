//! QR Code Service
//!
//! Turns a URL into a QR code PNG, stores the image in S3 and indexes it in
//! DynamoDB, answering with a presigned link to the image.
//!
//! ## Flow
//!
//! Each invocation is a straight line; the first failing step aborts the rest
//! and already-uploaded images are left in place.
//!
//! ```text
//!  Request              Image Encoder          S3 Bucket              DynamoDB
//! ┌──────────────┐     ┌──────────────┐      ┌──────────────┐       ┌──────────────┐
//! │ url          │────▶│ PNG          │─────▶│ qrcodes/     │       │ id           │
//! │ bucket       │     │ (EC low,     │      │   {filename} │       │ url          │
//! │ tableName    │     │  margin 4,   │      └──────────────┘       │ s3Uri        │
//! │ filename?    │     │  scale 10)   │             │               │ createdAt    │
//! └──────────────┘     └──────────────┘             ▼               └──────────────┘
//!                                            ┌──────────────┐              ▲
//!                                            │ Presigned    │──────────────┘
//!                                            │ GET URL      │
//!                                            └──────────────┘
//! ```
//!
//! Bucket and table are supplied per request; only endpoints, region and
//! rendering parameters come from [`Config`].

pub mod api;
pub mod config;
pub mod encoder;
pub mod handler;
pub mod metadata_store;
pub mod object_store;

pub use api::{create_router, start_api_server, AppState};
pub use config::Config;
pub use encoder::{EncodeError, ImageEncoder, QrPngEncoder};
pub use handler::{
    HandlerError, InvocationEnvelope, InvocationResponse, QrCodeHandler, QrCodeRequest,
    QrCodeResponse,
};
pub use metadata_store::{DynamoMetadataStore, MetadataStore, QrCodeRecord};
pub use object_store::{ObjectStore, S3ObjectStore};
