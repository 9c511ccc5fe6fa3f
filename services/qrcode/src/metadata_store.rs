use crate::config::DynamoDbConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_dynamodb::config::Builder as DynamoConfigBuilder;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client as DynamoClient;
use aws_types::SdkConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Index entry for a generated QR code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrCodeRecord {
    /// Unique record ID
    pub id: Uuid,
    /// Encoded URL
    pub url: String,
    /// `s3://bucket/key` of the stored image
    pub s3_uri: String,
    /// ISO-8601 creation time
    pub created_at: String,
}

impl QrCodeRecord {
    /// DynamoDB item representation, keyed by `id`
    pub fn to_item(&self) -> HashMap<String, AttributeValue> {
        HashMap::from([
            ("id".to_string(), AttributeValue::S(self.id.to_string())),
            ("url".to_string(), AttributeValue::S(self.url.clone())),
            ("s3Uri".to_string(), AttributeValue::S(self.s3_uri.clone())),
            ("createdAt".to_string(), AttributeValue::S(self.created_at.clone())),
        ])
    }
}

/// Metadata store for QR code records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert or overwrite the record with the same `id`
    async fn put_record(&self, table: &str, record: &QrCodeRecord) -> Result<()>;
}

/// DynamoDB-backed metadata store
pub struct DynamoMetadataStore {
    client: DynamoClient,
}

impl DynamoMetadataStore {
    /// Create a new metadata store from the shared SDK configuration
    pub fn new(sdk_config: &SdkConfig, config: &DynamoDbConfig) -> Self {
        let mut builder = DynamoConfigBuilder::from(sdk_config);

        if let Some(ref endpoint_url) = config.endpoint_url {
            builder = builder.endpoint_url(endpoint_url);
        }

        let client = DynamoClient::from_conf(builder.build());

        info!(
            endpoint = config.endpoint_url.as_deref().unwrap_or("default"),
            "DynamoDB metadata store initialized"
        );

        Self { client }
    }
}

#[async_trait]
impl MetadataStore for DynamoMetadataStore {
    #[instrument(skip(self, record), fields(record_id = %record.id))]
    async fn put_record(&self, table: &str, record: &QrCodeRecord) -> Result<()> {
        self.client
            .put_item()
            .table_name(table)
            .set_item(Some(record.to_item()))
            .send()
            .await
            .context("Failed to write QR code record to DynamoDB")?;

        debug!(table = %table, record_id = %record.id, "Record written");
        metrics::counter!("qrcode.records.indexed").increment(1);

        Ok(())
    }
}
