use super::{ObjectLocation, ObjectStore, PutCondition, VersionedObject};
use crate::error::{EtlError, Result};
use async_trait::async_trait;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use tracing::debug;

/// HTTP statuses S3 answers when a conditional write loses
const PRECONDITION_FAILED: u16 = 412;
const CONDITIONAL_CONFLICT: u16 = 409;

/// S3-backed object store
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    pub fn new(sdk_config: &aws_config::SdkConfig) -> Self {
        Self {
            client: Client::new(sdk_config),
        }
    }
}

fn storage_error<E, R>(op: &str, location: &ObjectLocation, err: SdkError<E, R>) -> EtlError
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    EtlError::Storage(format!("{} {} failed: {}", op, location, DisplayErrorContext(err)))
}

fn http_status<E>(err: &SdkError<E, HttpResponse>) -> Option<u16> {
    err.raw_response().map(|r| r.status().as_u16())
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(&self, location: &ObjectLocation) -> Result<Bytes> {
        let output = self
            .client
            .get_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await
            .map_err(|e| storage_error("GetObject", location, e))?;

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| EtlError::Storage(format!("Reading body of {} failed: {}", location, e)))?
            .into_bytes();
        debug!("Fetched {} bytes from {}", data.len(), location);
        Ok(data)
    }

    async fn get_versioned(&self, location: &ObjectLocation) -> Result<Option<VersionedObject>> {
        let output = match self
            .client
            .get_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) if e.as_service_error().map(|se| se.is_no_such_key()).unwrap_or(false) => {
                return Ok(None)
            }
            Err(e) => return Err(storage_error("GetObject", location, e)),
        };

        let etag = output
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| EtlError::Storage(format!("{} has no ETag", location)))?;
        let data = output
            .body
            .collect()
            .await
            .map_err(|e| EtlError::Storage(format!("Reading body of {} failed: {}", location, e)))?
            .into_bytes();

        Ok(Some(VersionedObject { data, etag }))
    }

    async fn put(&self, location: &ObjectLocation, data: Bytes) -> Result<()> {
        let size = data.len();
        self.client
            .put_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| storage_error("PutObject", location, e))?;
        debug!("Put {} bytes to {}", size, location);
        Ok(())
    }

    async fn put_conditional(
        &self,
        location: &ObjectLocation,
        data: Bytes,
        condition: PutCondition,
    ) -> Result<bool> {
        let request = self
            .client
            .put_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .body(ByteStream::from(data));
        let request = match condition {
            PutCondition::Absent => request.if_none_match("*"),
            PutCondition::Matches(etag) => request.if_match(etag),
        };

        match request.send().await {
            Ok(_) => Ok(true),
            Err(e) => match http_status(&e) {
                Some(PRECONDITION_FAILED) | Some(CONDITIONAL_CONFLICT) => {
                    debug!("Conditional put lost for {}", location);
                    Ok(false)
                }
                _ => Err(storage_error("PutObject", location, e)),
            },
        }
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| {
                storage_error("ListObjectsV2", &ObjectLocation::new(bucket, prefix), e)
            })?;
            keys.extend(page.contents().iter().filter_map(|o| o.key().map(str::to_string)));
        }

        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, location: &ObjectLocation) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await
            .map_err(|e| storage_error("DeleteObject", location, e))?;
        Ok(())
    }
}
