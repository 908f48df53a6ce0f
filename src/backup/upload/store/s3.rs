use crate::backup::function_path;
use crate::backup::redacted::RedactedString;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use crate::backup::upload::store::ObjectStore;
use bon::Builder;
use function_name::named;
use getset::Getters;
use rusoto_core::{ByteStream, HttpClient, Region};
use rusoto_credential::StaticProvider;
use rusoto_s3::{
    AbortMultipartUploadRequest, CompleteMultipartUploadRequest, CompletedMultipartUpload,
    CompletedPart, CreateMultipartUploadRequest, PutObjectRequest, S3Client, UploadPartRequest, S3,
};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fmt::{Debug, Formatter};
use std::io::Read;
use tokio::runtime::Runtime;
use validator::Validate;

/// Smallest part S3 accepts for every part but the last.
pub static MIN_PART_SIZE: u64 = 5 * 1024 * 1024;
/// Most parts a single multipart upload may have.
pub static MAX_PARTS: u64 = 10_000;

/// Grows `part_size` so that a body of `size_hint` bytes fits in
/// [`MAX_PARTS`] parts.
fn part_size_for(part_size: u64, size_hint: Option<u64>) -> u64 {
    size_hint
        .map(|size| size.div_ceil(MAX_PARTS))
        .map_or(part_size, |needed| needed.max(part_size))
}

fn default_region() -> String {
    "us-east-1".to_string()
}

#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct S3StoreConfig {
    #[validate(length(min = 3, max = 63))]
    #[builder(into)]
    bucket: String,
    #[serde(default = "default_region")]
    #[builder(default = default_region(), into)]
    region: String,
    /// Endpoint of an S3-compatible service such as MinIO.
    #[builder(into)]
    endpoint: Option<String>,
    #[validate(length(min = 1))]
    #[builder(into)]
    access_key_id: String,
    #[validate(nested)]
    #[builder(into)]
    secret_access_key: RedactedString,
}

impl S3StoreConfig {
    fn rusoto_region(&self) -> Result<Region> {
        match &self.endpoint {
            Some(endpoint) => Ok(Region::Custom {
                name: self.region.clone(),
                endpoint: endpoint.clone(),
            }),
            None => self
                .region
                .parse::<Region>()
                .map_err(|e| Error::config(format!("invalid s3 region {:?}: {e}", self.region))),
        }
    }
}

/// S3 store driven synchronously; requests run on a runtime owned by the store.
pub struct S3Store {
    client: S3Client,
    bucket: String,
    part_size: u64,
    runtime: Runtime,
}

impl Debug for S3Store {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Store")
            .field("bucket", &self.bucket)
            .field("part_size", &self.part_size)
            .finish()
    }
}

impl S3Store {
    pub fn new(config: &S3StoreConfig, part_size: u64) -> Result<Self> {
        let part_size = if part_size < MIN_PART_SIZE {
            tracing::warn!(
                "part_size {} is below the S3 minimum, using {}",
                part_size,
                MIN_PART_SIZE
            );
            MIN_PART_SIZE
        } else {
            part_size
        };

        let credentials = StaticProvider::new_minimal(
            config.access_key_id.clone(),
            config.secret_access_key.inner().clone(),
        );
        let client = S3Client::new_with(HttpClient::new()?, credentials, config.rusoto_region()?);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("s3-store")
            .enable_all()
            .build()?;

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            part_size,
            runtime,
        })
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    fn read_part(body: &mut dyn Read, part_size: u64) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(part_size as usize);
        Read::take(&mut *body, part_size).read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn put_single(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let request = PutObjectRequest {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            content_length: Some(data.len() as i64),
            body: Some(ByteStream::from(data)),
            ..Default::default()
        };
        self.runtime
            .block_on(self.client.put_object(request))
            .map_err(|e| Error::object_store(e.to_string()))?;
        Ok(())
    }

    fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        first: Vec<u8>,
        body: &mut dyn Read,
        part_size: u64,
    ) -> Result<Vec<CompletedPart>> {
        let mut parts = Vec::new();
        let mut data = first;
        let mut part_number = 1i64;
        while !data.is_empty() {
            if part_number as u64 > MAX_PARTS {
                return Err(Error::object_store(format!(
                    "{key:?} needs more than {MAX_PARTS} parts of {part_size} bytes"
                )));
            }
            let len = data.len();
            let request = UploadPartRequest {
                bucket: self.bucket.clone(),
                key: key.to_string(),
                upload_id: upload_id.to_string(),
                part_number,
                content_length: Some(len as i64),
                body: Some(ByteStream::from(data)),
                ..Default::default()
            };
            let output = self
                .runtime
                .block_on(self.client.upload_part(request))
                .map_err(|e| Error::object_store(e.to_string()))
                .add_msg(format!("Uploading part {part_number} of {key:?}"))?;
            tracing::debug!("Uploaded part {} ({} bytes) of {:?}", part_number, len, key);

            parts.push(CompletedPart {
                e_tag: output.e_tag,
                part_number: Some(part_number),
                ..Default::default()
            });
            part_number += 1;
            data = Self::read_part(body, part_size)?;
        }
        Ok(parts)
    }

    #[named]
    fn put_multipart(
        &self,
        key: &str,
        first: Vec<u8>,
        body: &mut dyn Read,
        part_size: u64,
    ) -> Result<()> {
        let created = self
            .runtime
            .block_on(self.client.create_multipart_upload(CreateMultipartUploadRequest {
                bucket: self.bucket.clone(),
                key: key.to_string(),
                ..Default::default()
            }))
            .map_err(|e| Error::object_store(e.to_string()))
            .add_fn_name(function_path!())?;
        let upload_id = created
            .upload_id
            .ok_or_else(|| Error::object_store("no upload id returned"))?;

        let completed = self
            .upload_parts(key, &upload_id, first, body, part_size)
            .and_then(|parts| {
                self.runtime
                    .block_on(
                        self.client
                            .complete_multipart_upload(CompleteMultipartUploadRequest {
                                bucket: self.bucket.clone(),
                                key: key.to_string(),
                                upload_id: upload_id.clone(),
                                multipart_upload: Some(CompletedMultipartUpload {
                                    parts: Some(parts),
                                }),
                                ..Default::default()
                            }),
                    )
                    .map_err(|e| Error::object_store(e.to_string()))
            });

        match completed {
            Ok(_) => Ok(()),
            Err(e) => {
                let abort = self
                    .runtime
                    .block_on(self.client.abort_multipart_upload(AbortMultipartUploadRequest {
                        bucket: self.bucket.clone(),
                        key: key.to_string(),
                        upload_id,
                        ..Default::default()
                    }));
                if let Err(abort_err) = abort {
                    tracing::warn!("Aborting multipart upload of {:?} failed: {}", key, abort_err);
                }
                Err(e.add_fn_name(function_path!()))
            }
        }
    }
}

impl ObjectStore for S3Store {
    fn put_object(&self, key: &str, body: &mut dyn Read, size_hint: Option<u64>) -> Result<()> {
        tracing::debug!(
            "Uploading s3://{}/{} (size hint {:?})",
            self.bucket,
            key,
            size_hint
        );
        let part_size = part_size_for(self.part_size, size_hint);
        if part_size != self.part_size {
            tracing::debug!("Using {} byte parts for {:?}", part_size, key);
        }
        let first = Self::read_part(body, part_size)?;
        if (first.len() as u64) < part_size {
            self.put_single(key, first)
        } else {
            self.put_multipart(key, first, body, part_size)
        }
    }
}
