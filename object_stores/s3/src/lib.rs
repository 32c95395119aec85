use anyhow::anyhow;
use bytes::Bytes;
use futures::{TryStreamExt, stream};
use rekkord_core::store::{
    ByteStream, KeyStream, Store, StoreError, StoreFeatures, StoreResult,
};
use s3::{Bucket, Region, creds::Credentials, error::S3Error};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct S3StoreConfig {
    pub endpoint: String,
    #[serde(default)]
    pub region: String,
    pub bucket_name: String,
    pub access_key: String,
    pub secret_key: String,
}

/// S3-compatible object store. Uploads are single-shot PUTs, which the
/// provider applies atomically, so no rename step is needed.
#[derive(Debug, Clone)]
pub struct S3Store {
    bucket: Box<Bucket>,
}

impl S3Store {
    pub fn create(config: S3StoreConfig) -> anyhow::Result<Self> {
        let credentials = Credentials::new(
            Some(&config.access_key),
            Some(&config.secret_key),
            None,
            None,
            None,
        )?;
        let bucket = Bucket::new(
            &config.bucket_name,
            Region::Custom {
                endpoint: config.endpoint,
                region: config.region,
            },
            credentials,
        )?
        .with_path_style();

        Ok(Self { bucket })
    }
}

fn map_error(err: S3Error) -> StoreError {
    match err {
        S3Error::HttpFailWithBody(404, _) => StoreError::NotFound,
        S3Error::HttpFailWithBody(401, _) | S3Error::HttpFailWithBody(403, _) => {
            StoreError::AccessDenied
        }
        S3Error::HttpFailWithBody(code, _) if code >= 500 => StoreError::Transient(err.into()),
        other => StoreError::Other(other.into()),
    }
}

fn check_status(code: u16) -> StoreResult<()> {
    match code {
        200..=299 => Ok(()),
        404 => Err(StoreError::NotFound),
        401 | 403 => Err(StoreError::AccessDenied),
        code if code >= 500 => Err(StoreError::Transient(anyhow!("http status {code}"))),
        code => Err(StoreError::Other(anyhow!("unexpected http status {code}"))),
    }
}

#[async_trait::async_trait]
impl Store for S3Store {
    fn features(&self) -> StoreFeatures {
        StoreFeatures {
            supports_rename: false,
        }
    }

    async fn read(&self, path: &str) -> StoreResult<Bytes> {
        let response = self.bucket.get_object(path).await.map_err(map_error)?;
        check_status(response.status_code())?;
        Ok(Bytes::from(response.to_vec()))
    }

    async fn write(&self, path: &str, data: ByteStream) -> StoreResult<u64> {
        let chunks: Vec<Bytes> = data.try_collect().await?;
        let body = chunks.concat();
        let len = body.len() as u64;

        let response = self
            .bucket
            .put_object(path, &body)
            .await
            .map_err(map_error)?;
        check_status(response.status_code())?;

        Ok(len)
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        match self.bucket.delete_object(path).await {
            Ok(_) => Ok(()),
            Err(err) => match map_error(err) {
                StoreError::NotFound => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn rename(&self, _from: &str, _to: &str) -> StoreResult<()> {
        Err(StoreError::Other(anyhow!(
            "rename is not supported by this store"
        )))
    }

    async fn list(&self, prefix: &str) -> StoreResult<KeyStream> {
        let pages = self
            .bucket
            .list(prefix.to_owned(), None)
            .await
            .map_err(map_error)?;

        let keys: Vec<StoreResult<String>> = pages
            .into_iter()
            .flat_map(|page| page.contents)
            .map(|object| Ok(object.key))
            .collect();

        Ok(Box::new(stream::iter(keys)))
    }

    async fn stat(&self, path: &str) -> StoreResult<bool> {
        match self.bucket.head_object(path).await {
            Ok((_, 200)) => Ok(true),
            Ok((_, 404)) => Ok(false),
            Ok((_, 401)) | Ok((_, 403)) => Err(StoreError::AccessDenied),
            Ok((_, code)) => Err(StoreError::Other(anyhow!("unexpected http status {code}"))),
            Err(err) => match map_error(err) {
                StoreError::NotFound => Ok(false),
                other => Err(other),
            },
        }
    }
}
