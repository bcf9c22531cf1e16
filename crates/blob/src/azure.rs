//! Azure Blob Storage over the REST API.
//!
//! Every request carries a short-lived service SAS scoped to the blob it
//! touches. Uploads stage blocks and commit them with a single block list,
//! so a blob only appears once all of its bytes were accepted.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use futures_util::StreamExt;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::header::{CONTENT_LENGTH, HeaderMap};
use reqwest::{Method, Response, StatusCode};
use seqxfer_protocol::BlobStorage;
use seqxfer_transfer::{DEFAULT_CHUNK_SIZE, ProgressReporter};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::sas::{self, AccountKey, MIN_TOKEN_TTL, SERVICE_VERSION, SasPermissions, SasResource, SasToken};
use crate::{
    BlobConnector, BlobError, BlobFuture, BlobProperties, BlobStore, CopyState, CopyStatus,
};

/// Characters escaped in blob names; `/` separates virtual directories.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Tuning for [`AzureBlobStore`].
#[derive(Debug, Clone)]
pub struct AzureOptions {
    /// Size of each staged block.
    pub block_size: usize,
    /// Blocks in flight at once during an upload; one stream by default.
    pub parallelism: usize,
    /// Lifetime of per-request tokens.
    pub request_ttl: Duration,
}

impl Default for AzureOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_CHUNK_SIZE,
            parallelism: 1,
            request_ttl: MIN_TOKEN_TTL,
        }
    }
}

/// One Azure storage account.
pub struct AzureBlobStore {
    account: String,
    key: AccountKey,
    endpoint: String,
    http: reqwest::Client,
    options: AzureOptions,
}

impl AzureBlobStore {
    pub fn new(account: &str, key: AccountKey, http: reqwest::Client, options: AzureOptions) -> Self {
        Self {
            endpoint: format!("https://{account}.blob.core.windows.net"),
            account: account.to_string(),
            key,
            http,
            options,
        }
    }

    /// Overrides the service endpoint (emulators, private links).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    fn resource_url(&self, container: &str, blob: &str) -> String {
        format!(
            "{}/{}/{}",
            self.endpoint,
            container,
            utf8_percent_encode(blob, PATH_SEGMENT)
        )
    }

    /// Resource URL with a fresh blob-scoped token and optional extra query.
    fn authorized(
        &self,
        container: &str,
        blob: &str,
        permissions: SasPermissions,
        extra: &str,
    ) -> Result<String, BlobError> {
        let token = sas::sign(
            &self.account,
            &self.key,
            container,
            SasResource::Blob(blob),
            permissions,
            self.options.request_ttl,
            Utc::now(),
        )?;
        let url = self.resource_url(container, blob);
        if extra.is_empty() {
            Ok(format!("{url}?{}", token.query()))
        } else {
            Ok(format!("{url}?{extra}&{}", token.query()))
        }
    }

    async fn send(
        &self,
        method: Method,
        url: String,
        resource: &str,
        headers: &[(&'static str, String)],
        body: Option<Vec<u8>>,
    ) -> Result<Response, BlobError> {
        let method_name = method_name(&method);
        let mut req = self
            .http
            .request(method, &url)
            .header("x-ms-version", SERVICE_VERSION);
        for (name, value) in headers {
            req = req.header(*name, value);
        }
        if let Some(body) = body {
            req = req.body(body);
        }
        let resp = req.send().await?;
        check_status(method_name, resource, resp).await
    }

    async fn head(&self, container: &str, blob: &str) -> Result<Option<HeaderMap>, BlobError> {
        let url = self.authorized(container, blob, SasPermissions::READ, "")?;
        let resp = self
            .http
            .head(&url)
            .header("x-ms-version", SERVICE_VERSION)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = check_status("HEAD", &format!("{container}/{blob}"), resp).await?;
        Ok(Some(resp.headers().clone()))
    }

    async fn put_block(
        &self,
        container: &str,
        blob: &str,
        block_id: &str,
        data: Vec<u8>,
    ) -> Result<(), BlobError> {
        let extra = format!(
            "comp=block&blockid={}",
            utf8_percent_encode(block_id, NON_ALPHANUMERIC)
        );
        let url = self.authorized(container, blob, SasPermissions::WRITE, &extra)?;
        self.send(Method::PUT, url, &format!("{container}/{blob}"), &[], Some(data))
            .await?;
        Ok(())
    }

    async fn put_block_list(
        &self,
        container: &str,
        blob: &str,
        block_ids: &[String],
    ) -> Result<(), BlobError> {
        let url = self.authorized(container, blob, SasPermissions::WRITE, "comp=blocklist")?;
        self.send(
            Method::PUT,
            url,
            &format!("{container}/{blob}"),
            &[("content-type", "application/xml".to_string())],
            Some(block_list_xml(block_ids).into_bytes()),
        )
        .await?;
        Ok(())
    }

    async fn upload(
        &self,
        container: &str,
        blob: &str,
        source: &Path,
        progress: Arc<ProgressReporter>,
        cancel: CancellationToken,
    ) -> Result<u64, BlobError> {
        let total = tokio::fs::metadata(source).await?.len();
        let block_size = self.options.block_size.max(1) as u64;
        let block_ids: Vec<String> = (0..total.div_ceil(block_size)).map(block_id).collect();
        let sent = AtomicU64::new(0);

        info!(
            account = %self.account,
            container,
            blob,
            bytes = total,
            blocks = block_ids.len(),
            "uploading blob"
        );

        let mut uploads = futures_util::stream::iter(0..block_ids.len())
            .map(|index| {
                let offset = index as u64 * block_size;
                let len = block_size.min(total - offset) as usize;
                let (progress, cancel, sent) = (&progress, &cancel, &sent);
                let id = block_ids[index].clone();
                async move {
                    if cancel.is_cancelled() {
                        return Err(BlobError::Cancelled);
                    }
                    let data = read_block(source.to_path_buf(), offset, len).await?;
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(BlobError::Cancelled),
                        result = self.put_block(container, blob, &id, data) => result?,
                    }
                    let done = sent.fetch_add(len as u64, Ordering::Relaxed) + len as u64;
                    progress.report(done, total);
                    Ok(())
                }
            })
            .buffer_unordered(self.options.parallelism.max(1));

        while let Some(result) = uploads.next().await {
            result?;
        }

        if cancel.is_cancelled() {
            return Err(BlobError::Cancelled);
        }
        self.put_block_list(container, blob, &block_ids).await?;
        progress.finish(total, total);
        Ok(total)
    }

    async fn download(
        &self,
        container: &str,
        blob: &str,
        dest: &Path,
        progress: Arc<ProgressReporter>,
        cancel: CancellationToken,
    ) -> Result<u64, BlobError> {
        let resource = format!("{container}/{blob}");
        let url = self.authorized(container, blob, SasPermissions::READ, "")?;
        let mut resp = self.send(Method::GET, url, &resource, &[], None).await?;
        let total = content_length(resp.headers()).unwrap_or(0);

        info!(account = %self.account, container, blob, bytes = total, "downloading blob");

        let mut out = tokio::fs::File::create(dest).await?;
        let mut received = 0u64;
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BlobError::Cancelled),
                chunk = resp.chunk() => chunk?,
            };
            let Some(chunk) = chunk else { break };
            out.write_all(&chunk).await?;
            received += chunk.len() as u64;
            progress.report(received, total);
        }
        out.sync_all().await?;

        if received != total {
            return Err(BlobError::Protocol(format!(
                "{resource}: received {received} bytes, expected {total}"
            )));
        }
        progress.finish(received, total);
        Ok(received)
    }

    async fn copy(&self, container: &str, blob: &str, source_url: &str) -> Result<CopyState, BlobError> {
        let url = self.authorized(container, blob, SasPermissions::WRITE, "")?;
        let resp = self
            .send(
                Method::PUT,
                url,
                &format!("{container}/{blob}"),
                &[("x-ms-copy-source", source_url.to_string())],
                None,
            )
            .await?;
        let state = parse_copy_state(resp.headers())
            .ok_or_else(|| BlobError::Protocol("copy response without copy status".into()))?;
        debug!(container, blob, copy_id = %state.id, status = ?state.status, "copy started");
        Ok(state)
    }

    async fn fetch_copy_state(&self, container: &str, blob: &str) -> Result<CopyState, BlobError> {
        let headers = self.head(container, blob).await?.ok_or_else(|| BlobError::Status {
            method: "HEAD",
            resource: format!("{container}/{blob}"),
            status: StatusCode::NOT_FOUND.as_u16(),
            message: "copy destination disappeared".into(),
        })?;
        parse_copy_state(&headers)
            .ok_or_else(|| BlobError::Protocol(format!("{container}/{blob} has no copy status")))
    }

    async fn abort(&self, container: &str, blob: &str, copy_id: &str) -> Result<(), BlobError> {
        let extra = format!(
            "comp=copy&copyid={}",
            utf8_percent_encode(copy_id, NON_ALPHANUMERIC)
        );
        let url = self.authorized(container, blob, SasPermissions::WRITE, &extra)?;
        self.send(
            Method::PUT,
            url,
            &format!("{container}/{blob}"),
            &[("x-ms-copy-action", "abort".to_string())],
            None,
        )
        .await?;
        Ok(())
    }

    async fn remove(&self, container: &str, blob: &str) -> Result<(), BlobError> {
        let url = self.authorized(container, blob, SasPermissions::DELETE, "")?;
        let resp = self
            .http
            .delete(&url)
            .header("x-ms-version", SERVICE_VERSION)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status("DELETE", &format!("{container}/{blob}"), resp).await?;
        Ok(())
    }
}

impl BlobStore for AzureBlobStore {
    fn account(&self) -> &str {
        &self.account
    }

    fn properties<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
    ) -> BlobFuture<'a, Option<BlobProperties>> {
        Box::pin(async move {
            let Some(headers) = self.head(container, blob).await? else {
                return Ok(None);
            };
            let size = content_length(&headers).ok_or_else(|| {
                BlobError::Protocol(format!("{container}/{blob}: missing Content-Length"))
            })?;
            Ok(Some(BlobProperties { size }))
        })
    }

    fn upload_file<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        source: &'a Path,
        progress: Arc<ProgressReporter>,
        cancel: CancellationToken,
    ) -> BlobFuture<'a, u64> {
        Box::pin(self.upload(container, blob, source, progress, cancel))
    }

    fn download_file<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        dest: &'a Path,
        progress: Arc<ProgressReporter>,
        cancel: CancellationToken,
    ) -> BlobFuture<'a, u64> {
        Box::pin(self.download(container, blob, dest, progress, cancel))
    }

    fn container_read_token(&self, container: &str, ttl: Duration) -> Result<SasToken, BlobError> {
        sas::sign(
            &self.account,
            &self.key,
            container,
            SasResource::Container,
            SasPermissions::READ,
            ttl,
            Utc::now(),
        )
    }

    fn signed_url(&self, container: &str, blob: &str, token: &SasToken) -> String {
        format!("{}?{}", self.resource_url(container, blob), token.query())
    }

    fn start_copy<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        source_url: &'a str,
    ) -> BlobFuture<'a, CopyState> {
        Box::pin(self.copy(container, blob, source_url))
    }

    fn copy_state<'a>(&'a self, container: &'a str, blob: &'a str) -> BlobFuture<'a, CopyState> {
        Box::pin(self.fetch_copy_state(container, blob))
    }

    fn abort_copy<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        copy_id: &'a str,
    ) -> BlobFuture<'a, ()> {
        Box::pin(self.abort(container, blob, copy_id))
    }

    fn delete<'a>(&'a self, container: &'a str, blob: &'a str) -> BlobFuture<'a, ()> {
        Box::pin(self.remove(container, blob))
    }
}

/// Connects to Azure accounts using keys read from the environment.
#[derive(Clone)]
pub struct AzureConnector {
    http: reqwest::Client,
    options: AzureOptions,
}

impl AzureConnector {
    pub fn new(http: reqwest::Client, options: AzureOptions) -> Self {
        Self { http, options }
    }
}

impl BlobConnector for AzureConnector {
    fn connect(&self, storage: &BlobStorage) -> Result<Arc<dyn BlobStore>, BlobError> {
        let encoded = std::env::var(&storage.credentials_env)
            .map_err(|_| BlobError::MissingCredentials(storage.credentials_env.clone()))?;
        let key = AccountKey::from_base64(&storage.account, &encoded)?;
        debug!(storage = %storage.name, account = %storage.account, "connected blob storage");
        Ok(Arc::new(AzureBlobStore::new(
            &storage.account,
            key,
            self.http.clone(),
            self.options.clone(),
        )))
    }
}

/// Fixed-width block id so every id in a list has the same length.
fn block_id(index: u64) -> String {
    BASE64.encode(format!("block-{index:010}"))
}

fn block_list_xml(block_ids: &[String]) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?><BlockList>");
    for id in block_ids {
        xml.push_str("<Latest>");
        xml.push_str(id);
        xml.push_str("</Latest>");
    }
    xml.push_str("</BlockList>");
    xml
}

async fn read_block(path: PathBuf, offset: u64, len: usize) -> Result<Vec<u8>, BlobError> {
    let data = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
        let mut file = std::fs::File::open(&path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    })
    .await
    .map_err(|e| BlobError::Protocol(format!("block reader panicked: {e}")))??;
    Ok(data)
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn parse_copy_state(headers: &HeaderMap) -> Option<CopyState> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let status = CopyStatus::parse(header("x-ms-copy-status")?)?;
    Some(CopyState {
        id: header("x-ms-copy-id").unwrap_or_default().to_string(),
        status,
        description: header("x-ms-copy-status-description")
            .unwrap_or_default()
            .to_string(),
    })
}

fn method_name(method: &Method) -> &'static str {
    if *method == Method::GET {
        "GET"
    } else if *method == Method::PUT {
        "PUT"
    } else if *method == Method::DELETE {
        "DELETE"
    } else {
        "REQUEST"
    }
}

async fn check_status(
    method: &'static str,
    resource: &str,
    resp: Response,
) -> Result<Response, BlobError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(BlobError::Status {
        method,
        resource: resource.to_string(),
        status: status.as_u16(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn store() -> AzureBlobStore {
        let key = AccountKey::from_base64("acct", &BASE64.encode(b"key-material")).unwrap();
        AzureBlobStore::new("acct", key, reqwest::Client::new(), AzureOptions::default())
    }

    #[test]
    fn uploads_default_to_one_stream() {
        assert_eq!(AzureOptions::default().parallelism, 1);
    }

    #[test]
    fn resource_url_escapes_blob_name_but_keeps_slashes() {
        let url = store().resource_url("data", "run 42/SA1.bam");
        assert_eq!(url, "https://acct.blob.core.windows.net/data/run%2042/SA1.bam");
    }

    #[test]
    fn custom_endpoint_is_trimmed() {
        let s = store().with_endpoint("http://127.0.0.1:10000/acct/");
        assert_eq!(
            s.resource_url("data", "a.bam"),
            "http://127.0.0.1:10000/acct/data/a.bam"
        );
    }

    #[test]
    fn authorized_url_carries_extra_query_before_token() {
        let url = store()
            .authorized("data", "a.bam", SasPermissions::WRITE, "comp=blocklist")
            .unwrap();
        assert!(url.starts_with("https://acct.blob.core.windows.net/data/a.bam?comp=blocklist&sv="));
        assert!(url.contains("sr=b"));
        assert!(url.contains("sp=cw"));
    }

    #[test]
    fn signed_url_uses_given_token() {
        let s = store();
        let token = s
            .container_read_token("data", Duration::from_secs(200 * 3600))
            .unwrap();
        let url = s.signed_url("data", "run42/SA1.bam", &token);
        assert!(url.contains("/data/run42/SA1.bam?sv="));
        assert!(url.contains("sr=c&sp=r"));
    }

    #[test]
    fn block_ids_have_equal_length() {
        let a = block_id(0);
        let b = block_id(123_456);
        assert_eq!(a.len(), b.len());
        assert_ne!(a, b);
    }

    #[test]
    fn block_list_lists_ids_in_order() {
        let xml = block_list_xml(&["QQ==".into(), "Qg==".into()]);
        assert!(xml.ends_with("<BlockList><Latest>QQ==</Latest><Latest>Qg==</Latest></BlockList>"));
    }

    #[test]
    fn parses_copy_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ms-copy-status", HeaderValue::from_static("pending"));
        headers.insert("x-ms-copy-id", HeaderValue::from_static("abc"));
        let state = parse_copy_state(&headers).unwrap();
        assert_eq!(state.id, "abc");
        assert_eq!(state.status, CopyStatus::Pending);

        headers.insert("x-ms-copy-status", HeaderValue::from_static("failed"));
        headers.insert(
            "x-ms-copy-status-description",
            HeaderValue::from_static("500 InternalError"),
        );
        let state = parse_copy_state(&headers).unwrap();
        assert_eq!(state.status, CopyStatus::Failed);
        assert_eq!(state.description, "500 InternalError");
    }

    #[test]
    fn missing_copy_status_is_none() {
        assert!(parse_copy_state(&HeaderMap::new()).is_none());
    }

    #[test]
    fn content_length_parses() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("4096"));
        assert_eq!(content_length(&headers), Some(4096));
    }

    #[test]
    fn connector_requires_credentials() {
        let connector = AzureConnector::new(reqwest::Client::new(), AzureOptions::default());
        let storage = BlobStorage {
            id: 1,
            name: "blob".into(),
            account: "acct".into(),
            container: "data".into(),
            credentials_env: "SEQXFER_TEST_KEY_THAT_IS_NEVER_SET".into(),
        };
        assert!(matches!(
            connector.connect(&storage),
            Err(BlobError::MissingCredentials(_))
        ));
    }

    #[tokio::test]
    async fn read_block_reads_slice() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), b"0123456789").unwrap();
        let data = read_block(tmp.path().to_path_buf(), 4, 3).await.unwrap();
        assert_eq!(data, b"456");
    }
}
