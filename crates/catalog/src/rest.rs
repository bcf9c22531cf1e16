//! Catalog REST client.
//!
//! JSON over HTTP with basic authentication. List endpoints are paginated
//! with `limit`/`offset`; [`RestCatalog`] keeps fetching until the page's
//! `next` link is empty.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use seqxfer_protocol::{
    FileInstance, FileResource, FileTransferJob, NewFileInstance, NewFileTransfer, Page, Storage,
    TaskStatus,
};

use crate::{Catalog, CatalogError, CatalogFuture, JobCatalog, reconcile_instance};

/// Environment variable holding the catalog base URL.
pub const API_URL_ENV: &str = "SEQXFER_API_URL";
/// Environment variable holding the catalog user name.
pub const API_USERNAME_ENV: &str = "SEQXFER_API_USERNAME";
/// Environment variable holding the catalog password.
pub const API_PASSWORD_ENV: &str = "SEQXFER_API_PASSWORD";

const PAGE_SIZE: u64 = 100;

/// Catalog REST client.
pub struct RestCatalog {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl RestCatalog {
    pub fn new(
        base_url: &str,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, CatalogError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("seqxfer/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
        })
    }

    /// Builds a client from `SEQXFER_API_*` variables.
    ///
    /// `base_url` is used when `SEQXFER_API_URL` is unset.
    pub fn from_env(base_url: Option<&str>) -> Result<Self, CatalogError> {
        let url = match std::env::var(API_URL_ENV) {
            Ok(url) if !url.is_empty() => url,
            _ => base_url
                .map(String::from)
                .ok_or(CatalogError::MissingCredentials(API_URL_ENV))?,
        };
        let username = std::env::var(API_USERNAME_ENV)
            .map_err(|_| CatalogError::MissingCredentials(API_USERNAME_ENV))?;
        let password = std::env::var(API_PASSWORD_ENV)
            .map_err(|_| CatalogError::MissingCredentials(API_PASSWORD_ENV))?;
        Self::new(&url, username, password)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, table: &str) -> String {
        format!("{}/{table}/", self.base_url)
    }

    async fn get_page<T: DeserializeOwned>(
        &self,
        table: &str,
        params: &[(&str, String)],
        offset: u64,
    ) -> Result<Page<T>, CatalogError> {
        let url = self.endpoint(table);
        debug!(%url, ?params, offset, "querying catalog");
        let resp = self
            .http
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .query(params)
            .query(&[("limit", PAGE_SIZE), ("offset", offset)])
            .send()
            .await?;
        let body = check_status(&url, resp).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Fetches every page of a list query.
    async fn list<T: DeserializeOwned>(
        &self,
        table: &str,
        params: &[(&str, String)],
    ) -> Result<Vec<T>, CatalogError> {
        let mut results = Vec::new();
        let mut offset = 0;
        loop {
            let page: Page<T> = self.get_page(table, params, offset).await?;
            let fetched = page.results.len() as u64;
            results.extend(page.results);
            if page.next.is_none() || fetched == 0 {
                break;
            }
            offset += PAGE_SIZE;
        }
        Ok(results)
    }

    /// Fetches the single record matching `params`.
    async fn get_one<T: DeserializeOwned>(
        &self,
        table: &str,
        kind: &'static str,
        key: &str,
        params: &[(&str, String)],
    ) -> Result<Option<T>, CatalogError> {
        let page: Page<T> = self.get_page(table, params, 0).await?;
        match page.count {
            0 => Ok(None),
            1 => Ok(page.results.into_iter().next()),
            count => Err(CatalogError::Ambiguous {
                kind,
                key: key.to_string(),
                count,
            }),
        }
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        table: &str,
        body: &B,
    ) -> Result<T, CatalogError> {
        let url = self.endpoint(table);
        let resp = self
            .http
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .json(body)
            .send()
            .await?;
        let body = check_status(&url, resp).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn fetch_storage(&self, name: &str) -> Result<Storage, CatalogError> {
        self.get_one("storage", "storage", name, &[("name", name.to_string())])
            .await?
            .ok_or_else(|| CatalogError::NotFound {
                kind: "storage",
                key: name.to_string(),
            })
    }

    async fn upsert_instance(
        &self,
        resource: &FileResource,
        storage: &Storage,
        filepath: Option<&str>,
    ) -> Result<FileInstance, CatalogError> {
        let key = format!("resource {} on {}", resource.id, storage.name);
        let params = [
            ("file_resource", resource.id.to_string()),
            ("storage", storage.id.to_string()),
        ];
        if let Some(existing) = self
            .get_one::<FileInstance>("file_instance", "file instance", &key, &params)
            .await?
        {
            debug!(resource = resource.id, storage = %storage.name, "file instance already recorded");
            return reconcile_instance(existing, filepath);
        }

        let body = NewFileInstance {
            file_resource: resource.id,
            storage: storage.id,
            filepath: filepath.map(String::from),
        };
        let created: FileInstance = self.post("file_instance", &body).await?;
        info!(
            resource = resource.id,
            file = %resource.filename,
            storage = %storage.name,
            instance = created.id,
            "recorded file instance"
        );
        Ok(created)
    }
}

impl Catalog for RestCatalog {
    fn get_storage<'a>(&'a self, name: &'a str) -> CatalogFuture<'a, Storage> {
        Box::pin(self.fetch_storage(name))
    }

    fn list_resources_for_tag<'a>(&'a self, tag: &'a str) -> CatalogFuture<'a, Vec<FileResource>> {
        Box::pin(async move {
            self.list(
                "file_resource",
                &[("sequencedataset__tags__name", tag.to_string())],
            )
            .await
        })
    }

    fn list_file_instances<'a>(
        &'a self,
        resource: &'a FileResource,
    ) -> CatalogFuture<'a, Vec<FileInstance>> {
        Box::pin(async move {
            self.list("file_instance", &[("file_resource", resource.id.to_string())])
                .await
        })
    }

    fn get_or_create_file_instance<'a>(
        &'a self,
        resource: &'a FileResource,
        storage: &'a Storage,
        filepath: Option<&'a str>,
    ) -> CatalogFuture<'a, FileInstance> {
        Box::pin(self.upsert_instance(resource, storage, filepath))
    }
}

impl JobCatalog for RestCatalog {
    fn find_transfer_job<'a>(&'a self, name: &'a str) -> CatalogFuture<'a, Option<FileTransferJob>> {
        Box::pin(async move {
            self.get_one("file_transfer", "transfer job", name, &[("name", name.to_string())])
                .await
        })
    }

    fn create_transfer_job<'a>(
        &'a self,
        job: &'a NewFileTransfer,
    ) -> CatalogFuture<'a, FileTransferJob> {
        Box::pin(async move { self.post("file_transfer", job).await })
    }

    fn transfer_job(&self, id: i64) -> CatalogFuture<'_, FileTransferJob> {
        Box::pin(async move {
            let key = id.to_string();
            self.get_one("file_transfer", "transfer job", &key, &[("id", key.clone())])
                .await?
                .ok_or(CatalogError::NotFound {
                    kind: "transfer job",
                    key,
                })
        })
    }

    fn simple_task(&self, id: i64) -> CatalogFuture<'_, TaskStatus> {
        Box::pin(async move {
            let key = id.to_string();
            self.get_one("simple_task", "task", &key, &[("id", key.clone())])
                .await?
                .ok_or(CatalogError::NotFound { kind: "task", key })
        })
    }
}

async fn check_status(url: &str, resp: reqwest::Response) -> Result<Vec<u8>, CatalogError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(CatalogError::Status {
            status: status.as_u16(),
            url: url.to_string(),
            body,
        });
    }
    Ok(resp.bytes().await?.to_vec())
}
