use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Kind of a storage location.
///
/// Unknown kinds are kept verbatim so that the caller can reject them
/// explicitly instead of failing JSON decoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StorageKind {
    /// Path/host addressed filesystem reachable locally or over rsync.
    Server,
    /// Account/container addressed cloud object storage.
    Blob,
    /// Anything else the catalog reports.
    Other(String),
}

impl StorageKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Server => "server",
            Self::Blob => "blob",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for StorageKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "server" => Self::Server,
            "blob" => Self::Blob,
            _ => Self::Other(value),
        }
    }
}

impl From<StorageKind> for String {
    fn from(kind: StorageKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A storage record as returned by the catalog.
///
/// The address fields are kind specific; use [`Storage::descriptor`] to get
/// a validated view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Storage {
    pub id: i64,
    pub name: String,
    #[serde(rename = "storage_type")]
    pub kind: StorageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_container: Option<String>,
    /// Name of the environment variable holding the account key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_env: Option<String>,
}

impl Storage {
    /// A server storage rooted at `directory` on the local host.
    pub fn server(id: i64, name: &str, directory: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind: StorageKind::Server,
            storage_directory: Some(directory.to_string()),
            server_ip: None,
            username: None,
            storage_account: None,
            storage_container: None,
            credentials_env: None,
        }
    }

    /// A blob storage for `container` in `account`.
    pub fn blob(id: i64, name: &str, account: &str, container: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind: StorageKind::Blob,
            storage_directory: None,
            server_ip: None,
            username: None,
            storage_account: Some(account.to_string()),
            storage_container: Some(container.to_string()),
            credentials_env: None,
        }
    }

    /// Sets the host and login used for remote copies.
    pub fn on_host(mut self, server_ip: &str, username: &str) -> Self {
        self.server_ip = Some(server_ip.to_string());
        self.username = Some(username.to_string());
        self
    }

    /// Validates the kind-specific fields and returns a typed descriptor.
    pub fn descriptor(&self) -> Result<StorageDescriptor, ProtocolError> {
        match &self.kind {
            StorageKind::Server => {
                let directory = non_empty(&self.storage_directory)
                    .ok_or_else(|| self.invalid("server storage has no storage_directory"))?;
                Ok(StorageDescriptor::Server(ServerStorage {
                    id: self.id,
                    name: self.name.clone(),
                    directory: PathBuf::from(directory),
                    server_ip: non_empty(&self.server_ip).map(str::to_string),
                    username: non_empty(&self.username).map(str::to_string),
                }))
            }
            StorageKind::Blob => {
                let account = non_empty(&self.storage_account)
                    .ok_or_else(|| self.invalid("blob storage has no storage_account"))?;
                let container = non_empty(&self.storage_container)
                    .ok_or_else(|| self.invalid("blob storage has no storage_container"))?;
                let credentials_env = non_empty(&self.credentials_env)
                    .map(str::to_string)
                    .unwrap_or_else(|| default_key_env(account));
                Ok(StorageDescriptor::Blob(BlobStorage {
                    id: self.id,
                    name: self.name.clone(),
                    account: account.to_string(),
                    container: container.to_string(),
                    credentials_env,
                }))
            }
            StorageKind::Other(kind) => Err(ProtocolError::UnsupportedKind {
                name: self.name.clone(),
                kind: kind.clone(),
            }),
        }
    }

    fn invalid(&self, reason: &str) -> ProtocolError {
        ProtocolError::InvalidStorage {
            name: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Environment variable consulted for a blob account key when the storage
/// record does not name one: `AZURE_STORAGE_KEY_<ACCOUNT>`.
pub fn default_key_env(account: &str) -> String {
    let suffix: String = account
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("AZURE_STORAGE_KEY_{suffix}")
}

/// Validated storage address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageDescriptor {
    Server(ServerStorage),
    Blob(BlobStorage),
}

impl StorageDescriptor {
    pub fn kind(&self) -> StorageKind {
        match self {
            Self::Server(_) => StorageKind::Server,
            Self::Blob(_) => StorageKind::Blob,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Server(s) => &s.name,
            Self::Blob(b) => &b.name,
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            Self::Server(s) => s.id,
            Self::Blob(b) => b.id,
        }
    }
}

/// A filesystem storage rooted at `directory` on host `server_ip`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStorage {
    pub id: i64,
    pub name: String,
    pub directory: PathBuf,
    pub server_ip: Option<String>,
    pub username: Option<String>,
}

impl ServerStorage {
    /// Absolute path of a storage-relative path on this storage's host.
    pub fn local_path(&self, relative: &str) -> PathBuf {
        self.directory.join(relative)
    }

    /// rsync location (`user@host:/path`) for reaching `relative` from
    /// another host.
    pub fn remote_location(&self, relative: &str) -> String {
        let path = self.local_path(relative);
        match (&self.username, &self.server_ip) {
            (Some(user), Some(host)) => format!("{user}@{host}:{}", path.display()),
            (None, Some(host)) => format!("{host}:{}", path.display()),
            _ => path.display().to_string(),
        }
    }

    /// Both storages live behind the same network address.
    pub fn same_host(&self, other: &ServerStorage) -> bool {
        self.server_ip == other.server_ip
    }
}

/// A blob container in an object storage account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobStorage {
    pub id: i64,
    pub name: String,
    pub account: String,
    pub container: String,
    pub credentials_env: String,
}

/// The catalog's record of one logical file or directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileResource {
    pub id: i64,
    pub filename: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_folder: bool,
}

/// A fact: one copy of `file_resource` exists on `storage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInstance {
    pub id: i64,
    pub file_resource: i64,
    pub storage: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub storage_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filepath: Option<String>,
}

impl FileInstance {
    /// Storage-relative path of this copy; falls back to the resource's
    /// filename, which is where the catalog places new copies.
    pub fn relative_path<'a>(&'a self, resource: &'a FileResource) -> &'a str {
        self.filepath
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(&resource.filename)
    }

    pub fn is_on(&self, storage: &StorageDescriptor) -> bool {
        self.storage == storage.id()
            || (!self.storage_name.is_empty() && self.storage_name == storage.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_json() -> &'static str {
        r#"{"id":1,"name":"shahlab","storage_type":"server","storage_directory":"/shahlab/archive","server_ip":"10.0.0.5","username":"jngo"}"#
    }

    #[test]
    fn storage_kind_parses_known_and_unknown() {
        let s: Storage = serde_json::from_str(server_json()).unwrap();
        assert_eq!(s.kind, StorageKind::Server);

        let json = r#"{"id":2,"name":"tape","storage_type":"tape"}"#;
        let s: Storage = serde_json::from_str(json).unwrap();
        assert_eq!(s.kind, StorageKind::Other("tape".into()));
    }

    #[test]
    fn storage_kind_serializes_as_string() {
        assert_eq!(serde_json::to_string(&StorageKind::Blob).unwrap(), "\"blob\"");
        assert_eq!(
            serde_json::to_string(&StorageKind::Other("tape".into())).unwrap(),
            "\"tape\""
        );
    }

    #[test]
    fn server_descriptor() {
        let s: Storage = serde_json::from_str(server_json()).unwrap();
        let StorageDescriptor::Server(server) = s.descriptor().unwrap() else {
            panic!("expected server descriptor");
        };
        assert_eq!(server.directory, PathBuf::from("/shahlab/archive"));
        assert_eq!(
            server.local_path("run42/a.bam"),
            PathBuf::from("/shahlab/archive/run42/a.bam")
        );
        assert_eq!(
            server.remote_location("a.bam"),
            "jngo@10.0.0.5:/shahlab/archive/a.bam"
        );
    }

    #[test]
    fn server_without_directory_is_invalid() {
        let json = r#"{"id":1,"name":"s","storage_type":"server","storage_directory":""}"#;
        let s: Storage = serde_json::from_str(json).unwrap();
        assert!(matches!(
            s.descriptor(),
            Err(ProtocolError::InvalidStorage { .. })
        ));
    }

    #[test]
    fn blob_descriptor_defaults_key_env() {
        let json = r#"{"id":3,"name":"singlecellblob","storage_type":"blob","storage_account":"singlecell-data","storage_container":"data"}"#;
        let s: Storage = serde_json::from_str(json).unwrap();
        let StorageDescriptor::Blob(blob) = s.descriptor().unwrap() else {
            panic!("expected blob descriptor");
        };
        assert_eq!(blob.container, "data");
        assert_eq!(blob.credentials_env, "AZURE_STORAGE_KEY_SINGLECELL_DATA");
    }

    #[test]
    fn blob_without_container_is_invalid() {
        let json = r#"{"id":3,"name":"b","storage_type":"blob","storage_account":"acct"}"#;
        let s: Storage = serde_json::from_str(json).unwrap();
        assert!(s.descriptor().is_err());
    }

    #[test]
    fn other_kind_has_no_descriptor() {
        let json = r#"{"id":2,"name":"tape","storage_type":"tape"}"#;
        let s: Storage = serde_json::from_str(json).unwrap();
        assert!(matches!(
            s.descriptor(),
            Err(ProtocolError::UnsupportedKind { .. })
        ));
    }

    #[test]
    fn same_host_compares_addresses() {
        let a = ServerStorage {
            id: 1,
            name: "a".into(),
            directory: "/a".into(),
            server_ip: Some("10.0.0.1".into()),
            username: None,
        };
        let mut b = a.clone();
        b.directory = "/b".into();
        assert!(a.same_host(&b));
        b.server_ip = Some("10.0.0.2".into());
        assert!(!a.same_host(&b));
    }

    #[test]
    fn instance_relative_path_falls_back_to_filename() {
        let resource = FileResource {
            id: 7,
            filename: "run42/SA123.bam".into(),
            size: 10,
            created: None,
            is_folder: false,
        };
        let mut instance = FileInstance {
            id: 1,
            file_resource: 7,
            storage: 1,
            storage_name: String::new(),
            filepath: None,
        };
        assert_eq!(instance.relative_path(&resource), "run42/SA123.bam");
        instance.filepath = Some("legacy/SA123.bam".into());
        assert_eq!(instance.relative_path(&resource), "legacy/SA123.bam");
    }

    #[test]
    fn file_resource_tolerates_missing_optional_fields() {
        let json = r#"{"id":9,"filename":"x.bai","size":120}"#;
        let r: FileResource = serde_json::from_str(json).unwrap();
        assert!(!r.is_folder);
        assert!(r.created.is_none());
    }
}
