#![warn(missing_docs)]

//! Tidepool storage subsystem: one facade over local, object-store, SFTP and remote backends
//!
//! Storage (path resolution, write gate) → Arc<dyn StorageDriver> → Posix | CIFS | S3 | GCS | SFTP | Remote
//! Remote → ProtocolClient ⇄ ProtocolServer → storage handlers → local Storage

pub mod cifs;
pub mod config;
pub mod driver;
pub mod gcs;
pub mod http;
pub mod info;
pub mod posix;
pub mod read;
pub mod remote;
pub mod remote_server;
pub mod s3;
pub mod s3_auth;
pub mod s3_xml;
pub mod sftp;
pub(crate) mod sftp_proto;
pub mod storage;
pub mod write;

#[cfg(test)]
mod s3_mock;
#[cfg(test)]
mod sftp_test_server;

pub use cifs::CifsStorage;
pub use config::{BackendConfig, RepoConfig};
pub use driver::{ReadOptions, StorageDriver, WriteOptions, MODE_FILE_DEFAULT, MODE_PATH_DEFAULT};
pub use gcs::{GcsConfig, GcsStorage};
pub use http::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
pub use info::{Feature, Features, InfoLevel, StorageInfo, StorageType};
pub use posix::PosixStorage;
pub use read::StorageRead;
pub use remote::RemoteStorage;
pub use remote_server::register_storage_handlers;
pub use s3::{S3Config, S3Storage, S3UriStyle};
pub use sftp::{SftpConfig, SftpStorage};
pub use storage::{
    dry_run, set_dry_run, InfoOptions, ListOptions, PathExpressionFn, SortOrder, Storage,
    StorageOptions,
};
pub use write::StorageWrite;
