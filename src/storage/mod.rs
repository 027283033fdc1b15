//! Object storage for pose inputs and published outputs
//!
//! References use the `s3://bucket/key` form. [`LocalObjectStore`] keeps objects
//! on the local file system under `<root>/<bucket>/<key>`.

use log::{info, warn};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

use crate::model::OutputRefs;

/// Default folder for published outputs
pub const DEFAULT_OUTPUT_FOLDER: &str = "tpose-output";

const SCHEME: &str = "s3://";

/// Errors that can occur while moving objects
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Invalid object reference '{0}': expected s3://bucket/key")]
    InvalidUri(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Transfer of {uri} failed: {source}")]
    Transfer {
        uri: String,
        #[source]
        source: std::io::Error,
    },
}

/// A bucket and key pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectUri {
    pub bucket: String,
    pub key: String,
}

impl ObjectUri {
    pub fn new(bucket: &str, key: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            key: key.trim_start_matches('/').to_string(),
        }
    }

    pub fn is_remote(reference: &str) -> bool {
        reference.starts_with(SCHEME)
    }

    /// Final path component of the key
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

impl fmt::Display for ObjectUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}/{}", SCHEME, self.bucket, self.key)
    }
}

impl FromStr for ObjectUri {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(SCHEME)
            .ok_or_else(|| StorageError::InvalidUri(s.to_string()))?;
        match rest.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
                Ok(ObjectUri::new(bucket, key))
            }
            _ => Err(StorageError::InvalidUri(s.to_string())),
        }
    }
}

/// Durable storage collaborator
pub trait ObjectStore {
    /// Fetch `uri` into `dir` and return the local path
    fn download(&self, uri: &ObjectUri, dir: &Path) -> Result<PathBuf, StorageError>;

    /// Store the file at `path` under `uri`
    fn upload(&self, path: &Path, uri: &ObjectUri) -> Result<(), StorageError>;
}

/// File-system backed object store
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local location of an object
    pub fn object_path(&self, uri: &ObjectUri) -> PathBuf {
        let mut path = self.root.join(&uri.bucket);
        for part in uri.key.split('/').filter(|p| !p.is_empty() && *p != "..") {
            path.push(part);
        }
        path
    }
}

impl ObjectStore for LocalObjectStore {
    fn download(&self, uri: &ObjectUri, dir: &Path) -> Result<PathBuf, StorageError> {
        let source = self.object_path(uri);
        if !source.is_file() {
            return Err(StorageError::NotFound(uri.to_string()));
        }
        let target = dir.join(uri.file_name());
        fs::copy(&source, &target).map_err(|source| StorageError::Transfer {
            uri: uri.to_string(),
            source,
        })?;
        Ok(target)
    }

    fn upload(&self, path: &Path, uri: &ObjectUri) -> Result<(), StorageError> {
        let target = self.object_path(uri);
        let transfer = |source: std::io::Error| StorageError::Transfer {
            uri: uri.to_string(),
            source,
        };
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(transfer)?;
        }
        fs::copy(path, &target).map_err(transfer)?;
        Ok(())
    }
}

/// Turn an input reference into a local file, downloading remote objects into `work_dir`
pub fn resolve_input(store: &dyn ObjectStore, reference: &str, work_dir: &Path) -> Result<PathBuf, StorageError> {
    if ObjectUri::is_remote(reference) {
        let uri: ObjectUri = reference.parse()?;
        return store.download(&uri, work_dir);
    }

    let path = PathBuf::from(reference);
    if path.is_file() {
        Ok(path)
    } else {
        Err(StorageError::NotFound(reference.to_string()))
    }
}

/// Where a batch publishes its outputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub bucket: String,
    pub folder: String,
}

impl Destination {
    pub fn new(bucket: &str, folder: Option<&str>) -> Self {
        let folder = folder
            .map(|f| f.trim_matches('/'))
            .filter(|f| !f.is_empty())
            .unwrap_or(DEFAULT_OUTPUT_FOLDER);
        Self {
            bucket: bucket.to_string(),
            folder: folder.to_string(),
        }
    }

    fn object(&self, pose_id: &str, suffix: &str) -> ObjectUri {
        ObjectUri::new(&self.bucket, &format!("{}/{}_{}.pdb", self.folder, pose_id, suffix))
    }

    /// Destination of the optimized complex, honoring a per-pose override
    ///
    /// The override is either a full `s3://bucket/key` or a bare key in this bucket.
    fn complex_object(&self, pose_id: &str, structure_path: Option<&str>) -> ObjectUri {
        match structure_path.map(str::trim).filter(|p| !p.is_empty()) {
            Some(path) if ObjectUri::is_remote(path) => match path.parse::<ObjectUri>() {
                Ok(uri) => uri,
                Err(_) => {
                    let bucket = path[SCHEME.len()..].trim_end_matches('/');
                    let mut uri = self.object(pose_id, "complex_opt");
                    if !bucket.is_empty() {
                        uri.bucket = bucket.to_string();
                    }
                    uri
                }
            },
            Some(key) => ObjectUri::new(&self.bucket, key),
            None => self.object(pose_id, "complex_opt"),
        }
    }
}

fn publish_one(store: &dyn ObjectStore, pose_id: &str, local: Option<&str>, uri: ObjectUri) -> Option<String> {
    let local = Path::new(local?);
    if !local.is_file() {
        return None;
    }
    match store.upload(local, &uri) {
        Ok(()) => {
            info!("[{}] Uploaded {} to {}", pose_id, local.display(), uri);
            Some(uri.to_string())
        }
        Err(e) => {
            warn!("[{}] Upload of {} failed: {}", pose_id, local.display(), e);
            None
        }
    }
}

/// Upload every local output that exists and return the published references
///
/// A file that is missing or fails to upload gets no reference.
pub fn publish_outputs(
    store: &dyn ObjectStore,
    destination: &Destination,
    pose_id: &str,
    structure_path: Option<&str>,
    local: &OutputRefs,
) -> OutputRefs {
    OutputRefs {
        optimized_complex_pdb: publish_one(
            store,
            pose_id,
            local.optimized_complex_pdb.as_deref(),
            destination.complex_object(pose_id, structure_path),
        ),
        split_protein_pdb: publish_one(
            store,
            pose_id,
            local.split_protein_pdb.as_deref(),
            destination.object(pose_id, "protein"),
        ),
        split_ligand_pdb: publish_one(
            store,
            pose_id,
            local.split_ligand_pdb.as_deref(),
            destination.object(pose_id, "ligand_bound"),
        ),
        optimized_ligand_pdb: publish_one(
            store,
            pose_id,
            local.optimized_ligand_pdb.as_deref(),
            destination.object(pose_id, "ligand_opt"),
        ),
    }
}
