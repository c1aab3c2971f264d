//! Opens the slatedb store every subsystem shares. One engine instance owns
//! one store; the backend decides whether it lives on the local filesystem
//! or entirely in memory (tests, ephemeral deployments).

use std::fs;
use std::path::Path;
use std::sync::Arc;

use slatedb::object_store::ObjectStore;
use slatedb::{Db, Error as SlateError};
use thiserror::Error;

use crate::settings::Backend;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("slatedb error: {0}")]
    Slate(#[from] SlateError),
    #[error("unusable store root {path}: {reason}")]
    BadStoreRoot { path: String, reason: String },
}

fn bad_root(path: &str, reason: impl std::fmt::Display) -> StorageError {
    StorageError::BadStoreRoot {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

/// An object store plus the absolute path slatedb should address it under.
pub struct ResolvedStore {
    pub store: Arc<dyn ObjectStore>,
    pub canonical_path: String,
}

/// Map a configured backend to a concrete object store. The fs backend
/// creates its root directory on first use and always addresses it by
/// absolute path, since relative paths get URL-encoded inconsistently on
/// the way into slatedb.
pub fn resolve_object_store(backend: &Backend, path: &str) -> Result<ResolvedStore, StorageError> {
    match backend {
        Backend::Fs => {
            let root = Path::new(path);
            if !root.exists() {
                fs::create_dir_all(root).map_err(|e| bad_root(path, e))?;
            }
            let canonical_path = root
                .canonicalize()
                .map_err(|e| bad_root(path, e))?
                .to_string_lossy()
                .to_string();
            // slatedb's re-exported object_store, so the trait objects match
            let fs = slatedb::object_store::local::LocalFileSystem::new_with_prefix(
                &canonical_path,
            )
            .map_err(|e| bad_root(path, e))?;
            Ok(ResolvedStore {
                store: Arc::new(fs),
                canonical_path,
            })
        }
        Backend::Memory => Ok(ResolvedStore {
            store: Arc::new(slatedb::object_store::memory::InMemory::new()),
            canonical_path: path.to_string(),
        }),
    }
}

/// Open the shared key-value store for a queue engine instance. Tests pass a
/// short `flush_interval_ms` so writes become durable almost immediately.
pub async fn open_db(
    backend: &Backend,
    path: &str,
    flush_interval_ms: Option<u64>,
) -> Result<Arc<Db>, StorageError> {
    let resolved = resolve_object_store(backend, path)?;
    let mut db_builder = slatedb::DbBuilder::new(resolved.canonical_path.as_str(), resolved.store);
    if let Some(flush_ms) = flush_interval_ms {
        let settings = slatedb::config::Settings {
            flush_interval: Some(std::time::Duration::from_millis(flush_ms)),
            ..Default::default()
        };
        db_builder = db_builder.with_settings(settings);
    }
    let db = db_builder.build().await?;
    Ok(Arc::new(db))
}
