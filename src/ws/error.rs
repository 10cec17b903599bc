use thiserror::Error;

use crate::db::{ContentError, StoreError};
use crate::models::DocumentError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("room '{0}' does not name a file")]
    NotADocument(String),
    #[error("content store returned no content for '{0}'")]
    MissingContent(String),
    #[error(transparent)]
    Content(#[from] ContentError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Document(#[from] DocumentError),
}
