//! Fetching and decoding seams
//!
//! Sources and decoders tag their own failures (`Network` and `Decode`
//! respectively) so the scheduler never has to guess an error's kind.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::asset::locator::{AssetLocator, LocatorRegistry};
use crate::asset::model::ModelNode;
use crate::core::cancel::CancelHandle;
use crate::core::error::LoadError;

/// Boxed future returned by object-safe async seams
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Fetches the raw bytes behind a locator
pub trait AssetSource: Send + Sync + 'static {
    /// Fetch the payload. Implementations stop early once `cancel` fires.
    fn fetch<'a>(
        &'a self,
        locator: &'a AssetLocator,
        cancel: &'a CancelHandle,
    ) -> BoxFuture<'a, Result<Arc<[u8]>, LoadError>>;
}

/// Turns a payload into a model tree. Runs on the blocking pool.
pub trait AssetDecoder: Send + Sync + 'static {
    fn decode(&self, bytes: &[u8]) -> Result<ModelNode, LoadError>;
}

/// Source for local files, in-memory blobs and temporary locators.
///
/// Remote URLs need a caller-supplied source; this one rejects them.
pub struct LocalSource {
    locators: Arc<LocatorRegistry>,
}

impl LocalSource {
    pub fn new(locators: Arc<LocatorRegistry>) -> Self {
        Self { locators }
    }
}

impl AssetSource for LocalSource {
    fn fetch<'a>(
        &'a self,
        locator: &'a AssetLocator,
        cancel: &'a CancelHandle,
    ) -> BoxFuture<'a, Result<Arc<[u8]>, LoadError>> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(LoadError::Aborted(locator.asset_id()));
            }
            match locator {
                AssetLocator::Blob(bytes) => Ok(bytes.clone()),
                AssetLocator::Temporary(temp) => self.locators.resolve(temp).ok_or_else(|| {
                    LoadError::Network(format!("temporary locator {} has been revoked", temp))
                }),
                AssetLocator::File(path) => {
                    tokio::select! {
                        read = tokio::fs::read(path) => read
                            .map(Arc::from)
                            .map_err(|e| LoadError::Network(format!("{}: {}", path.display(), e))),
                        _ = cancel.cancelled() => Err(LoadError::Aborted(locator.asset_id())),
                    }
                }
                AssetLocator::Url(url) => Err(LoadError::Network(format!(
                    "no remote source configured for {}",
                    url
                ))),
            }
        })
    }
}
