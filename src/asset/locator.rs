//! Asset locators and the temporary (blob) locator registry

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use base64::Engine;

use crate::core::error::LoadError;
use crate::core::types::AssetId;

/// Prefix of every locator issued by [`LocatorRegistry`]
pub const TEMP_LOCATOR_PREFIX: &str = "blob:figview/";

/// A `blob:` style locator pointing at bytes held by a [`LocatorRegistry`]
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TempLocator(String);

impl TempLocator {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TempLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where an asset's bytes come from
#[derive(Clone, Debug, PartialEq)]
pub enum AssetLocator {
    /// Remote resource, fetched by a caller-supplied source
    Url(String),
    /// Local file
    File(PathBuf),
    /// In-memory payload
    Blob(Arc<[u8]>),
    /// Payload registered in a [`LocatorRegistry`]
    Temporary(TempLocator),
}

impl AssetLocator {
    /// Parse a textual locator.
    ///
    /// ```
    /// use figview::asset::AssetLocator;
    ///
    /// assert!(matches!(AssetLocator::parse("https://cdn.example/fig.obj").unwrap(), AssetLocator::Url(_)));
    /// assert!(matches!(AssetLocator::parse("models/fig.obj").unwrap(), AssetLocator::File(_)));
    /// let blob = AssetLocator::parse("data:model/obj;base64,diAwIDAgMA==").unwrap();
    /// assert!(matches!(blob, AssetLocator::Blob(ref b) if &b[..] == b"v 0 0 0"));
    /// ```
    pub fn parse(text: &str) -> Result<Self, LoadError> {
        let text = text.trim();
        if text.starts_with("http://") || text.starts_with("https://") {
            Ok(AssetLocator::Url(text.to_string()))
        } else if let Some(path) = text.strip_prefix("file://") {
            Ok(AssetLocator::File(PathBuf::from(path)))
        } else if text.starts_with("blob:") {
            Ok(AssetLocator::Temporary(TempLocator(text.to_string())))
        } else if let Some(rest) = text.strip_prefix("data:") {
            parse_data_url(rest).map(AssetLocator::Blob)
        } else if text.is_empty() {
            Err(LoadError::Network("empty asset locator".into()))
        } else {
            Ok(AssetLocator::File(PathBuf::from(text)))
        }
    }

    /// Stable identity for this locator. Blobs are identified by content.
    pub fn asset_id(&self) -> AssetId {
        match self {
            AssetLocator::Url(url) => {
                let end = url.find('#').unwrap_or(url.len());
                url[..end].to_string()
            }
            AssetLocator::File(path) => format!("file:{}", path.display()),
            AssetLocator::Blob(bytes) => format!("blob-{:016x}", fnv1a(bytes)),
            AssetLocator::Temporary(temp) => temp.0.clone(),
        }
    }
}

fn parse_data_url(rest: &str) -> Result<Arc<[u8]>, LoadError> {
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| LoadError::Decode("data locator has no payload".into()))?;
    if meta.ends_with(";base64") {
        base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map(Arc::from)
            .map_err(|e| LoadError::Decode(format!("invalid base64 in data locator: {}", e)))
    } else {
        Ok(Arc::from(payload.as_bytes()))
    }
}

/// 64-bit FNV-1a, stable across runs and platforms
fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, &b| (hash ^ b as u64).wrapping_mul(PRIME))
}

#[derive(Default)]
struct RegistryState {
    blobs: HashMap<TempLocator, Arc<[u8]>>,
    /// Current locator per logical owner
    owners: HashMap<String, TempLocator>,
}

/// Issues and revokes temporary locators for in-memory payloads.
///
/// Creating a locator for an owner that already holds one revokes the old
/// locator first, so each logical resource has at most one live locator.
#[derive(Default)]
pub struct LocatorRegistry {
    state: Mutex<RegistryState>,
}

impl LocatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `blob` for `owner`, revoking the owner's previous locator
    pub fn create(&self, owner: &str, blob: Arc<[u8]>) -> TempLocator {
        let locator = TempLocator(format!("{}{}", TEMP_LOCATOR_PREFIX, uuid::Uuid::new_v4()));
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = state.owners.insert(owner.to_string(), locator.clone()) {
            state.blobs.remove(&previous);
            log::trace!("Revoked previous locator {} for {}", previous, owner);
        }
        state.blobs.insert(locator.clone(), blob);
        locator
    }

    /// Revoke a locator. Returns false if it was not live.
    pub fn revoke(&self, locator: &TempLocator) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let removed = state.blobs.remove(locator).is_some();
        state.owners.retain(|_, l| l != locator);
        removed
    }

    /// Bytes behind a live locator
    pub fn resolve(&self, locator: &TempLocator) -> Option<Arc<[u8]>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.blobs.get(locator).cloned()
    }

    /// Current locator held by `owner`
    pub fn locator_for(&self, owner: &str) -> Option<TempLocator> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.owners.get(owner).cloned()
    }

    /// Revoke every live locator, returning how many were revoked
    pub fn revoke_all(&self) -> usize {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let count = state.blobs.len();
        state.blobs.clear();
        state.owners.clear();
        count
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).blobs.len()
    }
}
