//! LRU caches for GPU resources
//!
//! [`ResourceCache`] keeps handles keyed by a content/config signature. When
//! full, inserting a new key evicts exactly one entry, the least recently
//! used, and disposes it. [`ResourcePool`] groups the material and texture caches
//! with a few prebuilt shapes that can stand in for a model while it loads
//! or after it fails.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use crate::asset::primitives::{box_geometry, plane_geometry, sphere_geometry};
use crate::asset::{Geometry, Texture};
use crate::core::config::CacheConfig;
use crate::core::{Vec3, Vec4};
use crate::optimize::MaterialTier;
use crate::render::gpu::{
    Disposable, Drawable, GpuGeometry, GpuMaterial, GpuTexture, Ownership, RenderNode, ResourceLedger,
};

/// Hit/miss accounting for one cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    /// Hits over lookups, 0 when nothing was looked up
    pub fn hit_ratio(&self) -> f32 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f32 / total as f32
        }
    }
}

/// LRU cache of disposable handles
///
/// Access order is tracked so the least recently used entry is evicted when
/// the cache is full. Evicted and cleared entries are disposed.
pub struct ResourceCache<V> {
    /// Map of signature to handle
    entries: HashMap<String, V>,
    /// Access order: oldest first, newest last
    access_order: Vec<String>,
    max_entries: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<V: Disposable + Clone> ResourceCache<V> {
    /// Create a cache holding at most `max_entries` handles (at least one)
    pub fn new(max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        Self {
            entries: HashMap::with_capacity(max_entries),
            access_order: Vec::with_capacity(max_entries),
            max_entries,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    /// Look up a handle, marking it recently used. Not counted as a hit.
    pub fn get(&mut self, key: &str) -> Option<V> {
        let value = self.entries.get(key)?.clone();
        self.touch(key);
        Some(value)
    }

    /// Return the cached handle on a hit, otherwise build, store and return it
    pub fn get_or_create(&mut self, key: &str, factory: impl FnOnce() -> V) -> V {
        if let Some(value) = self.get(key) {
            self.hits += 1;
            return value;
        }
        self.misses += 1;
        let value = factory();
        self.insert(key, value.clone());
        value
    }

    /// Fallible variant of [`get_or_create`](Self::get_or_create). Nothing is
    /// stored when the factory fails.
    pub fn get_or_try_create<E>(
        &mut self,
        key: &str,
        factory: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        if let Some(value) = self.get(key) {
            self.hits += 1;
            return Ok(value);
        }
        self.misses += 1;
        let value = factory()?;
        self.insert(key, value.clone());
        Ok(value)
    }

    /// Insert a handle, evicting and disposing the least recently used entry
    /// first when full. A replaced handle under the same key is disposed too.
    ///
    /// Returns the evicted key, if any.
    pub fn insert(&mut self, key: &str, value: V) -> Option<String> {
        if let Some(previous) = self.entries.remove(key) {
            self.remove_from_access_order(key);
            previous.dispose();
        }

        let evicted = if self.entries.len() >= self.max_entries {
            self.evict_oldest()
        } else {
            None
        };

        self.entries.insert(key.to_string(), value);
        self.access_order.push(key.to_string());
        evicted
    }

    /// Remove a handle without disposing it
    pub fn remove(&mut self, key: &str) -> Option<V> {
        let value = self.entries.remove(key)?;
        self.remove_from_access_order(key);
        Some(value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    /// Evict and dispose the least recently used entry
    pub fn evict_oldest(&mut self) -> Option<String> {
        let key = self.access_order.first()?.clone();
        if let Some(value) = self.remove(&key) {
            value.dispose();
            self.evictions += 1;
            log::debug!("Evicted cached resource '{}'", key);
        }
        Some(key)
    }

    /// Dispose every handle and empty the cache. Handles already disposed
    /// elsewhere are skipped. Returns how many were released.
    pub fn clear(&mut self) -> usize {
        self.access_order.clear();
        self.entries
            .drain()
            .filter(|(_, value)| value.dispose())
            .count()
    }

    /// Clear and zero the counters
    pub fn reset(&mut self) -> usize {
        let released = self.clear();
        self.hits = 0;
        self.misses = 0;
        self.evictions = 0;
        released
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            capacity: self.max_entries,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
        }
    }

    /// Iterate over cached keys, least recently used first
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.access_order.iter().map(|k| k.as_str())
    }

    fn touch(&mut self, key: &str) {
        self.remove_from_access_order(key);
        self.access_order.push(key.to_string());
    }

    fn remove_from_access_order(&mut self, key: &str) {
        if let Some(pos) = self.access_order.iter().position(|k| k == key) {
            self.access_order.remove(pos);
        }
    }
}

/// Prebuilt placeholder shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PrimitiveShape {
    Box,
    Sphere,
    Plane,
}

impl PrimitiveShape {
    pub const ALL: [PrimitiveShape; 3] = [PrimitiveShape::Box, PrimitiveShape::Sphere, PrimitiveShape::Plane];

    fn build(self) -> Geometry {
        match self {
            PrimitiveShape::Box => box_geometry(Vec3::ONE),
            PrimitiveShape::Sphere => sphere_geometry(0.5, 24, 12),
            PrimitiveShape::Plane => plane_geometry(1.0),
        }
    }
}

/// Parts of a pooled material. Textures should come from the same pool.
pub struct MaterialParts {
    pub name: String,
    pub tier: MaterialTier,
    pub base_color: Vec4,
    pub base_color_texture: Option<Arc<GpuTexture>>,
    pub normal_texture: Option<Arc<GpuTexture>>,
}

/// Per-kind cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PoolStats {
    pub materials: CacheStats,
    pub textures: CacheStats,
    pub primitives: usize,
}

impl PoolStats {
    pub fn hit_ratio(&self) -> f32 {
        let hits = self.materials.hits + self.textures.hits;
        let total = hits + self.materials.misses + self.textures.misses;
        if total == 0 { 0.0 } else { hits as f32 / total as f32 }
    }
}

/// Shared GPU resources: LRU caches for materials and textures plus the
/// placeholder shapes.
///
/// Everything created here is [`Ownership::Pooled`]; model disposal leaves
/// it alone and only the pool disposes it. Model geometry is not pooled: each
/// prepared model owns its LOD buffers so a release frees them at once.
pub struct ResourcePool {
    ledger: Arc<ResourceLedger>,
    materials: Mutex<ResourceCache<Arc<GpuMaterial>>>,
    textures: Mutex<ResourceCache<Arc<GpuTexture>>>,
    primitives: HashMap<PrimitiveShape, Arc<GpuGeometry>>,
    placeholder_material: Arc<GpuMaterial>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl ResourcePool {
    pub fn new(config: &CacheConfig, ledger: Arc<ResourceLedger>) -> Self {
        let primitives = PrimitiveShape::ALL
            .into_iter()
            .map(|shape| {
                let label = format!("primitive:{:?}", shape);
                (shape, GpuGeometry::upload(&ledger, label, &shape.build(), Ownership::Pooled))
            })
            .collect();
        let placeholder_material = GpuMaterial::new(
            &ledger,
            "placeholder",
            MaterialTier::Low,
            Vec4::new(0.6, 0.6, 0.6, 1.0),
            None,
            None,
            Ownership::Pooled,
        );

        Self {
            materials: Mutex::new(ResourceCache::new(config.max_materials)),
            textures: Mutex::new(ResourceCache::new(config.max_textures)),
            primitives,
            placeholder_material,
            ledger,
        }
    }

    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    pub fn get_or_create_texture(&self, key: &str, build: impl FnOnce() -> Texture) -> Arc<GpuTexture> {
        lock(&self.textures).get_or_create(key, || {
            GpuTexture::upload(&self.ledger, &build(), Ownership::Pooled)
        })
    }

    pub fn get_or_create_material(
        &self,
        key: &str,
        build: impl FnOnce() -> MaterialParts,
    ) -> Arc<GpuMaterial> {
        lock(&self.materials).get_or_create(key, || {
            let parts = build();
            GpuMaterial::new(
                &self.ledger,
                parts.name,
                parts.tier,
                parts.base_color,
                parts.base_color_texture,
                parts.normal_texture,
                Ownership::Pooled,
            )
        })
    }

    /// Shared placeholder geometry, built once at pool creation
    pub fn primitive(&self, shape: PrimitiveShape) -> Option<Arc<GpuGeometry>> {
        self.primitives.get(&shape).cloned()
    }

    pub fn placeholder_material(&self) -> Arc<GpuMaterial> {
        self.placeholder_material.clone()
    }

    /// Single-drawable node showing `shape` with the placeholder material
    pub fn placeholder_node(&self, shape: PrimitiveShape) -> RenderNode {
        let mut node = RenderNode::new(format!("placeholder:{:?}", shape));
        if let Some(geometry) = self.primitive(shape) {
            node.drawables.push(Drawable {
                lods: vec![geometry],
                material: self.placeholder_material(),
            });
        }
        node
    }

    /// Dispose every cached handle. Placeholder shapes are kept.
    pub fn clear(&self) -> usize {
        // Materials first so their textures are released through the texture cache
        let materials = lock(&self.materials).clear();
        let textures = lock(&self.textures).clear();
        let released = materials + textures;
        log::debug!("Cleared resource pool ({} handles released)", released);
        released
    }

    /// Clear all caches and zero their counters
    pub fn reset(&self) -> usize {
        lock(&self.materials).reset() + lock(&self.textures).reset()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            materials: lock(&self.materials).stats(),
            textures: lock(&self.textures).stats(),
            primitives: self.primitives.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn triangle() -> Geometry {
        Geometry::new(vec![Vec3::ZERO, Vec3::X, Vec3::Y])
    }

    fn upload(ledger: &Arc<ResourceLedger>, label: &str) -> Arc<GpuGeometry> {
        GpuGeometry::upload(ledger, label, &triangle(), Ownership::Pooled)
    }

    #[test]
    fn test_get_or_create_calls_factory_once() {
        let ledger = ResourceLedger::new();
        let mut cache = ResourceCache::new(4);
        let calls = Cell::new(0);

        let first = cache.get_or_create("k", || {
            calls.set(calls.get() + 1);
            upload(&ledger, "k")
        });
        let second = cache.get_or_create("k", || {
            calls.set(calls.get() + 1);
            upload(&ledger, "k")
        });

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.get(), 1);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert_eq!(stats.hit_ratio(), 0.5);
    }

    #[test]
    fn test_insert_past_capacity_evicts_one() {
        let ledger = ResourceLedger::new();
        let mut cache = ResourceCache::new(2);
        let g1 = cache.get_or_create("g1", || upload(&ledger, "g1"));
        cache.get_or_create("g2", || upload(&ledger, "g2"));
        cache.get_or_create("g3", || upload(&ledger, "g3"));

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains("g1"));
        assert!(g1.is_disposed());
        assert!(cache.get("g2").is_some());
        assert!(cache.get("g3").is_some());
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(ledger.snapshot().geometries, 2);
    }

    #[test]
    fn test_recently_used_survives_eviction() {
        let ledger = ResourceLedger::new();
        let mut cache = ResourceCache::new(2);
        cache.get_or_create("a", || upload(&ledger, "a"));
        cache.get_or_create("b", || upload(&ledger, "b"));
        cache.get("a");
        cache.get_or_create("c", || upload(&ledger, "c"));

        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert_eq!(cache.keys().collect::<Vec<_>>(), vec!["a", "c"]);
    }

    #[test]
    fn test_failed_factory_stores_nothing() {
        let mut cache: ResourceCache<Arc<GpuGeometry>> = ResourceCache::new(2);
        let result: Result<_, &str> = cache.get_or_try_create("bad", || Err("boom"));
        assert!(result.is_err());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_clear_tolerates_disposed_handles() {
        let ledger = ResourceLedger::new();
        let mut cache = ResourceCache::new(4);
        let a = cache.get_or_create("a", || upload(&ledger, "a"));
        cache.get_or_create("b", || upload(&ledger, "b"));
        a.dispose();

        assert_eq!(cache.clear(), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.clear(), 0);
        assert_eq!(ledger.snapshot().live_total(), 0);
    }

    #[test]
    fn test_pool_shares_and_reports() {
        let ledger = ResourceLedger::new();
        let pool = ResourcePool::new(&CacheConfig::default(), ledger.clone());
        assert_eq!(pool.stats().primitives, 3);

        let texture = pool.get_or_create_texture("albedo@1024", || Texture::placeholder("albedo", 64, 64));
        let again = pool.get_or_create_texture("albedo@1024", || panic!("should hit"));
        assert!(Arc::ptr_eq(&texture, &again));
        assert!(texture.is_pooled());

        let material = pool.get_or_create_material("skin:high", || MaterialParts {
            name: "skin".into(),
            tier: MaterialTier::High,
            base_color: Vec4::ONE,
            base_color_texture: Some(texture.clone()),
            normal_texture: None,
        });
        assert!(material.is_pooled());

        let stats = pool.stats();
        assert_eq!(stats.textures.entries, 1);
        assert_eq!(stats.textures.hits, 1);
        assert_eq!(stats.materials.misses, 1);
        assert!((stats.hit_ratio() - 1.0 / 3.0).abs() < 1e-6);

        // Clearing releases cached handles but keeps placeholders usable
        assert_eq!(pool.clear(), 2);
        assert!(texture.is_disposed());
        let node = pool.placeholder_node(PrimitiveShape::Sphere);
        assert_eq!(node.drawable_count(), 1);
        assert_eq!(ledger.snapshot().geometries, 3);
        assert_eq!(ledger.snapshot().materials, 1);
    }
}
