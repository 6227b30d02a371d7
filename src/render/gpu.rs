//! GPU-backed resource handles and leak accounting
//!
//! Each handle registers its allocation with a shared [`ResourceLedger`] on
//! creation and unregisters it exactly once, on the first `dispose()` or on
//! drop, whichever comes first. The ledger therefore shows every handle that
//! is still alive, which is how tests catch leaked previews.

use std::sync::{Arc, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

use crate::asset::{Geometry, ShadingModel, Texture};
use crate::core::Vec4;
use crate::math::Bounds;
use crate::optimize::MaterialTier;

/// Kind of GPU resource
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ResourceKind {
    Geometry,
    Material,
    Texture,
}

/// Who is responsible for disposing a handle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum Ownership {
    /// Disposed with the model that uses it
    #[default]
    Owned,
    /// Shared through the resource pool; only the pool disposes it
    Pooled,
}

/// Snapshot of live GPU allocations
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LedgerSnapshot {
    pub geometries: usize,
    pub materials: usize,
    pub textures: usize,
    pub bytes: usize,
}

impl LedgerSnapshot {
    pub fn live_total(&self) -> usize {
        self.geometries + self.materials + self.textures
    }
}

/// Process-wide counters of live GPU allocations
#[derive(Debug, Default)]
pub struct ResourceLedger {
    geometries: AtomicUsize,
    materials: AtomicUsize,
    textures: AtomicUsize,
    bytes: AtomicUsize,
    next_id: AtomicU64,
}

impl ResourceLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn counter(&self, kind: ResourceKind) -> &AtomicUsize {
        match kind {
            ResourceKind::Geometry => &self.geometries,
            ResourceKind::Material => &self.materials,
            ResourceKind::Texture => &self.textures,
        }
    }

    fn allocate(&self, kind: ResourceKind, bytes: usize) -> u64 {
        self.counter(kind).fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn free(&self, kind: ResourceKind, bytes: usize) {
        self.counter(kind).fetch_sub(1, Ordering::Relaxed);
        self.bytes.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub fn live(&self, kind: ResourceKind) -> usize {
        self.counter(kind).load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            geometries: self.geometries.load(Ordering::Relaxed),
            materials: self.materials.load(Ordering::Relaxed),
            textures: self.textures.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

/// One registered allocation; released at most once
#[derive(Debug)]
struct Allocation {
    id: u64,
    kind: ResourceKind,
    bytes: usize,
    ownership: Ownership,
    disposed: AtomicBool,
    ledger: Arc<ResourceLedger>,
}

impl Allocation {
    fn new(ledger: &Arc<ResourceLedger>, kind: ResourceKind, bytes: usize, ownership: Ownership) -> Self {
        let id = ledger.allocate(kind, bytes);
        Self {
            id,
            kind,
            bytes,
            ownership,
            disposed: AtomicBool::new(false),
            ledger: ledger.clone(),
        }
    }

    fn release(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.ledger.free(self.kind, self.bytes);
        true
    }

    fn is_released(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        if self.release() {
            log::debug!("{:?} #{} released on drop without dispose", self.kind, self.id);
        }
    }
}

/// A resource whose GPU memory can be released explicitly
pub trait Disposable {
    /// Release GPU memory. Returns true only for the call that released it.
    fn dispose(&self) -> bool;

    fn is_disposed(&self) -> bool;
}

impl<T: Disposable + ?Sized> Disposable for Arc<T> {
    fn dispose(&self) -> bool {
        (**self).dispose()
    }

    fn is_disposed(&self) -> bool {
        (**self).is_disposed()
    }
}

/// Vertex/index buffers for one geometry
#[derive(Debug)]
pub struct GpuGeometry {
    label: String,
    triangle_count: usize,
    vertex_count: usize,
    bounds: Option<Bounds>,
    alloc: Allocation,
}

impl GpuGeometry {
    /// Upload a geometry's buffers
    pub fn upload(
        ledger: &Arc<ResourceLedger>,
        label: impl Into<String>,
        geometry: &Geometry,
        ownership: Ownership,
    ) -> Arc<Self> {
        let alloc = Allocation::new(ledger, ResourceKind::Geometry, geometry.byte_size(), ownership);
        Arc::new(Self {
            label: label.into(),
            triangle_count: geometry.triangle_count(),
            vertex_count: geometry.vertex_count(),
            bounds: geometry.bounds,
            alloc,
        })
    }

    pub fn id(&self) -> u64 {
        self.alloc.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn triangle_count(&self) -> usize {
        self.triangle_count
    }

    pub fn vertex_count(&self) -> usize {
        self.vertex_count
    }

    pub fn bounds(&self) -> Option<Bounds> {
        self.bounds
    }

    pub fn byte_size(&self) -> usize {
        self.alloc.bytes
    }

    pub fn ownership(&self) -> Ownership {
        self.alloc.ownership
    }

    pub fn is_pooled(&self) -> bool {
        self.alloc.ownership == Ownership::Pooled
    }
}

impl Disposable for GpuGeometry {
    fn dispose(&self) -> bool {
        self.alloc.release()
    }

    fn is_disposed(&self) -> bool {
        self.alloc.is_released()
    }
}

/// Texture memory plus sampler state
#[derive(Debug)]
pub struct GpuTexture {
    source_id: String,
    width: u32,
    height: u32,
    mip_levels: u32,
    alloc: Allocation,
}

impl GpuTexture {
    pub fn upload(ledger: &Arc<ResourceLedger>, texture: &Texture, ownership: Ownership) -> Arc<Self> {
        let alloc = Allocation::new(ledger, ResourceKind::Texture, texture.byte_size(), ownership);
        Arc::new(Self {
            source_id: texture.id.clone(),
            width: texture.width,
            height: texture.height,
            mip_levels: texture.mip_level_count(),
            alloc,
        })
    }

    pub fn id(&self) -> u64 {
        self.alloc.id
    }

    /// Id of the source texture this was uploaded from
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    pub fn byte_size(&self) -> usize {
        self.alloc.bytes
    }

    pub fn is_pooled(&self) -> bool {
        self.alloc.ownership == Ownership::Pooled
    }
}

impl Disposable for GpuTexture {
    fn dispose(&self) -> bool {
        self.alloc.release()
    }

    fn is_disposed(&self) -> bool {
        self.alloc.is_released()
    }
}

/// Compiled shading program state with its bound textures
#[derive(Debug)]
pub struct GpuMaterial {
    name: String,
    shading: ShadingModel,
    tier: MaterialTier,
    base_color: Vec4,
    base_color_texture: Option<Arc<GpuTexture>>,
    normal_texture: Option<Arc<GpuTexture>>,
    alloc: Allocation,
}

/// Uniform block size charged per material
const MATERIAL_UNIFORM_BYTES: usize = 256;

impl GpuMaterial {
    pub fn new(
        ledger: &Arc<ResourceLedger>,
        name: impl Into<String>,
        tier: MaterialTier,
        base_color: Vec4,
        base_color_texture: Option<Arc<GpuTexture>>,
        normal_texture: Option<Arc<GpuTexture>>,
        ownership: Ownership,
    ) -> Arc<Self> {
        let alloc = Allocation::new(ledger, ResourceKind::Material, MATERIAL_UNIFORM_BYTES, ownership);
        Arc::new(Self {
            name: name.into(),
            shading: tier.shading_model(),
            tier,
            base_color,
            base_color_texture,
            normal_texture,
            alloc,
        })
    }

    pub fn id(&self) -> u64 {
        self.alloc.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shading(&self) -> ShadingModel {
        self.shading
    }

    pub fn tier(&self) -> MaterialTier {
        self.tier
    }

    pub fn base_color(&self) -> Vec4 {
        self.base_color
    }

    pub fn textures(&self) -> impl Iterator<Item = &Arc<GpuTexture>> {
        self.base_color_texture.iter().chain(self.normal_texture.iter())
    }

    pub fn is_pooled(&self) -> bool {
        self.alloc.ownership == Ownership::Pooled
    }
}

impl Disposable for GpuMaterial {
    /// Releases the material and every bound texture it owns. Pooled textures
    /// stay alive for other materials.
    fn dispose(&self) -> bool {
        if !self.alloc.release() {
            return false;
        }
        for texture in self.textures() {
            if !texture.is_pooled() {
                texture.dispose();
            }
        }
        true
    }

    fn is_disposed(&self) -> bool {
        self.alloc.is_released()
    }
}

/// One drawable mesh: every LOD of its geometry plus its material
#[derive(Debug, Clone)]
pub struct Drawable {
    /// Index 0 is the highest detail
    pub lods: Vec<Arc<GpuGeometry>>,
    pub material: Arc<GpuMaterial>,
}

impl Drawable {
    /// Geometry for an LOD level, clamped to the coarsest available
    pub fn geometry_for_lod(&self, level: usize) -> Option<&Arc<GpuGeometry>> {
        self.lods.get(level.min(self.lods.len().saturating_sub(1)))
    }
}

/// Node of a displayable scene tree
#[derive(Debug, Clone, Default)]
pub struct RenderNode {
    pub name: String,
    pub drawables: Vec<Drawable>,
    pub children: Vec<RenderNode>,
}

impl RenderNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Drawables in this node and all descendants
    pub fn drawable_count(&self) -> usize {
        self.drawables.len() + self.children.iter().map(|c| c.drawable_count()).sum::<usize>()
    }

    /// Triangles drawn at the given LOD level
    pub fn triangle_count_at(&self, level: usize) -> usize {
        let own: usize = self
            .drawables
            .iter()
            .filter_map(|d| d.geometry_for_lod(level))
            .map(|g| g.triangle_count())
            .sum();
        own + self.children.iter().map(|c| c.triangle_count_at(level)).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.drawables.is_empty() && self.children.is_empty()
    }
}

/// A displayable model prepared for one preview.
///
/// The node tree sits behind a lock so disposal can detach it while other
/// holders still reference the model.
#[derive(Debug)]
pub struct RenderModel {
    asset_id: String,
    tier: MaterialTier,
    lod_count: usize,
    root: Mutex<RenderNode>,
}

impl RenderModel {
    pub fn new(asset_id: impl Into<String>, tier: MaterialTier, lod_count: usize, root: RenderNode) -> Self {
        Self {
            asset_id: asset_id.into(),
            tier,
            lod_count,
            root: Mutex::new(root),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RenderNode> {
        self.root.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn asset_id(&self) -> &str {
        &self.asset_id
    }

    pub fn tier(&self) -> MaterialTier {
        self.tier
    }

    pub fn lod_count(&self) -> usize {
        self.lod_count
    }

    pub fn drawable_count(&self) -> usize {
        self.lock().drawable_count()
    }

    pub fn triangle_count_at(&self, level: usize) -> usize {
        self.lock().triangle_count_at(level)
    }

    /// Inspect the node tree
    pub fn with_root<R>(&self, f: impl FnOnce(&RenderNode) -> R) -> R {
        f(&self.lock())
    }

    /// Detach the whole node tree, leaving an empty root behind
    pub fn take_root(&self) -> RenderNode {
        let mut root = self.lock();
        let name = root.name.clone();
        std::mem::replace(&mut *root, RenderNode::new(name))
    }

    /// True once the tree has been detached
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::MaterialDesc;
    use crate::core::Vec3;

    fn triangle() -> Geometry {
        Geometry::new(vec![Vec3::ZERO, Vec3::X, Vec3::Y])
    }

    #[test]
    fn test_geometry_dispose_is_idempotent() {
        let ledger = ResourceLedger::new();
        let geometry = GpuGeometry::upload(&ledger, "tri", &triangle(), Ownership::Owned);
        assert_eq!(ledger.live(ResourceKind::Geometry), 1);
        assert_eq!(ledger.snapshot().bytes, triangle().byte_size());

        assert!(geometry.dispose());
        assert!(!geometry.dispose());
        assert!(geometry.is_disposed());
        assert_eq!(ledger.snapshot(), LedgerSnapshot::default());
    }

    #[test]
    fn test_drop_releases_undisposed_handle() {
        let ledger = ResourceLedger::new();
        {
            let _geometry = GpuGeometry::upload(&ledger, "tri", &triangle(), Ownership::Owned);
            assert_eq!(ledger.snapshot().live_total(), 1);
        }
        assert_eq!(ledger.snapshot().live_total(), 0);
    }

    #[test]
    fn test_material_dispose_releases_owned_textures_only() {
        let ledger = ResourceLedger::new();
        let owned = GpuTexture::upload(&ledger, &Texture::placeholder("albedo", 4, 4), Ownership::Owned);
        let pooled = GpuTexture::upload(&ledger, &Texture::placeholder("normal", 4, 4), Ownership::Pooled);
        let desc = MaterialDesc::named("skin");
        let material = GpuMaterial::new(
            &ledger,
            desc.name.clone(),
            MaterialTier::High,
            desc.base_color,
            Some(owned.clone()),
            Some(pooled.clone()),
            Ownership::Owned,
        );
        assert_eq!(material.shading(), ShadingModel::Physical);
        assert_eq!(ledger.snapshot().textures, 2);

        assert!(material.dispose());
        assert!(owned.is_disposed());
        assert!(!pooled.is_disposed());
        assert_eq!(ledger.snapshot().materials, 0);
        assert_eq!(ledger.snapshot().textures, 1);

        // Second dispose touches nothing
        assert!(!material.dispose());
        assert_eq!(ledger.snapshot().textures, 1);
    }

    #[test]
    fn test_lod_lookup_clamps() {
        let ledger = ResourceLedger::new();
        let high = GpuGeometry::upload(&ledger, "high", &triangle(), Ownership::Owned);
        let material = GpuMaterial::new(
            &ledger,
            "m",
            MaterialTier::Low,
            Vec4::ONE,
            None,
            None,
            Ownership::Owned,
        );
        let drawable = Drawable {
            lods: vec![high.clone()],
            material,
        };
        assert_eq!(drawable.geometry_for_lod(0).map(|g| g.id()), Some(high.id()));
        assert_eq!(drawable.geometry_for_lod(5).map(|g| g.id()), Some(high.id()));

        let mut root = RenderNode::new("root");
        let mut child = RenderNode::new("child");
        child.drawables.push(drawable);
        root.children.push(child);
        assert_eq!(root.drawable_count(), 1);
        assert_eq!(root.triangle_count_at(2), 1);
    }
}
