//! Deterministic teardown of GPU-backed resources and temporary locators

use std::ops::AddAssign;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::asset::{LocatorRegistry, TempLocator};
use crate::core::CancelHandle;
use crate::render::gpu::{Disposable, Drawable, RenderModel, RenderNode};

/// What a disposal pass released
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DisposalReport {
    pub geometries: usize,
    pub materials: usize,
    pub textures: usize,
    /// Pooled handles left for the resource pool
    pub skipped_pooled: usize,
    /// Handles that were already released elsewhere
    pub already_disposed: usize,
    pub nodes_detached: usize,
    pub locators_revoked: usize,
    pub operations_cancelled: usize,
}

impl DisposalReport {
    pub fn released(&self) -> usize {
        self.geometries + self.materials + self.textures
    }
}

impl AddAssign for DisposalReport {
    fn add_assign(&mut self, other: Self) {
        self.geometries += other.geometries;
        self.materials += other.materials;
        self.textures += other.textures;
        self.skipped_pooled += other.skipped_pooled;
        self.already_disposed += other.already_disposed;
        self.nodes_detached += other.nodes_detached;
        self.locators_revoked += other.locators_revoked;
        self.operations_cancelled += other.operations_cancelled;
    }
}

/// Releases model resources and temporary locators.
///
/// Every entry point is idempotent: disposing an already disposed or
/// partially disposed model only releases what is still live.
pub struct DisposalManager {
    locators: Arc<LocatorRegistry>,
    totals: Mutex<DisposalReport>,
}

impl DisposalManager {
    pub fn new(locators: Arc<LocatorRegistry>) -> Self {
        Self {
            locators,
            totals: Mutex::new(DisposalReport::default()),
        }
    }

    pub fn locators(&self) -> &Arc<LocatorRegistry> {
        &self.locators
    }

    /// Detach and release the whole node tree of a model
    pub fn dispose_model(&self, model: &RenderModel) -> DisposalReport {
        let report = self.dispose_node(model.take_root());
        if report.released() > 0 {
            log::debug!(
                "Disposed model '{}': {} geometries, {} materials, {} textures",
                model.asset_id(),
                report.geometries,
                report.materials,
                report.textures
            );
        }
        report
    }

    /// Release every drawable under `node`. Pooled handles are skipped.
    pub fn dispose_node(&self, node: RenderNode) -> DisposalReport {
        let mut report = DisposalReport::default();
        let mut stack = vec![node];
        while let Some(node) = stack.pop() {
            report.nodes_detached += node.children.len();
            for drawable in &node.drawables {
                dispose_drawable(drawable, &mut report);
            }
            stack.extend(node.children);
        }
        self.record(report);
        report
    }

    /// Issue a temporary locator for `owner`, revoking its previous one
    pub fn create_temp_locator(&self, owner: &str, blob: Arc<[u8]>) -> TempLocator {
        self.locators.create(owner, blob)
    }

    pub fn revoke_temp_locator(&self, locator: &TempLocator) -> bool {
        self.locators.revoke(locator)
    }

    /// Dispose the model, cancel the in-flight operation and revoke the
    /// temporary locator. Absent arguments are skipped.
    pub fn cleanup_resources(
        &self,
        model: Option<&RenderModel>,
        locator: Option<&TempLocator>,
        cancel: Option<&CancelHandle>,
    ) -> DisposalReport {
        let mut report = DisposalReport::default();
        if let Some(cancel) = cancel
            && !cancel.is_cancelled()
        {
            cancel.cancel();
            report.operations_cancelled = 1;
        }
        if let Some(model) = model {
            report += self.dispose_model(model);
        }
        if let Some(locator) = locator
            && self.locators.revoke(locator)
        {
            report.locators_revoked = 1;
        }
        let mut totals = self.totals.lock().unwrap_or_else(|e| e.into_inner());
        totals.operations_cancelled += report.operations_cancelled;
        totals.locators_revoked += report.locators_revoked;
        report
    }

    /// Cumulative totals since creation or the last reset
    pub fn totals(&self) -> DisposalReport {
        *self.totals.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Revoke every temporary locator and clear the totals
    pub fn reset(&self) -> usize {
        let revoked = self.locators.revoke_all();
        *self.totals.lock().unwrap_or_else(|e| e.into_inner()) = DisposalReport::default();
        revoked
    }

    fn record(&self, report: DisposalReport) {
        *self.totals.lock().unwrap_or_else(|e| e.into_inner()) += report;
    }
}

fn dispose_drawable(drawable: &Drawable, report: &mut DisposalReport) {
    for geometry in &drawable.lods {
        if geometry.is_pooled() {
            report.skipped_pooled += 1;
        } else if geometry.dispose() {
            report.geometries += 1;
        } else {
            report.already_disposed += 1;
        }
    }

    let material = &drawable.material;
    if material.is_pooled() {
        report.skipped_pooled += 1;
        return;
    }
    let owned_textures = material
        .textures()
        .filter(|t| !t.is_pooled() && !t.is_disposed())
        .count();
    if material.dispose() {
        report.materials += 1;
        report.textures += owned_textures;
    } else {
        report.already_disposed += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::{Geometry, Texture};
    use crate::core::{Vec3, Vec4};
    use crate::optimize::MaterialTier;
    use crate::render::gpu::{GpuGeometry, GpuMaterial, GpuTexture, Ownership, ResourceLedger};

    fn drawable(ledger: &Arc<ResourceLedger>, geometry_ownership: Ownership) -> Drawable {
        let geometry = Geometry::new(vec![Vec3::ZERO, Vec3::X, Vec3::Y]);
        let lods = (0..2)
            .map(|i| GpuGeometry::upload(ledger, format!("lod{}", i), &geometry, geometry_ownership))
            .collect();
        let texture = GpuTexture::upload(ledger, &Texture::placeholder("albedo", 8, 8), Ownership::Owned);
        let material = GpuMaterial::new(
            ledger,
            "body",
            MaterialTier::High,
            Vec4::ONE,
            Some(texture),
            None,
            Ownership::Owned,
        );
        Drawable { lods, material }
    }

    fn model(ledger: &Arc<ResourceLedger>) -> RenderModel {
        let mut root = RenderNode::new("root");
        root.drawables.push(drawable(ledger, Ownership::Owned));
        let mut child = RenderNode::new("arm");
        child.drawables.push(drawable(ledger, Ownership::Owned));
        root.children.push(child);
        RenderModel::new("figurine", MaterialTier::High, 2, root)
    }

    #[test]
    fn test_dispose_model_releases_everything() {
        let ledger = ResourceLedger::new();
        let model = model(&ledger);
        let manager = DisposalManager::new(Arc::new(LocatorRegistry::new()));

        let report = manager.dispose_model(&model);
        assert_eq!(report.geometries, 4);
        assert_eq!(report.materials, 2);
        assert_eq!(report.textures, 2);
        assert_eq!(report.nodes_detached, 1);
        assert!(model.is_empty());
        assert_eq!(ledger.snapshot().live_total(), 0);
    }

    #[test]
    fn test_dispose_twice_is_noop() {
        let ledger = ResourceLedger::new();
        let model = model(&ledger);
        let manager = DisposalManager::new(Arc::new(LocatorRegistry::new()));

        manager.dispose_model(&model);
        let second = manager.dispose_model(&model);
        assert_eq!(second, DisposalReport::default());
        assert_eq!(manager.totals().geometries, 4);
    }

    #[test]
    fn test_partially_disposed_model() {
        let ledger = ResourceLedger::new();
        let model = model(&ledger);
        model.with_root(|root| {
            root.drawables[0].lods[0].dispose();
            root.drawables[0].material.dispose();
        });
        let manager = DisposalManager::new(Arc::new(LocatorRegistry::new()));

        let report = manager.dispose_model(&model);
        assert_eq!(report.geometries, 3);
        assert_eq!(report.materials, 1);
        assert_eq!(report.already_disposed, 2);
        assert_eq!(ledger.snapshot().live_total(), 0);
    }

    #[test]
    fn test_pooled_handles_are_skipped() {
        let ledger = ResourceLedger::new();
        let drawable = drawable(&ledger, Ownership::Pooled);
        // The pool keeps its own references to the shared geometry
        let pooled = drawable.lods.clone();
        let mut root = RenderNode::new("root");
        root.drawables.push(drawable);
        let model = RenderModel::new("placeholder", MaterialTier::Low, 2, root);
        let manager = DisposalManager::new(Arc::new(LocatorRegistry::new()));

        let report = manager.dispose_model(&model);
        assert_eq!(report.skipped_pooled, 2);
        assert_eq!(report.materials, 1);
        assert!(pooled.iter().all(|g| !g.is_disposed()));
        assert_eq!(ledger.snapshot().geometries, 2);
        assert_eq!(ledger.snapshot().materials, 0);
        assert_eq!(ledger.snapshot().textures, 0);
    }

    #[test]
    fn test_cleanup_resources_each_step_optional() {
        let ledger = ResourceLedger::new();
        let registry = Arc::new(LocatorRegistry::new());
        let manager = DisposalManager::new(registry.clone());

        assert_eq!(manager.cleanup_resources(None, None, None), DisposalReport::default());

        let model = model(&ledger);
        let locator = manager.create_temp_locator("fig-1", Arc::from(&b"v 0 0 0"[..]));
        let cancel = CancelHandle::new();

        let report = manager.cleanup_resources(Some(&model), Some(&locator), Some(&cancel));
        assert!(cancel.is_cancelled());
        assert_eq!(report.operations_cancelled, 1);
        assert_eq!(report.locators_revoked, 1);
        assert_eq!(report.geometries, 4);
        assert_eq!(registry.live_count(), 0);

        let again = manager.cleanup_resources(Some(&model), Some(&locator), Some(&cancel));
        assert_eq!(again, DisposalReport::default());
    }

    #[test]
    fn test_new_locator_revokes_previous() {
        let manager = DisposalManager::new(Arc::new(LocatorRegistry::new()));
        let first = manager.create_temp_locator("fig-1", Arc::from(&b"a"[..]));
        let second = manager.create_temp_locator("fig-1", Arc::from(&b"b"[..]));
        assert_ne!(first, second);
        assert!(!manager.revoke_temp_locator(&first));
        assert!(manager.revoke_temp_locator(&second));
    }
}
