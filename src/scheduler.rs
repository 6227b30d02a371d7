//! Asset scheduler: the preview pipeline and the facade consumers talk to
//!
//! A preview request flows through the batch loader (context admission,
//! bounded loading, retries) into the pipeline below: fetch, decode on the
//! blocking pool, build LOD levels and tiered materials, upload. The
//! finished model is kept together with its context lease until the
//! consumer releases it or the context is reclaimed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::asset::{AssetDecoder, AssetLocator, AssetSource, LocatorRegistry, MaterialDesc, ModelNode, Texture};
use crate::core::CancelHandle;
use crate::core::config::{OptimizeConfig, SchedulerConfig};
use crate::core::error::LoadError;
use crate::optimize::geometry::{create_lod_levels_with_floor, GeometryOptions};
use crate::optimize::material::{material_for_tier, MaterialTier};
use crate::optimize::texture::{optimize_texture, TextureOptions};
use crate::render::context::{ContextLease, ContextManager, ContextStats};
use crate::render::disposal::{DisposalManager, DisposalReport};
use crate::render::gpu::{
    Drawable, GpuGeometry, GpuMaterial, GpuTexture, LedgerSnapshot, Ownership, RenderModel,
    RenderNode, ResourceLedger,
};
use crate::render::monitor::{PerformanceMonitor, PerformanceReport, PerformanceSignal, PerformanceState};
use crate::streaming::batch::{BatchItem, BatchLoader, BatchStats, CleanupHook, OperationFactory};
use crate::streaming::cache::{MaterialParts, PoolStats, PrimitiveShape, ResourcePool};
use crate::streaming::load_queue::{LoadOperation, LoadQueue, QueueStats};
use crate::streaming::lod::QualityTier;

const BYTES_PER_MB: f32 = 1024.0 * 1024.0;

/// What a preview widget should show for a load outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PreviewState {
    Ready,
    /// Aborted or circuit open; asking again later may succeed
    Retrying,
    /// No rendering context could be obtained
    ResourceLimit,
    /// Terminal failure, show the placeholder
    Fallback,
}

impl PreviewState {
    pub fn from_error(err: &LoadError) -> Self {
        match err {
            LoadError::Aborted(_) | LoadError::CircuitOpen { .. } => PreviewState::Retrying,
            LoadError::ContextExhausted(_) => PreviewState::ResourceLimit,
            _ => PreviewState::Fallback,
        }
    }
}

/// A load outcome ready for display. Failed loads carry a placeholder model.
#[derive(Debug, Clone)]
pub struct Preview {
    pub id: String,
    pub state: PreviewState,
    pub model: Arc<RenderModel>,
    pub quality: QualityTier,
    pub error: Option<LoadError>,
}

/// Serializable snapshot of every scheduler component
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub active_contexts: usize,
    pub max_contexts: usize,
    pub queued_contexts: usize,
    pub queued_loads: usize,
    pub active_loads: usize,
    pub pending_batch: usize,
    pub prepared_models: usize,
    pub cache_hit_ratio: f32,
    pub performance_state: PerformanceState,
    pub context_breaker_open: bool,
    pub contexts: ContextStats,
    pub loads: QueueStats,
    pub batch: BatchStats,
    pub pool: PoolStats,
    pub gpu: LedgerSnapshot,
    pub disposal: DisposalReport,
}

/// Fetch, decode, optimize and upload. Shared by every load operation.
struct Pipeline {
    source: Arc<dyn AssetSource>,
    decoder: Arc<dyn AssetDecoder>,
    pool: Arc<ResourcePool>,
    ledger: Arc<ResourceLedger>,
    optimize: OptimizeConfig,
    monitor: Arc<Mutex<PerformanceMonitor>>,
}

impl Pipeline {
    fn operation(self: &Arc<Self>, item: &BatchItem) -> LoadOperation<Arc<RenderModel>> {
        let pipeline = self.clone();
        let locator = item.locator.clone();
        let priority = item.priority;
        Box::new(move |cancel| Box::pin(pipeline.run(locator, priority, cancel)))
    }

    fn quality(&self, priority: f32) -> QualityTier {
        let state = self.monitor.lock().unwrap_or_else(|e| e.into_inner()).state();
        QualityTier::for_state(state, priority, self.optimize.lod_ratios.len())
    }

    async fn run(
        self: Arc<Self>,
        locator: AssetLocator,
        priority: f32,
        cancel: CancelHandle,
    ) -> Result<Arc<RenderModel>, LoadError> {
        let asset_id = locator.asset_id();
        let bytes = self.source.fetch(&locator, &cancel).await?;
        if cancel.is_cancelled() {
            return Err(LoadError::Aborted(asset_id));
        }

        let quality = self.quality(priority);
        let pipeline = self.clone();
        let blocking_cancel = cancel.clone();
        let model = tokio::task::spawn_blocking(move || {
            let root = pipeline.decoder.decode(&bytes)?;
            if blocking_cancel.is_cancelled() {
                return Err(LoadError::Aborted(asset_id));
            }
            pipeline.prepare(&asset_id, &root, quality)
        })
        .await
        .map_err(|e| LoadError::Decode(format!("decode task failed: {}", e)))??;

        // Dropping the model releases everything it uploaded
        if cancel.is_cancelled() {
            return Err(LoadError::Aborted(model.asset_id().to_string()));
        }
        Ok(Arc::new(model))
    }

    /// Build the displayable model for a decoded tree
    fn prepare(&self, asset_id: &str, root: &ModelNode, quality: QualityTier) -> Result<RenderModel, LoadError> {
        if root.primitive_count() == 0 {
            return Err(LoadError::Decode(format!("'{}' contains no geometry", asset_id)));
        }
        let node = self.prepare_node(asset_id, root, root.name.clone(), quality.material)?;
        let model = RenderModel::new(asset_id, quality.material, self.optimize.lod_ratios.len(), node);
        log::debug!(
            "Prepared '{}': {} drawables, {} triangles at LOD 0, tier {}",
            asset_id,
            model.drawable_count(),
            model.triangle_count_at(0),
            quality.material.as_str()
        );
        Ok(model)
    }

    fn prepare_node(
        &self,
        asset_id: &str,
        node: &ModelNode,
        path: String,
        tier: MaterialTier,
    ) -> Result<RenderNode, LoadError> {
        let mut out = RenderNode::new(node.name.clone());
        let options = GeometryOptions {
            max_triangles: self.optimize.max_triangles,
            ..Default::default()
        };

        for (index, primitive) in node.primitives.iter().enumerate() {
            let mut geometry = primitive.geometry.clone();
            geometry.validate()?;
            if geometry.normals.is_none() {
                geometry.compute_vertex_normals();
            }
            if geometry.bounds.is_none() {
                geometry.compute_bounds();
            }

            let levels = create_lod_levels_with_floor(
                &geometry,
                &self.optimize.lod_ratios,
                &options,
                self.optimize.min_lod_triangles,
            );
            let lods = levels
                .iter()
                .enumerate()
                .map(|(level, g)| {
                    let label = format!("{}/{}#{}@lod{}", asset_id, path, index, level);
                    GpuGeometry::upload(&self.ledger, label, g, Ownership::Owned)
                })
                .collect();

            out.drawables.push(Drawable {
                lods,
                material: self.material(&primitive.material, tier),
            });
        }

        for (index, child) in node.children.iter().enumerate() {
            let child_path = format!("{}/{}", path, index);
            out.children
                .push(self.prepare_node(asset_id, child, child_path, tier)?);
        }
        Ok(out)
    }

    fn texture_options(&self) -> TextureOptions {
        TextureOptions {
            max_size: self.optimize.texture_max_size,
            generate_mipmaps: self.optimize.generate_mipmaps,
            anisotropy: self.optimize.anisotropy,
        }
    }

    fn texture(&self, texture: &Texture) -> Arc<GpuTexture> {
        let options = self.texture_options();
        let key = format!("{}#{}", texture.id, options.signature());
        self.pool
            .get_or_create_texture(&key, || optimize_texture(texture, &options))
    }

    fn material(&self, desc: &MaterialDesc, tier: MaterialTier) -> Arc<GpuMaterial> {
        let desc = material_for_tier(desc, tier);
        let base_color_texture = desc.base_color_texture.as_ref().map(|t| self.texture(t));
        let normal_texture = desc.normal_texture.as_ref().map(|t| self.texture(t));

        let key = format!(
            "{}:{}:{:?}:{}:{}",
            desc.name,
            tier.as_str(),
            desc.base_color.to_array(),
            base_color_texture.as_ref().map_or(0, |t| t.id()),
            normal_texture.as_ref().map_or(0, |t| t.id()),
        );
        self.pool.get_or_create_material(&key, || MaterialParts {
            name: desc.name.clone(),
            tier,
            base_color: desc.base_color,
            base_color_texture: base_color_texture.clone(),
            normal_texture: normal_texture.clone(),
        })
    }
}

/// A finished preview and the context it holds
struct Prepared {
    model: Arc<RenderModel>,
    _lease: ContextLease,
    priority: f32,
}

struct SchedulerInner {
    config: SchedulerConfig,
    contexts: ContextManager,
    queue: LoadQueue<Arc<RenderModel>>,
    batch: BatchLoader<Arc<RenderModel>>,
    pipeline: Arc<Pipeline>,
    disposal: DisposalManager,
    prepared: Mutex<HashMap<String, Prepared>>,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

impl SchedulerInner {
    fn prepared(&self) -> MutexGuard<'_, HashMap<String, Prepared>> {
        self.prepared.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn monitor(&self) -> MutexGuard<'_, PerformanceMonitor> {
        self.pipeline.monitor.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The manager took back the context of `id`; its preview cannot stay up
    fn on_context_reclaimed(&self, id: &str) {
        let Some(prepared) = self.prepared().remove(id) else {
            return;
        };
        let report = self.disposal.dispose_model(&prepared.model);
        log::warn!(
            "Context for '{}' reclaimed, preview disposed ({} resources released)",
            id,
            report.released()
        );
    }

    fn apply_signal(&self, signal: PerformanceSignal) {
        let max_contexts = self.contexts.apply_memory_pressure(signal.pressure);
        let max_loads = self.queue.apply_memory_pressure(signal.pressure);
        log::trace!(
            "Applied {:?} pressure: {} contexts, {} loads",
            signal.pressure,
            max_contexts,
            max_loads
        );
    }

    fn sample_ledger(&self) -> PerformanceSignal {
        let memory_mb = self.pipeline.ledger.snapshot().bytes as f32 / BYTES_PER_MB;
        let signal = self.monitor().sample(memory_mb);
        self.apply_signal(signal);
        signal
    }
}

/// Entry point for preview widgets. Clones share the same scheduler.
#[derive(Clone)]
pub struct AssetScheduler {
    inner: Arc<SchedulerInner>,
}

impl AssetScheduler {
    /// Build every component from one config
    pub fn new(
        mut config: SchedulerConfig,
        source: Arc<dyn AssetSource>,
        decoder: Arc<dyn AssetDecoder>,
    ) -> crate::core::Result<Self> {
        config.validate()?;
        Ok(Self::with_locators(config, source, decoder, Arc::new(LocatorRegistry::new())))
    }

    /// Like [`new`](Self::new) with a caller-owned locator registry, so a
    /// [`LocalSource`](crate::asset::LocalSource) can resolve the temporary
    /// locators issued here. The config is used as given.
    pub fn with_locators(
        config: SchedulerConfig,
        source: Arc<dyn AssetSource>,
        decoder: Arc<dyn AssetDecoder>,
        locators: Arc<LocatorRegistry>,
    ) -> Self {
        let ledger = ResourceLedger::new();
        let pool = Arc::new(ResourcePool::new(&config.cache, ledger.clone()));
        let pipeline = Arc::new(Pipeline {
            source,
            decoder,
            pool,
            ledger,
            optimize: config.optimize.clone(),
            monitor: Arc::new(Mutex::new(PerformanceMonitor::new(config.monitor.clone()))),
        });
        let contexts = ContextManager::new(config.context.clone());
        let queue = LoadQueue::new(config.queue.clone());

        let inner = Arc::new_cyclic(|me: &Weak<SchedulerInner>| {
            let factory_pipeline = pipeline.clone();
            let factory: OperationFactory<Arc<RenderModel>> =
                Arc::new(move |item: &BatchItem| factory_pipeline.operation(item));
            let me = me.clone();
            let cleanup: CleanupHook = Arc::new(move |id: &str| {
                if let Some(inner) = me.upgrade() {
                    inner.on_context_reclaimed(id);
                }
            });
            let batch = BatchLoader::with_cleanup(
                config.batch.clone(),
                contexts.clone(),
                queue.clone(),
                factory,
                Some(cleanup),
            );
            SchedulerInner {
                contexts,
                queue,
                batch,
                pipeline,
                disposal: DisposalManager::new(locators),
                prepared: Mutex::new(HashMap::new()),
                sampler: Mutex::new(None),
                config,
            }
        });
        Self { inner }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn contexts(&self) -> &ContextManager {
        &self.inner.contexts
    }

    pub fn locators(&self) -> &Arc<LocatorRegistry> {
        self.inner.disposal.locators()
    }

    /// Register an in-memory payload for `owner` and return its locator.
    /// Released together with `owner`.
    pub fn register_blob(&self, owner: &str, bytes: Arc<[u8]>) -> AssetLocator {
        AssetLocator::Temporary(self.inner.disposal.create_temp_locator(owner, bytes))
    }

    /// Load `locator` for preview `id`. Returns the prepared model once the
    /// preview holds a rendering context; the context stays held until
    /// [`release`](Self::release).
    pub async fn load(&self, id: &str, locator: AssetLocator, priority: f32) -> Result<Arc<RenderModel>, LoadError> {
        let inner = &self.inner;
        if let Some(prepared) = inner.prepared().get(id) {
            return Ok(prepared.model.clone());
        }

        let timeout = inner.config.load_timeout();
        let ticket = inner.batch.add_to_batch(id, locator, priority);
        let output = match tokio::time::timeout(timeout, ticket).await {
            Ok(result) => result?,
            Err(_) => {
                inner.batch.remove_from_batch(id);
                log::warn!("Load '{}' timed out after {:?}", id, timeout);
                return Err(LoadError::Timeout(timeout));
            }
        };

        let mut lease = output.lease;
        if lease.is_revoked() {
            inner.disposal.dispose_model(&output.value);
            return Err(LoadError::ContextLost(id.to_string()));
        }

        let model = output.value;
        let replaced = inner.prepared().insert(
            id.to_string(),
            Prepared {
                model: model.clone(),
                _lease: lease,
                priority,
            },
        );
        if let Some(replaced) = replaced {
            inner.disposal.dispose_model(&replaced.model);
        }
        log::info!("Preview '{}' ready after {} attempt(s)", id, output.attempts);
        Ok(model)
    }

    /// [`load`](Self::load) mapped to a display state. Failures show the
    /// placeholder shape.
    pub async fn preview(&self, id: &str, locator: AssetLocator, priority: f32) -> Preview {
        match self.load(id, locator, priority).await {
            Ok(model) => Preview {
                id: id.to_string(),
                state: PreviewState::Ready,
                quality: QualityTier::for_state(self.performance_state(), priority, model.lod_count()),
                model,
                error: None,
            },
            Err(err) => {
                let pool = &self.inner.pipeline.pool;
                let placeholder = RenderModel::new(id, MaterialTier::Low, 1, pool.placeholder_node(PrimitiveShape::Box));
                Preview {
                    id: id.to_string(),
                    state: PreviewState::from_error(&err),
                    model: Arc::new(placeholder),
                    quality: QualityTier::for_state(PerformanceState::Degraded, priority, 1),
                    error: Some(err),
                }
            }
        }
    }

    /// The consumer no longer needs `id`: abort pending work, dispose the
    /// prepared model, revoke its temporary locator and return its context.
    pub fn release(&self, id: &str) -> DisposalReport {
        let inner = &self.inner;
        let aborted = inner.batch.remove_from_batch(id);
        let prepared = inner.prepared().remove(id);
        let locator = inner.disposal.locators().locator_for(id);

        let report = inner
            .disposal
            .cleanup_resources(prepared.as_ref().map(|p| p.model.as_ref()), locator.as_ref(), None);
        if aborted || prepared.is_some() {
            log::debug!("Released '{}' ({} resources)", id, report.released());
        }
        // Dropping the prepared entry returns its context
        drop(prepared);
        report
    }

    /// Prepared model for `id`, if it is on display
    pub fn model(&self, id: &str) -> Option<Arc<RenderModel>> {
        self.inner.prepared().get(id).map(|p| p.model.clone())
    }

    /// Quality a displayed preview should draw at right now
    pub fn quality(&self, id: &str) -> Option<QualityTier> {
        let prepared = self.inner.prepared();
        let entry = prepared.get(id)?;
        Some(QualityTier::for_state(self.performance_state(), entry.priority, entry.model.lod_count()))
    }

    pub fn record_frame(&self, render_time_ms: f32) {
        self.inner.monitor().record_frame(render_time_ms);
    }

    /// Close a sample period with an externally measured memory figure and
    /// apply the resulting pressure
    pub fn sample(&self, memory_usage_mb: f32) -> PerformanceSignal {
        let signal = self.inner.monitor().sample(memory_usage_mb);
        self.inner.apply_signal(signal);
        signal
    }

    pub fn performance_state(&self) -> PerformanceState {
        self.inner.monitor().state()
    }

    pub fn performance(&self) -> PerformanceReport {
        self.inner.monitor().report()
    }

    pub fn set_max_contexts(&self, max: usize) -> usize {
        self.inner.contexts.set_max_contexts(max)
    }

    pub fn stats(&self) -> SchedulerStats {
        let inner = &self.inner;
        let contexts = inner.contexts.stats();
        let loads = inner.queue.stats();
        let batch = inner.batch.stats();
        let pool = inner.pipeline.pool.stats();
        SchedulerStats {
            active_contexts: contexts.active,
            max_contexts: contexts.max_contexts,
            queued_contexts: contexts.waiting,
            queued_loads: loads.queued + loads.delayed,
            active_loads: loads.active,
            pending_batch: batch.pending,
            prepared_models: inner.prepared().len(),
            cache_hit_ratio: pool.hit_ratio(),
            performance_state: self.performance_state(),
            context_breaker_open: contexts.breaker_open,
            contexts,
            loads,
            batch,
            pool,
            gpu: inner.pipeline.ledger.snapshot(),
            disposal: inner.disposal.totals(),
        }
    }

    /// Start the batch processor and the performance sampling loop
    pub fn start(&self) {
        let inner = &self.inner;
        inner.batch.spawn_processor();

        let mut sampler = inner.sampler.lock().unwrap_or_else(|e| e.into_inner());
        if sampler.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let me = Arc::downgrade(inner);
        let period = inner.config.monitor.sample_interval();
        *sampler = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(inner) = me.upgrade() else {
                    break;
                };
                inner.sample_ledger();
            }
        }));
        log::info!("Asset scheduler started");
    }

    /// Stop background tasks. Displayed previews stay prepared.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        inner.batch.stop_processor();
        if let Some(handle) = inner.sampler.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        log::info!("Asset scheduler stopped");
    }

    /// Return every component to its initial state, disposing prepared and
    /// cached resources
    pub fn reset(&self) {
        let inner = &self.inner;
        inner.batch.reset();
        inner.queue.reset();

        let prepared: Vec<_> = inner.prepared().drain().map(|(_, p)| p).collect();
        for entry in &prepared {
            inner.disposal.dispose_model(&entry.model);
        }
        drop(prepared);

        inner.contexts.reset();
        let pooled = inner.pipeline.pool.reset();
        let revoked = inner.disposal.reset();
        inner.monitor().reset();
        log::info!(
            "Asset scheduler reset ({} pooled resources disposed, {} locators revoked)",
            pooled,
            revoked
        );
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        if let Some(handle) = self
            .sampler
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}
