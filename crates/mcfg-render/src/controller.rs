//! Pool Reconciler
//!
//! Each sync recomputes a pool's rendered MachineConfig from the fragments its
//! selector matches, creates it if needed, points the pool at it and keeps the
//! `RenderDegraded` condition up to date. Syncs are driven by a [`WorkQueue`]
//! that never hands the same pool to two workers at once.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mcfg_common::certs::newest_certificate;
use mcfg_common::crd::{
    is_condition_false, ControllerConfig, MachineConfig, MachineConfigPool, POOL_RENDER_DEGRADED,
};
use mcfg_common::events::{actions, reasons, EventPublisher};
use mcfg_common::metrics::{
    set_important_config_paused, set_os_image_url_override, ReconcileOutcome, ReconcileTimer,
};
use mcfg_common::{
    ControllerVersion, CONTROLLER_CONFIG_NAME, KUBELET_CA_PATH,
    OS_IMAGE_URL_OVERRIDDEN_ANNOTATION, RELEASE_IMAGE_VERSION_ANNOTATION,
};

use crate::error::{ReconcileError, RenderError};
use crate::queue::{WorkQueue, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY};
use crate::render::{generate_rendered_machine_config, RenderedConfig};
use crate::selector::PoolSelector;
use crate::splice::{splice_paused_pool, SplicedConfig};
use crate::store::{ConfigLister, ConfigWriter};

/// Tunables of the render controller
#[derive(Clone, Debug)]
pub struct RenderControllerConfig {
    /// Number of concurrent workers
    pub workers: usize,
    /// Delay applied to every enqueue, coalescing bursts of edits
    pub render_delay: Duration,
    /// Rate-limited retries before a pool is put on cooldown
    pub max_retries: u32,
    /// Delay before a pool that exhausted its retries is tried again
    pub cooldown: Duration,
    /// First backoff step of the rate limiter
    pub base_delay: Duration,
    /// Backoff cap of the rate limiter
    pub max_delay: Duration,
}

impl Default for RenderControllerConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            render_delay: Duration::from_secs(5),
            max_retries: 15,
            cooldown: Duration::from_secs(60),
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RenderControllerConfig {
    /// A work queue using this config's backoff
    pub fn new_queue(&self) -> WorkQueue<String> {
        WorkQueue::new(self.base_delay, self.max_delay)
    }
}

/// Shared state for every worker
pub struct Context {
    /// Cached reads
    pub lister: Arc<dyn ConfigLister>,
    /// Writes to the API server (trait object for testability)
    pub writer: Arc<dyn ConfigWriter>,
    /// Kubernetes Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Identity of this controller build
    pub version: ControllerVersion,
    /// Tunables
    pub config: RenderControllerConfig,
}

impl Context {
    /// Create a context
    pub fn new(
        lister: Arc<dyn ConfigLister>,
        writer: Arc<dyn ConfigWriter>,
        events: Arc<dyn EventPublisher>,
        version: ControllerVersion,
        config: RenderControllerConfig,
    ) -> Self {
        Self {
            lister,
            writer,
            events,
            version,
            config,
        }
    }

    /// Create a context with mock collaborators and default tunables
    #[cfg(test)]
    pub fn for_testing(
        lister: Arc<dyn ConfigLister>,
        writer: Arc<dyn ConfigWriter>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self::new(
            lister,
            writer,
            events,
            crate::render::tests::version(),
            RenderControllerConfig::default(),
        )
    }
}

/// Result of a successful sync
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The pool targets its rendered config and is not degraded
    Synced,
    /// Inputs are not ready for this controller; try again later
    Deferred(String),
    /// Nothing to do for this pool
    Skipped,
}

/// Reconcile one pool by name
pub async fn sync_pool(ctx: &Context, name: &str) -> Result<SyncOutcome, ReconcileError> {
    let Some(cached) = ctx.lister.get_pool(name) else {
        debug!(pool = %name, "MachineConfigPool has been deleted");
        return Ok(SyncOutcome::Skipped);
    };

    let timer = ReconcileTimer::start(name);
    let result = reconcile_pool(ctx, (*cached).clone()).await;
    timer.finish(match &result {
        Ok(SyncOutcome::Deferred(_)) => ReconcileOutcome::Deferred,
        Ok(_) => ReconcileOutcome::Success,
        Err(_) => ReconcileOutcome::Error,
    });
    result
}

async fn reconcile_pool(
    ctx: &Context,
    mut pool: MachineConfigPool,
) -> Result<SyncOutcome, ReconcileError> {
    let name = pool.name_any();
    debug!(pool = %name, "syncing MachineConfigPool");

    let selector = match PoolSelector::from_field(pool.spec.machine_config_selector.as_ref()) {
        Ok(selector) => selector,
        Err(e) => return sync_failing_status(ctx, &mut pool, e.into()).await,
    };

    if matches!(selector, PoolSelector::All) {
        ctx.events
            .publish(
                &pool_ref(&pool),
                EventType::Warning,
                reasons::SELECTING_ALL,
                actions::RENDER,
                Some("This pool is selecting all MachineConfigs".to_string()),
            )
            .await;
        return Ok(SyncOutcome::Skipped);
    }

    let configs: Vec<Arc<MachineConfig>> = ctx
        .lister
        .list_machine_configs()
        .into_iter()
        .filter(|mc| selector.matches(mc.label_map()))
        .collect();
    if configs.is_empty() {
        let err = ReconcileError::NoMatchingConfigs {
            selector: selector.to_string(),
        };
        return sync_failing_status(ctx, &mut pool, err).await;
    }

    let base = match controller_config(ctx) {
        Ok(base) => base,
        Err(reason) => {
            info!(pool = %name, reason = %reason, "render deferred");
            return Ok(SyncOutcome::Deferred(reason));
        }
    };

    match sync_generated(ctx, &mut pool, &configs, &base).await {
        Ok(()) => {}
        Err(ReconcileError::Render(RenderError::Deferred(reason))) => {
            info!(pool = %name, reason = %reason, "render deferred");
            return Ok(SyncOutcome::Deferred(reason));
        }
        Err(e) => return sync_failing_status(ctx, &mut pool, e).await,
    }

    sync_available_status(ctx, &mut pool).await?;
    Ok(SyncOutcome::Synced)
}

/// The base settings, if they exist and the template controller is done with them
fn controller_config(ctx: &Context) -> Result<Arc<ControllerConfig>, String> {
    let base = ctx
        .lister
        .get_controller_config(CONTROLLER_CONFIG_NAME)
        .ok_or_else(|| format!("ControllerConfig {} not found", CONTROLLER_CONFIG_NAME))?;
    base.check_completed()?;
    Ok(base)
}

/// Render the pool, then adopt the result (or its splice, if the pool is paused)
async fn sync_generated(
    ctx: &Context,
    pool: &mut MachineConfigPool,
    configs: &[Arc<MachineConfig>],
    base: &ControllerConfig,
) -> Result<(), ReconcileError> {
    let name = pool.name_any();
    let rendered = generate_rendered_machine_config(pool, configs, base, &ctx.version)?;

    report_os_image_override(ctx, pool, &rendered).await;

    let spliced = if pool.spec.paused {
        match pool
            .current_config_name()
            .and_then(|current| ctx.lister.get_machine_config(current))
        {
            Some(current) => {
                splice_paused_pool(pool, &current, &rendered.config, &ctx.version)?
            }
            None => None,
        }
    } else {
        None
    };

    match spliced {
        Some(spliced) => {
            set_important_config_paused(&name, true);
            adopt_spliced(ctx, pool, spliced).await
        }
        None => {
            set_important_config_paused(&name, false);
            adopt_rendered(ctx, pool, rendered).await
        }
    }
}

async fn report_os_image_override(
    ctx: &Context,
    pool: &MachineConfigPool,
    rendered: &RenderedConfig,
) {
    let name = pool.name_any();
    set_os_image_url_override(&name, rendered.os_image_overridden);
    if !rendered.os_image_overridden {
        return;
    }

    let previous = pool
        .target_config_name()
        .and_then(|target| ctx.lister.get_machine_config(target));
    let was_overridden = previous
        .as_ref()
        .and_then(|mc| mc.annotation(OS_IMAGE_URL_OVERRIDDEN_ANNOTATION))
        == Some("true");
    if was_overridden {
        return;
    }

    let was = previous
        .map(|mc| mc.spec.os_image_url.clone())
        .unwrap_or_default();
    ctx.events
        .publish(
            &pool_ref(pool),
            EventType::Normal,
            reasons::OS_IMAGE_URL_OVERRIDDEN,
            actions::RENDER,
            Some(format!(
                "OSImageURL was overridden via machineconfig in {} (was: {} is: {})",
                rendered.name(),
                was,
                rendered.config.spec.os_image_url
            )),
        )
        .await;
}

async fn adopt_rendered(
    ctx: &Context,
    pool: &mut MachineConfigPool,
    rendered: RenderedConfig,
) -> Result<(), ReconcileError> {
    let pool_name = pool.name_any();
    let name = rendered.name();

    if ctx.lister.get_machine_config(&name).is_none()
        && ctx.writer.create_machine_config(&rendered.config).await?
    {
        info!(pool = %pool_name, rendered = %name, "generated rendered MachineConfig");
        ctx.events
            .publish(
                &pool_ref(pool),
                EventType::Normal,
                reasons::RENDERED_CONFIG_GENERATED,
                actions::RENDER,
                Some(generated_note(&rendered.config, &ctx.version)),
            )
            .await;
    }

    if pool.target_config_name() == Some(name.as_str()) {
        if ctx.writer.apply_machine_config(&rendered.config).await? {
            info!(pool = %pool_name, rendered = %name, "repaired drifted rendered MachineConfig");
        }
        if pool.target_source() != rendered.source.as_slice() {
            pool.spec.configuration.source = rendered.source;
            *pool = ctx.writer.update_pool(pool).await?;
        }
        return Ok(());
    }

    pool.spec.configuration.name = name.clone();
    pool.spec.configuration.source = rendered.source;
    *pool = ctx.writer.update_pool(pool).await?;
    info!(pool = %pool_name, rendered = %name, "pool now targeting rendered MachineConfig");
    Ok(())
}

async fn adopt_spliced(
    ctx: &Context,
    pool: &mut MachineConfigPool,
    spliced: SplicedConfig,
) -> Result<(), ReconcileError> {
    let pool_name = pool.name_any();
    let name = spliced.name();

    if ctx.lister.get_machine_config(&name).is_none()
        && ctx.writer.create_machine_config(&spliced.config).await?
    {
        info!(
            pool = %pool_name,
            spliced = %name,
            files = ?spliced.spliced_files,
            "generated spliced MachineConfig for paused pool"
        );
        let mut note = generated_note(&spliced.config, &ctx.version);
        if let Some(cert) = newest_kubelet_ca(&spliced.config) {
            note.push_str(&cert);
        }
        ctx.events
            .publish(
                &pool_ref(pool),
                EventType::Normal,
                reasons::SPLICED_CONFIG_GENERATED,
                actions::SPLICE,
                Some(note),
            )
            .await;
    }

    // Spliced configs keep the applied config's source list. Only allow-listed
    // files came from the candidate, so its fragments are not the provenance.
    let source = pool
        .status
        .as_ref()
        .map(|s| s.configuration.source.clone())
        .unwrap_or_default();
    if pool.target_config_name() == Some(name.as_str()) && pool.target_source() == source {
        return Ok(());
    }

    pool.spec.configuration.name = name.clone();
    pool.spec.configuration.source = source;
    *pool = ctx.writer.update_pool(pool).await?;
    info!(pool = %pool_name, spliced = %name, "paused pool now targeting spliced MachineConfig");
    Ok(())
}

fn generated_note(config: &MachineConfig, version: &ControllerVersion) -> String {
    format!(
        "{} successfully generated (release version: {}, controller version: {})",
        config.name_any(),
        config
            .annotation(RELEASE_IMAGE_VERSION_ANNOTATION)
            .unwrap_or_default(),
        version.hash
    )
}

/// Subject and expiry of the newest certificate in the spliced kubelet CA
fn newest_kubelet_ca(config: &MachineConfig) -> Option<String> {
    let bundle = config.spec.config.read_file(KUBELET_CA_PATH).ok().flatten()?;
    match newest_certificate(&bundle) {
        Ok(Some(cert)) => Some(format!(
            "; newest kubelet CA certificate {} expires {}",
            cert.subject,
            cert.expiry_rfc3339()
        )),
        Ok(None) => None,
        Err(e) => {
            debug!(error = %e, "kubelet CA bundle does not parse");
            None
        }
    }
}

/// Clear `RenderDegraded` unless it is already false
async fn sync_available_status(
    ctx: &Context,
    pool: &mut MachineConfigPool,
) -> Result<(), ReconcileError> {
    if is_condition_false(pool.conditions(), POOL_RENDER_DEGRADED) {
        return Ok(());
    }
    pool.clear_render_degraded();
    ctx.writer.update_pool_status(pool).await?;
    Ok(())
}

/// Record `err` on the pool and hand it back for retry scheduling
async fn sync_failing_status(
    ctx: &Context,
    pool: &mut MachineConfigPool,
    err: ReconcileError,
) -> Result<SyncOutcome, ReconcileError> {
    let message = format!(
        "Failed to render configuration for pool {}: {}",
        pool.name_any(),
        err
    );
    pool.mark_render_degraded(err.reason(), message.clone());
    if let Err(e) = ctx.writer.update_pool_status(pool).await {
        error!(pool = %pool.name_any(), error = %e, "failed to write degraded status");
    }
    ctx.events
        .publish(
            &pool_ref(pool),
            EventType::Warning,
            reasons::RENDER_FAILED,
            actions::RENDER,
            Some(message),
        )
        .await;
    Err(err)
}

fn pool_ref(pool: &MachineConfigPool) -> ObjectReference {
    pool.object_ref(&())
}

/// Schedule the next attempt for `key` based on how its sync went
pub fn handle_result(
    config: &RenderControllerConfig,
    queue: &WorkQueue<String>,
    key: &str,
    result: Result<SyncOutcome, ReconcileError>,
) {
    match result {
        Ok(SyncOutcome::Deferred(_)) => {
            queue.forget(key);
            queue.add_after(key.to_string(), config.render_delay);
        }
        Ok(_) => queue.forget(key),
        Err(e) if queue.num_requeues(key) < config.max_retries => {
            info!(pool = %key, error = %e, "error syncing MachineConfigPool");
            queue.add_rate_limited(key.to_string());
        }
        Err(e) => {
            warn!(
                pool = %key,
                error = %e,
                cooldown_secs = config.cooldown.as_secs(),
                "dropping MachineConfigPool out of the queue"
            );
            queue.forget(key);
            queue.add_after(key.to_string(), config.cooldown);
        }
    }
}

/// Run `ctx.config.workers` workers until `shutdown` fires.
///
/// In-flight syncs finish before this returns.
pub async fn run_workers(ctx: Arc<Context>, queue: WorkQueue<String>, shutdown: CancellationToken) {
    info!(workers = ctx.config.workers, "starting render workers");
    let handles: Vec<_> = (0..ctx.config.workers)
        .map(|id| tokio::spawn(worker(id, ctx.clone(), queue.clone(), shutdown.clone())))
        .collect();

    shutdown.cancelled().await;
    queue.shutdown();
    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            error!(error = %e, "render worker panicked");
        }
    }
    info!("render workers stopped");
}

async fn worker(
    id: usize,
    ctx: Arc<Context>,
    queue: WorkQueue<String>,
    shutdown: CancellationToken,
) {
    loop {
        let key = tokio::select! {
            _ = shutdown.cancelled() => break,
            key = queue.get() => match key {
                Some(key) => key,
                None => break,
            },
        };

        debug!(worker = id, pool = %key, "processing");
        let result = sync_pool(&ctx, &key).await;
        handle_result(&ctx.config, &queue, &key, result);
        queue.done(&key);
    }
    debug!(worker = id, "worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::tests::{base, fragment, pool, version, ROLE};
    use crate::store::tests::StaticLister;
    use crate::store::MockConfigWriter;
    use async_trait::async_trait;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use mcfg_common::crd::{
        find_condition, Condition, ConditionStatus, ControllerConfigStatus,
        MachineConfigPoolStatus, PoolConfiguration, TEMPLATE_CONTROLLER_COMPLETED,
    };
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    const ROLE_WORKER: &str = "worker";

    /// Records the reason of every published event
    #[derive(Default, Clone)]
    struct EventCapture {
        reasons: Arc<Mutex<Vec<String>>>,
    }

    impl EventCapture {
        fn reasons(&self) -> Vec<String> {
            self.reasons.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventPublisher for EventCapture {
        async fn publish(
            &self,
            _resource_ref: &ObjectReference,
            _type_: EventType,
            reason: &str,
            _action: &str,
            _note: Option<String>,
        ) {
            self.reasons.lock().unwrap().push(reason.to_string());
        }
    }

    /// Collects every pool passed to a writer method
    #[derive(Default, Clone)]
    struct PoolCapture {
        pools: Arc<Mutex<Vec<MachineConfigPool>>>,
    }

    impl PoolCapture {
        fn push(&self, pool: &MachineConfigPool) {
            self.pools.lock().unwrap().push(pool.clone());
        }

        fn all(&self) -> Vec<MachineConfigPool> {
            self.pools.lock().unwrap().clone()
        }
    }

    fn completed_base() -> Arc<ControllerConfig> {
        let mut cc = base();
        cc.metadata.generation = Some(1);
        cc.status = Some(ControllerConfigStatus {
            observed_generation: Some(1),
            conditions: vec![Condition::new(
                TEMPLATE_CONTROLLER_COMPLETED,
                ConditionStatus::True,
                "",
                "",
            )],
        });
        Arc::new(cc)
    }

    fn healthy_status(current: &str) -> MachineConfigPoolStatus {
        MachineConfigPoolStatus {
            configuration: PoolConfiguration {
                name: current.to_string(),
                source: vec![],
            },
            conditions: vec![Condition::new(
                POOL_RENDER_DEGRADED,
                ConditionStatus::False,
                "",
                "",
            )],
            ..Default::default()
        }
    }

    fn lister(
        pools: Vec<MachineConfigPool>,
        configs: Vec<Arc<MachineConfig>>,
    ) -> StaticLister {
        StaticLister {
            pools: pools.into_iter().map(Arc::new).collect(),
            configs,
            controller_config: Some(completed_base()),
        }
    }

    fn context(lister: StaticLister, writer: MockConfigWriter) -> (Context, EventCapture) {
        let events = EventCapture::default();
        let ctx = Context::for_testing(Arc::new(lister), Arc::new(writer), Arc::new(events.clone()));
        (ctx, events)
    }

    fn render_for(pool_name: &str, configs: &[Arc<MachineConfig>]) -> RenderedConfig {
        generate_rendered_machine_config(&pool(pool_name), configs, &completed_base(), &version())
            .unwrap()
    }

    fn degraded(pool: &MachineConfigPool) -> Option<Condition> {
        find_condition(pool.conditions(), POOL_RENDER_DEGRADED).cloned()
    }

    /// Story: a new worker pool appears with one matching fragment. The
    /// controller creates the rendered config, points the pool at it and marks
    /// the pool as not degraded.
    #[tokio::test]
    async fn story_new_pool_gets_rendered_config() {
        let fragments = vec![fragment("00-worker", ROLE_WORKER, &[("/etc/motd", "hi")])];
        let expected = render_for("worker", &fragments);

        let created = Arc::new(Mutex::new(Vec::<String>::new()));
        let updates = PoolCapture::default();
        let statuses = PoolCapture::default();

        let mut writer = MockConfigWriter::new();
        let c = created.clone();
        writer
            .expect_create_machine_config()
            .times(1)
            .returning(move |mc| {
                c.lock().unwrap().push(mc.name_any());
                Ok(true)
            });
        let u = updates.clone();
        writer.expect_update_pool().times(1).returning(move |p| {
            u.push(p);
            Ok(p.clone())
        });
        let s = statuses.clone();
        writer
            .expect_update_pool_status()
            .times(1)
            .returning(move |p| {
                s.push(p);
                Ok(())
            });

        let (ctx, events) = context(lister(vec![pool("worker")], fragments), writer);
        let outcome = sync_pool(&ctx, "worker").await.unwrap();

        assert_eq!(outcome, SyncOutcome::Synced);
        assert_eq!(*created.lock().unwrap(), vec![expected.name()]);

        let updated = &updates.all()[0];
        assert_eq!(updated.target_config_name(), Some(expected.name().as_str()));
        assert_eq!(updated.target_source(), expected.source.as_slice());

        let status = &statuses.all()[0];
        assert_eq!(degraded(status).unwrap().status, ConditionStatus::False);
        assert_eq!(events.reasons(), vec![reasons::RENDERED_CONFIG_GENERATED]);
    }

    /// Story: nothing changed since the last sync. The only write is the
    /// idempotent re-apply of the rendered config.
    #[tokio::test]
    async fn story_resync_without_changes_only_reapplies() {
        let fragments = vec![fragment("00-worker", ROLE_WORKER, &[("/etc/motd", "hi")])];
        let rendered = render_for("worker", &fragments);

        let mut p = pool("worker");
        p.spec.configuration.name = rendered.name();
        p.spec.configuration.source = rendered.source.clone();
        p.status = Some(healthy_status(&rendered.name()));

        let mut configs = fragments.clone();
        configs.push(Arc::new(rendered.config.clone()));

        let mut writer = MockConfigWriter::new();
        writer
            .expect_apply_machine_config()
            .times(1)
            .returning(|_| Ok(false));
        writer.expect_create_machine_config().never();
        writer.expect_update_pool().never();
        writer.expect_update_pool_status().never();

        let (ctx, events) = context(lister(vec![p], configs), writer);
        assert_eq!(sync_pool(&ctx, "worker").await.unwrap(), SyncOutcome::Synced);
        assert!(events.reasons().is_empty());
    }

    #[tokio::test]
    async fn deleted_pool_is_skipped() {
        let (ctx, _) = context(StaticLister::default(), MockConfigWriter::new());
        assert_eq!(sync_pool(&ctx, "gone").await.unwrap(), SyncOutcome::Skipped);
    }

    /// Story: during an upgrade the ControllerConfig was written by the
    /// previous operator. The pool is left alone, not degraded.
    #[tokio::test]
    async fn story_base_from_other_version_defers_without_writes() {
        let fragments = vec![fragment("00-worker", ROLE_WORKER, &[("/etc/motd", "hi")])];
        let mut l = lister(vec![pool("worker")], fragments);

        let mut cc = (*completed_base()).clone();
        cc.metadata.annotations = Some(BTreeMap::from([(
            mcfg_common::GENERATED_BY_VERSION_ANNOTATION.to_string(),
            "4.13.0".to_string(),
        )]));
        l.controller_config = Some(Arc::new(cc));

        let (ctx, events) = context(l, MockConfigWriter::new());
        let outcome = sync_pool(&ctx, "worker").await.unwrap();

        assert!(matches!(outcome, SyncOutcome::Deferred(r) if r.contains("4.13.0")));
        assert!(events.reasons().is_empty());
    }

    #[tokio::test]
    async fn incomplete_controller_config_defers() {
        let fragments = vec![fragment("00-worker", ROLE_WORKER, &[("/etc/motd", "hi")])];
        let mut l = lister(vec![pool("worker")], fragments);
        l.controller_config = Some(Arc::new(base()));

        let (ctx, _) = context(l, MockConfigWriter::new());
        assert!(matches!(
            sync_pool(&ctx, "worker").await.unwrap(),
            SyncOutcome::Deferred(_)
        ));
    }

    #[tokio::test]
    async fn missing_controller_config_defers() {
        let fragments = vec![fragment("00-worker", ROLE_WORKER, &[("/etc/motd", "hi")])];
        let mut l = lister(vec![pool("worker")], fragments);
        l.controller_config = None;

        let (ctx, _) = context(l, MockConfigWriter::new());
        assert!(matches!(
            sync_pool(&ctx, "worker").await.unwrap(),
            SyncOutcome::Deferred(r) if r.contains("not found")
        ));
    }

    /// Story: someone creates a pool with `machineConfigSelector: {}`. That
    /// would sweep every MachineConfig in the cluster into it, so the pool is
    /// flagged with a warning event and not rendered.
    #[tokio::test]
    async fn story_empty_selector_is_refused() {
        let mut p = pool("greedy");
        p.spec.machine_config_selector = Some(LabelSelector::default());
        let fragments = vec![fragment("00-worker", ROLE_WORKER, &[("/etc/motd", "hi")])];

        let (ctx, events) = context(lister(vec![p], fragments), MockConfigWriter::new());
        assert_eq!(sync_pool(&ctx, "greedy").await.unwrap(), SyncOutcome::Skipped);
        assert_eq!(events.reasons(), vec![reasons::SELECTING_ALL]);
    }

    /// Story: an infra pool is created before any infra MachineConfig. The
    /// pool is marked degraded with a message naming its selector.
    #[tokio::test]
    async fn story_pool_without_fragments_is_degraded() {
        let statuses = PoolCapture::default();
        let mut writer = MockConfigWriter::new();
        let s = statuses.clone();
        writer
            .expect_update_pool_status()
            .times(1)
            .returning(move |p| {
                s.push(p);
                Ok(())
            });

        let fragments = vec![fragment("00-worker", ROLE_WORKER, &[("/etc/motd", "hi")])];
        let (ctx, events) = context(lister(vec![pool("infra")], fragments), writer);

        let err = sync_pool(&ctx, "infra").await.unwrap_err();
        assert!(matches!(err, ReconcileError::NoMatchingConfigs { .. }));

        let cond = degraded(&statuses.all()[0]).unwrap();
        assert_eq!(cond.status, ConditionStatus::True);
        assert_eq!(cond.reason, "NoMatchingConfigs");
        assert!(cond.message.contains("Failed to render configuration for pool infra"));
        assert!(cond.message.contains(ROLE));
        assert_eq!(events.reasons(), vec![reasons::RENDER_FAILED]);
    }

    #[tokio::test]
    async fn pool_without_selector_is_degraded() {
        let mut p = pool("worker");
        p.spec.machine_config_selector = None;

        let mut writer = MockConfigWriter::new();
        writer
            .expect_update_pool_status()
            .times(1)
            .returning(|_| Ok(()));

        let fragments = vec![fragment("00-worker", ROLE_WORKER, &[("/etc/motd", "hi")])];
        let (ctx, _) = context(lister(vec![p], fragments), writer);

        let err = sync_pool(&ctx, "worker").await.unwrap_err();
        assert!(err.to_string().contains("<none>"));
    }

    /// Story: one fragment has a relative file path. Nothing is rendered and
    /// the degraded message names the broken fragment.
    #[tokio::test]
    async fn story_invalid_fragment_degrades_pool() {
        let statuses = PoolCapture::default();
        let mut writer = MockConfigWriter::new();
        let s = statuses.clone();
        writer
            .expect_update_pool_status()
            .times(1)
            .returning(move |p| {
                s.push(p);
                Ok(())
            });
        writer.expect_create_machine_config().never();
        writer.expect_update_pool().never();

        let fragments = vec![
            fragment("00-worker", ROLE_WORKER, &[("/etc/motd", "hi")]),
            fragment("99-broken", ROLE_WORKER, &[("etc/relative", "x")]),
        ];
        let (ctx, _) = context(lister(vec![pool("worker")], fragments), writer);

        let err = sync_pool(&ctx, "worker").await.unwrap_err();
        assert_eq!(err.reason(), "InvalidConfig");

        let cond = degraded(&statuses.all()[0]).unwrap();
        assert_eq!(cond.reason, "InvalidConfig");
        assert!(cond.message.contains("99-broken"));
    }

    #[tokio::test]
    async fn failed_status_write_still_returns_render_error() {
        let mut writer = MockConfigWriter::new();
        writer
            .expect_update_pool_status()
            .times(1)
            .returning(|_| Err(mcfg_common::Error::internal("api down")));

        let (ctx, _) = context(lister(vec![pool("infra")], vec![]), writer);
        let err = sync_pool(&ctx, "infra").await.unwrap_err();
        assert!(matches!(err, ReconcileError::NoMatchingConfigs { .. }));
    }

    /// Story: the worker pool is paused when the kubelet CA rotates and the
    /// MOTD changes too. The pool moves to a spliced config carrying only the
    /// new CA.
    #[tokio::test]
    async fn story_paused_pool_adopts_spliced_ca() {
        let old = vec![fragment(
            "00-worker",
            ROLE_WORKER,
            &[(KUBELET_CA_PATH, "old-ca"), ("/etc/motd", "old")],
        )];
        let current = render_for("worker", &old);

        let new = vec![fragment(
            "00-worker",
            ROLE_WORKER,
            &[(KUBELET_CA_PATH, "new-ca"), ("/etc/motd", "new")],
        )];

        let mut p = pool("worker");
        p.spec.paused = true;
        p.spec.configuration.name = current.name();
        let mut status = healthy_status(&current.name());
        status.configuration.source = current.source.clone();
        p.status = Some(status);

        let mut configs = new.clone();
        configs.push(Arc::new(current.config.clone()));

        let created = Arc::new(Mutex::new(Vec::<MachineConfig>::new()));
        let updates = PoolCapture::default();
        let mut writer = MockConfigWriter::new();
        let c = created.clone();
        writer
            .expect_create_machine_config()
            .times(1)
            .returning(move |mc| {
                c.lock().unwrap().push(mc.clone());
                Ok(true)
            });
        let u = updates.clone();
        writer.expect_update_pool().times(1).returning(move |p| {
            u.push(p);
            Ok(p.clone())
        });
        writer.expect_update_pool_status().never();

        let (ctx, events) = context(lister(vec![p], configs), writer);
        assert_eq!(sync_pool(&ctx, "worker").await.unwrap(), SyncOutcome::Synced);

        let spliced = created.lock().unwrap()[0].clone();
        assert!(spliced.name_any().starts_with("spliced-worker-"));
        let files = &spliced.spec.config;
        assert_eq!(files.read_file(KUBELET_CA_PATH).unwrap().unwrap(), b"new-ca");
        assert_eq!(files.read_file("/etc/motd").unwrap().unwrap(), b"old");

        assert_eq!(
            updates.all()[0].target_config_name(),
            Some(spliced.name_any().as_str())
        );
        assert_eq!(updates.all()[0].target_source(), current.source.as_slice());
        assert_eq!(events.reasons(), vec![reasons::SPLICED_CONFIG_GENERATED]);
    }

    /// Story: the pool is paused and only an unrelated file changed. There is
    /// nothing to splice, so the fresh render is adopted as usual.
    #[tokio::test]
    async fn story_paused_pool_without_sensitive_change_adopts_render() {
        let old = vec![fragment("00-worker", ROLE_WORKER, &[("/etc/motd", "old")])];
        let current = render_for("worker", &old);
        let new = vec![fragment("00-worker", ROLE_WORKER, &[("/etc/motd", "new")])];
        let expected = render_for("worker", &new);

        let mut p = pool("worker");
        p.spec.paused = true;
        p.spec.configuration.name = current.name();
        p.status = Some(healthy_status(&current.name()));

        let mut configs = new.clone();
        configs.push(Arc::new(current.config.clone()));

        let updates = PoolCapture::default();
        let mut writer = MockConfigWriter::new();
        writer
            .expect_create_machine_config()
            .times(1)
            .returning(|_| Ok(true));
        let u = updates.clone();
        writer.expect_update_pool().times(1).returning(move |p| {
            u.push(p);
            Ok(p.clone())
        });

        let (ctx, _) = context(lister(vec![p], configs), writer);
        assert_eq!(sync_pool(&ctx, "worker").await.unwrap(), SyncOutcome::Synced);
        assert_eq!(
            updates.all()[0].target_config_name(),
            Some(expected.name().as_str())
        );
    }

    #[tokio::test]
    async fn os_image_override_emits_event_once() {
        let mut mc = (*fragment("50-os", ROLE_WORKER, &[])).clone();
        mc.spec.os_image_url = "quay.io/custom/os@sha256:pinned".to_string();
        let fragments = vec![Arc::new(mc)];
        let rendered = render_for("worker", &fragments);

        let mut writer = MockConfigWriter::new();
        writer
            .expect_create_machine_config()
            .returning(|_| Ok(true));
        writer.expect_update_pool().returning(|p| Ok(p.clone()));
        writer.expect_update_pool_status().returning(|_| Ok(()));
        let (ctx, events) = context(lister(vec![pool("worker")], fragments.clone()), writer);
        sync_pool(&ctx, "worker").await.unwrap();
        assert!(events
            .reasons()
            .contains(&reasons::OS_IMAGE_URL_OVERRIDDEN.to_string()));

        // Already targeting an overridden config: no new event.
        let mut p = pool("worker");
        p.spec.configuration.name = rendered.name();
        p.spec.configuration.source = rendered.source.clone();
        p.status = Some(healthy_status(&rendered.name()));
        let mut configs = fragments;
        configs.push(Arc::new(rendered.config.clone()));

        let mut writer = MockConfigWriter::new();
        writer
            .expect_apply_machine_config()
            .returning(|_| Ok(false));
        let (ctx, events) = context(lister(vec![p], configs), writer);
        sync_pool(&ctx, "worker").await.unwrap();
        assert!(events.reasons().is_empty());
    }

    fn fast_config(max_retries: u32) -> RenderControllerConfig {
        RenderControllerConfig {
            max_retries,
            render_delay: Duration::from_secs(5),
            cooldown: Duration::from_secs(60),
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn render_failure() -> Result<SyncOutcome, ReconcileError> {
        Err(ReconcileError::Render(RenderError::invalid("bad")))
    }

    #[tokio::test(start_paused = true)]
    async fn errors_back_off_then_cool_down() {
        let config = fast_config(2);
        let queue = config.new_queue();
        let key = "worker";

        handle_result(&config, &queue, key, render_failure());
        handle_result(&config, &queue, key, render_failure());
        assert_eq!(queue.num_requeues(key), 2);

        handle_result(&config, &queue, key, render_failure());
        assert_eq!(queue.num_requeues(key), 0, "exhausted key is forgotten");

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(queue.get().await.as_deref(), Some("worker"));
    }

    #[tokio::test(start_paused = true)]
    async fn deferral_does_not_consume_retries() {
        let config = fast_config(2);
        let queue = config.new_queue();
        let key = "worker";

        handle_result(&config, &queue, key, render_failure());
        handle_result(
            &config,
            &queue,
            key,
            Ok(SyncOutcome::Deferred("waiting".to_string())),
        );
        assert_eq!(queue.num_requeues(key), 0);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(queue.get().await.as_deref(), Some("worker"));
    }

    #[tokio::test]
    async fn success_forgets_failures() {
        let config = fast_config(5);
        let queue = config.new_queue();
        let key = "worker";

        handle_result(&config, &queue, key, render_failure());
        handle_result(&config, &queue, key, Ok(SyncOutcome::Synced));
        assert_eq!(queue.num_requeues(key), 0);
    }

    #[tokio::test]
    async fn workers_stop_on_shutdown() {
        let (ctx, _) = context(StaticLister::default(), MockConfigWriter::new());
        let ctx = Arc::new(ctx);
        let queue = ctx.config.new_queue();
        queue.add("gone".to_string());

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_workers(ctx, queue.clone(), shutdown.clone()));
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("workers must stop")
            .unwrap();
    }
}
