//! Orchestration driver.
//!
//! Every stage spawns one task per eligible component and joins them all
//! before the next stage starts. A component that fails is dropped from later
//! stages; its siblings carry on. After verification the load balancer takes
//! its own branch (bootstrap, render, upload) concurrently with the host entry
//! and bootstrap stages of everything else.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::component::{ComponentRole, ServerComponent};
use crate::error::ComponentError;
use crate::haproxy;
use crate::model::FormationSpec;
use crate::pool::PoolAggregator;
use crate::report::{ComponentReport, RunReport, Stage};
use crate::settings::RemoteContext;

type SharedComponent = Arc<Mutex<ServerComponent>>;
type StageResults = Vec<(usize, Result<(), ComponentError>)>;

/// Drives a compiled formation against a provider and transport.
pub struct Orchestrator {
    ctx: RemoteContext,
}

impl Orchestrator {
    pub fn new(ctx: RemoteContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &RemoteContext {
        &self.ctx
    }

    /// Run every stage to completion. Never returns early on a component
    /// failure; inspect [`RunReport::success`].
    pub async fn run(&self, spec: &FormationSpec) -> RunReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("formation_run", %run_id);
        Run::new(&self.ctx, spec, run_id)
            .execute()
            .instrument(span)
            .await
    }
}

struct LoadBalancerOutcome {
    stages: Vec<(Stage, StageResults)>,
    run_failure: Option<String>,
}

struct Run<'a> {
    ctx: &'a RemoteContext,
    spec: &'a FormationSpec,
    run_id: Uuid,
    components: Vec<SharedComponent>,
    reports: Vec<ComponentReport>,
    semaphore: Arc<Semaphore>,
    run_failures: Vec<String>,
}

fn bootstrap_op(
    component: SharedComponent,
    ctx: RemoteContext,
) -> impl Future<Output = Result<(), ComponentError>> + Send + 'static {
    async move {
        let mut component = component.lock().await;
        component.bootstrap(&ctx).await
    }
}

impl<'a> Run<'a> {
    fn new(ctx: &'a RemoteContext, spec: &'a FormationSpec, run_id: Uuid) -> Self {
        let mut components = Vec::new();
        let mut reports = Vec::new();
        for component in spec.components() {
            reports.push(ComponentReport::new(
                component.server_name(),
                component.role().clone(),
            ));
            components.push(Arc::new(Mutex::new(component)));
        }

        Self {
            ctx,
            spec,
            run_id,
            components,
            reports,
            semaphore: Arc::new(Semaphore::new(ctx.settings.max_parallelism.max(1))),
            run_failures: Vec::new(),
        }
    }

    async fn execute(mut self) -> RunReport {
        info!(components = self.components.len(), "starting formation run");
        self.open_sinks().await;

        let eligible = self.eligible(|_| true);
        let results = self
            .run_stage(Stage::Provision, &eligible, |component, ctx| async move {
                let mut component = component.lock().await;
                component.provision(&ctx).await
            })
            .await;
        self.record(Stage::Provision, results);

        let eligible = self.eligible(|_| true);
        let results = self
            .run_stage(Stage::Verify, &eligible, |component, ctx| async move {
                let mut component = component.lock().await;
                component.verify(&ctx).await
            })
            .await;
        let verify_failed = results.iter().any(|(_, r)| r.is_err());
        self.record(Stage::Verify, results);
        if verify_failed {
            error!("verification failed, not bootstrapping");
            self.run_failures
                .push("verification failed for at least one component; run stopped before bootstrap".into());
            return self.finish().await;
        }

        let others = self.eligible(|role| !role.is_load_balancer());
        if self.spec.load_balancer.is_none() {
            let results = self.run_stage(Stage::Bootstrap, &others, bootstrap_op).await;
            self.record(Stage::Bootstrap, results);
            return self.finish().await;
        }

        let balancers = self.eligible(ComponentRole::is_load_balancer);
        let pools = self.pool_snapshot().await;
        let entries = self.vip_entries(&balancers).await;

        let (member_stages, balancer) = tokio::join!(
            self.bootstrap_members(&others, entries),
            self.finalize_load_balancer(&balancers, &pools),
        );
        for (stage, results) in member_stages.into_iter().chain(balancer.stages) {
            self.record(stage, results);
        }
        self.run_failures.extend(balancer.run_failure);

        self.finish().await
    }

    async fn open_sinks(&mut self) {
        let log_dir = &self.ctx.settings.log_dir;
        for (component, report) in self.components.iter().zip(self.reports.iter_mut()) {
            let mut component = component.lock().await;
            if let Err(e) = component.open_sink(log_dir) {
                component.mark_failed(&e);
                report.record(Stage::Provision, Err(e.to_string()));
            }
        }
    }

    /// Indices of components that have not failed and whose role passes `filter`.
    fn eligible(&self, filter: impl Fn(&ComponentRole) -> bool) -> Vec<usize> {
        self.reports
            .iter()
            .enumerate()
            .filter(|(_, r)| r.succeeded() && filter(&r.role))
            .map(|(i, _)| i)
            .collect()
    }

    async fn run_stage<F, Fut>(&self, stage: Stage, indices: &[usize], op: F) -> StageResults
    where
        F: Fn(SharedComponent, RemoteContext) -> Fut,
        Fut: Future<Output = Result<(), ComponentError>> + Send + 'static,
    {
        if indices.is_empty() {
            return Vec::new();
        }
        info!(%stage, components = indices.len(), "stage started");

        let mut set = JoinSet::new();
        for &index in indices {
            let semaphore = Arc::clone(&self.semaphore);
            let task = op(Arc::clone(&self.components[index]), self.ctx.clone());
            let span = info_span!("component", server = %self.reports[index].server_name, %stage);
            set.spawn(
                async move {
                    let _permit = semaphore.acquire_owned().await;
                    (index, task.await)
                }
                .instrument(span),
            );
        }

        let mut results: StageResults = Vec::with_capacity(indices.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => error!(%stage, error = %e, "component task did not finish"),
            }
        }

        // Tasks that panicked never reported back.
        for &index in indices {
            if results.iter().all(|(i, _)| *i != index) {
                let err = ComponentError::Aborted {
                    server: self.reports[index].server_name.clone(),
                    reason: format!("{stage} task panicked"),
                };
                self.components[index].lock().await.mark_failed(&err);
                results.push((index, Err(err)));
            }
        }
        results.sort_by_key(|(i, _)| *i);

        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        info!(%stage, succeeded = results.len() - failed, failed, "stage finished");
        results
    }

    fn record(&mut self, stage: Stage, results: StageResults) {
        for (index, result) in results {
            let report = &mut self.reports[index];
            if let Err(e) = &result {
                warn!(server = %report.server_name, %stage, error = %e, "component failed");
            }
            report.record(stage, result.map_err(|e| e.to_string()));
        }
    }

    /// Pool membership with addresses as they stand after verification.
    async fn pool_snapshot(&self) -> PoolAggregator {
        let mut guards = Vec::with_capacity(self.components.len());
        for component in &self.components {
            guards.push(component.lock().await);
        }
        PoolAggregator::from_components(self.spec, guards.iter().map(|guard| &**guard))
    }

    /// `.vip` entries pointing at the first healthy load balancer.
    async fn vip_entries(&self, balancers: &[usize]) -> Option<Vec<String>> {
        let &first = balancers.first()?;
        let balancer = self.components[first].lock().await;
        match balancer.host_entries(self.spec.pool_names()) {
            Ok(entries) => Some(entries),
            Err(e) => {
                warn!(error = %e, "no host entries to distribute");
                None
            }
        }
    }

    async fn bootstrap_members(
        &self,
        indices: &[usize],
        entries: Option<Vec<String>>,
    ) -> Vec<(Stage, StageResults)> {
        let mut stages = Vec::new();
        let mut remaining = indices.to_vec();

        if let Some(entries) = entries {
            let entries = Arc::new(entries);
            let results = self
                .run_stage(Stage::HostEntries, &remaining, move |component, ctx| {
                    let entries = Arc::clone(&entries);
                    async move {
                        let mut component = component.lock().await;
                        component.install_host_entries(&ctx, &entries).await
                    }
                })
                .await;
            remaining.retain(|i| results.iter().any(|(j, r)| j == i && r.is_ok()));
            stages.push((Stage::HostEntries, results));
        }

        let results = self.run_stage(Stage::Bootstrap, &remaining, bootstrap_op).await;
        stages.push((Stage::Bootstrap, results));
        stages
    }

    async fn finalize_load_balancer(&self, balancers: &[usize], pools: &PoolAggregator) -> LoadBalancerOutcome {
        let bootstrapped = self.run_stage(Stage::Bootstrap, balancers, bootstrap_op).await;
        let ready: Vec<usize> = bootstrapped
            .iter()
            .filter(|(_, r)| r.is_ok())
            .map(|(i, _)| *i)
            .collect();
        let mut outcome = LoadBalancerOutcome {
            stages: vec![(Stage::Bootstrap, bootstrapped)],
            run_failure: None,
        };
        if ready.is_empty() {
            return outcome;
        }

        match haproxy::render(pools) {
            Ok(config) => {
                info!(bytes = config.len(), "rendered load balancer config");
                let config = Arc::new(config);
                let results = self
                    .run_stage(Stage::Finalize, &ready, move |component, ctx| {
                        let config = Arc::clone(&config);
                        async move {
                            let mut component = component.lock().await;
                            component.upload_config(&ctx, &config).await
                        }
                    })
                    .await;
                outcome.stages.push((Stage::Finalize, results));
            }
            Err(e) => {
                error!(error = %e, "load balancer config not rendered");
                outcome.run_failure = Some(e.to_string());
            }
        }
        outcome
    }

    async fn finish(mut self) -> RunReport {
        for (component, report) in self.components.iter().zip(self.reports.iter_mut()) {
            let component = component.lock().await;
            report.ip_address = component.ip_address().map(str::to_string);
            report.log_path = component.log_path().map(|p| p.to_path_buf());
        }

        let report = RunReport {
            run_id: self.run_id,
            components: self.reports,
            run_failures: self.run_failures,
        };
        if report.success() {
            info!("formation run finished");
        } else {
            error!(
                failed = report.failed_components().count(),
                run_failures = report.run_failures.len(),
                "formation run finished with failures"
            );
        }
        report
    }
}
