use std::sync::Arc;

use anyhow::Context;
use bridge_protocol::{ApiSpecification, RpcEndpoint};
use tracing::info;
use uuid::Uuid;

use crate::{
    config::BridgeConfig,
    connection::ConnectionManager,
    facade::{ExternalAppFacade, FacadeSettings},
    graph::GraphStore,
    notification::{LifecycleEvent, Notification, Notifier},
    procedures::EditorProcedures,
    run_registry::{RunRegistry, RunStateObserver},
};

/// Logs every run that starts.
struct RunLog(Arc<dyn Notifier>);

impl RunStateObserver for RunLog {
    fn on_run_state_changed(&self, name: &str, in_progress: bool) {
        if in_progress {
            self.0
                .notify(Notification::info(LifecycleEvent::RunStarted, format!("{name} started")).log_only());
        }
    }
}

/// Everything one editor instance needs, wired in dependency order.
pub struct BridgeContext {
    pub config: BridgeConfig,
    pub specification: Arc<ApiSpecification>,
    pub endpoint: Arc<RpcEndpoint>,
    pub runs: Arc<RunRegistry>,
    pub connections: Arc<ConnectionManager>,
    pub facade: Arc<ExternalAppFacade>,
    pub graph: Arc<dyn GraphStore>,
    pub notifier: Arc<dyn Notifier>,
    pub window_id: String,
}

impl BridgeContext {
    pub fn build(
        config: BridgeConfig,
        graph: Arc<dyn GraphStore>,
        notifier: Arc<dyn Notifier>,
    ) -> anyhow::Result<Self> {
        let specification = Arc::new(match &config.api_specification {
            Some(path) => ApiSpecification::from_path(path)
                .with_context(|| format!("loading API specification {}", path.display()))?,
            None => ApiSpecification::bundled().context("loading bundled API specification")?,
        });

        let runs = RunRegistry::new();
        runs.set_global_hook(Arc::new(RunLog(notifier.clone())));

        let procedures = EditorProcedures::new(&specification, graph.clone(), runs.clone(), notifier.clone())?;
        let endpoint = RpcEndpoint::new(specification.clone(), Arc::new(procedures));

        let connections = ConnectionManager::new(notifier.clone(), config.connect_backoff());

        let window_id = format!("editor-{}", Uuid::new_v4());
        let facade = ExternalAppFacade::new(
            endpoint.clone(),
            connections.clone(),
            runs.clone(),
            graph.clone(),
            notifier.clone(),
            FacadeSettings {
                own_window_id: window_id.clone(),
                chunk_threshold: config.chunk_threshold,
                notify_on_change: config.notify_on_change,
            },
        )?;

        Ok(Self {
            config,
            specification,
            endpoint,
            runs,
            connections,
            facade,
            graph,
            notifier,
            window_id,
        })
    }

    /// Register the configured backend, if any, and start polling.
    pub fn start(&self) {
        if let Some(url) = &self.config.backend_url {
            self.facade.register_backend_application(url.as_str());
        }
        info!(
            interval_ms = self.config.poll_interval_ms,
            "starting connection polling"
        );
        self.connections.start_polling(self.config.poll_interval());
    }

    pub fn shutdown(&self) {
        self.connections.stop_polling();
        self.endpoint.detach_transport();
    }
}
