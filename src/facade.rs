//! Single entry point for editor operations that involve an external
//! application.
//!
//! Every public operation reports its outcome through exactly one
//! notification and never returns an error to the editor: failures are
//! already surfaced to the user by the time the call returns.

use std::sync::{
    Arc, Mutex, RwLock, Weak,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use bridge_protocol::{
    ApiSpecification, RpcEndpoint, RpcError,
    jsonrpc::{self, Id, Request, Response},
    message::{AppCapabilities, ImportParams, MessageResult, MessageType, StopParams},
    method::{BackendMethod, is_custom},
    validator::SchemaValidator,
    window::WindowHandle,
};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::{
    connection::{ConnectionListener, ConnectionManager, ExternalApplication},
    external_app::{BackendApplication, FrontendApplication},
    graph::GraphStore,
    logger::RpcTelemetry,
    notification::{LifecycleEvent, Notification, Notifier},
    run_registry::RunRegistry,
};

/// Settings the facade needs from the configuration.
#[derive(Debug, Clone)]
pub struct FacadeSettings {
    /// Id of the window hosting this editor.
    pub own_window_id: String,
    pub chunk_threshold: usize,
    pub notify_on_change: bool,
}

enum ActivePeer {
    Backend(Arc<BackendApplication>),
    Frontend(Arc<FrontendApplication>),
}

impl ActivePeer {
    fn id(&self) -> String {
        match self {
            ActivePeer::Backend(b) => b.id().to_string(),
            ActivePeer::Frontend(f) => f.id().to_string(),
        }
    }

    fn handle(&self) -> Arc<dyn ExternalApplication> {
        match self {
            ActivePeer::Backend(b) => b.clone(),
            ActivePeer::Frontend(f) => f.clone(),
        }
    }
}

pub struct ExternalAppFacade {
    endpoint: Arc<RpcEndpoint>,
    connections: Arc<ConnectionManager>,
    runs: Arc<RunRegistry>,
    graph: Arc<dyn GraphStore>,
    notifier: Arc<dyn Notifier>,
    telemetry: RpcTelemetry,
    specification_schema: SchemaValidator,
    dataflow_schema: SchemaValidator,
    capabilities: RwLock<AppCapabilities>,
    active: Mutex<Option<ActivePeer>>,
    settings: FacadeSettings,
    notify_on_change: AtomicBool,
}

struct FacadeListener(Weak<ExternalAppFacade>);

#[async_trait]
impl ConnectionListener for FacadeListener {
    async fn on_connected(&self, id: &str) {
        if let Some(facade) = self.0.upgrade() {
            facade.notifier.notify(Notification::info(LifecycleEvent::Connected, "External application connected").detail(id));
            facade.initialize_connection().await;
        }
    }

    async fn on_disconnected(&self, id: &str) {
        if let Some(facade) = self.0.upgrade() {
            debug!(%id, "dropping capabilities of disconnected peer");
            facade.set_capabilities(AppCapabilities::default());
        }
    }
}

/// Parse a `MessageResult`; a missing result counts as a bare OK.
fn message_result(value: Value) -> Result<MessageResult, RpcError> {
    if value.is_null() {
        return Ok(MessageResult::ok(None));
    }
    serde_json::from_value(value).map_err(|e| RpcError::Serialization(e.to_string()))
}

/// Payloads may arrive as JSON objects or as JSON text.
fn json_content(content: Option<Value>) -> Option<Value> {
    match content? {
        Value::String(text) => serde_json::from_str(&text).ok(),
        other => Some(other),
    }
}

impl ExternalAppFacade {
    pub fn new(
        endpoint: Arc<RpcEndpoint>,
        connections: Arc<ConnectionManager>,
        runs: Arc<RunRegistry>,
        graph: Arc<dyn GraphStore>,
        notifier: Arc<dyn Notifier>,
        settings: FacadeSettings,
    ) -> anyhow::Result<Arc<Self>> {
        let spec: &ApiSpecification = endpoint.specification();
        let specification_schema = spec.compile_common("Specification")?;
        let dataflow_schema = spec.compile_common("Dataflow")?;
        let facade = Arc::new(Self {
            notify_on_change: AtomicBool::new(settings.notify_on_change),
            endpoint,
            connections,
            runs,
            graph,
            notifier,
            telemetry: RpcTelemetry::new(),
            specification_schema,
            dataflow_schema,
            capabilities: RwLock::new(AppCapabilities::default()),
            active: Mutex::new(None),
            settings,
        });
        facade
            .connections
            .subscribe(Arc::new(FacadeListener(Arc::downgrade(&facade))));
        Ok(facade)
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn runs(&self) -> &Arc<RunRegistry> {
        &self.runs
    }

    pub fn endpoint(&self) -> &Arc<RpcEndpoint> {
        &self.endpoint
    }

    pub fn capabilities(&self) -> AppCapabilities {
        self.capabilities.read().map(|c| c.clone()).unwrap_or_default()
    }

    fn set_capabilities(&self, caps: AppCapabilities) {
        if let Ok(mut c) = self.capabilities.write() {
            *c = caps;
        }
    }

    pub fn active_peer(&self) -> Option<String> {
        self.active.lock().ok().and_then(|a| a.as_ref().map(ActivePeer::id))
    }

    pub fn is_connected(&self) -> bool {
        self.connections.any_connected()
    }

    pub fn set_notify_on_change(&self, enabled: bool) {
        self.notify_on_change.store(enabled, Ordering::SeqCst);
    }

    /// The editor setting, unless the peer opted out.
    fn change_notifications_enabled(&self) -> bool {
        self.notify_on_change.load(Ordering::SeqCst)
            && self.capabilities().notify_on_change.unwrap_or(true)
    }

    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        self.telemetry
            .instrument(method, || self.endpoint.call(method, params))
            .await
    }

    // -----------------------------------------------------------------
    // Specification and capabilities
    // -----------------------------------------------------------------

    /// Fetch the node specification and load it into the graph store.
    pub async fn request_specification(&self) -> bool {
        let title = "Could not load specification";
        let result = match self
            .call(BackendMethod::SpecificationGet.as_str(), None)
            .await
            .and_then(message_result)
        {
            Ok(r) => r,
            Err(e) => {
                self.notifier
                    .notify(Notification::error(LifecycleEvent::SpecificationInvalid, title).detail(e.to_string()));
                return false;
            }
        };

        if !result.is_ok() {
            let mut n = Notification::new(LifecycleEvent::SpecificationInvalid, result.kind.into(), title);
            if let Some(d) = result.describe() {
                n = n.detail(d);
            }
            self.notifier.notify(n);
            return false;
        }

        let Some(specification) = json_content(result.content) else {
            self.notifier.notify(
                Notification::error(LifecycleEvent::SpecificationInvalid, title)
                    .detail("external application sent no specification"),
            );
            return false;
        };

        let violations = self.specification_schema.validate(&specification);
        if !violations.is_empty() {
            self.notifier.notify(
                Notification::error(LifecycleEvent::SpecificationInvalid, "Specification is invalid")
                    .details(violations.iter().map(ToString::to_string)),
            );
            return false;
        }

        match self.graph.load_specification(specification).await {
            Ok(()) => {
                self.notifier
                    .notify(Notification::info(LifecycleEvent::SpecificationLoaded, "Specification loaded"));
                true
            }
            Err(e) => {
                self.notifier
                    .notify(Notification::error(LifecycleEvent::SpecificationInvalid, title).detail(e.to_string()));
                false
            }
        }
    }

    /// Fetch capabilities; on any failure the capability set is empty.
    pub async fn request_app_capabilities(&self) -> AppCapabilities {
        let caps = match self
            .call(BackendMethod::AppCapabilitiesGet.as_str(), None)
            .await
            .and_then(|v| serde_json::from_value(v).map_err(|e| RpcError::Serialization(e.to_string())))
        {
            Ok(caps) => caps,
            Err(e) => {
                self.notifier.notify(
                    Notification::warning(
                        LifecycleEvent::CapabilityFetchFailed,
                        "Could not fetch application capabilities",
                    )
                    .detail(e.to_string()),
                );
                AppCapabilities::default()
            }
        };
        self.set_capabilities(caps.clone());
        caps
    }

    // -----------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------

    fn run_params(procedure: &str, dataflow: Value) -> Value {
        if is_custom(procedure) {
            json!({ "procedure_name": procedure, "dataflow": dataflow })
        } else {
            json!({ "dataflow": dataflow })
        }
    }

    /// Send the current dataflow to `procedure`.
    ///
    /// With `require_response` the run is tracked until the peer answers and
    /// its result is returned; otherwise the request is fired and its outcome
    /// only reported.
    pub async fn request_dataflow_action(
        self: &Arc<Self>,
        procedure: &str,
        require_response: bool,
    ) -> Option<MessageResult> {
        if self.runs.is_in_progress(procedure) {
            self.notifier.notify(
                Notification::error(LifecycleEvent::RunRejected, format!("{procedure} is already running"))
                    .detail("wait for it to finish or stop it first"),
            );
            return None;
        }

        let dataflow = match self.graph.save_dataflow().await {
            Ok(d) => d,
            Err(e) => {
                self.notifier
                    .notify(Notification::error(LifecycleEvent::DataflowInvalid, "Could not save dataflow").detail(e.to_string()));
                return None;
            }
        };
        let params = Self::run_params(procedure, dataflow);

        if !require_response {
            let this = self.clone();
            let procedure = procedure.to_string();
            tokio::spawn(async move {
                let outcome = this.call(&procedure, Some(params)).await;
                this.report_run(&procedure, outcome);
            });
            return None;
        }

        if !self.runs.try_start(procedure) {
            self.notifier
                .notify(Notification::error(LifecycleEvent::RunRejected, format!("{procedure} is already running")));
            return None;
        }
        info!(%procedure, "run started");

        let outcome = self.call(procedure, Some(params)).await;
        self.runs.set_in_progress(procedure, false);
        self.report_run(procedure, outcome)
    }

    fn report_run(&self, procedure: &str, outcome: Result<Value, RpcError>) -> Option<MessageResult> {
        match outcome.and_then(message_result) {
            Ok(result) => {
                let title = match result.kind {
                    MessageType::Ok => format!("{procedure} finished"),
                    MessageType::Warning => format!("{procedure} finished with warnings"),
                    MessageType::Error => format!("{procedure} failed"),
                };
                let mut n = Notification::new(LifecycleEvent::RunFinished, result.kind.into(), title);
                if let Some(d) = result.describe() {
                    n = n.detail(d);
                }
                self.notifier.notify(n);
                Some(result)
            }
            Err(e) => {
                self.notifier.notify(
                    Notification::error(LifecycleEvent::RunFinished, format!("{procedure} failed")).detail(e.to_string()),
                );
                None
            }
        }
    }

    /// `dataflow_validate` through the same tracked path as a run.
    pub async fn validate_dataflow(self: &Arc<Self>) -> Option<MessageResult> {
        self.request_dataflow_action(BackendMethod::DataflowValidate.as_str(), true)
            .await
    }

    pub async fn request_dataflow_stop(&self, procedure: &str) -> Option<MessageResult> {
        if !self.runs.is_in_progress(procedure) {
            self.notifier.notify(
                Notification::warning(LifecycleEvent::RunStopRefused, format!("{procedure} is not running")),
            );
            return None;
        }
        let stoppable = self.capabilities().stoppable_methods;
        if !stoppable.is_empty() && !stoppable.iter().any(|m| m == procedure) {
            self.notifier.notify(
                Notification::warning(LifecycleEvent::RunStopRefused, format!("{procedure} cannot be stopped"))
                    .detail(format!("stoppable: {}", stoppable.join(", "))),
            );
            return None;
        }

        let params = serde_json::to_value(StopParams { method: procedure.to_string() }).ok();
        match self
            .call(BackendMethod::DataflowStop.as_str(), params)
            .await
            .and_then(message_result)
        {
            Ok(result) => {
                if result.is_ok() {
                    self.runs.set_in_progress(procedure, false);
                }
                let mut n = Notification::new(
                    LifecycleEvent::RunFinished,
                    result.kind.into(),
                    format!("Stop of {procedure}: {}", if result.is_ok() { "done" } else { "refused" }),
                );
                if let Some(d) = result.describe() {
                    n = n.detail(d);
                }
                self.notifier.notify(n);
                Some(result)
            }
            Err(e) => {
                self.notifier.notify(
                    Notification::error(LifecycleEvent::RunStopRefused, format!("Could not stop {procedure}"))
                        .detail(e.to_string()),
                );
                None
            }
        }
    }

    // -----------------------------------------------------------------
    // Import / export
    // -----------------------------------------------------------------

    /// Let the peer convert its own dataflow format and load the result.
    pub async fn import_dataflow(&self, contents: impl Into<String>, mime: Option<&str>) -> bool {
        let title = "Could not import dataflow";
        let params = ImportParams {
            external_application_dataflow: contents.into(),
            mime: mime.map(str::to_string),
            base64: false,
        };
        let result = match self
            .call(BackendMethod::DataflowImport.as_str(), serde_json::to_value(params).ok())
            .await
            .and_then(message_result)
        {
            Ok(r) => r,
            Err(e) => {
                self.notifier
                    .notify(Notification::error(LifecycleEvent::DataflowInvalid, title).detail(e.to_string()));
                return false;
            }
        };
        if !result.is_ok() {
            let mut n = Notification::new(LifecycleEvent::DataflowInvalid, result.kind.into(), title);
            if let Some(d) = result.describe() {
                n = n.detail(d);
            }
            self.notifier.notify(n);
            return false;
        }

        let Some(dataflow) = json_content(result.content) else {
            self.notifier.notify(
                Notification::error(LifecycleEvent::DataflowInvalid, title).detail("external application sent no dataflow"),
            );
            return false;
        };
        let violations = self.dataflow_schema.validate(&dataflow);
        if !violations.is_empty() {
            self.notifier.notify(
                Notification::error(LifecycleEvent::DataflowInvalid, "Imported dataflow is invalid")
                    .details(violations.iter().map(ToString::to_string)),
            );
            return false;
        }
        match self.graph.load_dataflow(dataflow).await {
            Ok(()) => {
                self.notifier
                    .notify(Notification::info(LifecycleEvent::DataflowLoaded, "Dataflow imported"));
                true
            }
            Err(e) => {
                self.notifier
                    .notify(Notification::error(LifecycleEvent::DataflowInvalid, title).detail(e.to_string()));
                false
            }
        }
    }

    /// Convert the current dataflow to the peer's format.
    pub async fn export_dataflow(&self) -> Option<String> {
        let title = "Could not export dataflow";
        let dataflow = match self.graph.save_dataflow().await {
            Ok(d) => d,
            Err(e) => {
                self.notifier
                    .notify(Notification::error(LifecycleEvent::DataflowInvalid, title).detail(e.to_string()));
                return None;
            }
        };
        match self
            .call(BackendMethod::DataflowExport.as_str(), Some(json!({ "dataflow": dataflow })))
            .await
            .and_then(message_result)
        {
            Ok(r) if r.is_ok() => {
                let contents = match r.content {
                    Some(Value::String(s)) => s,
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                self.notifier
                    .notify(Notification::info(LifecycleEvent::DataflowExported, "Dataflow exported"));
                Some(contents)
            }
            Ok(r) => {
                let mut n = Notification::new(LifecycleEvent::DataflowExported, r.kind.into(), title);
                if let Some(d) = r.describe() {
                    n = n.detail(d);
                }
                self.notifier.notify(n);
                None
            }
            Err(e) => {
                self.notifier
                    .notify(Notification::error(LifecycleEvent::DataflowExported, title).detail(e.to_string()));
                None
            }
        }
    }

    // -----------------------------------------------------------------
    // Change notifications and connection setup
    // -----------------------------------------------------------------

    /// Tell the peer about a local edit. Never blocks the editor on failure.
    pub async fn notify_about_change(&self, method: &str, payload: Value) {
        if !self.change_notifications_enabled() || !self.is_connected() {
            debug!(%method, "change notification skipped");
            return;
        }
        if let Err(e) = self.call(method, Some(payload)).await {
            warn!(%method, "change notification failed: {e}");
            self.notifier.notify(
                Notification::warning(LifecycleEvent::ChangeNotificationFailed, format!("Could not send {method}"))
                    .detail(e.to_string())
                    .log_only(),
            );
        }
    }

    /// Run after every (re)connect.
    pub async fn initialize_connection(&self) {
        let (_loaded, _caps) = tokio::join!(self.request_specification(), self.request_app_capabilities());

        match self
            .call(BackendMethod::FrontendOnConnect.as_str(), Some(json!({})))
            .await
        {
            Ok(_) => {}
            Err(e) if matches!(e.code(), jsonrpc::METHOD_NOT_FOUND | jsonrpc::EXTERNAL_APPLICATION_NOT_CONNECTED) => {
                debug!("frontend_on_connect not handled by peer: {e}");
            }
            Err(e) => {
                self.notifier.notify(
                    Notification::warning(LifecycleEvent::Connected, "Connection set-up incomplete")
                        .detail(e.to_string())
                        .log_only(),
                );
            }
        }
    }

    // -----------------------------------------------------------------
    // Peer registration
    // -----------------------------------------------------------------

    fn replace_peer<F>(&self, make: F) -> String
    where
        F: FnOnce() -> ActivePeer,
    {
        let Ok(mut active) = self.active.lock() else {
            return String::new();
        };
        if let Some(old) = active.take() {
            let old_id = old.id();
            self.connections.unregister(&old_id);
            match &old {
                ActivePeer::Backend(b) => b.close(),
                ActivePeer::Frontend(f) => f.close(),
            }
            self.notifier.notify(
                Notification::warning(LifecycleEvent::PeerReplaced, "External application replaced").detail(old_id),
            );
        }
        let peer = make();
        let id = peer.id();
        self.connections.register(peer.handle());
        *active = Some(peer);
        id
    }

    /// Make the backend at `url` the active peer. It is connected by the next
    /// liveness sweep.
    pub fn register_backend_application(&self, url: &str) -> String {
        let endpoint = self.endpoint.clone();
        let threshold = self.settings.chunk_threshold;
        let id = self.replace_peer(|| ActivePeer::Backend(BackendApplication::new(url, threshold, endpoint)));
        info!(%id, "backend application registered");
        id
    }

    /// Answer a registration request from another editor window.
    pub fn register_frontend_application(&self, window: WindowHandle, request: &Request) -> Response {
        let id = request.id.clone().unwrap_or(Id::Null);
        if window.id == self.settings.own_window_id {
            self.notifier.notify(
                Notification::error(LifecycleEvent::PeerRejected, "Cannot connect the editor to itself")
                    .detail(window.id.clone()),
            );
            return Response::fail(
                id,
                jsonrpc::INVALID_REQUEST,
                "the editor's own window cannot be an external application",
                None,
            );
        }

        let endpoint = self.endpoint.clone();
        let peer_id = self.replace_peer(|| ActivePeer::Frontend(FrontendApplication::new(window, endpoint)));
        info!(id = %peer_id, "frontend application registered");
        Response::success(id, json!({}))
    }
}
