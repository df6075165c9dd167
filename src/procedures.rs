//! Procedures the editor exposes to external applications.

use std::{str::FromStr, sync::Arc};

use async_trait::async_trait;
use bridge_protocol::{
    ApiSpecification, HandlerError, RequestHandler,
    message::{
        DataflowParams, MessageResult, NotificationSendParams, ProgressChangeParams, RunFinishedParams,
        SpecificationChangeParams,
    },
    method::FrontendMethod,
    validator::SchemaValidator,
};
use serde_json::{Value, json};
use strum::IntoEnumIterator;
use tracing::{debug, warn};

use crate::{
    graph::GraphStore,
    notification::{LifecycleEvent, Notification, Notifier, Severity},
    run_registry::RunRegistry,
};

pub struct EditorProcedures {
    graph: Arc<dyn GraphStore>,
    runs: Arc<RunRegistry>,
    notifier: Arc<dyn Notifier>,
    specification_schema: SchemaValidator,
}

impl EditorProcedures {
    pub fn new(
        spec: &ApiSpecification,
        graph: Arc<dyn GraphStore>,
        runs: Arc<RunRegistry>,
        notifier: Arc<dyn Notifier>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            graph,
            runs,
            notifier,
            specification_schema: spec.compile_common("Specification")?,
        })
    }

    async fn specification_change(&self, params: SpecificationChangeParams) -> MessageResult {
        let violations = self.specification_schema.validate(&params.specification);
        if !violations.is_empty() {
            self.notifier.notify(
                Notification::error(LifecycleEvent::SpecificationInvalid, "Received specification is invalid")
                    .details(violations.iter().map(ToString::to_string)),
            );
            return MessageResult::error(json!(violations));
        }
        match self.graph.load_specification(params.specification).await {
            Ok(()) => {
                self.notifier
                    .notify(Notification::info(LifecycleEvent::SpecificationLoaded, "Specification loaded"));
                MessageResult::ok(None)
            }
            Err(e) => {
                self.notifier.notify(
                    Notification::error(LifecycleEvent::SpecificationInvalid, "Could not load specification")
                        .detail(e.to_string()),
                );
                MessageResult::error(e.to_string())
            }
        }
    }

    async fn graph_change(&self, params: DataflowParams) -> MessageResult {
        match self.graph.load_dataflow(params.dataflow).await {
            Ok(()) => {
                self.notifier
                    .notify(Notification::info(LifecycleEvent::DataflowLoaded, "Dataflow updated").log_only());
                MessageResult::ok(None)
            }
            Err(e) => {
                self.notifier.notify(
                    Notification::error(LifecycleEvent::DataflowInvalid, "Received dataflow is invalid")
                        .detail(e.to_string()),
                );
                MessageResult::error(e.to_string())
            }
        }
    }

    fn progress_change(&self, params: ProgressChangeParams) {
        // without a method name the progress belongs to the only running procedure
        let target = params.method.or_else(|| match self.runs.in_progress().as_slice() {
            [only] => Some(only.clone()),
            _ => None,
        });
        match target {
            Some(name) => self.runs.set_progress(&name, params.progress),
            None => debug!(progress = params.progress, "progress without a running procedure"),
        }
    }

    fn run_finished(&self, params: RunFinishedParams) {
        self.runs.set_in_progress(&params.method, false);
        let (severity, details) = match &params.result {
            Some(r) => (Severity::from(r.kind), r.describe()),
            None => (Severity::Info, None),
        };
        let mut n = Notification::new(
            LifecycleEvent::RunFinished,
            severity,
            format!("{} finished", params.method),
        );
        if let Some(d) = details {
            n = n.detail(d);
        }
        self.notifier.notify(n);
    }

    fn notification_send(&self, params: NotificationSendParams) {
        let mut n = Notification::new(LifecycleEvent::PeerMessage, params.kind.into(), params.title);
        if let Some(d) = params.details {
            n = n.detail(d);
        }
        self.notifier.notify(n);
    }
}

#[async_trait]
impl RequestHandler for EditorProcedures {
    fn methods(&self) -> Vec<&'static str> {
        FrontendMethod::iter().map(|m| m.as_str()).collect()
    }

    async fn handle(&self, method: &str, params: Value) -> Result<Option<Value>, HandlerError> {
        let Ok(method) = FrontendMethod::from_str(method) else {
            warn!(%method, "no procedure registered");
            return Err(HandlerError::NotHandled(method.to_string()));
        };

        let result = match method {
            FrontendMethod::StatusGet => Some(json!({"status": {"connected": true}})),
            FrontendMethod::SpecificationChange => {
                let r = self.specification_change(serde_json::from_value(params)?).await;
                Some(serde_json::to_value(r)?)
            }
            FrontendMethod::DataflowGet => {
                let dataflow = self
                    .graph
                    .save_dataflow()
                    .await
                    .map_err(|e| HandlerError::Failed(e.to_string()))?;
                Some(json!({ "dataflow": dataflow }))
            }
            FrontendMethod::GraphChange => {
                let r = self.graph_change(serde_json::from_value(params)?).await;
                Some(serde_json::to_value(r)?)
            }
            FrontendMethod::ProgressChange => {
                self.progress_change(serde_json::from_value(params)?);
                None
            }
            FrontendMethod::RunFinished => {
                self.run_finished(serde_json::from_value(params)?);
                None
            }
            FrontendMethod::NotificationSend => {
                self.notification_send(serde_json::from_value(params)?);
                None
            }
        };
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{graph::InMemoryGraph, notification::MemoryNotifier};

    struct Fixture {
        procs: EditorProcedures,
        graph: Arc<InMemoryGraph>,
        runs: Arc<RunRegistry>,
        notes: Arc<MemoryNotifier>,
    }

    fn fixture() -> Fixture {
        let spec = ApiSpecification::bundled().unwrap();
        let graph = InMemoryGraph::new();
        let runs = RunRegistry::new();
        let notes = Arc::new(MemoryNotifier::new());
        let procs = EditorProcedures::new(&spec, graph.clone(), runs.clone(), notes.clone()).unwrap();
        Fixture { procs, graph, runs, notes }
    }

    #[test]
    fn every_frontend_endpoint_has_a_procedure() {
        let f = fixture();
        let spec = ApiSpecification::bundled().unwrap();
        let mut served = f.procs.methods();
        served.sort();
        let mut declared: Vec<&str> = spec
            .group(bridge_protocol::EndpointGroup::Frontend)
            .keys()
            .map(String::as_str)
            .collect();
        declared.sort();
        assert_eq!(served, declared);
    }

    #[tokio::test]
    async fn specification_change_loads_valid_documents() {
        let f = fixture();
        let ok = f
            .procs
            .handle("specification_change", json!({"specification": {"nodes": [{"name": "Filter"}]}}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ok, json!({"type": "OK"}));
        assert!(f.graph.specification().await.is_some());

        let bad = f
            .procs
            .handle("specification_change", json!({"specification": {"nodes": [{"category": "x"}]}}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bad["type"], "ERROR");
        assert_eq!(f.notes.count(LifecycleEvent::SpecificationInvalid), 1);
    }

    #[tokio::test]
    async fn dataflow_get_returns_saved_graph() {
        let f = fixture();
        let out = f.procs.handle("dataflow_get", json!({})).await.unwrap().unwrap();
        assert_eq!(out["dataflow"]["graph"]["nodes"], json!([]));
    }

    #[tokio::test]
    async fn progress_and_run_finished_drive_the_registry() {
        let f = fixture();
        f.runs.try_start("dataflow_run");
        f.procs.handle("progress_change", json!({"progress": 30})).await.unwrap();
        assert_eq!(f.runs.get("dataflow_run").progress, Some(30.0));

        f.procs
            .handle("run_finished", json!({"method": "dataflow_run", "result": {"type": "WARNING", "content": "slow"}}))
            .await
            .unwrap();
        assert!(!f.runs.is_in_progress("dataflow_run"));
        let n = f.notes.all().pop().unwrap();
        assert_eq!(n.event, LifecycleEvent::RunFinished);
        assert_eq!(n.severity, Severity::Warning);
        assert_eq!(n.details, vec!["slow".to_string()]);
    }

    #[tokio::test]
    async fn peer_messages_become_notifications() {
        let f = fixture();
        f.procs
            .handle("notification_send", json!({"type": "ERROR", "title": "Build failed", "details": "see log"}))
            .await
            .unwrap();
        let n = f.notes.all().pop().unwrap();
        assert_eq!((n.event, n.severity), (LifecycleEvent::PeerMessage, Severity::Error));
    }

    #[tokio::test]
    async fn unknown_and_malformed_calls() {
        let f = fixture();
        assert!(matches!(
            f.procs.handle("dataflow_run", json!({})).await,
            Err(HandlerError::NotHandled(_))
        ));
        assert!(matches!(
            f.procs.handle("run_finished", json!({})).await,
            Err(HandlerError::InvalidParams(_))
        ));
    }
}
