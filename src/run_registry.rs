//! Per-procedure run state.
//!
//! Each procedure name (`dataflow_run`, `custom_build`, ...) has at most one
//! run in progress. Observers are called synchronously after every change and
//! never while a registry lock is held.

use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use serde::Serialize;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunInfo {
    pub name: String,
    pub in_progress: bool,
    /// Last reported percentage, `-1` for indeterminate.
    pub progress: Option<f64>,
}

impl RunInfo {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            in_progress: false,
            progress: None,
        }
    }
}

pub trait RunStateObserver: Send + Sync {
    fn on_run_state_changed(&self, name: &str, in_progress: bool);

    fn on_progress(&self, _name: &str, _progress: f64) {}
}

struct Entry {
    info: RunInfo,
    observer: Option<Arc<dyn RunStateObserver>>,
}

#[derive(Default)]
pub struct RunRegistry {
    runs: DashMap<String, Entry>,
    global_hook: RwLock<Option<Arc<dyn RunStateObserver>>>,
}

impl RunRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Existing entry or a fresh idle one.
    pub fn get(&self, name: &str) -> RunInfo {
        self.entry(name).info.clone()
    }

    fn entry(&self, name: &str) -> dashmap::mapref::one::RefMut<'_, String, Entry> {
        self.runs.entry(name.to_string()).or_insert_with(|| Entry {
            info: RunInfo::new(name),
            observer: self.global_hook.read().ok().and_then(|h| h.clone()),
        })
    }

    pub fn set_in_progress(&self, name: &str, value: bool) {
        let observer = {
            let mut e = self.entry(name);
            e.info.in_progress = value;
            if !value {
                e.info.progress = None;
            }
            e.observer.clone()
        };
        trace!(run = name, in_progress = value, "run state changed");
        if let Some(o) = observer {
            o.on_run_state_changed(name, value);
        }
    }

    /// Mark `name` as running unless it already is. Returns whether this call
    /// started it.
    pub fn try_start(&self, name: &str) -> bool {
        let observer = {
            let mut e = self.entry(name);
            if e.info.in_progress {
                return false;
            }
            e.info.in_progress = true;
            e.info.progress = None;
            e.observer.clone()
        };
        if let Some(o) = observer {
            o.on_run_state_changed(name, true);
        }
        true
    }

    pub fn set_progress(&self, name: &str, progress: f64) {
        let observer = {
            let mut e = self.entry(name);
            e.info.progress = Some(progress);
            e.observer.clone()
        };
        if let Some(o) = observer {
            o.on_progress(name, progress);
        }
    }

    pub fn is_in_progress(&self, name: &str) -> bool {
        self.runs.get(name).is_some_and(|e| e.info.in_progress)
    }

    /// Names of every run in progress, sorted.
    pub fn in_progress(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .runs
            .iter()
            .filter(|e| e.info.in_progress)
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Attach `observer` to every existing and future entry.
    pub fn set_global_hook(&self, observer: Arc<dyn RunStateObserver>) {
        if let Ok(mut hook) = self.global_hook.write() {
            *hook = Some(observer.clone());
        }
        for mut e in self.runs.iter_mut() {
            e.observer = Some(observer.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, bool)>>,
        progress: Mutex<Vec<(String, f64)>>,
        registry: Mutex<Option<Arc<RunRegistry>>>,
    }

    impl RunStateObserver for Recorder {
        fn on_run_state_changed(&self, name: &str, in_progress: bool) {
            // re-entering the registry must not deadlock
            if let Some(r) = self.registry.lock().unwrap().as_ref() {
                assert_eq!(r.get(name).in_progress, in_progress);
            }
            self.calls.lock().unwrap().push((name.to_string(), in_progress));
        }

        fn on_progress(&self, name: &str, progress: f64) {
            self.progress.lock().unwrap().push((name.to_string(), progress));
        }
    }

    #[test]
    fn entries_are_created_lazily() {
        let reg = RunRegistry::new();
        let info = reg.get("dataflow_run");
        assert_eq!(info, RunInfo { name: "dataflow_run".into(), in_progress: false, progress: None });
        assert!(reg.in_progress().is_empty());
    }

    #[test]
    fn observer_sees_state_after_change() {
        let reg = RunRegistry::new();
        let rec = Arc::new(Recorder::default());
        *rec.registry.lock().unwrap() = Some(reg.clone());

        reg.get("existing");
        reg.set_global_hook(rec.clone());

        reg.set_in_progress("existing", true);
        reg.set_in_progress("later", true);
        reg.set_in_progress("later", false);

        assert_eq!(
            rec.calls.lock().unwrap().clone(),
            vec![
                ("existing".to_string(), true),
                ("later".to_string(), true),
                ("later".to_string(), false)
            ]
        );
    }

    #[test]
    fn at_most_one_run_per_name() {
        let reg = RunRegistry::new();
        assert!(reg.try_start("dataflow_run"));
        assert!(!reg.try_start("dataflow_run"));
        assert!(reg.try_start("custom_build"));
        assert_eq!(reg.in_progress(), vec!["custom_build".to_string(), "dataflow_run".to_string()]);

        reg.set_in_progress("dataflow_run", false);
        assert!(reg.try_start("dataflow_run"));
    }

    #[test]
    fn progress_is_tracked_and_reset() {
        let reg = RunRegistry::new();
        let rec = Arc::new(Recorder::default());
        reg.set_global_hook(rec.clone());

        reg.try_start("dataflow_run");
        reg.set_progress("dataflow_run", 42.0);
        assert_eq!(reg.get("dataflow_run").progress, Some(42.0));
        reg.set_in_progress("dataflow_run", false);
        assert_eq!(reg.get("dataflow_run").progress, None);
        assert_eq!(rec.progress.lock().unwrap().clone(), vec![("dataflow_run".to_string(), 42.0)]);
    }
}
