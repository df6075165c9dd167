use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString, IntoStaticStr};

/// Prefix reserved for user-defined procedures. All of them travel as
/// [`CUSTOM_PROCEDURE`] and carry their own name in `procedure_name`.
pub const CUSTOM_PREFIX: &str = "custom_";
pub const CUSTOM_PROCEDURE: &str = "custom_procedure";

/// Resolve a method name to the name used on the wire.
///
/// Resolving an already canonical name returns it unchanged, so the remap is
/// never cumulative.
pub fn resolve_method(method: &str) -> &str {
    if is_custom(method) {
        CUSTOM_PROCEDURE
    } else {
        method
    }
}

pub fn is_custom(method: &str) -> bool {
    method.starts_with(CUSTOM_PREFIX)
}

/// Procedures a backend process exposes to the editor.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, IntoStaticStr, Display,
    EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BackendMethod {
    StatusGet,
    SpecificationGet,
    AppCapabilitiesGet,
    DataflowValidate,
    DataflowRun,
    DataflowStop,
    DataflowImport,
    DataflowExport,
    CustomProcedure,
    FrontendOnConnect,
    NodesOnChange,
    ConnectionsOnChange,
    PropertiesOnChange,
    GraphOnChange,
}

/// Procedures the editor itself exposes. Handlers match on this enum, so a
/// procedure added here without a handler is a compile error.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, IntoStaticStr, Display,
    EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FrontendMethod {
    StatusGet,
    SpecificationChange,
    DataflowGet,
    GraphChange,
    ProgressChange,
    RunFinished,
    NotificationSend,
}

impl BackendMethod {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

impl FrontendMethod {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

impl From<BackendMethod> for String {
    fn from(m: BackendMethod) -> Self {
        m.as_str().to_owned()
    }
}
