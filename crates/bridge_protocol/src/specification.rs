//! Loads the API specification document and compiles every endpoint schema.
//!
//! The document is the single source of truth for which methods exist in each
//! direction. Any schema that does not compile makes loading fail, and callers
//! are expected to refuse to start.

use std::{collections::HashMap, fs, path::Path, sync::Arc};

use serde::Deserialize;
use serde_json::Value;
use strum_macros::{AsRefStr, Display};
use thiserror::Error;
use tracing::debug;

use crate::validator::{CommonTypes, ErrorDetail, SchemaValidator};

/// The document shipped with the crate.
pub const DEFAULT_API_SPECIFICATION: &str = include_str!("../resources/api_specification.json");

#[derive(Error, Debug)]
pub enum SpecError {
    #[error("could not read specification document: {0}")]
    Io(#[from] std::io::Error),

    #[error("specification document is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("specification document is malformed: {0}")]
    Malformed(String),

    #[error("schema `{name}` does not compile: {reason}")]
    Schema { name: String, reason: String },
}

/// Which side of the conversation exposes an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum EndpointGroup {
    /// Exposed by the editor.
    Frontend,
    /// Exposed by a backend process.
    Backend,
    /// Exposed by any other peer.
    External,
}

/// One method with its compiled schemas. `returns == None` marks a
/// notification.
#[derive(Debug)]
pub struct EndpointDescriptor {
    pub method: String,
    pub group: EndpointGroup,
    pub params: SchemaValidator,
    pub returns: Option<SchemaValidator>,
}

impl EndpointDescriptor {
    pub fn expects_response(&self) -> bool {
        self.returns.is_some()
    }

    /// Missing params are validated as an empty object.
    pub fn validate_params(&self, params: Option<&Value>) -> Vec<ErrorDetail> {
        match params {
            Some(p) => self.params.validate(p),
            None => self.params.validate(&Value::Object(Default::default())),
        }
    }

    pub fn validate_result(&self, result: &Value) -> Vec<ErrorDetail> {
        match &self.returns {
            Some(schema) => schema.validate(result),
            None => Vec::new(),
        }
    }
}

#[derive(Deserialize)]
struct RawEndpoint {
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    returns: Option<Value>,
}

#[derive(Deserialize)]
struct RawSpecification {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    common_types: Value,
    #[serde(default)]
    frontend_endpoints: HashMap<String, RawEndpoint>,
    #[serde(default)]
    backend_endpoints: HashMap<String, RawEndpoint>,
    #[serde(default)]
    external_endpoints: HashMap<String, RawEndpoint>,
}

/// Read-only endpoint tables, built once at start-up.
#[derive(Debug, Default)]
pub struct ApiSpecification {
    version: Option<String>,
    common: CommonTypes,
    frontend: HashMap<String, Arc<EndpointDescriptor>>,
    backend: HashMap<String, Arc<EndpointDescriptor>>,
    external: HashMap<String, Arc<EndpointDescriptor>>,
}

impl ApiSpecification {
    pub fn bundled() -> Result<Self, SpecError> {
        Self::from_str(DEFAULT_API_SPECIFICATION)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SpecError> {
        let text = fs::read_to_string(path)?;
        Self::from_str(&text)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(text: &str) -> Result<Self, SpecError> {
        let doc: Value = serde_json::from_str(text)?;
        Self::from_value(doc)
    }

    pub fn from_value(doc: Value) -> Result<Self, SpecError> {
        let raw: RawSpecification = serde_json::from_value(doc)?;
        let common = CommonTypes::from_document(&raw.common_types)?;

        let frontend = compile_group(EndpointGroup::Frontend, raw.frontend_endpoints, &common)?;
        let backend = compile_group(EndpointGroup::Backend, raw.backend_endpoints, &common)?;
        let external = compile_group(EndpointGroup::External, raw.external_endpoints, &common)?;

        debug!(
            frontend = frontend.len(),
            backend = backend.len(),
            external = external.len(),
            "API specification compiled"
        );

        Ok(Self {
            version: raw.version,
            common,
            frontend,
            backend,
            external,
        })
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn common_types(&self) -> &CommonTypes {
        &self.common
    }

    pub fn group(&self, group: EndpointGroup) -> &HashMap<String, Arc<EndpointDescriptor>> {
        match group {
            EndpointGroup::Frontend => &self.frontend,
            EndpointGroup::Backend => &self.backend,
            EndpointGroup::External => &self.external,
        }
    }

    /// A method the editor exposes.
    pub fn frontend(&self, method: &str) -> Option<Arc<EndpointDescriptor>> {
        self.frontend.get(method).cloned()
    }

    /// A method the editor may call on a peer: backend endpoints first, then
    /// external ones.
    pub fn remote(&self, method: &str) -> Option<Arc<EndpointDescriptor>> {
        self.backend
            .get(method)
            .or_else(|| self.external.get(method))
            .cloned()
    }

    /// Compile an ad-hoc schema against the shared definitions, e.g. to check
    /// a specification returned by the backend.
    pub fn compile_common(&self, type_name: &str) -> Result<SchemaValidator, SpecError> {
        let schema = serde_json::json!({ "$ref": format!("common_types#/definitions/{type_name}") });
        SchemaValidator::compile(type_name, &schema, &self.common)
    }
}

fn compile_group(
    group: EndpointGroup,
    raw: HashMap<String, RawEndpoint>,
    common: &CommonTypes,
) -> Result<HashMap<String, Arc<EndpointDescriptor>>, SpecError> {
    let mut out = HashMap::with_capacity(raw.len());
    for (method, endpoint) in raw {
        // an endpoint without params accepts anything
        let params_schema = endpoint.params.unwrap_or_else(|| Value::Object(Default::default()));
        let params = SchemaValidator::compile(format!("{method}.params"), &params_schema, common)?;
        let returns = match endpoint.returns {
            None | Some(Value::Null) => None,
            Some(schema) => Some(SchemaValidator::compile(
                format!("{method}.returns"),
                &schema,
                common,
            )?),
        };
        out.insert(
            method.clone(),
            Arc::new(EndpointDescriptor {
                method,
                group,
                params,
                returns,
            }),
        );
    }
    Ok(out)
}
