//! Flow type registry.
//!
//! Every flow type registers a name, a version, a constructor, and a restore
//! function at startup; the manager dispatches by name. There is no
//! reflective lookup at runtime — an unknown name is an error, not a
//! classpath scan.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::checkpoint::codec::CodecError;
use crate::flow::FlowLogic;

/// Builds a fresh flow instance from start arguments.
pub type ConstructFn =
    Arc<dyn Fn(&[u8]) -> Result<Box<dyn FlowLogic>, CodecError> + Send + Sync>;

/// Rebuilds a suspended flow instance from its continuation blob.
pub type RestoreFn =
    Arc<dyn Fn(&[u8]) -> Result<Box<dyn FlowLogic>, CodecError> + Send + Sync>;

/// Errors from registry lookups.
#[derive(Clone, Debug, PartialEq, Eq, Error, Diagnostic)]
pub enum RegistryError {
    #[error("no flow registered under the name {name}")]
    #[diagnostic(
        code(flowstate::registry::unknown_flow),
        help("Register the flow type with FlowRegistry::register before starting the manager.")
    )]
    UnknownFlow { name: String },

    #[error("no responder registered for initiating flow {name}")]
    #[diagnostic(code(flowstate::registry::unknown_responder))]
    UnknownResponder { name: String },
}

/// Registration record for one flow type.
#[derive(Clone)]
pub struct FlowSpec {
    pub name: String,
    pub version: u32,
    /// Idempotent flows may skip intermediate checkpoints: their side
    /// effects are safe to replay.
    pub idempotent: bool,
    /// Timed flows arm a wait-timeout that retries from the last safe
    /// point on expiry.
    pub timed: bool,
    pub construct: ConstructFn,
    pub restore: RestoreFn,
}

impl fmt::Debug for FlowSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowSpec")
            .field("name", &self.name)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl FlowSpec {
    pub fn new(
        name: impl Into<String>,
        version: u32,
        construct: impl Fn(&[u8]) -> Result<Box<dyn FlowLogic>, CodecError> + Send + Sync + 'static,
        restore: impl Fn(&[u8]) -> Result<Box<dyn FlowLogic>, CodecError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            version,
            idempotent: false,
            timed: false,
            construct: Arc::new(construct),
            restore: Arc::new(restore),
        }
    }

    /// Mark the flow type idempotent.
    #[must_use]
    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    /// Mark the flow type timed.
    #[must_use]
    pub fn timed(mut self) -> Self {
        self.timed = true;
        self
    }
}

/// Name-keyed registry of flow types and their responders.
#[derive(Clone, Default)]
pub struct FlowRegistry {
    flows: FxHashMap<String, FlowSpec>,
    /// Keyed by the *initiating* flow's class name.
    responders: FxHashMap<String, String>,
}

impl FlowRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a flow type. Re-registering a name replaces the previous
    /// spec; latest wins, matching restart-with-upgraded-flows semantics.
    pub fn register(&mut self, spec: FlowSpec) -> &mut Self {
        self.flows.insert(spec.name.clone(), spec);
        self
    }

    /// Declare `responder_name` as the flow to start when a counterparty's
    /// `initiating_name` flow opens a session with this node.
    pub fn register_responder(
        &mut self,
        initiating_name: impl Into<String>,
        responder_name: impl Into<String>,
    ) -> &mut Self {
        self.responders
            .insert(initiating_name.into(), responder_name.into());
        self
    }

    pub fn spec(&self, name: &str) -> Result<&FlowSpec, RegistryError> {
        self.flows.get(name).ok_or_else(|| RegistryError::UnknownFlow {
            name: name.to_string(),
        })
    }

    /// Restore the named flow from a checkpoint continuation blob.
    pub fn restore(
        &self,
        name: &str,
        continuation: &[u8],
    ) -> Result<Box<dyn FlowLogic>, CodecError> {
        let spec = self.flows.get(name).ok_or(CodecError::Section {
            section: "flow_state",
            message: format!("no flow registered under the name {name}"),
        })?;
        (spec.restore)(continuation)
    }

    /// Resolve the responder spec for a counterparty's initiating class.
    pub fn responder_for(&self, initiating_name: &str) -> Result<&FlowSpec, RegistryError> {
        let responder = self.responders.get(initiating_name).ok_or_else(|| {
            RegistryError::UnknownResponder {
                name: initiating_name.to_string(),
            }
        })?;
        self.spec(responder)
    }

    /// Names of all registered flow types, for diagnostics.
    #[must_use]
    pub fn registered_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.flows.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for FlowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowRegistry")
            .field("flows", &self.registered_names())
            .field("responders", &self.responders)
            .finish()
    }
}

/// Register a serde-backed flow type with one call.
///
/// The flow type must implement `Serialize + DeserializeOwned + FlowLogic`
/// and construct itself from JSON start arguments.
#[macro_export]
macro_rules! register_flow {
    ($registry:expr, $name:expr, $version:expr, $ty:ty) => {
        $registry.register($crate::registry::FlowSpec::new(
            $name,
            $version,
            |args: &[u8]| {
                let flow: $ty = $crate::__private::serde_json::from_slice(args).map_err(|e| {
                    $crate::checkpoint::codec::CodecError::Section {
                        section: "flow_state",
                        message: format!("start args: {e}"),
                    }
                })?;
                Ok(Box::new(flow) as Box<dyn $crate::flow::FlowLogic>)
            },
            |blob: &[u8]| {
                let flow: $ty = $crate::__private::serde_json::from_slice(blob).map_err(|e| {
                    $crate::checkpoint::codec::CodecError::Section {
                        section: "flow_state",
                        message: format!("continuation: {e}"),
                    }
                })?;
                Ok(Box::new(flow) as Box<dyn $crate::flow::FlowLogic>)
            },
        ))
    };
}
