//! The handshake state machine and the records exchanged during the handshake.
use crate::config::{is_supported_protocol_version, LATEST_PROTOCOL_VERSION};
use mcplink_jsonrpc::{ErrorCode, JsonRpcError};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::*;

/// Feature areas a peer can advertise during the handshake.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[strum(serialize_all = "camelCase")]
pub enum Capability {
    // Server side
    Tools,
    Resources,
    Prompts,
    Completions,
    Logging,

    // Client side
    Roots,
    Sampling,
    Elicitation,

    Experimental,
}

impl Capability {
    /// The server capability a client request needs, for the methods the runtime gates.
    pub fn required_by_server_method(method: &str) -> Option<Self> {
        match method.split('/').next()? {
            "tools" => Some(Capability::Tools),
            "resources" => Some(Capability::Resources),
            "prompts" => Some(Capability::Prompts),
            "completion" => Some(Capability::Completions),
            "logging" => Some(Capability::Logging),
            _ => None,
        }
    }

    /// The client capability a server-initiated request needs.
    pub fn required_by_client_method(method: &str) -> Option<Self> {
        match method.split('/').next()? {
            "roots" => Some(Capability::Roots),
            "sampling" => Some(Capability::Sampling),
            "elicitation" => Some(Capability::Elicitation),
            _ => None,
        }
    }
}

/// Capabilities advertised by one side, each with its (possibly empty) options object.
///
/// On the wire this is a JSON object keyed by capability name.  Names this runtime doesn't know
/// are dropped when parsing, so newer peers can still talk to it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CapabilitySet(BTreeMap<Capability, Value>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, capability: Capability) -> Self {
        self.with_options(capability, Value::Object(Map::new()))
    }

    pub fn with_options(mut self, capability: Capability, options: Value) -> Self {
        self.0.insert(capability, options);
        self
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains_key(&capability)
    }

    pub fn options(&self, capability: Capability) -> Option<&Value> {
        self.0.get(&capability)
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.keys().copied()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
        iter.into_iter()
            .fold(CapabilitySet::new(), |set, capability| set.with(capability))
    }
}

impl Serialize for CapabilitySet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (capability, options) in &self.0 {
            map.serialize_entry(capability.as_ref(), options)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for CapabilitySet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Map::<String, Value>::deserialize(deserializer)?;
        let mut set = BTreeMap::new();
        for (name, options) in raw {
            match Capability::from_str(&name) {
                Ok(capability) => {
                    set.insert(capability, options);
                }
                Err(_) => trace!(%name, "Ignoring unknown capability"),
            }
        }
        Ok(CapabilitySet(set))
    }
}

/// Name and version of a client or server implementation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

impl Implementation {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequest {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: CapabilitySet,
    pub client_info: Implementation,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: CapabilitySet,
    pub server_info: Implementation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum LifecycleState {
    /// Nothing has happened yet
    Init,

    /// Initialize was answered, waiting for the `initialized` acknowledgement
    Initializing,

    Operation,
    Shutdown,
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum LifecycleError {
    #[error("Initialize is not allowed in state {0}")]
    AlreadyInitialized(LifecycleState),

    #[error("Not initialized (state {0})")]
    NotInitialized(LifecycleState),

    #[error("{role} does not support capability '{capability}'")]
    CapabilityNotSupported {
        role: &'static str,
        capability: Capability,
    },

    #[error("Server negotiated unsupported protocol version '{0}'")]
    UnsupportedVersion(String),
}

impl From<LifecycleError> for JsonRpcError {
    fn from(error: LifecycleError) -> Self {
        match &error {
            LifecycleError::AlreadyInitialized(_) => JsonRpcError::invalid_request(error.to_string()),
            LifecycleError::NotInitialized(_) => crate::error::not_initialized(),
            LifecycleError::CapabilityNotSupported { .. } => {
                JsonRpcError::new(ErrorCode::MethodNotFound.code(), error.to_string(), None)
            }
            LifecycleError::UnsupportedVersion(_) => JsonRpcError::invalid_params(error.to_string()),
        }
    }
}

#[derive(Debug)]
struct LifecycleInner {
    state: LifecycleState,
    protocol_version: Option<String>,
    client_info: Option<Implementation>,
    client_capabilities: CapabilitySet,
    server_info: Option<Implementation>,
    server_capabilities: CapabilitySet,
    instructions: Option<String>,
}

/// Handshake state of one connection, from either side's point of view.
///
/// The server drives it with [`Self::initialize`] and [`Self::confirm_initialized`]; the client
/// with [`Self::begin_initialize`] and [`Self::complete_initialize`].
#[derive(Debug)]
pub struct ProtocolLifecycle {
    inner: Mutex<LifecycleInner>,
}

impl Default for ProtocolLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolLifecycle {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LifecycleInner {
                state: LifecycleState::Init,
                protocol_version: None,
                client_info: None,
                client_capabilities: CapabilitySet::new(),
                server_info: None,
                server_capabilities: CapabilitySet::new(),
                instructions: None,
            }),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.lock().state
    }

    pub fn protocol_version(&self) -> Option<String> {
        self.lock().protocol_version.clone()
    }

    pub fn client_info(&self) -> Option<Implementation> {
        self.lock().client_info.clone()
    }

    pub fn server_info(&self) -> Option<Implementation> {
        self.lock().server_info.clone()
    }

    pub fn instructions(&self) -> Option<String> {
        self.lock().instructions.clone()
    }

    /// Answer a client's initialize request.
    ///
    /// If the requested version isn't one this runtime supports, the latest supported version is
    /// offered instead and it's up to the client whether to continue.
    #[instrument(skip_all, fields(requested = %request.protocol_version))]
    pub fn initialize(
        &self,
        request: InitializeRequest,
        server_info: &Implementation,
        server_capabilities: &CapabilitySet,
        instructions: Option<&str>,
    ) -> Result<InitializeResult, LifecycleError> {
        let mut inner = self.lock();
        if inner.state != LifecycleState::Init {
            return Err(LifecycleError::AlreadyInitialized(inner.state));
        }

        let protocol_version = if is_supported_protocol_version(&request.protocol_version) {
            request.protocol_version
        } else {
            debug!(
                offered = LATEST_PROTOCOL_VERSION,
                "Client requested unsupported protocol version"
            );
            LATEST_PROTOCOL_VERSION.to_string()
        };

        inner.protocol_version = Some(protocol_version.clone());
        inner.client_info = Some(request.client_info);
        inner.client_capabilities = request.capabilities;
        inner.server_info = Some(server_info.clone());
        inner.server_capabilities = server_capabilities.clone();
        inner.instructions = instructions.map(str::to_string);
        inner.state = LifecycleState::Initializing;

        Ok(InitializeResult {
            protocol_version,
            capabilities: server_capabilities.clone(),
            server_info: server_info.clone(),
            instructions: instructions.map(str::to_string),
        })
    }

    /// The client acknowledged the handshake.  Returns whether that changed anything.
    pub fn confirm_initialized(&self) -> bool {
        let mut inner = self.lock();
        if inner.state == LifecycleState::Initializing {
            debug!("Handshake complete");
            inner.state = LifecycleState::Operation;
            true
        } else {
            warn!(state = %inner.state, "Ignoring initialized notification");
            false
        }
    }

    /// Client side: about to send initialize.
    pub fn begin_initialize(&self) -> Result<(), LifecycleError> {
        let mut inner = self.lock();
        if inner.state != LifecycleState::Init {
            return Err(LifecycleError::AlreadyInitialized(inner.state));
        }
        inner.state = LifecycleState::Initializing;
        Ok(())
    }

    /// Client side: the initialize request failed, so the handshake can be tried again.
    pub fn abort_initialize(&self) {
        let mut inner = self.lock();
        if inner.state == LifecycleState::Initializing {
            inner.state = LifecycleState::Init;
        }
    }

    /// Client side: record the server's answer.  A protocol version the client doesn't speak
    /// fails the handshake and returns the lifecycle to `Init`.
    pub fn complete_initialize(
        &self,
        client_info: &Implementation,
        client_capabilities: &CapabilitySet,
        result: &InitializeResult,
    ) -> Result<(), LifecycleError> {
        let mut inner = self.lock();
        if inner.state != LifecycleState::Initializing {
            return Err(LifecycleError::AlreadyInitialized(inner.state));
        }

        if !is_supported_protocol_version(&result.protocol_version) {
            inner.state = LifecycleState::Init;
            return Err(LifecycleError::UnsupportedVersion(
                result.protocol_version.clone(),
            ));
        }

        inner.protocol_version = Some(result.protocol_version.clone());
        inner.client_info = Some(client_info.clone());
        inner.client_capabilities = client_capabilities.clone();
        inner.server_info = Some(result.server_info.clone());
        inner.server_capabilities = result.capabilities.clone();
        inner.instructions = result.instructions.clone();
        inner.state = LifecycleState::Operation;
        Ok(())
    }

    /// Check that a request for `method` may be served in the current state.
    pub fn ensure_operational(&self, method: &str) -> Result<(), LifecycleError> {
        let state = self.state();
        match state {
            LifecycleState::Operation => Ok(()),
            LifecycleState::Init | LifecycleState::Initializing
                if method == "initialize" || method == "ping" =>
            {
                Ok(())
            }
            _ => Err(LifecycleError::NotInitialized(state)),
        }
    }

    pub fn require_server_capability(&self, capability: Capability) -> Result<(), LifecycleError> {
        if self.lock().server_capabilities.contains(capability) {
            Ok(())
        } else {
            Err(LifecycleError::CapabilityNotSupported {
                role: "Server",
                capability,
            })
        }
    }

    pub fn require_client_capability(&self, capability: Capability) -> Result<(), LifecycleError> {
        if self.lock().client_capabilities.contains(capability) {
            Ok(())
        } else {
            Err(LifecycleError::CapabilityNotSupported {
                role: "Client",
                capability,
            })
        }
    }

    /// Idempotent; nothing is served after this.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        if inner.state != LifecycleState::Shutdown {
            debug!(from = %inner.state, "Lifecycle shutting down");
            inner.state = LifecycleState::Shutdown;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LifecycleInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
