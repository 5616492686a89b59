//! The live session owned by the master process.
//!
//! Headless: it keeps the state a window would show and drives one
//! [`IpcClient`] per configured viewer host once initialised.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::forward::ForwardedArguments;
use crate::ipc::{ClientConfig, ClientEvent, ConnectionState, CorrelationId, IpcClient};
use crate::options::{HostSpec, Options};

/// Method a viewer host loads a document on.
pub const ACTIVATE_DOCUMENT: &str = "activateDocument";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub address: String,
    pub port: u16,
}

struct HostEntry {
    host: Host,
    client: Option<IpcClient>,
}

pub struct BenchSession {
    config: Config,
    initialized: bool,
    workspace: Option<PathBuf>,
    active_document: Option<PathBuf>,
    plugin_path: Option<PathBuf>,
    import_paths: Vec<PathBuf>,
    stay_on_top: bool,
    max_watches: Option<u32>,
    activations: u64,
    hosts: BTreeMap<String, HostEntry>,
}

impl BenchSession {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            initialized: false,
            workspace: None,
            active_document: None,
            plugin_path: None,
            import_paths: Vec::new(),
            stay_on_top: false,
            max_watches: None,
            activations: 0,
            hosts: BTreeMap::new(),
        }
    }

    pub fn apply(&mut self, options: &Options) {
        if let Some(limit) = options.max_watches {
            self.max_watches = Some(limit);
        }

        if let Some(workspace) = &options.workspace {
            info!(target = "livebench::session", workspace = %workspace.display(), "workspace set");
            self.workspace = Some(workspace.clone());
        }

        if let Some(path) = &options.plugin_path {
            if self.initialized {
                debug!(target = "livebench::session", "ignoring plugin path after initialization");
            } else {
                self.plugin_path = Some(path.clone());
            }
        }

        if !options.import_paths.is_empty() {
            if self.initialized {
                debug!(target = "livebench::session", "ignoring import paths after initialization");
            } else {
                self.import_paths = options.import_paths.clone();
            }
        }

        if let Some(document) = &options.active_document {
            self.activate_document(document);
        }

        if options.stay_on_top {
            self.stay_on_top = true;
        }

        for spec in &options.hosts_to_add {
            self.add_host(spec);
        }

        for name in &options.hosts_to_remove {
            if self.remove_host(name).is_none() {
                warn!(target = "livebench::session", host = %name, "no such host");
            }
        }

        for name in &options.hosts_to_probe {
            self.probe(name);
        }
    }

    /// Opens connections to every known host. Needs a tokio runtime.
    pub fn initialize(&mut self) {
        if self.initialized {
            return;
        }
        self.initialized = true;
        let names: Vec<String> = self.hosts.keys().cloned().collect();
        for name in names {
            self.connect_host(&name);
        }
        info!(target = "livebench::session", hosts = self.hosts.len(), "session initialized");
    }

    /// Applies arguments forwarded by a follower, then releases it.
    pub fn handle_forwarded(&mut self, forwarded: ForwardedArguments) {
        let options = match Options::from_args(&forwarded.arguments) {
            Ok(options) => options,
            Err(err) => {
                warn!(target = "livebench::session", error = %err, "rejecting forwarded arguments");
                forwarded.complete();
                return;
            }
        };
        self.apply(&options);
        forwarded.complete();
        if !options.has_noninteractive_options() && !options.remote_only {
            self.raise();
        }
    }

    /// Makes `path` the active document and tells every connected host.
    pub fn activate_document(&mut self, path: &Path) -> Vec<(String, CorrelationId)> {
        info!(target = "livebench::session", document = %path.display(), "activating document");
        self.active_document = Some(path.to_path_buf());
        let payload = path.to_string_lossy().into_owned().into_bytes();
        self.hosts
            .iter()
            .filter_map(|(name, entry)| {
                let client = entry.client.as_ref()?;
                Some((name.clone(), client.send(ACTIVATE_DOCUMENT, payload.clone())))
            })
            .collect()
    }

    /// A host reported itself online: reconnect if it is known.
    pub fn probe(&mut self, name: &str) {
        if !self.hosts.contains_key(name) {
            warn!(target = "livebench::session", host = %name, "cannot probe unknown host");
            return;
        }
        if !self.initialized {
            debug!(target = "livebench::session", host = %name, "probe before initialization ignored");
            return;
        }
        self.connect_host(name);
    }

    pub fn shutdown(&mut self) {
        for (name, entry) in &mut self.hosts {
            if let Some(client) = entry.client.take() {
                debug!(target = "livebench::session", host = %name, "disconnecting host");
                client.disconnect_from_server();
            }
        }
    }

    fn raise(&mut self) {
        self.activations += 1;
        info!(target = "livebench::session", "session activated by another invocation");
    }

    fn add_host(&mut self, spec: &HostSpec) {
        let host = Host {
            address: spec.address.clone(),
            port: spec.port.unwrap_or(self.config.default_host_port),
        };
        match self.hosts.get_mut(&spec.name) {
            Some(entry) if entry.host == host => return,
            Some(entry) => entry.host = host,
            None => {
                self.hosts.insert(
                    spec.name.clone(),
                    HostEntry { host, client: None },
                );
            }
        }
        info!(target = "livebench::session", host = %spec.name, "host updated");
        if self.initialized {
            self.connect_host(&spec.name);
        }
    }

    fn remove_host(&mut self, name: &str) -> Option<Host> {
        let entry = self.hosts.remove(name)?;
        if let Some(client) = entry.client {
            client.disconnect_from_server();
        }
        info!(target = "livebench::session", host = %name, "host removed");
        Some(entry.host)
    }

    fn connect_host(&mut self, name: &str) {
        let client_config = ClientConfig::from(&self.config);
        let Some(entry) = self.hosts.get_mut(name) else {
            return;
        };
        let client = entry.client.get_or_insert_with(|| {
            let client = IpcClient::spawn(client_config);
            let host = name.to_owned();
            client.observe(move |event| log_host_event(&host, event));
            client
        });
        client.connect_to_server(entry.host.address.clone(), entry.host.port);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn workspace(&self) -> Option<&Path> {
        self.workspace.as_deref()
    }

    pub fn active_document(&self) -> Option<&Path> {
        self.active_document.as_deref()
    }

    pub fn plugin_path(&self) -> Option<&Path> {
        self.plugin_path.as_deref()
    }

    pub fn import_paths(&self) -> &[PathBuf] {
        &self.import_paths
    }

    pub fn stays_on_top(&self) -> bool {
        self.stay_on_top
    }

    pub fn max_watches(&self) -> Option<u32> {
        self.max_watches
    }

    /// How many times another invocation asked this session to come forward.
    pub fn activations(&self) -> u64 {
        self.activations
    }

    pub fn host(&self, name: &str) -> Option<&Host> {
        self.hosts.get(name).map(|entry| &entry.host)
    }

    pub fn host_names(&self) -> impl Iterator<Item = &str> {
        self.hosts.keys().map(String::as_str)
    }

    pub fn host_state(&self, name: &str) -> Option<ConnectionState> {
        self.hosts
            .get(name)
            .and_then(|entry| entry.client.as_ref())
            .map(IpcClient::state)
    }

    pub fn host_client(&self, name: &str) -> Option<&IpcClient> {
        self.hosts.get(name).and_then(|entry| entry.client.as_ref())
    }
}

fn log_host_event(host: &str, event: &ClientEvent) {
    match event {
        ClientEvent::Connected => info!(target = "livebench::session", %host, "host connected"),
        ClientEvent::Disconnected => info!(target = "livebench::session", %host, "host disconnected"),
        ClientEvent::ConnectionError(kind) => {
            warn!(target = "livebench::session", %host, error = %kind, "host connection error")
        }
        ClientEvent::SentSuccessfully(id) => {
            debug!(target = "livebench::session", %host, %id, "command delivered")
        }
        ClientEvent::SendingError(id, reason) => {
            warn!(target = "livebench::session", %host, %id, error = %reason, "command failed")
        }
        ClientEvent::Received(frame) => {
            debug!(target = "livebench::session", %host, method = %frame.method, "host sent a frame")
        }
    }
}
