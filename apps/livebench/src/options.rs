use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use clap::{Args, Parser};
use thiserror::Error;

use crate::telemetry::logging::{LogConfig, LogLevel};

const DOCUMENT_EXTENSION: &str = "qml";

#[derive(Parser, Debug)]
#[command(
    name = "livebench",
    about = "Live reloading workbench",
    author,
    version
)]
pub struct Cli {
    #[arg(
        value_name = "workspace",
        help = "Workspace folder to watch. A .qml file selects its folder as workspace and itself as active document"
    )]
    pub workspace: Option<PathBuf>,

    #[arg(value_name = "document", help = "Main QML document to load initially")]
    pub document: Option<PathBuf>,

    #[arg(long = "pluginpath", value_name = "pluginpath", help = "Path to plugins")]
    pub plugin_path: Option<PathBuf>,

    #[arg(
        long = "importpath",
        value_name = "importpath",
        help = "QML import path. Can appear multiple times"
    )]
    pub import_paths: Vec<PathBuf>,

    #[arg(long = "stayontop", help = "Keep the viewer window on top")]
    pub stay_on_top: bool,

    #[arg(
        long = "addhost",
        value_name = "name,address[,port]",
        help = "Add or update a remote host and exit"
    )]
    pub add_hosts: Vec<String>,

    #[arg(long = "rmhost", value_name = "name", help = "Remove a remote host and exit")]
    pub remove_hosts: Vec<String>,

    #[arg(
        long = "probehost",
        value_name = "name",
        help = "Suggest a host came online and should be connected (implies --remoteonly)"
    )]
    pub probe_hosts: Vec<String>,

    #[arg(
        long = "noremote",
        help = "Do not talk to a running instance and do not listen for forwarded arguments"
    )]
    pub no_remote: bool,

    #[arg(
        long = "remoteonly",
        help = "Talk to a running instance; do nothing if none is running"
    )]
    pub remote_only: bool,

    #[arg(long, help = "Only check whether an instance is running and accepting arguments")]
    pub ping: bool,

    #[arg(
        long = "maxdirwatch",
        value_name = "number",
        help = "Limit the number of directories watched for changes"
    )]
    pub max_watches: Option<u32>,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "LIVEBENCH_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "LIVEBENCH_LOG_FILE",
        help = "Write logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum OptionsError {
    #[error(transparent)]
    Parse(#[from] clap::Error),
    #[error("invalid host {0:?}: expected name,address[,port]")]
    InvalidHost(String),
    #[error("port must be specified with a number: {0:?}")]
    InvalidPort(String),
    #[error("options {first} and {second} cannot be used together")]
    Conflict {
        first: &'static str,
        second: &'static str,
    },
    #[error("workspace does not exist or is not a directory: {0:?}")]
    WorkspaceNotFound(PathBuf),
    #[error("document does not exist or is not a file: {0:?}")]
    DocumentNotFound(PathBuf),
    #[error("second argument must be a QML document: {0:?}")]
    NotADocument(PathBuf),
    #[error("document {document:?} is not inside workspace {workspace:?}")]
    OutsideWorkspace {
        document: PathBuf,
        workspace: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    pub name: String,
    pub address: String,
    /// `None` selects the configured default port.
    pub port: Option<u16>,
}

impl FromStr for HostSpec {
    type Err = OptionsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = value.split(',').collect();
        let (name, address, port) = match parts.as_slice() {
            [name, address] => (name, address, None),
            [name, address, port] => (name, address, Some(port)),
            _ => return Err(OptionsError::InvalidHost(value.to_owned())),
        };
        if name.is_empty() || address.is_empty() {
            return Err(OptionsError::InvalidHost(value.to_owned()));
        }
        let port = port
            .map(|port| {
                port.trim()
                    .parse::<u16>()
                    .map_err(|_| OptionsError::InvalidPort(value.to_owned()))
            })
            .transpose()?;
        Ok(Self {
            name: (*name).to_owned(),
            address: (*address).to_owned(),
            port,
        })
    }
}

/// Parsed invocation, either our own or one forwarded by a follower.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub workspace: Option<PathBuf>,
    pub active_document: Option<PathBuf>,
    pub plugin_path: Option<PathBuf>,
    pub import_paths: Vec<PathBuf>,
    pub stay_on_top: bool,
    pub hosts_to_add: Vec<HostSpec>,
    pub hosts_to_remove: Vec<String>,
    pub hosts_to_probe: Vec<String>,
    pub no_remote: bool,
    pub remote_only: bool,
    pub ping: bool,
    pub max_watches: Option<u32>,
    pub log: LogConfig,
}

impl Options {
    /// Parses a full argument vector; the first element is the program name.
    pub fn from_args<I, T>(args: I) -> Result<Self, OptionsError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let cli = Cli::try_parse_from(args)?;
        Self::from_cli(cli)
    }

    pub fn from_cli(cli: Cli) -> Result<Self, OptionsError> {
        let remote_only_implied = !cli.remote_only && !cli.probe_hosts.is_empty();
        let remote_only = cli.remote_only || !cli.probe_hosts.is_empty();
        if cli.no_remote && remote_only {
            return Err(OptionsError::Conflict {
                first: "--noremote",
                second: if remote_only_implied {
                    "--remoteonly (implied by --probehost)"
                } else {
                    "--remoteonly"
                },
            });
        }
        if cli.no_remote && cli.ping {
            return Err(OptionsError::Conflict {
                first: "--noremote",
                second: "--ping",
            });
        }

        let hosts_to_add = cli
            .add_hosts
            .iter()
            .map(|spec| spec.parse())
            .collect::<Result<Vec<HostSpec>, _>>()?;

        let mut options = Options {
            plugin_path: cli.plugin_path,
            import_paths: cli.import_paths,
            stay_on_top: cli.stay_on_top,
            hosts_to_add,
            hosts_to_remove: cli.remove_hosts,
            hosts_to_probe: cli.probe_hosts,
            no_remote: cli.no_remote,
            remote_only,
            ping: cli.ping,
            max_watches: cli.max_watches,
            log: cli.logging.to_config(),
            ..Options::default()
        };

        if let Some(first) = cli.workspace {
            let absolute = absolute(&first);
            if is_document(&first) {
                if !absolute.is_file() {
                    return Err(OptionsError::DocumentNotFound(absolute));
                }
                options.workspace = absolute.parent().map(Path::to_path_buf);
                options.active_document = Some(absolute);
            } else {
                if !absolute.is_dir() {
                    return Err(OptionsError::WorkspaceNotFound(absolute));
                }
                options.workspace = Some(absolute);
            }
        }

        if let Some(second) = cli.document {
            if !is_document(&second) {
                return Err(OptionsError::NotADocument(second));
            }
            let workspace = options.workspace.clone().unwrap_or_default();
            let document = if second.is_absolute() {
                second
            } else {
                workspace.join(second)
            };
            if !document.starts_with(&workspace) {
                return Err(OptionsError::OutsideWorkspace {
                    document,
                    workspace,
                });
            }
            if !document.is_file() {
                return Err(OptionsError::DocumentNotFound(document));
            }
            options.active_document = Some(document);
        }

        Ok(options)
    }

    /// Host table edits run and exit without opening a session.
    pub fn has_noninteractive_options(&self) -> bool {
        !self.hosts_to_add.is_empty() || !self.hosts_to_remove.is_empty()
    }
}

fn is_document(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == DOCUMENT_EXTENSION)
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
