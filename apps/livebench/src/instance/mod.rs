//! Single-instance coordination.
//!
//! The first process per (organization, application, user) to take the
//! session lock becomes the master and owns the interactive session. Later
//! invocations see the lock held, become followers, and forward their
//! arguments to the master over the argument channel.

pub mod lock;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing::{debug, info, warn};

use crate::config::Config;
pub use lock::{LockAttempt, LockError, SessionLock};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub organization: String,
    pub application: String,
    pub user: String,
}

impl Identity {
    pub fn new(
        organization: impl Into<String>,
        application: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            organization: organization.into(),
            application: application.into(),
            user: user.into(),
        }
    }

    /// Identity of the current user for the configured application.
    pub fn resolve(config: &Config) -> Self {
        Self::new(&config.organization, &config.application, current_user())
    }
}

fn current_user() -> String {
    let user = ["USER", "USERNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|value| !value.is_empty()))
        .unwrap_or_default();
    if user.is_empty() {
        warn!(
            target = "livebench::instance",
            "could not determine the user name; instances of all users share one session"
        );
    }
    user
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    SessionLock,
    ArgumentChannel,
}

impl Purpose {
    fn suffix(self) -> &'static str {
        match self {
            Purpose::SessionLock => "lock",
            Purpose::ArgumentChannel => "app",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RendezvousKey(String);

impl RendezvousKey {
    pub fn derive(identity: &Identity, purpose: Purpose) -> Self {
        Self(format!(
            "{}.{}-{}-{}",
            identity.organization,
            identity.application,
            identity.user,
            purpose.suffix()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The key as a single path component with extension `ext`.
    pub fn file_name(&self, ext: &str) -> String {
        let stem: String = self
            .0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{stem}.{ext}")
    }
}

impl fmt::Display for RendezvousKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Follower,
}

#[derive(Debug)]
enum Election {
    /// Coordination bypassed.
    Forced,
    Locked(SessionLock),
    Follower { holder: Option<u32> },
    /// The lock could not be taken for a reason other than contention.
    Fallback,
}

impl Election {
    fn role(&self) -> Role {
        match self {
            Election::Follower { .. } => Role::Follower,
            Election::Forced | Election::Locked(_) | Election::Fallback => Role::Master,
        }
    }
}

/// Decides once per process whether this invocation owns the session.
///
/// A master keeps the session lock for as long as the coordinator lives.
#[derive(Debug)]
pub struct InstanceCoordinator {
    identity: Identity,
    runtime_dir: PathBuf,
    force_master: bool,
    election: OnceLock<Election>,
}

impl InstanceCoordinator {
    pub fn new(identity: Identity, runtime_dir: impl Into<PathBuf>, force_master: bool) -> Self {
        Self {
            identity,
            runtime_dir: runtime_dir.into(),
            force_master,
            election: OnceLock::new(),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    pub fn key(&self, purpose: Purpose) -> RendezvousKey {
        RendezvousKey::derive(&self.identity, purpose)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.runtime_dir
            .join(self.key(Purpose::SessionLock).file_name("lock"))
    }

    /// Local socket the master listens on for forwarded arguments.
    pub fn channel_path(&self) -> PathBuf {
        self.runtime_dir
            .join(self.key(Purpose::ArgumentChannel).file_name("sock"))
    }

    /// The first call elects; later calls return the cached decision.
    pub fn decide_role(&self) -> Role {
        self.election.get_or_init(|| self.elect()).role()
    }

    pub fn holds_lock(&self) -> bool {
        matches!(self.election.get(), Some(Election::Locked(_)))
    }

    /// Pid recorded by the master when this process is a follower.
    pub fn master_pid(&self) -> Option<u32> {
        match self.election.get() {
            Some(Election::Follower { holder }) => *holder,
            _ => None,
        }
    }

    fn elect(&self) -> Election {
        if self.force_master {
            info!(target = "livebench::instance", "instance coordination disabled; running as master");
            return Election::Forced;
        }

        let path = self.lock_path();
        match SessionLock::try_acquire(&path) {
            Ok(LockAttempt::Acquired(lock)) => {
                debug!(target = "livebench::instance", path = %path.display(), "session lock acquired");
                Election::Locked(lock)
            }
            Ok(LockAttempt::Held { holder }) => {
                info!(target = "livebench::instance", ?holder, "session owned by another instance");
                Election::Follower { holder }
            }
            Err(err) => {
                warn!(
                    target = "livebench::instance",
                    error = %err,
                    "session lock unavailable; continuing as master, another instance may be running"
                );
                Election::Fallback
            }
        }
    }
}
