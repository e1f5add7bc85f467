use crate::error::{Error, Result};
use crate::resize::Platform;
use crate::system::{Invocation, ToolRunner};
use tracing::{debug, info};

/// Account to create
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserSpec {
    pub name: String,
    /// Comment (full name) field
    pub gecos: Option<String>,
    pub homedir: Option<String>,
    pub no_create_home: bool,
    pub primary_group: Option<String>,
    pub groups: Vec<String>,
    pub shell: Option<String>,
}

impl UserSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Which account tools the system provides
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountBackend {
    /// FreeBSD `pw`
    Pw,
    /// shadow-utils: `useradd`, `usermod`, `chpasswd`
    Shadow,
}

impl AccountBackend {
    pub fn for_platform(platform: Platform) -> Result<Self> {
        match platform {
            Platform::FreeBsd => Ok(AccountBackend::Pw),
            Platform::Linux => Ok(AccountBackend::Shadow),
            Platform::Other(os) => Err(Error::Account {
                user: String::new(),
                reason: format!("no account tools known for '{}'", os),
            }),
        }
    }

    pub fn useradd(self, user: &UserSpec) -> Invocation {
        let mut inv = match self {
            AccountBackend::Pw => Invocation::new("pw").args([
                "useradd",
                "-b",
                if user.name == "root" { "/" } else { "/home" },
                "-w",
                "no",
            ]),
            AccountBackend::Shadow => Invocation::new("useradd"),
        };

        if let Some(gecos) = &user.gecos {
            inv = inv.arg("-c").arg(gecos);
        }
        if let Some(homedir) = &user.homedir {
            inv = inv.arg("-d").arg(homedir);
        }
        if !user.no_create_home {
            inv = inv.arg("-m");
        } else if self == AccountBackend::Shadow {
            inv = inv.arg("-M");
        }
        if let Some(group) = &user.primary_group {
            inv = inv.arg("-g").arg(group);
        }
        if !user.groups.is_empty() {
            inv = inv.arg("-G").arg(user.groups.join(","));
        }
        if let Some(shell) = &user.shell {
            inv = inv.arg("-s").arg(shell);
        }

        match self {
            AccountBackend::Pw => inv.arg("-n").arg(&user.name),
            AccountBackend::Shadow => inv.arg(&user.name),
        }
    }

    /// Query for the field that shows whether the password is locked
    fn lock_query(self, name: &str) -> Invocation {
        let database = match self {
            AccountBackend::Pw => "passwd",
            AccountBackend::Shadow => "shadow",
        };
        Invocation::new("getent").args([database, name])
    }

    fn is_locked(self, password_field: &str) -> bool {
        match self {
            AccountBackend::Pw => password_field.starts_with("*LOCKED*"),
            AccountBackend::Shadow => password_field.starts_with('!'),
        }
    }

    fn lock_invocation(self, name: &str, lock: bool) -> Invocation {
        match self {
            AccountBackend::Pw => {
                Invocation::new("pw").args([if lock { "lock" } else { "unlock" }, name])
            }
            AccountBackend::Shadow => {
                Invocation::new("usermod").args([if lock { "-L" } else { "-U" }, name])
            }
        }
    }

    fn password_invocation(self, name: &str, hash: &str) -> Invocation {
        match self {
            AccountBackend::Pw => Invocation::new("pw")
                .args(["usermod", name, "-H", "0"])
                .stdin(hash),
            AccountBackend::Shadow => Invocation::new("chpasswd")
                .arg("-e")
                .stdin(format!("{}:{}\n", name, hash)),
        }
    }
}

fn account_error(user: &str, e: Error) -> Error {
    match e {
        Error::Account { .. } => e,
        other => Error::Account {
            user: user.to_string(),
            reason: other.to_string(),
        },
    }
}

pub fn create_user(tools: &dyn ToolRunner, backend: AccountBackend, user: &UserSpec) -> Result<()> {
    let inv = backend.useradd(user);
    info!("creating user {} via {}", user.name, inv);
    tools
        .run_checked(&inv)
        .map_err(|e| account_error(&user.name, e))?;
    Ok(())
}

/// Lock or unlock the password of `name`
///
/// Returns `false` without running anything when the account is already in
/// the requested state.
pub fn lock_unlock_user(
    tools: &dyn ToolRunner,
    backend: AccountBackend,
    name: &str,
    lock: bool,
) -> Result<bool> {
    let output = tools
        .run_checked(&backend.lock_query(name))
        .map_err(|e| account_error(name, e))?;
    let password_field = output
        .stdout
        .lines()
        .next()
        .and_then(|line| line.split(':').nth(1))
        .ok_or_else(|| Error::Account {
            user: name.to_string(),
            reason: "getent returned no account entry".to_string(),
        })?;

    if backend.is_locked(password_field) == lock {
        debug!("{} already {}", name, if lock { "locked" } else { "unlocked" });
        return Ok(false);
    }

    let inv = backend.lock_invocation(name, lock);
    info!("{}", inv);
    tools.run_checked(&inv).map_err(|e| account_error(name, e))?;
    Ok(true)
}

/// Set an already-hashed password, passing the hash on stdin
pub fn set_user_password(
    tools: &dyn ToolRunner,
    backend: AccountBackend,
    name: &str,
    hash: &str,
) -> Result<()> {
    let inv = backend.password_invocation(name, hash);
    info!("setting password hash for {} via {}", name, inv.program);
    tools.run_checked(&inv).map_err(|e| account_error(name, e))?;
    Ok(())
}
