//! Launch configuration for the runtime process.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::channel::transport::ChannelEndpoint;
use crate::supervisor::{ProcessSpawner, RuntimeSpawner};

/// Environment variable naming the directory that holds the runtime executable.
pub const RUNTIME_DIR_ENV: &str = "AUDIENCE_RUNTIME_DIR";

#[cfg(windows)]
pub const RUNTIME_EXECUTABLE: &str = "audience.exe";
#[cfg(not(windows))]
pub const RUNTIME_EXECUTABLE: &str = "audience";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid nucleus \"{name}\" for {platform}")]
    InvalidNucleus { platform: Platform, name: String },
    #[error("cannot locate runtime executable: {0}")]
    RuntimeNotFound(String),
}

/// Target platform a nucleus load order applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Windows,
    MacOs,
    Unix,
}

impl Platform {
    /// Runtime command-line flag carrying this platform's load order.
    pub fn flag(&self) -> &'static str {
        match self {
            Self::Windows => "--win",
            Self::MacOs => "--mac",
            Self::Unix => "--unix",
        }
    }

    pub fn supports(&self, nucleus: Nucleus) -> bool {
        matches!(
            (self, nucleus),
            (Self::Windows, Nucleus::Edge | Nucleus::Ie11)
                | (Self::MacOs, Nucleus::Webkit)
                | (Self::Unix, Nucleus::Webkit)
        )
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Windows => "Windows",
            Self::MacOs => "macOS",
            Self::Unix => "Unix",
        })
    }
}

/// Webview implementation the runtime may load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Nucleus {
    Edge,
    Ie11,
    Webkit,
}

impl Nucleus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Edge => "edge",
            Self::Ie11 => "ie11",
            Self::Webkit => "webkit",
        }
    }
}

impl FromStr for Nucleus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "edge" => Ok(Self::Edge),
            "ie11" => Ok(Self::Ie11),
            "webkit" => Ok(Self::Webkit),
            _ => Err(s.to_string()),
        }
    }
}

/// Parse a comma-separated load order such as `edge,ie11` for `platform`.
pub fn parse_load_order(platform: Platform, csv: &str) -> Result<Vec<Nucleus>, ConfigError> {
    csv.split(',')
        .filter(|name| !name.trim().is_empty())
        .map(|name| {
            name.parse::<Nucleus>()
                .ok()
                .filter(|nucleus| platform.supports(*nucleus))
                .ok_or_else(|| ConfigError::InvalidNucleus {
                    platform,
                    name: name.trim().to_string(),
                })
        })
        .collect()
}

pub struct LaunchOptions {
    pub runtime_path: Option<PathBuf>,
    pub win: Vec<Nucleus>,
    pub mac: Vec<Nucleus>,
    pub unix: Vec<Nucleus>,
    pub icons: Vec<PathBuf>,
    /// Relay the runtime's stdout/stderr into the host's logs.
    pub debug: bool,
    /// Give up when the runtime has not connected within this time. `None` waits forever.
    pub connect_timeout: Option<Duration>,
    pub endpoint: Option<ChannelEndpoint>,
    pub spawner: Arc<dyn RuntimeSpawner>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl LaunchOptions {
    pub fn new() -> Self {
        Self {
            runtime_path: None,
            win: Vec::new(),
            mac: Vec::new(),
            unix: Vec::new(),
            icons: Vec::new(),
            debug: false,
            connect_timeout: None,
            endpoint: None,
            spawner: Arc::new(ProcessSpawner),
        }
    }

    pub fn with_runtime_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.runtime_path = Some(path.into());
        self
    }

    /// Set the nucleus load order for `platform`, rejecting nuclei it cannot load.
    pub fn with_load_order(
        mut self,
        platform: Platform,
        order: Vec<Nucleus>,
    ) -> Result<Self, ConfigError> {
        if let Some(bad) = order.iter().find(|n| !platform.supports(**n)) {
            return Err(ConfigError::InvalidNucleus {
                platform,
                name: bad.as_str().to_string(),
            });
        }
        match platform {
            Platform::Windows => self.win = order,
            Platform::MacOs => self.mac = order,
            Platform::Unix => self.unix = order,
        }
        Ok(self)
    }

    pub fn with_icons<I, P>(mut self, icons: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.icons = icons.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_endpoint(mut self, endpoint: ChannelEndpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn RuntimeSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Explicit path, else `$AUDIENCE_RUNTIME_DIR/audience`, else next to the current executable.
    pub fn resolve_runtime_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(ref path) = self.runtime_path {
            return Ok(path.clone());
        }

        if let Some(dir) = std::env::var_os(RUNTIME_DIR_ENV).filter(|d| !d.is_empty()) {
            return Ok(Path::new(&dir).join(RUNTIME_EXECUTABLE));
        }

        let exe = std::env::current_exe()
            .map_err(|e| ConfigError::RuntimeNotFound(format!("current executable: {e}")))?;
        let dir = exe.parent().ok_or_else(|| {
            ConfigError::RuntimeNotFound(format!("{} has no parent directory", exe.display()))
        })?;
        Ok(dir.join(RUNTIME_EXECUTABLE))
    }

    /// Command-line arguments for the runtime connecting to `endpoint`.
    pub fn runtime_args(&self, endpoint: &ChannelEndpoint) -> Vec<OsString> {
        let mut args = vec![OsString::from("--channel"), endpoint.to_arg()];

        for (platform, order) in [
            (Platform::Windows, &self.win),
            (Platform::MacOs, &self.mac),
            (Platform::Unix, &self.unix),
        ] {
            if !order.is_empty() {
                let csv = order
                    .iter()
                    .map(Nucleus::as_str)
                    .collect::<Vec<_>>()
                    .join(",");
                args.push(platform.flag().into());
                args.push(csv.into());
            }
        }

        if !self.icons.is_empty() {
            let mut csv = OsString::new();
            for (i, icon) in self.icons.iter().enumerate() {
                if i > 0 {
                    csv.push(",");
                }
                csv.push(icon.as_os_str());
            }
            args.push("--icons".into());
            args.push(csv);
        }

        args
    }
}
