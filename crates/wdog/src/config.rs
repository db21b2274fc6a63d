use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_RUNNER: &str = "/usr/bin/swy-runner";
pub const DEFAULT_PROXY_TIMEOUT_MS: u64 = 10_000;
const PROXY_INSTANCE: &str = "proxy";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} not set")]
    Missing(&'static str),
    #[error("bad value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
    #[error("unknown language {0:?}")]
    UnknownLang(String),
    #[error("language {0} has nothing to build")]
    NotCompiled(Lang),
}

/// Languages a runner image may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lang {
    Golang,
    Python,
    Swift,
    Nodejs,
    Ruby,
    Csharp,
}

impl Lang {
    pub fn as_str(self) -> &'static str {
        match self {
            Lang::Golang => "golang",
            Lang::Python => "python",
            Lang::Swift => "swift",
            Lang::Nodejs => "nodejs",
            Lang::Ruby => "ruby",
            Lang::Csharp => "csharp",
        }
    }

    /// Whether functions in this language are compiled before they run.
    pub fn is_compiled(self) -> bool {
        matches!(self, Lang::Golang | Lang::Swift | Lang::Csharp)
    }
}

impl fmt::Display for Lang {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Lang {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "golang" => Lang::Golang,
            "python" => Lang::Python,
            "swift" => Lang::Swift,
            "nodejs" => Lang::Nodejs,
            "ruby" => Lang::Ruby,
            "csharp" => Lang::Csharp,
            other => return Err(ConfigError::UnknownLang(other.to_owned())),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceMode {
    /// Owns a runner and serves calls against it.
    Run {
        token: String,
        lang: Lang,
        /// Where to offer the runner to borrowers, if anywhere.
        cresponder: Option<PathBuf>,
    },
    /// Serves calls against runners borrowed from run instances.
    Proxy { cresponder: PathBuf },
    /// Compiles function sources.
    Build {
        instance: String,
        token: String,
        lang: Lang,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WdogConfig {
    pub pod_ip: String,
    pub port: u16,
    pub mode: InstanceMode,
    /// Per-call budget.
    pub fn_timeout: Duration,
    pub runner: PathBuf,
}

impl WdogConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Reads the configuration through `lookup`; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|value| !value.is_empty());
        let require = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));

        let pod_ip = require("SWD_POD_IP")?;
        let port = parse("SWD_PORT", require("SWD_PORT")?)?;
        let runner = get("SWD_RUNNER").map_or_else(|| PathBuf::from(DEFAULT_RUNNER), PathBuf::from);

        let (mode, timeout_ms) = match get("SWD_INSTANCE") {
            None => {
                let lang: Lang = require("SWD_LANG")?.parse()?;
                let timeout_ms: u64 = parse("SWD_FN_TMO", require("SWD_FN_TMO")?)?;
                let mode = InstanceMode::Run {
                    token: require("SWD_POD_TOKEN")?,
                    lang,
                    cresponder: get("SWD_CRESPONDER").map(PathBuf::from),
                };
                (mode, timeout_ms)
            }
            Some(instance) if instance == PROXY_INSTANCE => {
                let cresponder = PathBuf::from(require("SWD_CRESPONDER")?);
                let timeout_ms = match get("SWD_FN_TMO") {
                    Some(value) => parse("SWD_FN_TMO", value)?,
                    None => DEFAULT_PROXY_TIMEOUT_MS,
                };
                (InstanceMode::Proxy { cresponder }, timeout_ms)
            }
            Some(instance) => {
                let lang: Lang = require("SWD_LANG")?.parse()?;
                if !lang.is_compiled() {
                    return Err(ConfigError::NotCompiled(lang));
                }
                let timeout_ms = match get("SWD_FN_TMO") {
                    Some(value) => parse("SWD_FN_TMO", value)?,
                    None => 0,
                };
                let mode = InstanceMode::Build {
                    instance,
                    token: require("SWD_POD_TOKEN")?,
                    lang,
                };
                (mode, timeout_ms)
            }
        };

        Ok(Self {
            pod_ip,
            port,
            mode,
            fn_timeout: Duration::from_millis(timeout_ms),
            runner,
        })
    }

    pub fn listen_addr(&self) -> String {
        if self.pod_ip.contains(':') {
            format!("[{}]:{}", self.pod_ip, self.port)
        } else {
            format!("{}:{}", self.pod_ip, self.port)
        }
    }
}

fn parse<T: FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Invalid { name, value })
}
