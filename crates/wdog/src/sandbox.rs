use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinError;
use tracing::{debug, info};

use crate::builder::{BuildError, Builder, Toolchain};
use crate::config::{InstanceMode, Lang, WdogConfig};
use crate::invoke::{InvokeError, invoke};
use crate::launcher::{Launcher, LocalExecutor, SpawnError};
use crate::protocol::{BuildRequest, InvocationArgs, RunRequest, RunResult};
use crate::proxy::{PinnedKey, ProxyCache, RunnerSlot};
use crate::responder::Responder;
use crate::rights::HandoffError;
use crate::runner::Runner;

#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("can't start handoff responder: {0}")]
    Responder(#[from] HandoffError),
    #[error("no toolchain for {0}")]
    NoToolchain(Lang),
    #[error("not a build instance")]
    NotBuildInstance,
}

/// Why a call produced no result envelope.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("pod token required")]
    Unauthorized,
    #[error("pod token mismatch")]
    Forbidden,
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Invoke(#[from] InvokeError),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("can't borrow runner: {0}")]
    Handoff(#[from] HandoffError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error("call aborted: {0}")]
    Aborted(#[from] JoinError),
}

pub struct RunMode {
    token: String,
    runner: RunnerSlot,
    launcher: Arc<dyn Launcher>,
    /// Serialises throw-away runners.
    process_lock: Arc<AsyncMutex<()>>,
    responder: Option<Responder>,
}

pub struct ProxyMode {
    cache: Arc<ProxyCache>,
}

pub struct BuildMode {
    instance: String,
    token: String,
    builder: Builder,
    lock: AsyncMutex<()>,
}

pub enum Mode {
    Run(RunMode),
    Proxy(ProxyMode),
    Build(BuildMode),
}

/// Everything one watchdog instance serves with, built once at startup.
pub struct Sandbox {
    config: WdogConfig,
    mode: Mode,
}

impl Sandbox {
    /// Launches the runner (run mode) or prepares the cache or toolchain.
    /// Must be called from within a tokio runtime.
    pub fn start(config: WdogConfig) -> Result<Self, StartError> {
        let mode = match &config.mode {
            InstanceMode::Run {
                token, cresponder, ..
            } => {
                let launcher: Arc<dyn Launcher> = Arc::new(LocalExecutor::new(&config.runner));
                let runner = Runner::launch(Arc::clone(&launcher), None)?;
                info!(runner = %runner.identifier(), "runner started");
                let runner = Arc::new(AsyncMutex::new(runner));
                let responder = match cresponder {
                    Some(dir) => {
                        let key = PinnedKey::new(token.as_str(), config.pod_ip.as_str())?;
                        Some(Responder::start(Arc::clone(&runner), dir, &key)?)
                    }
                    None => None,
                };
                Mode::Run(RunMode {
                    token: token.clone(),
                    runner,
                    launcher,
                    process_lock: Arc::new(AsyncMutex::new(())),
                    responder,
                })
            }
            InstanceMode::Proxy { cresponder } => Mode::Proxy(ProxyMode {
                cache: ProxyCache::new(cresponder),
            }),
            InstanceMode::Build { lang, .. } => {
                let lang = *lang;
                let toolchain = Toolchain::for_lang(lang).ok_or(StartError::NoToolchain(lang))?;
                return Self::with_toolchain(config, toolchain);
            }
        };
        Ok(Self { config, mode })
    }

    /// Build instance compiling with `toolchain`.
    pub fn with_toolchain(config: WdogConfig, toolchain: Toolchain) -> Result<Self, StartError> {
        let InstanceMode::Build {
            instance, token, ..
        } = &config.mode
        else {
            return Err(StartError::NotBuildInstance);
        };
        info!(%instance, program = %toolchain.program, "build instance");
        let mode = Mode::Build(BuildMode {
            instance: instance.clone(),
            token: token.clone(),
            builder: Builder::new(toolchain),
            lock: AsyncMutex::new(()),
        });
        Ok(Self { config, mode })
    }

    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    pub fn config(&self) -> &WdogConfig {
        &self.config
    }

    pub fn budget(&self) -> Duration {
        self.config.fn_timeout
    }

    /// The local runner, in run mode.
    pub fn runner(&self) -> Option<&RunnerSlot> {
        match &self.mode {
            Mode::Run(run) => Some(&run.runner),
            _ => None,
        }
    }

    pub fn responder(&self) -> Option<&Responder> {
        match &self.mode {
            Mode::Run(run) => run.responder.as_ref(),
            _ => None,
        }
    }

    pub fn cache(&self) -> Option<&Arc<ProxyCache>> {
        match &self.mode {
            Mode::Proxy(proxy) => Some(&proxy.cache),
            _ => None,
        }
    }

    /// Calls the function: on the local runner in run mode, on a borrowed
    /// one in proxy mode.
    pub async fn run(&self, request: RunRequest) -> Result<RunResult, CallError> {
        let budget = self.budget();
        match &self.mode {
            Mode::Run(run) => {
                authorize(&run.token, request.podtoken.as_deref())?;
                call(Arc::clone(&run.runner), request.args, budget).await
            }
            Mode::Proxy(proxy) => {
                let token = request
                    .podtoken
                    .filter(|token| !token.is_empty())
                    .ok_or(CallError::Unauthorized)?;
                let addr = request
                    .podaddr
                    .ok_or_else(|| CallError::BadRequest("podaddr required".to_owned()))?;
                let key = PinnedKey::new(token, addr)?;
                let slot = proxy.cache.resolve(&key).await?;
                match call(Arc::clone(&slot), request.args.clone(), budget).await {
                    // The call ahead of us gave the lease back while we were
                    // queued on it. Nothing was sent, so borrow again.
                    Err(CallError::Invoke(InvokeError::NotReady))
                        if proxy.cache.lookup(&key).is_none_or(|held| !Arc::ptr_eq(&held, &slot)) =>
                    {
                        debug!(%key, "borrowed runner released while queued, borrowing again");
                        let slot = proxy.cache.resolve(&key).await?;
                        call(slot, request.args, budget).await
                    }
                    result => result,
                }
            }
            Mode::Build(_) => Err(CallError::BadRequest(
                "build instance runs no functions".to_owned(),
            )),
        }
    }

    /// Calls a build variant of the function on a runner of its own, which
    /// is stopped afterwards.
    pub async fn try_run(&self, suff: String, request: RunRequest) -> Result<RunResult, CallError> {
        let Mode::Run(run) = &self.mode else {
            return Err(CallError::BadRequest(
                "only run instances try functions".to_owned(),
            ));
        };
        authorize(&run.token, request.podtoken.as_deref())?;
        if suff.is_empty() || suff.contains('/') {
            return Err(CallError::BadRequest(format!("bad suffix {suff:?}")));
        }

        let budget = self.budget();
        let launcher = Arc::clone(&run.launcher);
        let lock = Arc::clone(&run.process_lock);
        let args = request.args;
        tokio::spawn(async move {
            let _process = lock.lock_owned().await;
            let mut runner = Runner::launch(launcher, Some(suff))?;
            debug!(runner = %runner.identifier(), "trying function");
            let result = invoke(&mut runner, &args, budget).await;
            runner.stop().await;
            Ok::<_, CallError>(result?)
        })
        .await?
    }

    pub async fn build(&self, request: RunRequest) -> Result<RunResult, CallError> {
        let Mode::Build(build) = &self.mode else {
            return Err(CallError::BadRequest(
                "not a build instance".to_owned(),
            ));
        };
        authorize(&build.token, request.podtoken.as_deref())?;
        let params = BuildRequest::from_args(&request.args)
            .ok_or_else(|| CallError::BadRequest("sources required".to_owned()))?;

        let _build = build.lock.lock().await;
        debug!(instance = %build.instance, sources = %params.sources, "build requested");
        Ok(build.builder.build(&params).await?)
    }
}

fn authorize(expected: &str, given: Option<&str>) -> Result<(), CallError> {
    match given {
        None | Some("") => Err(CallError::Unauthorized),
        Some(token) if token == expected => Ok(()),
        Some(_) => Err(CallError::Forbidden),
    }
}

/// Invokes under the run lock inside a task of its own, so the call runs to
/// completion even if the requester goes away.
async fn call(
    slot: RunnerSlot,
    args: InvocationArgs,
    budget: Duration,
) -> Result<RunResult, CallError> {
    tokio::spawn(async move {
        let mut runner = slot.lock_owned().await;
        invoke(&mut runner, &args, budget).await
    })
    .await?
    .map_err(CallError::from)
}
