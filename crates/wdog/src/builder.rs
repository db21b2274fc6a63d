//! Build mode: compiles function sources with the language toolchain and
//! reports the result in the same envelope a call uses.
//!
//! Toolchain strings may carry `{root}`, `{sources}`, `{suff}` and
//! `{packages}` placeholders, expanded per request.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::Lang;
use crate::protocol::{BuildRequest, RunResult};

/// Code reported when the toolchain was killed by a signal.
const STATUS_SIGNALED: i32 = -1;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("bad sources {0:?}")]
    InvalidSources(String),
    #[error("can't symlink code to {path}: {source}")]
    Link {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("can't build: {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("can't rename binary {from} to {to}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Symlink placing the function's script where the toolchain looks for it.
#[derive(Debug, Clone)]
pub struct Link {
    pub from: String,
    pub to: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Toolchain {
    /// Directory holding per-function source directories.
    pub root: PathBuf,
    pub program: String,
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
    pub link: Option<Link>,
    /// Rename applied after a successful build, for toolchains that write
    /// their output to a fixed name.
    pub output: Option<(String, String)>,
    /// Variable set from `{packages}` when the request names packages.
    pub packages_env: Option<(String, String)>,
}

impl Toolchain {
    pub fn for_lang(lang: Lang) -> Option<Self> {
        let owned =
            |items: &[&str]| -> Vec<String> { items.iter().map(|s| (*s).to_owned()).collect() };
        match lang {
            Lang::Golang => Some(Self {
                root: PathBuf::from("/go/src/swycode"),
                program: "go".to_owned(),
                args: owned(&["build", "-o", "../swycode/{sources}/runner{suff}"]),
                workdir: Some(PathBuf::from("/go/src/swyrunner")),
                link: Some(Link {
                    from: "{root}/{sources}/script{suff}.go".to_owned(),
                    to: PathBuf::from("/go/src/swyrunner/script.go"),
                }),
                output: None,
                packages_env: Some(("GOPATH".to_owned(), "/go:{packages}".to_owned())),
            }),
            Lang::Swift => Some(Self {
                root: PathBuf::from("/swift/swycode"),
                program: "swift".to_owned(),
                args: owned(&["build", "--build-path", "../swycode/{sources}"]),
                workdir: Some(PathBuf::from("/swift/runner")),
                link: Some(Link {
                    from: "{root}/{sources}/script{suff}.swift".to_owned(),
                    to: PathBuf::from("/swift/runner/Sources/script.swift"),
                }),
                output: Some((
                    "{root}/{sources}/debug/function".to_owned(),
                    "{root}/{sources}/runner{suff}".to_owned(),
                )),
                packages_env: None,
            }),
            Lang::Csharp => Some(Self {
                root: PathBuf::from("/mono/functions"),
                program: "csc".to_owned(),
                args: owned(&[
                    "/mono/runner/runner.cs",
                    "{root}/{sources}/script{suff}.cs",
                    "-m:FR",
                    "-r:/mono/runner/XStream.dll",
                    "-out:{root}/{sources}/runner{suff}.exe",
                ]),
                workdir: None,
                link: None,
                output: None,
                packages_env: None,
            }),
            Lang::Python | Lang::Nodejs | Lang::Ruby => None,
        }
    }

    fn expand(&self, pattern: &str, request: &BuildRequest) -> String {
        pattern
            .replace("{root}", &self.root.to_string_lossy())
            .replace("{sources}", &request.sources)
            .replace("{suff}", &request.suff)
            .replace("{packages}", request.packages.as_deref().unwrap_or(""))
    }
}

pub struct Builder {
    toolchain: Toolchain,
}

impl Builder {
    pub fn new(toolchain: Toolchain) -> Self {
        Self { toolchain }
    }

    /// Runs one build. A failing compiler is a result, not an error.
    pub async fn build(&self, request: &BuildRequest) -> Result<RunResult, BuildError> {
        validate(request)?;
        let tc = &self.toolchain;

        let link = match &tc.link {
            Some(link) => {
                let from = tc.expand(&link.from, request);
                replace_link(&from, &link.to).await?;
                Some(&link.to)
            }
            None => None,
        };

        let mut command = Command::new(&tc.program);
        command
            .args(tc.args.iter().map(|arg| tc.expand(arg, request)))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &tc.workdir {
            command.current_dir(dir);
        }
        if let Some((name, value)) = &tc.packages_env
            && request.packages.is_some()
        {
            command.env(name, tc.expand(value, request));
        }
        info!(sources = %request.sources, suff = %request.suff, program = %tc.program, "building");
        let output = command.output().await;

        if let Some(path) = link
            && let Err(err) = fs::remove_file(path).await
        {
            warn!(error = %err, path = %path.display(), "can't remove code link");
        }
        let output = output.map_err(|source| BuildError::Launch {
            program: tc.program.clone(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        match output.status.code() {
            Some(0) => {}
            Some(code) => {
                debug!(code, "build failed");
                return Ok(RunResult::build(code, stdout, stderr));
            }
            None => {
                warn!(status = %output.status, "toolchain killed");
                return Ok(RunResult::build(STATUS_SIGNALED, stdout, stderr));
            }
        }

        if let Some((from, to)) = &tc.output {
            let from = PathBuf::from(tc.expand(from, request));
            let to = PathBuf::from(tc.expand(to, request));
            if let Err(source) = fs::rename(&from, &to).await {
                return Err(BuildError::Rename { from, to, source });
            }
        }
        Ok(RunResult::build(0, stdout, stderr))
    }
}

fn validate(request: &BuildRequest) -> Result<(), BuildError> {
    let bad = |part: &str| part.contains(['/', '\0']) || part == "." || part == "..";
    if request.sources.is_empty() || bad(&request.sources) || bad(&request.suff) {
        return Err(BuildError::InvalidSources(format!(
            "{}{}",
            request.sources, request.suff
        )));
    }
    Ok(())
}

async fn replace_link(from: &str, to: &Path) -> Result<(), BuildError> {
    match fs::remove_file(to).await {
        Ok(()) => debug!(path = %to.display(), "removed stale code link"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(BuildError::Link {
                path: to.to_path_buf(),
                source,
            });
        }
    }
    fs::symlink(from, to).await.map_err(|source| BuildError::Link {
        path: to.to_path_buf(),
        source,
    })
}
