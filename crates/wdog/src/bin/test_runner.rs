//! Stand-in runner for tests. Speaks the runner side of the queue and
//! behaves according to the `mode` argument of each call:
//!
//! - `echo` (default): writes `out`/`err` to the captured pipes and returns
//!   `ret` with code `code` (200 unless given);
//! - `pid`: returns its process id;
//! - `suffix`: returns the build suffix it was started with;
//! - `hang`: writes `out`, then never answers;
//! - `exit`: writes `out`, then exits without answering;
//! - `marker`: writes `begin <id>`, sleeps `ms`, writes `end <id>`;
//! - `flood`: writes `bytes` bytes of `x` to stdout before answering;
//! - `garbage`: answers with a frame that is not a reply.

use std::env;
use std::fs::File;
use std::io::Write;
use std::os::fd::{FromRawFd, RawFd};
use std::thread;
use std::time::Duration;

use anyhow::{Context, bail};
use wdog::protocol::{InvocationArgs, RunnerReply};
use xqueue::QueueError;
use xqueue::blocking::Endpoint;

struct Pipes {
    out: File,
    err: File,
}

fn main() -> anyhow::Result<()> {
    let argv: Vec<String> = env::args().collect();
    if argv.len() < 4 {
        bail!("usage: {} <queue> <stdout-fd> <stderr-fd> [suffix]", argv[0]);
    }
    // SAFETY: the watchdog hands these descriptors to us alone.
    let mut queue = unsafe { Endpoint::open(&argv[1]) }.context("bad queue id")?;
    let mut pipes = Pipes {
        out: unsafe { open_pipe(&argv[2]) }?,
        err: unsafe { open_pipe(&argv[3]) }?,
    };
    let suffix = argv.get(4).cloned().unwrap_or_default();

    loop {
        let args: InvocationArgs = match queue.recv() {
            Ok(args) => args,
            Err(QueueError::Closed) => return Ok(()),
            Err(err) => return Err(err).context("can't read args"),
        };
        if args.get("mode").is_some_and(|mode| mode == "garbage") {
            queue
                .send(&serde_json::json!(["not", "a", "reply"]))
                .context("can't send reply")?;
            continue;
        }
        let reply = handle(&args, &suffix, &mut pipes)?;
        queue.send(&reply).context("can't send reply")?;
    }
}

unsafe fn open_pipe(fd: &str) -> anyhow::Result<File> {
    let fd: RawFd = fd.parse().with_context(|| format!("bad descriptor {fd:?}"))?;
    Ok(unsafe { File::from_raw_fd(fd) })
}

fn handle(args: &InvocationArgs, suffix: &str, pipes: &mut Pipes) -> anyhow::Result<RunnerReply> {
    let arg = |name: &str| args.get(name).map(String::as_str).unwrap_or("");
    let millis = |name: &str| arg(name).parse::<u64>().unwrap_or(0);

    let ret = match arg("mode") {
        "" | "echo" => {
            pipes.out.write_all(arg("out").as_bytes())?;
            pipes.err.write_all(arg("err").as_bytes())?;
            arg("ret").to_owned()
        }
        "pid" => std::process::id().to_string(),
        "suffix" => suffix.to_owned(),
        "hang" => {
            pipes.out.write_all(arg("out").as_bytes())?;
            loop {
                thread::sleep(Duration::from_secs(3600));
            }
        }
        "exit" => {
            pipes.out.write_all(arg("out").as_bytes())?;
            std::process::exit(3);
        }
        "marker" => {
            let id = arg("id");
            writeln!(pipes.out, "begin {id}")?;
            thread::sleep(Duration::from_millis(millis("ms")));
            writeln!(pipes.out, "end {id}")?;
            id.to_owned()
        }
        "flood" => {
            let bytes = arg("bytes").parse::<usize>().unwrap_or(0);
            pipes.out.write_all(&vec![b'x'; bytes])?;
            bytes.to_string()
        }
        other => bail!("unknown mode {other:?}"),
    };
    let code = arg("code").parse().unwrap_or(200);
    Ok(RunnerReply { code, ret })
}
