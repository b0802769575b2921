//! Bounded subprocess execution.
//!
//! Every command runs as the leader of its own process group. When the
//! deadline passes the whole group gets SIGKILL, so processes the command
//! started in turn do not outlive it.

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// `sh -c <script>`.
pub fn sh(script: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(script);
    command
}

/// Run `command` to completion with piped stdout/stderr.
///
/// Returns `Ok(None)` when `timeout` elapsed; by then the process group has
/// been killed and the direct child reaped. Spawn failures are `Err`.
pub async fn run_bounded(mut command: Command, timeout: Duration) -> std::io::Result<Option<Output>> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let mut child = command.spawn()?;
    let pgid = child.id();
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    let finished = tokio::time::timeout(timeout, async {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let (status, _, _) = tokio::join!(
            child.wait(),
            drain(stdout.as_mut(), &mut out),
            drain(stderr.as_mut(), &mut err),
        );
        status.map(|status| Output {
            status,
            stdout: out,
            stderr: err,
        })
    })
    .await;

    match finished {
        Ok(output) => output.map(Some),
        Err(_) => {
            if let Some(pgid) = pgid {
                kill_group(pgid);
            }
            if let Err(e) = child.wait().await {
                tracing::debug!("failed to reap timed-out child: {}", e);
            }
            Ok(None)
        }
    }
}

async fn drain<R: AsyncRead + Unpin>(pipe: Option<&mut R>, buf: &mut Vec<u8>) {
    if let Some(pipe) = pipe {
        if let Err(e) = pipe.read_to_end(buf).await {
            tracing::debug!("failed to read child output: {}", e);
        }
    }
}

fn kill_group(pgid: u32) {
    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!("failed to kill process group {}: {}", pgid, e),
    }
}
