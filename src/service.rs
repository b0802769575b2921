//! `lko start|stop|restart|status|logs`: thin wrappers over the systemd unit.

use anyhow::{bail, Context, Result};
use std::process::Command;

pub const UNIT: &str = "lko-agent";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
    Status,
    Logs { follow: bool, lines: usize },
}

/// The program and arguments an action runs.
pub fn command_line(action: ServiceAction) -> (&'static str, Vec<String>) {
    let systemctl = |verb: &str| ("systemctl", vec![verb.to_string(), UNIT.to_string()]);
    match action {
        ServiceAction::Start => systemctl("start"),
        ServiceAction::Stop => systemctl("stop"),
        ServiceAction::Restart => systemctl("restart"),
        ServiceAction::Status => {
            let (prog, mut args) = systemctl("status");
            args.push("--no-pager".to_string());
            (prog, args)
        }
        ServiceAction::Logs { follow, lines } => {
            let mut args = vec![
                "-u".to_string(),
                UNIT.to_string(),
                "-n".to_string(),
                lines.to_string(),
                "--no-pager".to_string(),
            ];
            if follow {
                args.push("-f".to_string());
            }
            ("journalctl", args)
        }
    }
}

pub fn run_service(action: ServiceAction) -> Result<()> {
    let (program, args) = command_line(action);
    tracing::debug!("{} {}", program, args.join(" "));
    let status = Command::new(program)
        .args(&args)
        .status()
        .with_context(|| format!("Failed to run {}", program))?;

    // `systemctl status` exits 3 for a stopped unit; that is still an answer.
    if !status.success() && !(action == ServiceAction::Status && status.code() == Some(3)) {
        bail!("{} {} failed ({})", program, args.join(" "), status);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_systemctl_lines() {
        assert_eq!(
            command_line(ServiceAction::Restart),
            ("systemctl", vec!["restart".to_string(), "lko-agent".to_string()])
        );
        assert_eq!(command_line(ServiceAction::Status).1.last().unwrap(), "--no-pager");
    }

    #[test]
    fn test_journalctl_line() {
        let (prog, args) = command_line(ServiceAction::Logs {
            follow: true,
            lines: 50,
        });
        assert_eq!(prog, "journalctl");
        assert_eq!(args, vec!["-u", "lko-agent", "-n", "50", "--no-pager", "-f"]);
    }
}
