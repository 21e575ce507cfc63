//! Thin host-command wrappers.
//!
//! Each of these fronts a single OS utility: spawn, capture, report. All
//! argument checking happens here so the dispatcher can reply with a
//! validation message instead of handing garbage to a privileged tool.

use crate::errors::{validation, CommandError};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

async fn capture(program: &str, args: &[&str]) -> Result<(bool, String), CommandError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|err| CommandError::Execution(format!("{}: {}", program, err)))?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.stderr.is_empty() {
        if !combined.is_empty() && !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
    }
    Ok((output.status.success(), combined))
}

fn require_success(result: (bool, String), what: &str) -> Result<String, CommandError> {
    let (success, output) = result;
    if success {
        Ok(output)
    } else {
        Err(CommandError::Execution(format!("{}:\n{}", what, output.trim())))
    }
}

/// One-shot host summary: uptime, memory, disk. A missing utility degrades
/// to a placeholder instead of failing the whole report.
pub async fn status_summary() -> String {
    let mut sections = Vec::new();
    let probes: [(&str, &[&str]); 3] = [("uptime", &[]), ("free", &["-h"]), ("df", &["-h"])];
    for (program, args) in probes {
        match capture(program, args).await {
            Ok((_, output)) if !output.trim().is_empty() => {
                sections.push(output.trim_end().to_string())
            }
            _ => sections.push(format!("{}: unavailable", program)),
        }
    }
    sections.join("\n---\n")
}

pub async fn top_snapshot() -> Result<String, CommandError> {
    require_success(capture("top", &["-b", "-n", "1"]).await?, "top failed")
}

pub async fn ufw(args: &[&str]) -> Result<String, CommandError> {
    match args {
        ["status"] => require_success(
            capture("ufw", &["status", "verbose"]).await?,
            "ufw status failed",
        ),
        ["enable"] => require_success(
            capture("ufw", &["--force", "enable"]).await?,
            "ufw enable failed",
        ),
        ["disable"] => require_success(
            capture("ufw", &["--force", "disable"]).await?,
            "ufw disable failed",
        ),
        ["allow", port] => {
            let port = parse_port(port)?;
            require_success(
                capture("ufw", &["allow", &port.to_string()]).await?,
                "ufw allow failed",
            )
        }
        ["deny", port] => {
            let port = parse_port(port)?;
            require_success(
                capture("ufw", &["deny", &port.to_string()]).await?,
                "ufw deny failed",
            )
        }
        _ => Err(validation(
            "usage: /ufw status|enable|disable|allow <port>|deny <port>",
        )),
    }
}

/// Create a login user and set its password (`useradd` + `chpasswd`).
pub async fn add_user(name: &str, password: &str) -> Result<String, CommandError> {
    validate_username(name)?;

    require_success(
        capture("useradd", &["-m", "-s", "/bin/bash", name]).await?,
        "useradd failed",
    )?;

    let mut child = Command::new("chpasswd")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| CommandError::Execution(format!("chpasswd: {}", err)))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(format!("{}:{}\n", name, password).as_bytes())
            .await
            .map_err(|err| CommandError::Execution(format!("chpasswd stdin: {}", err)))?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|err| CommandError::Execution(format!("chpasswd: {}", err)))?;
    if !output.status.success() {
        return Err(CommandError::Execution(format!(
            "chpasswd failed:\n{}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(format!("user '{}' created", name))
}

pub async fn service(unit: &str, op: &str) -> Result<String, CommandError> {
    validate_unit(unit)?;
    match op {
        "status" => {
            // systemctl status exits non-zero for inactive units; the text
            // is the answer either way.
            let (_, output) = capture("systemctl", &["status", "--no-pager", unit]).await?;
            Ok(output)
        }
        "restart" => {
            require_success(
                capture("systemctl", &["restart", unit]).await?,
                "systemctl restart failed",
            )?;
            Ok(format!("{} restarted", unit))
        }
        _ => Err(validation("usage: /service <unit> status|restart")),
    }
}

pub fn parse_pid(raw: &str) -> Result<u32, CommandError> {
    let pid: u32 = raw
        .parse()
        .map_err(|_| validation(format!("not a pid: '{}'", raw)))?;
    if pid == 0 {
        return Err(validation("pid 0 is not a target"));
    }
    Ok(pid)
}

pub fn parse_port(raw: &str) -> Result<u16, CommandError> {
    let port: u16 = raw
        .parse()
        .map_err(|_| validation(format!("not a port: '{}'", raw)))?;
    if port == 0 {
        return Err(validation("port 0 is not valid"));
    }
    Ok(port)
}

pub fn validate_username(name: &str) -> Result<(), CommandError> {
    let mut chars = name.chars();
    let valid_first = chars
        .next()
        .map(|c| c.is_ascii_lowercase() || c == '_')
        .unwrap_or(false);
    let valid_rest =
        chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if !valid_first || !valid_rest || name.len() > 32 {
        return Err(validation(format!("invalid username: '{}'", name)));
    }
    Ok(())
}

fn validate_unit(unit: &str) -> Result<(), CommandError> {
    let valid = !unit.is_empty()
        && unit
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '_' | '-'));
    if !valid {
        return Err(validation(format!("invalid unit name: '{}'", unit)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_parsing_rejects_garbage() {
        assert_eq!(parse_pid("4242").unwrap(), 4242);
        assert!(matches!(parse_pid("0"), Err(CommandError::Validation(_))));
        assert!(matches!(parse_pid("abc"), Err(CommandError::Validation(_))));
        assert!(matches!(parse_pid("-1"), Err(CommandError::Validation(_))));
    }

    #[test]
    fn port_parsing_enforces_range() {
        assert_eq!(parse_port("443").unwrap(), 443);
        assert_eq!(parse_port("65535").unwrap(), 65535);
        assert!(matches!(parse_port("0"), Err(CommandError::Validation(_))));
        assert!(matches!(
            parse_port("65536"),
            Err(CommandError::Validation(_))
        ));
        assert!(matches!(
            parse_port("http"),
            Err(CommandError::Validation(_))
        ));
    }

    #[test]
    fn usernames_follow_the_useradd_rules() {
        assert!(validate_username("deploy").is_ok());
        assert!(validate_username("_svc-1").is_ok());
        assert!(validate_username("Root").is_err());
        assert!(validate_username("bad name").is_err());
        assert!(validate_username("").is_err());
        assert!(validate_username("a;rm -rf /").is_err());
    }

    #[test]
    fn unit_names_are_checked() {
        assert!(validate_unit("nginx.service").is_ok());
        assert!(validate_unit("getty@tty1").is_ok());
        assert!(validate_unit("bad unit").is_err());
        assert!(validate_unit("").is_err());
    }

    #[tokio::test]
    async fn ufw_rejects_bad_invocations_before_spawning() {
        assert!(matches!(
            ufw(&["allow", "http"]).await,
            Err(CommandError::Validation(_))
        ));
        assert!(matches!(
            ufw(&["nonsense"]).await,
            Err(CommandError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn status_summary_always_produces_sections() {
        let summary = status_summary().await;
        assert_eq!(summary.matches("---").count(), 2);
    }
}
