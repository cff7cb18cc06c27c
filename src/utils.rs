//! Process helpers shared by the script registry and the packager.

#[cfg(windows)]
use std::os::windows::process::CommandExt;

use tokio::process::Command;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Scripts, installs and launches run without a console window of their
/// own. Windows only; elsewhere the command is returned untouched.
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    #[cfg(windows)]
    cmd.creation_flags(CREATE_NO_WINDOW);
    cmd
}

/// Split a command line into program and arguments on whitespace.
///
/// No shell quoting is interpreted; `None` for a blank command.
pub fn split_command(command: &str) -> Option<(String, Vec<String>)> {
    let mut parts = command.split_whitespace().map(str::to_string);
    let program = parts.next()?;
    Some((program, parts.collect()))
}

/// Rewrite argument tokens that mention `from` so they mention `to`.
///
/// Purely textual: `8080`, `--port=8080` and `localhost:8080` are rewritten,
/// while digits that merely contain the port (`18080`) are left alone.
pub fn substitute_port(args: &[String], from: u16, to: u16) -> Vec<String> {
    let from = from.to_string();
    let to = to.to_string();
    args.iter().map(|arg| replace_digit_runs(arg, &from, &to)).collect()
}

fn replace_digit_runs(arg: &str, from: &str, to: &str) -> String {
    let mut out = String::with_capacity(arg.len());
    let mut run = String::new();
    for c in arg.chars() {
        if c.is_ascii_digit() {
            run.push(c);
            continue;
        }
        if !run.is_empty() {
            out.push_str(if run == from { to } else { run.as_str() });
            run.clear();
        }
        out.push(c);
    }
    if !run.is_empty() {
        out.push_str(if run == from { to } else { run.as_str() });
    }
    out
}

/// Ask a process to terminate cooperatively (SIGTERM / taskkill without /F).
pub fn send_terminate(pid: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
    }

    #[cfg(windows)]
    {
        std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string()])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .creation_flags(CREATE_NO_WINDOW)
            .status()
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_command() {
        let (program, args) = split_command("python -m http.server 8123").unwrap();
        assert_eq!(program, "python");
        assert_eq!(args, vec!["-m", "http.server", "8123"]);

        let (program, args) = split_command("  node   server.js ").unwrap();
        assert_eq!(program, "node");
        assert_eq!(args, vec!["server.js"]);

        assert!(split_command("   ").is_none());
    }

    #[test]
    fn test_substitute_port_tokens() {
        let args: Vec<String> = ["8080", "--port=8080", "localhost:8080", "18080", "80801", "serve"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let rewritten = substitute_port(&args, 8080, 8081);
        assert_eq!(
            rewritten,
            vec!["8081", "--port=8081", "localhost:8081", "18080", "80801", "serve"]
        );
    }

    #[test]
    fn test_substitute_port_repeated_tokens() {
        let args = vec!["3000,3000".to_string()];
        assert_eq!(substitute_port(&args, 3000, 3001), vec!["3001,3001"]);
    }

    #[tokio::test]
    async fn test_creation_flags_keep_command_runnable() {
        let mut cmd = Command::new(if cfg!(windows) { "cmd" } else { "sh" });
        if cfg!(windows) {
            cmd.args(["/C", "exit 0"]);
        } else {
            cmd.args(["-c", "exit 0"]);
        }
        let status = apply_creation_flags(&mut cmd).status().await.unwrap();
        assert!(status.success());
    }

    #[test]
    fn test_substitute_port_noop_without_match() {
        let args = vec!["-m".to_string(), "http.server".to_string()];
        assert_eq!(substitute_port(&args, 3000, 3001), args);
    }
}
