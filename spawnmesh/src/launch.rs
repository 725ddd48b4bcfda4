/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Process launch primitives: `$PATH` resolution, local fork/exec of
//! application processes, remote launch of child launchers through a
//! remote shell, and the scp/rcp helpers that stage the launcher
//! binary onto remote hosts.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;

use tokio::process::Child;
use tokio::process::Command;

use spawnnet::Strmap;

use crate::SessionError;

/// How to start processes on the local host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocalLaunch {
    /// Through `sh -c`, inheriting the launcher's environment.
    Shell,
    /// Direct exec with a scrubbed environment containing exactly the
    /// variables passed in.
    Direct,
}

impl FromStr for LocalLaunch {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sh" | "shell" => Ok(Self::Shell),
            "direct" => Ok(Self::Direct),
            other => Err(SessionError::Config(format!(
                "LOCAL must be \"shell\" or \"direct\", got {other:?}"
            ))),
        }
    }
}

/// Which remote shell starts launchers on other hosts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteShell {
    Rsh,
    Ssh,
}

impl RemoteShell {
    /// The parameter key holding the resolved shell path.
    pub fn shell_key(&self) -> &'static str {
        match self {
            Self::Rsh => "rsh",
            Self::Ssh => "ssh",
        }
    }

    /// The parameter key holding the matching remote-copy path.
    pub fn copy_key(&self) -> &'static str {
        match self {
            Self::Rsh => "rcp",
            Self::Ssh => "scp",
        }
    }
}

impl FromStr for RemoteShell {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rsh" => Ok(Self::Rsh),
            "ssh" => Ok(Self::Ssh),
            other => Err(SessionError::Config(format!(
                "SH must be \"rsh\" or \"ssh\", got {other:?}"
            ))),
        }
    }
}

/// Resolve `command` to an absolute path: an existing path is
/// canonicalized, an absolute name is taken as given, and anything else
/// is searched for along `$PATH`, keeping the first executable hit.
pub fn path_search(command: &str) -> Option<PathBuf> {
    if let Ok(path) = std::fs::canonicalize(command) {
        return Some(path);
    }
    if command.starts_with('/') {
        return Some(PathBuf::from(command));
    }
    let path_env = std::env::var_os("PATH")?;
    for prefix in std::env::split_paths(&path_env) {
        let candidate = prefix.join(command);
        if is_executable(&candidate) {
            return Some(std::fs::canonicalize(&candidate).unwrap_or(candidate));
        }
    }
    None
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// This launcher's host name, as advertised to peers and recorded as
/// host 0 of the session.
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Whether `host` names this machine, so a "remote" launch can skip
/// the remote shell.
pub fn is_local_host(host: &str) -> bool {
    host == "localhost" || host == "127.0.0.1" || host == local_hostname()
}

fn required<'a>(params: &'a Strmap, key: &str) -> Result<&'a str, SessionError> {
    params
        .get(key)
        .ok_or_else(|| SessionError::Config(format!("missing parameter {key}")))
}

/// The `cd && env` command line a shell (local or remote) runs to
/// start `exe`. Launch-time variables ride in front of the executable
/// via the `env` utility so the remote login environment is otherwise
/// preserved.
fn shell_command(
    params: &Strmap,
    cwd: &str,
    exe: &str,
    args: &[String],
    envs: &[(String, String)],
) -> Result<String, SessionError> {
    let env_path = required(params, "env")?;
    let mut command = format!("cd {cwd} && {env_path}");
    for (key, value) in envs {
        command.push_str(&format!(" {key}={value}"));
    }
    command.push(' ');
    command.push_str(exe);
    for arg in args {
        command.push(' ');
        command.push_str(arg);
    }
    Ok(command)
}

/// Fork a process. With `host = Some(h)` for a remote `h`, the child
/// execs the remote shell; a local `h` (or `None` with
/// [`LocalLaunch::Direct`]) execs the target directly, and `None` with
/// [`LocalLaunch::Shell`] goes through `sh -c`. Only the spawn itself
/// is awaited; the returned [`Child`] is joined by the caller.
pub fn fork_proc(
    params: &Strmap,
    host: Option<&str>,
    cwd: &str,
    exe: &str,
    args: &[String],
    envs: &[(String, String)],
) -> Result<Child, SessionError> {
    let mut command = match host {
        Some(host) if !is_local_host(host) => {
            let shell: RemoteShell = required(params, "SH")?.parse()?;
            let shell_path = required(params, shell.shell_key())?;
            let mut command = Command::new(shell_path);
            command
                .arg(host)
                .arg(shell_command(params, cwd, exe, args, envs)?)
                .stdin(Stdio::null());
            command
        }
        Some(_) => {
            // The "remote" host is this machine: exec the launcher
            // directly, inheriting our environment.
            let mut command = Command::new(exe);
            command.args(args).current_dir(cwd);
            for (key, value) in envs {
                command.env(key, value);
            }
            command
        }
        None => match required(params, "LOCAL")?.parse::<LocalLaunch>()? {
            LocalLaunch::Shell => {
                let shell_path = required(params, "sh")?;
                let mut command = Command::new(shell_path);
                command
                    .arg("-c")
                    .arg(shell_command(params, cwd, exe, args, envs)?);
                command
            }
            LocalLaunch::Direct => {
                let mut command = Command::new(exe);
                command.args(args).current_dir(cwd).env_clear();
                for (key, value) in envs {
                    command.env(key, value);
                }
                command
            }
        },
    };
    command
        .spawn()
        .map_err(|err| SessionError::Spawn(exe.to_string(), err))
}

/// Fork a helper that remote-copies `exe_path` onto `host` at the same
/// path, using the copy command matching the configured remote shell.
/// The caller joins all copy helpers before launching anything on the
/// target hosts.
pub fn fork_copy(params: &Strmap, host: &str, exe_path: &str) -> Result<Child, SessionError> {
    let shell: RemoteShell = required(params, "SH")?.parse()?;
    let copy_path = required(params, shell.copy_key())?;
    Command::new(copy_path)
        .arg(exe_path)
        .arg(format!("{host}:{exe_path}"))
        .stdin(Stdio::null())
        .spawn()
        .map_err(|err| SessionError::Spawn(copy_path.to_string(), err))
}

/// Stage `src` into the scratch directory under its basename,
/// preserving the executable bit. Returns the staged path.
pub async fn stage_to_scratch(src: &Path, scratch_dir: &Path) -> Result<PathBuf, SessionError> {
    let base = src
        .file_name()
        .ok_or_else(|| SessionError::Config(format!("no basename in {}", src.display())))?;
    let dest = scratch_dir.join(base);
    tokio::fs::copy(src, &dest)
        .await
        .map_err(|err| SessionError::Io(dest.display().to_string(), err))?;
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_search() {
        // `sh` exists on any host we run tests on.
        let sh = path_search("sh").expect("sh not found in PATH");
        assert!(sh.is_absolute());
        assert!(is_executable(&sh));

        // Absolute paths come back as given even when missing.
        assert_eq!(
            path_search("/no/such/command"),
            Some(PathBuf::from("/no/such/command"))
        );
        assert_eq!(path_search("definitely-no-such-command-xyzzy"), None);
    }

    #[test]
    fn test_launch_kind_parsing() {
        assert_eq!("direct".parse::<LocalLaunch>().unwrap(), LocalLaunch::Direct);
        assert_eq!("shell".parse::<LocalLaunch>().unwrap(), LocalLaunch::Shell);
        assert!("bogus".parse::<LocalLaunch>().is_err());
        assert_eq!("ssh".parse::<RemoteShell>().unwrap(), RemoteShell::Ssh);
        assert_eq!(RemoteShell::Rsh.copy_key(), "rcp");
        assert!("telnet".parse::<RemoteShell>().is_err());
    }

    #[test]
    fn test_shell_command_layout() {
        let params: Strmap = [("env", "/usr/bin/env")].into_iter().collect();
        let envs = vec![("K".to_string(), "v".to_string())];
        let cmd = shell_command(&params, "/work", "/bin/app", &["arg0".to_string()], &envs)
            .unwrap();
        assert_eq!(cmd, "cd /work && /usr/bin/env K=v /bin/app arg0");
    }

    #[tokio::test]
    async fn test_fork_proc_direct() {
        let params: Strmap = [("LOCAL", "direct")].into_iter().collect();
        let mut child = fork_proc(&params, None, "/", "/bin/sh", &["-c".into(), "exit 7".into()], &[])
            .unwrap();
        let status = child.wait().await.unwrap();
        assert_eq!(status.code(), Some(7));
    }

    #[tokio::test]
    async fn test_fork_proc_shell() {
        let sh = path_search("sh").unwrap().display().to_string();
        let env = path_search("env").unwrap().display().to_string();
        let params: Strmap = [("LOCAL", "shell"), ("sh", sh.as_str()), ("env", env.as_str())]
            .into_iter()
            .collect();
        let mut child = fork_proc(&params, None, "/", "true", &[], &[]).unwrap();
        assert!(child.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn test_stage_to_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("tool");
        std::fs::write(&src, b"#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&src, std::fs::Permissions::from_mode(0o755)).unwrap();

        let scratch = tempfile::tempdir().unwrap();
        let staged = stage_to_scratch(&src, scratch.path()).await.unwrap();
        assert_eq!(staged, scratch.path().join("tool"));
        assert!(is_executable(&staged));
    }
}
