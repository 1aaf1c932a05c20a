//! Command-line surface.
//!
//! Flags mirror the saved profile: anything given explicitly wins,
//! anything omitted falls back to the profile, and required values with
//! neither source are a usage error. When both a key and a password end
//! up available, the key is tried first.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::config::{
    Credential, Endpoint, HostConfig, SessionConfig, DEFAULT_HTTP_PORT, DEFAULT_SOCKS_PORT,
    DEFAULT_SSH_PORT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Desktop front-end (ships separately).
    Gui,
    /// Run the tunnel in the terminal.
    Cli,
}

#[derive(Debug, Parser)]
#[command(
    name = "sshveil",
    version,
    about = "Local SOCKS5/HTTP proxy tunnelled over SSH",
    long_about = "Starts a local SOCKS5 proxy and a local HTTP proxy and relays every \
                  connection through an SSH session to the target host, optionally via \
                  a jump host. Applications either get pointed at the proxies manually \
                  or pick them up from the system proxy settings."
)]
pub struct Cli {
    /// Run mode.
    #[arg(value_enum, default_value = "gui")]
    pub mode: Mode,

    /// Target host (IP or DNS name).
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Target SSH port.
    #[arg(short = 'P', long)]
    pub port: Option<u16>,

    /// Login user on the target.
    #[arg(short = 'u', long)]
    pub user: Option<String>,

    /// Password for the target (may be omitted with key auth).
    #[arg(short = 'p', long)]
    pub password: Option<String>,

    /// Private key file for the target.
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Passphrase for the target key.
    #[arg(long)]
    pub key_passphrase: Option<String>,

    /// Jump host (IP or DNS name); enables the two-hop chain.
    #[arg(long)]
    pub jump_host: Option<String>,

    /// Jump host SSH port.
    #[arg(long)]
    pub jump_port: Option<u16>,

    /// Login user on the jump host (defaults to the target user).
    #[arg(long)]
    pub jump_user: Option<String>,

    /// Password for the jump host (defaults to the target password).
    #[arg(long)]
    pub jump_password: Option<String>,

    /// Private key file for the jump host (defaults to the target key).
    #[arg(long)]
    pub jump_key: Option<PathBuf>,

    /// Passphrase for the jump host key.
    #[arg(long)]
    pub jump_key_passphrase: Option<String>,

    /// Local SOCKS5 port.
    #[arg(short = 's', long = "socks")]
    pub socks_port: Option<u16>,

    /// Local HTTP proxy port.
    #[arg(long = "http")]
    pub http_port: Option<u16>,

    /// Manage the system proxy while connected (default).
    #[arg(long = "proxy", overrides_with = "no_proxy")]
    proxy: bool,

    /// Leave the system proxy settings alone.
    #[arg(long = "no-proxy", overrides_with = "proxy")]
    no_proxy: bool,

    /// Do not write the profile after a successful start.
    #[arg(long = "no-save")]
    pub no_save: bool,

    /// Require host keys to match known_hosts.
    #[arg(long)]
    pub strict_host_keys: bool,
}

impl Cli {
    /// Three-state proxy switch: `Some(true)` / `Some(false)` when given
    /// on the command line, `None` to fall back to profile/default.
    pub fn manage_system_proxy(&self) -> Option<bool> {
        if self.no_proxy {
            Some(false)
        } else if self.proxy {
            Some(true)
        } else {
            None
        }
    }
}

/// First existing default key under `~/.ssh`, if any.
fn default_private_key() -> Option<PathBuf> {
    let ssh_dir = dirs::home_dir()?.join(".ssh");
    ["id_ed25519", "id_rsa", "id_ecdsa"]
        .iter()
        .map(|name| ssh_dir.join(name))
        .find(|path| path.is_file())
}

fn saved_password(host: Option<&HostConfig>) -> Option<String> {
    host?.credentials.iter().find_map(|c| match c {
        Credential::Password { password } => Some(password.clone()),
        _ => None,
    })
}

fn saved_key(host: Option<&HostConfig>) -> Option<(PathBuf, Option<String>)> {
    host?.credentials.iter().find_map(|c| match c {
        Credential::Key { path, passphrase } => Some((path.clone(), passphrase.clone())),
        _ => None,
    })
}

/// Key first, password second, so key auth is attempted before the
/// password fallback.
fn credential_list(
    key: Option<(PathBuf, Option<String>)>,
    password: Option<String>,
) -> Vec<Credential> {
    let mut credentials = Vec::new();
    if let Some((path, passphrase)) = key {
        credentials.push(Credential::Key { path, passphrase });
    }
    if let Some(password) = password.filter(|p| !p.is_empty()) {
        credentials.push(Credential::Password { password });
    }
    credentials
}

/// Combine flags and the saved profile into a full session description.
pub fn build_session(cli: &Cli, saved: Option<&SessionConfig>) -> Result<SessionConfig, String> {
    let saved_target = saved.map(|s| &s.target);
    let saved_jump = saved.and_then(|s| s.jump.as_ref());

    let host = cli
        .host
        .clone()
        .or_else(|| saved_target.map(|t| t.endpoint.host.clone()))
        .ok_or("target host required: pass --host or save a profile first")?;
    let port = cli
        .port
        .or(saved_target.map(|t| t.endpoint.port))
        .unwrap_or(DEFAULT_SSH_PORT);
    let user = cli
        .user
        .clone()
        .or_else(|| saved_target.map(|t| t.user.clone()))
        .ok_or("target user required: pass --user or save a profile first")?;

    let password = cli.password.clone().or_else(|| saved_password(saved_target));
    let mut key = match &cli.key {
        Some(path) => Some((path.clone(), cli.key_passphrase.clone())),
        None => saved_key(saved_target),
    };
    if key.is_none() && password.is_none() {
        // Last resort: the usual default key locations.
        key = default_private_key().map(|path| (path, None));
    }

    let credentials = credential_list(key.clone(), password.clone());
    if credentials.is_empty() {
        return Err("no way to authenticate: pass --password or --key".into());
    }

    let target = HostConfig {
        endpoint: Endpoint::new(host, port),
        user: user.clone(),
        credentials,
    };

    let jump_host = cli
        .jump_host
        .clone()
        .or_else(|| saved_jump.map(|j| j.endpoint.host.clone()));
    let jump = match jump_host {
        Some(jump_host) => {
            let jump_port = cli
                .jump_port
                .or(saved_jump.map(|j| j.endpoint.port))
                .unwrap_or(DEFAULT_SSH_PORT);
            let jump_user = cli
                .jump_user
                .clone()
                .or_else(|| saved_jump.map(|j| j.user.clone()))
                .unwrap_or_else(|| user.clone());
            let jump_password = cli
                .jump_password
                .clone()
                .or_else(|| saved_password(saved_jump))
                .or(password);
            let jump_key = match &cli.jump_key {
                Some(path) => Some((path.clone(), cli.jump_key_passphrase.clone())),
                None => saved_key(saved_jump).or(key),
            };

            let jump_credentials = credential_list(jump_key, jump_password);
            if jump_credentials.is_empty() {
                return Err("no way to authenticate to the jump host".into());
            }

            Some(HostConfig {
                endpoint: Endpoint::new(jump_host, jump_port),
                user: jump_user,
                credentials: jump_credentials,
            })
        }
        None => None,
    };

    let cfg = SessionConfig {
        target,
        jump,
        socks_port: cli
            .socks_port
            .or(saved.map(|s| s.socks_port))
            .unwrap_or(DEFAULT_SOCKS_PORT),
        http_port: cli
            .http_port
            .or(saved.map(|s| s.http_port))
            .unwrap_or(DEFAULT_HTTP_PORT),
        manage_system_proxy: cli
            .manage_system_proxy()
            .or(saved.map(|s| s.manage_system_proxy))
            .unwrap_or(true),
        strict_host_key_checking: cli.strict_host_keys
            || saved.is_some_and(|s| s.strict_host_key_checking),
    };

    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("sshveil").chain(args.iter().copied())).unwrap()
    }

    fn saved_profile() -> SessionConfig {
        SessionConfig {
            target: HostConfig {
                endpoint: Endpoint::new("saved.example.net", 2222),
                user: "saveduser".into(),
                credentials: vec![Credential::password("savedpass")],
            },
            jump: None,
            socks_port: 11800,
            http_port: 11801,
            manage_system_proxy: false,
            strict_host_key_checking: false,
        }
    }

    #[test]
    fn mode_defaults_to_gui() {
        let cli = parse(&[]);
        assert_eq!(cli.mode, Mode::Gui);
        let cli = parse(&["cli"]);
        assert_eq!(cli.mode, Mode::Cli);
    }

    #[test]
    fn flags_win_over_profile() {
        let cli = parse(&["cli", "-H", "10.1.2.3", "-u", "alice", "-p", "pw", "-s", "1080"]);
        let cfg = build_session(&cli, Some(&saved_profile())).unwrap();
        assert_eq!(cfg.target.endpoint.host, "10.1.2.3");
        assert_eq!(cfg.target.user, "alice");
        // Unset flags fall back to the profile.
        assert_eq!(cfg.target.endpoint.port, 2222);
        assert_eq!(cfg.socks_port, 1080);
        assert_eq!(cfg.http_port, 11801);
        assert!(!cfg.manage_system_proxy);
    }

    #[test]
    fn profile_alone_is_enough() {
        let cli = parse(&["cli"]);
        let cfg = build_session(&cli, Some(&saved_profile())).unwrap();
        assert_eq!(cfg.target.endpoint.host, "saved.example.net");
        assert_eq!(cfg.target.user, "saveduser");
    }

    #[test]
    fn missing_host_is_a_usage_error() {
        let cli = parse(&["cli", "-u", "alice", "-p", "pw"]);
        let err = build_session(&cli, None).unwrap_err();
        assert!(err.contains("--host"));
    }

    #[test]
    fn key_is_tried_before_password() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("id_ed25519");
        std::fs::write(&key_path, "dummy").unwrap();

        let cli = parse(&[
            "cli",
            "-H",
            "10.1.2.3",
            "-u",
            "alice",
            "-p",
            "pw",
            "--key",
            key_path.to_str().unwrap(),
        ]);
        let cfg = build_session(&cli, None).unwrap();
        assert_eq!(cfg.target.credentials.len(), 2);
        assert!(matches!(cfg.target.credentials[0], Credential::Key { .. }));
        assert!(matches!(
            cfg.target.credentials[1],
            Credential::Password { .. }
        ));
    }

    #[test]
    fn jump_reuses_target_credentials() {
        let cli = parse(&[
            "cli",
            "-H",
            "10.1.2.3",
            "-u",
            "alice",
            "-p",
            "pw",
            "--jump-host",
            "bastion.example.net",
        ]);
        let cfg = build_session(&cli, None).unwrap();
        let jump = cfg.jump.unwrap();
        assert_eq!(jump.endpoint.port, DEFAULT_SSH_PORT);
        assert_eq!(jump.user, "alice");
        assert!(matches!(
            jump.credentials.as_slice(),
            [Credential::Password { .. }]
        ));
    }

    #[test]
    fn proxy_switch_three_states() {
        assert_eq!(parse(&["cli"]).manage_system_proxy(), None);
        assert_eq!(parse(&["cli", "--proxy"]).manage_system_proxy(), Some(true));
        assert_eq!(
            parse(&["cli", "--no-proxy"]).manage_system_proxy(),
            Some(false)
        );
        // The later flag wins when both are present.
        assert_eq!(
            parse(&["cli", "--proxy", "--no-proxy"]).manage_system_proxy(),
            Some(false)
        );
    }
}
