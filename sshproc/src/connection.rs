//! SSH connection built on russh

use super::config::{ConnectConfig, DEFAULT_KEY_NAMES, KEY_PASSPHRASE_ENV};
use super::error::{SshError, SshResult};
use super::process::{CommandOutput, ProcessOptions, RemoteProcess};
use super::sftp::SftpClient;
use russh::Disconnect;
use russh::client::{self, Config, Handle, Handler};
use russh::keys::{Algorithm, PrivateKeyWithHashAlg, PublicKey, load_secret_key};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Handler for SSH client events
pub struct ClientHandler {
    host: String,
    port: u16,
    known_hosts: PathBuf,
    accept_unknown_hosts: bool,
}

impl ClientHandler {
    fn new(config: &ConnectConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            known_hosts: config.known_hosts_file(),
            accept_unknown_hosts: config.accept_unknown_hosts,
        }
    }

    fn verify(&self, server_public_key: &PublicKey) -> SshResult<bool> {
        let rejected = |reason: String| SshError::HostKeyVerification {
            host: self.host.clone(),
            reason,
        };

        match russh::keys::check_known_hosts_path(
            &self.host,
            self.port,
            server_public_key,
            &self.known_hosts,
        ) {
            Ok(true) => Ok(true),
            Ok(false) if self.accept_unknown_hosts => {
                tracing::warn!(host = %self.host, port = self.port, "Accepting unknown host key");
                Ok(true)
            }
            Ok(false) => Err(rejected(format!(
                "host is not listed in {}",
                self.known_hosts.display()
            ))),
            // A key that differs from the recorded one is never accepted.
            Err(e) => Err(rejected(e.to_string())),
        }
    }
}

impl Handler for ClientHandler {
    type Error = SshError;

    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl Future<Output = std::result::Result<bool, Self::Error>> + Send {
        let verdict = self.verify(server_public_key);
        async move { verdict }
    }
}

/// An authenticated SSH session to one host.
///
/// Commands started with [`Connection::spawn`] and SFTP clients from
/// [`Connection::sftp`] each get their own channel on this session.
///
/// Call [`Connection::close`] when done. Dropping an open connection spawns a
/// disconnect on the current tokio runtime if there is one; that cleanup is
/// best effort only.
pub struct Connection {
    config: ConnectConfig,
    username: String,
    handle: Option<Handle<ClientHandler>>,
}

impl Connection {
    /// Connect and authenticate.
    ///
    /// The server key must match the known_hosts file unless
    /// `accept_unknown_hosts` is set and the host is not listed at all.
    pub async fn connect(config: ConnectConfig) -> SshResult<Self> {
        let username = config.login_name().ok_or_else(|| {
            SshError::Authentication(
                "No user name configured and none found in the environment".to_string(),
            )
        })?;

        let ssh_config = Config {
            keepalive_interval: Some(Duration::from_secs(15)),
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = ClientHandler::new(&config);

        tracing::debug!(host = %config.host, port = config.port, user = %username, "Connecting to SSH server");

        let mut handle = tokio::time::timeout(
            config.timeout,
            client::connect(
                Arc::new(ssh_config),
                (config.host.as_str(), config.port),
                handler,
            ),
        )
        .await
        .map_err(|_| {
            SshError::Timeout(format!(
                "Connecting to {}:{} timed out",
                config.host, config.port
            ))
        })?
        .map_err(|e| match e {
            e @ SshError::HostKeyVerification { .. } => e,
            other => SshError::Connection(other.to_string()),
        })?;

        authenticate(&mut handle, &config, &username).await?;

        tracing::info!(host = %config.host, user = %username, "SSH connection established");

        Ok(Self {
            config,
            username,
            handle: Some(handle),
        })
    }

    fn handle(&self) -> SshResult<&Handle<ClientHandler>> {
        self.handle.as_ref().ok_or(SshError::NotConnected)
    }

    /// Start `command` on the remote host.
    ///
    /// The command string is sent verbatim. When `options.user` is set it is
    /// wrapped as `sudo -u <user> <sudo_options> <command>`; quoting is the
    /// caller's job (see [`crate::shell::quote`]).
    pub async fn spawn(&self, command: &str, options: ProcessOptions) -> SshResult<RemoteProcess> {
        RemoteProcess::start(self.handle()?, command, options).await
    }

    /// Start `command` with default options.
    pub async fn exec(&self, command: &str) -> SshResult<RemoteProcess> {
        self.spawn(command, ProcessOptions::default()).await
    }

    /// Run `command` to completion and collect its output.
    pub async fn output(&self, command: &str) -> SshResult<CommandOutput> {
        self.exec(command).await?.wait_with_output().await
    }

    /// Open an SFTP client on a new channel of this session.
    pub async fn sftp(&self) -> SshResult<SftpClient> {
        SftpClient::open(self.handle()?).await
    }

    /// Disconnect from the server. Calling this more than once is a no-op.
    pub async fn close(&mut self) -> SshResult<()> {
        if let Some(handle) = self.handle.take() {
            handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
                .map_err(|e| SshError::Connection(e.to_string()))?;
            tracing::debug!(host = %self.config.host, "SSH connection closed");
        }
        Ok(())
    }

    /// Check if close has been called
    pub fn is_closed(&self) -> bool {
        self.handle.is_none()
    }

    pub fn host(&self) -> &str {
        &self.config.host
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    /// The name the session authenticated as
    pub fn username(&self) -> &str {
        &self.username
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let host = self.config.host.clone();
                runtime.spawn(async move {
                    if let Err(e) = handle.disconnect(Disconnect::ByApplication, "", "en").await {
                        tracing::debug!(host = %host, error = %e, "Disconnect on drop failed");
                    }
                });
            }
            // Without a runtime the session task stops once the handle is gone.
            Err(_) => drop(handle),
        }
    }
}

/// Try the configured key, the agent, the keys directory and finally the
/// password, stopping at the first method the server accepts.
async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    config: &ConnectConfig,
    username: &str,
) -> SshResult<()> {
    let mut last_error = None;
    let mut attempted = false;

    if let Some(key_path) = &config.key_path {
        attempted = true;
        match try_key_auth(handle, config, username, key_path).await {
            Ok(true) => return Ok(()),
            Ok(false) => tracing::debug!(key = %key_path.display(), "Key not accepted"),
            Err(e) => last_error = Some(e),
        }
    }

    if config.allow_agent {
        match try_agent_auth(handle, username).await {
            Ok(Some(true)) => return Ok(()),
            Ok(Some(false)) => attempted = true,
            Ok(None) => {}
            Err(e) => {
                attempted = true;
                last_error = Some(e);
            }
        }
    }

    let keys_dir = config.keys_directory();
    if config.look_for_keys {
        for key_name in DEFAULT_KEY_NAMES {
            let key_path = keys_dir.join(key_name);
            if !key_path.exists() {
                continue;
            }

            attempted = true;
            tracing::debug!(key = %key_path.display(), "Trying SSH key");

            match try_key_auth(handle, config, username, &key_path).await {
                Ok(true) => {
                    tracing::debug!(key = %key_path.display(), "Authentication successful");
                    return Ok(());
                }
                Ok(false) => tracing::debug!(key = %key_path.display(), "Key not accepted"),
                Err(e) => {
                    tracing::debug!(key = %key_path.display(), error = %e, "Key auth failed");
                    last_error = Some(e);
                }
            }
        }
    }

    if let Some(password) = &config.password {
        attempted = true;
        let result = handle
            .authenticate_password(username, password)
            .await
            .map_err(|e| SshError::Authentication(e.to_string()))?;
        if result.success() {
            return Ok(());
        }
        last_error = Some(SshError::Authentication(format!(
            "Password rejected for {username}"
        )));
    }

    if attempted {
        Err(last_error.unwrap_or_else(|| {
            SshError::Authentication(format!("No credentials were accepted for {username}"))
        }))
    } else {
        Err(SshError::NoKeysFound(keys_dir))
    }
}

/// `Ok(None)` means no agent is reachable.
async fn try_agent_auth(handle: &mut Handle<ClientHandler>, username: &str) -> SshResult<Option<bool>> {
    #[cfg(unix)]
    {
        use russh::keys::agent::client::AgentClient;

        let mut agent = match AgentClient::connect_env().await {
            Ok(agent) => agent,
            Err(_) => return Ok(None),
        };

        let keys = agent.request_identities().await.map_err(|e| {
            SshError::Authentication(format!("ssh-agent identities failed: {e}"))
        })?;

        for key in keys {
            match handle
                .authenticate_publickey_with(username, key.public_key().into_owned(), None, &mut agent)
                .await
            {
                Ok(result) if result.success() => return Ok(Some(true)),
                Ok(_) => continue,
                Err(e) => {
                    return Err(SshError::Authentication(format!(
                        "ssh-agent authentication failed: {e}"
                    )));
                }
            }
        }

        Ok(Some(false))
    }

    #[cfg(not(unix))]
    {
        let _ = (handle, username);
        Ok(None)
    }
}

/// Try authenticating with a specific key
async fn try_key_auth(
    handle: &mut Handle<ClientHandler>,
    config: &ConnectConfig,
    username: &str,
    key_path: &Path,
) -> SshResult<bool> {
    let key = match load_secret_key(key_path, None) {
        Ok(k) => k,
        Err(e) => {
            let pass = config
                .passphrase
                .clone()
                .or_else(|| std::env::var(KEY_PASSPHRASE_ENV).ok());

            match pass {
                Some(pass) => {
                    load_secret_key(key_path, Some(&pass)).map_err(|e| SshError::KeyLoad {
                        path: key_path.to_path_buf(),
                        reason: e.to_string(),
                    })?
                }
                None => {
                    return Err(SshError::KeyLoad {
                        path: key_path.to_path_buf(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    };

    let hash_alg = if matches!(key.algorithm(), Algorithm::Rsa { .. }) {
        handle
            .best_supported_rsa_hash()
            .await
            .map_err(|e| SshError::Authentication(e.to_string()))?
            .flatten()
    } else {
        None
    };

    let auth_result = handle
        .authenticate_publickey(username, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
        .await
        .map_err(|e| SshError::Authentication(e.to_string()))?;

    Ok(auth_result.success())
}
