//! In-process SSH server for integration tests.
//!
//! It understands a handful of fake commands instead of running a shell:
//!
//! - `whoami`: prints the authenticated user
//! - `exit <n>`: exits with status `n`
//! - `cat`: echoes stdin until EOF, then exits 0
//! - `stderr`: writes `oops\n` to stderr and exits 3
//! - `block`: exits 0 once [`TestServer::release`] is called
//! - `flood`: writes [`FLOOD_BYTES`] to stdout and exits 0
//! - `vanish`: closes the channel without an exit status
//! - `refuse`: rejects the exec request
//!
//! Anything else (including `sudo ...` lines) exits 0 silently. Every command
//! line received is recorded. The `sftp` subsystem serves a temp directory
//! as `/`.

#![allow(dead_code)]

mod sftp;

use russh::keys::{Algorithm, PrivateKey};
use russh::server::{Auth, Msg, Server as _, Session};
use russh::{Channel, ChannelId};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sshproc::ConnectConfig;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

pub const USER: &str = "tester";
pub const PASSWORD: &str = "secret";
pub const FLOOD_BYTES: usize = 4 * 1024 * 1024;

pub fn can_bind_localhost() -> bool {
    std::net::TcpListener::bind(("127.0.0.1", 0)).is_ok()
}

struct ExecServer {
    user: String,
    executed: Arc<Mutex<Vec<String>>>,
    release: Arc<Notify>,
    sftp_root: PathBuf,
    echo_channels: HashSet<ChannelId>,
    // Held only until the channel asks for a subsystem or an exec.
    pending: HashMap<ChannelId, Channel<Msg>>,
}

impl ExecServer {
    fn new(executed: Arc<Mutex<Vec<String>>>, release: Arc<Notify>, sftp_root: PathBuf) -> Self {
        Self {
            user: String::new(),
            executed,
            release,
            sftp_root,
            echo_channels: HashSet::new(),
            pending: HashMap::new(),
        }
    }
}

impl russh::server::Server for ExecServer {
    type Handler = Self;

    fn new_client(&mut self, _: Option<std::net::SocketAddr>) -> Self::Handler {
        Self::new(
            self.executed.clone(),
            self.release.clone(),
            self.sftp_root.clone(),
        )
    }
}

impl russh::server::Handler for ExecServer {
    type Error = russh::Error;

    fn auth_password(
        &mut self,
        user: &str,
        password: &str,
    ) -> impl Future<Output = Result<Auth, Self::Error>> + Send {
        let accepted = user == USER && password == PASSWORD;
        if accepted {
            self.user = user.to_string();
        }
        async move {
            if accepted {
                Ok(Auth::Accept)
            } else {
                Ok(Auth::reject())
            }
        }
    }

    fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        self.pending.insert(channel.id(), channel);
        async { Ok(true) }
    }

    fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        match (name, self.pending.remove(&channel)) {
            ("sftp", Some(sftp_channel)) => {
                let _ = session.channel_success(channel);
                let handler = sftp::TreeSftp::new(self.sftp_root.clone());
                tokio::spawn(russh_sftp::server::run(sftp_channel.into_stream(), handler));
            }
            _ => {
                let _ = session.channel_failure(channel);
            }
        }
        futures_ok()
    }

    fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        self.pending.remove(&channel);
        let command = String::from_utf8_lossy(data).to_string();
        self.executed
            .lock()
            .expect("executed log poisoned")
            .push(command.clone());

        if command == "refuse" {
            let _ = session.channel_failure(channel);
            return futures_ok();
        }
        let _ = session.channel_success(channel);

        if command == "cat" {
            self.echo_channels.insert(channel);
            return futures_ok();
        }

        let handle = session.handle();
        let user = self.user.clone();
        let release = self.release.clone();
        tokio::spawn(async move {
            let status = match command.as_str() {
                "whoami" => {
                    let _ = handle.data(channel, format!("{user}\n").into_bytes()).await;
                    Some(0)
                }
                "stderr" => {
                    let _ = handle
                        .extended_data(channel, 1, b"oops\n".to_vec())
                        .await;
                    Some(3)
                }
                "flood" => {
                    let chunk = vec![b'x'; 32 * 1024];
                    for _ in 0..FLOOD_BYTES / chunk.len() {
                        if handle.data(channel, chunk.clone()).await.is_err() {
                            break;
                        }
                    }
                    Some(0)
                }
                "block" => {
                    release.notified().await;
                    Some(0)
                }
                "vanish" => None,
                other => match other.strip_prefix("exit ") {
                    Some(code) => Some(code.trim().parse().unwrap_or(255)),
                    None => Some(0),
                },
            };

            if let Some(status) = status {
                let _ = handle.exit_status_request(channel, status).await;
            }
            let _ = handle.eof(channel).await;
            let _ = handle.close(channel).await;
        });

        futures_ok()
    }

    fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        if self.echo_channels.contains(&channel) {
            let _ = session.data(channel, data.to_vec());
        }
        futures_ok()
    }

    fn channel_eof(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        if self.echo_channels.remove(&channel) {
            let _ = session.exit_status_request(channel, 0);
            let _ = session.eof(channel);
            let _ = session.close(channel);
        }
        futures_ok()
    }
}

fn futures_ok() -> impl Future<Output = Result<(), russh::Error>> + Send {
    async { Ok(()) }
}

/// A running test server. Aborted on drop.
pub struct TestServer {
    pub port: u16,
    known_hosts_dir: TempDir,
    sftp_root: TempDir,
    executed: Arc<Mutex<Vec<String>>>,
    release: Arc<Notify>,
    task: JoinHandle<()>,
}

impl TestServer {
    /// Start a server on a random local port, or `None` when sockets are unavailable.
    pub async fn start() -> Option<Self> {
        if !can_bind_localhost() {
            return None;
        }

        let mut rng = russh::keys::ssh_key::rand_core::UnwrapErr(rand::rngs::SysRng);
        let host_key = PrivateKey::random(&mut rng, Algorithm::Ed25519).expect("host key");
        let host_public = host_key.public_key().clone();

        let server_config = Arc::new(russh::server::Config {
            auth_rejection_time: Duration::from_millis(0),
            auth_rejection_time_initial: Some(Duration::from_millis(0)),
            inactivity_timeout: Some(Duration::from_secs(30)),
            keys: vec![host_key],
            ..Default::default()
        });

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.ok()?;
        let port = listener.local_addr().expect("local addr").port();

        let known_hosts_dir = TempDir::new().expect("temp known_hosts dir");
        std::fs::write(
            known_hosts_dir.path().join("known_hosts"),
            format!(
                "[127.0.0.1]:{port} {}\n",
                host_public.to_openssh().expect("encode host key")
            ),
        )
        .expect("write known_hosts");

        let sftp_root = TempDir::new().expect("temp sftp root");
        let executed = Arc::new(Mutex::new(Vec::new()));
        let release = Arc::new(Notify::new());
        let mut server = ExecServer::new(
            executed.clone(),
            release.clone(),
            sftp_root.path().to_path_buf(),
        );

        let task = tokio::spawn(async move {
            let _ = server.run_on_socket(server_config, &listener).await;
        });

        Some(Self {
            port,
            known_hosts_dir,
            sftp_root,
            executed,
            release,
            task,
        })
    }

    /// Connection settings that authenticate against this server and trust its key.
    pub fn config(&self) -> ConnectConfig {
        let mut config = ConnectConfig::new("127.0.0.1");
        config.port = self.port;
        config.username = Some(USER.to_string());
        config.password = Some(PASSWORD.to_string());
        config.allow_agent = false;
        config.look_for_keys = false;
        config.known_hosts_path = Some(self.known_hosts_dir.path().join("known_hosts"));
        config.timeout = Duration::from_secs(5);
        config
    }

    /// Local directory the SFTP subsystem serves as `/`.
    pub fn sftp_root(&self) -> &Path {
        self.sftp_root.path()
    }

    /// Command lines received so far, in order.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().expect("executed log poisoned").clone()
    }

    /// Let one pending `block` command exit.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
