use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, CommandFactory, Parser, Subcommand};
use sshproc::{ConnectConfig, Connection, HostsToml, ProcessOptions, RemoteOutput};
use tokio::io::AsyncWrite;

use crate::output;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// sshproc - run remote commands and copy files over SSH
#[derive(Parser)]
#[command(name = "sshproc")]
#[command(version)]
#[command(about = "Run remote commands and copy files over SSH")]
pub struct Cli {
    /// Show verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(flatten)]
    pub connect: ConnectArgs,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Connection overrides applied on top of hosts.toml or the parsed target.
#[derive(Args, Debug, Default, Clone)]
pub struct ConnectArgs {
    /// SSH port
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Remote login name
    #[arg(short = 'l', long = "user-name", global = true)]
    pub user_name: Option<String>,

    /// Private key to try first
    #[arg(short = 'i', long, global = true, value_name = "KEY")]
    pub identity: Option<PathBuf>,

    /// Trust hosts missing from known_hosts
    #[arg(long, global = true)]
    pub accept_unknown_hosts: bool,

    /// Connect timeout in seconds
    #[arg(long, global = true, value_name = "SECS")]
    pub timeout: Option<u64>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a command and exit with its exit code
    Exec {
        /// Host alias from hosts.toml, or [user@]host[:port]
        target: String,

        /// Run the command as this user through sudo
        #[arg(long)]
        user: Option<String>,

        /// Options passed to sudo (default: -n)
        #[arg(long, requires = "user", allow_hyphen_values = true)]
        sudo_options: Option<String>,

        /// Command line, sent as-is
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Upload a file
    Put {
        target: String,

        local: PathBuf,

        /// Remote path (defaults to the local file name)
        remote: Option<String>,
    },

    /// Download a file
    Get {
        target: String,

        remote: String,

        /// Local path (defaults to the remote file name)
        local: Option<PathBuf>,
    },

    /// List a remote directory
    Ls {
        target: String,

        path: Option<String>,
    },

    /// Print the remote login name
    Whoami { target: String },
}

impl Cli {
    /// Run the selected command, returning the exit code to leave with.
    pub fn run(self) -> CliResult<i32> {
        let Some(command) = self.command else {
            Cli::command().print_help()?;
            println!();
            return Ok(0);
        };

        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(command.run(&self.connect))
    }
}

impl Commands {
    fn target(&self) -> &str {
        match self {
            Commands::Exec { target, .. }
            | Commands::Put { target, .. }
            | Commands::Get { target, .. }
            | Commands::Ls { target, .. }
            | Commands::Whoami { target } => target,
        }
    }

    async fn run(self, args: &ConnectArgs) -> CliResult<i32> {
        let config = apply_overrides(HostsToml::load()?.resolve(self.target())?, args);
        let mut conn = Connection::connect(config).await?;

        let result = match self {
            Commands::Exec {
                user,
                sudo_options,
                command,
                ..
            } => {
                let mut options = ProcessOptions::default();
                options.user = user;
                if let Some(sudo_options) = sudo_options {
                    options.sudo_options = sudo_options;
                }
                run_remote(&conn, &command.join(" "), options).await
            }
            Commands::Whoami { .. } => {
                run_remote(&conn, "whoami", ProcessOptions::default()).await
            }
            Commands::Put { local, remote, .. } => {
                let sftp = conn.sftp().await?;
                let name = local.display().to_string();
                let bar = output::transfer_bar(&name);
                sftp.put(
                    &local,
                    remote.as_deref(),
                    Some(output::progress_callback(&bar)),
                )
                .await?;
                bar.finish_and_clear();
                output::success(&format!("Uploaded {name}"));
                Ok(0)
            }
            Commands::Get { remote, local, .. } => {
                let sftp = conn.sftp().await?;
                let bar = output::transfer_bar(&remote);
                sftp.get(
                    &remote,
                    local.as_deref(),
                    Some(output::progress_callback(&bar)),
                )
                .await?;
                bar.finish_and_clear();
                output::success(&format!("Downloaded {remote}"));
                Ok(0)
            }
            Commands::Ls { path, .. } => {
                let sftp = conn.sftp().await?;
                let mut entries = sftp.listdir(path.as_deref()).await?;
                entries.sort();
                if entries.is_empty() {
                    output::muted("(empty)");
                }
                for entry in entries {
                    println!("{entry}");
                }
                Ok(0)
            }
        };

        conn.close().await?;
        result
    }
}

fn apply_overrides(mut config: ConnectConfig, args: &ConnectArgs) -> ConnectConfig {
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(user) = &args.user_name {
        config.username = Some(user.clone());
    }
    if let Some(identity) = &args.identity {
        config.key_path = Some(identity.clone());
    }
    if args.accept_unknown_hosts {
        config.accept_unknown_hosts = true;
    }
    if let Some(secs) = args.timeout {
        config.timeout = Duration::from_secs(secs);
    }
    config
}

/// Spawn `command`, stream its output to ours and return its exit code.
///
/// Local stdin is not forwarded; the remote side sees EOF right away.
async fn run_remote(conn: &Connection, command: &str, options: ProcessOptions) -> CliResult<i32> {
    let mut process = conn.spawn(command, options).await?;
    drop(process.stdin.take());

    tokio::try_join!(
        forward(process.stdout.take(), tokio::io::stdout()),
        forward(process.stderr.take(), tokio::io::stderr()),
    )?;

    let code = process.wait().await?;
    tracing::info!(command = %process.command(), exit_code = code, "Remote command finished");
    Ok(i32::try_from(code).unwrap_or(255))
}

async fn forward<W>(stream: Option<RemoteOutput>, mut sink: W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;

    if let Some(mut stream) = stream {
        tokio::io::copy(&mut stream, &mut sink).await?;
    }
    sink.flush().await
}
