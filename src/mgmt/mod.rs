//! Client for the VPN daemon's out-of-band management channel.
//!
//! The supervisor binds a Unix socket; the daemon connects to it and
//! speaks a line protocol. Lines prefixed with `>` are asynchronous
//! notifications, everything else answers the most recent command that
//! expected a reply. One reader task classifies lines onto three channels
//! (state events, client events, replies); one worker task serializes
//! outbound commands, at most one in flight.
//!
//! Shutdown closes the command channel: the worker drains and exits, and
//! later `exec` calls fail with `MgmtError::Cancelled` instead of blocking.

pub mod daemon;
pub mod event;

use std::collections::HashMap;
use std::path::Path;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixListener;
use tokio::sync::{mpsc, oneshot};

use self::event::{ClientEvent, StateEvent};

#[derive(Debug, Error)]
pub enum MgmtError {
    #[error("management channel is closed")]
    Cancelled,

    #[error("daemon refused command: {0}")]
    Command(String),

    #[error("unparseable management line {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MgmtError>;

/// Buffer for the two notification channels; the daemon can burst client
/// events faster than the supervisor programs the filter.
const EVENT_CHANNEL_CAPACITY: usize = 64;

struct Command {
    line: String,
    reply: Option<oneshot::Sender<Result<()>>>,
}

/// Handle for issuing commands to the daemon.
pub struct MgmtClient {
    sender: Mutex<Option<mpsc::Sender<Command>>>,
}

/// The notification streams produced by the reader task.
pub struct MgmtEvents {
    pub state: mpsc::Receiver<StateEvent>,
    pub client: mpsc::Receiver<ClientEvent>,
}

impl MgmtClient {
    /// Bind the management socket. The returned future in `MgmtEvents`
    /// only yields events once the daemon has connected and the hold
    /// handshake completed.
    pub fn start(socket_path: &Path) -> Result<(Self, MgmtEvents)> {
        // A stale socket from a previous run would fail the bind.
        let _ = std::fs::remove_file(socket_path);
        let listener = UnixListener::bind(socket_path)?;

        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(1);
        let (state_tx, state_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (client_tx, client_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            if let Err(e) = run_channel(listener, cmd_rx, state_tx, client_tx).await {
                tracing::error!(error = %e, "management channel terminated");
            }
        });

        Ok((
            MgmtClient {
                sender: Mutex::new(Some(cmd_tx)),
            },
            MgmtEvents {
                state: state_rx,
                client: client_rx,
            },
        ))
    }

    /// Send one command. With `expect_reply`, resolves once the daemon
    /// answers; a non-`SUCCESS:` answer is `MgmtError::Command`.
    pub async fn exec(&self, command: &str, expect_reply: bool) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .as_ref()
            .cloned()
            .ok_or(MgmtError::Cancelled)?;

        let (reply_tx, reply_rx) = if expect_reply {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        sender
            .send(Command {
                line: command.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| MgmtError::Cancelled)?;

        match reply_rx {
            None => Ok(()),
            Some(rx) => rx.await.map_err(|_| MgmtError::Cancelled)?,
        }
    }

    /// Flip into the closing state: drop the command sender so the worker
    /// drains and exits. Subsequent `exec` calls return `Cancelled`.
    pub fn shutdown(&self) {
        self.sender.lock().take();
    }
}

async fn run_channel(
    listener: UnixListener,
    mut commands: mpsc::Receiver<Command>,
    state_tx: mpsc::Sender<StateEvent>,
    client_tx: mpsc::Sender<ClientEvent>,
) -> Result<()> {
    let (stream, _addr) = listener.accept().await?;
    drop(listener);

    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // The daemon may emit banner lines first; everything before the HOLD
    // notification is discarded.
    loop {
        let Some(line) = lines.next_line().await? else {
            return Err(MgmtError::Cancelled);
        };
        if line.starts_with(">HOLD:") {
            break;
        }
    }

    let (reply_tx, mut reply_rx) = mpsc::channel::<String>(1);

    tokio::spawn(async move {
        if let Err(e) = read_loop(lines, reply_tx, state_tx, client_tx).await {
            tracing::error!(error = %e, "management reader terminated");
        }
    });

    send_command(&mut write_half, &mut reply_rx, "state on", true).await?;
    send_command(&mut write_half, &mut reply_rx, "hold release", true).await?;

    while let Some(command) = commands.recv().await {
        let result = send_command(
            &mut write_half,
            &mut reply_rx,
            &command.line,
            command.reply.is_some(),
        )
        .await;

        if let Some(reply) = command.reply {
            // The caller may have given up; a dropped receiver is fine.
            let _ = reply.send(result);
        }
    }

    tracing::debug!("management command worker exiting");
    Ok(())
}

async fn send_command(
    writer: &mut OwnedWriteHalf,
    replies: &mut mpsc::Receiver<String>,
    command: &str,
    expect_reply: bool,
) -> Result<()> {
    writer.write_all(command.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;

    if !expect_reply {
        return Ok(());
    }

    match replies.recv().await {
        None => Err(MgmtError::Cancelled),
        Some(reply) if reply.starts_with("SUCCESS:") => Ok(()),
        Some(reply) => Err(MgmtError::Command(reply)),
    }
}

/// Drain the daemon socket, splitting notifications from replies. Client
/// events with environment blocks are assembled inline since their lines
/// are contiguous on the wire.
async fn read_loop(
    mut lines: Lines<BufReader<OwnedReadHalf>>,
    reply_tx: mpsc::Sender<String>,
    state_tx: mpsc::Sender<StateEvent>,
    client_tx: mpsc::Sender<ClientEvent>,
) -> Result<()> {
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();

        if !line.starts_with('>') {
            if reply_tx.send(line).await.is_err() {
                break;
            }
            continue;
        }

        if line.starts_with(event::STATE_PREFIX) {
            match event::parse_state_event(&line) {
                // State events are only consumed during boot; a closed
                // receiver just discards them.
                Ok(event) => {
                    let _ = state_tx.send(event).await;
                }
                Err(e) => tracing::error!(error = %e, "bad state notification"),
            }
        } else if line.starts_with(event::CLIENT_PREFIX) {
            match read_client_event(&line, &mut lines).await {
                Ok(event) => {
                    if client_tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(MgmtError::Io(e)) => return Err(MgmtError::Io(e)),
                Err(e) => tracing::error!(error = %e, "bad client notification"),
            }
        } else {
            tracing::debug!(line = %line, "ignoring notification");
        }
    }

    // Reader exit closes every channel; consumers observe shutdown.
    Ok(())
}

async fn read_client_event(
    line: &str,
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
) -> Result<ClientEvent> {
    let header = event::parse_client_header(line)?;

    let mut env = HashMap::new();

    if header.has_env() {
        loop {
            let Some(line) = lines.next_line().await? else {
                return Err(MgmtError::Cancelled);
            };
            match event::parse_env_line(line.trim())? {
                Some((name, value)) => {
                    env.insert(name, value);
                }
                None => break,
            }
        }
    }

    Ok(header.into_event(env))
}
