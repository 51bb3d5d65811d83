//! Command server and status writer of a device module.
//!
//! The server reads one command line at a time, turns it into an `Action`
//! and dispatches it to the store. Replies to lifecycle commands are produced
//! by the reducer as `SendStatus` effects; the server only answers directly
//! when nothing will: `ping`, `get_status`, malformed input, unknown commands
//! and commands that are invalid in the current state.
//!
//! All output goes through a single [`StatusWriter`] task, so status lines
//! from the server and from the executor never interleave mid-line.

use crate::controller::{Action, StoreHandle};
use crate::core::{DeviceKind, DeviceRef, Settings};
use crate::error::{AppResult, RecorderError};
use crate::protocol::codec::{decode_command, encode_line, CommandMessage, StatusMessage};
use crate::session::RecordingSession;
use serde_json::json;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Cloneable handle for queueing status lines.
#[derive(Clone, Debug)]
pub struct StatusSender {
    tx: mpsc::UnboundedSender<StatusMessage>,
}

impl StatusSender {
    /// Queue a status line.
    pub fn send(&self, status: StatusMessage) -> AppResult<()> {
        self.tx
            .send(status)
            .map_err(|_| RecorderError::Protocol("status writer is closed".into()))
    }
}

/// Single owner of the module's output stream.
pub struct StatusWriter;

impl StatusWriter {
    /// Spawn the writer task over `writer`.
    ///
    /// Each status is written with one `write_all` of the complete line and
    /// flushed. The task ends when every [`StatusSender`] is dropped (or the
    /// stream fails) and hands the stream back.
    pub fn spawn<W>(mut writer: W) -> (StatusSender, JoinHandle<W>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<StatusMessage>();

        let task = tokio::spawn(async move {
            let mut lines: u64 = 0;
            while let Some(status) = rx.recv().await {
                let line = match encode_line(&status) {
                    Ok(line) => line,
                    Err(e) => {
                        error!(status = %status.status, error = %e, "Failed to encode status");
                        continue;
                    }
                };
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    error!(error = %e, "Status stream closed");
                    break;
                }
                if let Err(e) = writer.flush().await {
                    error!(error = %e, "Status stream flush failed");
                    break;
                }
                lines += 1;
            }
            debug!(lines, "Status writer finished");
            writer
        });

        (StatusSender { tx }, task)
    }
}

/// What a decoded command turns into.
#[derive(Debug)]
enum Request {
    Dispatch(Action),
    Reply(StatusMessage),
}

/// Whether the read loop keeps going.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineOutcome {
    /// Keep reading
    Continue,
    /// A shutdown was accepted; stop reading
    Shutdown,
}

/// Reads commands from the master and feeds the store.
pub struct CommandServer {
    store: StoreHandle,
    status: StatusSender,
    kind: DeviceKind,
}

impl CommandServer {
    /// Server for a module driving devices of `kind`.
    pub fn new(store: StoreHandle, status: StatusSender, kind: DeviceKind) -> Self {
        Self {
            store,
            status,
            kind,
        }
    }

    /// Serve until a shutdown command or EOF. EOF counts as an implicit shutdown.
    pub async fn run<R>(&self, reader: R) -> AppResult<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        info!(kind = %self.kind, "Command server started");

        loop {
            buf.clear();
            let read = match reader.read_until(b'\n', &mut buf).await {
                Ok(read) => read,
                Err(e) => {
                    warn!(error = %e, "Command stream failed, treating as EOF");
                    0
                }
            };

            if read == 0 {
                info!("Command stream closed, shutting down");
                if !self.store.state().shut_down {
                    self.store
                        .dispatch_with_outcome(Action::Shutdown { reply_to: None })
                        .await?;
                }
                return Ok(());
            }

            let line = String::from_utf8_lossy(&buf);
            if self.handle_line(&line).await? == LineOutcome::Shutdown {
                info!("Shutdown accepted, command server stopping");
                return Ok(());
            }
        }
    }

    /// Process one raw line.
    pub async fn handle_line(&self, line: &str) -> AppResult<LineOutcome> {
        if line.trim().is_empty() {
            return Ok(LineOutcome::Continue);
        }

        let command = match decode_command(line) {
            Ok(command) => command,
            Err(e) => {
                match e.command_id {
                    Some(id) => {
                        warn!(command_id = %id, error = %e.message, "Malformed command");
                        self.reply_error(Some(id), format!("malformed command: {}", e.message));
                    }
                    None => warn!(error = %e.message, line = line.trim(), "Dropping malformed line"),
                }
                return Ok(LineOutcome::Continue);
            }
        };

        debug!(command = %command.command, command_id = ?command.command_id, "Received command");
        let reply_to = command.command_id.clone();

        let request = match self.to_request(&command) {
            Ok(request) => request,
            Err(e) => {
                warn!(command = %command.command, error = %e, "Rejected command");
                self.reply_error(reply_to, e.to_string());
                return Ok(LineOutcome::Continue);
            }
        };

        match request {
            Request::Reply(status) => {
                if status.is_reply() {
                    self.emit(status);
                }
                Ok(LineOutcome::Continue)
            }
            Request::Dispatch(action) => {
                let is_shutdown = matches!(action, Action::Shutdown { .. });
                let outcome = self.store.dispatch_with_outcome(action).await?;
                if !outcome.changed {
                    debug!(command = %command.command, "Command is not valid in the current state");
                    if let Some(id) = reply_to {
                        let state = self.store.state();
                        self.emit(StatusMessage::reply("error", Some(id)).with_data(json!({
                            "message": format!("'{}' is not valid in the current state", command.command),
                            "reason": "invalid_transition",
                            "device_status": state.device_status,
                            "recording_status": state.recording_status,
                        })));
                    }
                    return Ok(LineOutcome::Continue);
                }
                Ok(if is_shutdown {
                    LineOutcome::Shutdown
                } else {
                    LineOutcome::Continue
                })
            }
        }
    }

    fn to_request(&self, command: &CommandMessage) -> AppResult<Request> {
        let reply_to = command.command_id.clone();

        let action = match command.command.as_str() {
            "assign_device" => {
                let kind = match command.param::<String>("device_kind")? {
                    Some(slug) => DeviceKind::from_slug(&slug).ok_or_else(|| {
                        RecorderError::Protocol(format!("unknown device kind '{}'", slug))
                    })?,
                    None => self.kind,
                };
                let index = command.param::<u32>("device_index")?.unwrap_or(0);
                Action::AssignDevice {
                    device: DeviceRef::new(kind, index),
                    reply_to,
                }
            }
            "unassign_device" => Action::UnassignDevice { reply_to },
            "start_recording" => {
                let session_dir: PathBuf = command.required("session_dir")?;
                let trial_number: u32 = command.required("trial_number")?;
                Action::StartRecording {
                    session: RecordingSession::new(session_dir, trial_number),
                    reply_to,
                }
            }
            "stop_recording" => Action::StopRecording { reply_to },
            "apply_settings" => {
                let settings: Settings = command.required("settings")?;
                Action::ApplySettings { settings, reply_to }
            }
            "shutdown" | "quit" => Action::Shutdown { reply_to },
            "ping" => return Ok(Request::Reply(StatusMessage::reply("pong", reply_to))),
            "get_status" => {
                let state = serde_json::to_value(self.store.state())?;
                return Ok(Request::Reply(
                    StatusMessage::reply("status", reply_to).with_data(state),
                ));
            }
            other => {
                return Err(RecorderError::Protocol(format!("unknown command '{}'", other)));
            }
        };

        Ok(Request::Dispatch(action))
    }

    fn reply_error(&self, reply_to: Option<String>, message: String) {
        if reply_to.is_some() {
            self.emit(StatusMessage::error(reply_to, message));
        }
    }

    fn emit(&self, status: StatusMessage) {
        if let Err(e) = self.status.send(status) {
            warn!(error = %e, "Dropping status line");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{spawn_store, DeviceState, Effect};
    use crate::core::DeviceStatus;
    use crate::protocol::codec::decode_status;

    async fn serve(script: &[u8]) -> (Vec<StatusMessage>, DeviceState, Vec<Vec<Effect>>) {
        let (store, mut effects_rx, _store_task) = spawn_store(DeviceState::new(), 16);
        let (status, writer_task) = StatusWriter::spawn(Vec::new());

        let reader = tokio_test::io::Builder::new().read(script).build();
        let server = CommandServer::new(store.clone(), status, DeviceKind::Camera);
        server.run(reader).await.unwrap();
        let state = store.state();
        drop(server);

        let output = writer_task.await.unwrap();
        let statuses = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| decode_status(line).unwrap())
            .collect();

        let mut batches = Vec::new();
        while let Ok(batch) = effects_rx.try_recv() {
            batches.push(batch);
        }
        (statuses, state, batches)
    }

    #[tokio::test]
    async fn test_ping_and_status_replies() {
        let (statuses, _, _) = serve(
            b"{\"command\":\"ping\",\"command_id\":\"p1\"}\n{\"command\":\"get_status\",\"command_id\":\"s1\"}\n{\"command\":\"ping\"}\n",
        )
        .await;
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].status, "pong");
        assert_eq!(statuses[0].in_reply_to.as_deref(), Some("p1"));
        assert_eq!(statuses[1].status, "status");
        assert_eq!(statuses[1].data.as_ref().unwrap()["device_status"], "idle");
    }

    #[tokio::test]
    async fn test_malformed_lines_never_stop_the_server() {
        let (statuses, state, _) = serve(
            b"{\"command\":\"ping\",\"command_id\":\"bad1\" oops\nnot json\n\n{\"command\":\"ping\",\"command_id\":\"p2\"}\n",
        )
        .await;
        assert_eq!(statuses.len(), 2);
        assert!(statuses[0].is_error());
        assert_eq!(statuses[0].in_reply_to.as_deref(), Some("bad1"));
        assert_eq!(statuses[1].in_reply_to.as_deref(), Some("p2"));
        // EOF is an implicit shutdown
        assert!(state.shut_down);
    }

    #[tokio::test]
    async fn test_invalid_transition_gets_error_reply() {
        let (statuses, _, batches) =
            serve(b"{\"command\":\"stop_recording\",\"command_id\":\"c7\"}\n").await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].in_reply_to.as_deref(), Some("c7"));
        assert_eq!(
            statuses[0].data.as_ref().unwrap()["reason"],
            "invalid_transition"
        );
        // only the implicit shutdown produced effects
        assert_eq!(batches.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_command_and_bad_params() {
        let (statuses, _, _) = serve(
            b"{\"command\":\"explode\",\"command_id\":\"u1\"}\n{\"command\":\"start_recording\",\"command_id\":\"u2\"}\n{\"command\":\"explode\"}\n",
        )
        .await;
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(StatusMessage::is_error));
        assert_eq!(statuses[1].in_reply_to.as_deref(), Some("u2"));
    }

    #[tokio::test]
    async fn test_assign_dispatches_probe() {
        let (statuses, state, batches) = serve(
            b"{\"command\":\"assign_device\",\"command_id\":\"c1\",\"device_index\":1}\n{\"command\":\"shutdown\",\"command_id\":\"c2\"}\n{\"command\":\"ping\",\"command_id\":\"late\"}\n",
        )
        .await;
        // replies come from executor effects, which this test does not run
        assert!(statuses.is_empty());
        assert_eq!(state.device_status, DeviceStatus::Idle);
        assert!(state.shut_down);
        assert_eq!(
            batches[0],
            vec![Effect::ProbeDevice {
                device: DeviceRef::new(DeviceKind::Camera, 1),
                assignment: 1
            }]
        );
        let last = batches.last().unwrap();
        assert!(matches!(last.last(), Some(Effect::SendStatus(s)) if s.status == "shutdown"));
    }
}
