//! Master orchestrator: one subprocess per device module.
//!
//! Each module is spoken to over its piped stdin (commands) and stdout
//! (statuses). The two directions are independent: a reader task per module
//! routes replies by `in_reply_to` to the caller waiting on them and forwards
//! every unsolicited status to a shared event channel.

use crate::config::{MasterConfig, ModuleSpec};
use crate::protocol::{decode_status, encode_line, CommandMessage, StatusMessage};
use anyhow::{anyhow, bail, Context, Result};
use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<StatusMessage>>>>;

/// A status a module pushed without being asked (or a late reply).
#[derive(Clone, Debug, PartialEq)]
pub struct ModuleEvent {
    /// Module name
    pub module: String,
    /// The status line
    pub status: StatusMessage,
}

/// How a module process ended.
#[derive(Debug)]
pub enum ExitOutcome {
    /// Exited on its own within the grace period
    Exited(ExitStatus),
    /// Had to be killed
    Killed,
    /// Could not be waited on or killed
    Failed(String),
}

struct ModuleProcess {
    name: String,
    child: Child,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    pending: PendingMap,
    reader: JoinHandle<()>,
}

impl ModuleProcess {
    async fn write(&self, command: &CommandMessage) -> Result<()> {
        let line = encode_line(command)?;
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| anyhow!("module '{}' input is closed", self.name))?;
        stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("Failed to write to module '{}'", self.name))?;
        stdin.flush().await?;
        Ok(())
    }

    fn forget(&self, id: &str) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }
}

fn spawn_reader(
    name: String,
    stdout: ChildStdout,
    pending: PendingMap,
    events: mpsc::UnboundedSender<ModuleEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!(module = %name, error = %e, "Status stream failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let status = match decode_status(&line) {
                Ok(status) => status,
                Err(e) => {
                    warn!(module = %name, error = %e, line = %line, "Ignoring malformed status");
                    continue;
                }
            };

            let waiter = status.in_reply_to.as_ref().and_then(|id| {
                pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(id)
            });
            match waiter {
                Some(tx) => {
                    let _ = tx.send(status);
                }
                None => {
                    debug!(module = %name, status = %status.status, "Unsolicited status");
                    let _ = events.send(ModuleEvent {
                        module: name.clone(),
                        status,
                    });
                }
            }
        }

        // wake everyone still waiting; their senders are dropped here
        pending.lock().unwrap_or_else(PoisonError::into_inner).clear();
        debug!(module = %name, "Status reader finished");
    })
}

/// Launches modules and talks to them.
pub struct Master {
    modules: Vec<ModuleProcess>,
    events_tx: mpsc::UnboundedSender<ModuleEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<ModuleEvent>>,
    reply_timeout: Duration,
}

impl Master {
    /// Master waiting at most `reply_timeout` for each reply.
    pub fn new(reply_timeout: Duration) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            modules: Vec::new(),
            events_tx,
            events_rx: Some(events_rx),
            reply_timeout,
        }
    }

    /// Master configured from `[master]`.
    pub fn from_config(config: &MasterConfig) -> Self {
        Self::new(config.reply_timeout)
    }

    /// Receiver of unsolicited statuses from every module. Available once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ModuleEvent>> {
        self.events_rx.take()
    }

    /// Names of the launched modules, in launch order.
    pub fn module_names(&self) -> Vec<String> {
        self.modules.iter().map(|m| m.name.clone()).collect()
    }

    /// Launch the module described by `spec`.
    pub fn launch(&mut self, spec: &ModuleSpec) -> Result<()> {
        let mut command = Command::new(&spec.program);
        command.args(&spec.args);
        self.spawn_module(&spec.name, command)
    }

    /// Launch an arbitrary command as module `name`, with piped stdin/stdout.
    pub fn spawn_module(&mut self, name: &str, mut command: Command) -> Result<()> {
        if self.modules.iter().any(|m| m.name == name) {
            bail!("module '{}' is already running", name);
        }

        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to launch module '{}'", name))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("module '{}' has no stdin", name))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("module '{}' has no stdout", name))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader = spawn_reader(name.to_string(), stdout, pending.clone(), self.events_tx.clone());

        info!(module = name, pid = ?child.id(), "Module launched");
        self.modules.push(ModuleProcess {
            name: name.to_string(),
            child,
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            pending,
            reader,
        });
        Ok(())
    }

    fn module(&self, name: &str) -> Result<&ModuleProcess> {
        self.modules
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| anyhow!("unknown module '{}'", name))
    }

    /// Send `command` with a fresh id and wait for its reply.
    pub async fn send(&self, module: &str, command: CommandMessage) -> Result<StatusMessage> {
        let process = self.module(module)?;
        let id = Uuid::new_v4().to_string();
        let command = command.with_id(id.clone());

        let (tx, rx) = oneshot::channel();
        process
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), tx);

        if let Err(e) = process.write(&command).await {
            process.forget(&id);
            return Err(e);
        }
        debug!(module, command = %command.command, command_id = %id, "Sent command");

        match tokio::time::timeout(self.reply_timeout, rx).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(_)) => bail!(
                "module '{}' closed its output before answering '{}'",
                module,
                command.command
            ),
            Err(_) => {
                process.forget(&id);
                bail!(
                    "module '{}' did not answer '{}' within {:?}",
                    module,
                    command.command,
                    self.reply_timeout
                )
            }
        }
    }

    /// Send `command` without an id; no reply is expected.
    pub async fn notify(&self, module: &str, command: CommandMessage) -> Result<()> {
        let mut command = command;
        command.command_id = None;
        self.module(module)?.write(&command).await
    }

    /// Send `command` to every module concurrently and collect the replies.
    pub async fn broadcast(&self, command: CommandMessage) -> Vec<(String, Result<StatusMessage>)> {
        let sends = self.modules.iter().map(|m| {
            let command = command.clone();
            async move { (m.name.clone(), self.send(&m.name, command).await) }
        });
        futures::future::join_all(sends).await
    }

    /// Ask every module to shut down, wait up to `grace` for each to exit,
    /// then kill the ones still running.
    pub async fn shutdown(&mut self, grace: Duration) -> Vec<(String, ExitOutcome)> {
        for module in &self.modules {
            let request = CommandMessage::new("shutdown").with_id(Uuid::new_v4().to_string());
            if let Err(e) = module.write(&request).await {
                debug!(module = %module.name, error = %e, "Shutdown request not delivered");
            }
            // EOF is an implicit shutdown for modules that missed the command
            module.stdin.lock().await.take();
        }

        let mut outcomes = Vec::new();
        for mut module in self.modules.drain(..) {
            let outcome = match tokio::time::timeout(grace, module.child.wait()).await {
                Ok(Ok(status)) => {
                    info!(module = %module.name, %status, "Module exited");
                    ExitOutcome::Exited(status)
                }
                Ok(Err(e)) => ExitOutcome::Failed(e.to_string()),
                Err(_) => {
                    warn!(
                        module = %module.name,
                        grace_ms = grace.as_millis() as u64,
                        "Module ignored shutdown, killing it"
                    );
                    match module.child.kill().await {
                        Ok(()) => ExitOutcome::Killed,
                        Err(e) => ExitOutcome::Failed(e.to_string()),
                    }
                }
            };

            if tokio::time::timeout(Duration::from_secs(1), &mut module.reader)
                .await
                .is_err()
            {
                module.reader.abort();
            }
            outcomes.push((module.name, outcome));
        }
        outcomes
    }
}
