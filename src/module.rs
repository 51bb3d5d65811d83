//! One device module: status writer, store, executor and command server
//! wired together over a command stream and a status stream.

use crate::config::RecorderConfig;
use crate::controller::{spawn_store, DeviceState};
use crate::core::{DeviceKind, Settings};
use crate::device::DeviceDriver;
use crate::error::{AppResult, RecorderError};
use crate::executor::{EffectExecutor, ExecutorConfig};
use crate::protocol::{CommandServer, StatusWriter};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// A per-device module process body.
pub struct DeviceModule {
    kind: DeviceKind,
    driver: Arc<dyn DeviceDriver>,
    config: RecorderConfig,
    settings: Settings,
}

async fn finish<T>(name: &str, mut task: JoinHandle<T>, timeout: Duration) -> AppResult<T> {
    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            error!(task = name, error = %e, "Task failed");
            Err(RecorderError::TaskFailed {
                task: name.to_string(),
                reason: e.to_string(),
            })
        }
        Err(_) => {
            warn!(task = name, timeout_ms = timeout.as_millis() as u64, "Task did not stop in time, aborting");
            task.abort();
            Err(RecorderError::TaskFailed {
                task: name.to_string(),
                reason: format!("still running after {:?}", timeout),
            })
        }
    }
}

impl DeviceModule {
    /// Module for devices of `kind`.
    pub fn new(kind: DeviceKind, driver: Arc<dyn DeviceDriver>, config: RecorderConfig) -> Self {
        Self {
            kind,
            driver,
            config,
            settings: Settings::default(),
        }
    }

    /// Settings in effect before the first `apply_settings`.
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Serve commands from `reader`, write statuses to `writer`.
    ///
    /// Returns after a shutdown command or EOF, once the shutdown sequence has
    /// completed or `module.shutdown_timeout` expired. Tasks that failed or
    /// had to be aborted are reported together as `ShutdownFailed`.
    pub async fn run<R, W>(self, reader: R, writer: W) -> AppResult<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let shutdown_timeout = self.config.module.shutdown_timeout;
        info!(kind = %self.kind, "Device module starting");

        let (status, writer_task) = StatusWriter::spawn(writer);
        let (store, effects, store_task) = spawn_store(
            DeviceState::with_settings(self.settings),
            self.config.module.action_channel_capacity,
        );
        let executor_task = EffectExecutor::new(
            self.driver,
            store.clone(),
            status.clone(),
            ExecutorConfig::from_recorder_config(&self.config),
        )
        .spawn(effects);

        let server = CommandServer::new(store.clone(), status, self.kind);
        let served = server.run(reader).await;
        if let Err(e) = &served {
            error!(error = %e, "Command server stopped with an error");
        }
        drop(server);
        drop(store);

        let failures: Vec<RecorderError> = [
            finish("executor", executor_task, shutdown_timeout).await.err(),
            finish("store", store_task, shutdown_timeout).await.err(),
            finish("status writer", writer_task, shutdown_timeout)
                .await
                .map(drop)
                .err(),
        ]
        .into_iter()
        .flatten()
        .collect();

        info!(kind = %self.kind, "Device module stopped");
        served?;
        if failures.is_empty() {
            Ok(())
        } else {
            Err(RecorderError::ShutdownFailed(failures))
        }
    }
}
