//! Worker/UI bridge.
//!
//! The bridge owns every managed kernel and spawns one worker task per
//! run. Workers push tagged events onto a single unbounded queue the UI
//! side drains at its own pace; answers travel the other way through a
//! one-slot queue per run. Nothing a worker hits crosses the bridge as a
//! panic or error value, only as events.
//!
//! While a run is active its kernel's client is checked out of the slot,
//! which is what makes a second concurrent run on the same kernel
//! impossible rather than merely discouraged.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::client::ChannelClient;
use crate::error::{RunError, StartKernelError};
use crate::events::BridgeEvent;
use crate::manager::KernelProcess;
use crate::session::{run_session, SessionIo, SessionTimeouts};

struct ManagedKernel {
    process: KernelProcess,
    /// `None` while a worker has the client checked out.
    client: Option<ChannelClient>,
}

struct RunHandle {
    kernel_id: String,
    answer_tx: mpsc::Sender<String>,
    input_pending: Arc<AtomicBool>,
}

pub struct ExecutionBridge {
    events_tx: mpsc::UnboundedSender<BridgeEvent>,
    kernels: Arc<tokio::sync::Mutex<HashMap<String, ManagedKernel>>>,
    runs: Arc<std::sync::Mutex<HashMap<String, RunHandle>>>,
    timeouts: SessionTimeouts,
}

impl ExecutionBridge {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BridgeEvent>) {
        Self::with_timeouts(SessionTimeouts::default())
    }

    pub fn with_timeouts(
        timeouts: SessionTimeouts,
    ) -> (Self, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let bridge = Self {
            events_tx,
            kernels: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            runs: Arc::new(std::sync::Mutex::new(HashMap::new())),
            timeouts,
        };
        (bridge, events_rx)
    }

    /// Launch a kernel and connect to it. Returns its id once the kernel
    /// has answered the startup probe.
    ///
    /// A kernel that never answers is shut down again before the error is
    /// returned, so no orphan process survives a failed start.
    pub async fn start_kernel(
        &self,
        spec_name: &str,
        startup_timeout: Duration,
    ) -> Result<String, StartKernelError> {
        let mut process = KernelProcess::start(spec_name).await?;
        let client = match ChannelClient::connect(process.connection_info(), startup_timeout).await
        {
            Ok(client) => client,
            Err(e) => {
                let _ = process.shutdown(true).await;
                return Err(e.into());
            }
        };

        let kernel_id = process.kernel_id().to_string();
        self.kernels.lock().await.insert(
            kernel_id.clone(),
            ManagedKernel {
                process,
                client: Some(client),
            },
        );
        info!("[bridge] kernel {} ready", kernel_id);
        Ok(kernel_id)
    }

    /// Start one execution on a kernel; returns the run id its events will
    /// carry. Fails fast if the kernel is unknown or already running code.
    pub async fn run(&self, kernel_id: &str, code: &str) -> Result<String, RunError> {
        let mut kernels = self.kernels.lock().await;
        let kernel = kernels
            .get_mut(kernel_id)
            .ok_or_else(|| RunError::UnknownKernel(kernel_id.to_string()))?;
        let mut client = kernel
            .client
            .take()
            .ok_or_else(|| RunError::KernelBusy(kernel_id.to_string()))?;
        drop(kernels);

        let run_id = Uuid::new_v4().to_string();
        let (answer_tx, answers) = mpsc::channel(1);
        let input_pending = Arc::new(AtomicBool::new(false));
        self.runs.lock().unwrap().insert(
            run_id.clone(),
            RunHandle {
                kernel_id: kernel_id.to_string(),
                answer_tx,
                input_pending: input_pending.clone(),
            },
        );

        let mut io = SessionIo {
            run_id: run_id.clone(),
            events: self.events_tx.clone(),
            answers,
            input_pending,
        };
        let kernels = self.kernels.clone();
        let runs = self.runs.clone();
        let kernel_id = kernel_id.to_string();
        let code = code.to_string();
        let timeouts = self.timeouts.clone();

        tokio::spawn(async move {
            let success = run_session(&mut client, &code, &timeouts, &mut io).await;
            debug!("[bridge] run {} finished, success={}", io.run_id, success);
            // Hand the client back; if the kernel was shut down mid-run the
            // client has nowhere to go and is dropped here.
            if let Some(kernel) = kernels.lock().await.get_mut(&kernel_id) {
                kernel.client = Some(client);
            }
            runs.lock().unwrap().remove(&io.run_id);
        });

        Ok(run_id)
    }

    /// Deliver the user's answer to a run waiting on an input request.
    pub fn answer_input(&self, run_id: &str, text: &str) -> Result<(), RunError> {
        let runs = self.runs.lock().unwrap();
        let run = runs
            .get(run_id)
            .ok_or_else(|| RunError::UnknownRun(run_id.to_string()))?;
        if !run.input_pending.load(Ordering::SeqCst) {
            return Err(RunError::NoInputPending(run_id.to_string()));
        }
        debug!(
            "[bridge] answering input for run {} on kernel {}",
            run_id, run.kernel_id
        );
        match run.answer_tx.try_send(text.to_string()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(RunError::AnswerQueued(run_id.to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(RunError::UnknownRun(run_id.to_string()))
            }
        }
    }

    /// Interrupt whatever the kernel is executing. The active run, if any,
    /// winds down through its own event stream.
    pub async fn interrupt(&self, kernel_id: &str) -> Result<(), RunError> {
        let kernels = self.kernels.lock().await;
        let kernel = kernels
            .get(kernel_id)
            .ok_or_else(|| RunError::UnknownKernel(kernel_id.to_string()))?;
        kernel.process.interrupt().await?;
        Ok(())
    }

    /// Stop a kernel and forget it. Unknown ids are a no-op.
    pub async fn shutdown(&self, kernel_id: &str, immediate: bool) -> Result<(), RunError> {
        let removed = self.kernels.lock().await.remove(kernel_id);
        match removed {
            Some(mut kernel) => {
                if let Some(mut client) = kernel.client.take() {
                    client.disconnect();
                }
                kernel.process.shutdown(immediate).await?;
                info!("[bridge] kernel {} shut down", kernel_id);
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub async fn is_alive(&self, kernel_id: &str) -> bool {
        match self.kernels.lock().await.get_mut(kernel_id) {
            Some(kernel) => kernel.process.is_alive(),
            None => false,
        }
    }

    pub async fn connection_file(&self, kernel_id: &str) -> Option<PathBuf> {
        self.kernels
            .lock()
            .await
            .get(kernel_id)
            .map(|kernel| kernel.process.connection_file().to_path_buf())
    }
}

#[cfg(test)]
impl ExecutionBridge {
    pub(crate) async fn adopt_for_tests(
        &self,
        kernel_id: &str,
        process: KernelProcess,
        client: ChannelClient,
    ) {
        self.kernels.lock().await.insert(
            kernel_id.to_string(),
            ManagedKernel {
                process,
                client: Some(client),
            },
        );
    }
}
