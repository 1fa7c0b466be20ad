//! Kernel process lifecycle.
//!
//! A `KernelProcess` owns one launched kernel: its connection file on disk,
//! the child process and, on Unix, the process group that catches
//! grandchildren a kernel may fork. Interrupt and shutdown requests go over
//! short-lived control connections so the process side never competes with
//! a client for channel state.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::Result;
use jupyter_protocol::{
    ConnectionInfo, InterruptRequest, JupyterMessage, JupyterMessageContent, KernelInfoRequest,
    ShutdownRequest,
};
use log::{info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::error::KernelStartError;

/// Connection files written by this crate are named
/// `<prefix><kernel-id>.json` inside the Jupyter runtime directory.
pub const CONNECTION_FILE_PREFIX: &str = "benchrun-kernel-";

pub struct KernelProcess {
    kernel_id: String,
    connection_info: ConnectionInfo,
    connection_file: PathBuf,
    process: Option<tokio::process::Child>,
    #[cfg(unix)]
    process_group_id: Option<i32>,
}

impl KernelProcess {
    /// Launch a kernel from an installed kernelspec.
    ///
    /// Reserves five ports, writes the connection file, then spawns the
    /// kernel in its own process group with stdout and stderr discarded.
    pub async fn start(spec_name: &str) -> Result<Self, KernelStartError> {
        let ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let ports = runtimelib::peek_ports(ip, 5)
            .await
            .map_err(anyhow::Error::from)?;

        let connection_info = ConnectionInfo {
            transport: jupyter_protocol::connection_info::Transport::TCP,
            ip: ip.to_string(),
            stdin_port: ports[0],
            control_port: ports[1],
            hb_port: ports[2],
            shell_port: ports[3],
            iopub_port: ports[4],
            signature_scheme: "hmac-sha256".to_string(),
            key: Uuid::new_v4().to_string(),
            kernel_name: Some(spec_name.to_string()),
        };

        let runtime_dir = runtimelib::dirs::runtime_dir();
        tokio::fs::create_dir_all(&runtime_dir).await?;

        let kernel_id: String =
            petname::petname(2, "-").unwrap_or_else(|| Uuid::new_v4().to_string());
        let connection_file = runtime_dir.join(format!("{}{}.json", CONNECTION_FILE_PREFIX, kernel_id));

        tokio::fs::write(
            &connection_file,
            serde_json::to_string_pretty(&connection_info)?,
        )
        .await?;

        let kernelspec = runtimelib::find_kernelspec(spec_name)
            .await
            .map_err(|_| KernelStartError::SpecNotFound(spec_name.to_string()))?;
        let mut cmd = kernelspec
            .command(&connection_file, Some(Stdio::null()), Some(Stdio::null()))
            .map_err(anyhow::Error::from)?;

        #[cfg(unix)]
        cmd.process_group(0);

        let process = cmd.kill_on_drop(true).spawn()?;

        #[cfg(unix)]
        let process_group_id = process.id().map(|pid| pid as i32);

        info!(
            "[kernel] started {} ({}) with pid {:?}",
            kernel_id,
            spec_name,
            process.id()
        );

        // Give the kernel a moment to bind its sockets.
        tokio::time::sleep(Duration::from_millis(500)).await;

        Ok(Self {
            kernel_id,
            connection_info,
            connection_file,
            process: Some(process),
            #[cfg(unix)]
            process_group_id,
        })
    }

    pub fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.connection_info
    }

    pub fn connection_file(&self) -> &Path {
        &self.connection_file
    }

    /// True while the child has neither exited nor been shut down.
    pub fn is_alive(&mut self) -> bool {
        match self.process.as_mut() {
            Some(process) => matches!(process.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Ask the kernel to interrupt whatever it is executing.
    pub async fn interrupt(&self) -> Result<()> {
        let session_id = Uuid::new_v4().to_string();
        let mut control =
            runtimelib::create_client_control_connection(&self.connection_info, &session_id)
                .await?;
        let request: JupyterMessage = InterruptRequest {}.into();
        control.send(request).await?;
        info!("[kernel] sent interrupt to {}", self.kernel_id);
        Ok(())
    }

    /// Stop the kernel and remove its connection file. Idempotent.
    ///
    /// Unless `immediate`, a shutdown_request goes out first and the child
    /// gets five seconds to exit on its own. Either way the process group
    /// is killed afterwards, which takes any subprocesses with it.
    pub async fn shutdown(&mut self, immediate: bool) -> Result<()> {
        if self.process.is_none() {
            return Ok(());
        }

        if !immediate {
            let session_id = Uuid::new_v4().to_string();
            match runtimelib::create_client_control_connection(&self.connection_info, &session_id)
                .await
            {
                Ok(mut control) => {
                    let request: JupyterMessage = ShutdownRequest { restart: false }.into();
                    if let Err(e) = control.send(request).await {
                        warn!("[kernel] shutdown_request to {} failed: {}", self.kernel_id, e);
                    }
                }
                Err(e) => warn!(
                    "[kernel] control connect to {} failed: {}",
                    self.kernel_id, e
                ),
            }

            if let Some(process) = self.process.as_mut() {
                match tokio::time::timeout(Duration::from_secs(5), process.wait()).await {
                    Ok(Ok(status)) => {
                        info!("[kernel] {} exited with {}", self.kernel_id, status)
                    }
                    Ok(Err(e)) => warn!("[kernel] wait on {} failed: {}", self.kernel_id, e),
                    Err(_) => warn!(
                        "[kernel] {} did not exit after shutdown_request",
                        self.kernel_id
                    ),
                }
            }
        }

        #[cfg(unix)]
        if let Some(pgid) = self.process_group_id.take() {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                if e != nix::errno::Errno::ESRCH {
                    warn!("[kernel] failed to kill process group {}: {}", pgid, e);
                }
            }
        }

        self.process = None;
        let _ = std::fs::remove_file(&self.connection_file);
        info!("[kernel] {} shut down", self.kernel_id);
        Ok(())
    }
}

#[cfg(test)]
impl KernelProcess {
    pub(crate) fn for_tests(
        process: tokio::process::Child,
        connection_file: PathBuf,
        connection_info: ConnectionInfo,
    ) -> Self {
        Self {
            kernel_id: "test-kernel".to_string(),
            connection_info,
            connection_file,
            process: Some(process),
            #[cfg(unix)]
            process_group_id: None,
        }
    }
}

impl Drop for KernelProcess {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.process_group_id.take() {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
        }

        if self.process.take().is_some() {
            let _ = std::fs::remove_file(&self.connection_file);
            info!("[kernel] {} dropped, resources cleaned up", self.kernel_id);
        }
    }
}

/// One installed kernelspec, as listed for spec discovery.
#[derive(Debug, Clone, Serialize)]
pub struct KernelspecSummary {
    pub name: String,
    pub display_name: String,
    pub language: String,
}

pub async fn list_specs() -> Vec<KernelspecSummary> {
    runtimelib::list_kernelspecs()
        .await
        .into_iter()
        .map(|spec| KernelspecSummary {
            name: spec.kernel_name,
            display_name: spec.kernelspec.display_name,
            language: spec.kernelspec.language,
        })
        .collect()
}

/// One heartbeat within `timeout` counts as alive.
pub async fn check_kernel_alive(info: &ConnectionInfo, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, async {
            let mut hb = runtimelib::create_client_heartbeat_connection(info).await?;
            hb.single_heartbeat().await
        })
        .await,
        Ok(Ok(()))
    )
}

/// Language name and version of the kernel behind `info`, if it answers.
pub async fn probe_kernel_info(
    info: &ConnectionInfo,
    timeout: Duration,
) -> Option<(String, String)> {
    let session_id = Uuid::new_v4().to_string();
    let result = tokio::time::timeout(timeout, async {
        let identity = runtimelib::peer_identity_for_session(&session_id)?;
        let mut shell = runtimelib::create_client_shell_connection_with_identity(
            info,
            &session_id,
            identity,
        )
        .await?;
        let request: JupyterMessage = KernelInfoRequest::default().into();
        shell.send(request).await?;
        loop {
            let reply = shell.read().await?;
            if let JupyterMessageContent::KernelInfoReply(reply) = reply.content {
                return Ok::<_, anyhow::Error>((
                    reply.language_info.name,
                    reply.language_info.version,
                ));
            }
        }
    })
    .await;
    match result {
        Ok(Ok(pair)) => Some(pair),
        _ => None,
    }
}

/// Interrupt a kernel known only by its connection info.
pub async fn interrupt_kernel(info: &ConnectionInfo) -> Result<()> {
    let session_id = Uuid::new_v4().to_string();
    let mut control = runtimelib::create_client_control_connection(info, &session_id).await?;
    let request: JupyterMessage = InterruptRequest {}.into();
    control.send(request).await?;
    Ok(())
}

/// Ask a kernel known only by its connection info to shut down.
pub async fn shutdown_kernel(info: &ConnectionInfo) -> Result<()> {
    let session_id = Uuid::new_v4().to_string();
    let mut control = runtimelib::create_client_control_connection(info, &session_id).await?;
    let request: JupyterMessage = ShutdownRequest { restart: false }.into();
    control.send(request).await?;
    Ok(())
}

pub async fn read_connection_info(path: &Path) -> Result<ConnectionInfo> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{dummy_connection_info, sleeper_process};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (mut kernel, _dir) = sleeper_process();
        let path = kernel.connection_file().to_path_buf();
        assert!(kernel.is_alive());

        kernel.shutdown(true).await.unwrap();
        assert!(!kernel.is_alive());
        assert!(!path.exists());

        // A second shutdown finds nothing to do.
        kernel.shutdown(true).await.unwrap();
        assert!(!kernel.is_alive());
    }

    #[tokio::test]
    async fn test_drop_removes_connection_file() {
        let (kernel, _dir) = sleeper_process();
        let path = kernel.connection_file().to_path_buf();
        drop(kernel);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_connection_info_roundtrips_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("benchrun-kernel-io.json");
        let info = dummy_connection_info();
        tokio::fs::write(&path, serde_json::to_string_pretty(&info).unwrap())
            .await
            .unwrap();

        let read = read_connection_info(&path).await.unwrap();
        assert_eq!(read.ip, "127.0.0.1");
        assert_eq!(read.signature_scheme, "hmac-sha256");
        assert_eq!(read.kernel_name.as_deref(), Some("python3"));
    }

    #[tokio::test]
    async fn test_dead_endpoint_is_not_alive() {
        // Port 1 on localhost has no heartbeat listener.
        let mut info = dummy_connection_info();
        info.hb_port = 1;
        assert!(!check_kernel_alive(&info, Duration::from_millis(200)).await);
    }
}
