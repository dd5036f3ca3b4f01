use std::net::IpAddr;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::db::entities::prelude::SsManagerModel;

/// The `ssserver` process of a python-edition manager running on this host.
pub struct LocalServer {
    bin: String,
    manager: SsManagerModel,
    ip: IpAddr,
}

impl LocalServer {
    pub fn new(bin: impl Into<String>, manager: SsManagerModel, ip: IpAddr) -> Self {
        Self {
            bin: bin.into(),
            manager,
            ip,
        }
    }

    pub fn pidfile(port: u16) -> String {
        format!("/tmp/shadowsocks-{port}.pid")
    }

    pub fn logfile(port: u16) -> String {
        format!("/tmp/shadowsocks-{port}.log")
    }

    pub fn start_args(&self) -> Vec<String> {
        let port = self.manager.port;
        vec![
            "--pid-file".to_string(),
            Self::pidfile(port),
            "--log-file".to_string(),
            Self::logfile(port),
            "-d".to_string(),
            "start".to_string(),
            // the options order matters
            "--manager-address".to_string(),
            format!("{}:{}", self.ip, port),
            "-k".to_string(),
            "passw0rd".to_string(),
            "-m".to_string(),
            self.manager.encrypt.clone(),
            "-t".to_string(),
            self.manager.timeout.to_string(),
            "--fast-open".to_string(),
            if self.manager.fastopen { "True" } else { "False" }.to_string(),
        ]
    }

    /// `port` is the manager port the running process was started with.
    pub fn stop_args(port: u16) -> Vec<String> {
        vec![
            "--pid-file".to_string(),
            Self::pidfile(port),
            "--log-file".to_string(),
            Self::logfile(port),
            "-d".to_string(),
            "stop".to_string(),
        ]
    }

    pub async fn start(&self) -> bool {
        info!(manager_port = self.manager.port, "Starting local server.");
        run(&self.bin, &self.start_args()).await
    }

    pub async fn stop(&self, port: u16) -> bool {
        info!(manager_port = port, "Stopping local server.");
        run(&self.bin, &Self::stop_args(port)).await
    }

    pub async fn restart(&self, previous_port: u16) -> bool {
        self.stop(previous_port).await;
        self.start().await
    }
}

/// Exit codes and stderr are logged, never raised.
async fn run(bin: &str, args: &[String]) -> bool {
    match Command::new(bin).args(args).output().await {
        Ok(output) if output.status.success() => {
            debug!(bin = bin, stdout = %String::from_utf8_lossy(&output.stdout), "Command succeeded.");
            true
        }
        Ok(output) => {
            error!(
                bin = bin,
                rc = output.status.code().unwrap_or(-1),
                stderr = %String::from_utf8_lossy(&output.stderr),
                stdout = %String::from_utf8_lossy(&output.stdout),
                "Command failed."
            );
            false
        }
        Err(e) => {
            error!(bin = bin, error = %e, "Failed to run command.");
            false
        }
    }
}
