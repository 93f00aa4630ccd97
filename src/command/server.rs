//! Control socket
//!
//! Unix-domain socket speaking newline-delimited JSON: one [`Request`] per
//! line in, one [`Response`] per line out. Connections are served
//! concurrently; ordering between them is decided by the controller.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use super::{CommandInterface, Request, Response};

pub struct CommandServer {
    listener: UnixListener,
    path: PathBuf,
    commands: CommandInterface,
}

impl CommandServer {
    /// Bind the socket, replacing a stale socket file left by a dead agent
    pub fn bind(path: &Path, commands: CommandInterface) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create socket directory {:?}", parent))?;
        }

        if path.exists() {
            if std::os::unix::net::UnixStream::connect(path).is_ok() {
                bail!("Another agent is already listening on {:?}", path);
            }
            debug!("Removing stale socket {:?}", path);
            std::fs::remove_file(path)
                .with_context(|| format!("Failed to remove stale socket {:?}", path))?;
        }

        let listener = UnixListener::bind(path)
            .with_context(|| format!("Failed to bind command socket {:?}", path))?;
        info!("Command socket listening on {:?}", path);

        Ok(Self {
            listener,
            path: path.to_path_buf(),
            commands,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until the listener fails
    pub async fn run(&self) -> Result<()> {
        loop {
            let (stream, _) = self
                .listener
                .accept()
                .await
                .context("Command socket accept failed")?;

            let commands = self.commands.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, commands).await {
                    warn!("Command connection ended with error: {:#}", e);
                }
            });
        }
    }
}

impl Drop for CommandServer {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!("Could not remove command socket {:?}: {}", self.path, e);
        }
    }
}

async fn serve_connection(stream: UnixStream, commands: CommandInterface) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = commands.handle_line(line).await;
        let mut payload = serde_json::to_vec(&response)?;
        payload.push(b'\n');
        write.write_all(&payload).await?;
    }

    Ok(())
}

/// Send one request to a running agent and wait for its reply
pub async fn send_request(path: &Path, request: &Request) -> Result<Response> {
    let stream = UnixStream::connect(path)
        .await
        .with_context(|| format!("Failed to connect to {:?}. Is the agent running?", path))?;
    let (read, mut write) = stream.into_split();

    let mut payload = serde_json::to_vec(request)?;
    payload.push(b'\n');
    write.write_all(&payload).await?;

    let line = BufReader::new(read)
        .lines()
        .next_line()
        .await?
        .context("Agent closed the connection without replying")?;
    serde_json::from_str(&line).context("Agent sent an invalid response")
}
