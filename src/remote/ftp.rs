use async_trait::async_trait;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, UNIX_EPOCH};
use suppaftp::list::File;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Mode, Status};
use tracing::{debug, info, warn};

use super::{Listing, RemoteDirectory, RemoteError};
use crate::config::FtpConfig;
use crate::model::RemoteFileEntry;

/// FTP-backed [`RemoteDirectory`].
///
/// Holds one control session that is opened on first use and reused by every
/// later call. A session that fails with anything other than "file
/// unavailable", or that does not answer within `fetch_timeout_ms`, is
/// dropped and the next call opens a new one. Control-socket reads and
/// writes carry the same timeout.
#[derive(Clone)]
pub struct FtpDirectory {
    config: FtpConfig,
    session: Arc<Mutex<Option<FtpStream>>>,
}

impl fmt::Debug for FtpDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FtpDirectory")
            .field("server", &self.config.server)
            .field("port", &self.config.port)
            .finish_non_exhaustive()
    }
}

impl FtpDirectory {
    pub fn from_config(config: &FtpConfig) -> Self {
        Self {
            config: config.clone(),
            session: Arc::new(Mutex::new(None)),
        }
    }

    /// Run `op` on the shared session, opening one if none is parked.
    ///
    /// The session is taken out of the slot for the duration of the call and
    /// only put back after success or "file unavailable", so a call that
    /// stalls or times out never blocks the next one: that call connects
    /// afresh.
    async fn with_session<T, F>(
        &self,
        target: String,
        timeout: Duration,
        op: F,
    ) -> Result<T, RemoteError>
    where
        F: FnOnce(&mut FtpStream) -> Result<T, FtpError> + Send + 'static,
        T: Send + 'static,
    {
        let session = Arc::clone(&self.session);
        let config = self.config.clone();
        let task = tokio::task::spawn_blocking(move || {
            let parked = take_session(&session)?;
            let mut stream = match parked {
                Some(stream) => stream,
                None => connect(&config).map_err(|e| map_ftp_error(e, &target))?,
            };
            match op(&mut stream) {
                Ok(value) => {
                    park_session(&session, stream);
                    Ok(value)
                }
                Err(err) => {
                    let mapped = map_ftp_error(err, &target);
                    if matches!(mapped, RemoteError::NotFound(_)) {
                        park_session(&session, stream);
                    } else {
                        warn!(error=%mapped, "dropping ftp session");
                    }
                    Err(mapped)
                }
            }
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(RemoteError::Io(format!("ftp task failed: {}", join))),
            Err(_) => {
                warn!(?timeout, "ftp call timed out; abandoning its session");
                Err(RemoteError::Timeout(timeout))
            }
        }
    }
}

fn take_session(slot: &Mutex<Option<FtpStream>>) -> Result<Option<FtpStream>, RemoteError> {
    slot.lock()
        .map(|mut guard| guard.take())
        .map_err(|_| RemoteError::Io("ftp session lock poisoned".into()))
}

// A session returned while another call already parked one is closed.
fn park_session(slot: &Mutex<Option<FtpStream>>, stream: FtpStream) {
    if let Ok(mut guard) = slot.lock() {
        if guard.is_none() {
            *guard = Some(stream);
        }
    }
}

#[async_trait]
impl RemoteDirectory for FtpDirectory {
    async fn list(&self, folder: &str) -> Result<Listing, RemoteError> {
        let path = folder.to_string();
        let lines = self
            .with_session(path.clone(), self.config.fetch_timeout(), move |ftp| {
                ftp.list(if path.is_empty() { None } else { Some(path.as_str()) })
            })
            .await?;
        debug!(folder, lines = lines.len(), "listed remote folder");
        Ok(Listing::new(lines.into_iter().filter_map(parse_list_line)))
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>, RemoteError> {
        info!(path, "downloading remote file");
        let target = path.to_string();
        let buffer = self
            .with_session(target.clone(), self.config.fetch_timeout(), move |ftp| {
                ftp.retr_as_buffer(&target)
            })
            .await?;
        Ok(buffer.into_inner())
    }
}

fn connect(config: &FtpConfig) -> Result<FtpStream, FtpError> {
    let addr = resolve(&config.server, config.port).map_err(FtpError::ConnectionError)?;
    info!(server=%config.server, port=config.port, "connecting to ftp server");
    let mut ftp = FtpStream::connect_timeout(addr, config.connect_timeout())?;
    // a stalled server fails the command instead of hanging the thread
    let control = ftp.get_ref();
    control
        .set_read_timeout(Some(config.fetch_timeout()))
        .map_err(FtpError::ConnectionError)?;
    control
        .set_write_timeout(Some(config.fetch_timeout()))
        .map_err(FtpError::ConnectionError)?;
    let user = config.username.as_deref().unwrap_or("anonymous");
    let password = config.password.as_deref().unwrap_or("");
    ftp.login(user, password)?;
    ftp.set_mode(Mode::Passive);
    ftp.transfer_type(FileType::Binary)?;
    Ok(ftp)
}

fn resolve(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no address found for {}:{}", host, port),
        )
    })
}

fn map_ftp_error(err: FtpError, target: &str) -> RemoteError {
    match err {
        FtpError::UnexpectedResponse(resp) if matches!(resp.status, Status::FileUnavailable) => {
            RemoteError::NotFound(target.to_string())
        }
        other => RemoteError::Io(format!("{} ({})", other, target)),
    }
}

/// Parse one raw `LIST` line. Lines that are not entries (e.g. `total 8`)
/// yield `None`.
pub fn parse_list_line(line: String) -> Option<RemoteFileEntry> {
    match File::from_str(&line) {
        Ok(file) => Some(RemoteFileEntry {
            name: file.name().to_string(),
            size: file.size() as u64,
            is_file: file.is_file(),
            timestamp_ms: file
                .modified()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0),
        }),
        Err(err) => {
            debug!(?err, line = %line, "skipping unparsable listing line");
            None
        }
    }
}
