//! libssh2-backed sessions

use async_trait::async_trait;
use crate::{
    remote_join, CommandHandle, ConnectionInfo, Connector, Credentials, Endpoint, ExecResult,
    OutputLine, RemoteSession, TransportError, TransportType,
};
use ssh2::{Channel, OpenFlags, OpenType, Session};
use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Pause between command polls that found no output
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Opens [`Ssh2Session`]s
#[derive(Debug, Clone)]
pub struct Ssh2Connector {
    /// TCP connect and handshake timeout, also the limit for any single blocking call
    connect_timeout: Duration,
}

impl Ssh2Connector {
    /// Create a connector with the given connect timeout
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for Ssh2Connector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl Connector for Ssh2Connector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<Arc<dyn RemoteSession>, TransportError> {
        let session =
            Ssh2Session::connect(endpoint.clone(), credentials.clone(), self.connect_timeout).await?;
        Ok(Arc::new(session))
    }
}

/// One libssh2 session plus the lock that keeps its blocking mode consistent
#[derive(Clone)]
struct Link {
    session: Session,
    io: Arc<Mutex<()>>,
}

impl Link {
    fn new(session: Session) -> Self {
        Self {
            session,
            io: Arc::default(),
        }
    }

    /// Run blocking libssh2 calls with the session to ourselves
    fn exclusive<T>(&self, op: impl FnOnce(&Session) -> Result<T, TransportError>) -> Result<T, TransportError> {
        let _io = self.io.lock().unwrap_or_else(PoisonError::into_inner);
        op(&self.session)
    }

    /// Run calls that must not block; they see `WouldBlock` instead of waiting
    fn nonblocking<T>(&self, op: impl FnOnce() -> Result<T, TransportError>) -> Result<T, TransportError> {
        let _io = self.io.lock().unwrap_or_else(PoisonError::into_inner);
        self.session.set_blocking(false);
        let result = op();
        self.session.set_blocking(true);
        result
    }

    fn disconnect(&self, reason: &str) -> Result<(), TransportError> {
        self.exclusive(|session| Ok(session.disconnect(None, reason, None)?))
    }
}

/// Raised once the future waiting on a blocking call is dropped
#[derive(Debug, Default)]
struct Abandoned(Arc<AtomicBool>);

impl Abandoned {
    fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

impl Drop for Abandoned {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Run `op` on the blocking pool; the flag it gets is set if the caller stops waiting
async fn offload<F, T>(op: F) -> Result<T, TransportError>
where
    F: FnOnce(&AtomicBool) -> Result<T, TransportError> + Send + 'static,
    T: Send + 'static,
{
    let guard = Abandoned::default();
    let flag = guard.flag();
    let result = tokio::task::spawn_blocking(move || op(&flag))
        .await
        .map_err(join_error)?;
    drop(guard);
    result
}

/// An SSH session backed by libssh2
pub struct Ssh2Session {
    id: Uuid,
    endpoint: Endpoint,
    credentials: Credentials,
    connect_timeout: Duration,
    inner: Mutex<Option<Link>>,
}

impl fmt::Debug for Ssh2Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ssh2Session")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("username", &self.credentials.username)
            .finish()
    }
}

impl Ssh2Session {
    /// Connect and authenticate
    pub async fn connect(
        endpoint: Endpoint,
        credentials: Credentials,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        info!("Connecting to {}@{}", credentials.username, endpoint);

        let session = {
            let endpoint = endpoint.clone();
            let credentials = credentials.clone();
            tokio::task::spawn_blocking(move || open_session(&endpoint, &credentials, connect_timeout))
                .await
                .map_err(join_error)??
        };

        info!("Successfully connected to {}@{}", credentials.username, endpoint);
        Ok(Self {
            id: Uuid::new_v4(),
            endpoint,
            credentials,
            connect_timeout,
            inner: Mutex::new(Some(Link::new(session))),
        })
    }

    fn current(&self) -> Result<Link, TransportError> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| TransportError::Connection(format!("session to {} is closed", self.endpoint)))
    }

    fn sudo_password(&self, sudo: bool) -> Option<Option<String>> {
        sudo.then(|| self.credentials.password.clone())
    }

    async fn blocking<F, T>(&self, op: F) -> Result<T, TransportError>
    where
        F: FnOnce(&Link, &AtomicBool) -> Result<T, TransportError> + Send + 'static,
        T: Send + 'static,
    {
        let link = self.current()?;
        offload(move |abandoned| op(&link, abandoned)).await
    }
}

#[async_trait]
impl RemoteSession for Ssh2Session {
    fn id(&self) -> Uuid {
        self.id
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            endpoint: self.endpoint.clone(),
            username: self.credentials.username.clone(),
            transport_type: TransportType::SshLibssh2,
        }
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        debug!("Reconnecting transport to {}", self.endpoint);

        let endpoint = self.endpoint.clone();
        let credentials = self.credentials.clone();
        let timeout = self.connect_timeout;
        let fresh = tokio::task::spawn_blocking(move || open_session(&endpoint, &credentials, timeout))
            .await
            .map_err(join_error)??;

        let old = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Link::new(fresh));

        // a command left behind by a timed-out caller may still be using the old link
        if let Some(old) = old {
            let endpoint = self.endpoint.clone();
            tokio::task::spawn_blocking(move || {
                if let Err(e) = old.disconnect("reconnecting") {
                    debug!("Old session to {} did not disconnect cleanly: {}", endpoint, e);
                }
            });
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let link = self.inner.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(link) = link {
            debug!("Closing SSH session to {}", self.endpoint);
            tokio::task::spawn_blocking(move || link.disconnect("closing"))
                .await
                .map_err(join_error)??;
        }
        Ok(())
    }

    async fn execute(&self, command: &str, sudo: bool) -> Result<ExecResult, TransportError> {
        let command = command.to_string();
        let password = self.sudo_password(sudo);
        self.blocking(move |link, abandoned| {
            run(link, &command, password.as_ref().map(Option::as_deref), abandoned)
        })
        .await
    }

    async fn execute_async(&self, command: &str, sudo: bool) -> Result<CommandHandle, TransportError> {
        let link = self.current()?;
        let (sink, handle) = CommandHandle::channel(command);
        let command = command.to_string();
        let password = self.sudo_password(sudo);

        // dropping the handle leaves the command running
        tokio::task::spawn_blocking(move || {
            let detached = AtomicBool::new(false);
            let result = exec(
                &link,
                &command,
                password.as_ref().map(Option::as_deref),
                &detached,
                |line| sink.line(line.clone()),
            );
            sink.finish(result);
        });
        Ok(handle)
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, TransportError> {
        let path = PathBuf::from(path);
        self.blocking(move |link, _| {
            link.exclusive(|session| {
                let mut file = session.sftp()?.open(&path)?;
                let mut data = Vec::new();
                file.read_to_end(&mut data)?;
                Ok(data)
            })
        })
        .await
    }

    async fn write_file(&self, path: &str, data: &[u8], append: bool) -> Result<(), TransportError> {
        let path = PathBuf::from(path);
        let data = data.to_vec();
        self.blocking(move |link, _| {
            let flags = if append {
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::APPEND
            } else {
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE
            };
            link.exclusive(|session| {
                let mut file = session.sftp()?.open_mode(&path, flags, 0o644, OpenType::File)?;
                file.write_all(&data)?;
                Ok(())
            })
        })
        .await
    }

    async fn upload(&self, source: &Path, target: &str, sudo: bool) -> Result<(), TransportError> {
        let source = source.to_path_buf();
        let target = target.to_string();
        let password = self.sudo_password(sudo);
        self.blocking(move |link, abandoned| {
            let password = password.as_ref().map(Option::as_deref);
            let target = if source.is_file() && remote_is_dir(link, &target)? {
                remote_join(&target, &file_name(&source))
            } else {
                target
            };
            put(link, &source, &target, password, abandoned)
        })
        .await
    }

    async fn download(&self, source: &str, destination: &Path) -> Result<(), TransportError> {
        let source = source.to_string();
        let destination = if destination.is_dir() {
            destination.join(Path::new(&source).file_name().unwrap_or_default())
        } else {
            destination.to_path_buf()
        };
        self.blocking(move |link, _| {
            link.exclusive(|session| {
                let mut remote = session.sftp()?.open(Path::new(&source))?;
                let mut local = fs::File::create(&destination)?;
                io::copy(&mut remote, &mut local)?;
                Ok(())
            })
        })
        .await
    }

    async fn exists(&self, path: &str) -> Result<bool, TransportError> {
        let path = path.to_string();
        self.blocking(move |link, _| Ok(stat(link, &path)?.is_some())).await
    }

    async fn is_dir(&self, path: &str) -> Result<bool, TransportError> {
        let path = path.to_string();
        self.blocking(move |link, _| remote_is_dir(link, &path)).await
    }

    async fn is_file(&self, path: &str) -> Result<bool, TransportError> {
        let path = path.to_string();
        self.blocking(move |link, _| Ok(stat(link, &path)?.map_or(false, |s| s.is_file())))
            .await
    }

    async fn make_dir(&self, path: &str, sudo: bool) -> Result<(), TransportError> {
        let command = format!("mkdir -p {}", shell_quote(path));
        let password = self.sudo_password(sudo);
        self.blocking(move |link, abandoned| {
            run_checked(link, &command, password.as_ref().map(Option::as_deref), abandoned)
        })
        .await
    }

    async fn remove_recursive(&self, path: &str, sudo: bool) -> Result<(), TransportError> {
        let command = format!("rm -rf {}", shell_quote(path));
        let password = self.sudo_password(sudo);
        self.blocking(move |link, abandoned| {
            run_checked(link, &command, password.as_ref().map(Option::as_deref), abandoned)
        })
        .await
    }
}

fn join_error(err: tokio::task::JoinError) -> TransportError {
    TransportError::Session(format!("SSH worker task failed: {}", err))
}

fn open_session(
    endpoint: &Endpoint,
    credentials: &Credentials,
    timeout: Duration,
) -> Result<Session, TransportError> {
    let addr = (endpoint.host.as_str(), endpoint.port)
        .to_socket_addrs()
        .map_err(|e| TransportError::Connection(format!("Failed to resolve {}: {}", endpoint, e)))?
        .next()
        .ok_or_else(|| TransportError::Connection(format!("No address for {}", endpoint)))?;

    let tcp = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|e| TransportError::Connection(format!("Failed to connect to {}: {}", endpoint, e)))?;

    let mut session = Session::new()?;
    session.set_tcp_stream(tcp);
    // bounds every blocking call; command output is polled without blocking
    session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
    session.handshake()?;
    authenticate(&session, credentials)?;
    Ok(session)
}

fn authenticate(session: &Session, credentials: &Credentials) -> Result<(), TransportError> {
    for key in &credentials.keys {
        match session.userauth_pubkey_memory(&credentials.username, None, key.pem(), None) {
            Ok(()) if session.authenticated() => return Ok(()),
            Ok(()) => {}
            Err(e) => debug!("Key rejected for {}: {}", credentials.username, e),
        }
    }

    if let Some(password) = &credentials.password {
        session.userauth_password(&credentials.username, password)?;
    }

    if session.authenticated() {
        Ok(())
    } else {
        Err(TransportError::Authentication(format!(
            "no accepted method for {}",
            credentials.username
        )))
    }
}

/// Quote a string for a POSIX shell
fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

/// `password` is `None` for unprivileged runs, `Some(None)` for sudo without a password
fn wrap(command: &str, password: Option<Option<&str>>) -> String {
    match password {
        None => command.to_string(),
        Some(Some(_)) => format!("sudo -S -p '' bash -c {}", shell_quote(command)),
        Some(None) => format!("sudo -n bash -c {}", shell_quote(command)),
    }
}

/// Splits a byte stream into lines the way `str::lines` does
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Complete lines found after appending `bytes`
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
            let rest = self.pending.split_off(end + 1);
            let line = std::mem::replace(&mut self.pending, rest);
            lines.push(decode_line(&line[..end]));
        }
        lines
    }

    /// The unterminated tail, if any
    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        Some(decode_line(&line))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Read whatever is ready; zero when the stream would block or is finished
fn read_ready(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    match reader.read(buf) {
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
        other => other,
    }
}

fn start(link: &Link, command: &str, password: Option<Option<&str>>) -> Result<Channel, TransportError> {
    link.exclusive(|session| {
        let mut channel = session.channel_session()?;
        channel.exec(&wrap(command, password))?;
        if let Some(Some(password)) = password {
            channel.write_all(format!("{}\n", password).as_bytes())?;
        }
        channel.send_eof()?;
        Ok(channel)
    })
}

/// Run `command`, reading stdout and stderr side by side and handing every line to `emit`
fn exec(
    link: &Link,
    command: &str,
    password: Option<Option<&str>>,
    abandoned: &AtomicBool,
    mut emit: impl FnMut(&OutputLine),
) -> Result<ExecResult, TransportError> {
    let mut channel = start(link, command, password)?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut out_buf = LineBuffer::default();
    let mut err_buf = LineBuffer::default();
    let mut chunk = [0u8; 8192];

    loop {
        if abandoned.load(Ordering::Relaxed) {
            debug!("Abandoning command: {}", command);
            let _ = link.exclusive(move |_| Ok(channel.close()?));
            return Err(TransportError::Session(format!("command '{}' was abandoned", command)));
        }

        let (out, err, progressed, eof) = link.nonblocking(|| {
            let out_read = read_ready(&mut channel, &mut chunk)?;
            let out = out_buf.push(&chunk[..out_read]);
            let err_read = read_ready(&mut channel.stderr(), &mut chunk)?;
            let err = err_buf.push(&chunk[..err_read]);
            Ok((out, err, out_read + err_read > 0, channel.eof()))
        })?;

        for line in out {
            emit(&OutputLine::Stdout(line.clone()));
            stdout.push(line);
        }
        for line in err {
            emit(&OutputLine::Stderr(line.clone()));
            stderr.push(line);
        }

        if eof && !progressed {
            break;
        }
        if !progressed {
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    if let Some(line) = out_buf.finish() {
        emit(&OutputLine::Stdout(line.clone()));
        stdout.push(line);
    }
    if let Some(line) = err_buf.finish() {
        emit(&OutputLine::Stderr(line.clone()));
        stderr.push(line);
    }

    // the channel is freed under the lock too
    let exit_code = link.exclusive(move |_| {
        channel.wait_close()?;
        Ok(channel.exit_status()?)
    })?;
    Ok(ExecResult {
        command: command.to_string(),
        exit_code,
        stdout,
        stderr,
    })
}

fn run(
    link: &Link,
    command: &str,
    password: Option<Option<&str>>,
    abandoned: &AtomicBool,
) -> Result<ExecResult, TransportError> {
    debug!("Executing: {}", command);
    exec(link, command, password, abandoned, |_| {})
}

fn run_checked(
    link: &Link,
    command: &str,
    password: Option<Option<&str>>,
    abandoned: &AtomicBool,
) -> Result<(), TransportError> {
    let result = run(link, command, password, abandoned)?;
    if result.exit_code != 0 {
        return Err(TransportError::CommandFailed {
            command: command.to_string(),
            code: result.exit_code,
            expected: vec![0],
            message: result.stderr_str(),
        });
    }
    Ok(())
}

fn stat(link: &Link, path: &str) -> Result<Option<ssh2::FileStat>, TransportError> {
    link.exclusive(|session| match session.sftp()?.stat(Path::new(path)) {
        Ok(stat) => Ok(Some(stat)),
        Err(e) if matches!(e.code(), ssh2::ErrorCode::SFTP(_)) => Ok(None),
        Err(e) => Err(e.into()),
    })
}

fn remote_is_dir(link: &Link, path: &str) -> Result<bool, TransportError> {
    Ok(stat(link, path)?.map_or(false, |s| s.is_dir()))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn put(
    link: &Link,
    source: &Path,
    target: &str,
    password: Option<Option<&str>>,
    abandoned: &AtomicBool,
) -> Result<(), TransportError> {
    if source.is_dir() {
        run_checked(link, &format!("mkdir -p {}", shell_quote(target)), password, abandoned)?;
        let mut entries = fs::read_dir(source)?.collect::<io::Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let name = entry.file_name().to_string_lossy().into_owned();
            put(link, &entry.path(), &remote_join(target, &name), password, abandoned)?;
        }
        return Ok(());
    }

    debug!("Uploading {} -> {}", source.display(), target);
    if password.is_none() {
        return put_file(link, source, target);
    }

    // sftp runs unprivileged, so stage the file and move it into place with sudo
    let staging = format!("/tmp/fleetssh-{}", Uuid::new_v4());
    put_file(link, source, &staging)?;
    let moved = run_checked(
        link,
        &format!("mv -f {} {}", shell_quote(&staging), shell_quote(target)),
        password,
        abandoned,
    );
    if moved.is_err() {
        let cleanup = format!("rm -f {}", shell_quote(&staging));
        if let Err(e) = run(link, &cleanup, None, &AtomicBool::new(false)) {
            warn!("Failed to remove staging file {}: {}", staging, e);
        }
    }
    moved
}

fn put_file(link: &Link, source: &Path, target: &str) -> Result<(), TransportError> {
    let mut local = fs::File::open(source)?;
    link.exclusive(|session| {
        let mut remote = session.sftp()?.open_mode(
            Path::new(target),
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            0o644,
            OpenType::File,
        )?;
        io::copy(&mut local, &mut remote)?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/tmp/a b"), "'/tmp/a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_wrap_privilege() {
        assert_eq!(wrap("cd ~", None), "cd ~");
        assert_eq!(wrap("id -u", Some(Some("pw"))), "sudo -S -p '' bash -c 'id -u'");
        assert_eq!(wrap("id -u", Some(None)), "sudo -n bash -c 'id -u'");
    }

    #[test]
    fn test_connector_default_timeout() {
        let connector = Ssh2Connector::default();
        assert_eq!(connector.connect_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        // port 1 on loopback is closed on any sane test machine
        let result = Ssh2Connector::new(Duration::from_secs(2))
            .connect(&Endpoint::new("127.0.0.1", 1), &Credentials::password("root", "pw"))
            .await;
        assert!(matches!(result, Err(TransportError::Connection(_))));
    }

    #[test]
    fn test_line_buffer_splits_across_chunks() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"par").is_empty());
        assert_eq!(buffer.push(b"tial\r\nnext\n\nta"), vec!["partial", "next", ""]);
        assert_eq!(buffer.finish(), Some("ta".to_string()));
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn test_line_buffer_matches_exec_result_lines() {
        let text = "a\nb\r\n  warn \nlast";
        let mut buffer = LineBuffer::default();
        let mut lines = buffer.push(text.as_bytes());
        lines.extend(buffer.finish());
        assert_eq!(lines, ExecResult::from_output("x", 0, text, "").stdout);
    }

    struct Blocked;

    impl Read for Blocked {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }
    }

    #[test]
    fn test_read_ready_treats_would_block_as_empty() {
        let mut buf = [0u8; 4];
        assert_eq!(read_ready(&mut Blocked, &mut buf).unwrap(), 0);
        assert_eq!(read_ready(&mut &b"ok"[..], &mut buf).unwrap(), 2);
        assert!(read_ready(&mut BrokenPipe, &mut buf).is_err());
    }

    struct BrokenPipe;

    impl Read for BrokenPipe {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::BrokenPipe.into())
        }
    }

    #[tokio::test]
    async fn test_timed_out_call_releases_its_thread() {
        let (done_tx, done_rx) = std::sync::mpsc::channel();

        let call = offload(move |abandoned| {
            while !abandoned.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(5));
            }
            let _ = done_tx.send(());
            Ok(())
        });
        let outcome = tokio::time::timeout(Duration::from_millis(50), call).await;
        assert!(outcome.is_err());

        let released = tokio::task::spawn_blocking(move || done_rx.recv_timeout(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(released.is_ok());
    }

    #[tokio::test]
    async fn test_finished_call_returns_value() {
        let value = offload(|abandoned| Ok(abandoned.load(Ordering::Relaxed))).await.unwrap();
        assert!(!value);
    }
}
