//! Channel transport between host and runtime.
//!
//! The host listens, the runtime connects to the endpoint passed via `--channel`.
//! Platform-specific endpoints:
//! - **Unix domain socket**: `{temp_dir}/audience_{millis}_{pid}` (macOS, Linux, BSD)
//! - **Named pipe**: `\\.\pipe\audience_{millis}_{pid}` (Windows)

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncWrite};

pub type ChannelReader = Box<dyn AsyncRead + Send + Unpin>;
pub type ChannelWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Address of the channel as handed to the runtime process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEndpoint {
    path: PathBuf,
}

impl ChannelEndpoint {
    /// Fresh endpoint name unique to this process and instant.
    pub fn generate() -> Self {
        let name = format!(
            "audience_{}_{}",
            chrono::Utc::now().timestamp_millis(),
            std::process::id()
        );

        #[cfg(windows)]
        let path = PathBuf::from(format!(r"\\.\pipe\{}", name));
        #[cfg(not(windows))]
        let path = std::env::temp_dir().join(name);

        Self { path }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Value for the runtime's `--channel` argument.
    pub fn to_arg(&self) -> OsString {
        self.path.clone().into_os_string()
    }
}

impl std::fmt::Display for ChannelEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Connected duplex stream, already split into halves.
pub struct ChannelStream {
    pub reader: ChannelReader,
    pub writer: ChannelWriter,
}

impl ChannelStream {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

/// Listening side of the channel.
///
/// Dropping the listener tears the endpoint down (removes the socket file on Unix).
pub struct ChannelListener {
    endpoint: ChannelEndpoint,
    #[cfg(unix)]
    listener: tokio::net::UnixListener,
    #[cfg(windows)]
    server: Option<tokio::net::windows::named_pipe::NamedPipeServer>,
}

impl ChannelListener {
    #[cfg(unix)]
    pub fn bind(endpoint: ChannelEndpoint) -> io::Result<Self> {
        let path = endpoint.path();
        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = tokio::net::UnixListener::bind(path)?;
        tracing::debug!(transport_type = "unix", endpoint = %endpoint, "Channel listening");

        Ok(Self { endpoint, listener })
    }

    #[cfg(windows)]
    pub fn bind(endpoint: ChannelEndpoint) -> io::Result<Self> {
        use tokio::net::windows::named_pipe::ServerOptions;

        let server = ServerOptions::new()
            .first_pipe_instance(true)
            .create(endpoint.path())?;
        tracing::debug!(transport_type = "named_pipe", endpoint = %endpoint, "Channel listening");

        Ok(Self {
            endpoint,
            server: Some(server),
        })
    }

    /// Wait for the runtime to connect. Cancel safe.
    #[cfg(unix)]
    pub async fn accept(&mut self) -> io::Result<ChannelStream> {
        tracing::trace!(endpoint = %self.endpoint, "Waiting for runtime connection");
        let (stream, _) = self.listener.accept().await?;
        tracing::debug!(endpoint = %self.endpoint, "Runtime connected");
        Ok(ChannelStream::new(stream))
    }

    /// Wait for the runtime to connect. Cancel safe.
    #[cfg(windows)]
    pub async fn accept(&mut self) -> io::Result<ChannelStream> {
        let server = self.server.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "channel pipe already accepted")
        })?;
        tracing::trace!(endpoint = %self.endpoint, "Waiting for runtime connection");
        server.connect().await?;
        tracing::debug!(endpoint = %self.endpoint, "Runtime connected");
        match self.server.take() {
            Some(server) => Ok(ChannelStream::new(server)),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "channel pipe already accepted",
            )),
        }
    }

    pub fn endpoint(&self) -> &ChannelEndpoint {
        &self.endpoint
    }

    #[cfg(unix)]
    fn cleanup(&mut self) -> io::Result<()> {
        let path = self.endpoint.path();
        if path.exists() {
            tracing::debug!(endpoint = %self.endpoint, "Removing channel socket");
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    #[cfg(windows)]
    fn cleanup(&mut self) -> io::Result<()> {
        self.server.take();
        Ok(())
    }
}

impl Drop for ChannelListener {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            tracing::warn!(error = %e, "Failed to clean up channel endpoint");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_endpoint_names_carry_pid() {
        let endpoint = ChannelEndpoint::generate();
        let name = endpoint
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        assert!(name.starts_with("audience_"), "unexpected name {name}");
        assert!(name.ends_with(&format!("_{}", std::process::id())));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn accepts_connection_and_removes_socket_on_drop() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audience_test");
        let mut listener = ChannelListener::bind(ChannelEndpoint::at(&path)).unwrap();
        assert!(path.exists());

        let connect = tokio::spawn({
            let path = path.clone();
            async move {
                let mut stream = tokio::net::UnixStream::connect(&path).await.unwrap();
                stream.write_all(b"ping\n").await.unwrap();
            }
        });

        let mut stream = listener.accept().await.unwrap();
        connect.await.unwrap();

        let mut buf = [0u8; 5];
        stream.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping\n");

        drop(listener);
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn bind_replaces_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale");
        std::fs::write(&path, b"").unwrap();

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let listener = ChannelListener::bind(ChannelEndpoint::at(&path)).unwrap();
            assert_eq!(listener.endpoint().path(), &path);
        });
    }
}
