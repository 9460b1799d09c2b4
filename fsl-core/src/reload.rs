//! Hot-reload protocol.
//!
//! Frames are a little-endian `u32` byte length followed by that many bytes of JSON.
//! A client sends a [`ReloadRequest`] and receives exactly one [`ReloadResponse`];
//! one connection may carry several request/response pairs. The server runs one
//! rebuild at a time: a request that arrives mid-build waits for the lock.

use crate::config::BuildConfig;
use crate::driver::BuildDriver;
use crate::error::{CompilerError, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// Largest frame either side accepts.
pub const MAX_FRAME_LEN: u32 = 64 << 20;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadRequest {
    pub project: String,
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: String,
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadResponse {
    pub success: bool,
    pub artifacts: Vec<Artifact>,
    pub error: Option<String>,
}

impl ReloadResponse {
    pub fn failure(message: impl Into<String>) -> Self {
        ReloadResponse {
            success: false,
            artifacts: Vec::new(),
            error: Some(message.into()),
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or_else(|| CompilerError::Reload(format!("frame of {} bytes exceeds the limit", payload.len())))?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame; `None` when the peer closed the connection between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len);
    if len > MAX_FRAME_LEN {
        return Err(CompilerError::Reload(format!("frame of {} bytes exceeds the limit", len)));
    }
    let mut payload = vec![0u8; len as usize];
    match reader.read_exact(&mut payload).await {
        Ok(_) => Ok(Some(payload)),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(CompilerError::Reload(format!(
            "connection closed inside a frame of {} bytes",
            len
        ))),
        Err(e) => Err(e.into()),
    }
}

pub struct ReloadServer {
    projects: BTreeMap<String, BuildConfig>,
    job: Mutex<()>,
}

impl ReloadServer {
    pub fn new(projects: BTreeMap<String, BuildConfig>) -> Self {
        ReloadServer {
            projects,
            job: Mutex::new(()),
        }
    }

    /// Accepts connections until `shutdown` completes.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!("reload server listening on {}", listener.local_addr()?);
        let listener = Arc::new(listener);
        let accept = move || {
            let listener = Arc::clone(&listener);
            async move { listener.accept().await }
        };
        self.serve_with(accept, shutdown).await;
        Ok(())
    }

    /// Accept loop over any source of connections. A failed accept is logged and
    /// retried after a pause; it never stops the server.
    pub async fn serve_with<A, F>(self: Arc<Self>, mut accept: A, shutdown: impl Future<Output = ()>)
    where
        A: FnMut() -> F,
        F: Future<Output = std::io::Result<(TcpStream, SocketAddr)>>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("reload server stopping");
                    return;
                }
                accepted = accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("reload client connected from {}", peer);
                        let server = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = server.connection(stream).await {
                                warn!("reload client {}: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("reload server failed to accept a connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }
    }

    async fn connection(&self, mut stream: TcpStream) -> Result<()> {
        loop {
            let frame = match read_frame(&mut stream).await {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                // The stream cannot be resynchronised after a bad frame: answer, then close.
                Err(CompilerError::Reload(message)) => {
                    let response = ReloadResponse::failure(format!("malformed request: {}", message));
                    write_frame(&mut stream, &serde_json::to_vec(&response)?).await?;
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            let response = match serde_json::from_slice::<ReloadRequest>(&frame) {
                Ok(request) => self.handle(request).await,
                Err(e) => ReloadResponse::failure(format!("malformed request: {}", e)),
            };
            write_frame(&mut stream, &serde_json::to_vec(&response)?).await?;
        }
    }

    /// Rebuilds the requested files. Every failure becomes a response, never a dropped connection.
    pub async fn handle(&self, request: ReloadRequest) -> ReloadResponse {
        let _job = self.job.lock().await;
        info!("reload {}: {} file(s)", request.project, request.paths.len());
        match self.rebuild(request).await {
            Ok(response) => response,
            Err(e) => ReloadResponse::failure(e.to_string()),
        }
    }

    async fn rebuild(&self, request: ReloadRequest) -> Result<ReloadResponse> {
        let mut config = self
            .projects
            .get(&request.project)
            .cloned()
            .ok_or_else(|| CompilerError::Reload(format!("unknown project '{}'", request.project)))?;
        if request.paths.is_empty() {
            return Err(CompilerError::Reload("no input files".into()));
        }
        if let Some(missing) = request.paths.iter().find(|p| !p.is_file()) {
            return Err(CompilerError::Reload(format!("input file not found: {}", missing.display())));
        }

        config.incremental = false;
        let paths = request.paths;
        let report = tokio::task::spawn_blocking(move || BuildDriver::new(config).run(&paths))
            .await
            .map_err(|e| CompilerError::Reload(format!("build task failed: {}", e)))?;
        if !report.succeeded() {
            return Ok(ReloadResponse::failure(report.failures().join("\n")));
        }

        let mut artifacts = Vec::new();
        for file in &report.files {
            for path in file.artifacts() {
                let bytes = tokio::fs::read(path).await.map_err(|e| CompilerError::path_io(path, e))?;
                artifacts.push(Artifact {
                    path: path.display().to_string(),
                    bytes,
                });
            }
        }
        Ok(ReloadResponse {
            success: true,
            artifacts,
            error: None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ReloadClient {
    address: String,
}

impl ReloadClient {
    pub fn new(address: impl Into<String>) -> Self {
        ReloadClient { address: address.into() }
    }

    pub async fn request(&self, request: &ReloadRequest) -> Result<ReloadResponse> {
        let connect = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.address))
            .await
            .map_err(|_| CompilerError::Reload(format!("timed out connecting to {}", self.address)))?;
        let mut stream = connect.map_err(|e| match e.kind() {
            ErrorKind::ConnectionRefused | ErrorKind::AddrNotAvailable | ErrorKind::NotFound => {
                CompilerError::Reload(format!("reload server is not running on {}", self.address))
            }
            _ => CompilerError::Io(e),
        })?;
        write_frame(&mut stream, &serde_json::to_vec(request)?).await?;
        let frame = read_frame(&mut stream)
            .await?
            .ok_or_else(|| CompilerError::Reload("server closed the connection without a response".into()))?;
        Ok(serde_json::from_slice(&frame)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Target;
    use std::path::Path;

    const SHADER: &str = "
#frag flat
float4 PS_MAIN(SV_Position(float4) pos)
{
    INIT_MAIN;
    RETURN(float4(pos.xy, 0, 1));
}
#end
";

    fn project(dir: &Path) -> BTreeMap<String, BuildConfig> {
        let config = BuildConfig {
            targets: vec![Target::Vulkan],
            out_dir: dir.join("out"),
            compile: false,
            workers: 1,
            ..BuildConfig::default()
        };
        BTreeMap::from([("demo".to_string(), config)])
    }

    #[tokio::test]
    async fn test_frames() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"{\"x\":1}").await.unwrap();
        write_frame(&mut a, b"").await.unwrap();
        drop(a);
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"{\"x\":1}");
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"");
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_FRAME_LEN + 1).to_le_bytes()).await.unwrap();
        assert!(matches!(read_frame(&mut b).await, Err(CompilerError::Reload(_))));
    }

    #[test]
    fn test_artifact_bytes_are_base64() {
        let artifact = Artifact {
            path: "out/vulkan/flat.glsl".into(),
            bytes: b"hi".to_vec(),
        };
        let json = serde_json::to_string(&artifact).unwrap();
        assert_eq!(json, r#"{"path":"out/vulkan/flat.glsl","bytes":"aGk="}"#);
        assert_eq!(serde_json::from_str::<Artifact>(&json).unwrap(), artifact);
    }

    #[tokio::test]
    async fn test_server_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("flat.fsl");
        std::fs::write(&input, SHADER).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = Arc::new(ReloadServer::new(project(dir.path())));
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(server.serve(listener, async {
            let _ = stopped.await;
        }));

        let client = ReloadClient::new(address);
        let response = client
            .request(&ReloadRequest {
                project: "demo".into(),
                paths: vec![input.clone()],
            })
            .await
            .unwrap();
        assert!(response.success, "{:?}", response.error);
        let glsl = response.artifacts.iter().find(|a| a.path.ends_with("flat.glsl")).unwrap();
        assert!(String::from_utf8_lossy(&glsl.bytes).starts_with("#version 450"));

        let missing = dir.path().join("missing.fsl");
        let response = client
            .request(&ReloadRequest {
                project: "demo".into(),
                paths: vec![missing.clone()],
            })
            .await
            .unwrap();
        assert!(!response.success);
        assert_eq!(response.error, Some(format!("reload error: input file not found: {}", missing.display())));

        let response = client
            .request(&ReloadRequest {
                project: "other".into(),
                paths: vec![input],
            })
            .await
            .unwrap();
        assert!(response.error.unwrap().contains("unknown project 'other'"));

        stop.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_oversized_request_gets_a_response() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let server = Arc::new(ReloadServer::new(project(dir.path())));
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(server.serve(listener, async {
            let _ = stopped.await;
        }));

        let mut stream = TcpStream::connect(address).await.unwrap();
        stream.write_all(&u32::MAX.to_le_bytes()).await.unwrap();
        let frame = read_frame(&mut stream).await.unwrap().unwrap();
        let response: ReloadResponse = serde_json::from_slice(&frame).unwrap();
        assert!(!response.success);
        assert!(response.error.unwrap().contains("exceeds the limit"));
        assert!(read_frame(&mut stream).await.unwrap().is_none());

        // A frame cut short by the client is answered too.
        let mut stream = TcpStream::connect(address).await.unwrap();
        stream.write_all(&16u32.to_le_bytes()).await.unwrap();
        stream.write_all(b"{\"pro").await.unwrap();
        stream.shutdown().await.unwrap();
        let frame = read_frame(&mut stream).await.unwrap().unwrap();
        let response: ReloadResponse = serde_json::from_slice(&frame).unwrap();
        assert!(response.error.unwrap().contains("closed inside a frame of 16 bytes"));

        stop.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_accept_errors_do_not_stop_the_server() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let dir = tempfile::tempdir().unwrap();
        let listener = Arc::new(TcpListener::bind("127.0.0.1:0").await.unwrap());
        let address = listener.local_addr().unwrap().to_string();
        let failures = Arc::new(AtomicUsize::new(2));
        let accept = {
            let failures = Arc::clone(&failures);
            move || {
                let listener = Arc::clone(&listener);
                let failures = Arc::clone(&failures);
                async move {
                    if failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
                        return Err(std::io::Error::other("too many open files"));
                    }
                    listener.accept().await
                }
            }
        };
        let server = Arc::new(ReloadServer::new(project(dir.path())));
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(server.serve_with(accept, async {
            let _ = stopped.await;
        }));

        let missing = dir.path().join("missing.fsl");
        let response = ReloadClient::new(address)
            .request(&ReloadRequest {
                project: "demo".into(),
                paths: vec![missing],
            })
            .await
            .unwrap();
        assert!(response.error.unwrap().contains("input file not found"));
        assert_eq!(failures.load(Ordering::SeqCst), 0);

        stop.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_reports_server_not_running() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = ReloadClient::new(address.clone())
            .request(&ReloadRequest {
                project: "demo".into(),
                paths: Vec::new(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), format!("reload error: reload server is not running on {}", address));
    }
}
