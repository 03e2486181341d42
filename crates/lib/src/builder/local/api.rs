//! Daemon HTTP API build strategy.
//!
//! The workspace is sent as a tar archive to `POST /build`. The daemon
//! answers with a stream of JSON messages: `stream` carries build output,
//! `error` a failure, and `aux.ID` the ID of the built image.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::artifact::DockerArtifact;
use crate::buildargs::BuildArgs;
use crate::builder::BuildError;

#[derive(Debug, Error)]
pub enum DaemonError {
  #[error("unsupported daemon endpoint: {0}")]
  UnsupportedHost(String),

  #[error("failed to archive build context {}: {source}", path.display())]
  Archive {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("request to daemon failed: {0}")]
  Http(#[from] reqwest::Error),

  #[error("daemon returned {status}: {message}")]
  Status { status: u16, message: String },

  #[error("daemon reported: {0}")]
  Build(String),

  #[error("invalid progress message: {0}")]
  Progress(#[from] serde_json::Error),

  #[error("build cancelled")]
  Cancelled,

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// An image build as sent to the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBuildRequest {
  /// Directory archived as the build context.
  pub context: PathBuf,

  /// Dockerfile path inside the context, `/`-separated.
  pub dockerfile: String,

  pub tag: String,

  /// Build args with values. Arguments left unset are filled from the
  /// environment or dropped.
  pub build_args: BTreeMap<String, String>,

  pub target: Option<String>,
  pub cache_from: Vec<String>,
  pub no_cache: bool,
  pub force_remove: bool,
  pub network_mode: Option<String>,
}

impl ImageBuildRequest {
  /// Assemble a request. The Dockerfile must lie inside `context`.
  pub fn new(
    context: &Path,
    dockerfile: &Path,
    tag: &str,
    docker: &DockerArtifact,
    args: &BuildArgs,
    env: &HashMap<String, String>,
  ) -> Result<Self, String> {
    let relative = dockerfile.strip_prefix(context).map_err(|_| {
      format!(
        "dockerfile {} is outside the build context {}",
        dockerfile.display(),
        context.display()
      )
    })?;

    let dockerfile = relative
      .components()
      .map(|c| c.as_os_str().to_string_lossy())
      .collect::<Vec<_>>()
      .join("/");

    let build_args = args
      .iter()
      .filter_map(|(name, value)| {
        value
          .clone()
          .or_else(|| env.get(name).cloned())
          .map(|value| (name.clone(), value))
      })
      .collect();

    Ok(Self {
      context: context.to_path_buf(),
      dockerfile,
      tag: tag.to_string(),
      build_args,
      target: docker.target.clone(),
      cache_from: docker.cache_from.clone(),
      no_cache: docker.no_cache,
      force_remove: true,
      network_mode: docker.network_mode.clone(),
    })
  }

  pub fn force_remove(mut self, force_remove: bool) -> Self {
    self.force_remove = force_remove;
    self
  }

  /// Query parameters of `POST /build`.
  pub fn query(&self) -> Result<Vec<(&'static str, String)>, DaemonError> {
    let mut query = vec![
      ("t", self.tag.clone()),
      ("dockerfile", self.dockerfile.clone()),
      ("buildargs", serde_json::to_string(&self.build_args)?),
    ];

    if let Some(target) = &self.target {
      query.push(("target", target.clone()));
    }
    if !self.cache_from.is_empty() {
      query.push(("cachefrom", serde_json::to_string(&self.cache_from)?));
    }
    if let Some(network) = &self.network_mode {
      query.push(("networkmode", network.clone()));
    }
    if self.no_cache {
      query.push(("nocache", "1".to_string()));
    }
    if self.force_remove {
      query.push(("forcerm", "1".to_string()));
    }

    Ok(query)
  }
}

/// Builds images through the daemon API.
#[async_trait]
pub trait DaemonApi: Send + Sync {
  /// Build `request`, streaming progress to `out`. Returns the image ID when
  /// the daemon reports one.
  async fn build_image(
    &self,
    request: &ImageBuildRequest,
    out: &mut (dyn AsyncWrite + Send + Unpin),
    cancel: &CancellationToken,
  ) -> Result<Option<String>, DaemonError>;
}

/// [`DaemonApi`] over HTTP to a TCP daemon endpoint.
#[derive(Debug, Clone)]
pub struct HttpDaemon {
  client: reqwest::Client,
  host: String,
}

impl HttpDaemon {
  pub fn new(host: impl Into<String>) -> Self {
    Self {
      client: reqwest::Client::new(),
      host: host.into(),
    }
  }
}

/// Map a docker host (`tcp://`, `http://` or `https://`) to a base URL.
pub fn base_url(host: &str) -> Result<String, DaemonError> {
  let url = if let Some(rest) = host.strip_prefix("tcp://") {
    format!("http://{rest}")
  } else if host.starts_with("http://") || host.starts_with("https://") {
    host.to_string()
  } else {
    return Err(DaemonError::UnsupportedHost(host.to_string()));
  };
  Ok(url.trim_end_matches('/').to_string())
}

/// Tar the build context.
async fn archive_context(dir: &Path) -> Result<Vec<u8>, DaemonError> {
  let path = dir.to_path_buf();
  let archived = tokio::task::spawn_blocking(move || {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    builder.append_dir_all(".", &path)?;
    builder.into_inner()
  })
  .await
  .map_err(std::io::Error::other);

  archived
    .and_then(|result| result)
    .map_err(|source| DaemonError::Archive {
      path: dir.to_path_buf(),
      source,
    })
}

/// One message of the daemon's build progress stream.
#[derive(Debug, Default, Deserialize)]
struct ProgressMessage {
  #[serde(default)]
  stream: Option<String>,

  #[serde(default)]
  error: Option<String>,

  /// Free-form; the classic builder sends `{"ID": "sha256:..."}`.
  #[serde(default)]
  aux: Option<serde_json::Value>,
}

/// Splits the progress stream into messages, across chunk boundaries.
#[derive(Debug, Default)]
struct ProgressDecoder {
  buffer: Vec<u8>,
  image_id: Option<String>,
}

impl ProgressDecoder {
  /// Feed a chunk; output text is written to `out`.
  async fn push(&mut self, chunk: &[u8], out: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<(), DaemonError> {
    self.buffer.extend_from_slice(chunk);

    while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
      let line: Vec<u8> = self.buffer.drain(..=pos).collect();
      self.handle(&line, out).await?;
    }
    Ok(())
  }

  /// Flush a trailing message without newline.
  async fn finish(mut self, out: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<Option<String>, DaemonError> {
    let rest = std::mem::take(&mut self.buffer);
    self.handle(&rest, out).await?;
    out.flush().await?;
    Ok(self.image_id)
  }

  async fn handle(&mut self, line: &[u8], out: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<(), DaemonError> {
    if line.iter().all(u8::is_ascii_whitespace) {
      return Ok(());
    }

    let message: ProgressMessage = serde_json::from_slice(line)?;

    if let Some(error) = message.error {
      return Err(DaemonError::Build(error));
    }
    if let Some(text) = message.stream {
      out.write_all(text.as_bytes()).await?;
    }
    if let Some(id) = message.aux.as_ref().and_then(|aux| aux.get("ID")).and_then(|id| id.as_str()) {
      debug!(image_id = %id, "daemon reported image id");
      self.image_id = Some(id.to_string());
    }
    Ok(())
  }
}

#[async_trait]
impl DaemonApi for HttpDaemon {
  async fn build_image(
    &self,
    request: &ImageBuildRequest,
    out: &mut (dyn AsyncWrite + Send + Unpin),
    cancel: &CancellationToken,
  ) -> Result<Option<String>, DaemonError> {
    let url = format!("{}/build", base_url(&self.host)?);
    let body = tokio::select! {
      biased;
      _ = cancel.cancelled() => return Err(DaemonError::Cancelled),
      body = archive_context(&request.context) => body?,
    };

    info!(url = %url, tag = %request.tag, context_bytes = body.len(), "sending build to daemon");

    let send = self
      .client
      .post(&url)
      .query(&request.query()?)
      .header("Content-Type", "application/x-tar")
      .body(body)
      .send();

    let mut response = tokio::select! {
      biased;
      _ = cancel.cancelled() => return Err(DaemonError::Cancelled),
      response = send => response?,
    };

    let status = response.status();
    if !status.is_success() {
      let message = response.text().await.unwrap_or_default();
      return Err(DaemonError::Status {
        status: status.as_u16(),
        message: message.trim().to_string(),
      });
    }

    let mut decoder = ProgressDecoder::default();
    loop {
      let chunk = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(DaemonError::Cancelled),
        chunk = response.chunk() => chunk?,
      };

      match chunk {
        Some(bytes) => decoder.push(&bytes, out).await?,
        None => break,
      }
    }

    decoder.finish(out).await
  }
}

pub(crate) fn into_build_error(artifact: &str, err: DaemonError) -> BuildError {
  match err {
    DaemonError::Cancelled => BuildError::Cancelled {
      artifact: artifact.to_string(),
    },
    DaemonError::Archive { source, .. } | DaemonError::Io(source) => BuildError::Io {
      artifact: artifact.to_string(),
      source,
    },
    other => BuildError::BuildFailed {
      artifact: artifact.to_string(),
      cause: other.to_string(),
    },
  }
}

#[cfg(test)]
mod tests {
  use tempfile::TempDir;
  use tokio::io::AsyncReadExt;
  use tokio::net::TcpListener;

  use super::*;

  fn request(dir: &Path) -> ImageBuildRequest {
    let docker = DockerArtifact::default();
    ImageBuildRequest::new(
      dir,
      &dir.join("Dockerfile"),
      "app:v1",
      &docker,
      &BuildArgs::new(),
      &HashMap::new(),
    )
    .unwrap()
  }

  #[test]
  fn base_url_mapping() {
    assert_eq!(base_url("tcp://localhost:2375").unwrap(), "http://localhost:2375");
    assert_eq!(base_url("https://docker.example:2376/").unwrap(), "https://docker.example:2376");
    assert!(matches!(
      base_url("unix:///var/run/docker.sock"),
      Err(DaemonError::UnsupportedHost(_))
    ));
  }

  #[test]
  fn request_resolves_unset_args_from_env() {
    let args: BuildArgs = [
      ("SET".to_string(), Some("1".to_string())),
      ("FROM_ENV".to_string(), None),
      ("MISSING".to_string(), None),
    ]
    .into_iter()
    .collect();
    let env: HashMap<String, String> = [("FROM_ENV".to_string(), "2".to_string())].into();
    let docker = DockerArtifact {
      dockerfile: PathBuf::from("build/Dockerfile.prod"),
      ..DockerArtifact::default()
    };

    let request = ImageBuildRequest::new(
      Path::new("/ws"),
      Path::new("/ws/build/Dockerfile.prod"),
      "app:v1",
      &docker,
      &args,
      &env,
    )
    .unwrap();

    assert_eq!(request.dockerfile, "build/Dockerfile.prod");
    assert_eq!(request.build_args.len(), 2);
    assert_eq!(request.build_args["SET"], "1");
    assert_eq!(request.build_args["FROM_ENV"], "2");
  }

  #[test]
  fn dockerfile_outside_context_rejected() {
    let err = ImageBuildRequest::new(
      Path::new("/ws"),
      Path::new("/elsewhere/Dockerfile"),
      "t",
      &DockerArtifact::default(),
      &BuildArgs::new(),
      &HashMap::new(),
    )
    .unwrap_err();
    assert!(err.contains("outside the build context"));
  }

  #[test]
  fn query_parameters() {
    let mut request = request(Path::new("/ws"));
    request.build_args.insert("A".to_string(), "x".to_string());
    request.cache_from = vec!["app:cache".to_string()];
    request.no_cache = true;
    request.target = Some("release".to_string());

    let query: HashMap<_, _> = request.query().unwrap().into_iter().collect();
    assert_eq!(query["t"], "app:v1");
    assert_eq!(query["dockerfile"], "Dockerfile");
    assert_eq!(query["buildargs"], r#"{"A":"x"}"#);
    assert_eq!(query["cachefrom"], r#"["app:cache"]"#);
    assert_eq!(query["target"], "release");
    assert_eq!(query["nocache"], "1");
    assert_eq!(query["forcerm"], "1");
    assert!(!query.contains_key("networkmode"));

    let query = request.force_remove(false).query().unwrap();
    assert!(query.iter().all(|(k, _)| *k != "forcerm"));
  }

  #[tokio::test]
  async fn decoder_handles_split_messages() {
    let mut decoder = ProgressDecoder::default();
    let mut out = Vec::new();

    decoder.push(b"{\"stream\":\"Step 1/2\\n\"}\n{\"str", &mut out).await.unwrap();
    decoder.push(b"eam\":\"Step 2/2\\n\"}\n", &mut out).await.unwrap();
    decoder.push(b"{\"aux\":{\"ID\":\"sha256:abc\"}}", &mut out).await.unwrap();
    let id = decoder.finish(&mut out).await.unwrap();

    assert_eq!(String::from_utf8(out).unwrap(), "Step 1/2\nStep 2/2\n");
    assert_eq!(id.as_deref(), Some("sha256:abc"));
  }

  #[tokio::test]
  async fn decoder_surfaces_daemon_errors() {
    let mut decoder = ProgressDecoder::default();
    let err = decoder
      .push(b"{\"error\":\"COPY failed\"}\n", &mut tokio::io::sink())
      .await
      .unwrap_err();
    assert!(matches!(err, DaemonError::Build(ref msg) if msg == "COPY failed"));
  }

  /// Serve a single HTTP request with a canned response body.
  async fn serve_once(body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut received = Vec::new();
      let mut buf = [0u8; 8192];

      // Read headers, then as much body as Content-Length announces
      let header_end = loop {
        let n = socket.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed before headers");
        received.extend_from_slice(&buf[..n]);
        if let Some(pos) = received.windows(4).position(|w| w == b"\r\n\r\n") {
          break pos + 4;
        }
      };
      let headers = String::from_utf8_lossy(&received[..header_end]).to_string();
      let length = headers
        .lines()
        .find_map(|l| {
          let (k, v) = l.split_once(':')?;
          k.eq_ignore_ascii_case("content-length").then(|| v.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);
      while received.len() < header_end + length {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
          break;
        }
        received.extend_from_slice(&buf[..n]);
      }

      let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
      );
      socket.write_all(response.as_bytes()).await.unwrap();
      socket.shutdown().await.unwrap();
      headers
    });

    (format!("tcp://{addr}"), handle)
  }

  #[tokio::test]
  async fn http_daemon_builds_and_reports_image_id() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("Dockerfile"), "FROM scratch\n").unwrap();

    let (host, server) =
      serve_once("{\"stream\":\"Successfully built\\n\"}\n{\"aux\":{\"ID\":\"sha256:123\"}}\n").await;
    let daemon = HttpDaemon::new(host);
    let mut out = Vec::new();

    let id = daemon
      .build_image(&request(temp.path()), &mut out, &CancellationToken::new())
      .await
      .unwrap();

    assert_eq!(id.as_deref(), Some("sha256:123"));
    assert_eq!(String::from_utf8(out).unwrap(), "Successfully built\n");

    let headers = server.await.unwrap();
    assert!(headers.starts_with("POST /build?"));
    assert!(headers.contains("t=app%3Av1"));
    assert!(headers.to_ascii_lowercase().contains("content-type: application/x-tar"));
  }

  #[tokio::test]
  async fn cancelled_before_response() {
    let temp = TempDir::new().unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    // Nothing listens here; cancellation wins the race regardless
    let daemon = HttpDaemon::new("tcp://127.0.0.1:9");
    let err = daemon
      .build_image(&request(temp.path()), &mut tokio::io::sink(), &cancel)
      .await
      .unwrap_err();
    assert!(matches!(err, DaemonError::Cancelled));
  }

  #[tokio::test]
  async fn cancellation_wins_over_archiving() {
    let temp = TempDir::new().unwrap();
    let request = request(temp.path());
    // Archiving a missing context would fail with an Archive error
    drop(temp);

    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = HttpDaemon::new("tcp://127.0.0.1:9")
      .build_image(&request, &mut tokio::io::sink(), &cancel)
      .await
      .unwrap_err();
    assert!(matches!(err, DaemonError::Cancelled));
  }
}
