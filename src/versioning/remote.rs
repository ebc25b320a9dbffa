use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;

use crate::config::{RemoteConfig, RemoteKind};
use crate::errors::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("remote unreachable: {0}")]
    Unreachable(String),

    #[error("remote refused the request: {0}")]
    Rejected(String),

    #[error("snapshot {0} not found on remote")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RemoteError> for StoreError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Unreachable(_) | RemoteError::Io(_) => StoreError::Transient(err.to_string()),
            RemoteError::Rejected(_) | RemoteError::NotFound(_) => StoreError::Permanent(err.to_string()),
        }
    }
}

/// Durable blob store that snapshot archives are pushed to and pulled from.
pub trait RemoteStore: Send + Sync {
    fn describe(&self) -> String;

    fn push(&self, snapshot_id: &str, archive: &Path) -> Result<(), RemoteError>;

    fn pull(&self, snapshot_id: &str, dest: &Path) -> Result<(), RemoteError>;
}

pub fn from_config(config: &RemoteConfig) -> anyhow::Result<Option<Arc<dyn RemoteStore>>> {
    let location = match (&config.kind, &config.location) {
        (RemoteKind::None, _) => return Ok(None),
        (_, None) => anyhow::bail!("remote.location is required"),
        (_, Some(location)) => location,
    };

    let remote: Arc<dyn RemoteStore> = match config.kind {
        RemoteKind::Dir => Arc::new(DirRemote::new(PathBuf::from(location))),
        RemoteKind::Http => Arc::new(HttpRemote::new(
            location,
            config.token.clone(),
            Duration::from_secs(config.timeout_secs),
        )?),
        RemoteKind::None => return Ok(None),
    };
    Ok(Some(remote))
}

/// Remote on a mounted filesystem.
pub struct DirRemote {
    root: PathBuf,
}

impl DirRemote {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn object(&self, snapshot_id: &str) -> PathBuf {
        self.root.join(format!("{snapshot_id}.tar.gz"))
    }
}

/// Copy through a temp file in the destination directory, then rename.
fn copy_atomic(from: &Path, to: &Path) -> Result<(), RemoteError> {
    let dir = to
        .parent()
        .ok_or_else(|| RemoteError::Rejected(format!("{} has no parent", to.display())))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    std::io::copy(&mut std::fs::File::open(from)?, &mut tmp)?;
    tmp.as_file().sync_all()?;
    tmp.persist(to).map_err(|e| RemoteError::Io(e.error))?;
    Ok(())
}

impl RemoteStore for DirRemote {
    fn describe(&self) -> String {
        format!("dir:{}", self.root.display())
    }

    fn push(&self, snapshot_id: &str, archive: &Path) -> Result<(), RemoteError> {
        let target = self.object(snapshot_id);
        if target.exists() {
            return Ok(());
        }
        copy_atomic(archive, &target)
    }

    fn pull(&self, snapshot_id: &str, dest: &Path) -> Result<(), RemoteError> {
        let source = self.object(snapshot_id);
        if !source.exists() {
            return Err(RemoteError::NotFound(snapshot_id.to_string()));
        }
        copy_atomic(&source, dest)
    }
}

/// Remote speaking plain HTTP: `PUT {base}/{id}.tar.gz` and `GET {base}/{id}.tar.gz`.
pub struct HttpRemote {
    base: url::Url,
    token: Option<String>,
    client: reqwest::blocking::Client,
}

impl HttpRemote {
    pub fn new(base: &str, token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        // a trailing slash makes `join` append instead of replacing the last segment
        let base = if base.ends_with('/') {
            base.to_string()
        } else {
            format!("{base}/")
        };
        let base = url::Url::parse(&base)?;
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(Self { base, token, client })
    }

    fn object_url(&self, snapshot_id: &str) -> Result<url::Url, RemoteError> {
        self.base
            .join(&format!("{snapshot_id}.tar.gz"))
            .map_err(|e| RemoteError::Rejected(e.to_string()))
    }

    fn authorize(&self, request: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

fn classify_transport(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RemoteError::Unreachable(err.to_string())
    } else {
        RemoteError::Rejected(err.to_string())
    }
}

fn classify_status(status: StatusCode, snapshot_id: &str) -> RemoteError {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RemoteError::Unreachable(format!("remote answered {status}"))
    } else if status == StatusCode::NOT_FOUND {
        RemoteError::NotFound(snapshot_id.to_string())
    } else {
        RemoteError::Rejected(format!("remote answered {status}"))
    }
}

impl RemoteStore for HttpRemote {
    fn describe(&self) -> String {
        self.base.to_string()
    }

    fn push(&self, snapshot_id: &str, archive: &Path) -> Result<(), RemoteError> {
        let body = std::fs::read(archive)?;
        let url = self.object_url(snapshot_id)?;
        log::info!("pushing snapshot {snapshot_id} to {url}");

        let response = self
            .authorize(self.client.put(url))
            .header(reqwest::header::CONTENT_TYPE, "application/gzip")
            .body(body)
            .send()
            .map_err(classify_transport)?;

        if !response.status().is_success() {
            return Err(classify_status(response.status(), snapshot_id));
        }
        Ok(())
    }

    fn pull(&self, snapshot_id: &str, dest: &Path) -> Result<(), RemoteError> {
        let url = self.object_url(snapshot_id)?;
        log::info!("pulling snapshot {snapshot_id} from {url}");

        let response = self
            .authorize(self.client.get(url))
            .send()
            .map_err(classify_transport)?;
        if !response.status().is_success() {
            return Err(classify_status(response.status(), snapshot_id));
        }
        let bytes = response.bytes().map_err(classify_transport)?;

        let dir = dest
            .parent()
            .ok_or_else(|| RemoteError::Rejected(format!("{} has no parent", dest.display())))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        std::io::Write::write_all(&mut tmp, &bytes)?;
        tmp.persist(dest).map_err(|e| RemoteError::Io(e.error))?;
        Ok(())
    }
}
