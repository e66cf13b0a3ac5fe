use futures::StreamExt;
use log::{ debug, info };
use reqwest::Client as HttpClient;
use std::ffi::OsString;
use std::path::{ Path, PathBuf };
use thiserror::Error;
use tokio::io::AsyncWriteExt;

pub const DEFAULT_HF_ENDPOINT: &str = "https://huggingface.co";

const PROGRESS_STEP: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model file IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("model download failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("model download from '{url}' returned HTTP {status}")]
    Status {
        url: String,
        status: u16,
    },
}

/// A model file published in a Hugging Face repository, mirrored into a local directory.
#[derive(Debug, Clone)]
pub struct ModelArtifact {
    pub dir: PathBuf,
    pub repo_id: String,
    pub file_name: String,
    pub endpoint: String,
}

impl ModelArtifact {
    pub fn local_path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }

    pub fn download_url(&self) -> String {
        format!(
            "{}/{}/resolve/main/{}",
            self.endpoint.trim_end_matches('/'),
            self.repo_id.trim_matches('/'),
            self.file_name
        )
    }
}

/// Returns the local path of the model, downloading it first when it is not there yet.
pub async fn ensure_model(artifact: &ModelArtifact) -> Result<PathBuf, ModelError> {
    tokio::fs::create_dir_all(&artifact.dir).await?;
    let path = artifact.local_path();

    if tokio::fs::try_exists(&path).await? {
        info!("Model already present at '{}'", path.display());
        return Ok(path);
    }

    info!(
        "Model not found. Downloading '{}' from '{}' into '{}'...",
        artifact.file_name,
        artifact.repo_id,
        artifact.dir.display()
    );
    let bytes = download(&HttpClient::new(), &artifact.download_url(), &path).await?;
    info!("Download complete ({} bytes).", bytes);
    Ok(path)
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name: OsString = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

// Writes into `<dest>.part` and renames on success so `dest` never holds a truncated file.
async fn download(http: &HttpClient, url: &str, dest: &Path) -> Result<u64, ModelError> {
    let part = partial_path(dest);
    let result = write_body(http, url, &part).await;

    match result {
        Ok(written) => {
            tokio::fs::rename(&part, dest).await?;
            Ok(written)
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&part).await;
            Err(e)
        }
    }
}

async fn write_body(http: &HttpClient, url: &str, part: &Path) -> Result<u64, ModelError> {
    let resp = http.get(url).send().await?;
    if !resp.status().is_success() {
        return Err(ModelError::Status {
            url: url.to_string(),
            status: resp.status().as_u16(),
        });
    }

    let total = resp.content_length();
    let mut file = tokio::fs::File::create(part).await?;
    let mut stream = resp.bytes_stream();
    let mut written: u64 = 0;
    let mut next_report = PROGRESS_STEP;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;

        if written >= next_report {
            match total {
                Some(total) if total > 0 => {
                    info!("Downloaded {} / {} MB ({}%)", written >> 20, total >> 20, (written * 100) / total)
                }
                _ => info!("Downloaded {} MB", written >> 20),
            }
            next_report += PROGRESS_STEP;
        }
    }

    file.flush().await?;
    debug!("Wrote {} bytes to '{}'", written, part.display());
    Ok(written)
}
