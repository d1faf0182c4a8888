use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::multipart;
use snafu::prelude::*;
use tracing::{info, warn};

/// Default evaluation service endpoint; override with `--server`.
pub const DEFAULT_SERVER: &str = "https://eval.mammoscreen.io";

/// Per-run evaluation limits, enforced before any network traffic.
pub const MAX_STUDIES: usize = 100;
pub const MAX_IMAGES: usize = 500;

/// Fixed polling cadence for the results URL.
pub const POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const MAX_POLL_ATTEMPTS: u32 = 100;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Snafu)]
pub enum Error {
    /// The server could not be reached or the received response is incorrect: {message}
    Server { message: String },

    /// Request to {url} failed
    Transport {
        url: String,
        source: reqwest::Error,
    },

    /// The server rejected the access key: {message}
    Authentication { message: String },

    /// Evaluation limit exceeded: {message}
    QuotaExceeded { message: String },

    /// Results were not ready after {attempts} attempts; retry later by passing this results_url: {url}
    Timeout { attempts: u32, url: String },

    /// Could not read archive {path}
    ReadArchive {
        path: String,
        source: std::io::Error,
    },

    /// Could not write results file {path}
    WriteResults {
        path: String,
        source: std::io::Error,
    },
}

/// Upload session handed back by the service.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub results_url: String,
}

/// Refuse runs beyond the per-user evaluation limit before uploading.
pub fn check_quota(num_studies: usize, num_images: usize) -> Result<(), Error> {
    ensure!(
        num_studies <= MAX_STUDIES && num_images <= MAX_IMAGES,
        QuotaExceededSnafu {
            message: format!(
                "{num_studies} studies / {num_images} images exceed the limit of \
                 {MAX_STUDIES} studies or {MAX_IMAGES} images per run"
            )
        }
    );
    Ok(())
}

/// The session id embedded in a results URL (`.../{session_id}.zip`).
pub fn session_id_from_url(url: &str) -> String {
    url.rsplit('/')
        .next()
        .unwrap_or(url)
        .trim_end_matches(".zip")
        .to_string()
}

/// Classify an `ERROR`-prefixed response body into the error taxonomy.
fn classify_server_error(body: &str) -> Error {
    let lower = body.to_lowercase();
    if lower.contains("access key") || lower.contains("authentication") || lower.contains("expired")
    {
        Error::Authentication {
            message: body.to_string(),
        }
    } else if lower.contains("quota") || lower.contains("limit") {
        Error::QuotaExceeded {
            message: body.to_string(),
        }
    } else {
        Error::Server {
            message: body.to_string(),
        }
    }
}

async fn read_body(url: &str, response: reqwest::Response) -> Result<String, Error> {
    let status = response.status();
    let body = response.text().await.context(TransportSnafu { url })?;
    let body = body.trim().to_string();
    if !status.is_success() || body.starts_with("ERROR") {
        return Err(classify_server_error(&body));
    }
    ensure!(
        !body.is_empty(),
        ServerSnafu {
            message: "empty response body"
        }
    );
    Ok(body)
}

/// Open a session and upload the archive; returns the session and the
/// URL where results will appear.
pub async fn send_archive(
    client: &reqwest::Client,
    server: &str,
    zip_path: &Path,
    access_key: &str,
) -> Result<Session, Error> {
    let new_url = format!("{}/new", server.trim_end_matches('/'));
    info!("Establishing session with '{}'...", new_url);
    let response = client
        .post(&new_url)
        .timeout(HANDSHAKE_TIMEOUT)
        .json(&serde_json::json!({ "sender": access_key }))
        .send()
        .await
        .context(TransportSnafu { url: new_url.clone() })?;
    let session_id = read_body(&new_url, response).await?;

    let upload_url = format!("{}/upload", server.trim_end_matches('/'));
    let file_name = zip_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload.zip".to_string());
    let data = tokio::fs::read(zip_path).await.context(ReadArchiveSnafu {
        path: zip_path.display().to_string(),
    })?;
    let part = multipart::Part::bytes(data)
        .file_name(file_name)
        .mime_str("application/zip")
        .context(TransportSnafu {
            url: upload_url.clone(),
        })?;
    let form = multipart::Form::new().part("zip_file", part);

    info!("Uploading archive '{}'...", zip_path.display());
    let response = client
        .post(&upload_url)
        .header("SessionId", &session_id)
        .header("AccessKey", access_key)
        .multipart(form)
        .send()
        .await
        .context(TransportSnafu {
            url: upload_url.clone(),
        })?;
    let results_url = read_body(&upload_url, response).await?;

    Ok(Session {
        session_id,
        results_url,
    })
}

/// Poll `results_url` until the payload is ready, then save it to `dest`.
///
/// Any non-success status (or transient transport failure) counts as
/// "not ready yet". Exhausting the attempt budget yields a timeout that
/// carries the URL, so the run can be resumed out-of-band.
pub async fn poll_results(
    client: &reqwest::Client,
    results_url: &str,
    dest: &Path,
) -> Result<PathBuf, Error> {
    for attempt in 1..=MAX_POLL_ATTEMPTS {
        match client
            .get(results_url)
            .timeout(HANDSHAKE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                let bytes = response.bytes().await.context(TransportSnafu {
                    url: results_url.to_string(),
                })?;
                tokio::fs::write(dest, &bytes)
                    .await
                    .context(WriteResultsSnafu {
                        path: dest.display().to_string(),
                    })?;
                return Ok(dest.to_path_buf());
            }
            Ok(_) => {
                info!(
                    "Results are being generated, please wait... (attempt {}/{})",
                    attempt, MAX_POLL_ATTEMPTS
                );
            }
            Err(e) => {
                warn!("Could not reach {} ({}); will retry", results_url, e);
            }
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    TimeoutSnafu {
        attempts: MAX_POLL_ATTEMPTS,
        url: results_url.to_string(),
    }
    .fail()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_quota_bounds() {
        assert!(check_quota(1, 4).is_ok());
        assert!(check_quota(MAX_STUDIES, MAX_IMAGES).is_ok());
        assert!(matches!(
            check_quota(MAX_STUDIES + 1, 0),
            Err(Error::QuotaExceeded { .. })
        ));
        assert!(matches!(
            check_quota(0, MAX_IMAGES + 1),
            Err(Error::QuotaExceeded { .. })
        ));
    }

    #[test]
    fn test_session_id_from_url() {
        assert_eq!(
            session_id_from_url("https://host/results/abc123.zip"),
            "abc123"
        );
        assert_eq!(session_id_from_url("abc123.zip"), "abc123");
        assert_eq!(session_id_from_url("abc123"), "abc123");
    }

    #[test]
    fn test_classify_server_error() {
        assert!(matches!(
            classify_server_error("ERROR: invalid access key"),
            Error::Authentication { .. }
        ));
        assert!(matches!(
            classify_server_error("ERROR: access key expired"),
            Error::Authentication { .. }
        ));
        assert!(matches!(
            classify_server_error("ERROR: study quota exhausted"),
            Error::QuotaExceeded { .. }
        ));
        assert!(matches!(
            classify_server_error("ERROR: internal failure"),
            Error::Server { .. }
        ));
    }

    #[test]
    fn test_timeout_error_carries_url() {
        let err = Error::Timeout {
            attempts: MAX_POLL_ATTEMPTS,
            url: "https://host/results/abc.zip".to_string(),
        };
        assert!(err.to_string().contains("https://host/results/abc.zip"));
    }
}
