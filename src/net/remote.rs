use reqwest::header::AUTHORIZATION;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::notes::NotePayload;
use crate::sync::RemoteEndpoint;

/// Remote note store reached over HTTP.
#[derive(Clone)]
pub struct HttpRemote {
  client: reqwest::Client,
  endpoint: Url,
  origin: Url,
  token: Option<String>,
}

impl HttpRemote {
  pub fn new(origin: &Url, sync_path: &str, timeout: Duration, token: Option<String>) -> Result<Self> {
    let endpoint = origin.join(sync_path).map_err(|e| Error::InvalidRequest {
      message: format!("bad sync path '{}': {}", sync_path, e),
    })?;
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| Error::network(format!("failed to create HTTP client: {}", e)))?;

    Ok(Self {
      client,
      endpoint,
      origin: origin.clone(),
      token,
    })
  }

  /// Whether the remote origin answers at all. Any HTTP status counts.
  pub async fn probe(&self) -> bool {
    match self.client.head(self.origin.clone()).send().await {
      Ok(_) => true,
      Err(e) => {
        debug!(error = %e, "connectivity probe failed");
        false
      }
    }
  }
}

impl RemoteEndpoint for HttpRemote {
  async fn submit(&self, payload: &NotePayload) -> Result<()> {
    let mut request = self.client.post(self.endpoint.clone()).json(payload);
    if let Some(token) = &self.token {
      request = request.header(AUTHORIZATION, format!("Bearer {}", token));
    }

    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
      debug!(note_id = payload.id, status = status.as_u16(), "note accepted");
      Ok(())
    } else {
      Err(Error::UpstreamRejection {
        status: status.as_u16(),
      })
    }
  }
}
