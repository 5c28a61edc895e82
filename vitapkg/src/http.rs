//! Range-resumable HTTP byte stream.
//!
//! The pipeline drives this through the [`HttpSource`] trait so tests can
//! serve synthesised packages from memory. The real implementation wraps a
//! blocking `reqwest` client and resumes with `Range: bytes=N-` requests.

use std::io::Read;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::header::RANGE;
use reqwest::StatusCode;

use crate::error::{DownloadError, DownloadResult};

/// Default connect timeout; body reads run as long as bytes keep arriving.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// A byte stream that can be opened at an arbitrary offset.
///
/// The pipeline opens the stream lazily, on the first read after
/// construction or resumption, never in `start` callers' control flow.
pub trait HttpSource: Send {
    /// Open the stream at `offset` bytes into the resource.
    fn start(&mut self, url: &str, offset: u64) -> DownloadResult<()>;

    /// Remaining length of the open stream. An unknown length is fatal.
    fn length(&self) -> DownloadResult<u64>;

    /// Read up to `buf.len()` bytes. `Ok(0)` means the server closed the
    /// stream; the pipeline decides whether that was expected.
    fn read(&mut self, buf: &mut [u8]) -> DownloadResult<usize>;
}

/// `reqwest`-backed [`HttpSource`].
pub struct ReqwestSource {
    client: Client,
    response: Option<Response>,
}

impl ReqwestSource {
    pub fn new() -> DownloadResult<Self> {
        Self::with_connect_timeout(DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_connect_timeout(timeout: Duration) -> DownloadResult<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .timeout(None::<Duration>)
            .build()
            .map_err(|e| DownloadError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            response: None,
        })
    }
}

impl HttpSource for ReqwestSource {
    fn start(&mut self, url: &str, offset: u64) -> DownloadResult<()> {
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }

        let response = request
            .send()
            .map_err(|e| DownloadError::Transport(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Transport(format!("HTTP error {status}")));
        }
        // A 200 to a ranged request would silently restart from zero and
        // corrupt the resumed session.
        if offset > 0 && status != StatusCode::PARTIAL_CONTENT {
            return Err(DownloadError::Transport(
                "server does not support range requests".into(),
            ));
        }

        self.response = Some(response);
        Ok(())
    }

    fn length(&self) -> DownloadResult<u64> {
        self.response
            .as_ref()
            .and_then(|r| r.content_length())
            .ok_or_else(|| DownloadError::Transport("unknown content length".into()))
    }

    fn read(&mut self, buf: &mut [u8]) -> DownloadResult<usize> {
        let response = self
            .response
            .as_mut()
            .ok_or_else(|| DownloadError::Transport("stream not started".into()))?;
        response
            .read(buf)
            .map_err(|e| DownloadError::Transport(format!("read failed: {e}")))
    }
}
