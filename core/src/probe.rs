use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::net::{DownloadRequest, NetClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub total_bytes: u64,
    pub supports_ranges: bool,
}

/// Metadata-only request for the stream length and range support. Ranges are
/// only reported when the server advertises `bytes` and a length is known.
pub fn probe(net: &dyn NetClient, req: &DownloadRequest) -> CoreResult<ProbeResult> {
    let resp = net
        .head(req)
        .map_err(|err| CoreError::Probe(err.to_string()))?;
    if !(200..300).contains(&resp.status_code) {
        return Err(CoreError::Probe(format!(
            "HEAD {} returned status {}",
            req.url, resp.status_code
        )));
    }
    let total_bytes = resp.total_bytes.unwrap_or(0);
    let result = ProbeResult {
        total_bytes,
        supports_ranges: resp.accept_ranges && total_bytes > 0,
    };
    debug!(
        url = %req.url,
        total_bytes = result.total_bytes,
        supports_ranges = result.supports_ranges,
        "probed stream"
    );
    Ok(result)
}
