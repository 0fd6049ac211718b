use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread;

use tracing::{debug, info, warn};

use crate::cancel::StopSignal;
use crate::config::EngineConfig;
use crate::error::{CoreError, CoreResult};
use crate::fsutil::remove_quietly;
use crate::net::{DownloadRequest, NetClient};
use crate::probe::probe;
use crate::progress::{fraction_of, ProgressAccumulator, ProgressEvent, ProgressObserver};
use crate::segment::{build_segments, copy_body, fetch_segment, Segment};

/// One logical stream to materialize on disk.
#[derive(Debug, Clone, Copy)]
pub struct StreamTarget<'a> {
    pub url: &'a str,
    pub dest: &'a Path,
    /// Segment files are written next to this as `{prefix}_seg{N}.tmp`.
    pub segment_prefix: &'a Path,
}

pub fn segment_path(prefix: &Path, index: u32) -> PathBuf {
    let mut name = OsString::from(prefix.as_os_str());
    name.push(format!("_seg{}.tmp", index));
    PathBuf::from(name)
}

pub struct SegmentedDownloader<'a> {
    net: &'a dyn NetClient,
    headers: HashMap<String, String>,
    segment_count: u32,
    min_parallel_bytes: u64,
    buffer_size: usize,
}

impl<'a> SegmentedDownloader<'a> {
    pub fn new(net: &'a dyn NetClient, config: &EngineConfig) -> Self {
        Self {
            net,
            headers: config.default_headers.clone(),
            segment_count: config.segment_count.max(1),
            min_parallel_bytes: config.min_parallel_bytes,
            buffer_size: config.buffer_size,
        }
    }

    /// Headers layered over the configured defaults.
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Produces `target.dest` fully populated and returns its length.
    ///
    /// Probe failures, servers without range support and streams below the
    /// parallel threshold all take the single-request path.
    pub fn download(
        &self,
        target: StreamTarget<'_>,
        stop: &StopSignal,
        observer: &dyn ProgressObserver,
    ) -> CoreResult<u64> {
        stop.check()?;
        let mut base = DownloadRequest::new(target.url);
        base.headers = self.headers.clone();

        let probed = match probe(self.net, &base) {
            Ok(result) => Some(result),
            Err(err) => {
                warn!(url = %target.url, error = %err, "probe failed, falling back to whole-file fetch");
                None
            }
        };

        let result = match probed {
            Some(p) if p.supports_ranges && p.total_bytes >= self.min_parallel_bytes => {
                self.download_segmented(&base, target, p.total_bytes, stop, observer)
            }
            other => {
                let expected = other.map(|p| p.total_bytes).filter(|total| *total > 0);
                self.download_whole(&base, target.dest, expected, stop, observer)
            }
        };

        if result.is_err() {
            remove_quietly(target.dest);
        }
        result
    }

    fn download_whole(
        &self,
        base: &DownloadRequest,
        dest: &Path,
        probed_total: Option<u64>,
        stop: &StopSignal,
        observer: &dyn ProgressObserver,
    ) -> CoreResult<u64> {
        debug!(url = %base.url, "single-stream fetch");
        let mut resp = self.net.get(base)?;
        if !resp.is_success() {
            return Err(CoreError::Transfer(format!("HTTP {}", resp.status_code)));
        }
        let expected = resp.content_length.filter(|len| *len > 0).or(probed_total);

        let mut last_fraction: Option<f64> = None;
        let mut emit = |downloaded: u64, fraction: f64| {
            if last_fraction != Some(fraction) {
                last_fraction = Some(fraction);
                observer.on_progress(ProgressEvent {
                    fraction,
                    downloaded,
                });
            }
        };

        let written = copy_body(
            resp.body.as_mut(),
            dest,
            self.buffer_size,
            stop,
            &mut |n| {
                if let Some(total) = expected {
                    emit(n, fraction_of(n, total));
                }
            },
        )?;

        if let Some(total) = expected {
            if written != total {
                return Err(CoreError::Transfer(format!(
                    "stream ended after {} of {} bytes",
                    written, total
                )));
            }
        }
        emit(written, 1.0);
        Ok(written)
    }

    fn download_segmented(
        &self,
        base: &DownloadRequest,
        target: StreamTarget<'_>,
        total: u64,
        stop: &StopSignal,
        observer: &dyn ProgressObserver,
    ) -> CoreResult<u64> {
        let segments = build_segments(total, self.segment_count);
        let paths: Vec<PathBuf> = segments
            .iter()
            .map(|segment| segment_path(target.segment_prefix, segment.index))
            .collect();
        info!(
            url = %base.url,
            total_bytes = total,
            segments = segments.len(),
            "segmented fetch"
        );

        let result = self
            .fetch_all(base, &segments, &paths, total, stop, observer)
            .and_then(|_| concat_segments(&paths, target.dest, total));

        for path in &paths {
            remove_quietly(path);
        }
        result
    }

    fn fetch_all(
        &self,
        base: &DownloadRequest,
        segments: &[Segment],
        paths: &[PathBuf],
        total: u64,
        stop: &StopSignal,
        observer: &dyn ProgressObserver,
    ) -> CoreResult<()> {
        let accumulator = ProgressAccumulator::new(total, segments.len(), observer);
        let child = stop.child();
        let net = self.net;
        let buffer_size = self.buffer_size;

        let results: Vec<CoreResult<u64>> = thread::scope(|scope| {
            let handles: Vec<_> = segments
                .iter()
                .zip(paths)
                .map(|(segment, path)| {
                    let accumulator = &accumulator;
                    let child = &child;
                    scope.spawn(move || {
                        let result = fetch_segment(
                            net,
                            base,
                            segment,
                            path,
                            buffer_size,
                            child,
                            &mut |n| accumulator.report(segment.index as usize, n),
                        );
                        if let Err(err) = &result {
                            if !err.is_cancelled() {
                                debug!(segment = segment.index, error = %err, "segment failed, stopping siblings");
                                child.abort();
                            }
                        }
                        result
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(CoreError::Transfer("segment worker panicked".to_string())))
                })
                .collect()
        });

        if stop.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        let mut first_cancel = None;
        for result in results {
            match result {
                Ok(_) => {}
                Err(CoreError::Cancelled) => first_cancel = Some(CoreError::Cancelled),
                Err(err) => return Err(err),
            }
        }
        match first_cancel {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn concat_segments(paths: &[PathBuf], dest: &Path, expected: u64) -> CoreResult<u64> {
    let file = File::create(dest).map_err(|err| CoreError::Io(err.to_string()))?;
    let mut writer = BufWriter::new(file);
    let mut written = 0u64;
    for path in paths {
        let mut part = File::open(path).map_err(|err| CoreError::Io(err.to_string()))?;
        written += io::copy(&mut part, &mut writer).map_err(|err| CoreError::Io(err.to_string()))?;
    }
    writer
        .flush()
        .map_err(|err| CoreError::Io(err.to_string()))?;
    if written != expected {
        return Err(CoreError::Io(format!(
            "concatenated {} bytes, expected {}",
            written, expected
        )));
    }
    Ok(written)
}
