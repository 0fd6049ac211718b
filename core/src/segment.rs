use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use tracing::{debug, trace};

use crate::cancel::{ChildStop, StopSignal};
use crate::error::{CoreError, CoreResult};
use crate::net::{classify_io_error, DownloadRequest, NetClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub index: u32,
    pub range_start: u64,
    /// Inclusive.
    pub range_end: u64,
}

impl Segment {
    pub fn new(index: u32, range_start: u64, range_end: u64) -> Self {
        Self {
            index,
            range_start,
            range_end,
        }
    }

    pub fn size(&self) -> u64 {
        if self.range_end >= self.range_start {
            self.range_end - self.range_start + 1
        } else {
            0
        }
    }
}

/// Splits `[0, total_bytes)` into `count` equal contiguous ranges; the last
/// one absorbs the remainder.
pub fn build_segments(total_bytes: u64, count: u32) -> Vec<Segment> {
    if total_bytes == 0 {
        return Vec::new();
    }
    let count = (count.max(1) as u64).min(total_bytes);
    let base = total_bytes / count;

    let mut segments = Vec::with_capacity(count as usize);
    let mut start = 0u64;
    for index in 0..count {
        let end = if index == count - 1 {
            total_bytes - 1
        } else {
            start + base - 1
        };
        segments.push(Segment::new(index as u32, start, end));
        start = end + 1;
    }
    segments
}

pub(crate) trait StopCheck {
    fn should_stop(&self) -> bool;
}

impl StopCheck for StopSignal {
    fn should_stop(&self) -> bool {
        self.is_stopped()
    }
}

impl StopCheck for ChildStop<'_> {
    fn should_stop(&self) -> bool {
        self.is_stopped()
    }
}

/// Copies `body` into `dest`, checking `stop` before every read and reporting
/// the running byte count after every write.
pub(crate) fn copy_body(
    body: &mut dyn Read,
    dest: &Path,
    buffer_size: usize,
    stop: &dyn StopCheck,
    on_bytes: &mut dyn FnMut(u64),
) -> CoreResult<u64> {
    let file = File::create(dest).map_err(|err| CoreError::Io(err.to_string()))?;
    let mut writer = BufWriter::new(file);
    let mut buffer = vec![0u8; buffer_size.max(1024)];
    let mut written = 0u64;
    loop {
        if stop.should_stop() {
            return Err(CoreError::Cancelled);
        }
        let read = body.read(&mut buffer).map_err(classify_io_error)?;
        if read == 0 {
            break;
        }
        writer
            .write_all(&buffer[..read])
            .map_err(|err| CoreError::Io(err.to_string()))?;
        written += read as u64;
        on_bytes(written);
    }
    writer
        .flush()
        .map_err(|err| CoreError::Io(err.to_string()))?;
    Ok(written)
}

/// Downloads one inclusive byte range into `dest`. Anything but `206` is a
/// segment error carrying the status; a short body is reported the same way.
pub(crate) fn fetch_segment(
    net: &dyn NetClient,
    base: &DownloadRequest,
    segment: &Segment,
    dest: &Path,
    buffer_size: usize,
    stop: &ChildStop<'_>,
    on_bytes: &mut dyn FnMut(u64),
) -> CoreResult<u64> {
    if stop.is_stopped() {
        return Err(CoreError::Cancelled);
    }
    let req = base.with_range(segment.range_start, segment.range_end);
    let mut resp = net.get(&req)?;
    if resp.status_code != 206 {
        return Err(CoreError::Segment {
            index: segment.index,
            status: resp.status_code,
        });
    }
    trace!(segment = segment.index, start = segment.range_start, end = segment.range_end, "segment request accepted");

    let written = copy_body(resp.body.as_mut(), dest, buffer_size, stop, on_bytes)?;
    if written != segment.size() {
        debug!(
            segment = segment.index,
            expected = segment.size(),
            written,
            "segment body length mismatch"
        );
        return Err(CoreError::Segment {
            index: segment.index,
            status: resp.status_code,
        });
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{patterned_bytes, FakeNetClient, FakeResource};
    use std::fs;

    #[test]
    fn equal_segments_last_absorbs_remainder() {
        let segments = build_segments(10_000_000, 4);
        let sizes: Vec<u64> = segments.iter().map(|s| s.size()).collect();
        assert_eq!(sizes, vec![2_500_000; 4]);

        let segments = build_segments(10, 4);
        let sizes: Vec<u64> = segments.iter().map(|s| s.size()).collect();
        assert_eq!(sizes, vec![2, 2, 2, 4]);
        assert_eq!(segments.last().unwrap().range_end, 9);
        for pair in segments.windows(2) {
            assert_eq!(pair[0].range_end + 1, pair[1].range_start);
        }
    }

    #[test]
    fn tiny_totals_never_produce_empty_segments() {
        assert!(build_segments(0, 4).is_empty());
        let segments = build_segments(3, 8);
        assert_eq!(segments.len(), 3);
        assert!(segments.iter().all(|s| s.size() == 1));
    }

    #[test]
    fn fetches_exact_range_and_reports_cumulative_bytes() {
        let data = patterned_bytes(100_000);
        let net = FakeNetClient::new().serve("https://cdn/v", FakeResource::new(data.clone()));
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("seg1.tmp");
        let segment = Segment::new(1, 25_000, 49_999);
        let parent = StopSignal::new();
        let stop = parent.child();
        let mut reports = Vec::new();

        let written = fetch_segment(
            &net,
            &DownloadRequest::new("https://cdn/v"),
            &segment,
            &dest,
            4096,
            &stop,
            &mut |n| reports.push(n),
        )
        .unwrap();

        assert_eq!(written, 25_000);
        assert_eq!(fs::read(&dest).unwrap(), &data[25_000..50_000]);
        assert_eq!(reports.last(), Some(&25_000));
        assert!(reports.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(net.requests()[0].range, Some((25_000, 49_999)));
    }

    #[test]
    fn non_partial_status_is_segment_error() {
        let mut resource = FakeResource::new(patterned_bytes(1000));
        resource.fail_range_at = Some((0, 503));
        let net = FakeNetClient::new().serve("https://cdn/v", resource);
        let dir = tempfile::tempdir().unwrap();
        let parent = StopSignal::new();
        let stop = parent.child();

        let err = fetch_segment(
            &net,
            &DownloadRequest::new("https://cdn/v"),
            &Segment::new(0, 0, 499),
            &dir.path().join("seg0.tmp"),
            4096,
            &stop,
            &mut |_| {},
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::Segment { index: 0, status: 503 }));
    }

    #[test]
    fn stop_is_observed_inside_the_copy_loop() {
        let data = patterned_bytes(64 * 1024);
        let dir = tempfile::tempdir().unwrap();
        let signal = StopSignal::new();
        let mut calls = 0;
        let err = copy_body(
            &mut data.as_slice(),
            &dir.path().join("out.tmp"),
            1024,
            &signal,
            &mut |_| {
                calls += 1;
                if calls == 3 {
                    signal.cancel();
                }
            },
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
        assert_eq!(calls, 3);
    }
}
