//! Shared fakes for unit tests: an in-memory `NetClient` and ISO-BMFF
//! builders for synthetic elementary streams.

use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crate::error::{CoreError, CoreResult};
use crate::net::{DownloadRequest, HeadResponse, NetClient, StreamResponse};

#[derive(Debug, Clone)]
pub struct FakeResource {
    pub data: Vec<u8>,
    pub accept_ranges: bool,
    pub head_status: u16,
    pub get_status: u16,
    /// Ranged requests starting at this offset answer with this status.
    pub fail_range_at: Option<(u64, u16)>,
    pub unreachable: bool,
    pub chunk_size: usize,
    pub read_delay: Option<Duration>,
}

impl FakeResource {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            accept_ranges: true,
            head_status: 200,
            get_status: 200,
            fail_range_at: None,
            unreachable: false,
            chunk_size: 16 * 1024,
            read_delay: None,
        }
    }

    pub fn without_ranges(mut self) -> Self {
        self.accept_ranges = false;
        self
    }

    pub fn slow(mut self, chunk_size: usize, delay: Duration) -> Self {
        self.chunk_size = chunk_size;
        self.read_delay = Some(delay);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub method: &'static str,
    pub url: String,
    pub range: Option<(u64, u64)>,
    pub headers: HashMap<String, String>,
}

#[derive(Default)]
pub struct FakeNetClient {
    resources: Mutex<HashMap<String, FakeResource>>,
    requests: Mutex<Vec<RecordedRequest>>,
    gets: AtomicUsize,
}

impl FakeNetClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(self, url: &str, resource: FakeResource) -> Self {
        self.resources
            .lock()
            .unwrap()
            .insert(url.to_string(), resource);
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    fn record(&self, method: &'static str, req: &DownloadRequest) -> CoreResult<FakeResource> {
        self.requests.lock().unwrap().push(RecordedRequest {
            method,
            url: req.url.clone(),
            range: req.range,
            headers: req.headers.clone(),
        });
        let resource = self
            .resources
            .lock()
            .unwrap()
            .get(&req.url)
            .cloned()
            .ok_or_else(|| CoreError::Transfer(format!("no route for {}", req.url)))?;
        if resource.unreachable {
            return Err(CoreError::Network(format!("connection refused: {}", req.url)));
        }
        Ok(resource)
    }
}

impl NetClient for FakeNetClient {
    fn head(&self, req: &DownloadRequest) -> CoreResult<HeadResponse> {
        let resource = self.record("HEAD", req)?;
        Ok(HeadResponse {
            status_code: resource.head_status,
            total_bytes: Some(resource.data.len() as u64),
            accept_ranges: resource.accept_ranges,
        })
    }

    fn get(&self, req: &DownloadRequest) -> CoreResult<StreamResponse> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let resource = self.record("GET", req)?;
        let (status, body) = match req.range {
            Some((start, _)) if resource.fail_range_at.map(|(at, _)| at) == Some(start) => {
                let status = resource.fail_range_at.map(|(_, s)| s).unwrap_or(500);
                (status, Vec::new())
            }
            Some((start, end)) if resource.accept_ranges => {
                let end = (end as usize).min(resource.data.len().saturating_sub(1));
                (206, resource.data[start as usize..=end].to_vec())
            }
            _ => (resource.get_status, resource.data.clone()),
        };
        Ok(StreamResponse {
            status_code: status,
            content_length: Some(body.len() as u64),
            body: Box::new(ChunkedBody {
                data: body,
                pos: 0,
                chunk_size: resource.chunk_size,
                delay: resource.read_delay,
            }),
        })
    }
}

struct ChunkedBody {
    data: Vec<u8>,
    pos: usize,
    chunk_size: usize,
    delay: Option<Duration>,
}

impl Read for ChunkedBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        let remaining = self.data.len() - self.pos;
        let n = remaining.min(buf.len()).min(self.chunk_size);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Deterministic non-repeating filler so misplaced bytes show up in
/// comparisons.
pub fn patterned_bytes(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u64).wrapping_mul(2_654_435_761) >> 13) as u8)
        .collect()
}

// ---------------------------------------------------------------------------
// ISO-BMFF builders
// ---------------------------------------------------------------------------

pub fn make_box(fourcc: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let size = (8 + body.len()) as u32;
    let mut out = Vec::with_capacity(size as usize);
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(fourcc);
    out.extend_from_slice(body);
    out
}

pub fn make_full_box(fourcc: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + payload.len());
    body.push(version);
    body.extend_from_slice(&flags.to_be_bytes()[1..]);
    body.extend_from_slice(payload);
    make_box(fourcc, &body)
}

pub fn make_visual_sample_entry(fourcc: &[u8; 4], width: u16, height: u16) -> Vec<u8> {
    let mut body = vec![0u8; 6];
    body.extend_from_slice(&1u16.to_be_bytes());
    body.extend_from_slice(&[0u8; 16]);
    body.extend_from_slice(&width.to_be_bytes());
    body.extend_from_slice(&height.to_be_bytes());
    body.extend_from_slice(&0x0048_0000u32.to_be_bytes());
    body.extend_from_slice(&0x0048_0000u32.to_be_bytes());
    body.extend_from_slice(&[0u8; 4]);
    body.extend_from_slice(&1u16.to_be_bytes());
    body.extend_from_slice(&[0u8; 32]);
    body.extend_from_slice(&0x0018u16.to_be_bytes());
    body.extend_from_slice(&(-1i16).to_be_bytes());
    body.extend_from_slice(&make_box(b"avcC", &[1, 0x64, 0, 0x1f, 0xff, 0xe0, 0]));
    make_box(fourcc, &body)
}

pub fn make_audio_sample_entry(fourcc: &[u8; 4]) -> Vec<u8> {
    let mut body = vec![0u8; 6];
    body.extend_from_slice(&1u16.to_be_bytes());
    body.extend_from_slice(&[0u8; 8]);
    body.extend_from_slice(&2u16.to_be_bytes());
    body.extend_from_slice(&16u16.to_be_bytes());
    body.extend_from_slice(&[0u8; 4]);
    body.extend_from_slice(&(44_100u32 << 16).to_be_bytes());
    body.extend_from_slice(&make_full_box(b"esds", 0, 0, &[3, 0x19, 0, 1, 0]));
    make_box(fourcc, &body)
}

#[derive(Debug, Clone)]
pub struct TestSample {
    pub data: Vec<u8>,
    pub duration: u32,
    pub cts_offset: i32,
    pub is_sync: bool,
}

pub fn samples(count: usize, size: usize, duration: u32, seed: u8) -> Vec<TestSample> {
    (0..count)
        .map(|i| TestSample {
            data: (0..size + i)
                .map(|j| seed.wrapping_add((i * 31 + j) as u8))
                .collect(),
            duration,
            cts_offset: if i % 3 == 1 { duration as i32 * 2 } else { 0 },
            is_sync: i % 4 == 0,
        })
        .collect()
}

fn make_trak_header(track_id: u32, handler: &[u8; 4], timescale: u32, sample_entry: &[u8]) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    let mut tkhd = Vec::new();
    tkhd.extend_from_slice(&0u32.to_be_bytes());
    tkhd.extend_from_slice(&0u32.to_be_bytes());
    tkhd.extend_from_slice(&track_id.to_be_bytes());
    tkhd.extend_from_slice(&[0u8; 4]);
    tkhd.extend_from_slice(&0u32.to_be_bytes());
    tkhd.extend_from_slice(&[0u8; 52]);
    tkhd.extend_from_slice(&(640u32 << 16).to_be_bytes());
    tkhd.extend_from_slice(&(360u32 << 16).to_be_bytes());
    let tkhd = make_full_box(b"tkhd", 0, 3, &tkhd);

    let mut mdhd = Vec::new();
    mdhd.extend_from_slice(&0u32.to_be_bytes());
    mdhd.extend_from_slice(&0u32.to_be_bytes());
    mdhd.extend_from_slice(&timescale.to_be_bytes());
    mdhd.extend_from_slice(&0u32.to_be_bytes());
    mdhd.extend_from_slice(&0x55c4u16.to_be_bytes());
    mdhd.extend_from_slice(&0u16.to_be_bytes());
    let mdhd = make_full_box(b"mdhd", 0, 0, &mdhd);

    let mut hdlr = vec![0u8; 4];
    hdlr.extend_from_slice(handler);
    hdlr.extend_from_slice(&[0u8; 12]);
    hdlr.extend_from_slice(b"test\0");
    let hdlr = make_full_box(b"hdlr", 0, 0, &hdlr);

    let mut stsd = 1u32.to_be_bytes().to_vec();
    stsd.extend_from_slice(sample_entry);
    let stsd = make_full_box(b"stsd", 0, 0, &stsd);

    let mut mdia_head = mdhd;
    mdia_head.extend_from_slice(&hdlr);
    (tkhd, mdia_head, stsd)
}

fn wrap_trak(tkhd: Vec<u8>, mdia_head: Vec<u8>, stbl_body: Vec<u8>) -> Vec<u8> {
    let stbl = make_box(b"stbl", &stbl_body);
    let minf = make_box(b"minf", &stbl);
    let mut mdia_body = mdia_head;
    mdia_body.extend_from_slice(&minf);
    let mdia = make_box(b"mdia", &mdia_body);
    let mut trak_body = tkhd;
    trak_body.extend_from_slice(&mdia);
    make_box(b"trak", &trak_body)
}

/// Progressive single-track file: `ftyp`, `mdat`, `moov` with one chunk per
/// two samples.
pub fn progressive_mp4(
    handler: &[u8; 4],
    sample_entry: &[u8],
    timescale: u32,
    track_samples: &[TestSample],
) -> Vec<u8> {
    let ftyp = make_box(b"ftyp", b"isom\0\0\x02\0isomiso2mp41");
    let mut mdat_body = Vec::new();
    let mut chunk_offsets = Vec::new();
    let mdat_data_start = (ftyp.len() + 8) as u64;
    for (i, sample) in track_samples.iter().enumerate() {
        if i % 2 == 0 {
            chunk_offsets.push(mdat_data_start + mdat_body.len() as u64);
        }
        mdat_body.extend_from_slice(&sample.data);
    }
    let mdat = make_box(b"mdat", &mdat_body);

    let (tkhd, mdia_head, stsd) = make_trak_header(1, handler, timescale, sample_entry);

    let mut stts = (track_samples.len() as u32).to_be_bytes().to_vec();
    for sample in track_samples {
        stts.extend_from_slice(&1u32.to_be_bytes());
        stts.extend_from_slice(&sample.duration.to_be_bytes());
    }
    let stts = make_full_box(b"stts", 0, 0, &stts);

    let mut ctts = (track_samples.len() as u32).to_be_bytes().to_vec();
    for sample in track_samples {
        ctts.extend_from_slice(&1u32.to_be_bytes());
        ctts.extend_from_slice(&sample.cts_offset.to_be_bytes());
    }
    let ctts = make_full_box(b"ctts", 1, 0, &ctts);

    let sync: Vec<u32> = track_samples
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_sync)
        .map(|(i, _)| i as u32 + 1)
        .collect();
    let mut stss = (sync.len() as u32).to_be_bytes().to_vec();
    for n in &sync {
        stss.extend_from_slice(&n.to_be_bytes());
    }
    let stss = make_full_box(b"stss", 0, 0, &stss);

    let mut stsc = 1u32.to_be_bytes().to_vec();
    stsc.extend_from_slice(&1u32.to_be_bytes());
    stsc.extend_from_slice(&2u32.to_be_bytes());
    stsc.extend_from_slice(&1u32.to_be_bytes());
    let stsc = make_full_box(b"stsc", 0, 0, &stsc);

    let mut stsz = 0u32.to_be_bytes().to_vec();
    stsz.extend_from_slice(&(track_samples.len() as u32).to_be_bytes());
    for sample in track_samples {
        stsz.extend_from_slice(&(sample.data.len() as u32).to_be_bytes());
    }
    let stsz = make_full_box(b"stsz", 0, 0, &stsz);

    let mut stco = (chunk_offsets.len() as u32).to_be_bytes().to_vec();
    for offset in &chunk_offsets {
        stco.extend_from_slice(&(*offset as u32).to_be_bytes());
    }
    let stco = make_full_box(b"stco", 0, 0, &stco);

    let stbl_body = [stsd, stts, ctts, stss, stsc, stsz, stco].concat();
    let trak = wrap_trak(tkhd, mdia_head, stbl_body);

    let mut mvhd = vec![0u8; 8];
    mvhd.extend_from_slice(&1000u32.to_be_bytes());
    mvhd.extend_from_slice(&[0u8; 84]);
    let mvhd = make_full_box(b"mvhd", 0, 0, &mvhd);
    let moov = make_box(b"moov", &[mvhd, trak].concat());

    [ftyp, mdat, moov].concat()
}

/// Fragmented single-track file in DASH layout: init (`ftyp` + `moov` with
/// `mvex/trex`) followed by one `moof`/`mdat` pair per fragment.
pub fn fragmented_mp4(
    handler: &[u8; 4],
    sample_entry: &[u8],
    timescale: u32,
    track_samples: &[TestSample],
    per_fragment: usize,
) -> Vec<u8> {
    let ftyp = make_box(b"ftyp", b"iso5\0\0\x02\0iso5iso6mp41");
    let (tkhd, mdia_head, stsd) = make_trak_header(1, handler, timescale, sample_entry);
    let empty_table = |fourcc: &[u8; 4]| make_full_box(fourcc, 0, 0, &0u32.to_be_bytes());
    let mut stsz_empty = 0u32.to_be_bytes().to_vec();
    stsz_empty.extend_from_slice(&0u32.to_be_bytes());
    let stbl_body = [
        stsd,
        empty_table(b"stts"),
        empty_table(b"stsc"),
        make_full_box(b"stsz", 0, 0, &stsz_empty),
        empty_table(b"stco"),
    ]
    .concat();
    let trak = wrap_trak(tkhd, mdia_head, stbl_body);

    let mut trex = 1u32.to_be_bytes().to_vec();
    trex.extend_from_slice(&1u32.to_be_bytes());
    trex.extend_from_slice(&0u32.to_be_bytes());
    trex.extend_from_slice(&0u32.to_be_bytes());
    trex.extend_from_slice(&0x0001_0000u32.to_be_bytes());
    let mvex = make_box(b"mvex", &make_full_box(b"trex", 0, 0, &trex));

    let mut mvhd = vec![0u8; 8];
    mvhd.extend_from_slice(&1000u32.to_be_bytes());
    mvhd.extend_from_slice(&[0u8; 84]);
    let mvhd = make_full_box(b"mvhd", 0, 0, &mvhd);
    let moov = make_box(b"moov", &[mvhd, trak, mvex].concat());

    let mut out = [ftyp, moov].concat();
    let mut decode_time = 0u64;
    for (seq, fragment) in track_samples.chunks(per_fragment.max(1)).enumerate() {
        let mfhd = make_full_box(b"mfhd", 0, 0, &(seq as u32 + 1).to_be_bytes());
        // default-base-is-moof
        let tfhd = make_full_box(b"tfhd", 0, 0x02_0000, &1u32.to_be_bytes());
        let tfdt = make_full_box(b"tfdt", 1, 0, &decode_time.to_be_bytes());

        let trun_flags = 0x000001 | 0x000100 | 0x000200 | 0x000400 | 0x000800;
        let mut trun = (fragment.len() as u32).to_be_bytes().to_vec();
        trun.extend_from_slice(&0i32.to_be_bytes());
        for sample in fragment {
            let flags: u32 = if sample.is_sync { 0x0200_0000 } else { 0x0101_0000 };
            trun.extend_from_slice(&sample.duration.to_be_bytes());
            trun.extend_from_slice(&(sample.data.len() as u32).to_be_bytes());
            trun.extend_from_slice(&flags.to_be_bytes());
            trun.extend_from_slice(&sample.cts_offset.to_be_bytes());
            decode_time += sample.duration as u64;
        }
        let mut trun = make_full_box(b"trun", 1, trun_flags, &trun);

        let traf_len = 8 + tfhd.len() + tfdt.len() + trun.len();
        let moof_len = 8 + mfhd.len() + traf_len;
        let data_offset = (moof_len + 8) as i32;
        trun[16..20].copy_from_slice(&data_offset.to_be_bytes());

        let traf = make_box(b"traf", &[tfhd, tfdt, trun].concat());
        let moof = make_box(b"moof", &[mfhd, traf].concat());
        let payload: Vec<u8> = fragment.iter().flat_map(|s| s.data.clone()).collect();
        let mdat = make_box(b"mdat", &payload);
        out.extend_from_slice(&moof);
        out.extend_from_slice(&mdat);
    }
    out
}
