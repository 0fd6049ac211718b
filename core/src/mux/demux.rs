use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use bytes::Bytes;
use tracing::{debug, trace};

use super::boxes::{box_at, children, find_first_box, find_path, fourcc_to_string, BodyReader, BoxView};
use crate::error::{CoreError, CoreResult};

/// Index boxes larger than this are treated as corrupt rather than loaded.
const MAX_INDEX_BOX: u64 = 256 * 1024 * 1024;

/// `sample_is_non_sync_sample` in ISO-BMFF sample flags.
const NON_SYNC_FLAG: u32 = 0x0001_0000;

#[derive(Debug, Clone, PartialEq)]
pub struct TrackFormat {
    pub track_id: u32,
    pub handler: [u8; 4],
    pub mime: &'static str,
    pub timescale: u32,
    /// Packed ISO-639-2 code as stored in `mdhd`.
    pub language: u16,
    pub width: u16,
    pub height: u16,
    /// Raw sample entry box (`avc1`, `mp4a`, ...) including its header.
    pub sample_entry: Bytes,
}

impl TrackFormat {
    pub fn is_video(&self) -> bool {
        self.mime.starts_with("video/")
    }

    pub fn is_audio(&self) -> bool {
        self.mime.starts_with("audio/")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    /// Absolute position of the sample data in the source file.
    pub offset: u64,
    pub size: u32,
    pub dts: u64,
    pub duration: u32,
    pub cts_offset: i32,
    pub is_sync: bool,
}

#[derive(Debug, Clone)]
pub struct Track {
    pub format: TrackFormat,
    pub samples: Vec<Sample>,
}

pub fn mime_for(handler: &[u8; 4], fourcc: &[u8; 4]) -> &'static str {
    match (handler, fourcc) {
        (b"vide", b"avc1" | b"avc3") => "video/avc",
        (b"vide", b"hvc1" | b"hev1") => "video/hevc",
        (b"vide", b"av01") => "video/av01",
        (b"vide", b"vp09") => "video/x-vnd.on2.vp9",
        (b"soun", b"mp4a") => "audio/mp4a-latm",
        (b"soun", b"ac-3") => "audio/ac3",
        (b"soun", b"ec-3") => "audio/eac3",
        (b"soun", b"Opus") => "audio/opus",
        (b"soun", b"fLaC") => "audio/flac",
        _ => "application/octet-stream",
    }
}

fn malformed(what: &str) -> CoreError {
    CoreError::Mux(format!("malformed {}", what))
}

/// Demultiplexed view of one ISO-BMFF file. Sample payloads stay on disk and
/// are read on demand.
pub struct Mp4Source {
    file: File,
    tracks: Vec<Track>,
}

impl std::fmt::Debug for Mp4Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mp4Source")
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
struct TopBox {
    fourcc: [u8; 4],
    offset: u64,
    size: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct TrackDefaults {
    duration: u32,
    size: u32,
    flags: u32,
}

struct TrackBuilder {
    track: Track,
    defaults: TrackDefaults,
    next_dts: u64,
}

/// Caps the samples one file may declare. Every sample spends at least one
/// byte of the file length, so table counts cannot outgrow the file.
struct SampleBudget {
    remaining: u64,
}

impl SampleBudget {
    fn new(file_len: u64) -> Self {
        Self { remaining: file_len }
    }

    fn reserve(&self, count: u64) -> Option<()> {
        (count <= self.remaining).then_some(())
    }

    fn spend(&mut self, size: u32) -> Option<()> {
        self.remaining = self.remaining.checked_sub(u64::from(size.max(1)))?;
        Some(())
    }
}

impl Mp4Source {
    pub fn open(path: &Path) -> CoreResult<Self> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let top = scan_top_level(&mut file, file_len)?;

        let moov = top
            .iter()
            .find(|b| &b.fourcc == b"moov")
            .ok_or_else(|| CoreError::Mux(format!("no moov box in {}", path.display())))?;
        let moov_data = load_box(&mut file, moov)?;
        let mut budget = SampleBudget::new(file_len);
        let mut builders = parse_moov(&moov_data, &mut budget)?;

        for moof in top.iter().filter(|b| &b.fourcc == b"moof") {
            let data = load_box(&mut file, moof)?;
            parse_moof(&data, moof.offset, &mut builders, &mut budget)?;
        }

        let tracks: Vec<Track> = builders.into_iter().map(|b| b.track).collect();
        for track in &tracks {
            if let Some(bad) = track.samples.iter().find(|s| {
                s.offset
                    .checked_add(u64::from(s.size))
                    .map_or(true, |end| end > file_len)
            }) {
                return Err(CoreError::Mux(format!(
                    "sample at {} overruns {}",
                    bad.offset,
                    path.display()
                )));
            }
            debug!(
                track_id = track.format.track_id,
                mime = track.format.mime,
                samples = track.samples.len(),
                "demuxed track"
            );
        }
        Ok(Self { file, tracks })
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// First track whose mime type starts with `prefix` (`"video/"`, `"audio/"`).
    pub fn track_with_mime_prefix(&self, prefix: &str) -> Option<&Track> {
        self.tracks.iter().find(|t| t.format.mime.starts_with(prefix))
    }

    pub fn read_sample(&mut self, sample: &Sample, buf: &mut Vec<u8>) -> CoreResult<()> {
        buf.resize(sample.size as usize, 0);
        self.file.seek(SeekFrom::Start(sample.offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }
}

fn scan_top_level(file: &mut File, file_len: u64) -> CoreResult<Vec<TopBox>> {
    let mut boxes = Vec::new();
    let mut offset = 0u64;
    while offset + 8 <= file_len {
        file.seek(SeekFrom::Start(offset))?;
        let mut header = [0u8; 16];
        let available = (file_len - offset).min(16) as usize;
        file.read_exact(&mut header[..available])?;

        let raw = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as u64;
        let fourcc = [header[4], header[5], header[6], header[7]];
        let (size, header_size) = match raw {
            0 => (file_len - offset, 8),
            1 if available == 16 => {
                let mut ext = [0u8; 8];
                ext.copy_from_slice(&header[8..16]);
                (u64::from_be_bytes(ext), 16)
            }
            1 => return Err(malformed("extended box header")),
            _ => (raw, 8),
        };
        if size < header_size || size > file_len - offset {
            return Err(CoreError::Mux(format!(
                "box '{}' at {} has invalid size {}",
                fourcc_to_string(&fourcc),
                offset,
                size
            )));
        }
        trace!(fourcc = %fourcc_to_string(&fourcc), offset, size, "top-level box");
        boxes.push(TopBox {
            fourcc,
            offset,
            size,
        });
        offset += size;
    }
    Ok(boxes)
}

fn load_box(file: &mut File, top: &TopBox) -> CoreResult<Bytes> {
    if top.size > MAX_INDEX_BOX {
        return Err(CoreError::Mux(format!(
            "'{}' box too large: {} bytes",
            fourcc_to_string(&top.fourcc),
            top.size
        )));
    }
    let mut data = vec![0u8; top.size as usize];
    file.seek(SeekFrom::Start(top.offset))?;
    file.read_exact(&mut data)?;
    Ok(Bytes::from(data))
}

fn body<'a>(data: &'a Bytes, view: &BoxView) -> &'a [u8] {
    &data[view.body_start..view.body_end]
}

fn parse_moov(data: &Bytes, budget: &mut SampleBudget) -> CoreResult<Vec<TrackBuilder>> {
    let moov = box_at(data, 0, data.len()).ok_or_else(|| malformed("moov"))?;
    let mut builders = Vec::new();
    for trak in children(data, moov.body_start, moov.body_end)
        .into_iter()
        .filter(|b| &b.fourcc == b"trak")
    {
        builders.push(parse_trak(data, &trak, budget)?);
    }

    if let Some(mvex) = find_first_box(data, moov.body_start, moov.body_end, *b"mvex") {
        for trex in children(data, mvex.body_start, mvex.body_end)
            .into_iter()
            .filter(|b| &b.fourcc == b"trex")
        {
            let (mut r, _, _) = BodyReader::full_box(body(data, &trex)).ok_or_else(|| malformed("trex"))?;
            let track_id = r.u32().ok_or_else(|| malformed("trex"))?;
            r.skip(4).ok_or_else(|| malformed("trex"))?;
            let defaults = TrackDefaults {
                duration: r.u32().ok_or_else(|| malformed("trex"))?,
                size: r.u32().ok_or_else(|| malformed("trex"))?,
                flags: r.u32().ok_or_else(|| malformed("trex"))?,
            };
            if let Some(builder) = builders
                .iter_mut()
                .find(|b| b.track.format.track_id == track_id)
            {
                builder.defaults = defaults;
            }
        }
    }
    Ok(builders)
}

fn parse_trak(data: &Bytes, trak: &BoxView, budget: &mut SampleBudget) -> CoreResult<TrackBuilder> {
    let tkhd = find_path(data, trak, &[*b"tkhd"]).ok_or_else(|| malformed("trak: missing tkhd"))?;
    let (mut r, version, _) = BodyReader::full_box(body(data, &tkhd)).ok_or_else(|| malformed("tkhd"))?;
    r.versioned(version).ok_or_else(|| malformed("tkhd"))?;
    r.versioned(version).ok_or_else(|| malformed("tkhd"))?;
    let track_id = r.u32().ok_or_else(|| malformed("tkhd"))?;

    let mdhd = find_path(data, trak, &[*b"mdia", *b"mdhd"]).ok_or_else(|| malformed("trak: missing mdhd"))?;
    let (mut r, version, _) = BodyReader::full_box(body(data, &mdhd)).ok_or_else(|| malformed("mdhd"))?;
    r.versioned(version).ok_or_else(|| malformed("mdhd"))?;
    r.versioned(version).ok_or_else(|| malformed("mdhd"))?;
    let timescale = r.u32().ok_or_else(|| malformed("mdhd"))?;
    r.versioned(version).ok_or_else(|| malformed("mdhd"))?;
    let language = r.u16().ok_or_else(|| malformed("mdhd"))?;
    if timescale == 0 {
        return Err(malformed("mdhd: zero timescale"));
    }

    let hdlr = find_path(data, trak, &[*b"mdia", *b"hdlr"]).ok_or_else(|| malformed("trak: missing hdlr"))?;
    let (mut r, _, _) = BodyReader::full_box(body(data, &hdlr)).ok_or_else(|| malformed("hdlr"))?;
    r.skip(4).ok_or_else(|| malformed("hdlr"))?;
    let handler = r.fourcc().ok_or_else(|| malformed("hdlr"))?;

    let stbl = find_path(data, trak, &[*b"mdia", *b"minf", *b"stbl"])
        .ok_or_else(|| malformed("trak: missing stbl"))?;
    let stsd = find_first_box(data, stbl.body_start, stbl.body_end, *b"stsd")
        .ok_or_else(|| malformed("stbl: missing stsd"))?;
    let entry = box_at(data, stsd.body_start + 8, stsd.body_end).ok_or_else(|| malformed("stsd"))?;

    let (mut width, mut height) = (0, 0);
    if &handler == b"vide" {
        let mut r = BodyReader::new(&data[entry.body_start..entry.body_end]);
        r.skip(24).ok_or_else(|| malformed("visual sample entry"))?;
        width = r.u16().ok_or_else(|| malformed("visual sample entry"))?;
        height = r.u16().ok_or_else(|| malformed("visual sample entry"))?;
    }

    let format = TrackFormat {
        track_id,
        handler,
        mime: mime_for(&handler, &entry.fourcc),
        timescale,
        language,
        width,
        height,
        sample_entry: data.slice(entry.start..entry.end),
    };
    let samples = progressive_samples(data, &stbl, budget)?;
    let next_dts = match samples.last() {
        Some(s) => s
            .dts
            .checked_add(u64::from(s.duration))
            .ok_or_else(|| malformed("stts: decode time overflow"))?,
        None => 0,
    };

    Ok(TrackBuilder {
        track: Track { format, samples },
        defaults: TrackDefaults::default(),
        next_dts,
    })
}

/// Expands `stts/ctts/stss/stsc/stsz/stco|co64` into per-sample records.
fn progressive_samples(data: &Bytes, stbl: &BoxView, budget: &mut SampleBudget) -> CoreResult<Vec<Sample>> {
    let find = |fourcc: &[u8; 4]| find_first_box(data, stbl.body_start, stbl.body_end, *fourcc);

    let sizes = match find(b"stsz") {
        Some(stsz) => read_stsz(body(data, &stsz), budget).ok_or_else(|| malformed("stsz"))?,
        None => Vec::new(),
    };
    if sizes.is_empty() {
        return Ok(Vec::new());
    }
    let n = sizes.len();

    let chunk_offsets = match (find(b"stco"), find(b"co64")) {
        (Some(stco), _) => read_table(body(data, &stco), |r| r.u32().map(u64::from)),
        (None, Some(co64)) => read_table(body(data, &co64), |r| r.u64()),
        (None, None) => None,
    }
    .ok_or_else(|| malformed("chunk offset table"))?;

    let stsc = find(b"stsc")
        .and_then(|b| {
            read_table(body(data, &b), |r| {
                let first_chunk = r.u32()?;
                let per_chunk = r.u32()?;
                r.u32()?;
                Some((first_chunk, per_chunk))
            })
        })
        .ok_or_else(|| malformed("stsc"))?;

    let mut offsets = Vec::with_capacity(n);
    let mut run = 0usize;
    for (index, chunk_offset) in chunk_offsets.iter().enumerate() {
        let chunk_number = index as u32 + 1;
        while run + 1 < stsc.len() && stsc[run + 1].0 <= chunk_number {
            run += 1;
        }
        let per_chunk = stsc.get(run).map(|e| e.1).unwrap_or(0);
        let mut offset = *chunk_offset;
        for _ in 0..per_chunk {
            if offsets.len() == n {
                break;
            }
            offsets.push(offset);
            offset = offset
                .checked_add(u64::from(sizes[offsets.len() - 1]))
                .ok_or_else(|| malformed("chunk offset overflow"))?;
        }
    }
    if offsets.len() < n {
        return Err(malformed("stsc: fewer chunk slots than samples"));
    }

    let durations = expand_runs(find(b"stts").map(|b| body(data, &b)), n, |r| r.u32())
        .ok_or_else(|| malformed("stts"))?;
    let cts_offsets = expand_runs(find(b"ctts").map(|b| body(data, &b)), n, |r| r.i32())
        .ok_or_else(|| malformed("ctts"))?;
    let sync = match find(b"stss") {
        Some(stss) => {
            let numbers = read_table(body(data, &stss), |r| r.u32()).ok_or_else(|| malformed("stss"))?;
            let mut flags = vec![false; n];
            for number in numbers {
                if number >= 1 && (number as usize) <= n {
                    flags[number as usize - 1] = true;
                }
            }
            flags
        }
        None => vec![true; n],
    };

    let mut dts = 0u64;
    let mut samples = Vec::with_capacity(n);
    for i in 0..n {
        samples.push(Sample {
            offset: offsets[i],
            size: sizes[i],
            dts,
            duration: durations[i],
            cts_offset: cts_offsets[i],
            is_sync: sync[i],
        });
        dts = dts
            .checked_add(u64::from(durations[i]))
            .ok_or_else(|| malformed("stts: decode time overflow"))?;
    }
    Ok(samples)
}

fn read_stsz(body: &[u8], budget: &mut SampleBudget) -> Option<Vec<u32>> {
    let (mut r, _, _) = BodyReader::full_box(body)?;
    let uniform = r.u32()?;
    let count = r.u32()?;
    budget.reserve(u64::from(count) * u64::from(uniform.max(1)))?;
    let sizes = if uniform != 0 {
        vec![uniform; count as usize]
    } else {
        if count as usize > r.remaining() / 4 {
            return None;
        }
        (0..count).map(|_| r.u32()).collect::<Option<Vec<_>>>()?
    };
    for size in &sizes {
        budget.spend(*size)?;
    }
    Some(sizes)
}

/// Full box with an entry count followed by `count` entries.
fn read_table<T>(body: &[u8], mut entry: impl FnMut(&mut BodyReader<'_>) -> Option<T>) -> Option<Vec<T>> {
    let (mut r, _, _) = BodyReader::full_box(body)?;
    let count = r.u32()? as usize;
    let mut out = Vec::with_capacity(count.min(1 << 20));
    for _ in 0..count {
        out.push(entry(&mut r)?);
    }
    Some(out)
}

/// Run-length `(count, value)` tables such as `stts` and `ctts`. A missing
/// table or short runs leave the remaining samples at the default value.
fn expand_runs<T: Copy + Default>(
    body: Option<&[u8]>,
    n: usize,
    value: impl Fn(&mut BodyReader<'_>) -> Option<T>,
) -> Option<Vec<T>> {
    let mut out = Vec::with_capacity(n);
    if let Some(body) = body {
        let runs = read_table(body, |r| Some((r.u32()?, value(r)?)))?;
        for (count, v) in runs {
            for _ in 0..count {
                if out.len() == n {
                    break;
                }
                out.push(v);
            }
        }
    }
    out.resize(n, T::default());
    Some(out)
}

fn parse_moof(
    data: &Bytes,
    moof_offset: u64,
    builders: &mut [TrackBuilder],
    budget: &mut SampleBudget,
) -> CoreResult<()> {
    let moof = box_at(data, 0, data.len()).ok_or_else(|| malformed("moof"))?;
    for traf in children(data, moof.body_start, moof.body_end)
        .into_iter()
        .filter(|b| &b.fourcc == b"traf")
    {
        parse_traf(data, &traf, moof_offset, builders, budget).ok_or_else(|| malformed("traf"))?;
    }
    Ok(())
}

/// `None` on any truncated field, overflowing offset or decode time, or a
/// sample count the file cannot hold.
fn parse_traf(
    data: &Bytes,
    traf: &BoxView,
    moof_offset: u64,
    builders: &mut [TrackBuilder],
    budget: &mut SampleBudget,
) -> Option<()> {
    let tfhd = find_first_box(data, traf.body_start, traf.body_end, *b"tfhd")?;
    let (mut r, _, flags) = BodyReader::full_box(body(data, &tfhd))?;
    let track_id = r.u32()?;
    let Some(builder) = builders
        .iter_mut()
        .find(|b| b.track.format.track_id == track_id)
    else {
        debug!(track_id, "fragment for unknown track skipped");
        return Some(());
    };

    let explicit_base = if flags & 0x01 != 0 { Some(r.u64()?) } else { None };
    if flags & 0x02 != 0 {
        r.skip(4)?;
    }
    let mut defaults = builder.defaults;
    if flags & 0x08 != 0 {
        defaults.duration = r.u32()?;
    }
    if flags & 0x10 != 0 {
        defaults.size = r.u32()?;
    }
    if flags & 0x20 != 0 {
        defaults.flags = r.u32()?;
    }
    let base_offset = explicit_base.unwrap_or(moof_offset);

    let mut dts = match find_first_box(data, traf.body_start, traf.body_end, *b"tfdt") {
        Some(tfdt) => {
            let (mut r, version, _) = BodyReader::full_box(body(data, &tfdt))?;
            r.versioned(version)?
        }
        None => builder.next_dts,
    };

    let mut cursor = base_offset;
    for trun in children(data, traf.body_start, traf.body_end)
        .into_iter()
        .filter(|b| &b.fourcc == b"trun")
    {
        let (mut r, _, tr_flags) = BodyReader::full_box(body(data, &trun))?;
        let count = r.u32()?;
        if tr_flags & 0x001 != 0 {
            let data_offset = r.i32()?;
            cursor = base_offset.checked_add_signed(i64::from(data_offset))?;
        }
        let first_flags = if tr_flags & 0x004 != 0 { Some(r.u32()?) } else { None };

        budget.reserve(u64::from(count))?;
        let entry_len = [0x100, 0x200, 0x400, 0x800]
            .iter()
            .filter(|bit| tr_flags & **bit != 0)
            .count()
            * 4;
        if entry_len > 0 && count as usize > r.remaining() / entry_len {
            return None;
        }

        for i in 0..count {
            let duration = if tr_flags & 0x100 != 0 { r.u32()? } else { defaults.duration };
            let size = if tr_flags & 0x200 != 0 { r.u32()? } else { defaults.size };
            let sample_flags = if tr_flags & 0x400 != 0 {
                r.u32()?
            } else if i == 0 {
                first_flags.unwrap_or(defaults.flags)
            } else {
                defaults.flags
            };
            let cts_offset = if tr_flags & 0x800 != 0 { r.i32()? } else { 0 };

            builder.track.samples.push(Sample {
                offset: cursor,
                size,
                dts,
                duration,
                cts_offset,
                is_sync: sample_flags & NON_SYNC_FLAG == 0,
            });
            budget.spend(size)?;
            cursor = cursor.checked_add(u64::from(size))?;
            dts = dts.checked_add(u64::from(duration))?;
        }
    }
    builder.next_dts = dts;
    Some(())
}
