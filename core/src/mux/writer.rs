use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use bytes::{BufMut, BytesMut};
use tracing::debug;

use super::boxes::{put_unity_matrix, write_box, write_full_box};
use super::demux::TrackFormat;
use crate::error::{CoreError, CoreResult};

const MOVIE_TIMESCALE: u32 = 1000;

/// Per-sample metadata carried through the muxer untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleInfo {
    pub dts: u64,
    pub duration: u32,
    pub cts_offset: i32,
    pub is_sync: bool,
}

#[derive(Debug, Clone, Copy)]
struct Chunk {
    offset: u64,
    samples: u32,
}

#[derive(Debug)]
struct MuxTrack {
    format: TrackFormat,
    sizes: Vec<u32>,
    infos: Vec<SampleInfo>,
    chunks: Vec<Chunk>,
}

impl MuxTrack {
    // write_sample keeps dts non-decreasing and `dts + duration` in range.
    fn media_duration(&self) -> u64 {
        match (self.infos.first(), self.infos.last()) {
            (Some(first), Some(last)) => last.dts + last.duration as u64 - first.dts,
            _ => 0,
        }
    }

    fn start_dts(&self) -> u64 {
        self.infos.first().map(|s| s.dts).unwrap_or(0)
    }

    /// `stts` deltas: the gap to the next sample's dts, and the declared
    /// duration for the last sample.
    fn decode_deltas(&self) -> impl Iterator<Item = u32> + '_ {
        self.infos
            .windows(2)
            .map(|pair| (pair[1].dts - pair[0].dts) as u32)
            .chain(self.infos.last().map(|s| s.duration))
    }

    fn check_timing(&self, info: &SampleInfo) -> CoreResult<()> {
        info.dts
            .checked_add(info.duration as u64)
            .ok_or_else(|| CoreError::Mux(format!("sample dts {} overflows", info.dts)))?;
        let Some(prev) = self.infos.last() else {
            return Ok(());
        };
        let delta = info.dts.checked_sub(prev.dts).ok_or_else(|| {
            CoreError::Mux(format!(
                "decode time goes backwards: {} after {}",
                info.dts, prev.dts
            ))
        })?;
        u32::try_from(delta)
            .map(|_| ())
            .map_err(|_| CoreError::Mux(format!("decode time gap of {} ticks", delta)))
    }
}

/// Progressive MP4 writer: `ftyp`, one 64-bit `mdat`, then `moov`.
///
/// Tracks are declared before [`Mp4Muxer::start`]; samples are appended in
/// the order given and a new chunk begins whenever the track changes.
pub struct Mp4Muxer {
    out: BufWriter<File>,
    tracks: Vec<MuxTrack>,
    started: bool,
    mdat_header_at: u64,
    position: u64,
    last_track: Option<usize>,
}

impl Mp4Muxer {
    pub fn create(path: &Path) -> CoreResult<Self> {
        let file = File::create(path)?;
        Ok(Self {
            out: BufWriter::new(file),
            tracks: Vec::new(),
            started: false,
            mdat_header_at: 0,
            position: 0,
            last_track: None,
        })
    }

    pub fn add_track(&mut self, format: &TrackFormat) -> CoreResult<usize> {
        if self.started {
            return Err(CoreError::Mux("tracks must be added before start".to_string()));
        }
        self.tracks.push(MuxTrack {
            format: format.clone(),
            sizes: Vec::new(),
            infos: Vec::new(),
            chunks: Vec::new(),
        });
        Ok(self.tracks.len() - 1)
    }

    pub fn start(&mut self) -> CoreResult<()> {
        if self.started {
            return Err(CoreError::Mux("muxer already started".to_string()));
        }
        if self.tracks.is_empty() {
            return Err(CoreError::Mux("no tracks added".to_string()));
        }
        let mut head = BytesMut::new();
        write_box(&mut head, b"ftyp", |buf| {
            buf.put_slice(b"isom");
            buf.put_u32(0x200);
            for brand in [b"isom", b"iso2", b"avc1", b"mp41"] {
                buf.put_slice(brand);
            }
        });
        self.mdat_header_at = head.len() as u64;
        // 64-bit header, size patched in finish()
        head.put_u32(1);
        head.put_slice(b"mdat");
        head.put_u64(0);

        self.out.write_all(&head)?;
        self.position = head.len() as u64;
        self.started = true;
        Ok(())
    }

    pub fn write_sample(&mut self, track: usize, data: &[u8], info: SampleInfo) -> CoreResult<()> {
        if !self.started {
            return Err(CoreError::Mux("write_sample before start".to_string()));
        }
        let position = self.position;
        let continues_chunk = self.last_track == Some(track);
        let entry = self
            .tracks
            .get_mut(track)
            .ok_or_else(|| CoreError::Mux(format!("unknown track index {}", track)))?;
        let size = u32::try_from(data.len())
            .map_err(|_| CoreError::Mux(format!("sample of {} bytes", data.len())))?;
        entry.check_timing(&info)?;

        match entry.chunks.last_mut() {
            Some(chunk) if continues_chunk => chunk.samples += 1,
            _ => entry.chunks.push(Chunk {
                offset: position,
                samples: 1,
            }),
        }
        entry.sizes.push(size);
        entry.infos.push(info);

        self.out.write_all(data)?;
        self.position += data.len() as u64;
        self.last_track = Some(track);
        Ok(())
    }

    /// Patches the `mdat` size, appends `moov` and returns the number of
    /// media bytes written.
    pub fn finish(mut self) -> CoreResult<u64> {
        if !self.started {
            return Err(CoreError::Mux("finish before start".to_string()));
        }
        let mdat_size = self.position - self.mdat_header_at;
        let media_bytes = mdat_size - 16;

        let moov = self.build_moov();
        self.out.write_all(&moov)?;
        self.out.flush()?;

        let mut file = self
            .out
            .into_inner()
            .map_err(|err| CoreError::Io(err.to_string()))?;
        file.seek(SeekFrom::Start(self.mdat_header_at + 8))?;
        file.write_all(&mdat_size.to_be_bytes())?;
        file.sync_all()?;

        debug!(
            tracks = self.tracks.len(),
            media_bytes,
            moov_bytes = moov.len(),
            "mp4 finalized"
        );
        Ok(media_bytes)
    }

    fn build_moov(&self) -> BytesMut {
        let movie_duration = self
            .tracks
            .iter()
            .map(|t| to_movie_time(t.start_dts() + t.media_duration(), t.format.timescale))
            .max()
            .unwrap_or(0);

        let mut buf = BytesMut::new();
        write_box(&mut buf, b"moov", |buf| {
            write_full_box(buf, b"mvhd", 1, 0, |buf| {
                buf.put_u64(0);
                buf.put_u64(0);
                buf.put_u32(MOVIE_TIMESCALE);
                buf.put_u64(movie_duration);
                buf.put_u32(0x0001_0000);
                buf.put_u16(0x0100);
                buf.put_slice(&[0u8; 10]);
                put_unity_matrix(buf);
                buf.put_slice(&[0u8; 24]);
                buf.put_u32(self.tracks.len() as u32 + 1);
            });
            for (index, track) in self.tracks.iter().enumerate() {
                write_trak(buf, index as u32 + 1, track);
            }
        });
        buf
    }
}

fn to_movie_time(value: u64, timescale: u32) -> u64 {
    (value as u128 * MOVIE_TIMESCALE as u128 / timescale.max(1) as u128) as u64
}

fn write_trak(buf: &mut BytesMut, track_id: u32, track: &MuxTrack) {
    let format = &track.format;
    let is_video = &format.handler == b"vide";
    let is_audio = &format.handler == b"soun";
    let start = track.start_dts();
    let media_duration = track.media_duration();
    let track_duration = to_movie_time(start + media_duration, format.timescale);

    write_box(buf, b"trak", |buf| {
        // enabled | in_movie
        write_full_box(buf, b"tkhd", 1, 0x3, |buf| {
            buf.put_u64(0);
            buf.put_u64(0);
            buf.put_u32(track_id);
            buf.put_u32(0);
            buf.put_u64(track_duration);
            buf.put_slice(&[0u8; 8]);
            buf.put_u16(0);
            buf.put_u16(if is_audio { 1 } else { 0 });
            buf.put_u16(if is_audio { 0x0100 } else { 0 });
            buf.put_u16(0);
            put_unity_matrix(buf);
            buf.put_u32((format.width as u32) << 16);
            buf.put_u32((format.height as u32) << 16);
        });

        // Media time restarts at 0 in stts; a leading empty edit shifts it
        // back to the source's first decode time.
        if start > 0 {
            write_box(buf, b"edts", |buf| {
                write_full_box(buf, b"elst", 1, 0, |buf| {
                    buf.put_u32(2);
                    buf.put_u64(to_movie_time(start, format.timescale));
                    buf.put_i64(-1);
                    buf.put_u32(0x0001_0000);
                    buf.put_u64(to_movie_time(media_duration, format.timescale));
                    buf.put_i64(0);
                    buf.put_u32(0x0001_0000);
                });
            });
        }

        write_box(buf, b"mdia", |buf| {
            write_full_box(buf, b"mdhd", 1, 0, |buf| {
                buf.put_u64(0);
                buf.put_u64(0);
                buf.put_u32(format.timescale);
                buf.put_u64(media_duration);
                buf.put_u16(format.language);
                buf.put_u16(0);
            });
            write_full_box(buf, b"hdlr", 0, 0, |buf| {
                buf.put_u32(0);
                buf.put_slice(&format.handler);
                buf.put_slice(&[0u8; 12]);
                let name: &[u8] = if is_video {
                    b"VideoHandler\0"
                } else if is_audio {
                    b"SoundHandler\0"
                } else {
                    b"DataHandler\0"
                };
                buf.put_slice(name);
            });
            write_box(buf, b"minf", |buf| {
                if is_video {
                    write_full_box(buf, b"vmhd", 0, 1, |buf| buf.put_slice(&[0u8; 8]));
                } else if is_audio {
                    write_full_box(buf, b"smhd", 0, 0, |buf| buf.put_u32(0));
                } else {
                    write_full_box(buf, b"nmhd", 0, 0, |_| {});
                }
                write_box(buf, b"dinf", |buf| {
                    write_full_box(buf, b"dref", 0, 0, |buf| {
                        buf.put_u32(1);
                        // self-contained
                        write_full_box(buf, b"url ", 0, 1, |_| {});
                    });
                });
                write_stbl(buf, track);
            });
        });
    });
}

fn write_stbl(buf: &mut BytesMut, track: &MuxTrack) {
    write_box(buf, b"stbl", |buf| {
        write_full_box(buf, b"stsd", 0, 0, |buf| {
            buf.put_u32(1);
            buf.put_slice(&track.format.sample_entry);
        });

        let stts = run_length(track.decode_deltas());
        write_full_box(buf, b"stts", 0, 0, |buf| {
            buf.put_u32(stts.len() as u32);
            for (count, delta) in &stts {
                buf.put_u32(*count);
                buf.put_u32(*delta);
            }
        });

        if track.infos.iter().any(|s| s.cts_offset != 0) {
            let ctts = run_length(track.infos.iter().map(|s| s.cts_offset));
            write_full_box(buf, b"ctts", 1, 0, |buf| {
                buf.put_u32(ctts.len() as u32);
                for (count, offset) in &ctts {
                    buf.put_u32(*count);
                    buf.put_i32(*offset);
                }
            });
        }

        if !track.infos.iter().all(|s| s.is_sync) {
            let sync: Vec<u32> = track
                .infos
                .iter()
                .enumerate()
                .filter(|(_, s)| s.is_sync)
                .map(|(i, _)| i as u32 + 1)
                .collect();
            write_full_box(buf, b"stss", 0, 0, |buf| {
                buf.put_u32(sync.len() as u32);
                for number in &sync {
                    buf.put_u32(*number);
                }
            });
        }

        let mut stsc: Vec<(u32, u32)> = Vec::new();
        for (index, chunk) in track.chunks.iter().enumerate() {
            if stsc.last().map(|(_, n)| *n) != Some(chunk.samples) {
                stsc.push((index as u32 + 1, chunk.samples));
            }
        }
        write_full_box(buf, b"stsc", 0, 0, |buf| {
            buf.put_u32(stsc.len() as u32);
            for (first_chunk, per_chunk) in &stsc {
                buf.put_u32(*first_chunk);
                buf.put_u32(*per_chunk);
                buf.put_u32(1);
            }
        });

        write_full_box(buf, b"stsz", 0, 0, |buf| {
            buf.put_u32(0);
            buf.put_u32(track.sizes.len() as u32);
            for size in &track.sizes {
                buf.put_u32(*size);
            }
        });

        write_full_box(buf, b"co64", 0, 0, |buf| {
            buf.put_u32(track.chunks.len() as u32);
            for chunk in &track.chunks {
                buf.put_u64(chunk.offset);
            }
        });
    });
}

fn run_length<T: PartialEq + Copy>(values: impl Iterator<Item = T>) -> Vec<(u32, T)> {
    let mut runs: Vec<(u32, T)> = Vec::new();
    for value in values {
        match runs.last_mut() {
            Some((count, last)) if *last == value => *count += 1,
            _ => runs.push((1, value)),
        }
    }
    runs
}
