use bytes::{BufMut, Bytes, BytesMut};

/// Parsed view over a single ISO-BMFF box inside a parent byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BoxView {
    pub(crate) start: usize,
    pub(crate) end: usize,
    pub(crate) fourcc: [u8; 4],
    pub(crate) body_start: usize,
    pub(crate) body_end: usize,
}

/// Returns `(total_box_size, fourcc, header_size)`. A zero size means the box
/// runs to the end of `data`.
pub(crate) fn read_box_header(data: &[u8]) -> Option<(u64, [u8; 4], usize)> {
    if data.len() < 8 {
        return None;
    }
    let size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as u64;
    let fourcc = [data[4], data[5], data[6], data[7]];
    match size {
        1 => {
            let ext = data.get(8..16)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(ext);
            Some((u64::from_be_bytes(raw), fourcc, 16))
        }
        0 => Some((data.len() as u64, fourcc, 8)),
        _ => Some((size, fourcc, 8)),
    }
}

pub(crate) fn box_at(data: &Bytes, offset: usize, end: usize) -> Option<BoxView> {
    if offset >= end || end > data.len() {
        return None;
    }
    let (size, fourcc, header_size) = read_box_header(&data[offset..end])?;
    let size = usize::try_from(size).ok()?;
    let box_end = offset.checked_add(size)?;
    if size < header_size || box_end > end {
        return None;
    }
    Some(BoxView {
        start: offset,
        end: box_end,
        fourcc,
        body_start: offset + header_size,
        body_end: box_end,
    })
}

/// Direct children of `[start..end)`. Stops at the first malformed header.
pub(crate) fn children(data: &Bytes, start: usize, end: usize) -> Vec<BoxView> {
    let mut out = Vec::new();
    let mut offset = start;
    while let Some(parsed) = box_at(data, offset, end) {
        offset = parsed.end;
        out.push(parsed);
    }
    out
}

pub(crate) fn find_first_box(data: &Bytes, start: usize, end: usize, target: [u8; 4]) -> Option<BoxView> {
    children(data, start, end)
        .into_iter()
        .find(|parsed| parsed.fourcc == target)
}

/// Follows a chain of container FourCCs, e.g. `[mdia, minf, stbl]`.
pub(crate) fn find_path(data: &Bytes, parent: &BoxView, path: &[[u8; 4]]) -> Option<BoxView> {
    let mut current = *parent;
    for fourcc in path {
        current = find_first_box(data, current.body_start, current.body_end, *fourcc)?;
    }
    Some(current)
}

pub(crate) fn fourcc_to_string(fourcc: &[u8; 4]) -> String {
    fourcc
        .iter()
        .map(|b| if b.is_ascii_graphic() { *b as char } else { '?' })
        .collect()
}

/// Bounds-checked big-endian reader over a box body.
pub(crate) struct BodyReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Reader positioned after the version/flags word of a full box.
    pub(crate) fn full_box(data: &'a [u8]) -> Option<(Self, u8, u32)> {
        let mut reader = Self::new(data);
        let word = reader.u32()?;
        Some((reader, (word >> 24) as u8, word & 0x00ff_ffff))
    }

    pub(crate) fn skip(&mut self, n: usize) -> Option<()> {
        if n > self.remaining() {
            return None;
        }
        self.pos += n;
        Some(())
    }

    /// Bytes left unread.
    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let slice = self.data.get(self.pos..self.pos.checked_add(N)?)?;
        let mut raw = [0u8; N];
        raw.copy_from_slice(slice);
        self.pos += N;
        Some(raw)
    }

    pub(crate) fn u16(&mut self) -> Option<u16> {
        self.take::<2>().map(u16::from_be_bytes)
    }

    pub(crate) fn u32(&mut self) -> Option<u32> {
        self.take::<4>().map(u32::from_be_bytes)
    }

    pub(crate) fn i32(&mut self) -> Option<i32> {
        self.take::<4>().map(i32::from_be_bytes)
    }

    pub(crate) fn u64(&mut self) -> Option<u64> {
        self.take::<8>().map(u64::from_be_bytes)
    }

    pub(crate) fn fourcc(&mut self) -> Option<[u8; 4]> {
        self.take::<4>()
    }

    /// 32-bit for version 0, 64-bit otherwise.
    pub(crate) fn versioned(&mut self, version: u8) -> Option<u64> {
        if version == 0 {
            self.u32().map(u64::from)
        } else {
            self.u64()
        }
    }
}

/// Writes a box whose size is patched once `body` returns.
pub(crate) fn write_box(buf: &mut BytesMut, fourcc: &[u8; 4], body: impl FnOnce(&mut BytesMut)) {
    let start = buf.len();
    buf.put_u32(0);
    buf.put_slice(fourcc);
    body(buf);
    let size = (buf.len() - start) as u32;
    buf[start..start + 4].copy_from_slice(&size.to_be_bytes());
}

pub(crate) fn write_full_box(
    buf: &mut BytesMut,
    fourcc: &[u8; 4],
    version: u8,
    flags: u32,
    body: impl FnOnce(&mut BytesMut),
) {
    write_box(buf, fourcc, |buf| {
        buf.put_u32(((version as u32) << 24) | (flags & 0x00ff_ffff));
        body(buf);
    });
}

/// Unity transformation matrix used by `mvhd` and `tkhd`.
pub(crate) fn put_unity_matrix(buf: &mut BytesMut) {
    for value in [0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
        buf.put_u32(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_write_patches_every_size() {
        let mut buf = BytesMut::new();
        write_box(&mut buf, b"moov", |buf| {
            write_full_box(buf, b"mvhd", 1, 0, |buf| buf.put_u64(7));
            write_box(buf, b"trak", |_| {});
        });
        let data = buf.freeze();
        let moov = box_at(&data, 0, data.len()).unwrap();
        assert_eq!(moov.fourcc, *b"moov");
        assert_eq!(moov.end, data.len());

        let kids = children(&data, moov.body_start, moov.body_end);
        let names: Vec<_> = kids.iter().map(|b| fourcc_to_string(&b.fourcc)).collect();
        assert_eq!(names, vec!["mvhd", "trak"]);

        let mvhd = &data[kids[0].body_start..kids[0].body_end];
        let (mut reader, version, flags) = BodyReader::full_box(mvhd).unwrap();
        assert_eq!((version, flags), (1, 0));
        assert_eq!(reader.versioned(version), Some(7));
        assert_eq!(reader.u32(), None);
    }

    #[test]
    fn extended_size_header() {
        let mut raw = vec![0, 0, 0, 1];
        raw.extend_from_slice(b"mdat");
        raw.extend_from_slice(&20u64.to_be_bytes());
        raw.extend_from_slice(&[9; 4]);
        let data = Bytes::from(raw);
        let parsed = box_at(&data, 0, data.len()).unwrap();
        assert_eq!(parsed.body_start, 16);
        assert_eq!(parsed.body_end, 20);
    }

    #[test]
    fn truncated_box_is_rejected() {
        let mut raw = 100u32.to_be_bytes().to_vec();
        raw.extend_from_slice(b"moov");
        let data = Bytes::from(raw);
        assert!(box_at(&data, 0, data.len()).is_none());
        assert!(children(&data, 0, data.len()).is_empty());
    }

    #[test]
    fn extended_size_near_usize_max_is_rejected() {
        let mut raw = vec![0, 0, 0, 1];
        raw.extend_from_slice(b"mdat");
        raw.extend_from_slice(&u64::MAX.to_be_bytes());
        let data = Bytes::from(raw);
        assert!(box_at(&data, 0, data.len()).is_none());
    }

    #[test]
    fn skip_past_end_leaves_reader_in_place() {
        let mut reader = BodyReader::new(&[1, 2, 3, 4]);
        assert_eq!(reader.skip(usize::MAX), None);
        assert_eq!(reader.remaining(), 4);
        assert_eq!(reader.u32(), Some(0x0102_0304));
    }
}
