//! Newc CPIO archive parsing.
//!
//! The ramdisk and the block device both carry `newc` archives: a sequence
//! of records, each a 110-byte ASCII-hex header (magic "070701"), the
//! NUL-terminated name padded to 4 bytes, then the file data padded to 4
//! bytes. A record named "TRAILER!!!" terminates the archive.
//!
//! Everything here is pure slice parsing; the VFS decides what to do with
//! the records.

/// Header magic.
pub const MAGIC: &[u8; 6] = b"070701";

/// Name of the terminating record.
pub const TRAILER: &str = "TRAILER!!!";

/// Size of the fixed ASCII header.
pub const HEADER_LEN: usize = 110;

/// Regular-file bits of the mode field.
const S_IFMT: u32 = 0o170000;
const S_IFREG: u32 = 0o100000;

/// Fields of one parsed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpioHeader {
    pub mode: u32,
    pub filesize: usize,
    /// Name length including the terminating NUL.
    pub namesize: usize,
}

impl CpioHeader {
    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }
}

/// One record located inside an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpioRecord<'a> {
    pub name: &'a str,
    pub header: CpioHeader,
    /// Offset of the file data from the start of the archive.
    pub data_offset: usize,
}

/// Parse an 8-digit ASCII-hex field.
fn parse_hex8(field: &[u8]) -> Option<u32> {
    if field.len() != 8 {
        return None;
    }
    let mut value: u32 = 0;
    for &b in field {
        let digit = (b as char).to_digit(16)?;
        value = value.checked_mul(16)?.checked_add(digit)?;
    }
    Some(value)
}

/// Pad an offset to the 4-byte alignment newc uses for names and data.
pub const fn pad4(value: usize) -> usize {
    (value + 3) & !3
}

/// Parse the fixed header at the start of `bytes`.
///
/// Header layout after the 6-byte magic: thirteen 8-digit hex fields
/// (ino, mode, uid, gid, nlink, mtime, filesize, devmajor, devminor,
/// rdevmajor, rdevminor, namesize, check).
pub fn parse_header(bytes: &[u8]) -> Option<CpioHeader> {
    if bytes.len() < HEADER_LEN || &bytes[..6] != MAGIC {
        return None;
    }
    let field = |index: usize| parse_hex8(&bytes[6 + index * 8..6 + (index + 1) * 8]);
    Some(CpioHeader {
        mode: field(1)?,
        filesize: field(6)? as usize,
        namesize: field(11)? as usize,
    })
}

/// Extract the record name following a header. `bytes` starts at the
/// header; the name occupies `namesize` bytes (NUL included) after the
/// fixed header. Trailing NULs are trimmed.
pub fn parse_name<'a>(bytes: &'a [u8], header: &CpioHeader) -> Option<&'a str> {
    if header.namesize == 0 {
        return None;
    }
    let raw = bytes.get(HEADER_LEN..HEADER_LEN + header.namesize)?;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    core::str::from_utf8(&raw[..end]).ok()
}

/// Iterator over the records of an in-memory archive.
pub struct CpioIter<'a> {
    bytes: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> Iterator for CpioIter<'a> {
    type Item = CpioRecord<'a>;

    fn next(&mut self) -> Option<CpioRecord<'a>> {
        if self.done {
            return None;
        }
        let at = self.offset;
        let header = parse_header(self.bytes.get(at..)?)?;
        let name = parse_name(self.bytes.get(at..)?, &header)?;
        if name == TRAILER {
            self.done = true;
            return None;
        }

        let data_offset = at + pad4(HEADER_LEN + header.namesize);
        self.offset = data_offset + pad4(header.filesize);
        if data_offset + header.filesize > self.bytes.len() {
            // Truncated record; stop rather than hand out a bad slice.
            self.done = true;
            return None;
        }
        Some(CpioRecord {
            name,
            header,
            data_offset,
        })
    }
}

/// Iterate the records of `bytes`.
pub fn records(bytes: &[u8]) -> CpioIter<'_> {
    CpioIter {
        bytes,
        offset: 0,
        done: false,
    }
}

/// Find a record by exact name and return its data.
pub fn find_file<'a>(bytes: &'a [u8], name: &str) -> Option<&'a [u8]> {
    records(bytes)
        .find(|rec| rec.name == name)
        .map(|rec| &bytes[rec.data_offset..rec.data_offset + rec.header.filesize])
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;

    // --- Helper: build a newc archive in memory ---

    fn push_record(archive: &mut Vec<u8>, name: &str, mode: u32, data: &[u8]) {
        let namesize = name.len() + 1;
        let mut header = Vec::new();
        header.extend_from_slice(MAGIC);
        let fields: [u32; 13] = [
            1,                 // ino
            mode,              // mode
            0,                 // uid
            0,                 // gid
            1,                 // nlink
            0,                 // mtime
            data.len() as u32, // filesize
            0,                 // devmajor
            0,                 // devminor
            0,                 // rdevmajor
            0,                 // rdevminor
            namesize as u32,   // namesize
            0,                 // check
        ];
        for field in fields {
            header.extend_from_slice(alloc::format!("{:08X}", field).as_bytes());
        }
        archive.extend_from_slice(&header);
        archive.extend_from_slice(name.as_bytes());
        archive.push(0);
        while archive.len() % 4 != 0 {
            archive.push(0);
        }
        archive.extend_from_slice(data);
        while archive.len() % 4 != 0 {
            archive.push(0);
        }
    }

    fn build_archive(entries: &[(&str, u32, &[u8])]) -> Vec<u8> {
        let mut archive = Vec::new();
        for &(name, mode, data) in entries {
            push_record(&mut archive, name, mode, data);
        }
        push_record(&mut archive, TRAILER, 0, b"");
        archive
    }

    #[test]
    fn test_parse_hex8() {
        assert_eq!(parse_hex8(b"000000FF"), Some(255));
        assert_eq!(parse_hex8(b"0000a1b2"), Some(0xA1B2));
        assert_eq!(parse_hex8(b"0000XYZ0"), None);
        assert_eq!(parse_hex8(b"0102"), None);
    }

    #[test]
    fn test_find_file() {
        let archive = build_archive(&[
            ("hello", 0o100644, b"ABCD"),
            ("usr/lib/dyld", 0o100755, b"\xcf\xfa\xed\xfe"),
        ]);
        assert_eq!(find_file(&archive, "hello"), Some(&b"ABCD"[..]));
        assert_eq!(
            find_file(&archive, "usr/lib/dyld"),
            Some(&b"\xcf\xfa\xed\xfe"[..])
        );
        assert_eq!(find_file(&archive, "absent"), None);
    }

    #[test]
    fn test_records_stop_at_trailer() {
        let archive = build_archive(&[("a", 0o100644, b"1"), ("b", 0o100644, b"22")]);
        let names: Vec<&str> = records(&archive).map(|r| r.name).collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn test_mode_classification() {
        let archive = build_archive(&[("file", 0o100755, b"x"), ("dir", 0o040755, b"")]);
        let recs: Vec<_> = records(&archive).collect();
        assert!(recs[0].header.is_regular());
        assert!(!recs[1].header.is_regular());
    }

    #[test]
    fn test_name_with_padded_nuls() {
        // A record whose namesize over-counts (padding NULs inside the name
        // field) still yields the logical name.
        let mut archive = Vec::new();
        archive.extend_from_slice(MAGIC);
        let fields: [u32; 13] = [1, 0o100644, 0, 0, 1, 0, 4, 0, 0, 0, 0, 9, 0];
        for field in fields {
            archive.extend_from_slice(alloc::format!("{:08X}", field).as_bytes());
        }
        archive.extend_from_slice(b"hello\0\0\0\0");
        while archive.len() % 4 != 0 {
            archive.push(0);
        }
        archive.extend_from_slice(b"ABCD");
        push_record(&mut archive, TRAILER, 0, b"");

        assert_eq!(find_file(&archive, "hello"), Some(&b"ABCD"[..]));
    }

    #[test]
    fn test_truncated_archive_yields_nothing_bad() {
        let archive = build_archive(&[("a", 0o100644, b"data")]);
        let cut = &archive[..HEADER_LEN + 2];
        assert_eq!(records(cut).count(), 0);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut archive = build_archive(&[("a", 0o100644, b"data")]);
        archive[0] = b'9';
        assert_eq!(records(&archive).count(), 0);
    }
}
