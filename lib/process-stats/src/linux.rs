use std::{fs::File, io::Read as _};

use crate::MemorySizes;

const STATM: &str = "/proc/self/statm";

/// Reads the virtual and resident memory sizes of this process from `/proc/self/statm`.
pub fn memory_sizes() -> Option<MemorySizes> {
    // statm is a single line of seven space-delimited page counts, so a small stack buffer is plenty and lets us avoid
    // allocating on every query.
    let mut buf = [0; 256];
    let mut file = File::open(STATM).ok()?;
    let n = file.read(&mut buf).ok()?;
    if n == 0 || n == buf.len() {
        return None;
    }

    let page_size = page_size()?;
    let mut fields = buf[..n].split(|b| *b == b' ' || *b == b'\n');
    let size_pages = parse_pages(fields.next()?)?;
    let resident_pages = parse_pages(fields.next()?)?;

    Some(MemorySizes {
        virtual_size: size_pages * page_size,
        resident_size: resident_pages * page_size,
    })
}

fn parse_pages(raw: &[u8]) -> Option<u64> {
    std::str::from_utf8(raw).ok()?.parse::<u64>().ok()
}

fn page_size() -> Option<u64> {
    // SAFETY: `sysconf` has no preconditions.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        None
    } else {
        Some(page_size as u64)
    }
}
