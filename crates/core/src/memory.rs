//! Fault-tolerant reads of the process's own memory
//!
//! Callbacks dereference pointers taken from hooked functions' registers and
//! from frame-pointer chains. Any of them may be garbage, so reads go through
//! `process_vm_readv` on our own pid, which reports unmapped memory as an
//! error instead of raising SIGSEGV.

/// Copy up to `buf.len()` bytes from `address`, returning how many were read
///
/// A read that crosses into an unmapped page stops at the boundary.
#[cfg(target_os = "linux")]
pub fn safe_read(address: u64, buf: &mut [u8]) -> usize {
    if address < 0x1000 || buf.is_empty() {
        return 0;
    }
    let local = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let remote = libc::iovec {
        iov_base: address as *mut libc::c_void,
        iov_len: buf.len(),
    };
    // SAFETY: both iovecs describe memory the kernel validates; `local` is ours
    let ret = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
    if ret < 0 {
        0
    } else {
        ret as usize
    }
}

#[cfg(not(target_os = "linux"))]
pub fn safe_read(_address: u64, _buf: &mut [u8]) -> usize {
    0
}

/// Read an aligned u64
pub fn safe_read_u64(address: u64) -> Option<u64> {
    if address & 7 != 0 {
        return None;
    }
    let mut word = [0u8; 8];
    (safe_read(address, &mut word) == word.len()).then(|| u64::from_le_bytes(word))
}

/// Read a NUL-terminated string of at most `max_len` bytes
///
/// Invalid UTF-8 is replaced rather than rejected; an unterminated string is
/// truncated at `max_len`.
pub fn read_c_string(address: u64, max_len: usize) -> Option<String> {
    let mut buf = vec![0u8; max_len];
    let mut filled = 0;

    // Page-sized chunks so a string ending just before an unmapped page is
    // still read in full
    while filled < max_len {
        let cursor = address.wrapping_add(filled as u64);
        let to_page_end = PAGE_SIZE - (cursor as usize & (PAGE_SIZE - 1));
        let want = to_page_end.min(max_len - filled);
        let read = safe_read(cursor, &mut buf[filled..filled + want]);
        if read == 0 {
            break;
        }
        let chunk = &buf[filled..filled + read];
        if let Some(nul) = chunk.iter().position(|&b| b == 0) {
            filled += nul;
            buf.truncate(filled);
            return Some(String::from_utf8_lossy(&buf).into_owned());
        }
        filled += read;
        if read < want {
            break;
        }
    }

    if filled == 0 {
        return None;
    }
    buf.truncate(filled);
    Some(String::from_utf8_lossy(&buf).into_owned())
}

const PAGE_SIZE: usize = 4096;
