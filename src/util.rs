use std::ffi::CString;
use std::io;
use std::mem::size_of;
use std::os::unix::io::RawFd;

use libc::{c_int, c_void, socklen_t};

pub(crate) fn is_pow_of_two(val: u32) -> bool {
    if val == 0 {
        return false;
    }
    (val & (val - 1)) == 0
}

/// The system page size, falling back to 4096 if sysconf has no answer.
pub fn page_size() -> usize {
    let r = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if r <= 0 {
        return 4096;
    }

    r as usize
}

/// Look up the interface index of `if_name`. Returns None if the interface does not exist.
pub fn if_index(if_name: &str) -> Option<u32> {
    let if_name_c = CString::new(if_name).ok()?;

    let idx = unsafe { libc::if_nametoindex(if_name_c.as_ptr()) };
    if idx == 0 {
        return None;
    }

    Some(idx)
}

/// Set a socket option whose value is a plain `repr(C)` struct or integer.
pub(crate) fn setsockopt<T>(fd: RawFd, level: c_int, name: c_int, val: &T) -> io::Result<()> {
    let r = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            val as *const T as *const c_void,
            size_of::<T>() as socklen_t,
        )
    };
    if r != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Read a socket option into `T`. Fails if the kernel returns fewer bytes than `T` holds.
pub(crate) fn getsockopt<T: Default>(fd: RawFd, level: c_int, name: c_int) -> io::Result<T> {
    let mut val = T::default();
    let mut len = size_of::<T>() as socklen_t;

    let r = unsafe {
        libc::getsockopt(
            fd,
            level,
            name,
            &mut val as *mut T as *mut c_void,
            &mut len,
        )
    };
    if r != 0 {
        return Err(io::Error::last_os_error());
    }
    if (len as usize) < size_of::<T>() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("short socket option: {} of {} bytes", len, size_of::<T>()),
        ));
    }

    Ok(val)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_powers_of_two() {
        assert_eq!(is_pow_of_two(0), false);
        assert_eq!(is_pow_of_two(1), true);
        assert_eq!(is_pow_of_two(2), true);
        assert_eq!(is_pow_of_two(3), false);
        assert_eq!(is_pow_of_two(4), true);
        assert_eq!(is_pow_of_two(8), true);
        assert_eq!(is_pow_of_two(15), false);
        assert_eq!(is_pow_of_two(16), true);
        assert_eq!(is_pow_of_two(20), false);
        assert_eq!(is_pow_of_two(2048), true);
    }

    #[test]
    fn test_page_size() {
        let size = page_size();
        assert!(size >= 4096);
        assert!(is_pow_of_two(size as u32));
    }

    #[test]
    fn test_if_index() {
        assert!(if_index("lo").is_some());
        assert_eq!(if_index("no-such-link0"), None);
        assert_eq!(if_index("bad\0name"), None);
    }
}
