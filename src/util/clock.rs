use std::io;

/// Milliseconds since boot, including time spent suspended
pub fn boot_time_ms() -> io::Result<u64> {
	let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
	// SAFETY: `ts` is a valid, writable timespec for the duration of the call
	let result = unsafe { libc::clock_gettime(libc::CLOCK_BOOTTIME, &mut ts) };
	if result != 0 {
		return Err(io::Error::last_os_error());
	}
	Ok(ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000)
}
