use std::mem::MaybeUninit;

/// Returns the total CPU time (user + system) consumed by this process, in microseconds.
pub fn process_cpu_time_micros() -> Option<u64> {
    let mut usage = MaybeUninit::<libc::rusage>::uninit();

    // SAFETY: We're passing a valid pointer to an appropriately sized `rusage` struct.
    let result = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
    if result != 0 {
        return None;
    }

    // SAFETY: `getrusage` returned successfully, so the struct has been populated.
    let usage = unsafe { usage.assume_init() };
    Some(timeval_micros(&usage.ru_utime)? + timeval_micros(&usage.ru_stime)?)
}

fn timeval_micros(tv: &libc::timeval) -> Option<u64> {
    let secs = u64::try_from(tv.tv_sec).ok()?;
    let micros = u64::try_from(tv.tv_usec).ok()?;
    Some(secs * 1_000_000 + micros)
}
