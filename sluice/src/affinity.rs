//! Worker thread CPU pinning (Linux).
//!
//! ```rust,ignore
//! let config = PipelineConfig::new(4096)?.with_worker_cores(vec![2, 3, 4]);
//! // filter-0 -> 2, filter-1 -> 3, output-0 -> 4
//! ```

use std::io;

/// Core for the `index`-th worker of the pipeline (filter workers first),
/// round-robin over `cores`. `None` when pinning is off.
pub fn core_for_worker(cores: &[usize], index: usize) -> Option<usize> {
    if cores.is_empty() {
        None
    } else {
        Some(cores[index % cores.len()])
    }
}

/// Pin current thread to a specific CPU core.
#[cfg(target_os = "linux")]
pub fn pin_to_core(core_id: usize) -> io::Result<()> {
    use libc::{cpu_set_t, sched_setaffinity, CPU_SET, CPU_SETSIZE, CPU_ZERO};

    if core_id >= CPU_SETSIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("core {} is out of range", core_id),
        ));
    }

    let mut set: cpu_set_t = unsafe { std::mem::zeroed() };
    unsafe {
        CPU_ZERO(&mut set);
        CPU_SET(core_id, &mut set);

        if sched_setaffinity(0, std::mem::size_of::<cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn pin_to_core(_core_id: usize) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "Linux only"))
}
