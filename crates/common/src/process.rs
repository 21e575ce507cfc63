use std::fs;
use std::io;
use std::path::Path;

/// Minimal view of `/proc/[pid]/stat`
#[derive(Debug, Clone)]
pub struct ProcStat {
    pub starttime: u64,
}

/// Parse `/proc/[pid]/stat` and extract the `starttime` field (index 21).
pub fn read_proc_stat(pid: u32) -> io::Result<ProcStat> {
    let path = format!("/proc/{}/stat", pid);
    let content = fs::read_to_string(&path)?;
    let parts: Vec<&str> = content.split_whitespace().collect();
    let starttime = parts
        .get(21)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Missing starttime field in {}", path),
            )
        })?
        .parse::<u64>()
        .map_err(|err| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to parse starttime in {}: {}", path, err),
            )
        })?;

    Ok(ProcStat { starttime })
}

/// Check for existence of a process in `/proc`.
pub fn process_exists(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

/// Validate that `pid` is still the process recorded at spawn time.
///
/// Guards kill paths against PID reuse: the start ticks of the live process
/// must match the ticks captured when the job was started.
pub fn validate_start_ticks(pid: u32, expected_start_ticks: u64) -> bool {
    read_proc_stat(pid)
        .ok()
        .map(|stat| stat.starttime == expected_start_ticks)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_visible() {
        let pid = std::process::id();
        assert!(process_exists(pid));

        let stat = read_proc_stat(pid).expect("own stat readable");
        assert!(stat.starttime > 0);
        assert!(validate_start_ticks(pid, stat.starttime));
    }

    #[test]
    fn bogus_pid_is_dead() {
        // PID max on Linux is bounded well below u32::MAX.
        assert!(!process_exists(u32::MAX));
        assert!(!validate_start_ticks(u32::MAX, 1));
    }
}
