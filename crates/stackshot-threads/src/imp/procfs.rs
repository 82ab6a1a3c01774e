use std::fs;

const TASK_DIR: &str = "/proc/self/task";

/// Kernel ids of every live thread in this process.
pub(crate) fn task_ids() -> Vec<libc::pid_t> {
    let Ok(entries) = fs::read_dir(TASK_DIR) else {
        return Vec::new();
    };
    let mut ids: Vec<libc::pid_t> = entries
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
        .collect();
    ids.sort_unstable();
    ids
}

pub(crate) fn task_exists(tid: libc::pid_t) -> bool {
    fs::metadata(format!("{TASK_DIR}/{tid}")).is_ok()
}

pub(crate) fn task_name(tid: libc::pid_t) -> Option<String> {
    let comm = fs::read_to_string(format!("{TASK_DIR}/{tid}/comm")).ok()?;
    let name = comm.trim_end_matches('\n');
    (!name.is_empty()).then(|| name.to_string())
}

/// Nice value of `tid`, or `None` if the task is gone.
pub(crate) fn task_priority(tid: libc::pid_t) -> Option<i32> {
    // getpriority can legitimately return -1, so errno is the only failure signal.
    unsafe {
        *libc::__errno_location() = 0;
        let prio = libc::getpriority(libc::PRIO_PROCESS, tid as libc::id_t);
        if prio == -1 && *libc::__errno_location() != 0 {
            return None;
        }
        Some(prio)
    }
}
