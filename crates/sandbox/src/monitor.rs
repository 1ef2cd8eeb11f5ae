//! Resource sampling and termination of an execution's process tree

use std::collections::{HashMap, HashSet};

/// `root` and all of its descendants, read from `/proc`
#[cfg(target_os = "linux")]
pub fn process_tree(root: u32) -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return vec![root];
    };

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            continue;
        };
        if let Some(ppid) = parent_pid(&stat) {
            children.entry(ppid).or_default().push(pid);
        }
    }
    descendants(root, &children)
}

#[cfg(not(target_os = "linux"))]
pub fn process_tree(root: u32) -> Vec<u32> {
    vec![root]
}

fn descendants(root: u32, children: &HashMap<u32, Vec<u32>>) -> Vec<u32> {
    let mut seen = HashSet::from([root]);
    let mut tree = vec![root];
    let mut i = 0;
    while i < tree.len() {
        if let Some(kids) = children.get(&tree[i]) {
            for kid in kids {
                if seen.insert(*kid) {
                    tree.push(*kid);
                }
            }
        }
        i += 1;
    }
    tree
}

/// Parent pid from a `/proc/<pid>/stat` line; the command name may contain spaces
fn parent_pid(stat: &str) -> Option<u32> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(1)?.parse().ok()
}

/// `VmRSS` from a `/proc/<pid>/status` file, in bytes
fn rss_bytes(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

/// Resident memory of the whole tree under `root`; `None` when it cannot be read
#[cfg(target_os = "linux")]
pub fn tree_rss_bytes(root: u32) -> Option<u64> {
    let mut total = 0;
    let mut readable = false;
    for pid in process_tree(root) {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{pid}/status")) {
            if let Some(bytes) = rss_bytes(&status) {
                total += bytes;
                readable = true;
            }
        }
    }
    readable.then_some(total)
}

#[cfg(not(target_os = "linux"))]
pub fn tree_rss_bytes(_root: u32) -> Option<u64> {
    None
}

/// SIGKILL the process group led by `root` and any descendant that left it
#[cfg(unix)]
pub fn kill_tree(root: u32) {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    let tree = process_tree(root);
    if let Err(e) = killpg(Pid::from_raw(root as i32), Signal::SIGKILL) {
        tracing::debug!(pid = root, error = %e, "killpg failed");
    }
    for pid in tree {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
pub fn kill_tree(_root: u32) {}

/// Signal that ended a child, when it was killed by one
#[cfg(unix)]
pub fn termination_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
pub fn termination_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Signals raised by `RLIMIT_CPU` and `RLIMIT_FSIZE`
#[cfg(unix)]
pub fn is_limit_signal(signal: i32) -> bool {
    use nix::sys::signal::Signal;
    signal == Signal::SIGXCPU as i32 || signal == Signal::SIGXFSZ as i32
}

#[cfg(not(unix))]
pub fn is_limit_signal(_signal: i32) -> bool {
    false
}
