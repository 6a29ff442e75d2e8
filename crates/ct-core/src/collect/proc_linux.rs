//! Parsers for /proc filesystem files (Linux).
//!
//! # Files Parsed
//! - `/proc/[pid]/stat` - state, ppid, CPU ticks, threads, starttime
//! - `/proc/[pid]/statm` - resident set size
//! - `/proc/[pid]/cmdline` - argv vector
//! - `/proc/[pid]/cwd` - working directory symlink
//! - `/proc/[pid]/io` - cumulative IO counters (may be permission-masked)
//! - `/proc/[pid]/fd/` - socket inodes
//! - `/proc/net/tcp`, `/proc/net/tcp6` - TCP socket table
//!
//! All parsers are split into `parse_*_content` functions over plain strings
//! so tests never need a live /proc.

use super::types::{ConnectionCounts, IoCounters, ProcState, RawProcess};
use ct_common::{ProcessId, StartId};
use std::collections::HashSet;
use std::fs;

/// System clock ticks per second. On Linux, typically 100 (USER_HZ).
pub fn clk_tck() -> u64 {
    static CLK_TCK: std::sync::OnceLock<u64> = std::sync::OnceLock::new();
    *CLK_TCK.get_or_init(|| {
        let tck = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if tck > 0 {
            tck as u64
        } else {
            100 // Default fallback
        }
    })
}

/// Logical core count, used to normalize CPU percentages.
pub fn num_cores() -> u64 {
    static CORES: std::sync::OnceLock<u64> = std::sync::OnceLock::new();
    *CORES.get_or_init(|| {
        let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if n > 0 {
            n as u64
        } else {
            1
        }
    })
}

/// Page size in bytes for statm conversion.
fn page_size() -> u64 {
    static PAGE: std::sync::OnceLock<u64> = std::sync::OnceLock::new();
    *PAGE.get_or_init(|| {
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 {
            sz as u64
        } else {
            4096
        }
    })
}

/// Boot ID for start-id construction.
pub fn boot_id() -> String {
    static BOOT_ID: std::sync::OnceLock<String> = std::sync::OnceLock::new();
    BOOT_ID
        .get_or_init(|| {
            fs::read_to_string("/proc/sys/kernel/random/boot_id")
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        })
        .clone()
}

/// Boot time (Unix seconds) from the `btime` line of /proc/stat.
pub fn boot_time_unix() -> i64 {
    static BTIME: std::sync::OnceLock<i64> = std::sync::OnceLock::new();
    *BTIME.get_or_init(|| {
        fs::read_to_string("/proc/stat")
            .ok()
            .and_then(|content| parse_btime_content(&content))
            .unwrap_or(0)
    })
}

/// Parse the btime line from /proc/stat content.
pub fn parse_btime_content(content: &str) -> Option<i64> {
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("btime ") {
            return rest.trim().parse().ok();
        }
    }
    None
}

/// List all numeric pids currently present under /proc.
pub fn list_pids() -> std::io::Result<Vec<u32>> {
    let mut pids = Vec::new();
    for entry in fs::read_dir("/proc")? {
        let entry = entry?;
        if let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() {
            pids.push(pid);
        }
    }
    pids.sort_unstable();
    Ok(pids)
}

/// Fields extracted from /proc/[pid]/stat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatFields {
    pub comm: String,
    pub state: ProcState,
    pub ppid: u32,
    pub utime: u64,
    pub stime: u64,
    pub num_threads: u32,
    pub starttime: u64,
}

/// Parse /proc/[pid]/stat content.
///
/// The comm field is surrounded by parentheses and may itself contain
/// spaces and parentheses; everything after the *last* ')' is
/// whitespace-separated.
pub fn parse_stat_content(content: &str) -> Option<StatFields> {
    let comm_start = content.find('(')?;
    let comm_end = content.rfind(')')?;
    let comm = content.get(comm_start + 1..comm_end)?.to_string();
    let after_comm = content.get(comm_end + 2..)?;

    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    if fields.len() < 20 {
        return None;
    }

    // Field indices (0-indexed after comm):
    // 0: state, 1: ppid, 11: utime, 12: stime, 17: num_threads, 19: starttime
    Some(StatFields {
        comm,
        state: ProcState::from_char(fields[0].chars().next()?),
        ppid: fields[1].parse().ok()?,
        utime: fields[11].parse().ok()?,
        stime: fields[12].parse().ok()?,
        num_threads: fields[17].parse().ok()?,
        starttime: fields[19].parse().ok()?,
    })
}

/// Parse /proc/[pid]/statm content. Returns resident set size in bytes.
pub fn parse_statm_rss(content: &str, page_bytes: u64) -> Option<u64> {
    let mut parts = content.split_whitespace();
    let _size = parts.next()?;
    let resident: u64 = parts.next()?.parse().ok()?;
    Some(resident * page_bytes)
}

/// Parse /proc/[pid]/io content.
///
/// Returns `IoCounters::Unsupported` for empty/unreadable content so the
/// sampler falls back to estimation instead of recording false zeros.
pub fn parse_io_content(content: &str) -> IoCounters {
    let mut read_bytes = None;
    let mut write_bytes = None;
    let mut rchar = None;
    let mut wchar = None;

    for line in content.lines() {
        let Some(colon_pos) = line.find(':') else {
            continue;
        };
        let key = line[..colon_pos].trim();
        let Ok(value) = line[colon_pos + 1..].trim().parse::<u64>() else {
            continue;
        };
        match key {
            "read_bytes" => read_bytes = Some(value),
            "write_bytes" => write_bytes = Some(value),
            "rchar" => rchar = Some(value),
            "wchar" => wchar = Some(value),
            _ => {}
        }
    }

    match (read_bytes, write_bytes) {
        (Some(read_bytes), Some(write_bytes)) => IoCounters::Counters {
            read_bytes,
            write_bytes,
            rchar: rchar.unwrap_or(0),
            wchar: wchar.unwrap_or(0),
        },
        _ => IoCounters::Unsupported,
    }
}

/// Parse a NUL-separated /proc/[pid]/cmdline buffer into an argv vector.
pub fn parse_cmdline_bytes(bytes: &[u8]) -> Vec<String> {
    bytes
        .split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect()
}

/// One row of a /proc/net/tcp[6] socket table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpSocketEntry {
    pub inode: u64,
    /// Raw state nibble; 0x01 = ESTABLISHED.
    pub state: u8,
    pub remote_loopback: bool,
}

impl TcpSocketEntry {
    pub fn is_established(&self) -> bool {
        self.state == 0x01
    }
}

/// Parse /proc/net/tcp or /proc/net/tcp6 content.
///
/// Row format (columns whitespace-separated):
/// `sl local_address rem_address st ... inode ...`
/// Addresses are little-endian hex; loopback is 0100007F (v4) or
/// `::1` / v4-mapped loopback (v6).
pub fn parse_net_tcp_content(content: &str, is_v6: bool) -> Vec<TcpSocketEntry> {
    let mut entries = Vec::new();

    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }

        let Some((rem_hex, _rem_port)) = fields[2].split_once(':') else {
            continue;
        };
        let Ok(state) = u8::from_str_radix(fields[3], 16) else {
            continue;
        };
        let Ok(inode) = fields[9].parse::<u64>() else {
            continue;
        };

        entries.push(TcpSocketEntry {
            inode,
            state,
            remote_loopback: hex_addr_is_loopback(rem_hex, is_v6),
        });
    }

    entries
}

fn hex_addr_is_loopback(hex: &str, is_v6: bool) -> bool {
    if is_v6 {
        // ::1 in kernel hex dump, or a v4-mapped 127.x loopback tail.
        hex.eq_ignore_ascii_case("00000000000000000000000001000000")
            || hex.to_ascii_uppercase().ends_with("0100007F")
    } else {
        // 127.0.0.1 little-endian.
        hex.eq_ignore_ascii_case("0100007F")
    }
}

/// Socket inodes owned by a process, from /proc/[pid]/fd symlinks.
pub fn read_socket_inodes(pid: u32) -> Option<HashSet<u64>> {
    let dir = format!("/proc/{}/fd", pid);
    let entries = fs::read_dir(dir).ok()?;
    let mut inodes = HashSet::new();
    for entry in entries.flatten() {
        if let Ok(target) = fs::read_link(entry.path()) {
            let target = target.to_string_lossy();
            if let Some(rest) = target.strip_prefix("socket:[") {
                if let Some(inode_str) = rest.strip_suffix(']') {
                    if let Ok(inode) = inode_str.parse::<u64>() {
                        inodes.insert(inode);
                    }
                }
            }
        }
    }
    Some(inodes)
}

/// Count a process's connections against the global TCP tables.
pub fn count_connections(
    socket_inodes: &HashSet<u64>,
    tcp_entries: &[TcpSocketEntry],
) -> ConnectionCounts {
    let mut counts = ConnectionCounts {
        total: socket_inodes.len(),
        aux: 0,
    };
    for entry in tcp_entries {
        if entry.is_established() && entry.remote_loopback && socket_inodes.contains(&entry.inode)
        {
            counts.aux += 1;
        }
    }
    counts
}

/// Read the global TCP socket tables once per cycle.
pub fn read_tcp_tables() -> Vec<TcpSocketEntry> {
    let mut entries = Vec::new();
    if let Ok(content) = fs::read_to_string("/proc/net/tcp") {
        entries.extend(parse_net_tcp_content(&content, false));
    }
    if let Ok(content) = fs::read_to_string("/proc/net/tcp6") {
        entries.extend(parse_net_tcp_content(&content, true));
    }
    entries
}

/// Read one process's full record.
///
/// Returns `None` when the process vanished between enumeration and read,
/// or when core detail files are unreadable - the caller omits it for the
/// cycle rather than failing the pass.
pub fn read_process(pid: u32, include_io: bool, tcp_entries: &[TcpSocketEntry]) -> Option<RawProcess> {
    let stat_content = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    let stat = parse_stat_content(&stat_content)?;

    let rss_bytes = fs::read_to_string(format!("/proc/{}/statm", pid))
        .ok()
        .and_then(|c| parse_statm_rss(&c, page_size()))
        .unwrap_or(0);

    let cmdline = fs::read(format!("/proc/{}/cmdline", pid))
        .map(|bytes| parse_cmdline_bytes(&bytes))
        .unwrap_or_default();

    let working_dir = fs::read_link(format!("/proc/{}/cwd", pid))
        .ok()
        .map(|p| p.to_string_lossy().into_owned());

    let (io, connections) = if include_io {
        let io = fs::read_to_string(format!("/proc/{}/io", pid))
            .map(|c| parse_io_content(&c))
            .unwrap_or(IoCounters::Unsupported);
        let connections = read_socket_inodes(pid)
            .map(|inodes| count_connections(&inodes, tcp_entries))
            .unwrap_or_default();
        (io, connections)
    } else {
        (IoCounters::Unsupported, ConnectionCounts::default())
    };

    let start_time_unix = boot_time_unix() + (stat.starttime / clk_tck()) as i64;

    Some(RawProcess {
        pid: ProcessId(pid),
        ppid: ProcessId(stat.ppid),
        start_id: StartId::new(&boot_id(), stat.starttime, pid),
        comm: stat.comm,
        cmdline,
        working_dir,
        state: stat.state,
        cpu_ticks: stat.utime + stat.stime,
        num_threads: stat.num_threads,
        rss_bytes,
        starttime: stat.starttime,
        start_time_unix,
        io,
        connections,
    })
}
