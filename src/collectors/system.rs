use crate::collectors::{HostSource, MemoryCounters, PartitionUsage, ProbeError};
use std::collections::HashSet;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use sysinfo::{DiskExt, System, SystemExt};
use tracing::debug;

/// Host counters read once through sysinfo, plus the Linux sources whose
/// accounting sysinfo does not expose (`/proc/meminfo`, `/proc/self/mounts`,
/// `/proc/loadavg`) and a `statvfs` per mounted partition.
pub struct SysinfoHost {
    system: System,
}

impl SysinfoHost {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        system.refresh_disks_list();
        system.refresh_disks();
        debug!(
            cpus = system.cpus().len(),
            disks = system.disks().len(),
            "host counters refreshed"
        );
        Self { system }
    }
}

impl Default for SysinfoHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSource for SysinfoHost {
    fn host_name(&self) -> Result<String, ProbeError> {
        self.system
            .host_name()
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| ProbeError::SourceUnavailable {
                what: "hostname",
                reason: "the OS did not report a host name".to_string(),
            })
    }

    fn outbound_ip(&self, target: SocketAddr) -> Result<IpAddr, ProbeError> {
        route_source_ip(target)
    }

    fn memory(&self) -> MemoryCounters {
        if let Some(counters) = read_meminfo() {
            return counters;
        }
        MemoryCounters {
            total_bytes: self.system.total_memory(),
            used_bytes: self.system.used_memory(),
            available_bytes: self.system.available_memory(),
            buffers_bytes: 0,
        }
    }

    fn partitions(&self) -> Vec<Result<PartitionUsage, ProbeError>> {
        collect_partitions(&self.system)
    }

    fn cpu_count(&self) -> usize {
        self.system.cpus().len()
    }

    fn load_average_line(&self) -> Result<String, ProbeError> {
        read_load_average(&self.system)
    }
}

/// Source address the OS picks for `target`. Connecting a UDP socket only
/// resolves the route; nothing is sent.
pub fn route_source_ip(target: SocketAddr) -> Result<IpAddr, ProbeError> {
    let bind_addr: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let no_route = move |source| ProbeError::NetworkUnreachable { target, source };

    let socket = UdpSocket::bind(bind_addr).map_err(no_route)?;
    socket.connect(target).map_err(no_route)?;
    let local = socket.local_addr().map_err(no_route)?;
    Ok(local.ip())
}

#[cfg(unix)]
fn collect_partitions(system: &System) -> Vec<Result<PartitionUsage, ProbeError>> {
    mount_points(system)
        .iter()
        .map(|mount| stat_partition(mount))
        .collect()
}

#[cfg(not(unix))]
fn collect_partitions(system: &System) -> Vec<Result<PartitionUsage, ProbeError>> {
    system
        .disks()
        .iter()
        .map(|d| {
            let total = d.total_space();
            let free = d.available_space();
            Ok(PartitionUsage {
                mount: d.mount_point().to_string_lossy().to_string(),
                total_bytes: total,
                used_bytes: total.saturating_sub(free),
                free_bytes: free,
            })
        })
        .collect()
}

/// Mounted physical filesystems: entries of `/proc/self/mounts` backed by a
/// device and whose type is not `nodev` in `/proc/filesystems`.
#[cfg(target_os = "linux")]
fn mount_points(system: &System) -> Vec<String> {
    match (
        fs::read_to_string("/proc/self/mounts"),
        fs::read_to_string("/proc/filesystems"),
    ) {
        (Ok(mounts), Ok(filesystems)) => physical_mounts(&mounts, &physical_fstypes(&filesystems)),
        (Err(err), _) | (_, Err(err)) => {
            debug!(error = %err, "mount table unavailable, using sysinfo disk list");
            sysinfo_mount_points(system)
        }
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn mount_points(system: &System) -> Vec<String> {
    sysinfo_mount_points(system)
}

#[cfg(unix)]
fn sysinfo_mount_points(system: &System) -> Vec<String> {
    system
        .disks()
        .iter()
        .map(|d| d.mount_point().to_string_lossy().to_string())
        .collect()
}

#[cfg(unix)]
fn stat_partition(mount: &str) -> Result<PartitionUsage, ProbeError> {
    use nix::sys::statvfs::statvfs;

    let stats = statvfs(std::path::Path::new(mount)).map_err(|errno| {
        ProbeError::PartitionUnreadable {
            mount: mount.to_string(),
            source: std::io::Error::from(errno),
        }
    })?;

    Ok(partition_usage(
        mount,
        u64::from(stats.blocks()),
        u64::from(stats.blocks_free()),
        u64::from(stats.blocks_available()),
        u64::from(stats.fragment_size()),
    ))
}

/// Used counts every allocated block, free only the blocks open to
/// unprivileged users, so reserved blocks appear in neither.
#[cfg_attr(not(unix), allow(dead_code))]
fn partition_usage(
    mount: &str,
    blocks: u64,
    blocks_free: u64,
    blocks_available: u64,
    fragment_size: u64,
) -> PartitionUsage {
    PartitionUsage {
        mount: mount.to_string(),
        total_bytes: blocks.saturating_mul(fragment_size),
        used_bytes: blocks
            .saturating_sub(blocks_free)
            .saturating_mul(fragment_size),
        free_bytes: blocks_available.saturating_mul(fragment_size),
    }
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn physical_fstypes(filesystems: &str) -> HashSet<String> {
    let mut out = HashSet::new();
    for line in filesystems.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.strip_prefix("nodev") {
            // zfs is listed as nodev but sits on real pools
            Some(rest) if rest.trim() == "zfs" => {
                out.insert("zfs".to_string());
            }
            Some(_) => {}
            None => {
                out.insert(line.to_string());
            }
        }
    }
    out
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn physical_mounts(mounts: &str, fstypes: &HashSet<String>) -> Vec<String> {
    mounts
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount = fields.next()?;
            let fstype = fields.next()?;
            if device == "none" || !fstypes.contains(fstype) {
                return None;
            }
            Some(unescape_mount(mount))
        })
        .collect()
}

/// Decodes the `\ooo` octal escapes the kernel uses for spaces, tabs,
/// newlines and backslashes in mount paths.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn unescape_mount(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits
                    .iter()
                    .fold(0_u16, |acc, b| acc * 8 + u16::from(b - b'0'));
                if let Ok(byte) = u8::try_from(value) {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(target_os = "linux")]
fn read_meminfo() -> Option<MemoryCounters> {
    let text = fs::read_to_string("/proc/meminfo").ok()?;
    memory_from_meminfo(&text)
}

#[cfg(not(target_os = "linux"))]
fn read_meminfo() -> Option<MemoryCounters> {
    None
}

/// Used memory is what is neither free nor reclaimable page cache/buffers;
/// when that goes negative (containers, odd kernels) it is total minus free.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn memory_from_meminfo(text: &str) -> Option<MemoryCounters> {
    let bytes = |key| meminfo_kib(text, key).map(|kib| kib.saturating_mul(1024));

    let total = bytes("MemTotal")?;
    let free = bytes("MemFree")?;
    let buffers = bytes("Buffers").unwrap_or(0);
    let cached = bytes("Cached")
        .unwrap_or(0)
        .saturating_add(bytes("SReclaimable").unwrap_or(0));
    let reclaimable = free.saturating_add(buffers).saturating_add(cached);

    let used = total
        .checked_sub(reclaimable)
        .unwrap_or_else(|| total.saturating_sub(free));

    Some(MemoryCounters {
        total_bytes: total,
        used_bytes: used,
        available_bytes: bytes("MemAvailable").unwrap_or(reclaimable),
        buffers_bytes: buffers,
    })
}

#[cfg(target_os = "linux")]
fn read_load_average(_system: &System) -> Result<String, ProbeError> {
    let text =
        fs::read_to_string("/proc/loadavg").map_err(|err| ProbeError::SourceUnavailable {
            what: "/proc/loadavg",
            reason: err.to_string(),
        })?;
    Ok(first_line(&text).to_string())
}

#[cfg(all(unix, not(target_os = "linux")))]
fn read_load_average(system: &System) -> Result<String, ProbeError> {
    let load = system.load_average();
    Ok(format!("{:.2} {:.2} {:.2}", load.one, load.five, load.fifteen))
}

#[cfg(not(unix))]
fn read_load_average(_system: &System) -> Result<String, ProbeError> {
    Err(ProbeError::SourceUnavailable {
        what: "load average",
        reason: "not provided by this platform".to_string(),
    })
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn meminfo_kib(text: &str, key: &str) -> Option<u64> {
    text.lines().find_map(|line| {
        let (name, rest) = line.split_once(':')?;
        if name.trim() != key {
            return None;
        }
        rest.split_whitespace().next()?.parse::<u64>().ok()
    })
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}
