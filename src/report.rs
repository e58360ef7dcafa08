use crate::collectors::log_tail;
use crate::collectors::service::{check_service, STATUS_PREFIX};
use crate::collectors::{HostSource, MemoryCounters, PartitionUsage, ProbeError};
use crate::config::{Config, ConfigError, FailurePolicy};
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, serde::Serialize)]
pub struct UsageReport {
    pub hostname: String,
    pub ipaddress_eth0: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tail_log_file: Option<String>,
    pub ram: RamUsage,
    pub disk: DiskUsage,
    pub cpu_count: usize,
    pub cpu_load: String,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RamUsage {
    pub ram_total_gb: String,
    pub ram_used_gb: String,
    pub ram_available_gb: String,
    pub ram_buffers_gb: String,
    pub used_percentage: String,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct DiskEntry {
    pub partition: String,
    pub total_gb: String,
    pub used_gb: String,
    pub free_gb: String,
    pub used_percentage: String,
}

/// Per-partition entries plus totals.
///
/// Serialized as a flat object: `used_percentage` (when any partition was
/// read), `disk_0`, `disk_1`, ..., then `total_gb`, `used_gb`, `free_gb`.
#[derive(Debug, Clone, PartialEq)]
pub struct DiskUsage {
    pub partitions: Vec<DiskEntry>,
    /// `"{mount} {pct}%({used}gb/{total}gb)"` per partition, joined with `", "`.
    pub used_percentage: Option<String>,
    pub total_gb: String,
    pub used_gb: String,
    pub free_gb: String,
}

impl Serialize for DiskUsage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let extra = if self.used_percentage.is_some() { 4 } else { 3 };
        let mut map = serializer.serialize_map(Some(self.partitions.len() + extra))?;
        if let Some(summary) = &self.used_percentage {
            map.serialize_entry("used_percentage", summary)?;
        }
        for (i, entry) in self.partitions.iter().enumerate() {
            map.serialize_entry(&format!("disk_{i}"), entry)?;
        }
        map.serialize_entry("total_gb", &self.total_gb)?;
        map.serialize_entry("used_gb", &self.used_gb)?;
        map.serialize_entry("free_gb", &self.free_gb)?;
        map.end()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReportOptions {
    pub service_command: Option<String>,
    pub log_file: Option<PathBuf>,
    pub tail_lines: usize,
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / GIB
}

pub fn format_gb(gb: f64) -> String {
    format!("{gb:.2}")
}

/// `used * 100 / total` with both operands taken from their two-decimal
/// strings, not the raw byte counts. A total that rounds to zero gives `"0.00"`.
pub fn rounded_percentage(used_gb: &str, total_gb: &str) -> String {
    let used: f64 = used_gb.parse().unwrap_or(0.0);
    let total: f64 = total_gb.parse().unwrap_or(0.0);
    if total == 0.0 {
        return "0.00".to_string();
    }
    format!("{:.2}", used * 100.0 / total)
}

pub fn ram_usage(mem: &MemoryCounters) -> RamUsage {
    let ram_total_gb = format_gb(bytes_to_gb(mem.total_bytes));
    let ram_used_gb = format_gb(bytes_to_gb(mem.used_bytes));
    let pct = rounded_percentage(&ram_used_gb, &ram_total_gb);
    RamUsage {
        used_percentage: format!("{pct}%({ram_used_gb}gb/{ram_total_gb}gb)"),
        ram_available_gb: format_gb(bytes_to_gb(mem.available_bytes)),
        ram_buffers_gb: format_gb(bytes_to_gb(mem.buffers_bytes)),
        ram_total_gb,
        ram_used_gb,
    }
}

/// Builds the disk section. Unreadable partitions are logged and skipped
/// without taking a `disk_N` slot; totals sum the unrounded values.
pub fn disk_usage<I>(partitions: I) -> DiskUsage
where
    I: IntoIterator<Item = Result<PartitionUsage, ProbeError>>,
{
    let mut entries = Vec::new();
    let mut summary: Option<String> = None;
    let (mut sum_total, mut sum_used, mut sum_free) = (0.0_f64, 0.0_f64, 0.0_f64);

    for part in partitions {
        let part = match part {
            Ok(part) => part,
            Err(err) => {
                warn!(error = %err, "skipping partition");
                continue;
            }
        };

        let total = bytes_to_gb(part.total_bytes);
        let used = bytes_to_gb(part.used_bytes);
        let free = bytes_to_gb(part.free_bytes);
        sum_total += total;
        sum_used += used;
        sum_free += free;

        let total_gb = format_gb(total);
        let used_gb = format_gb(used);
        let pct = format!("{}%", rounded_percentage(&used_gb, &total_gb));

        let line = format!("{} {pct}({used_gb}gb/{total_gb}gb)", part.mount);
        summary = Some(match summary {
            Some(prev) => format!("{prev}, {line}"),
            None => line,
        });

        entries.push(DiskEntry {
            partition: part.mount,
            total_gb,
            used_gb,
            free_gb: format_gb(free),
            used_percentage: pct,
        });
    }

    DiskUsage {
        partitions: entries,
        used_percentage: summary,
        total_gb: format_gb(sum_total),
        used_gb: format_gb(sum_used),
        free_gb: format_gb(sum_free),
    }
}

/// Collects one report. Identity, memory, disk and load failures are fatal;
/// the service and log-tail probes follow `cfg.optional_probe_failure`.
pub async fn collect_report(
    host: &dyn HostSource,
    opts: &ReportOptions,
    cfg: &Config,
) -> Result<UsageReport, ReportError> {
    let route_target = cfg.route_probe_addr()?;
    let hostname = host.host_name()?;
    let ipaddress_eth0 = host.outbound_ip(route_target)?.to_string();

    let service_status = match &opts.service_command {
        Some(command) => {
            let timeout = cfg.service_timeout()?;
            let result = check_service(command, timeout).await;
            Some(settle(result, STATUS_PREFIX, cfg.optional_probe_failure)?)
        }
        None => None,
    };

    let tail_log_file = match &opts.log_file {
        Some(path) => {
            let result = log_tail::tail_log_file(path, opts.tail_lines, cfg.log_tail.mode);
            Some(settle(
                result,
                &log_tail::header(path, opts.tail_lines),
                cfg.optional_probe_failure,
            )?)
        }
        None => None,
    };

    let ram = ram_usage(&host.memory());
    let disk = disk_usage(host.partitions());
    let cpu_count = host.cpu_count();
    let cpu_load = host.load_average_line()?;

    info!(
        hostname = %hostname,
        partitions = disk.partitions.len(),
        cpu_count,
        "usage report collected"
    );

    Ok(UsageReport {
        hostname,
        ipaddress_eth0,
        service_status,
        tail_log_file,
        ram,
        disk,
        cpu_count,
        cpu_load,
    })
}

fn settle(
    result: Result<String, ProbeError>,
    prefix: &str,
    policy: FailurePolicy,
) -> Result<String, ProbeError> {
    match (result, policy) {
        (Ok(text), _) => Ok(text),
        (Err(err), FailurePolicy::Annotate) => {
            warn!(error = %err, "optional probe failed, annotating report");
            Ok(format!("{prefix}error: {err}"))
        }
        (Err(err), FailurePolicy::Abort) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogTailMode;
    use serde_json::Value;
    use std::io;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    const GIB_BYTES: u64 = 1024 * 1024 * 1024;

    struct FixtureHost {
        memory: MemoryCounters,
        partitions: Vec<Result<PartitionUsage, String>>,
        load: Option<String>,
    }

    impl FixtureHost {
        fn standard() -> Self {
            Self {
                memory: MemoryCounters {
                    total_bytes: 10 * GIB_BYTES,
                    used_bytes: GIB_BYTES,
                    available_bytes: 9 * GIB_BYTES,
                    buffers_bytes: 0,
                },
                partitions: vec![Ok(partition("/", 100, 50))],
                load: Some("0.10 0.20 0.30 1/100 4242".to_string()),
            }
        }
    }

    impl HostSource for FixtureHost {
        fn host_name(&self) -> Result<String, ProbeError> {
            Ok("node-1".to_string())
        }

        fn outbound_ip(&self, _target: SocketAddr) -> Result<IpAddr, ProbeError> {
            Ok(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)))
        }

        fn memory(&self) -> MemoryCounters {
            self.memory
        }

        fn partitions(&self) -> Vec<Result<PartitionUsage, ProbeError>> {
            self.partitions
                .iter()
                .map(|p| match p {
                    Ok(p) => Ok(p.clone()),
                    Err(mount) => Err(ProbeError::PartitionUnreadable {
                        mount: mount.clone(),
                        source: io::Error::new(io::ErrorKind::NotFound, "gone"),
                    }),
                })
                .collect()
        }

        fn cpu_count(&self) -> usize {
            4
        }

        fn load_average_line(&self) -> Result<String, ProbeError> {
            self.load
                .clone()
                .ok_or_else(|| ProbeError::SourceUnavailable {
                    what: "load average",
                    reason: "fixture".to_string(),
                })
        }
    }

    fn partition(mount: &str, total_gib: u64, used_gib: u64) -> PartitionUsage {
        PartitionUsage {
            mount: mount.to_string(),
            total_bytes: total_gib * GIB_BYTES,
            used_bytes: used_gib * GIB_BYTES,
            free_bytes: (total_gib - used_gib) * GIB_BYTES,
        }
    }

    fn to_json(report: &UsageReport) -> Value {
        serde_json::from_str(&serde_json::to_string(report).unwrap()).unwrap()
    }

    #[test]
    fn gb_strings_have_two_decimals() {
        assert_eq!(format_gb(bytes_to_gb(0)), "0.00");
        assert_eq!(format_gb(bytes_to_gb(GIB_BYTES)), "1.00");
        assert_eq!(format_gb(bytes_to_gb(GIB_BYTES * 3 / 2)), "1.50");
        assert_eq!(format_gb(bytes_to_gb(5_000_000_000)), "4.66");
        assert_eq!(format_gb(bytes_to_gb(405_705_146_368)), "377.84");
    }

    #[test]
    fn percentage_uses_rounded_operands() {
        assert_eq!(rounded_percentage("2.07", "23.55"), "8.79");
        assert_eq!(rounded_percentage("188.22", "377.83"), "49.82");
    }

    #[test]
    fn percentage_of_zero_total_is_zero() {
        assert_eq!(rounded_percentage("0.00", "0.00"), "0.00");
    }

    #[test]
    fn ram_section_composes_percentage_string() {
        let ram = ram_usage(&FixtureHost::standard().memory);
        assert_eq!(
            ram,
            RamUsage {
                ram_total_gb: "10.00".to_string(),
                ram_used_gb: "1.00".to_string(),
                ram_available_gb: "9.00".to_string(),
                ram_buffers_gb: "0.00".to_string(),
                used_percentage: "10.00%(1.00gb/10.00gb)".to_string(),
            }
        );
    }

    #[test]
    fn disk_summary_joins_partitions_in_order() {
        let disk = disk_usage(vec![
            Ok(partition("/", 100, 50)),
            Ok(partition("/data", 200, 20)),
        ]);
        assert_eq!(
            disk.used_percentage.as_deref(),
            Some("/ 50.00%(50.00gb/100.00gb), /data 10.00%(20.00gb/200.00gb)")
        );
        assert_eq!(disk.partitions[1].partition, "/data");
        assert_eq!(disk.partitions[1].used_percentage, "10.00%");
        assert_eq!(disk.partitions[1].free_gb, "180.00");
        assert_eq!(disk.total_gb, "300.00");
        assert_eq!(disk.used_gb, "70.00");
        assert_eq!(disk.free_gb, "230.00");
    }

    #[test]
    fn single_partition_summary_has_no_comma() {
        let disk = disk_usage(vec![Ok(partition("/", 100, 50))]);
        let summary = disk.used_percentage.unwrap();
        assert!(!summary.contains(','));
    }

    #[test]
    fn totals_round_once_from_unrounded_sums() {
        // each partition is ~0.006 GiB: "0.01" on its own, 0.018 summed
        let tiny = PartitionUsage {
            mount: "/tiny".to_string(),
            total_bytes: 6_442_451,
            used_bytes: 6_442_451,
            free_bytes: 0,
        };
        let disk = disk_usage(vec![Ok(tiny.clone()), Ok(tiny.clone()), Ok(tiny)]);
        assert!(disk.partitions.iter().all(|p| p.total_gb == "0.01"));
        assert_eq!(disk.total_gb, "0.02");
        assert_eq!(disk.used_gb, "0.02");
    }

    #[test]
    fn reserved_space_is_neither_used_nor_free() {
        let disk = disk_usage(vec![Ok(PartitionUsage {
            mount: "/".to_string(),
            total_bytes: 100 * GIB_BYTES,
            used_bytes: 45 * GIB_BYTES,
            free_bytes: 50 * GIB_BYTES,
        })]);
        assert_eq!(
            disk.used_percentage.as_deref(),
            Some("/ 45.00%(45.00gb/100.00gb)")
        );
        let entry = &disk.partitions[0];
        assert_eq!(entry.used_gb, "45.00");
        assert_eq!(entry.free_gb, "50.00");
        assert_eq!(disk.free_gb, "50.00");
    }

    #[test]
    fn no_partitions_gives_zero_totals_only() {
        let disk = disk_usage(Vec::new());
        let json = serde_json::to_string(&disk).unwrap();
        assert_eq!(
            json,
            r#"{"total_gb":"0.00","used_gb":"0.00","free_gb":"0.00"}"#
        );
    }

    #[test]
    fn unreadable_partition_is_skipped_without_gap() {
        let host = FixtureHost {
            partitions: vec![
                Ok(partition("/", 100, 50)),
                Err("/mnt/stale".to_string()),
                Ok(partition("/home", 10, 5)),
            ],
            ..FixtureHost::standard()
        };
        let disk = disk_usage(host.partitions());
        assert_eq!(disk.partitions.len(), 2);
        assert_eq!(disk.partitions[1].partition, "/home");
        let json: Value = serde_json::to_value(&disk).unwrap();
        assert_eq!(json["disk_1"]["partition"], "/home");
        assert!(json.get("disk_2").is_none());
    }

    #[test]
    fn disk_keys_serialize_in_insertion_order() {
        let disk = disk_usage(
            (0..11)
                .map(|i| Ok(partition(&format!("/m{i}"), 2, 1)))
                .collect::<Vec<_>>(),
        );
        let json = serde_json::to_string(&disk).unwrap();
        let d9 = json.find("\"disk_9\"").unwrap();
        let d10 = json.find("\"disk_10\"").unwrap();
        assert!(json.starts_with("{\"used_percentage\":"));
        assert!(d9 < d10);
        assert!(json.ends_with("\"free_gb\":\"11.00\"}"));
    }

    #[tokio::test]
    async fn end_to_end_without_optional_probes() {
        let report = collect_report(
            &FixtureHost::standard(),
            &ReportOptions::default(),
            &Config::default(),
        )
        .await
        .unwrap();
        let json = to_json(&report);

        let mut keys: Vec<&str> = json.as_object().unwrap().keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            ["cpu_count", "cpu_load", "disk", "hostname", "ipaddress_eth0", "ram"]
        );
        assert_eq!(json["hostname"], "node-1");
        assert_eq!(json["ipaddress_eth0"], "10.0.0.5");
        assert_eq!(json["ram"]["used_percentage"], "10.00%(1.00gb/10.00gb)");
        assert_eq!(json["disk"]["used_percentage"], "/ 50.00%(50.00gb/100.00gb)");
        assert_eq!(json["disk"]["disk_0"]["used_percentage"], "50.00%");
        assert_eq!(json["cpu_count"], 4);
        assert_eq!(json["cpu_load"], "0.10 0.20 0.30 1/100 4242");
    }

    #[tokio::test]
    async fn output_is_a_single_line() {
        let report = collect_report(
            &FixtureHost::standard(),
            &ReportOptions::default(),
            &Config::default(),
        )
        .await
        .unwrap();
        let line = serde_json::to_string(&report).unwrap();
        assert!(!line.contains('\n'));
        assert!(line.starts_with("{\"hostname\":\"node-1\",\"ipaddress_eth0\":"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn service_status_is_included_when_requested() {
        let opts = ReportOptions {
            service_command: Some("echo active".to_string()),
            ..ReportOptions::default()
        };
        let report = collect_report(&FixtureHost::standard(), &opts, &Config::default())
            .await
            .unwrap();
        assert_eq!(
            report.service_status.as_deref(),
            Some("Service Status: \nactive\n")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_service_aborts_by_default() {
        let opts = ReportOptions {
            service_command: Some("false".to_string()),
            ..ReportOptions::default()
        };
        let err = collect_report(&FixtureHost::standard(), &opts, &Config::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReportError::Probe(ProbeError::CommandExecutionFailed { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_service_is_annotated_when_configured() {
        let cfg = Config {
            optional_probe_failure: FailurePolicy::Annotate,
            ..Config::default()
        };
        let opts = ReportOptions {
            service_command: Some("false".to_string()),
            ..ReportOptions::default()
        };
        let report = collect_report(&FixtureHost::standard(), &opts, &cfg)
            .await
            .unwrap();
        let status = report.service_status.unwrap();
        assert!(status.starts_with("Service Status: \nerror: "));
        assert_eq!(report.ram.ram_total_gb, "10.00");
    }

    #[tokio::test]
    async fn log_file_key_present_whatever_the_line_count() {
        let cfg = Config {
            log_tail: crate::config::LogTailConfig {
                mode: LogTailMode::Placeholder,
            },
            ..Config::default()
        };
        for tail_lines in [0, 20, 1000] {
            let opts = ReportOptions {
                log_file: Some(PathBuf::from("/var/log/app.log")),
                tail_lines,
                ..ReportOptions::default()
            };
            let report = collect_report(&FixtureHost::standard(), &opts, &cfg)
                .await
                .unwrap();
            let json = to_json(&report);
            assert!(json.get("tail_log_file").is_some());
        }
    }

    #[tokio::test]
    async fn missing_log_file_is_annotated_when_configured() {
        let cfg = Config {
            optional_probe_failure: FailurePolicy::Annotate,
            ..Config::default()
        };
        let opts = ReportOptions {
            log_file: Some(PathBuf::from("/nonexistent/node-usage.log")),
            tail_lines: 5,
            ..ReportOptions::default()
        };
        let report = collect_report(&FixtureHost::standard(), &opts, &cfg)
            .await
            .unwrap();
        assert!(report
            .tail_log_file
            .unwrap()
            .starts_with("tail -n 5 /nonexistent/node-usage.log:\nerror: "));
    }

    #[tokio::test]
    async fn missing_load_average_is_fatal() {
        let host = FixtureHost {
            load: None,
            ..FixtureHost::standard()
        };
        let err = collect_report(&host, &ReportOptions::default(), &Config::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReportError::Probe(ProbeError::SourceUnavailable { .. })
        ));
    }
}
