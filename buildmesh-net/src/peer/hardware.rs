//! Hardware survey from `/proc`.
//!
//! Missing files (non-Linux hosts, sandboxes) leave the corresponding fields
//! at their defaults; the advertisement is informational only.

use std::collections::HashSet;

use tracing::debug;

use super::info::HardwareInfo;

const CPUINFO_PATH: &str = "/proc/cpuinfo";
const MEMINFO_PATH: &str = "/proc/meminfo";

/// Collect the hardware survey of this machine.
pub async fn survey() -> HardwareInfo {
    let mut hardware = HardwareInfo {
        arch: std::env::consts::ARCH.to_string(),
        family: std::env::consts::OS.to_string(),
        threads: std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1),
        ..HardwareInfo::default()
    };

    match tokio::fs::read_to_string(CPUINFO_PATH).await {
        Ok(text) => apply_cpuinfo(&mut hardware, &text),
        Err(e) => debug!(error = %e, "cpuinfo unavailable"),
    }
    match tokio::fs::read_to_string(MEMINFO_PATH).await {
        Ok(text) => {
            if let Some(total) = parse_mem_total(&text) {
                hardware.virtual_memory = total;
            }
        }
        Err(e) => debug!(error = %e, "meminfo unavailable"),
    }

    hardware
}

/// Fold the contents of `/proc/cpuinfo` into `hardware`.
pub(crate) fn apply_cpuinfo(hardware: &mut HardwareInfo, text: &str) {
    let mut threads = 0u32;
    let mut cores: HashSet<(String, String)> = HashSet::new();
    let mut physical_id = String::new();
    let mut max_mhz = 0f64;

    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        match key {
            "processor" => threads += 1,
            "vendor_id" | "CPU implementer" if hardware.vendor.is_empty() => {
                hardware.vendor = value.to_string();
            }
            "physical id" => physical_id = value.to_string(),
            "core id" => {
                cores.insert((physical_id.clone(), value.to_string()));
            }
            "cpu MHz" => {
                if let Ok(mhz) = value.parse::<f64>() {
                    max_mhz = max_mhz.max(mhz);
                }
            }
            "cache size" if hardware.cache_size == 0 => {
                hardware.cache_size = parse_kib(value).unwrap_or(0);
            }
            _ => {}
        }
    }

    if threads > 0 {
        hardware.threads = threads;
    }
    hardware.cores = if cores.is_empty() {
        hardware.threads
    } else {
        cores.len() as u32
    };
    hardware.max_clock = max_mhz.round() as u64;
}

/// `MemTotal` from `/proc/meminfo`, in bytes.
pub(crate) fn parse_mem_total(text: &str) -> Option<u64> {
    text.lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(parse_kib)
}

/// Parse values like `"8192 KB"` or `"16318480 kB"` into bytes.
fn parse_kib(value: &str) -> Option<u64> {
    let number = value.split_whitespace().next()?;
    number.parse::<u64>().ok().map(|kib| kib * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CPUINFO: &str = "\
processor\t: 0
vendor_id\t: GenuineIntel
cpu MHz\t\t: 2400.000
cache size\t: 8192 KB
physical id\t: 0
core id\t\t: 0

processor\t: 1
vendor_id\t: GenuineIntel
cpu MHz\t\t: 3600.512
cache size\t: 8192 KB
physical id\t: 0
core id\t\t: 0

processor\t: 2
vendor_id\t: GenuineIntel
cpu MHz\t\t: 1200.000
cache size\t: 8192 KB
physical id\t: 0
core id\t\t: 1
";

    #[test]
    fn test_cpuinfo() {
        let mut hw = HardwareInfo::default();
        apply_cpuinfo(&mut hw, CPUINFO);

        assert_eq!(hw.vendor, "GenuineIntel");
        assert_eq!(hw.threads, 3);
        assert_eq!(hw.cores, 2);
        assert_eq!(hw.max_clock, 3601);
        assert_eq!(hw.cache_size, 8192 * 1024);
    }

    #[test]
    fn test_cpuinfo_without_topology() {
        let mut hw = HardwareInfo::default();
        apply_cpuinfo(&mut hw, "processor : 0\nprocessor : 1\nCPU implementer : 0x41\n");
        assert_eq!(hw.threads, 2);
        assert_eq!(hw.cores, 2);
        assert_eq!(hw.vendor, "0x41");
    }

    #[test]
    fn test_meminfo() {
        let text = "MemTotal:       16318480 kB\nMemFree:         1234 kB\n";
        assert_eq!(parse_mem_total(text), Some(16318480 * 1024));
        assert_eq!(parse_mem_total("MemFree: 1 kB\n"), None);
    }

    #[tokio::test]
    async fn test_survey_fills_platform() {
        let hw = survey().await;
        assert_eq!(hw.arch, std::env::consts::ARCH);
        assert!(hw.threads >= 1);
    }
}
