/// Container-aware CPU limit detection for sizing the tokio worker pool.
///
/// Detection order:
/// 1. `ATLAS_CPU_LIMIT` env var (explicit override, "4" or "4000m")
/// 2. cgroup v2: `/sys/fs/cgroup/cpu.max`
/// 3. cgroup v1: `/sys/fs/cgroup/cpu/cpu.cfs_quota_us` + `cpu.cfs_period_us`
/// 4. Fallback: `std::thread::available_parallelism()`
///
/// Without this, tokio defaults to the host CPU count, which over-provisions
/// threads when the pod is limited to a few cores on a large node.
pub fn get_container_cpu_limit() -> usize {
    if let Ok(value) = std::env::var("ATLAS_CPU_LIMIT") {
        if let Some(cores) = parse_cpu_value(&value) {
            let threads = cores.max(1);
            eprintln!("[runtime] using ATLAS_CPU_LIMIT: {} threads", threads);
            return threads;
        }
    }

    if let Ok(max) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        if let Some(cores) = parse_cgroup_v2_cpu(&max) {
            let threads = cores.max(1);
            eprintln!("[runtime] using cgroup v2 CPU limit: {} threads", threads);
            return threads;
        }
    }

    if let (Ok(quota), Ok(period)) = (
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us"),
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us"),
    ) {
        if let Some(cores) = parse_cgroup_v1_cpu(&quota, &period) {
            let threads = cores.max(1);
            eprintln!("[runtime] using cgroup v1 CPU limit: {} threads", threads);
            return threads;
        }
    }

    let threads = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1);
    eprintln!("[runtime] using host CPU count: {} threads", threads);
    threads
}

/// "4" (cores) or "4000m" (millicores).
fn parse_cpu_value(value: &str) -> Option<usize> {
    let value = value.trim();
    match value.strip_suffix('m') {
        Some(millicores) => millicores.parse::<usize>().ok().map(|m| m / 1000),
        None => value.parse::<usize>().ok(),
    }
}

/// cgroup v2 `cpu.max`: "quota period" or "max period" (unlimited).
fn parse_cgroup_v2_cpu(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period = parts.next()?;
    if quota == "max" {
        return None;
    }
    let quota: i64 = quota.parse().ok()?;
    let period: i64 = period.parse().ok()?;
    (quota > 0 && period > 0).then(|| (quota / period) as usize)
}

fn parse_cgroup_v1_cpu(quota: &str, period: &str) -> Option<usize> {
    let quota: i64 = quota.trim().parse().ok()?;
    let period: i64 = period.trim().parse().ok()?;
    (quota > 0 && period > 0).then(|| (quota / period) as usize)
}
