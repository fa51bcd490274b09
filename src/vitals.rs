//! Host vitals sampling

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use sysinfo::{Disks, System};

use crate::api::NodeStatus;
use crate::error::{Error, Result};

#[async_trait]
pub trait VitalsSource: Send + Sync {
    async fn sample(&self) -> Result<NodeStatus>;
}

/// Vitals of the local host, read through `sysinfo`
///
/// CPU usage is measured between consecutive samples, so the first sample
/// covers the time since construction.
pub struct ProcVitals {
    system: Mutex<System>,
}

impl Default for ProcVitals {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcVitals {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        Self {
            system: Mutex::new(system),
        }
    }

    fn cpu_and_memory(&self) -> Result<(f64, f64)> {
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        system.refresh_cpu();
        system.refresh_memory();

        let total = system.total_memory();
        if total == 0 {
            return Err(Error::VitalsError("total memory unavailable".to_string()));
        }
        let cpu = f64::from(system.global_cpu_info().cpu_usage()).clamp(0.0, 100.0);
        Ok((cpu, percent(system.used_memory(), total)))
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 / whole as f64 * 100.0).clamp(0.0, 100.0)
}

/// Used share of the filesystem mounted at `/`
fn root_disk_usage<'a>(mounts: impl IntoIterator<Item = (&'a Path, u64, u64)>) -> Result<f64> {
    mounts
        .into_iter()
        .find(|(mount, _, _)| *mount == Path::new("/"))
        .map(|(_, total, available)| percent(total.saturating_sub(available), total))
        .ok_or_else(|| Error::VitalsError("no filesystem mounted at /".to_string()))
}

#[async_trait]
impl VitalsSource for ProcVitals {
    async fn sample(&self) -> Result<NodeStatus> {
        let (cpu, mem) = self.cpu_and_memory()?;
        let disks = Disks::new_with_refreshed_list();
        let disk = root_disk_usage(
            disks
                .list()
                .iter()
                .map(|d| (d.mount_point(), d.total_space(), d.available_space())),
        )?;
        Ok(NodeStatus {
            cpu,
            mem,
            disk,
            uptime: System::uptime(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_disk_usage() {
        let mounts = vec![
            (Path::new("/boot"), 100, 10),
            (Path::new("/"), 200, 150),
        ];
        assert_eq!(root_disk_usage(mounts).unwrap(), 25.0);
        assert!(root_disk_usage(vec![(Path::new("/data"), 1, 1)]).is_err());
    }

    #[test]
    fn test_percent_of_empty_whole() {
        assert_eq!(percent(5, 0), 0.0);
    }

    #[test]
    fn test_cpu_and_memory_are_percentages() {
        let vitals = ProcVitals::new();
        let (cpu, mem) = vitals.cpu_and_memory().unwrap();
        assert!((0.0..=100.0).contains(&cpu));
        assert!(mem > 0.0 && mem <= 100.0);
    }
}
