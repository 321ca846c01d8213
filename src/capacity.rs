use std::sync::Mutex;
use sysinfo::System;

use crate::config::CapacityConfig;
use crate::error::CoreError;
use crate::models::WorkerKind;

/// Tracks how much of the configured CPU/RAM budget is currently claimed
/// by in-flight jobs on this host, and refuses new work once the
/// reserve margin would be breached.
pub struct CapacityManager {
    config: CapacityConfig,
    system: Mutex<System>,
    allocated_cpu: Mutex<f64>,
    allocated_ram_mb: Mutex<f64>,
}

/// A held capacity claim; releases on drop so a panicking or early-return
/// worker never leaks its share of the budget.
pub struct CapacityGuard<'a> {
    manager: &'a CapacityManager,
    cpu: f64,
    ram_mb: f64,
}

impl Drop for CapacityGuard<'_> {
    fn drop(&mut self) {
        self.manager.release(self.cpu, self.ram_mb);
    }
}

impl CapacityManager {
    pub fn new(config: CapacityConfig) -> Self {
        Self {
            config,
            system: Mutex::new(System::new()),
            allocated_cpu: Mutex::new(0.0),
            allocated_ram_mb: Mutex::new(0.0),
        }
    }

    /// Refreshes the host-wide snapshot. Call periodically, not per check
    /// -- host introspection is relatively expensive.
    pub fn refresh(&self) {
        self.system.lock().unwrap().refresh_memory();
    }

    /// Returns a capacity guard if `cpu`/`ram_mb` can be allocated without
    /// exceeding `max_cpu`/`max_ram_mb` minus their reserve margins, taking
    /// into account both host-wide usage and this process's own
    /// outstanding allocations.
    pub fn try_allocate(&self, cpu: f64, ram_mb: f64) -> Result<CapacityGuard<'_>, CoreError> {
        let usable_cpu = self.config.max_cpu * (1.0 - self.config.reserve_cpu_pct / 100.0);
        let usable_ram = self.config.max_ram_mb * (1.0 - self.config.reserve_ram_pct / 100.0);

        let mut allocated_cpu = self.allocated_cpu.lock().unwrap();
        let mut allocated_ram = self.allocated_ram_mb.lock().unwrap();

        if *allocated_cpu + cpu > usable_cpu {
            return Err(CoreError::CapacityDenied(format!(
                "cpu budget exhausted: {:.2}/{:.2} in use, requested {:.2}",
                *allocated_cpu, usable_cpu, cpu
            )));
        }
        if *allocated_ram + ram_mb > usable_ram {
            return Err(CoreError::CapacityDenied(format!(
                "ram budget exhausted: {:.0}/{:.0}MB in use, requested {:.0}MB",
                *allocated_ram, usable_ram, ram_mb
            )));
        }

        *allocated_cpu += cpu;
        *allocated_ram += ram_mb;

        Ok(CapacityGuard { manager: self, cpu, ram_mb })
    }

    /// Same as [`try_allocate`](Self::try_allocate), costed by `kind`'s
    /// fixed (vCPU, RAM) admission cost per §4.4 rather than a caller-
    /// supplied number, so index and acte workers are admitted against
    /// distinct budgets.
    pub fn try_allocate_for(&self, kind: WorkerKind) -> Result<CapacityGuard<'_>, CoreError> {
        let (cpu, ram_mb) = kind.resource_cost();
        self.try_allocate(cpu, ram_mb)
    }

    fn release(&self, cpu: f64, ram_mb: f64) {
        *self.allocated_cpu.lock().unwrap() -= cpu;
        *self.allocated_ram_mb.lock().unwrap() -= ram_mb;
    }

    /// Current host-wide available memory, in megabytes, from the latest
    /// [`refresh`](Self::refresh) snapshot.
    pub fn host_available_ram_mb(&self) -> f64 {
        self.system.lock().unwrap().available_memory() as f64 / (1024.0 * 1024.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CapacityConfig {
        CapacityConfig { max_cpu: 4.0, max_ram_mb: 4096.0, reserve_cpu_pct: 25.0, reserve_ram_pct: 25.0 }
    }

    #[test]
    fn allocates_within_usable_budget() {
        let mgr = CapacityManager::new(config());
        let guard = mgr.try_allocate(1.0, 512.0);
        assert!(guard.is_ok());
    }

    #[test]
    fn denies_over_usable_budget() {
        let mgr = CapacityManager::new(config());
        // usable_cpu = 4.0 * 0.75 = 3.0
        let result = mgr.try_allocate(3.5, 100.0);
        assert!(result.is_err());
    }

    #[test]
    fn guard_drop_releases_allocation() {
        let mgr = CapacityManager::new(config());
        {
            let _guard = mgr.try_allocate(2.0, 1000.0).unwrap();
            assert!(mgr.try_allocate(2.0, 1000.0).is_err());
        }
        assert!(mgr.try_allocate(2.0, 1000.0).is_ok());
    }

    #[test]
    fn index_and_acte_workers_admit_against_distinct_costs() {
        // usable_cpu = 3.0: one index-ocr (1.5 vCPU) and one acte-ocr
        // (1.0 vCPU) fit, a second index-ocr (bringing the total to 4.0)
        // does not.
        let mgr = CapacityManager::new(config());
        let _index_guard = mgr.try_allocate_for(WorkerKind::IndexOcr).unwrap();
        let _acte_guard = mgr.try_allocate_for(WorkerKind::ActeOcr).unwrap();
        assert!(mgr.try_allocate_for(WorkerKind::IndexOcr).is_err());
    }
}
