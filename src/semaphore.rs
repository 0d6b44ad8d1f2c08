//! Per-resource concurrency limits.
//!
//! Five independent counting semaphores model the external bottlenecks:
//! NFC leases per ESXi host, local disk throughput, S3 bandwidth, the
//! cloud API rate, and total in-flight pipelines. Independence is the
//! point: a VM uploading never blocks another converting.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::error::{Result, VmshiftError};
use crate::plan::ConcurrencyCaps;

/// Resource classes, in the global acquisition order. Every stage acquires
/// its declared classes in this order, which rules out deadlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceClass {
    Global,
    PerEsxiHost,
    DiskIo,
    S3Upload,
    ScwApi,
}

impl ResourceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceClass::Global => "global",
            ResourceClass::PerEsxiHost => "per_esxi_host",
            ResourceClass::DiskIo => "disk_io",
            ResourceClass::S3Upload => "s3_upload",
            ResourceClass::ScwApi => "scw_api",
        }
    }
}

/// Permits held for one stage execution; released on drop.
#[derive(Default)]
pub struct StagePermits {
    permits: Vec<OwnedSemaphorePermit>,
}

impl StagePermits {
    pub fn count(&self) -> usize {
        self.permits.len()
    }
}

pub struct ResourceSemaphores {
    global: Arc<Semaphore>,
    disk_io: Arc<Semaphore>,
    s3_upload: Arc<Semaphore>,
    scw_api: Arc<Semaphore>,
    per_host_cap: usize,
    // Lazily created, one per ESXi host name.
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl ResourceSemaphores {
    pub fn new(caps: &ConcurrencyCaps) -> Self {
        Self {
            global: Arc::new(Semaphore::new(caps.global)),
            disk_io: Arc::new(Semaphore::new(caps.disk_io)),
            s3_upload: Arc::new(Semaphore::new(caps.s3_upload)),
            scw_api: Arc::new(Semaphore::new(caps.scw_api)),
            per_host_cap: caps.per_esxi_host,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    async fn host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut hosts = self.hosts.lock().await;
        hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_cap)))
            .clone()
    }

    fn flat(&self, class: ResourceClass) -> Arc<Semaphore> {
        match class {
            ResourceClass::Global => self.global.clone(),
            ResourceClass::DiskIo => self.disk_io.clone(),
            ResourceClass::S3Upload => self.s3_upload.clone(),
            ResourceClass::ScwApi => self.scw_api.clone(),
            ResourceClass::PerEsxiHost => unreachable!("host semaphores are namespaced"),
        }
    }

    /// Acquire one permit on the pipeline-lifetime `global` semaphore.
    pub async fn acquire_global(&self) -> Result<OwnedSemaphorePermit> {
        self.global
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| VmshiftError::Cancelled)
    }

    /// Acquire a stage's declared semaphores, always in the fixed global
    /// order. `host` names the VM's ESXi host for the namespaced class.
    pub async fn acquire(&self, classes: &[ResourceClass], host: &str) -> Result<StagePermits> {
        let mut ordered: Vec<ResourceClass> = classes.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut permits = Vec::with_capacity(ordered.len());
        for class in ordered {
            let sem = match class {
                ResourceClass::PerEsxiHost => self.host_semaphore(host).await,
                other => self.flat(other),
            };
            let permit = sem
                .acquire_owned()
                .await
                .map_err(|_| VmshiftError::Cancelled)?;
            permits.push(permit);
        }
        Ok(StagePermits { permits })
    }

    /// Available permits for a flat class (observability only).
    pub fn available(&self, class: ResourceClass) -> usize {
        match class {
            ResourceClass::PerEsxiHost => self.per_host_cap,
            other => self.flat(other).available_permits(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn permits_cap_concurrency() {
        let caps = ConcurrencyCaps {
            disk_io: 2,
            ..Default::default()
        };
        let sems = Arc::new(ResourceSemaphores::new(&caps));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let sems = sems.clone();
            let in_flight = in_flight.clone();
            let max_seen = max_seen.clone();
            tasks.push(tokio::spawn(async move {
                let _permits = sems.acquire(&[ResourceClass::DiskIo], "h1").await.unwrap();
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn host_semaphores_are_independent() {
        let caps = ConcurrencyCaps {
            per_esxi_host: 1,
            ..Default::default()
        };
        let sems = ResourceSemaphores::new(&caps);
        // One permit per host: holding host-a must not block host-b.
        let _a = sems.acquire(&[ResourceClass::PerEsxiHost], "esxi-a").await.unwrap();
        let b = tokio::time::timeout(
            Duration::from_millis(100),
            sems.acquire(&[ResourceClass::PerEsxiHost], "esxi-b"),
        )
        .await;
        assert!(b.is_ok(), "different host must not contend");

        // Same host does contend.
        let a2 = tokio::time::timeout(
            Duration::from_millis(50),
            sems.acquire(&[ResourceClass::PerEsxiHost], "esxi-a"),
        )
        .await;
        assert!(a2.is_err(), "same host must contend");
    }

    #[tokio::test]
    async fn acquisition_order_is_canonical() {
        let sems = ResourceSemaphores::new(&ConcurrencyCaps::default());
        // Declaring classes out of order must not deadlock against a task
        // declaring them in order; both normalize to the fixed order.
        let p1 = sems
            .acquire(&[ResourceClass::ScwApi, ResourceClass::DiskIo], "h")
            .await
            .unwrap();
        let p2 = sems
            .acquire(&[ResourceClass::DiskIo, ResourceClass::ScwApi], "h")
            .await
            .unwrap();
        assert_eq!(p1.count(), 2);
        assert_eq!(p2.count(), 2);
    }
}
