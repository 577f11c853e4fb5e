//! GPU capability probing.
//!
//! Runs once at startup. Each step can fail independently and maps to its own
//! reason, so the user knows whether to update drivers, switch machines, or
//! leave a sandbox that advertises a GPU it cannot actually open.

use std::cell::Cell;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures_util::FutureExt;
use tracing::{info, warn};

use crate::error::CapabilityError;

/// Used when the adapter cannot name itself.
pub const GENERIC_DEVICE_LABEL: &str = "GPU device";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityReport {
    pub supported: bool,
    pub reason: String,
    pub device_label: Option<String>,
}

impl CapabilityReport {
    pub fn ready(device_label: impl Into<String>) -> Self {
        Self {
            supported: true,
            reason: "GPU ready".to_string(),
            device_label: Some(device_label.into()),
        }
    }

    pub fn unsupported(error: &CapabilityError) -> Self {
        Self {
            supported: false,
            reason: error.to_string(),
            device_label: None,
        }
    }

    /// One-line banner text.
    pub fn summary(&self) -> String {
        match (&self.device_label, self.supported) {
            (Some(label), true) => format!("{} • GPU: {}", self.reason, label),
            _ => self.reason.clone(),
        }
    }
}

/// Access to the host's graphics driver stack.
#[async_trait]
pub trait GpuHost: Send + Sync {
    fn interface_available(&self) -> bool;

    async fn request_adapter(&self) -> Option<Box<dyn GpuAdapter>>;
}

#[async_trait]
pub trait GpuAdapter: Send + Sync {
    /// Open a logical device, proving the adapter is actually usable.
    async fn request_device(&self) -> Result<(), String>;

    fn label(&self) -> Option<String>;
}

thread_local! {
    static CONTAINED_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// True while this thread runs driver code whose panics the probe catches.
///
/// Panic hooks fire before unwinding reaches `catch_unwind`, so a hook that
/// tears down process state should leave these panics alone.
pub fn panic_is_contained() -> bool {
    CONTAINED_DEPTH.with(|depth| depth.get() > 0)
}

struct ContainedScope;

impl ContainedScope {
    fn enter() -> Self {
        CONTAINED_DEPTH.with(|depth| depth.set(depth.get() + 1));
        ContainedScope
    }
}

impl Drop for ContainedScope {
    fn drop(&mut self) {
        CONTAINED_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

fn contain<R>(f: impl FnOnce() -> R) -> std::thread::Result<R> {
    let _scope = ContainedScope::enter();
    std::panic::catch_unwind(AssertUnwindSafe(f))
}

/// Like `contain`, for a future. The flag is raised for each poll, on
/// whichever thread does the polling.
async fn contain_async<F: Future>(fut: F) -> std::thread::Result<F::Output> {
    let mut fut = std::pin::pin!(AssertUnwindSafe(fut).catch_unwind());
    std::future::poll_fn(|cx| {
        let _scope = ContainedScope::enter();
        fut.as_mut().poll(cx)
    })
    .await
}

pub async fn probe(host: &dyn GpuHost) -> CapabilityReport {
    match try_probe(host).await {
        Ok(label) => {
            info!(device = %label, "GPU capability probe succeeded");
            CapabilityReport::ready(label)
        }
        Err(err) => {
            warn!(reason = %err, "GPU capability probe failed");
            CapabilityReport::unsupported(&err)
        }
    }
}

async fn try_probe(host: &dyn GpuHost) -> Result<String, CapabilityError> {
    if !host.interface_available() {
        return Err(CapabilityError::NoInterface);
    }

    let adapter = host
        .request_adapter()
        .await
        .ok_or(CapabilityError::NoAdapter)?;

    match contain_async(adapter.request_device()).await {
        Ok(Ok(())) => {}
        Ok(Err(detail)) => return Err(CapabilityError::DeviceInit(detail)),
        Err(_) => return Err(CapabilityError::DeviceInit(String::new())),
    }

    let label = contain(|| adapter.label())
        .ok()
        .flatten()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .unwrap_or_else(|| GENERIC_DEVICE_LABEL.to_string());
    Ok(label)
}

/// The host this build can talk to.
pub fn default_host() -> Box<dyn GpuHost> {
    #[cfg(feature = "gpu")]
    {
        Box::new(wgpu_host::WgpuHost::new())
    }

    #[cfg(not(feature = "gpu"))]
    {
        Box::new(NoGpuHost)
    }
}

/// Stands in when the build carries no graphics backend.
#[cfg(not(feature = "gpu"))]
struct NoGpuHost;

#[cfg(not(feature = "gpu"))]
#[async_trait]
impl GpuHost for NoGpuHost {
    fn interface_available(&self) -> bool {
        false
    }

    async fn request_adapter(&self) -> Option<Box<dyn GpuAdapter>> {
        None
    }
}

#[cfg(feature = "gpu")]
mod wgpu_host {
    use async_trait::async_trait;

    use super::{contain, GpuAdapter, GpuHost};

    pub struct WgpuHost {
        /// `None` when no graphics backend could be initialised at all.
        instance: Option<wgpu::Instance>,
    }

    impl WgpuHost {
        pub fn new() -> Self {
            // wgpu panics when the build has no backend usable on this platform.
            let instance = contain(|| {
                wgpu::Instance::new(&wgpu::InstanceDescriptor {
                    backends: wgpu::Backends::all(),
                    ..Default::default()
                })
            })
            .ok();
            Self { instance }
        }
    }

    #[async_trait]
    impl GpuHost for WgpuHost {
        fn interface_available(&self) -> bool {
            self.instance.is_some()
        }

        async fn request_adapter(&self) -> Option<Box<dyn GpuAdapter>> {
            let adapter = self
                .instance
                .as_ref()?
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::HighPerformance,
                    compatible_surface: None,
                    force_fallback_adapter: false,
                })
                .await?;
            Some(Box::new(WgpuAdapter { adapter }))
        }
    }

    struct WgpuAdapter {
        adapter: wgpu::Adapter,
    }

    #[async_trait]
    impl GpuAdapter for WgpuAdapter {
        async fn request_device(&self) -> Result<(), String> {
            // Use the adapter's own limits so weaker GPUs still qualify.
            self.adapter
                .request_device(
                    &wgpu::DeviceDescriptor {
                        label: Some("localchat-probe"),
                        required_features: wgpu::Features::empty(),
                        required_limits: self.adapter.limits(),
                        memory_hints: wgpu::MemoryHints::default(),
                    },
                    None,
                )
                .await
                .map(|_| ())
                .map_err(|e| e.to_string())
        }

        fn label(&self) -> Option<String> {
            let info = self.adapter.get_info();
            [info.name, info.driver]
                .into_iter()
                .find(|s| !s.trim().is_empty())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    enum Device {
        Ok,
        Fails,
        Panics,
    }

    struct FakeHost {
        interface: bool,
        adapter: bool,
        device: fn() -> Device,
        label: Option<&'static str>,
    }

    struct FakeAdapter {
        device: Device,
        label: Option<&'static str>,
    }

    #[async_trait]
    impl GpuHost for FakeHost {
        fn interface_available(&self) -> bool {
            self.interface
        }

        async fn request_adapter(&self) -> Option<Box<dyn GpuAdapter>> {
            self.adapter.then(|| {
                Box::new(FakeAdapter {
                    device: (self.device)(),
                    label: self.label,
                }) as Box<dyn GpuAdapter>
            })
        }
    }

    #[async_trait]
    impl GpuAdapter for FakeAdapter {
        async fn request_device(&self) -> Result<(), String> {
            match self.device {
                Device::Ok => Ok(()),
                Device::Fails => Err("sandboxed".to_string()),
                Device::Panics => panic!("driver crashed"),
            }
        }

        fn label(&self) -> Option<String> {
            self.label.map(str::to_string)
        }
    }

    fn host() -> FakeHost {
        FakeHost {
            interface: true,
            adapter: true,
            device: || Device::Ok,
            label: Some("Test GPU 9000"),
        }
    }

    #[tokio::test]
    async fn test_probe_success_with_label() {
        let report = probe(&host()).await;
        assert!(report.supported);
        assert_eq!(report.device_label.as_deref(), Some("Test GPU 9000"));
        assert_eq!(report.summary(), "GPU ready • GPU: Test GPU 9000");
    }

    #[tokio::test]
    async fn test_probe_missing_label_falls_back() {
        let report = probe(&FakeHost { label: Some("  "), ..host() }).await;
        assert!(report.supported);
        assert_eq!(report.device_label.as_deref(), Some(GENERIC_DEVICE_LABEL));

        let report = probe(&FakeHost { label: None, ..host() }).await;
        assert_eq!(report.device_label.as_deref(), Some(GENERIC_DEVICE_LABEL));
    }

    #[tokio::test]
    async fn test_probe_failure_reasons() {
        let report = probe(&FakeHost { interface: false, ..host() }).await;
        assert!(!report.supported);
        assert_eq!(report.reason, "no driver interface available");

        let report = probe(&FakeHost { adapter: false, ..host() }).await;
        assert_eq!(report.reason, "no compatible adapter");

        let report = probe(&FakeHost { device: || Device::Fails, ..host() }).await;
        assert_eq!(report.reason, "device initialization failed: sandboxed");
        assert!(report.device_label.is_none());
    }

    #[tokio::test]
    async fn test_probe_device_panic_is_contained() {
        let report = probe(&FakeHost { device: || Device::Panics, ..host() }).await;
        assert!(!report.supported);
        assert_eq!(report.reason, "device initialization failed");
        assert!(!panic_is_contained());
    }

    #[test]
    fn test_contained_region_is_flagged() {
        assert!(!panic_is_contained());
        assert!(contain(panic_is_contained).unwrap());
        assert!(contain(|| panic!("driver crashed")).is_err());
        assert!(!panic_is_contained());
    }

    #[tokio::test]
    async fn test_contained_future_is_flagged_while_polled() {
        let inside = contain_async(async {
            tokio::task::yield_now().await;
            panic_is_contained()
        })
        .await
        .unwrap();
        assert!(inside);
        assert!(!panic_is_contained());
    }
}
