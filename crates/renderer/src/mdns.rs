//! LAN advertisement of the control endpoint.
//!
//! Control points find the renderer through a `_netsink-renderer._tcp`
//! service record carrying the API port, the display name, and a stable
//! instance id. The id is derived from the hostname so a control point
//! sees the same renderer identity across restarts.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use mdns_sd::{ServiceDaemon, ServiceInfo};

const SERVICE_TYPE: &str = "_netsink-renderer._tcp.local.";

/// An active service registration. Withdraw it with [`shutdown`] before
/// process exit so control points drop the entry immediately instead of
/// waiting out the record TTL.
///
/// [`shutdown`]: Advertisement::shutdown
pub struct Advertisement {
    daemon: ServiceDaemon,
    fullname: String,
}

impl Advertisement {
    /// Publish the control endpoint on the LAN.
    ///
    /// Interface addresses are left to the daemon (`enable_addr_auto`),
    /// which also tracks interface changes while the renderer runs.
    pub fn publish(name: &str, api: SocketAddr) -> Result<Self> {
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        let instance = instance_id(&hostname);

        let mut properties = HashMap::new();
        properties.insert("id".to_string(), instance.clone());
        properties.insert("name".to_string(), name.to_string());
        properties.insert("api_port".to_string(), api.port().to_string());
        properties.insert(
            "version".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        );

        let info = ServiceInfo::new(
            SERVICE_TYPE,
            &instance,
            &format!("{hostname}.local."),
            "",
            api.port(),
            properties,
        )
        .context("build service record")?
        .enable_addr_auto();

        let fullname = info.get_fullname().to_string();
        let daemon = ServiceDaemon::new().context("start mdns daemon")?;
        daemon
            .register(info)
            .with_context(|| format!("register {fullname}"))?;

        tracing::info!(
            instance = %instance,
            renderer = %name,
            api_port = api.port(),
            "advertising control endpoint"
        );

        Ok(Self { daemon, fullname })
    }

    /// Withdraw the record and stop the daemon.
    pub fn shutdown(self) {
        if let Ok(done) = self.daemon.unregister(&self.fullname) {
            let _ = done.recv_timeout(Duration::from_secs(1));
        }
        let _ = self.daemon.shutdown();
        tracing::debug!("advertisement withdrawn");
    }
}

/// Stable instance id for this machine. Hashing the hostname keeps the
/// advertised identity constant across restarts without persisting
/// anything.
fn instance_id(hostname: &str) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    hostname.hash(&mut hasher);
    format!("netsink-renderer-{:08x}", hasher.finish() as u32)
}
