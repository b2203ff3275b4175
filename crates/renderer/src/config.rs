use std::net::SocketAddr;

use netsink::DiscoveryConfig;

/// Assembled runtime configuration.
#[derive(Clone, Debug)]
pub struct RendererConfig {
    pub name: String,
    pub http_bind: SocketAddr,
    pub discovery: DiscoveryConfig,
    /// 0-based sink target selection; `None` requires a single target.
    pub target_index: Option<usize>,
    pub advertise: bool,
}

impl RendererConfig {
    pub fn from_args(args: &crate::cli::Args) -> Self {
        Self {
            name: args.name.clone(),
            http_bind: args.bind,
            discovery: DiscoveryConfig {
                port: args.sink_port,
                mtu_override: args.mtu,
                ..Default::default()
            },
            // The CLI is 1-based to match the listing output.
            target_index: args.target.map(|t| t.saturating_sub(1)),
            advertise: !args.no_mdns,
        }
    }
}
