use std::net::SocketAddr;

use clap::Parser;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_SHA"),
    ", ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "netsink-renderer", version = VERSION)]
pub struct Args {
    /// Renderer name advertised on the LAN
    #[arg(long, default_value = "Netsink Renderer")]
    pub name: String,

    /// Control API bind address
    #[arg(long, default_value = "0.0.0.0:5580")]
    pub bind: SocketAddr,

    /// UDP port sink targets listen on
    #[arg(long, default_value_t = 47001)]
    pub sink_port: u16,

    /// Select a sink target by index (1, 2, 3...) when several are found
    #[arg(long)]
    pub target: Option<usize>,

    /// Override the probed MTU (0 = probe; common values 1500, 9000, 16128)
    #[arg(long, default_value_t = 0)]
    pub mtu: u32,

    /// List available sink targets and exit
    #[arg(long)]
    pub list_targets: bool,

    /// Skip mDNS advertisement
    #[arg(long)]
    pub no_mdns: bool,

    /// Enable verbose debug output
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let args = Args::parse_from(["netsink-renderer"]);
        assert_eq!(args.bind.port(), 5580);
        assert_eq!(args.sink_port, 47001);
        assert_eq!(args.mtu, 0);
        assert!(args.target.is_none());
        assert!(!args.verbose);
    }

    #[test]
    fn target_index_is_one_based_on_the_cli() {
        let args = Args::parse_from(["netsink-renderer", "--target", "2"]);
        assert_eq!(args.target, Some(2));
    }
}
