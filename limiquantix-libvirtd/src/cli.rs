//! Command-line argument parsing.

use clap::Parser;

/// limiquantix libvirt agent - guest lifecycle over JSON-RPC
#[derive(Parser, Debug, Default)]
#[command(name = "limiquantix-libvirtd")]
#[command(about = "limiquantix libvirt agent - guest lifecycle over JSON-RPC")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "LIMIQUANTIX_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log output format (pretty, json)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Listen address for the JSON-RPC server
    #[arg(long)]
    pub listen: Option<String>,

    /// Listen port; keeps the configured listen host
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Libvirt connection URI (e.g., qemu:///system)
    #[arg(long)]
    pub uri: Option<String>,

    /// Maximum simultaneous libvirt connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Enable development mode (mock hypervisor)
    #[arg(long)]
    pub dev: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        let args = Args::try_parse_from([
            "limiquantix-libvirtd",
            "-p",
            "20000",
            "--uri",
            "qemu:///session",
            "--max-connections",
            "8",
            "--dev",
        ])
        .unwrap();

        assert_eq!(args.port, Some(20000));
        assert_eq!(args.uri.as_deref(), Some("qemu:///session"));
        assert_eq!(args.max_connections, Some(8));
        assert!(args.dev);
        assert!(args.config.is_none());
    }
}
