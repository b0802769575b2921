//! Network diagnostics: reachability, name resolution and interface state.
//!
//! | Check | Source |
//! |-------|--------|
//! | ping latency / loss | system `ping`, run through [`subprocess::run_bounded`] |
//! | TCP port reachability | `tokio::net::TcpStream::connect` with a timeout |
//! | DNS resolution | `tokio::net::lookup_host` with a timeout |
//! | interface counters | `sysinfo::Networks`, link state from `/sys/class/net` |
//! | default gateway | `/proc/net/route` |
//! | TCP connection states | `/proc/net/tcp` and `/proc/net/tcp6` |
//!
//! Every check reports failure in its result value rather than as an error,
//! so one unreachable host never hides the rest of a report.

use anyhow::Result;
use serde::Serialize;
use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;
use sysinfo::Networks;
use tokio::net::TcpStream;
use tokio::process::Command;

use crate::config::{Config, NetworkConfig};
use crate::subprocess;

/// Well-known service ports checked by [`check_common_ports`].
pub const COMMON_PORTS: [(u16, &str); 7] = [
    (22, "SSH"),
    (80, "HTTP"),
    (443, "HTTPS"),
    (3306, "MySQL"),
    (5432, "PostgreSQL"),
    (6379, "Redis"),
    (27017, "MongoDB"),
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PingStats {
    pub host: String,
    pub success: bool,
    pub packets_sent: u32,
    pub packets_received: u32,
    pub packet_loss: f64,
    pub min_ms: Option<f64>,
    pub avg_ms: Option<f64>,
    pub max_ms: Option<f64>,
    pub error: Option<String>,
}

impl PingStats {
    fn failed(host: &str, count: u32, error: String) -> Self {
        Self {
            host: host.to_string(),
            success: false,
            packets_sent: count,
            packets_received: 0,
            packet_loss: 100.0,
            min_ms: None,
            avg_ms: None,
            max_ms: None,
            error: Some(error),
        }
    }
}

/// Read the summary lines of iputils / busybox `ping` output.
///
/// ```text
/// 3 packets transmitted, 3 received, 0% packet loss, time 2003ms
/// rtt min/avg/max/mdev = 0.045/0.061/0.079/0.014 ms
/// ```
pub fn parse_ping_output(host: &str, count: u32, output: &str) -> PingStats {
    let mut stats = PingStats::failed(host, count, "no ping summary in output".to_string());

    for line in output.lines() {
        if line.contains("packets transmitted") {
            let mut parts = line.split(',');
            let sent = parts.next().and_then(leading_number);
            let received = parts.next().and_then(leading_number);
            if let (Some(sent), Some(received)) = (sent, received) {
                stats.packets_sent = sent;
                stats.packets_received = received;
                stats.packet_loss = if sent == 0 {
                    100.0
                } else {
                    f64::from(sent.saturating_sub(received)) / f64::from(sent) * 100.0
                };
                stats.error = None;
            }
        } else if line.contains("min/avg/max") {
            let times: Vec<f64> = line
                .split('=')
                .nth(1)
                .and_then(|v| v.split_whitespace().next())
                .map(|v| v.split('/').filter_map(|t| t.parse().ok()).collect())
                .unwrap_or_default();
            if times.len() >= 3 {
                stats.min_ms = Some(times[0]);
                stats.avg_ms = Some(times[1]);
                stats.max_ms = Some(times[2]);
            }
        }
    }
    stats.success = stats.packets_received > 0;
    stats
}

fn leading_number(s: &str) -> Option<u32> {
    s.split_whitespace().next()?.parse().ok()
}

/// Ping `host` `count` times, waiting up to `reply_timeout` per reply.
pub async fn ping(host: &str, count: u32, reply_timeout: Duration) -> PingStats {
    if host.is_empty() || host.starts_with('-') {
        return PingStats::failed(host, count, format!("invalid host: {:?}", host));
    }
    let wait_secs = reply_timeout.as_secs().max(1);
    let mut command = Command::new("ping");
    command
        .arg("-c")
        .arg(count.to_string())
        .arg("-W")
        .arg(wait_secs.to_string())
        .arg(host);

    // One second between echo requests, plus the last reply's wait.
    let deadline = Duration::from_secs(u64::from(count) + wait_secs + 5);
    match subprocess::run_bounded(command, deadline).await {
        Ok(Some(out)) => {
            let stats = parse_ping_output(host, count, &String::from_utf8_lossy(&out.stdout));
            if stats.error.is_some() && !out.status.success() {
                let stderr = String::from_utf8_lossy(&out.stderr);
                return PingStats::failed(host, count, stderr.trim().to_string());
            }
            stats
        }
        Ok(None) => PingStats::failed(host, count, "ping timed out".to_string()),
        Err(e) => PingStats::failed(host, count, format!("failed to run ping: {}", e)),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortCheck {
    pub host: String,
    pub port: u16,
    pub service: Option<String>,
    pub open: bool,
    pub error: Option<String>,
}

/// Whether a TCP connection to `host:port` completes within `timeout`.
pub async fn check_port(host: &str, port: u16, timeout: Duration) -> PortCheck {
    let (open, error) = match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => (true, None),
        Ok(Err(e)) => (false, Some(e.to_string())),
        Err(_) => (false, Some(format!("timed out after {}ms", timeout.as_millis()))),
    };
    PortCheck {
        host: host.to_string(),
        port,
        service: None,
        open,
        error,
    }
}

/// [`check_port`] over [`COMMON_PORTS`], in order.
pub async fn check_common_ports(host: &str, timeout: Duration) -> Vec<PortCheck> {
    let mut checks = Vec::with_capacity(COMMON_PORTS.len());
    for (port, service) in COMMON_PORTS {
        let mut check = check_port(host, port, timeout).await;
        check.service = Some(service.to_string());
        checks.push(check);
    }
    checks
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DnsCheck {
    pub hostname: String,
    pub resolved: bool,
    pub addresses: Vec<IpAddr>,
    pub error: Option<String>,
}

pub async fn check_dns(hostname: &str, timeout: Duration) -> DnsCheck {
    let lookup = tokio::net::lookup_host((hostname, 0));
    let (addresses, error) = match tokio::time::timeout(timeout, lookup).await {
        Ok(Ok(addrs)) => {
            let mut ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
            ips.dedup();
            (ips, None)
        }
        Ok(Err(e)) => (Vec::new(), Some(e.to_string())),
        Err(_) => (Vec::new(), Some("lookup timed out".to_string())),
    };
    DnsCheck {
        hostname: hostname.to_string(),
        resolved: !addresses.is_empty(),
        addresses,
        error,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InterfaceStats {
    pub name: String,
    /// `operstate` from sysfs (`up`, `down`, `unknown`, ...).
    pub state: String,
    pub bytes_received: u64,
    pub bytes_transmitted: u64,
    pub packets_received: u64,
    pub packets_transmitted: u64,
    pub errors_received: u64,
    pub errors_transmitted: u64,
}

/// Cumulative counters for every interface, sorted by name.
pub fn interfaces() -> Vec<InterfaceStats> {
    let networks = Networks::new_with_refreshed_list();
    let mut list: Vec<InterfaceStats> = networks
        .list()
        .iter()
        .map(|(name, data)| InterfaceStats {
            name: name.clone(),
            state: link_state(name),
            bytes_received: data.total_received(),
            bytes_transmitted: data.total_transmitted(),
            packets_received: data.total_packets_received(),
            packets_transmitted: data.total_packets_transmitted(),
            errors_received: data.total_errors_on_received(),
            errors_transmitted: data.total_errors_on_transmitted(),
        })
        .collect();
    list.sort_by(|a, b| a.name.cmp(&b.name));
    list
}

fn link_state(iface: &str) -> String {
    std::fs::read_to_string(Path::new("/sys/class/net").join(iface).join("operstate"))
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Interface and gateway of the IPv4 default route in a `/proc/net/route`
/// table. Addresses there are little-endian hex.
pub fn parse_default_gateway(table: &str) -> Option<(String, Ipv4Addr)> {
    table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 || fields[1] != "00000000" {
            return None;
        }
        let raw = u32::from_str_radix(fields[2], 16).ok()?;
        if raw == 0 {
            return None;
        }
        Some((fields[0].to_string(), Ipv4Addr::from(raw.to_le_bytes())))
    })
}

pub fn default_gateway() -> Option<(String, Ipv4Addr)> {
    let table = std::fs::read_to_string("/proc/net/route").ok()?;
    parse_default_gateway(&table)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionSummary {
    pub total: usize,
    pub established: usize,
    pub listening: usize,
    pub time_wait: usize,
    pub close_wait: usize,
}

impl ConnectionSummary {
    /// Count sockets in a `/proc/net/tcp`-format table (state is the 4th
    /// column, in hex).
    pub fn add_table(&mut self, table: &str) {
        for line in table.lines().skip(1) {
            let Some(state) = line.split_whitespace().nth(3) else {
                continue;
            };
            self.total += 1;
            match state {
                "01" => self.established += 1,
                "06" => self.time_wait += 1,
                "08" => self.close_wait += 1,
                "0A" => self.listening += 1,
                _ => {}
            }
        }
    }
}

pub fn connections() -> ConnectionSummary {
    let mut summary = ConnectionSummary::default();
    for path in ["/proc/net/tcp", "/proc/net/tcp6"] {
        if let Ok(table) = std::fs::read_to_string(path) {
            summary.add_table(&table);
        }
    }
    summary
}

/// Everything the `network_status` tool and `lko network` report.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkReport {
    pub interfaces: Vec<InterfaceStats>,
    pub gateway: Option<(String, Ipv4Addr)>,
    pub pings: Vec<PingStats>,
    pub dns: Vec<DnsCheck>,
    pub ports: Vec<PortCheck>,
    pub connections: ConnectionSummary,
}

/// Which active checks a report runs beyond the local state.
#[derive(Debug, Clone, Default)]
pub struct ReportRequest {
    pub ping_gateway: bool,
    pub ping_hosts: Vec<String>,
    pub dns_names: Vec<String>,
    pub port_hosts: Vec<String>,
}

impl ReportRequest {
    /// The configured checks: gateway plus `ping_hosts` and `dns_names`.
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self {
            ping_gateway: true,
            ping_hosts: config.ping_hosts.clone(),
            dns_names: config.dns_names.clone(),
            port_hosts: Vec::new(),
        }
    }
}

pub async fn collect_report(config: &NetworkConfig, request: &ReportRequest) -> Result<NetworkReport> {
    let (interfaces, gateway, connections) =
        tokio::task::spawn_blocking(|| (interfaces(), default_gateway(), connections())).await?;

    let mut ping_targets: Vec<String> = Vec::new();
    if request.ping_gateway {
        if let Some((_, ip)) = &gateway {
            ping_targets.push(ip.to_string());
        }
    }
    ping_targets.extend(request.ping_hosts.iter().cloned());

    let mut pings = Vec::with_capacity(ping_targets.len());
    for host in &ping_targets {
        pings.push(ping(host, config.ping_count, config.ping_timeout()).await);
    }
    let mut dns = Vec::with_capacity(request.dns_names.len());
    for name in &request.dns_names {
        dns.push(check_dns(name, config.dns_timeout()).await);
    }
    let mut ports = Vec::new();
    for host in &request.port_hosts {
        ports.extend(check_common_ports(host, config.connect_timeout()).await);
    }

    Ok(NetworkReport {
        interfaces,
        gateway,
        pings,
        dns,
        ports,
        connections,
    })
}

/// Human-readable report, also used as the `network_status` tool output.
pub fn render(report: &NetworkReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Interfaces:");
    if report.interfaces.is_empty() {
        let _ = writeln!(out, "  (none)");
    }
    for i in &report.interfaces {
        let _ = writeln!(
            out,
            "  {:<12} {:<8} rx {} ({} errors)  tx {} ({} errors)",
            i.name,
            i.state,
            crate::stats::format_bytes(i.bytes_received),
            i.errors_received,
            crate::stats::format_bytes(i.bytes_transmitted),
            i.errors_transmitted
        );
    }

    match &report.gateway {
        Some((iface, ip)) => {
            let _ = writeln!(out, "Gateway:       {} via {}", ip, iface);
        }
        None => {
            let _ = writeln!(out, "Gateway:       none (no IPv4 default route)");
        }
    }

    let c = &report.connections;
    let _ = writeln!(
        out,
        "Connections:   {} total, {} established, {} listening, {} time_wait, {} close_wait",
        c.total, c.established, c.listening, c.time_wait, c.close_wait
    );

    for p in &report.pings {
        match (p.success, p.avg_ms) {
            (true, Some(avg)) => {
                let _ = writeln!(
                    out,
                    "Ping {}: {}/{} replies, {:.0}% loss, avg {:.1}ms",
                    p.host, p.packets_received, p.packets_sent, p.packet_loss, avg
                );
            }
            (true, None) => {
                let _ = writeln!(
                    out,
                    "Ping {}: {}/{} replies, {:.0}% loss",
                    p.host, p.packets_received, p.packets_sent, p.packet_loss
                );
            }
            (false, _) => {
                let _ = writeln!(
                    out,
                    "Ping {}: FAILED ({})",
                    p.host,
                    p.error.as_deref().unwrap_or("no replies")
                );
            }
        }
    }
    for d in &report.dns {
        if d.resolved {
            let addrs: Vec<String> = d.addresses.iter().map(|a| a.to_string()).collect();
            let _ = writeln!(out, "DNS {}: {}", d.hostname, addrs.join(", "));
        } else {
            let _ = writeln!(
                out,
                "DNS {}: FAILED ({})",
                d.hostname,
                d.error.as_deref().unwrap_or("no addresses")
            );
        }
    }
    for p in &report.ports {
        let _ = writeln!(
            out,
            "Port {}:{} ({}): {}",
            p.host,
            p.port,
            p.service.as_deref().unwrap_or("-"),
            if p.open { "OPEN" } else { "CLOSED" }
        );
    }
    out
}

/// `lko network`.
pub async fn run_network(config: &Config, request: ReportRequest) -> Result<()> {
    let report = collect_report(&config.network, &request).await?;
    print!("{}", render(&report));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const IPUTILS_OUTPUT: &str = "PING 10.0.0.1 (10.0.0.1) 56(84) bytes of data.
64 bytes from 10.0.0.1: icmp_seq=1 ttl=64 time=0.412 ms
64 bytes from 10.0.0.1: icmp_seq=3 ttl=64 time=0.388 ms

--- 10.0.0.1 ping statistics ---
3 packets transmitted, 2 received, 33.3333% packet loss, time 2030ms
rtt min/avg/max/mdev = 0.388/0.400/0.412/0.012 ms
";

    #[test]
    fn test_parse_ping_partial_loss() {
        let stats = parse_ping_output("10.0.0.1", 3, IPUTILS_OUTPUT);
        assert!(stats.success);
        assert_eq!(stats.packets_sent, 3);
        assert_eq!(stats.packets_received, 2);
        assert!((stats.packet_loss - 100.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.min_ms, Some(0.388));
        assert_eq!(stats.avg_ms, Some(0.400));
        assert_eq!(stats.max_ms, Some(0.412));
        assert!(stats.error.is_none());
    }

    #[test]
    fn test_parse_ping_busybox_and_total_loss() {
        let busybox = "4 packets transmitted, 4 packets received, 0% packet loss\nround-trip min/avg/max = 1.1/2.2/3.3 ms\n";
        let stats = parse_ping_output("h", 4, busybox);
        assert_eq!(stats.packets_received, 4);
        assert_eq!(stats.packet_loss, 0.0);
        assert_eq!(stats.avg_ms, Some(2.2));

        let lost = parse_ping_output("h", 2, "2 packets transmitted, 0 received, 100% packet loss\n");
        assert!(!lost.success);
        assert_eq!(lost.packet_loss, 100.0);
        assert_eq!(lost.avg_ms, None);
    }

    #[test]
    fn test_parse_ping_garbage() {
        let stats = parse_ping_output("h", 3, "ping: unknown host h\n");
        assert!(!stats.success);
        assert!(stats.error.is_some());
    }

    #[tokio::test]
    async fn test_ping_rejects_option_like_host() {
        let stats = ping("-f", 1, Duration::from_secs(1)).await;
        assert!(!stats.success);
        assert!(stats.error.unwrap().contains("invalid host"));
    }

    #[tokio::test]
    async fn test_check_port_open_and_closed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let open = check_port("127.0.0.1", port, Duration::from_secs(2)).await;
        assert!(open.open);
        assert!(open.error.is_none());

        drop(listener);
        let closed = check_port("127.0.0.1", port, Duration::from_secs(2)).await;
        assert!(!closed.open);
        assert!(closed.error.is_some());
    }

    #[tokio::test]
    async fn test_check_dns_literal_and_failure() {
        let ok = check_dns("127.0.0.1", Duration::from_secs(2)).await;
        assert!(ok.resolved);
        assert_eq!(ok.addresses, vec![IpAddr::from([127, 0, 0, 1])]);

        let bad = check_dns("no-such-host.invalid", Duration::from_secs(3)).await;
        assert!(!bad.resolved);
        assert!(bad.error.is_some());
    }

    #[test]
    fn test_parse_default_gateway() {
        let table = "Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
eth0\t0000A8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF\t0\t0\t0
eth0\t00000000\t0100A8C0\t0003\t0\t0\t100\t00000000\t0\t0\t0
";
        assert_eq!(
            parse_default_gateway(table),
            Some(("eth0".to_string(), Ipv4Addr::new(192, 168, 0, 1)))
        );
        assert_eq!(parse_default_gateway(table.lines().take(2).collect::<Vec<_>>().join("\n").as_str()), None);
    }

    #[test]
    fn test_connection_summary_counts_states() {
        let table = "  sl  local_address rem_address   st tx_queue rx_queue
   0: 00000000:0016 00000000:0000 0A 00000000:00000000
   1: 0100007F:1F90 0100007F:C350 01 00000000:00000000
   2: 0100007F:C350 0100007F:1F90 06 00000000:00000000
   3: 0100007F:C351 0100007F:1F90 08 00000000:00000000
   4: 0100007F:C352 0100007F:1F90 02 00000000:00000000
";
        let mut summary = ConnectionSummary::default();
        summary.add_table(table);
        assert_eq!(
            summary,
            ConnectionSummary {
                total: 5,
                established: 1,
                listening: 1,
                time_wait: 1,
                close_wait: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_report_without_active_checks() {
        let request = ReportRequest {
            dns_names: vec!["127.0.0.1".into()],
            ..ReportRequest::default()
        };
        let report = collect_report(&NetworkConfig::default(), &request).await.unwrap();
        assert!(report.pings.is_empty());
        let text = render(&report);
        assert!(text.starts_with("Interfaces:\n"));
        assert!(text.contains("Connections:   "));
        assert!(text.contains("DNS 127.0.0.1: 127.0.0.1"));
    }

    #[test]
    fn test_render_failures() {
        let report = NetworkReport {
            interfaces: vec![],
            gateway: None,
            pings: vec![PingStats::failed("10.9.9.9", 3, "ping timed out".into())],
            dns: vec![],
            ports: vec![PortCheck {
                host: "db".into(),
                port: 5432,
                service: Some("PostgreSQL".into()),
                open: false,
                error: Some("refused".into()),
            }],
            connections: ConnectionSummary::default(),
        };
        let text = render(&report);
        assert!(text.contains("  (none)"));
        assert!(text.contains("Gateway:       none"));
        assert!(text.contains("Ping 10.9.9.9: FAILED (ping timed out)"));
        assert!(text.contains("Port db:5432 (PostgreSQL): CLOSED"));
    }
}
