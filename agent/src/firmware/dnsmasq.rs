//! DHCP and DNS through dnsmasq drop-in files.

use std::fmt::Write as _;
use std::net::IpAddr;

use serde::Deserialize;

use super::{FirmwareError, Section, validate};

pub(super) const DHCP_FILE: &str = "fleet-dhcp.conf";
pub(super) const DNS_FILE: &str = "fleet-dns.conf";

const HEADER: &str = "# Managed by fleet-agent. Local edits are overwritten.\n";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct StaticLease {
    pub mac: String,
    pub ip: String,
    #[serde(default)]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct DhcpConfig {
    pub interface: String,
    pub range_start: String,
    pub range_end: String,
    #[serde(default = "default_lease")]
    pub lease_time: String,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub dns_servers: Vec<String>,
    #[serde(default)]
    pub static_leases: Vec<StaticLease>,
}

fn default_lease() -> String {
    "12h".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct HostRecord {
    pub name: String,
    pub ip: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct DnsConfig {
    #[serde(default)]
    pub upstream: Vec<String>,
    #[serde(default)]
    pub hosts: Vec<HostRecord>,
    #[serde(default)]
    pub cache_size: Option<u32>,
    #[serde(default)]
    pub domain: Option<String>,
}

pub(super) fn reload_command() -> Vec<String> {
    vec!["/etc/init.d/dnsmasq".to_string(), "restart".to_string()]
}

fn dhcp_invalid(reason: impl Into<String>) -> FirmwareError {
    FirmwareError::invalid(Section::Dhcp, reason)
}

fn dns_invalid(reason: impl Into<String>) -> FirmwareError {
    FirmwareError::invalid(Section::Dns, reason)
}

pub(super) fn render_dhcp(config: &DhcpConfig) -> Result<String, FirmwareError> {
    validate::ifname(&config.interface).map_err(dhcp_invalid)?;
    let start = validate::ip(&config.range_start).map_err(dhcp_invalid)?;
    let end = validate::ip(&config.range_end).map_err(dhcp_invalid)?;
    match (start, end) {
        (IpAddr::V4(s), IpAddr::V4(e)) if s <= e => {}
        _ => return Err(dhcp_invalid("range must be IPv4 with start <= end")),
    }
    lease_time(&config.lease_time)?;

    let mut out = String::from(HEADER);
    let iface = &config.interface;
    let _ = writeln!(out, "interface={iface}");
    let _ = writeln!(out, "dhcp-range={iface},{start},{end},{}", config.lease_time);
    if let Some(gateway) = &config.gateway {
        let gateway = validate::ip(gateway).map_err(dhcp_invalid)?;
        let _ = writeln!(out, "dhcp-option={iface},option:router,{gateway}");
    }
    if !config.dns_servers.is_empty() {
        let servers = config
            .dns_servers
            .iter()
            .map(|s| validate::ip(s).map(|ip| ip.to_string()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(dhcp_invalid)?;
        let _ = writeln!(out, "dhcp-option={iface},option:dns-server,{}", servers.join(","));
    }

    // Sorted by MAC so the file does not depend on payload order.
    let mut leases = Vec::with_capacity(config.static_leases.len());
    for lease in &config.static_leases {
        let mac = mac(&lease.mac)?;
        let ip = validate::ip(&lease.ip).map_err(dhcp_invalid)?;
        let line = match &lease.hostname {
            Some(name) => {
                validate::hostname(name).map_err(dhcp_invalid)?;
                format!("dhcp-host={mac},{ip},{name}")
            }
            None => format!("dhcp-host={mac},{ip}"),
        };
        leases.push((mac, line));
    }
    leases.sort();
    if leases.windows(2).any(|w| w[0].0 == w[1].0) {
        return Err(dhcp_invalid("duplicate MAC in static_leases"));
    }
    for (_, line) in leases {
        let _ = writeln!(out, "{line}");
    }
    Ok(out)
}

pub(super) fn render_dns(config: &DnsConfig) -> Result<String, FirmwareError> {
    let mut out = String::from(HEADER);

    if !config.upstream.is_empty() {
        out.push_str("no-resolv\n");
        for server in &config.upstream {
            let server = validate::ip(server).map_err(dns_invalid)?;
            let _ = writeln!(out, "server={server}");
        }
    }
    if let Some(domain) = &config.domain {
        validate::hostname(domain).map_err(dns_invalid)?;
        let _ = writeln!(out, "domain={domain}");
        let _ = writeln!(out, "local=/{domain}/");
    }
    if let Some(size) = config.cache_size {
        let _ = writeln!(out, "cache-size={size}");
    }

    let mut hosts = Vec::with_capacity(config.hosts.len());
    for host in &config.hosts {
        validate::hostname(&host.name).map_err(dns_invalid)?;
        let ip = validate::ip(&host.ip).map_err(dns_invalid)?;
        hosts.push(format!("address=/{}/{ip}", host.name.to_ascii_lowercase()));
    }
    hosts.sort();
    hosts.dedup();
    for line in hosts {
        let _ = writeln!(out, "{line}");
    }
    Ok(out)
}

/// Normalise a MAC to lowercase colon form.
fn mac(value: &str) -> Result<String, FirmwareError> {
    let octets: Vec<&str> = value.split([':', '-']).collect();
    let ok = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
    if ok {
        Ok(octets.join(":").to_ascii_lowercase())
    } else {
        Err(dhcp_invalid(format!("invalid MAC '{value}'")))
    }
}

/// `infinite`, or digits with an optional `s`/`m`/`h`/`d` suffix.
fn lease_time(value: &str) -> Result<(), FirmwareError> {
    if value == "infinite" {
        return Ok(());
    }
    let digits = value.trim_end_matches(['s', 'm', 'h', 'd']);
    let suffix_len = value.len() - digits.len();
    if !digits.is_empty() && suffix_len <= 1 && digits.chars().all(|c| c.is_ascii_digit()) {
        Ok(())
    } else {
        Err(dhcp_invalid(format!("invalid lease_time '{value}'")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dhcp(value: serde_json::Value) -> DhcpConfig {
        serde_json::from_value(value).unwrap()
    }

    fn dns(value: serde_json::Value) -> DnsConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn dhcp_renders_range_and_sorted_leases() {
        let text = render_dhcp(&dhcp(json!({
            "interface": "br-lan",
            "range_start": "192.168.1.100",
            "range_end": "192.168.1.200",
            "gateway": "192.168.1.1",
            "static_leases": [
                {"mac": "BB:BB:BB:BB:BB:BB", "ip": "192.168.1.20", "hostname": "nas"},
                {"mac": "aa-aa-aa-aa-aa-aa", "ip": "192.168.1.10"}
            ]
        })))
        .unwrap();

        assert!(text.contains("dhcp-range=br-lan,192.168.1.100,192.168.1.200,12h\n"));
        assert!(text.contains("dhcp-option=br-lan,option:router,192.168.1.1\n"));
        let first = text.find("aa:aa:aa:aa:aa:aa").unwrap();
        let second = text.find("bb:bb:bb:bb:bb:bb,192.168.1.20,nas").unwrap();
        assert!(first < second);
    }

    #[test]
    fn dhcp_rejects_bad_input() {
        let bad = [
            json!({"interface": "lan", "range_start": "10.0.0.9", "range_end": "10.0.0.1"}),
            json!({"interface": "lan", "range_start": "10.0.0.1", "range_end": "10.0.0.9", "lease_time": "12hh"}),
            json!({"interface": "lan\nport=0", "range_start": "10.0.0.1", "range_end": "10.0.0.9"}),
            json!({"interface": "lan", "range_start": "10.0.0.1", "range_end": "10.0.0.9",
                   "static_leases": [{"mac": "zz:00:00:00:00:00", "ip": "10.0.0.5"}]}),
            json!({"interface": "lan", "range_start": "10.0.0.1", "range_end": "10.0.0.9",
                   "static_leases": [{"mac": "00:00:00:00:00:01", "ip": "10.0.0.5"},
                                     {"mac": "00-00-00-00-00-01", "ip": "10.0.0.6"}]}),
        ];
        for value in bad {
            assert!(render_dhcp(&dhcp(value)).is_err());
        }
    }

    #[test]
    fn dns_renders_upstreams_and_hosts() {
        let text = render_dns(&dns(json!({
            "upstream": ["1.1.1.1", "2606:4700:4700::1111"],
            "hosts": [{"name": "Router.lan", "ip": "192.168.1.1"}, {"name": "nas.lan", "ip": "192.168.1.20"}],
            "cache_size": 500
        })))
        .unwrap();
        assert!(text.contains("no-resolv\nserver=1.1.1.1\nserver=2606:4700:4700::1111\n"));
        assert!(text.contains("address=/nas.lan/192.168.1.20\naddress=/router.lan/192.168.1.1\n"));
        assert!(text.contains("cache-size=500\n"));
    }

    #[test]
    fn dns_without_upstreams_keeps_system_resolvers() {
        let text = render_dns(&dns(json!({}))).unwrap();
        assert!(!text.contains("no-resolv"));
    }

    #[test]
    fn dns_rejects_bad_hostname() {
        let err = render_dns(&dns(json!({"hosts": [{"name": "bad/name", "ip": "10.0.0.1"}]}))).unwrap_err();
        assert!(matches!(err, FirmwareError::InvalidConfig { .. }));
    }
}
