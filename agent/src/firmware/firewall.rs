//! Packet filter: one nftables table owned by the agent.
//!
//! The rendered file deletes and recreates `inet fleet` in a single
//! transaction, so loading it twice leaves exactly one copy of every rule.

use std::fmt::Write as _;
use std::net::IpAddr;
use std::path::Path;

use serde::Deserialize;

use super::{FirmwareError, Section, validate};

const TABLE: &str = "fleet";

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub(super) enum Policy {
    Accept,
    #[default]
    Drop,
}

impl Policy {
    fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Drop => "drop",
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub(super) enum Chain {
    Input,
    Forward,
    Output,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub(super) enum Protocol {
    #[default]
    Any,
    Tcp,
    Udp,
    Icmp,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub(super) enum Action {
    Accept,
    Drop,
    Reject,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct Rule {
    pub chain: Chain,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub port_end: Option<u16>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub iif: Option<String>,
    pub action: Action,
    #[serde(default)]
    pub comment: Option<String>,
}

/// DNAT from a port on an inbound interface to a LAN host.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct PortForward {
    pub iif: String,
    pub protocol: Protocol,
    pub port: u16,
    pub to_addr: String,
    #[serde(default)]
    pub to_port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct FirewallConfig {
    #[serde(default)]
    pub input_policy: Policy,
    #[serde(default)]
    pub forward_policy: Policy,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub masquerade: Vec<String>,
    #[serde(default)]
    pub port_forwards: Vec<PortForward>,
}

fn invalid(reason: impl Into<String>) -> FirmwareError {
    FirmwareError::invalid(Section::Firewall, reason)
}

pub(super) fn reload_command(path: &Path) -> Vec<String> {
    vec!["nft".to_string(), "-f".to_string(), path.display().to_string()]
}

/// Render the full ruleset file.
pub(super) fn render(config: &FirewallConfig) -> Result<String, FirmwareError> {
    let mut input = Vec::new();
    let mut forward = Vec::new();
    let mut output = Vec::new();
    for rule in &config.rules {
        let line = render_rule(rule)?;
        match rule.chain {
            Chain::Input => input.push(line),
            Chain::Forward => forward.push(line),
            Chain::Output => output.push(line),
        }
    }

    let mut prerouting = Vec::new();
    for fwd in &config.port_forwards {
        prerouting.push(render_forward(fwd)?);
    }

    let mut postrouting = Vec::new();
    for iface in &config.masquerade {
        validate::ifname(iface).map_err(invalid)?;
        postrouting.push(format!("oifname \"{iface}\" masquerade"));
    }

    let mut out = String::new();
    out.push_str("# Managed by fleet-agent. Local edits are overwritten.\n");
    let _ = writeln!(out, "table inet {TABLE}");
    let _ = writeln!(out, "delete table inet {TABLE}");
    let _ = writeln!(out, "table inet {TABLE} {{");

    let stateful = [
        "ct state established,related accept".to_string(),
        "ct state invalid drop".to_string(),
    ];
    let mut input_lines = stateful.to_vec();
    input_lines.push("iif \"lo\" accept".to_string());
    input_lines.extend(input);
    chain(&mut out, "input", "filter hook input priority filter", Some(config.input_policy), &input_lines);

    let mut forward_lines = stateful.to_vec();
    // Port-forwarded traffic must pass the forward chain too.
    if !config.port_forwards.is_empty() {
        forward_lines.push("ct status dnat accept".to_string());
    }
    forward_lines.extend(forward);
    chain(&mut out, "forward", "filter hook forward priority filter", Some(config.forward_policy), &forward_lines);

    chain(&mut out, "output", "filter hook output priority filter", Some(Policy::Accept), &output);

    if !prerouting.is_empty() {
        chain(&mut out, "prerouting", "nat hook prerouting priority dstnat", None, &prerouting);
    }
    if !postrouting.is_empty() {
        chain(&mut out, "postrouting", "nat hook postrouting priority srcnat", None, &postrouting);
    }
    out.push_str("}\n");
    Ok(out)
}

fn chain(out: &mut String, name: &str, hook: &str, policy: Option<Policy>, lines: &[String]) {
    let _ = writeln!(out, "\tchain {name} {{");
    match policy {
        Some(policy) => {
            let _ = writeln!(out, "\t\ttype {hook}; policy {};", policy.as_str());
        }
        None => {
            let _ = writeln!(out, "\t\ttype {hook};");
        }
    }
    for line in lines {
        let _ = writeln!(out, "\t\t{line}");
    }
    out.push_str("\t}\n");
}

fn render_rule(rule: &Rule) -> Result<String, FirmwareError> {
    let mut parts = Vec::new();

    if let Some(iif) = &rule.iif {
        validate::ifname(iif).map_err(invalid)?;
        parts.push(format!("iifname \"{iif}\""));
    }
    if let Some(source) = &rule.source {
        let family = family(validate::cidr(source).map_err(invalid)?);
        parts.push(format!("{family} saddr {source}"));
    }
    if let Some(destination) = &rule.destination {
        let family = family(validate::cidr(destination).map_err(invalid)?);
        parts.push(format!("{family} daddr {destination}"));
    }
    parts.extend(match_protocol(rule.protocol, rule.port, rule.port_end)?);

    parts.push(
        match rule.action {
            Action::Accept => "accept",
            Action::Drop => "drop",
            Action::Reject => "reject",
        }
        .to_string(),
    );

    if let Some(comment) = &rule.comment {
        if comment.len() > 128 || comment.contains(['"', '\n', '\r', '\\']) {
            return Err(invalid(format!("invalid comment '{comment}'")));
        }
        parts.push(format!("comment \"{comment}\""));
    }
    Ok(parts.join(" "))
}

fn render_forward(fwd: &PortForward) -> Result<String, FirmwareError> {
    validate::ifname(&fwd.iif).map_err(invalid)?;
    let to = validate::ip(&fwd.to_addr).map_err(invalid)?;
    let IpAddr::V4(to) = to else {
        return Err(invalid("port forwards support IPv4 targets only"));
    };
    if fwd.port == 0 || fwd.to_port == Some(0) {
        return Err(invalid("port 0 is not forwardable"));
    }
    let proto = match fwd.protocol {
        Protocol::Tcp => "tcp",
        Protocol::Udp => "udp",
        Protocol::Any | Protocol::Icmp => {
            return Err(invalid("port forwards need protocol tcp or udp"));
        }
    };
    let to_port = fwd.to_port.unwrap_or(fwd.port);
    Ok(format!(
        "iifname \"{}\" {proto} dport {} dnat ip to {to}:{to_port}",
        fwd.iif, fwd.port
    ))
}

fn match_protocol(
    protocol: Protocol,
    port: Option<u16>,
    port_end: Option<u16>,
) -> Result<Vec<String>, FirmwareError> {
    let ports = match (port, port_end) {
        (None, None) => None,
        (Some(0), _) => return Err(invalid("port 0 is not matchable")),
        (Some(p), None) => Some(p.to_string()),
        (Some(p), Some(end)) if end > p => Some(format!("{p}-{end}")),
        (Some(p), Some(end)) if end == p => Some(p.to_string()),
        (Some(_), Some(_)) => return Err(invalid("port_end must not be below port")),
        (None, Some(_)) => return Err(invalid("port_end requires port")),
    };

    let parts = match (protocol, ports) {
        (Protocol::Any, None) => Vec::new(),
        (Protocol::Icmp, None) => vec!["meta l4proto { icmp, ipv6-icmp }".to_string()],
        (Protocol::Tcp, None) => vec!["meta l4proto tcp".to_string()],
        (Protocol::Udp, None) => vec!["meta l4proto udp".to_string()],
        (Protocol::Tcp, Some(ports)) => vec![format!("tcp dport {ports}")],
        (Protocol::Udp, Some(ports)) => vec![format!("udp dport {ports}")],
        (Protocol::Any | Protocol::Icmp, Some(_)) => {
            return Err(invalid("ports require protocol tcp or udp"));
        }
    };
    Ok(parts)
}

fn family(addr: IpAddr) -> &'static str {
    if addr.is_ipv4() { "ip" } else { "ip6" }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: serde_json::Value) -> FirewallConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn renders_rules_into_their_chains() {
        let text = render(&config(json!({
            "rules": [
                {"chain": "input", "protocol": "tcp", "port": 22, "source": "10.0.0.0/8", "action": "accept", "comment": "ssh"},
                {"chain": "forward", "iif": "lan", "action": "accept"}
            ],
            "masquerade": ["wan"]
        })))
        .unwrap();

        assert!(text.starts_with("# Managed by fleet-agent"));
        assert!(text.contains("delete table inet fleet\n"));
        assert!(text.contains("ip saddr 10.0.0.0/8 tcp dport 22 accept comment \"ssh\""));
        assert!(text.contains("iifname \"lan\" accept"));
        assert!(text.contains("oifname \"wan\" masquerade"));
        assert!(text.contains("type filter hook input priority filter; policy drop;"));
    }

    #[test]
    fn rendering_is_deterministic() {
        let value = json!({"rules": [{"chain": "input", "protocol": "udp", "port": 53, "port_end": 54, "action": "accept"}]});
        assert_eq!(render(&config(value.clone())).unwrap(), render(&config(value)).unwrap());
    }

    #[test]
    fn ipv6_source_uses_ip6_family() {
        let text = render(&config(json!({
            "rules": [{"chain": "input", "source": "fd00::/8", "action": "drop"}]
        })))
        .unwrap();
        assert!(text.contains("ip6 saddr fd00::/8 drop"));
    }

    #[test]
    fn port_forward_renders_dnat_and_forward_accept() {
        let text = render(&config(json!({
            "port_forwards": [{"iif": "wan", "protocol": "tcp", "port": 8080, "to_addr": "192.168.1.10", "to_port": 80}]
        })))
        .unwrap();
        assert!(text.contains("iifname \"wan\" tcp dport 8080 dnat ip to 192.168.1.10:80"));
        assert!(text.contains("ct status dnat accept"));
    }

    #[test]
    fn rejects_injection_and_bad_values() {
        let bad = [
            json!({"rules": [{"chain": "input", "iif": "lan\" accept", "action": "accept"}]}),
            json!({"rules": [{"chain": "input", "source": "10.0.0.0/33", "action": "accept"}]}),
            json!({"rules": [{"chain": "input", "port": 22, "action": "accept"}]}),
            json!({"rules": [{"chain": "input", "protocol": "tcp", "port": 22, "port_end": 10, "action": "accept"}]}),
            json!({"rules": [{"chain": "input", "action": "accept", "comment": "x\"; flush ruleset"}]}),
        ];
        for value in bad {
            let err = render(&config(value)).unwrap_err();
            assert!(matches!(err, FirmwareError::InvalidConfig { .. }), "{err}");
        }
    }

    #[test]
    fn unknown_fields_fail_to_parse() {
        let parsed: Result<FirewallConfig, _> =
            serde_json::from_value(json!({"rules": [], "flush": true}));
        assert!(parsed.is_err());
    }
}
