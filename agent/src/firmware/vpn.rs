//! WireGuard tunnels: the interface is created if missing, loaded with
//! `wg setconf`, addressed and brought up.

use std::fmt::Write as _;
use std::path::Path;

use serde::Deserialize;

use super::{FirmwareError, ReloadStep, Section, validate};

#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct VpnConfig {
    pub interface: String,
    pub private_key: String,
    /// Tunnel addresses in CIDR form, assigned with `ip`.
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub listen_port: Option<u16>,
    #[serde(default)]
    pub peers: Vec<Peer>,
}

impl std::fmt::Debug for VpnConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VpnConfig")
            .field("interface", &self.interface)
            .field("private_key", &"<redacted>")
            .field("addresses", &self.addresses)
            .field("listen_port", &self.listen_port)
            .field("peers", &self.peers.len())
            .finish()
    }
}

#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct Peer {
    pub public_key: String,
    #[serde(default)]
    pub preshared_key: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<String>,
    #[serde(default)]
    pub persistent_keepalive: Option<u16>,
}

fn invalid(reason: impl Into<String>) -> FirmwareError {
    FirmwareError::invalid(Section::Vpn, reason)
}

fn argv(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| (*w).to_string()).collect()
}

/// Commands that make `interface` exist, carry `path`'s config and be up.
pub(super) fn bring_up(config: &VpnConfig, path: &Path) -> Vec<ReloadStep> {
    let iface = config.interface.as_str();
    let mut steps = vec![
        ReloadStep::unless(
            argv(&["ip", "link", "add", "dev", iface, "type", "wireguard"]),
            argv(&["ip", "link", "show", "dev", iface]),
        ),
        argv(&["wg", "setconf", iface, path.display().to_string().as_str()]).into(),
    ];
    if !config.addresses.is_empty() {
        steps.push(argv(&["ip", "address", "flush", "dev", iface]).into());
        for address in &config.addresses {
            steps.push(argv(&["ip", "address", "add", address.as_str(), "dev", iface]).into());
        }
    }
    steps.push(argv(&["ip", "link", "set", "up", "dev", iface]).into());
    steps
}

pub(super) fn render(config: &VpnConfig) -> Result<String, FirmwareError> {
    validate::ifname(&config.interface).map_err(invalid)?;
    key("private_key", &config.private_key)?;

    let mut out = String::from("# Managed by fleet-agent. Local edits are overwritten.\n");
    // wg ignores comments; the line makes an address change rewrite the file.
    for address in &config.addresses {
        if !address.contains('/') {
            return Err(invalid(format!("address '{address}' needs a prefix length")));
        }
        validate::cidr(address).map_err(invalid)?;
        let _ = writeln!(out, "# Address = {address}");
    }
    out.push_str("[Interface]\n");
    let _ = writeln!(out, "PrivateKey = {}", config.private_key);
    if let Some(port) = config.listen_port {
        let _ = writeln!(out, "ListenPort = {port}");
    }

    let mut peers: Vec<&Peer> = config.peers.iter().collect();
    peers.sort_by(|a, b| a.public_key.cmp(&b.public_key));
    if peers.windows(2).any(|w| w[0].public_key == w[1].public_key) {
        return Err(invalid("duplicate peer public_key"));
    }

    for peer in peers {
        key("public_key", &peer.public_key)?;
        out.push_str("\n[Peer]\n");
        let _ = writeln!(out, "PublicKey = {}", peer.public_key);
        if let Some(psk) = &peer.preshared_key {
            key("preshared_key", psk)?;
            let _ = writeln!(out, "PresharedKey = {psk}");
        }
        if let Some(endpoint) = &peer.endpoint {
            self::endpoint(endpoint)?;
            let _ = writeln!(out, "Endpoint = {endpoint}");
        }
        if peer.allowed_ips.is_empty() {
            return Err(invalid("peer needs at least one allowed_ips entry"));
        }
        for cidr in &peer.allowed_ips {
            validate::cidr(cidr).map_err(invalid)?;
        }
        let _ = writeln!(out, "AllowedIPs = {}", peer.allowed_ips.join(", "));
        if let Some(keepalive) = peer.persistent_keepalive {
            let _ = writeln!(out, "PersistentKeepalive = {keepalive}");
        }
    }
    Ok(out)
}

/// A WireGuard key: base64 of exactly 32 bytes.
fn key(field: &str, value: &str) -> Result<(), FirmwareError> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    // The 43rd character only carries 4 data bits.
    const LAST: &[u8] = b"AEIMQUYcgkosw048";

    let bytes = value.as_bytes();
    let ok = bytes.len() == 44
        && bytes[43] == b'='
        && bytes[..42].iter().all(|b| ALPHABET.contains(b))
        && LAST.contains(&bytes[42]);
    if ok {
        Ok(())
    } else {
        Err(invalid(format!("{field} is not a WireGuard key")))
    }
}

/// `host:port` or `[v6]:port`.
fn endpoint(value: &str) -> Result<(), FirmwareError> {
    let bad = || invalid(format!("invalid endpoint '{value}'"));
    let (host, port) = value.rsplit_once(':').ok_or_else(bad)?;
    match port.parse::<u16>() {
        Ok(p) if p > 0 => {}
        _ => return Err(bad()),
    }
    if let Some(v6) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        v6.parse::<std::net::Ipv6Addr>().map_err(|_| bad())?;
        return Ok(());
    }
    if host.parse::<std::net::Ipv4Addr>().is_ok() || validate::hostname(host).is_ok() {
        Ok(())
    } else {
        Err(bad())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    const PRIVATE: &str = "yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=";
    const PUBLIC_A: &str = "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=";
    const PUBLIC_B: &str = "HIgo9xNzJMWLKASShiTqIybxZ0U3wGLiUeJ1PKf8ykw=";

    fn config(value: serde_json::Value) -> VpnConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn renders_sorted_peers() {
        let text = render(&config(json!({
            "interface": "wg0",
            "private_key": PRIVATE,
            "listen_port": 51820,
            "peers": [
                {"public_key": PUBLIC_A, "endpoint": "vpn.example.com:51820", "allowed_ips": ["0.0.0.0/0", "::/0"], "persistent_keepalive": 25},
                {"public_key": PUBLIC_B, "allowed_ips": ["10.8.0.2/32"]}
            ]
        })))
        .unwrap();

        assert!(text.contains(&format!("[Interface]\nPrivateKey = {PRIVATE}\nListenPort = 51820\n")));
        let a = text.find(PUBLIC_A).unwrap();
        let b = text.find(PUBLIC_B).unwrap();
        assert!(b < a, "peers are ordered by public key");
        assert!(text.contains("AllowedIPs = 0.0.0.0/0, ::/0\n"));
        assert!(text.contains("Endpoint = vpn.example.com:51820\n"));
    }

    #[test]
    fn rejects_malformed_keys() {
        for bad in ["short", "yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmZ=", "yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk"] {
            let err = render(&config(json!({"interface": "wg0", "private_key": bad}))).unwrap_err();
            assert!(matches!(err, FirmwareError::InvalidConfig { .. }));
        }
    }

    #[test]
    fn rejects_bad_endpoint_and_missing_allowed_ips() {
        let bad_endpoint = json!({"interface": "wg0", "private_key": PRIVATE,
            "peers": [{"public_key": PUBLIC_A, "endpoint": "host:0", "allowed_ips": ["10.0.0.0/8"]}]});
        assert!(render(&config(bad_endpoint)).is_err());

        let no_ips = json!({"interface": "wg0", "private_key": PRIVATE,
            "peers": [{"public_key": PUBLIC_A, "allowed_ips": []}]});
        assert!(render(&config(no_ips)).is_err());
    }

    #[test]
    fn ipv6_endpoint_is_accepted() {
        assert!(endpoint("[2001:db8::1]:51820").is_ok());
        assert!(endpoint("2001:db8::1:51820").is_err());
    }

    #[test]
    fn addresses_need_a_prefix_and_land_in_the_file() {
        let text = render(&config(json!({
            "interface": "wg0", "private_key": PRIVATE, "addresses": ["10.8.0.1/24", "fd00::1/64"]
        })))
        .unwrap();
        assert!(text.contains("# Address = 10.8.0.1/24\n# Address = fd00::1/64\n[Interface]\n"));

        let bare = json!({"interface": "wg0", "private_key": PRIVATE, "addresses": ["10.8.0.1"]});
        assert!(render(&config(bare)).is_err());
    }

    #[test]
    fn debug_redacts_private_key() {
        let cfg = config(json!({"interface": "wg0", "private_key": PRIVATE}));
        assert!(!format!("{cfg:?}").contains(PRIVATE));
    }
}
