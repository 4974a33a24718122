//! WiFi radios and access points, rendered as a UCI `wireless` file.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use serde::Deserialize;

use super::{FirmwareError, Section, validate};

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub(super) enum Band {
    #[serde(rename = "2g")]
    TwoGhz,
    #[serde(rename = "5g")]
    FiveGhz,
    #[serde(rename = "6g")]
    SixGhz,
}

impl Band {
    fn as_str(self) -> &'static str {
        match self {
            Self::TwoGhz => "2g",
            Self::FiveGhz => "5g",
            Self::SixGhz => "6g",
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub(super) enum Encryption {
    None,
    Psk2,
    PskMixed,
    #[default]
    Sae,
    SaeMixed,
}

impl Encryption {
    fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Psk2 => "psk2",
            Self::PskMixed => "psk-mixed",
            Self::Sae => "sae",
            Self::SaeMixed => "sae-mixed",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct Radio {
    pub name: String,
    pub band: Band,
    #[serde(default)]
    pub channel: Option<u16>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct AccessPoint {
    pub radio: String,
    pub ssid: String,
    #[serde(default)]
    pub encryption: Encryption,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub disabled: bool,
}

impl std::fmt::Debug for AccessPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessPoint")
            .field("radio", &self.radio)
            .field("ssid", &self.ssid)
            .field("encryption", &self.encryption)
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}

fn default_network() -> String {
    "lan".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct WifiConfig {
    pub radios: Vec<Radio>,
    #[serde(default)]
    pub access_points: Vec<AccessPoint>,
}

pub(super) fn reload_command() -> Vec<String> {
    vec!["wifi".to_string(), "reload".to_string()]
}

fn invalid(reason: impl Into<String>) -> FirmwareError {
    FirmwareError::invalid(Section::Wifi, reason)
}

/// A UCI option value: single-quoted, so quotes and line breaks are refused.
fn uci_value(field: &str, value: &str) -> Result<(), FirmwareError> {
    if value.contains('\'') || value.chars().any(char::is_control) {
        return Err(invalid(format!("{field} contains a quote or control character")));
    }
    Ok(())
}

pub(super) fn render(config: &WifiConfig) -> Result<String, FirmwareError> {
    let mut out = String::from("# Managed by fleet-agent. Local edits are overwritten.\n");
    let mut names = BTreeSet::new();

    for radio in &config.radios {
        validate::ifname(&radio.name).map_err(invalid)?;
        if !names.insert(radio.name.as_str()) {
            return Err(invalid(format!("duplicate radio '{}'", radio.name)));
        }
        let _ = write!(out, "\nconfig wifi-device '{}'\n", radio.name);
        out.push_str("\toption type 'mac80211'\n");
        let _ = writeln!(out, "\toption band '{}'", radio.band.as_str());
        match radio.channel {
            None => out.push_str("\toption channel 'auto'\n"),
            Some(ch) if (1..=233).contains(&ch) => {
                let _ = writeln!(out, "\toption channel '{ch}'");
            }
            Some(ch) => return Err(invalid(format!("invalid channel {ch}"))),
        }
        if let Some(country) = &radio.country {
            if country.len() != 2 || !country.chars().all(|c| c.is_ascii_uppercase()) {
                return Err(invalid(format!("invalid country code '{country}'")));
            }
            let _ = writeln!(out, "\toption country '{country}'");
        }
        let _ = writeln!(out, "\toption disabled '{}'", u8::from(radio.disabled));
    }

    // Section names are positional per radio so the file is stable across
    // pushes with the same access point order.
    let mut per_radio: std::collections::BTreeMap<&str, usize> = std::collections::BTreeMap::new();
    for ap in &config.access_points {
        if !names.contains(ap.radio.as_str()) {
            return Err(invalid(format!("access point references unknown radio '{}'", ap.radio)));
        }
        if ap.ssid.is_empty() || ap.ssid.len() > 32 {
            return Err(invalid("ssid must be 1-32 bytes"));
        }
        uci_value("ssid", &ap.ssid)?;
        validate::ifname(&ap.network).map_err(invalid)?;

        let index = per_radio.entry(ap.radio.as_str()).or_insert(0);
        let section = format!("fleet_{}_{}", ap.radio.replace(['-', '.'], "_"), index);
        *index += 1;

        let _ = write!(out, "\nconfig wifi-iface '{section}'\n");
        let _ = writeln!(out, "\toption device '{}'", ap.radio);
        out.push_str("\toption mode 'ap'\n");
        let _ = writeln!(out, "\toption network '{}'", ap.network);
        let _ = writeln!(out, "\toption ssid '{}'", ap.ssid);
        let _ = writeln!(out, "\toption encryption '{}'", ap.encryption.as_str());
        match (ap.encryption, &ap.key) {
            (Encryption::None, None) => {}
            (Encryption::None, Some(_)) => {
                return Err(invalid("key given for an open network"));
            }
            (_, None) => return Err(invalid(format!("ssid '{}' needs a key", ap.ssid))),
            (_, Some(key)) => {
                if !(8..=63).contains(&key.len()) {
                    return Err(invalid("key must be 8-63 characters"));
                }
                uci_value("key", key)?;
                let _ = writeln!(out, "\toption key '{key}'");
            }
        }
        let _ = writeln!(out, "\toption hidden '{}'", u8::from(ap.hidden));
        let _ = writeln!(out, "\toption disabled '{}'", u8::from(ap.disabled));
    }
    Ok(out)
}
