//! Pure parsers for the textual IP discovery sources.

use serde::Deserialize;

/// MAC/IP pair extracted from any lease-like source.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseEntry {
    pub mac: String,
    pub ip: String,
}

/// One row of `virsh domifaddr` output.
#[derive(Debug, Clone, PartialEq)]
pub struct DomifaddrEntry {
    pub interface: String,
    pub mac: String,
    pub ip: String,
}

/// Filters loopback, link-local and unspecified addresses.
pub fn is_routable_ipv4(ip: &str) -> bool {
    if ip.contains(':') {
        return false;
    }
    !(ip.starts_with("127.") || ip.starts_with("169.254.") || ip.starts_with("0."))
}

/// Parses `virsh domifaddr <domain>` output:
///
/// ```text
///  Name       MAC address          Protocol     Address
/// -------------------------------------------------------------------
///  vnet0      52:54:00:2b:26:06    ipv4         192.168.122.63/24
/// ```
pub fn parse_domifaddr(output: &str) -> Vec<DomifaddrEntry> {
    let mut entries = Vec::new();
    for line in output.lines().skip(2) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 4 || !parts[2].eq_ignore_ascii_case("ipv4") {
            continue;
        }
        let ip = parts[3].split('/').next().unwrap_or_default();
        if is_routable_ipv4(ip) {
            entries.push(DomifaddrEntry {
                interface: parts[0].to_string(),
                mac: parts[1].to_lowercase(),
                ip: ip.to_string(),
            });
        }
    }
    entries
}

/// Parses `arp -a` output:
///
/// ```text
/// ? (192.168.122.63) at 52:54:00:2b:26:06 [ether] on virbr0
/// ```
pub fn parse_arp_output(output: &str) -> Vec<LeaseEntry> {
    let regex = regex::Regex::new(
        r"\(((?:\d{1,3}\.){3}\d{1,3})\)\s+at\s+([0-9a-fA-F:]{17})",
    )
    .expect("arp regex should be valid");
    regex
        .captures_iter(output)
        .filter(|captures| is_routable_ipv4(&captures[1]))
        .map(|captures| LeaseEntry {
            mac: captures[2].to_lowercase(),
            ip: captures[1].to_string(),
        })
        .collect()
}

#[derive(Deserialize)]
struct DnsmasqStatusEntry {
    #[serde(rename = "ip-address")]
    ip_address: String,
    #[serde(rename = "mac-address")]
    mac_address: String,
}

/// Parses libvirt's dnsmasq status files
/// (`/var/lib/libvirt/dnsmasq/<bridge>.status`), which hold a JSON array of
/// current leases.
pub fn parse_dnsmasq_status(content: &str) -> Vec<LeaseEntry> {
    let entries: Vec<DnsmasqStatusEntry> = serde_json::from_str(content).unwrap_or_default();
    entries
        .into_iter()
        .filter(|entry| is_routable_ipv4(&entry.ip_address))
        .map(|entry| LeaseEntry {
            mac: entry.mac_address.to_lowercase(),
            ip: entry.ip_address,
        })
        .collect()
}

/// Parses classic dnsmasq lease files: one lease per line,
/// `<expiry> <mac> <ip> <hostname> <client-id>`.
pub fn parse_dnsmasq_leases(content: &str) -> Vec<LeaseEntry> {
    let mut entries = Vec::new();
    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            continue;
        }
        let (mac, ip) = (parts[1], parts[2]);
        if mac.len() == 17 && mac.contains(':') && is_routable_ipv4(ip) {
            entries.push(LeaseEntry {
                mac: mac.to_lowercase(),
                ip: ip.to_string(),
            });
        }
    }
    entries
}

////////////////////////////////////////////////////////////////////////////////////
// TESTS
////////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("192.168.122.63", true)]
    #[case("10.0.0.1", true)]
    #[case("127.0.0.1", false)]
    #[case("169.254.1.1", false)]
    #[case("0.0.0.0", false)]
    #[case("fe80::1", false)]
    fn test_routable_filter(#[case] ip: &str, #[case] expected: bool) {
        assert_eq!(is_routable_ipv4(ip), expected);
    }

    #[test]
    fn test_parse_domifaddr_table() {
        let output = "\
 Name       MAC address          Protocol     Address
-------------------------------------------------------------------
 vnet0      52:54:00:2B:26:06    ipv4         192.168.122.63/24
 vnet1      52:54:00:11:22:33    ipv6         fe80::5054:ff:fe11:2233/64
";
        let entries = parse_domifaddr(output);
        assert_eq!(
            entries,
            vec![DomifaddrEntry {
                interface: "vnet0".to_string(),
                mac: "52:54:00:2b:26:06".to_string(),
                ip: "192.168.122.63".to_string(),
            }]
        );
    }

    #[test]
    fn test_parse_domifaddr_empty_table() {
        let output = "\
 Name       MAC address          Protocol     Address
-------------------------------------------------------------------
";
        assert!(parse_domifaddr(output).is_empty());
    }

    #[test]
    fn test_parse_arp_table() {
        let output = "\
? (192.168.122.63) at 52:54:00:2b:26:06 [ether] on virbr0
gateway (192.168.1.1) at aa:bb:cc:dd:ee:ff [ether] on eno1
? (192.168.122.1) at <incomplete> on virbr0
";
        let entries = parse_arp_output(output);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].mac, "52:54:00:2b:26:06");
        assert_eq!(entries[0].ip, "192.168.122.63");
    }

    #[test]
    fn test_parse_dnsmasq_status_json() {
        let content = r#"[
            {"ip-address": "192.168.122.63", "mac-address": "52:54:00:2B:26:06", "hostname": "desktop", "expiry-time": 1700000000},
            {"ip-address": "192.168.122.64", "mac-address": "52:54:00:aa:bb:cc", "hostname": "web", "expiry-time": 1700000000}
        ]"#;
        let entries = parse_dnsmasq_status(content);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].mac, "52:54:00:2b:26:06");
    }

    #[test]
    fn test_parse_dnsmasq_status_garbage_is_empty() {
        assert!(parse_dnsmasq_status("not json").is_empty());
    }

    #[test]
    fn test_parse_dnsmasq_lease_lines() {
        let content = "\
1700000000 52:54:00:2b:26:06 192.168.122.63 desktop 01:52:54:00:2b:26:06
garbage line
1700000001 52:54:00:aa:bb:cc 192.168.122.64 * *
";
        let entries = parse_dnsmasq_leases(content);
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0],
            LeaseEntry {
                mac: "52:54:00:2b:26:06".to_string(),
                ip: "192.168.122.63".to_string(),
            }
        );
    }
}
