//! AMQP routing-key derivation for outbound notifications.
//!
//! Tool-related traffic is published with a routing key derived from the
//! method (or tool) name, so consumers can bind to just the discovery
//! domain they care about.

/// Network verbs that route to `discovery.network` without a prefix.
const NETWORK_VERBS: &[&str] = &[
    "ping",
    "traceroute",
    "wget",
    "nslookup",
    "netstat",
    "telnet",
    "route",
    "ifconfig",
    "arp",
    "whois",
];

/// Derive the routing key for a method or tool name.
#[must_use]
pub fn routing_key_for(method: &str) -> &'static str {
    if method.starts_with("nmap_") {
        "discovery.nmap"
    } else if method.starts_with("snmp_") {
        "discovery.snmp"
    } else if method.starts_with("proxmox_") {
        "discovery.proxmox"
    } else if method.starts_with("zabbix_") {
        "discovery.zabbix"
    } else if NETWORK_VERBS.contains(&method) {
        "discovery.network"
    } else if method.starts_with("memory_") || method.starts_with("cmdb_") {
        "discovery.memory"
    } else if method.starts_with("credentials_") || method.starts_with("creds_") {
        "discovery.credentials"
    } else {
        "discovery.general"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_map_to_their_domains() {
        assert_eq!(routing_key_for("nmap_tcp_scan"), "discovery.nmap");
        assert_eq!(routing_key_for("snmp_walk"), "discovery.snmp");
        assert_eq!(routing_key_for("proxmox_list_vms"), "discovery.proxmox");
        assert_eq!(routing_key_for("zabbix_get_hosts"), "discovery.zabbix");
        assert_eq!(routing_key_for("memory_merge"), "discovery.memory");
        assert_eq!(routing_key_for("cmdb_query"), "discovery.memory");
        assert_eq!(routing_key_for("credentials_add"), "discovery.credentials");
    }

    #[test]
    fn network_verbs_are_an_exact_list() {
        assert_eq!(routing_key_for("ping"), "discovery.network");
        assert_eq!(routing_key_for("traceroute"), "discovery.network");
        // Prefix alone is not enough for the verb list.
        assert_eq!(routing_key_for("ping_sweep"), "discovery.general");
    }

    #[test]
    fn everything_else_is_general() {
        assert_eq!(routing_key_for("tools/list"), "discovery.general");
        assert_eq!(routing_key_for("initialize"), "discovery.general");
        assert_eq!(routing_key_for("plugin_list"), "discovery.general");
    }
}
