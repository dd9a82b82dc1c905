#[cfg(test)]
mod scenario_tests {
    use crate::core::data::NetworkData;
    use crate::core::firewall::NetfilterTable;
    use crate::core::graph::NetworkGraph;
    use crate::core::network::Network;
    use crate::core::profiles::ProfileRegistry;
    use crate::core::resolver::FirewallResolver;
    use crate::core::script::Action;
    use crate::core::test_helpers::office_data;

    fn chain_rules(network: &Network, chain: &str) -> Vec<String> {
        network
            .firewall("gw")
            .unwrap()
            .firewall()
            .chain(NetfilterTable::Filter, chain)
            .unwrap()
            .evaluation_order()
            .map(|r| r.rule.clone())
            .collect()
    }

    #[test]
    fn test_web1_listen_and_egress() {
        let json = r#"{
            "label": "lab",
            "machines": {
                "gw": {
                    "types": ["router"],
                    "network_interfaces": {
                        "wan": [{"iface": "wan0"}],
                        "lan": [{"iface": "lan0", "address": "10.0.0.1", "netmask": "255.255.255.0"}]
                    }
                },
                "web1": {
                    "types": ["server"],
                    "network_interfaces": {"lan": [{"iface": "eth0", "address": "10.0.1.2"}]},
                    "firewall": {"listen": {"tcp": [443]}, "allow_egress_to": ["api.example.com"]}
                }
            }
        }"#;
        let data: NetworkData = serde_json::from_str(json).unwrap();
        let graph = NetworkGraph::from_data(&data).unwrap().freeze().unwrap();
        let resolved = FirewallResolver::new(&graph, "gw").unwrap().resolve().unwrap();
        let text = resolved.iptables();

        assert!(text.contains("-A web1_ingress -p tcp -m multiport --dports 443 -j ACCEPT"));
        assert!(text.contains("-A web1_egress -p tcp -m set --match-set api_example_com dst -j ACCEPT"));
        assert!(resolved.ipsets().contains("getent ahostsv4 'api.example.com'"));

        let fwd = resolved
            .firewall()
            .chain(NetfilterTable::Filter, "web1_fwd")
            .unwrap();
        assert_eq!(fwd.rules()[0].rule, "-j DROP");
        assert!(!fwd.rules().iter().any(|r| r.rule.contains("--dport 22")));
    }

    #[test]
    fn test_office_forward_and_management() {
        let network = Network::compile(&office_data(), &ProfileRegistry::with_builtins()).unwrap();

        let request = "-p tcp -s 10.0.1.2 -d 10.0.1.6 -m multiport --dports 5432 -j ACCEPT".to_string();
        assert!(chain_rules(&network, "web1_fwd").contains(&request));
        assert!(chain_rules(&network, "db1_fwd").contains(&request));

        assert!(chain_rules(&network, "web1_fwd").contains(
            &"-p tcp --dport 22 -m set --match-set web1_admins src -j ACCEPT".to_string()
        ));
        assert!(chain_rules(&network, "printer_fwd").contains(
            &"-p tcp -m set --match-set printer_admins src -j ACCEPT".to_string()
        ));
        assert!(chain_rules(&network, "alice_fwd").contains(
            &"-m set --match-set internalonly dst -j ACCEPT".to_string()
        ));
        // Bare-metal router without admins stays reachable
        assert!(chain_rules(&network, "gw_fwd").contains(&"-p tcp --dport 22 -j ACCEPT".to_string()));
    }

    #[test]
    fn test_office_sets() {
        let network = Network::compile(&office_data(), &ProfileRegistry::with_builtins()).unwrap();
        let sets = network.firewall("gw").unwrap().sets();
        assert_eq!(sets.get("user").unwrap().len(), 1);
        // web1, db1 and hv1
        assert_eq!(sets.get("servers").unwrap().len(), 3);
        assert_eq!(sets.get("internalonly").unwrap().len(), 1);
        assert!(sets.is_empty("db1_admins"));
    }

    #[test]
    fn test_service_units_follow_phases() {
        let network = Network::compile(&office_data(), &ProfileRegistry::with_builtins()).unwrap();
        let web1 = network.registry("web1").unwrap();
        let labels: Vec<_> = web1.units().iter().map(|u| u.label()).collect();
        let guest = labels.iter().position(|l| *l == "is_virtualbox_guest").unwrap();
        let mounted = labels.iter().position(|l| *l == "data_disk_mounted").unwrap();
        let tamper = labels.iter().position(|l| *l == "no_config_file_tampering").unwrap();
        assert!(guest < mounted && mounted < tamper);

        let hv1 = network.registry("hv1").unwrap();
        assert!(hv1.contains("web1_data_disk_dir_created"));
    }

    #[test]
    fn test_gw_script_loads_sets_before_rules() {
        let network = Network::compile(&office_data(), &ProfileRegistry::with_builtins()).unwrap();
        let script = network.script("gw", Action::Config, false).unwrap();
        let sets = script.find("#============ ipsets_loaded").unwrap();
        let rules = script.find("#============ iptables_loaded").unwrap();
        assert!(sets < rules);
        assert!(script.contains("#============ daily_bandwidth_alert_script_created"));
    }

    #[test]
    fn test_unknown_profile_aborts_compilation() {
        let mut data = office_data();
        data.machines
            .get_mut("db1")
            .unwrap()
            .profiles
            .push("postgres".to_string());
        let err = Network::compile(&data, &ProfileRegistry::with_builtins()).unwrap_err();
        assert!(err.to_string().contains("postgres"));
    }
}

#[cfg(test)]
mod property_tests {
    use crate::core::firewall::NetfilterTable;
    use crate::core::graph::{NetworkGraph, NetworkSettings};
    use crate::core::interface::{Direction, Inet, NetworkInterface};
    use crate::core::machine::{Machine, MachineKind, MachineType};
    use crate::core::resolver::{FirewallResolver, set_name};
    use crate::core::traffic::{BROADCAST, Encapsulation, TrafficRule};
    use proptest::prelude::*;
    use std::net::Ipv4Addr;

    prop_compose! {
        fn arb_ports()(ports in prop::collection::vec(0i64..=65535, 0..4)) -> Vec<i64> {
            ports
        }
    }

    prop_compose! {
        fn arb_destination()(
            destination in prop_oneof![
                Just(BROADCAST.to_string()),
                "[a-z]{1,12}\\.example\\.(com|org)",
                (1u8..=223, 0u8..=255).prop_map(|(a, b)| format!("{a}.{b}.0.0/16")),
            ],
        ) -> String {
            destination
        }
    }

    prop_compose! {
        fn arb_server()(
            listen in arb_ports(),
            egress in prop::collection::vec((arb_destination(), arb_ports()), 0..3),
            throttled in any::<bool>(),
        ) -> (Vec<i64>, Vec<(String, Vec<i64>)>, bool) {
            (listen, egress, throttled)
        }
    }

    fn router() -> Machine {
        let mut gw = Machine::new("gw", MachineKind::Router).unwrap();
        gw.add_type(MachineType::Router);
        gw.add_interface(NetworkInterface::new("wan0", Direction::Wan, Inet::Dhcp).unwrap())
            .unwrap();
        gw.add_interface(
            NetworkInterface::new("lan0", Direction::Lan, Inet::Static)
                .unwrap()
                .with_address(Ipv4Addr::new(10, 0, 0, 1)),
        )
        .unwrap();
        gw
    }

    proptest! {
        #[test]
        fn test_port_boundaries(port in any::<i64>()) {
            let valid = (0..=65535).contains(&port);
            prop_assert_eq!(TrafficRule::validate_port(port).is_ok(), valid);
        }

        #[test]
        fn test_set_names_fit_ipset(raw in "[a-zA-Z0-9.\\-/]{1,80}") {
            let name = set_name(&raw);
            prop_assert!(name.len() <= 31);
            prop_assert!(name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
        }

        #[test]
        fn test_every_chain_ends_in_drop(
            servers in prop::collection::vec(arb_server(), 1..6),
            debug in any::<bool>(),
        ) {
            let mut settings = NetworkSettings::new("prop");
            settings.debug = debug;
            let mut graph = NetworkGraph::new(settings);
            graph.add_machine(router()).unwrap();

            for (i, (listen, egress, throttled)) in servers.iter().enumerate() {
                let mut m = Machine::new(&format!("srv{i}"), MachineKind::Server).unwrap();
                let address = Ipv4Addr::new(10, 0, u8::try_from(i + 1).unwrap(), 2);
                m.add_interface(
                    NetworkInterface::new("eth0", Direction::Lan, Inet::Static)
                        .unwrap()
                        .with_address(address),
                )
                .unwrap();
                if !listen.is_empty() {
                    m.add_listen(Encapsulation::Tcp, listen.iter().copied()).unwrap();
                }
                for (destination, ports) in egress {
                    m.add_egress(destination, Encapsulation::Tcp, ports.iter().copied()).unwrap();
                }
                m.set_throttled(*throttled);
                graph.add_machine(m).unwrap();
            }

            let frozen = graph.freeze().unwrap();
            let resolved = FirewallResolver::new(&frozen, "gw").unwrap().resolve().unwrap();
            for chain in resolved.firewall().chains(NetfilterTable::Filter) {
                if chain.policy().is_some() {
                    continue;
                }
                prop_assert_eq!(chain.rules()[0].rule.as_str(), "-j DROP", "{}", chain.name());
                if chain.name().ends_with("_egress") {
                    for rule in chain.rules() {
                        if rule.label.ends_with("_anywhere_egress") {
                            prop_assert!(!rule.rule.contains("--match-set"));
                        }
                    }
                }
            }
        }
    }
}
