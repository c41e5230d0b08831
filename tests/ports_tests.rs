use portsweep::ports::{common_ports, parse_port_range, parse_ports_str, service_name, PortRange};

#[test]
fn parse_list_with_ranges_and_comments() {
    let input = r#"
        # common ports
        22
        80, 443 # web
        8000-8002
        8001  # duplicate
    "#;

    let ports = parse_ports_str(input).expect("parse ok");
    assert_eq!(ports, vec![22, 80, 443, 8000, 8001, 8002]);
}

#[test]
fn invalid_port_rejected() {
    assert!(parse_ports_str("0\n").is_err());
    assert!(parse_port_range("65536").is_err());
}

#[test]
fn range_string_round_trips_through_display() {
    let r: PortRange = "20-25".parse().unwrap();
    assert_eq!(r.to_string(), "20-25");
    assert_eq!(r.len(), 6);
}

#[test]
fn every_common_port_has_a_name() {
    for p in common_ports() {
        assert_ne!(service_name(p), "unknown", "port {p} lacks a name");
    }
}
