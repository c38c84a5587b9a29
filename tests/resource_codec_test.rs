//! Property tests for the persisted resource record and identity formats

use proptest::prelude::*;
use std::net::Ipv4Addr;

use crawlnet::master::identity::{leader_address, master_id};
use crawlnet::master::resource::{encode_assigned_node, parse_assigned_node};
use crawlnet::master::ResourceSpec;

proptest! {
    #[test]
    fn resource_spec_survives_the_store(
        id in "[0-9]{1,19}",
        name in "\\PC{1,40}",
        node in "[a-z.]{1,20}-[0-9]{1,4}",
        address in "[a-z0-9.]{0,20}:[0-9]{2,5}",
        creation_time in any::<i64>(),
    ) {
        let spec = ResourceSpec {
            id,
            name,
            assigned_node: encode_assigned_node(&node, &address),
            creation_time,
        };

        let decoded = ResourceSpec::decode(&spec.encode().unwrap()).unwrap();
        prop_assert_eq!(&decoded, &spec);
        prop_assert_eq!(decoded.node_id().unwrap(), node.as_str());
    }

    #[test]
    fn assigned_node_splits_at_first_separator(
        node in "[^|]{1,30}",
        address in "\\PC{0,30}",
    ) {
        let encoded = encode_assigned_node(&node, &address);
        let (parsed_node, parsed_address) = parse_assigned_node(&encoded).unwrap();
        prop_assert_eq!(parsed_node, node.as_str());
        prop_assert_eq!(parsed_address, address.as_str());
    }

    #[test]
    fn leader_address_is_recovered_from_master_id(
        short_id in "[a-z0-9-]{1,12}",
        octets in any::<[u8; 4]>(),
        port in 1u16..,
    ) {
        let ip = Ipv4Addr::from(octets);
        let id = master_id(&short_id, ip, &format!(":{port}"));
        let expected = format!("{ip}:{port}");
        prop_assert_eq!(leader_address(&id), Some(expected));
    }
}

#[test]
fn test_go_field_names_on_the_wire() {
    let spec = ResourceSpec {
        id: "42".to_string(),
        name: "books".to_string(),
        assigned_node: encode_assigned_node("crawlnet.worker-1", ":9090"),
        creation_time: 1_700_000_000_000_000_000,
    };
    let json: serde_json::Value = serde_json::from_str(&spec.encode().unwrap()).unwrap();
    assert_eq!(json["ID"], "42");
    assert_eq!(json["Name"], "books");
    assert_eq!(json["AssignedNode"], "crawlnet.worker-1|:9090");
    assert_eq!(json["CreationTime"], 1_700_000_000_000_000_000i64);
}
