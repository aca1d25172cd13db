//! Target behaviour end to end: parameter grammars on detached targets,
//! then rules inserted into live tables, committed, read back and removed.

use ipt_core::{Error, Match, Rule, Table, TableName, Target};
use ipt_kernel::{KernelConfig, KernelStore, MemoryKernel};

fn store() -> KernelStore<MemoryKernel> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    KernelStore::with_socket(
        MemoryKernel::new(),
        KernelConfig {
            use_lock: false,
            ..KernelConfig::default()
        },
    )
}

/// `-d 127.0.0.2 -p tcp -i eth0 -m tcp`
fn tcp_rule() -> Rule {
    let mut rule = Rule::new();
    rule.set_dst("127.0.0.2").unwrap();
    rule.set_protocol("tcp").unwrap();
    rule.set_in_interface("eth0").unwrap();
    rule.add_match(Match::new("tcp").unwrap());
    rule
}

/// Insert `rule` at the head of `chain`, commit, and check every rule read
/// back from the kernel equals it. Cleans up afterwards.
fn insert_and_read_back(
    store: &mut KernelStore<MemoryKernel>,
    table: TableName,
    chain: &str,
    rule: &Rule,
) {
    let mut working = Table::load(store, table).unwrap();
    let user_chain = !working.is_chain(chain);
    if user_chain {
        working.create_chain(chain).unwrap();
    }
    working
        .chain_mut(chain)
        .unwrap()
        .insert_rule(rule.clone(), 0)
        .unwrap();
    working.commit(store).unwrap();

    let mut live = Table::load(store, table).unwrap();
    let rules = live.chain(chain).unwrap().rules();
    assert!(!rules.is_empty());
    for read_back in rules {
        assert_eq!(read_back, rule, "rule read back differs from the inserted one");
    }

    let chain_mut = live.chain_mut(chain).unwrap();
    chain_mut.delete_rule(rule).unwrap();
    if user_chain {
        chain_mut.flush();
        live.delete_chain(chain).unwrap();
    }
    live.commit(store).unwrap();
    assert_eq!(Table::load(store, table).unwrap(), Table::new(table));
}

#[test]
fn target_create() {
    let mut rule = Rule::new();
    let target = rule.create_target("MARK").unwrap();
    target.set("set_mark", "0x123").unwrap();

    let t = Target::new("MARK").unwrap().with("set_mark", "0x123").unwrap();
    assert_eq!(rule.target(), Some(&t));
}

#[test]
fn target_compare() {
    let t1 = Target::new("MARK").unwrap().with("set_mark", "0x123").unwrap();
    let mut t2 = Target::new("MARK").unwrap().with("set_mark", "0x123").unwrap();
    assert_eq!(t1, t2);

    t2.reset();
    t2.set("set_mark", "0x124").unwrap();
    assert_ne!(t1, t2);
}

#[test]
fn clusterip_mode() {
    let mut target = Target::new("CLUSTERIP").unwrap();
    for hashmode in ["sourceip", "sourceip-sourceport", "sourceip-sourceport-destport"] {
        target.set("new", "").unwrap();
        target.set("hashmode", hashmode).unwrap();
        assert_eq!(target.get("hashmode").unwrap().as_deref(), Some(hashmode));
        target.reset();
    }
    for hashmode in ["asdf", "1234"] {
        target.set("new", "").unwrap();
        assert!(
            matches!(
                target.set("hashmode", hashmode),
                Err(Error::InvalidValue { .. })
            ),
            "CLUSTERIP accepted invalid value {}",
            hashmode
        );
        target.reset();
    }
}

#[test]
fn clusterip_fields_need_new() {
    let mut target = Target::new("CLUSTERIP").unwrap();
    assert!(matches!(
        target.set("hashmode", "sourceip"),
        Err(Error::MissingPrerequisite { .. })
    ));
    assert_eq!(target.get("hashmode").unwrap(), None);
}

#[test]
fn clusterip_insert() {
    let mut store = store();
    let mut rule = tcp_rule();
    let target = rule.create_target("CLUSTERIP").unwrap();
    target.set("new", "").unwrap();
    target.set("hashmode", "sourceip").unwrap();
    target.set("clustermac", "01:02:03:04:05:06").unwrap();
    target.set("local_node", "1").unwrap();
    target.set("total_nodes", "2").unwrap();

    insert_and_read_back(&mut store, TableName::Filter, "ipt_test_clusterip", &rule);
}

#[test]
fn redirect_mode() {
    let mut target = Target::new("REDIRECT").unwrap();
    for port in ["1234", "1234-2345", "65534-65535"] {
        target.set("to_ports", port).unwrap();
        assert_eq!(target.get("to_ports").unwrap().as_deref(), Some(port));
        target.reset();
    }
    target.set("random", "").unwrap();
    target.reset();
    for port in ["1234567", "2345-1234"] {
        assert!(
            matches!(target.set("to_ports", port), Err(Error::InvalidValue { .. })),
            "REDIRECT accepted invalid value {}",
            port
        );
        target.reset();
    }
    // the legacy parser takes unresolvable names as the highest port
    target.set("to_ports", "asdf").unwrap();
    assert_eq!(target.get("to_ports").unwrap().as_deref(), Some("65535"));
}

#[test]
fn redirect_compare() {
    let range = |ports: &str| {
        Target::new("REDIRECT")
            .unwrap()
            .with("to_ports", ports)
            .unwrap()
    };
    assert_eq!(range("1234-2345"), range("1234-2345"));
    assert_ne!(range("1234"), range("1234-2345"));
}

#[test]
fn redirect_insert() {
    let mut store = store();
    let mut rule = tcp_rule();
    rule.set_target(Target::new("REDIRECT").unwrap().with("to_ports", "1234-1235").unwrap());

    insert_and_read_back(&mut store, TableName::Nat, "ipt_test_redirect", &rule);
}

#[test]
fn tos_mode() {
    let mut target = Target::new("TOS").unwrap();
    for tos in ["0x12/0xff", "0x12/0x0f"] {
        target.set("set_tos", tos).unwrap();
        assert_eq!(target.get("set_tos").unwrap().as_deref(), Some(tos));
        target.reset();
    }
    for (name, value) in [
        ("Minimize-Delay", "0x10/0x3f"),
        ("Maximize-Throughput", "0x08/0x3f"),
        ("Maximize-Reliability", "0x04/0x3f"),
        ("Minimize-Cost", "0x02/0x3f"),
        ("Normal-Service", "0x00/0x3f"),
    ] {
        target.set("set_tos", name).unwrap();
        assert_eq!(target.get("set_tos").unwrap().as_deref(), Some(value));
        target.reset();
    }

    for (op, expected) in [
        ("and_tos", "0x00/0xfb"),
        ("or_tos", "0x04/0x04"),
        ("xor_tos", "0x04/0x00"),
    ] {
        target.set(op, "0x04").unwrap();
        assert_eq!(target.get("set_tos").unwrap().as_deref(), Some(expected));
        assert_eq!(target.get(op).unwrap(), None);
        target.reset();
    }

    for tos in ["0x1234", "0x12/0xfff", "asdf", "Minimize-Bullshit"] {
        for op in ["and_tos", "or_tos", "xor_tos"] {
            assert!(
                target.set(op, tos).is_err(),
                "TOS accepted invalid value {} for {}",
                tos,
                op
            );
            target.reset();
        }
    }
}

#[test]
fn tos_insert() {
    let mut store = store();
    let mut rule = tcp_rule();
    rule.set_target(Target::new("TOS").unwrap().with("set_tos", "0x12/0xff").unwrap());

    insert_and_read_back(&mut store, TableName::Mangle, "ipt_test_tos", &rule);
}

#[test]
fn masquerade_mode() {
    let mut target = Target::new("MASQUERADE").unwrap();
    for port in ["1234", "1234-2345"] {
        target.set("to_ports", port).unwrap();
        assert_eq!(target.get("to_ports").unwrap().as_deref(), Some(port));
        target.reset();
    }
    target.set("random", "").unwrap();
    target.reset();
    for port in ["123456", "1234-1233", "asdf"] {
        assert!(
            target.set("to_ports", port).is_err(),
            "MASQUERADE accepted invalid value {}",
            port
        );
        target.reset();
    }
}

#[test]
fn masquerade_insert() {
    let mut store = store();
    let mut rule = Rule::new();
    rule.set_dst("127.0.0.2").unwrap();
    rule.set_protocol("tcp").unwrap();
    rule.set_out_interface("eth0").unwrap();
    rule.set_target(Target::new("MASQUERADE").unwrap().with("to_ports", "1234").unwrap());

    insert_and_read_back(&mut store, TableName::Nat, "POSTROUTING", &rule);
}

#[test]
fn unknown_target_parameter_is_rejected() {
    let mut target = Target::new("REDIRECT").unwrap();
    assert!(matches!(
        target.set("set_tos", "0x10"),
        Err(Error::UnknownParameter { .. })
    ));
    assert!(matches!(
        target.get("hashmode"),
        Err(Error::UnknownParameter { .. })
    ));
}
