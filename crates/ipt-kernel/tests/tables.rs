//! Whole tables through the kernel double: every supported extension in
//! one commit, chain lifecycle, failed commits and declarative documents.

use ipt_core::{Error, Fragment, Match, Rule, Ruleset, Table, TableName, Target, Verdict};
use ipt_kernel::{KernelConfig, KernelStore, MemoryKernel, decode, encode};

fn store() -> KernelStore<MemoryKernel> {
    KernelStore::with_socket(
        MemoryKernel::new(),
        KernelConfig {
            use_lock: false,
            ..KernelConfig::default()
        },
    )
}

fn filter_table() -> Table {
    let mut table = Table::new(TableName::Filter);
    table.create_chain("logdrop").unwrap();
    table.set_policy("FORWARD", "DROP").unwrap();

    let mut ssh = Rule::new();
    ssh.set_protocol("tcp").unwrap();
    ssh.add_match(
        Match::new("tcp")
            .unwrap()
            .with("dport", "ssh")
            .unwrap()
            .with("tcp_flags", "SYN,ACK SYN")
            .unwrap(),
    );
    ssh.add_match(Match::new("comment").unwrap().with("comment", "ssh in").unwrap());
    ssh.set_target(Target::Verdict(Verdict::Accept));

    let mut dns = Rule::new();
    dns.set_protocol("udp").unwrap();
    dns.add_match(Match::new("udp").unwrap().with("sport", "53").unwrap());
    dns.add_match(Match::new("mark").unwrap().with("mark", "!0x1/0xff").unwrap());
    dns.set_target(Target::jump("logdrop"));

    let mut fragments = Rule::new();
    fragments.set_src("! 10.0.0.0/8").unwrap();
    fragments.set_out_interface("eth+").unwrap();
    fragments.set_fragment(Fragment::Only);

    // an extension this crate does not model
    let mut limited = Rule::new();
    limited.add_match(Match::from_kernel("limit", 0, &[0x2a; 32]));
    limited.set_target(Target::from_kernel("LOG", 0, &[0x07; 40]));

    let input = table.chain_mut("INPUT").unwrap();
    input.append_rule(ssh);
    input.append_rule(dns);
    input.append_rule(fragments);

    let mut drop = Rule::new();
    drop.set_target(Target::new("DROP").unwrap());
    let logdrop = table.chain_mut("logdrop").unwrap();
    logdrop.append_rule(limited);
    logdrop.append_rule(drop);
    table
}

fn mangle_table() -> Table {
    let mut table = Table::new(TableName::Mangle);

    let mut mark = Rule::new();
    mark.set_in_interface("!lo").unwrap();
    mark.set_target(Target::new("MARK").unwrap().with("set_xmark", "0x10/0xff").unwrap());

    let mut tos = Rule::new();
    tos.set_protocol("tcp").unwrap();
    tos.add_match(Match::new("tcp").unwrap().with("syn", "").unwrap());
    tos.set_target(Target::new("TOS").unwrap().with("set_tos", "Minimize-Delay").unwrap());

    let mut cluster = Rule::new();
    cluster.set_dst("192.168.1.10").unwrap();
    cluster.set_in_interface("eth1").unwrap();
    let mut target = Target::new("CLUSTERIP").unwrap();
    for (param, value) in [
        ("new", ""),
        ("hashmode", "sourceip-sourceport"),
        ("clustermac", "01:00:5e:00:00:20"),
        ("total_nodes", "3"),
        ("local_node", "2"),
        ("hash_init", "0x1234"),
    ] {
        target.set(param, value).unwrap();
    }
    cluster.set_target(target);

    let pre = table.chain_mut("PREROUTING").unwrap();
    pre.append_rule(mark);
    pre.append_rule(tos);
    table.chain_mut("INPUT").unwrap().append_rule(cluster);
    table
}

#[test]
fn every_extension_survives_commit_and_reload() {
    let mut store = store();
    for mut table in [filter_table(), mangle_table()] {
        table.commit(&mut store).unwrap();
        let live = Table::load(&mut store, table.name()).unwrap();
        assert_eq!(live, table, "{}", table);
    }

    let filter = store.socket().snapshot(TableName::Filter).unwrap();
    let logdrop = filter.chain("logdrop").unwrap();
    let log = logdrop.rules()[0].target().unwrap().extension().unwrap();
    assert!(log.is_opaque());
    assert_eq!(log.data(), vec![0x07; 40]);
}

#[test]
fn jump_offsets_resolve_to_chain_names() {
    let table = filter_table();
    let encoded = encode(&table).unwrap();
    let r = encoded.replace;
    let info = ipt_kernel::abi::IptGetinfo {
        name: r.name,
        valid_hooks: r.valid_hooks,
        hook_entry: r.hook_entry,
        underflow: r.underflow,
        num_entries: r.num_entries,
        size: r.size,
    };
    let decoded = decode(&info, &encoded.entries).unwrap();

    let input = decoded.chain("INPUT").unwrap();
    assert_eq!(input.rules()[1].target(), Some(&Target::jump("logdrop")));
    assert_eq!(input.rules()[2].target(), None);
    assert_eq!(decoded.policy("FORWARD").unwrap(), Some(Verdict::Drop));
}

#[test]
fn chain_lifecycle_against_kernel() {
    let mut store = store();
    let mut table = Table::load(&mut store, TableName::Filter).unwrap();
    table.create_chain("old_name").unwrap();
    let mut jump = Rule::new();
    jump.set_target(Target::jump("old_name"));
    table.chain_mut("OUTPUT").unwrap().append_rule(jump.clone());
    table.commit(&mut store).unwrap();

    let mut live = Table::load(&mut store, TableName::Filter).unwrap();
    assert!(matches!(
        live.delete_chain("old_name"),
        Err(Error::ChainInUse { .. })
    ));
    live.rename_chain("old_name", "new_name").unwrap();
    live.commit(&mut store).unwrap();

    let mut live = Table::load(&mut store, TableName::Filter).unwrap();
    assert!(!live.is_chain("old_name"));
    assert_eq!(
        live.chain("OUTPUT").unwrap().rules()[0].target(),
        Some(&Target::jump("new_name"))
    );

    live.chain_mut("OUTPUT").unwrap().flush();
    live.delete_chain("new_name").unwrap();
    live.commit(&mut store).unwrap();
    assert_eq!(Table::load(&mut store, TableName::Filter).unwrap(), Table::new(TableName::Filter));
}

#[test]
fn failed_commit_leaves_kernel_and_snapshot() {
    let mut store = store();
    let mut table = Table::load(&mut store, TableName::Nat).unwrap();
    let mut masq = Rule::new();
    masq.set_protocol("udp").unwrap();
    masq.set_target(Target::new("MASQUERADE").unwrap().with("to_ports", "5000-5100").unwrap());
    table.chain_mut("POSTROUTING").unwrap().append_rule(masq);

    store.socket_mut().fail_next_replace(libc::EAGAIN);
    let err = table.commit(&mut store).unwrap_err();
    assert!(matches!(err, Error::CommitFailed { .. }));
    assert_eq!(store.socket().replace_count(), 0);
    assert_eq!(store.socket().snapshot(TableName::Nat).unwrap(), Table::new(TableName::Nat));

    assert!(table.is_dirty());
    table.rollback();
    assert!(!table.is_dirty());
    assert!(table.chain("POSTROUTING").unwrap().is_empty());
}

#[test]
fn transaction_rolls_back_when_kernel_refuses() {
    let mut store = store();
    let mut table = Table::load(&mut store, TableName::Raw).unwrap();
    store.socket_mut().fail_next_replace(libc::EPERM);

    let result = table.transaction(&mut store, |t| {
        t.create_chain("notrack_web")?;
        t.set_policy("PREROUTING", "DROP")
    });
    assert!(matches!(result, Err(Error::CommitFailed { .. })));
    assert_eq!(table, Table::new(TableName::Raw));

    table
        .transaction(&mut store, |t| t.set_policy("OUTPUT", "DROP"))
        .unwrap();
    assert_eq!(
        Table::load(&mut store, TableName::Raw)
            .unwrap()
            .policy("OUTPUT")
            .unwrap(),
        Some(Verdict::Drop)
    );
}

#[test]
fn invalid_rule_never_reaches_kernel() {
    let mut store = store();
    let mut table = Table::load(&mut store, TableName::Nat).unwrap();
    let mut rule = Rule::new();
    rule.set_target(Target::new("REDIRECT").unwrap().with("to_ports", "8080").unwrap());
    table.chain_mut("PREROUTING").unwrap().append_rule(rule);

    let err = table.commit(&mut store).unwrap_err();
    assert!(err.is_validation());
    assert_eq!(store.socket().replace_count(), 0);
}

#[test]
fn document_applies_and_exports() {
    let doc = r#"
tables:
  - name: nat
    chains:
      - name: redirects
        rules:
          - protocol: tcp
            matches:
              - name: tcp
                params: { dport: "80" }
            target: { name: REDIRECT, params: { to_ports: "8080" } }
      - name: PREROUTING
        rules:
          - in_interface: eth0
            target: { name: redirects }
      - name: POSTROUTING
        rules:
          - out_interface: eth0
            protocol: tcp
            target: { name: MASQUERADE, params: { to_ports: "1234", random: "" } }
"#;
    let mut store = store();
    let ruleset = Ruleset::from_yaml(doc).unwrap();
    let spec = ruleset.table(TableName::Nat).unwrap();

    let mut table = Table::load(&mut store, TableName::Nat).unwrap();
    spec.apply(&mut table).unwrap();
    table.commit(&mut store).unwrap();

    let live = Table::load(&mut store, TableName::Nat).unwrap();
    assert_eq!(live, table);
    assert_eq!(
        live.chain("PREROUTING").unwrap().rules()[0].target(),
        Some(&Target::jump("redirects"))
    );
    assert_eq!(ipt_core::TableSpec::from_table(&live).build().unwrap(), live);
}
