use crate::core::error::{Error, ErrorKind};
use crate::core::manager::{Manager, ManagerOptions};
use crate::core::tables::{FILTER_TABLE, NAT_TABLE, PREROUTING_CHAIN};
use crate::core::test_helpers::FakeIptables;
use crate::host::HostError;

const MAIN_CHAIN: &str = "DESKTOP-SERVICES";
const DESKTOP_A: &str = "DESKTOP-A";
const PORTAL: &str = "desktop services portal";
const A_SERVICE: &str = "desktop-A-service";
const A_POLICY: &str = "the desktop a policy";

fn setup() -> (FakeIptables, Manager) {
    let fake = FakeIptables::new();
    let manager = Manager::new(fake.as_host());
    (fake, manager)
}

/// Builds DESKTOP-SERVICES under PREROUTING and DESKTOP-A (with a DNAT rule) under it.
async fn build_desktop_tree(manager: &Manager) {
    manager
        .create_chain_for_table(NAT_TABLE, MAIN_CHAIN)
        .await
        .unwrap();
    manager
        .append_chain_to_parent_chain(NAT_TABLE, PREROUTING_CHAIN, MAIN_CHAIN, PORTAL)
        .await
        .unwrap();
    manager
        .create_chain_for_table(NAT_TABLE, DESKTOP_A)
        .await
        .unwrap();
    manager
        .append_chain_to_parent_chain(NAT_TABLE, MAIN_CHAIN, DESKTOP_A, A_SERVICE)
        .await
        .unwrap();
    manager
        .append_dnat_rule_to_chain(DESKTOP_A, "tcp", "3000", "192.168.240.98:3000", A_POLICY)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_desktop_scenario_end_to_end() {
    let (fake, manager) = setup();

    build_desktop_tree(&manager).await;
    assert!(fake.has_chain(NAT_TABLE, MAIN_CHAIN));
    assert!(fake.has_chain(NAT_TABLE, DESKTOP_A));
    assert_eq!(fake.rules(NAT_TABLE, DESKTOP_A).len(), 1);

    manager
        .delete_chain(NAT_TABLE, MAIN_CHAIN, DESKTOP_A, A_SERVICE)
        .await
        .unwrap();
    assert!(!fake.has_chain(NAT_TABLE, DESKTOP_A));
    assert!(fake.rules(NAT_TABLE, MAIN_CHAIN).is_empty());

    manager
        .delete_chain(NAT_TABLE, PREROUTING_CHAIN, MAIN_CHAIN, PORTAL)
        .await
        .unwrap();
    assert!(!fake.has_chain(NAT_TABLE, MAIN_CHAIN));
    assert!(fake.rules(NAT_TABLE, PREROUTING_CHAIN).is_empty());
}

#[tokio::test]
async fn test_create_chain_is_idempotent() {
    let (fake, manager) = setup();

    manager
        .create_chain_for_table(NAT_TABLE, MAIN_CHAIN)
        .await
        .unwrap();
    manager
        .create_chain_for_table(NAT_TABLE, MAIN_CHAIN)
        .await
        .unwrap();

    assert_eq!(fake.count_ops("-N"), 1);
    let dump = fake.dump(NAT_TABLE);
    assert_eq!(dump.matches("-N DESKTOP-SERVICES").count(), 1);
}

#[tokio::test]
async fn test_create_chain_tolerates_already_exists_race() {
    let (fake, manager) = setup();

    // Chain absent at check time, but -N reports it exists
    fake.fail_next(1, "iptables: No chain/target/match by that name.\n");
    fake.fail_next(1, "iptables: Chain already exists.\n");

    manager
        .create_chain_for_table(NAT_TABLE, MAIN_CHAIN)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_link_is_idempotent() {
    let (fake, manager) = setup();
    manager
        .create_chain_for_table(NAT_TABLE, MAIN_CHAIN)
        .await
        .unwrap();

    for _ in 0..2 {
        manager
            .append_chain_to_parent_chain(NAT_TABLE, PREROUTING_CHAIN, MAIN_CHAIN, PORTAL)
            .await
            .unwrap();
    }

    assert_eq!(fake.rules(NAT_TABLE, PREROUTING_CHAIN).len(), 1);
    assert_eq!(fake.count_ops("-A"), 1);
    assert_eq!(fake.count_ops("-C"), 2);
}

#[tokio::test]
async fn test_rerunning_whole_setup_converges() {
    let (fake, manager) = setup();

    build_desktop_tree(&manager).await;
    let first = fake.dump(NAT_TABLE);
    build_desktop_tree(&manager).await;

    assert_eq!(fake.dump(NAT_TABLE), first);
}

#[tokio::test]
async fn test_different_descriptions_make_separate_links() {
    let (fake, manager) = setup();
    manager
        .create_chain_for_table(NAT_TABLE, MAIN_CHAIN)
        .await
        .unwrap();

    manager
        .append_chain_to_parent_chain(NAT_TABLE, PREROUTING_CHAIN, MAIN_CHAIN, "first")
        .await
        .unwrap();
    manager
        .append_chain_to_parent_chain(NAT_TABLE, PREROUTING_CHAIN, MAIN_CHAIN, "second")
        .await
        .unwrap();

    assert_eq!(fake.rules(NAT_TABLE, PREROUTING_CHAIN).len(), 2);
}

#[tokio::test]
async fn test_dnat_argument_fidelity() {
    let (fake, manager) = setup();
    fake.seed_chain(NAT_TABLE, "CHAIN");

    manager
        .append_dnat_rule_to_chain("CHAIN", "tcp", "3000", "10.0.0.5:3000", "desc")
        .await
        .unwrap();

    let append = fake
        .history()
        .into_iter()
        .find(|args| args.iter().any(|a| a == "-A"))
        .unwrap();
    assert_eq!(
        append,
        [
            "-t",
            "nat",
            "-A",
            "CHAIN",
            "-p",
            "tcp",
            "--dport",
            "3000",
            "-m",
            "comment",
            "--comment",
            "[[desc]]",
            "-j",
            "DNAT",
            "--to-destination",
            "10.0.0.5:3000"
        ]
    );
    assert_eq!(
        crate::core::comment::unwrap_comment(&append[11]),
        Some("desc")
    );
}

#[tokio::test]
async fn test_dnat_is_idempotent_and_deletable() {
    let (fake, manager) = setup();
    fake.seed_chain(NAT_TABLE, DESKTOP_A);

    for _ in 0..2 {
        manager
            .append_dnat_rule_to_chain(DESKTOP_A, "udp", "5000:5010", "10.0.0.7", A_POLICY)
            .await
            .unwrap();
    }
    assert_eq!(fake.rules(NAT_TABLE, DESKTOP_A).len(), 1);

    manager
        .delete_dnat_rule_from_chain(DESKTOP_A, "udp", "5000:5010", "10.0.0.7", A_POLICY)
        .await
        .unwrap();
    assert!(fake.rules(NAT_TABLE, DESKTOP_A).is_empty());

    let err = manager
        .delete_dnat_rule_from_chain(DESKTOP_A, "udp", "5000:5010", "10.0.0.7", A_POLICY)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_dnat_into_missing_chain_fails() {
    let (_fake, manager) = setup();

    let err = manager
        .append_dnat_rule_to_chain("NOPE", "tcp", "80", "10.0.0.1:80", "web")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_malformed_input_issues_no_commands() {
    let (fake, manager) = setup();

    let cases = [
        manager
            .append_dnat_rule_to_chain("CHAIN", "icmp", "80", "10.0.0.1:80", "x")
            .await,
        manager
            .append_dnat_rule_to_chain("CHAIN", "tcp", "0", "10.0.0.1:80", "x")
            .await,
        manager
            .append_dnat_rule_to_chain("CHAIN", "tcp", "80", "not-an-ip", "x")
            .await,
        manager
            .append_dnat_rule_to_chain("CHAIN", "tcp", "80", "10.0.0.1:80", "a ]] b")
            .await,
        manager
            .append_chain_to_parent_chain(NAT_TABLE, "", MAIN_CHAIN, "x")
            .await,
        manager.create_chain_for_table("", MAIN_CHAIN).await,
        manager.create_chain_for_table(NAT_TABLE, "has space").await,
        manager
            .delete_chain(NAT_TABLE, PREROUTING_CHAIN, "PREROUTING", "x")
            .await,
    ];

    for result in cases {
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedInput, "{err}");
    }
    assert!(fake.history().is_empty());
}

#[tokio::test]
async fn test_delete_before_link_is_not_found() {
    let (fake, manager) = setup();
    manager
        .create_chain_for_table(NAT_TABLE, MAIN_CHAIN)
        .await
        .unwrap();

    let err = manager
        .delete_chain(NAT_TABLE, PREROUTING_CHAIN, MAIN_CHAIN, PORTAL)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(fake.has_chain(NAT_TABLE, MAIN_CHAIN));
}

#[tokio::test]
async fn test_second_delete_is_not_found() {
    let (_fake, manager) = setup();
    build_desktop_tree(&manager).await;

    manager
        .delete_chain(NAT_TABLE, MAIN_CHAIN, DESKTOP_A, A_SERVICE)
        .await
        .unwrap();
    let err = manager
        .delete_chain(NAT_TABLE, MAIN_CHAIN, DESKTOP_A, A_SERVICE)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_outer_delete_first_is_busy_and_harmless() {
    let (fake, manager) = setup();
    build_desktop_tree(&manager).await;
    let before = fake.dump(NAT_TABLE);

    let err = manager
        .delete_chain(NAT_TABLE, PREROUTING_CHAIN, MAIN_CHAIN, PORTAL)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);
    assert!(err.to_string().contains(DESKTOP_A));

    // Nothing was touched: the inner link and the DNAT rule are still attached
    assert_eq!(fake.dump(NAT_TABLE), before);
    assert_eq!(fake.count_ops("-D"), 0);

    manager
        .delete_chain(NAT_TABLE, MAIN_CHAIN, DESKTOP_A, A_SERVICE)
        .await
        .unwrap();
    manager
        .delete_chain(NAT_TABLE, PREROUTING_CHAIN, MAIN_CHAIN, PORTAL)
        .await
        .unwrap();
    assert!(!fake.has_chain(NAT_TABLE, MAIN_CHAIN));
}

#[tokio::test]
async fn test_chain_with_two_parents() {
    let (fake, manager) = setup();
    build_desktop_tree(&manager).await;
    manager
        .create_chain_for_table(NAT_TABLE, "DESKTOP-ALT")
        .await
        .unwrap();
    manager
        .append_chain_to_parent_chain(NAT_TABLE, "DESKTOP-ALT", DESKTOP_A, "alt path")
        .await
        .unwrap();

    let err = manager
        .delete_chain(NAT_TABLE, MAIN_CHAIN, DESKTOP_A, A_SERVICE)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);
    assert!(err.to_string().contains("DESKTOP-ALT"));
    assert_eq!(fake.rules(NAT_TABLE, MAIN_CHAIN).len(), 1);

    manager
        .remove_link(NAT_TABLE, "DESKTOP-ALT", DESKTOP_A, "alt path")
        .await
        .unwrap();
    manager
        .delete_chain(NAT_TABLE, MAIN_CHAIN, DESKTOP_A, A_SERVICE)
        .await
        .unwrap();
    assert!(!fake.has_chain(NAT_TABLE, DESKTOP_A));
}

#[tokio::test]
async fn test_untagged_reference_is_busy() {
    let (fake, manager) = setup();
    fake.seed_chain(FILTER_TABLE, "ORPHAN");
    fake.seed_rule(FILTER_TABLE, "INPUT", &["-j", "ORPHAN"]);
    fake.seed_rule(
        FILTER_TABLE,
        "INPUT",
        &["-m", "comment", "--comment", "[[orphan]]", "-j", "ORPHAN"],
    );

    let err = manager
        .delete_chain(FILTER_TABLE, "INPUT", "ORPHAN", "orphan")
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Busy);
    assert_eq!(fake.rules(FILTER_TABLE, "INPUT").len(), 2);
    assert!(fake.has_chain(FILTER_TABLE, "ORPHAN"));
}

#[tokio::test]
async fn test_goto_reference_is_busy() {
    let (fake, manager) = setup();
    build_desktop_tree(&manager).await;
    fake.seed_rule(NAT_TABLE, "OUTPUT", &["-p", "tcp", "-g", DESKTOP_A]);
    let before = fake.dump(NAT_TABLE);

    let err = manager
        .delete_chain(NAT_TABLE, MAIN_CHAIN, DESKTOP_A, A_SERVICE)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Busy);
    assert!(err.to_string().contains("OUTPUT"));
    assert_eq!(fake.count_ops("-D"), 0);
    assert_eq!(fake.count_ops("-X"), 0);
    assert_eq!(fake.dump(NAT_TABLE), before);
}

#[tokio::test]
async fn test_kernel_busy_on_chain_removal_leaves_empty_chain() {
    let (fake, manager) = setup();
    build_desktop_tree(&manager).await;
    fake.fail_on("-X", 1, "iptables: Too many links.\n");

    let err = manager
        .delete_chain(NAT_TABLE, MAIN_CHAIN, DESKTOP_A, A_SERVICE)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);
    assert!(err.to_string().contains(DESKTOP_A));

    // Link removed and chain flushed before the refused -X
    assert!(fake.rules(NAT_TABLE, MAIN_CHAIN).is_empty());
    assert!(fake.has_chain(NAT_TABLE, DESKTOP_A));
    assert!(fake.rules(NAT_TABLE, DESKTOP_A).is_empty());

    // The link is gone, so a retry reports it missing
    let err = manager
        .delete_chain(NAT_TABLE, MAIN_CHAIN, DESKTOP_A, A_SERVICE)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_kernel_refusal_on_create_is_classified() {
    let (fake, manager) = setup();
    fake.fail_next(1, "iptables: No chain/target/match by that name.\n");
    fake.fail_next(4, "iptables v1.8.9 (nf_tables): CHAIN_ADD failed (Device or resource busy)\n");

    let err = manager
        .create_chain_for_table(NAT_TABLE, MAIN_CHAIN)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Busy);
    assert!(!fake.has_chain(NAT_TABLE, MAIN_CHAIN));
}

#[tokio::test]
async fn test_timeout_during_check_is_not_absent() {
    let (fake, manager) = setup();
    fake.seed_chain(NAT_TABLE, MAIN_CHAIN);
    fake.time_out_next();

    let err = manager
        .append_chain_to_parent_chain(NAT_TABLE, PREROUTING_CHAIN, MAIN_CHAIN, PORTAL)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ExecutionFailure);
    assert!(matches!(
        err,
        Error::Host {
            source: HostError::Timeout(_),
            ..
        }
    ));
    // No append after a failed check
    assert_eq!(fake.count_ops("-A"), 0);
}

#[tokio::test]
async fn test_unrecognized_check_failure_is_not_absent() {
    let (fake, manager) = setup();
    fake.seed_chain(NAT_TABLE, MAIN_CHAIN);
    fake.fail_next(4, "Another app is currently holding the xtables lock.\n");

    let err = manager
        .append_chain_to_parent_chain(NAT_TABLE, PREROUTING_CHAIN, MAIN_CHAIN, PORTAL)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ExecutionFailure);
    assert!(err.to_string().contains("-C PREROUTING"));
    assert_eq!(fake.count_ops("-A"), 0);
}

#[tokio::test]
async fn test_chain_exists() {
    let (fake, manager) = setup();
    assert!(!manager.chain_exists(NAT_TABLE, MAIN_CHAIN).await.unwrap());
    fake.seed_chain(NAT_TABLE, MAIN_CHAIN);
    assert!(manager.chain_exists(NAT_TABLE, MAIN_CHAIN).await.unwrap());
    assert!(manager.chain_exists(NAT_TABLE, PREROUTING_CHAIN).await.unwrap());

    fake.fail_next(
        3,
        "can't initialize iptables table `nat': Permission denied (you must be root)\n",
    );
    let err = manager
        .chain_exists(NAT_TABLE, MAIN_CHAIN)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExecutionFailure);
}

#[tokio::test]
async fn test_list_links() {
    let (fake, manager) = setup();
    build_desktop_tree(&manager).await;
    fake.seed_chain(NAT_TABLE, "DOCKER");
    fake.seed_rule(NAT_TABLE, PREROUTING_CHAIN, &["-j", "DOCKER"]);

    let links = manager
        .list_links(NAT_TABLE, PREROUTING_CHAIN)
        .await
        .unwrap();
    assert_eq!(links.len(), 2);
    assert_eq!(links[0].child, MAIN_CHAIN);
    assert_eq!(links[0].description.as_deref(), Some(PORTAL));
    assert_eq!(links[1].child, "DOCKER");
    assert_eq!(links[1].description, None);

    let err = manager.list_links(NAT_TABLE, "MISSING").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_lock_wait_and_program_options() {
    let fake = FakeIptables::new();
    let manager = Manager::with_options(
        fake.as_host(),
        ManagerOptions {
            program: "/usr/sbin/iptables-nft".to_string(),
            lock_wait_secs: Some(3),
        },
    );

    manager
        .create_chain_for_table(NAT_TABLE, MAIN_CHAIN)
        .await
        .unwrap();

    let history = fake.history();
    assert_eq!(history[1], ["-t", "nat", "-w", "3", "-N", MAIN_CHAIN]);
    assert!(fake.has_chain(NAT_TABLE, MAIN_CHAIN));
}
