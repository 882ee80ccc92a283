//! End-to-end scenarios straight out of the policy's testable-properties
//! section, driven against the core modules directly (label inference,
//! principal resolution, the policy engine, and the audit sink). A live FUSE
//! mount needs a kernel module and privileges a test sandbox doesn't have,
//! but the mediator's callback bodies are thin wrappers over exactly this
//! path, so exercising it here covers the same decisions.

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use securefs_core::{
    decide, label_of, AuditRecord, AuditSink, CredentialStore, Decision, FixedIdentity, Intent,
    Operation, PrincipalRecord, PrincipalResolver, Sensitivity,
};

struct World {
    _dir: tempfile::TempDir,
    root: std::path::PathBuf,
    credentials: std::path::PathBuf,
    audit_log: std::path::PathBuf,
}

impl World {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();

        fs::create_dir_all(root.join("secret")).unwrap();
        fs::write(root.join("secret/memo"), "alpha").unwrap();
        fs::create_dir_all(root.join("unclassified")).unwrap();
        fs::write(root.join("unclassified/note"), "beta").unwrap();
        fs::create_dir_all(root.join("top_secret")).unwrap();

        let mut principals = BTreeMap::new();
        principals.insert("alice".to_string(), PrincipalRecord::new(Sensitivity::Secret, false));
        principals.insert("root".to_string(), PrincipalRecord::new(Sensitivity::TopSecret, true));
        principals.insert("eve".to_string(), PrincipalRecord::new(Sensitivity::Unclassified, false));
        let credentials = root.join("users.json");
        CredentialStore::from_map(principals).save(&credentials).unwrap();

        let audit_log = root.join("audit.log");

        Self { _dir: dir, root, credentials, audit_log }
    }

    fn resolver_for(&self, user: &str) -> PrincipalResolver {
        PrincipalResolver::new(Arc::new(FixedIdentity(user.to_string())), &self.credentials)
    }

    fn audit(&self) -> AuditSink {
        AuditSink::open(&self.audit_log).unwrap()
    }

    fn audit_lines(&self) -> Vec<String> {
        fs::read_to_string(&self.audit_log)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

/// Run the same resolve-label/decide/audit skeleton the mediator's callbacks
/// use, for one virtual path.
fn mediate(world: &World, user: &str, op: Operation, virtual_path: &str, intent: Intent) -> Decision {
    let principal = world.resolver_for(user).current_principal();
    let label = label_of(virtual_path);
    let decision = decide(&principal, op, label, intent);
    world
        .audit()
        .record(&AuditRecord::from_decision(&principal.name, principal.clearance, op, virtual_path, decision))
        .unwrap();
    decision
}

#[test]
fn scenario_1_eve_denied_reading_secret() {
    let world = World::new();
    let decision = mediate(&world, "eve", Operation::OpenRead, "/secret/memo", Intent::none());
    assert_eq!(decision, Decision::Deny(securefs_core::DenyReason::NoReadUp));
    let lines = world.audit_lines();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("no-read-up"));
    assert!(lines[0].contains("DENIED"));
}

#[test]
fn scenario_2_alice_reads_secret_memo() {
    let world = World::new();
    let decision = mediate(&world, "alice", Operation::OpenRead, "/secret/memo", Intent::none());
    assert!(decision.is_grant());

    let content = fs::read_to_string(world.root.join("secret/memo")).unwrap();
    assert_eq!(content, "alpha");
    assert!(world.audit_lines()[0].contains("GRANTED"));
}

#[test]
fn scenario_3_alice_denied_writing_down_to_unclassified() {
    let world = World::new();
    let decision = mediate(&world, "alice", Operation::OpenWrite, "/unclassified/note", Intent::none());
    assert_eq!(decision, Decision::Deny(securefs_core::DenyReason::NoWriteDown));
}

#[test]
fn scenario_4_root_writes_down_and_eve_observes_it() {
    let world = World::new();
    let decision = mediate(&world, "root", Operation::OpenWrite, "/unclassified/note", Intent::none());
    assert_eq!(
        decision,
        Decision::GrantAsDowngrade { from: Sensitivity::TopSecret, to: Sensitivity::Unclassified }
    );
    fs::write(world.root.join("unclassified/note"), "gamma").unwrap();

    let eve_decision = mediate(&world, "eve", Operation::OpenRead, "/unclassified/note", Intent::none());
    assert!(eve_decision.is_grant());
    let content = fs::read_to_string(world.root.join("unclassified/note")).unwrap();
    assert_eq!(content, "gamma");

    let lines = world.audit_lines();
    assert!(lines[0].contains("downgrade TOP_SECRET->UNCLASSIFIED"));
}

#[test]
fn scenario_5_root_expurgates_secret_memo_to_unclassified() {
    let world = World::new();
    let principal = world.resolver_for("root").current_principal();
    let source_label = label_of("/secret/memo");
    let dest_label = label_of("/unclassified/memo.dc");
    let decision = decide(&principal, Operation::Expurgate, source_label, Intent::expurgate_to(dest_label));
    assert_eq!(
        decision,
        Decision::GrantAsDowngrade { from: Sensitivity::Secret, to: Sensitivity::Unclassified }
    );
    world
        .audit()
        .record(&AuditRecord::from_decision(
            &principal.name,
            principal.clearance,
            Operation::Expurgate,
            "/secret/memo",
            decision,
        ))
        .unwrap();

    // Simulate what `Mediator::expurgate` does once granted: marker then content.
    let content = fs::read_to_string(world.root.join("secret/memo")).unwrap();
    fs::write(world.root.join("unclassified/memo.dc"), format!("[EXPURGATED]\n{content}")).unwrap();

    let written = fs::read_to_string(world.root.join("unclassified/memo.dc")).unwrap();
    assert_eq!(written, "[EXPURGATED]\nalpha");
    assert!(world.audit_lines()[0].contains("downgrade SECRET->UNCLASSIFIED"));
}

#[test]
fn scenario_6_alice_lists_root_top_secret_visible_but_unreadable() {
    let world = World::new();
    assert_eq!(label_of("/top_secret"), Sensitivity::TopSecret);

    // Listing is always granted; the entry is still named in the result...
    let listing_decision = mediate(&world, "alice", Operation::ReadDir, "/", Intent::none());
    assert!(listing_decision.is_grant());

    // ...but opening a file under it for read is denied.
    let open_decision = mediate(&world, "alice", Operation::OpenRead, "/top_secret/plans", Intent::none());
    assert_eq!(open_decision, Decision::Deny(securefs_core::DenyReason::NoReadUp));
}

#[test]
fn freshness_next_operation_observes_credential_mutation() {
    let world = World::new();
    let before = mediate(&world, "eve", Operation::OpenRead, "/secret/memo", Intent::none());
    assert!(!before.is_grant());

    let mut store = CredentialStore::load(&world.credentials).unwrap();
    store.insert("eve", PrincipalRecord::new(Sensitivity::TopSecret, false));
    store.save(&world.credentials).unwrap();

    let after = mediate(&world, "eve", Operation::OpenRead, "/secret/memo", Intent::none());
    assert!(after.is_grant());
}

#[test]
fn expurgate_ordering_law_requires_strict_downgrade() {
    let world = World::new();
    let root = world.resolver_for("root").current_principal();
    // Equal labels: not a downgrade, denied even though root is trusted.
    assert_eq!(
        decide(&root, Operation::Expurgate, Sensitivity::Secret, Intent::expurgate_to(Sensitivity::Secret)),
        Decision::Deny(securefs_core::DenyReason::NotDowngrade)
    );
    // Strictly higher source: granted.
    assert!(decide(
        &root,
        Operation::Expurgate,
        Sensitivity::Secret,
        Intent::expurgate_to(Sensitivity::Unclassified)
    )
    .is_grant());
}
