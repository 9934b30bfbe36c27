use crate::*;

/// A owns O; B asks (priority 5) and gets it; C asks A later (priority 3)
/// and is forwarded to B rather than denied.
#[test]
fn late_request_is_forwarded_to_new_resident() {
    let mut fleet = Fleet::new(&[A, B, C]);
    let o = fleet.server_mut(A).spawn(SHIP, "o", None).unwrap();

    fleet.inject(request(B, A, o, 5, MigrationIntent::TakeOwnership));
    fleet.step(A).unwrap();
    {
        let registry = &fleet.server(A).world().registry;
        assert!(registry.is_remote(o));
        assert_eq!(registry.resident_of(o), B);
        assert_eq!(registry.owner_of(o), B);
    }
    fleet.route();
    fleet.step(B).unwrap();
    assert!(fleet.server(B).world().objects.contains(o));

    fleet.inject(request(C, A, o, 3, MigrationIntent::TakeOwnership));
    fleet.step(A).unwrap();
    fleet.route();

    let from_a: Vec<_> = fleet.log.iter().filter(|e| e.from == A).collect();
    let last = from_a.last().unwrap();
    assert_eq!(last.to, B);
    assert!(matches!(
        last.message,
        PeerMessage::RequestObject { requester, .. } if requester == C
    ));
    assert!(fleet.sent("deny_request").is_empty());

    fleet.run_until_quiet(20).unwrap();
    assert!(fleet.server(C).world().objects.contains(o));
    assert_eq!(fleet.owners_of(o), vec![C]);
}

#[test]
fn higher_priority_request_is_served_first() {
    let mut fleet = Fleet::new(&[A, B, C]);
    let o = fleet.server_mut(A).spawn(SHIP, "o", None).unwrap();

    fleet.inject(request(B, A, o, 3, MigrationIntent::Borrow));
    fleet.inject(request(C, A, o, 7, MigrationIntent::Borrow));
    fleet.run_until_quiet(20).unwrap();

    let snapshots: Vec<ServerId> = fleet.sent("snapshot").iter().map(|e| e.to).collect();
    assert_eq!(snapshots, vec![C, B]);
    assert!(fleet.server(B).world().objects.contains(o));
    // Borrowing never moves ownership.
    assert_eq!(fleet.owners_of(o), Vec::<ServerId>::new());
    assert_eq!(fleet.server(B).world().registry.owner_of(o), A);
}

#[test]
fn work_fetches_its_dependency_and_completes() {
    let mut fleet = Fleet::new(&[A, B]);
    let remote = fleet.server_mut(A).spawn(SHIP, "remote", None).unwrap();
    let local = fleet.server_mut(B).spawn(SHIP, "local", None).unwrap();

    fleet.server_mut(B).enqueue("copy hp", true, move |txn| {
        let hp = txn.get_field(remote, "hp")?.as_int().unwrap_or(0);
        txn.set_field(local, "seen_hp", hp)
    });
    fleet.run_until_quiet(20).unwrap();

    let b = fleet.server(B);
    assert!(b.executor().is_empty());
    assert_eq!(b.executor().stats().aborts, 1);
    assert_eq!(b.world().objects.get(local).unwrap().get("seen_hp"), Some(&Value::Int(100)));
    assert_eq!(
        b.world().objects.get(remote).unwrap().get("last_migration"),
        Some(&Value::from("borrowed"))
    );
    assert_eq!(fleet.owners_of(remote), Vec::<ServerId>::new());
    assert_eq!(fleet.owners_of(local), vec![B]);
}

#[test]
fn borrowed_object_comes_home() {
    let mut fleet = Fleet::new(&[A, B]);
    let o = fleet.server_mut(A).spawn(SHIP, "o", None).unwrap();

    fleet.inject(request(B, A, o, 1, MigrationIntent::Borrow));
    fleet.run_until_quiet(10).unwrap();
    assert!(fleet.server_mut(B).return_borrowed(o).unwrap());
    fleet.run_until_quiet(10).unwrap();

    let a = fleet.server(A);
    assert!(a.world().objects.contains(o));
    assert_eq!(a.recent_migrations().last().unwrap().recv_type(), RecvType::ReturnedLoan);
    assert_eq!(fleet.owners_of(o), vec![A]);
}

#[test]
fn request_from_current_resident_is_denied_with_hint() {
    let mut fleet = Fleet::new(&[A, B, C]);
    let o = fleet.server_mut(A).spawn(SHIP, "o", None).unwrap();
    fleet.inject(request(B, A, o, 1, MigrationIntent::Borrow));
    fleet.run_until_quiet(10).unwrap();

    // B asks A again for what it already holds: A points back at B.
    fleet.inject(request(B, A, o, 1, MigrationIntent::Borrow));
    fleet.step(A).unwrap();
    fleet.route();
    let deny = fleet.sent("deny_request");
    assert_eq!(deny.len(), 1);
    assert!(matches!(
        deny[0].message,
        PeerMessage::DenyRequest { resident_hint: Some(ResidentHint { server, .. }), .. } if server == B
    ));
}
