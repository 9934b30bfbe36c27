use crate::*;

/// B lends O1 to A, C lends O2 to A. Runs until both loans have landed.
fn lend_both(fleet: &mut Fleet) -> (ObjectId, ObjectId) {
    let o1 = fleet.server_mut(B).spawn(SHIP, "o1", None).unwrap();
    let o2 = fleet.server_mut(C).spawn(SHIP, "o2", None).unwrap();
    fleet.inject(request(A, B, o1, 1, MigrationIntent::Borrow));
    fleet.inject(request(A, C, o2, 1, MigrationIntent::Borrow));
    fleet.run_until_quiet(10).unwrap();
    assert!(fleet.server(A).world().objects.contains(o1));
    assert!(fleet.server(A).world().objects.contains(o2));
    (o1, o2)
}

fn hp(fleet: &Fleet, server: ServerId, object: ObjectId) -> Option<i64> {
    fleet
        .server(server)
        .world()
        .objects
        .get(object)
        .and_then(|o| o.get("hp"))
        .and_then(Value::as_int)
}

#[test]
fn borrowed_writes_commit_once_and_keep_ownership() {
    let mut fleet = Fleet::new(&[A, B, C]);
    let (o1, o2) = lend_both(&mut fleet);

    fleet.server_mut(A).enqueue("damage both", true, move |txn| {
        for id in [o1, o2] {
            let hp = txn.get_field(id, "hp")?.as_int().unwrap_or(0);
            txn.set_field(id, "hp", hp - 10)?;
        }
        Ok(())
    });
    fleet.run_until_quiet(10).unwrap();

    let a = fleet.server(A);
    assert!(a.executor().is_empty());
    assert_eq!(a.executor().stats().completed, 1);
    assert_eq!(a.commits().stats().committed, 1);
    assert_eq!(hp(&fleet, A, o1), Some(90));
    assert_eq!(hp(&fleet, A, o2), Some(90));

    let begins: Vec<ServerId> = fleet.sent("begin").iter().map(|e| e.to).collect();
    assert_eq!(begins, vec![B, C]);
    assert_eq!(fleet.sent("ready").len(), 2);
    assert_eq!(fleet.sent("commit").len(), 2);

    // A snapshot-only commit moves no ownership.
    for (object, owner) in [(o1, B), (o2, C)] {
        assert_eq!(fleet.server(A).world().registry.owner_of(object), owner);
        assert_eq!(fleet.server(owner).world().registry.owner_of(object), owner);
    }
}

#[test]
fn denied_begin_requeues_the_unit_and_changes_nothing() {
    let mut fleet = Fleet::new(&[A, B, C]);
    let (o1, o2) = lend_both(&mut fleet);

    // C is busy servicing a stronger commit from a server outside the fleet.
    let outsider_commit = CommitId {
        initiator: OUTSIDER,
        transaction: TransactionId(1),
        attempt: 0,
    };
    fleet.inject(Envelope {
        from: OUTSIDER,
        to: C,
        message: PeerMessage::Begin {
            commit: outsider_commit,
            priority: WorkPriority::root(OUTSIDER, TransactionId(1)),
            objects: vec![o2],
            mode: CommitMode::Snapshot,
        },
    });
    fleet.deliver(C).unwrap();
    assert!(fleet.server(C).commits().serviced().is_some());

    let t = fleet.server_mut(A).enqueue("damage both", true, move |txn| {
        for id in [o1, o2] {
            let hp = txn.get_field(id, "hp")?.as_int().unwrap_or(0);
            txn.set_field(id, "hp", hp - 10)?;
        }
        Ok(())
    });
    fleet.step(A).unwrap();
    assert_eq!(fleet.server(A).executor().unit(t).unwrap().state, UnitState::AwaitingCommit);

    fleet.route();
    fleet.step(B).unwrap();
    fleet.step(C).unwrap();
    fleet.route();
    fleet.deliver(A).unwrap();

    let unit = fleet.server(A).executor().unit(t).unwrap();
    assert_eq!(unit.state, UnitState::Queued);
    assert_eq!(unit.execution_attempts, 1);
    assert!(matches!(unit.last_abort, Some(Abort::CommitDenied { .. })));
    assert_eq!(hp(&fleet, A, o1), Some(100));
    assert_eq!(fleet.server(A).world().registry.owner_of(o1), B);
    assert_eq!(fleet.server(B).world().registry.owner_of(o1), B);

    // B was told to stand down.
    fleet.route();
    let to_b = fleet
        .sent("abort")
        .into_iter()
        .filter(|e| e.to == B)
        .count();
    assert_eq!(to_b, 1);
    fleet.deliver(B).unwrap();
    assert!(!fleet.server(B).commits().is_active());
}

#[test]
fn authority_commit_moves_ownership_to_the_initiator() {
    let mut fleet = Fleet::new(&[A, B]);
    let o = fleet.server_mut(B).spawn(SHIP, "o", None).unwrap();
    fleet.inject(request(A, B, o, 1, MigrationIntent::Borrow));
    fleet.run_until_quiet(10).unwrap();

    fleet.server_mut(A).enqueue("claim", true, move |txn| {
        txn.get_owned(o)?;
        txn.set_field(o, "captain", "a")
    });
    fleet.run_until_quiet(10).unwrap();

    assert!(fleet.server(A).executor().is_empty());
    assert_eq!(fleet.owners_of(o), vec![A]);
    assert_eq!(fleet.server(B).world().registry.owner_of(o), A);
}

#[test]
fn silent_participant_times_out() {
    let settings = ExecutorSettings {
        commit_timeout_ms: 0,
        ..ExecutorSettings::default()
    };
    let mut fleet = Fleet::with_settings(&[A, B], settings);
    let o = fleet.server_mut(B).spawn(SHIP, "o", None).unwrap();
    fleet.inject(request(A, B, o, 1, MigrationIntent::Borrow));
    fleet.run_until_quiet(10).unwrap();
    fleet.partition(B);

    let t = fleet
        .server_mut(A)
        .enqueue("poke", true, move |txn| txn.set_field(o, "poked", true));
    fleet.step(A).unwrap();
    assert!(fleet.server(A).commits().is_active());
    fleet.route();
    fleet.step(A).unwrap();

    let a = fleet.server(A);
    assert_eq!(a.commits().stats().aborted, 1);
    assert_eq!(a.executor().unit(t).unwrap().execution_attempts, 1);
    assert_eq!(a.world().registry.owner_of(o), B);
    assert_eq!(fleet.dropped.len(), 1);
}

#[test]
fn stray_ready_is_a_protocol_violation() {
    let mut fleet = Fleet::new(&[A, B]);
    fleet.inject(Envelope {
        from: B,
        to: A,
        message: PeerMessage::Ready {
            commit: CommitId {
                initiator: A,
                transaction: TransactionId(42),
                attempt: 0,
            },
            states: Vec::new(),
        },
    });
    assert!(matches!(
        fleet.deliver(A),
        Err(EngineError::ProtocolViolation { verb: "ready", .. })
    ));
}
