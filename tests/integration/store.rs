use crate::*;

#[test]
fn persisted_closure_is_restored_with_ownership() {
    let dir = temp_dir("restore");

    let ship = {
        let mut fleet = Fleet::new(&[A]).with_database(SnapshotStore::new(&dir).unwrap());
        let server = fleet.server_mut(A);
        let ship = server.spawn(SHIP, "ship", None).unwrap();
        server.world_mut().objects.get_mut(ship).unwrap().set("hp", 42i64);
        server.persist(ship).unwrap();
        fleet.run_until_quiet(5).unwrap();
        assert!(fleet.database().unwrap().store().has(ship));
        ship
    };

    // A restarted server knows nothing about the ship and asks the database.
    let mut fleet = Fleet::new(&[A]).with_database(SnapshotStore::new(&dir).unwrap());
    assert_eq!(fleet.database().unwrap().store().count(), 1);
    fleet.server_mut(A).enqueue("repair", true, move |txn| {
        let hp = txn.get_field(ship, "hp")?.as_int().unwrap_or(0);
        txn.set_field(ship, "hp", hp + 1)
    });
    fleet.run_until_quiet(10).unwrap();

    assert_eq!(fleet.sent("request_object")[0].to, ServerId::DATABASE);
    let a = fleet.server(A);
    assert!(a.executor().is_empty());
    assert_eq!(a.world().objects.get(ship).unwrap().get("hp"), Some(&Value::Int(43)));
    assert_eq!(a.recent_migrations().last().unwrap().recv_type(), RecvType::AssignedOwnership);
    assert_eq!(fleet.owners_of(ship), vec![A]);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn second_restore_points_at_the_holder() {
    let dir = temp_dir("holder");
    let store = SnapshotStore::new(&dir).unwrap();
    let mut fleet = Fleet::new(&[A, B]).with_database(store);
    let ship = fleet.server_mut(A).spawn(SHIP, "ship", None).unwrap();
    fleet.server_mut(A).persist(ship).unwrap();
    fleet.run_until_quiet(5).unwrap();

    fleet.inject(request(B, ServerId::DATABASE, ship, 1, MigrationIntent::TakeOwnership));
    fleet.inject(request(C, ServerId::DATABASE, ship, 1, MigrationIntent::TakeOwnership));
    fleet.run_until_quiet(10).unwrap();

    let snapshots: Vec<ServerId> = fleet
        .sent("snapshot")
        .iter()
        .filter(|e| e.from == ServerId::DATABASE)
        .map(|e| e.to)
        .collect();
    assert_eq!(snapshots, vec![B]);
    let denies = fleet.sent("deny_request");
    assert_eq!(denies.len(), 1);
    assert!(matches!(
        denies[0].message,
        PeerMessage::DenyRequest { resident_hint: Some(ResidentHint { server, .. }), .. } if server == B
    ));

    let _ = std::fs::remove_dir_all(&dir);
}
