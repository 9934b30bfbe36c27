use crate::*;

/// A ship with a hull inside it, each pointing at the other.
fn ship_with_hull(fleet: &mut Fleet, on: ServerId) -> (ObjectId, ObjectId) {
    let server = fleet.server_mut(on);
    let ship = server.spawn(SHIP, "ship", None).unwrap();
    let hull = server.spawn(SHIP, "hull", Some(ship)).unwrap();
    let objects = &mut server.world_mut().objects;
    objects.get_mut(ship).unwrap().set("hull", hull);
    objects.get_mut(hull).unwrap().set("mothership", ship);
    objects.get_mut(hull).unwrap().set("hp", 40i64);
    (ship, hull)
}

#[test]
fn inner_request_moves_the_whole_closure() {
    let mut fleet = Fleet::new(&[A, B]);
    let (ship, hull) = ship_with_hull(&mut fleet, A);

    fleet.inject(request(B, A, hull, 1, MigrationIntent::TakeOwnership));
    fleet.run_until_quiet(10).unwrap();

    let snapshots = fleet.sent("snapshot");
    assert_eq!(snapshots.len(), 1);
    assert!(matches!(
        &snapshots[0].message,
        PeerMessage::Snapshot { snapshot, metadata }
            if snapshot.object_count() == 2 && metadata.requested == hull
    ));

    let a = fleet.server(A);
    assert!(!a.world().objects.contains(ship));
    assert!(!a.world().objects.contains(hull));

    let b = fleet.server(B);
    let arrived_ship = b.world().objects.get(ship).unwrap();
    let arrived_hull = b.world().objects.get(hull).unwrap();
    assert_eq!(arrived_hull.outer, Some(ship));
    assert_eq!(arrived_ship.get("hull"), Some(&Value::Ref(Some(hull))));
    assert_eq!(arrived_hull.get("mothership"), Some(&Value::Ref(Some(ship))));
    assert_eq!(arrived_hull.get("hp"), Some(&Value::Int(40)));
    assert_eq!(fleet.owners_of(ship), vec![B]);
    assert_eq!(fleet.owners_of(hull), vec![B]);
}

#[test]
fn round_trip_keeps_ids_and_fields() {
    let mut fleet = Fleet::new(&[A, B]);
    let (ship, hull) = ship_with_hull(&mut fleet, A);
    let before = fleet.server(A).world().objects.get(hull).unwrap().clone();

    fleet.inject(request(B, A, ship, 1, MigrationIntent::Borrow));
    fleet.run_until_quiet(10).unwrap();
    assert!(fleet.server_mut(B).return_borrowed(ship).unwrap());
    fleet.run_until_quiet(10).unwrap();

    let mut after = fleet.server(A).world().objects.get(hull).unwrap().clone();
    // The hook stamps every arrival.
    assert_eq!(after.fields.remove("last_migration"), Some(Value::from("returned_loan")));
    assert_eq!(after, before);
    assert!(!fleet.server(B).world().objects.contains(hull));
}

#[test]
fn reference_to_unknown_object_becomes_a_stub() {
    let mut fleet = Fleet::new(&[A, B, C]);
    let elsewhere = fleet.server_mut(C).spawn(SHIP, "elsewhere", None).unwrap();
    let ship = fleet.server_mut(A).spawn(SHIP, "ship", None).unwrap();
    fleet
        .server_mut(A)
        .world_mut()
        .objects
        .get_mut(ship)
        .unwrap()
        .set("escort", elsewhere);

    fleet.inject(request(B, A, ship, 1, MigrationIntent::Borrow));
    fleet.run_until_quiet(10).unwrap();

    let b = fleet.server(B);
    assert_eq!(
        b.world().objects.get(ship).unwrap().get("escort"),
        Some(&Value::Ref(Some(elsewhere)))
    );
    assert!(!b.world().objects.contains(elsewhere));
    assert!(b.world().registry.is_remote(elsewhere));
    assert_eq!(b.world().registry.resident_of(elsewhere), C);
}
