use crate::*;

#[test]
fn retried_unit_applies_its_writes_once() {
    let mut fleet = Fleet::new(&[A, B]);
    let remote = fleet.server_mut(A).spawn(SHIP, "remote", None).unwrap();
    let tally = fleet.server_mut(B).spawn(SHIP, "tally", None).unwrap();

    // The increment happens before the dependency read, so the first
    // attempt journals it and then aborts.
    fleet.server_mut(B).enqueue("count and look", true, move |txn| {
        let count = txn.get_field(tally, "count")?.as_int().unwrap_or(0);
        txn.set_field(tally, "count", count + 1)?;
        txn.get(remote)?;
        Ok(())
    });
    fleet.run_until_quiet(20).unwrap();

    let b = fleet.server(B);
    assert!(b.executor().is_empty());
    assert_eq!(b.executor().stats().aborts, 1);
    assert_eq!(b.world().objects.get(tally).unwrap().get("count"), Some(&Value::Int(1)));
}

#[test]
fn invoke_runs_remote_function_as_dependent_work() {
    let mut fleet = Fleet::new(&[A, B]);
    let flagship = fleet.server_mut(A).spawn(SHIP, "flagship", None).unwrap();
    fleet.server_mut(A).register_function("salute", move |args| {
        let by = args["by"].as_str().unwrap_or("nobody").to_string();
        work(move |txn| txn.set_field(flagship, "saluted_by", by.as_str()))
    });

    let t = fleet.server_mut(B).enqueue("salute a", true, |txn| {
        txn.invoke(A, "salute", serde_json::json!({ "by": "b" }));
        Ok(())
    });
    fleet.run_until_quiet(10).unwrap();

    let invokes = fleet.sent("invoke");
    assert_eq!(invokes.len(), 1);
    let expected = WorkPriority::root(B, t).dependent();
    assert!(matches!(
        &invokes[0].message,
        PeerMessage::Invoke { function, priority, .. } if function == "salute" && *priority == expected
    ));

    let a = fleet.server(A);
    assert_eq!(a.executor().stats().completed, 1);
    assert_eq!(
        a.world().objects.get(flagship).unwrap().get("saluted_by"),
        Some(&Value::from("b"))
    );
}

#[test]
fn unit_that_keeps_aborting_is_reported() {
    let settings = ExecutorSettings {
        livelock_report_interval: 2,
        ..ExecutorSettings::default()
    };
    let mut fleet = Fleet::with_settings(&[A], settings);
    let t = fleet.server_mut(A).enqueue("hopeless", true, |_txn| {
        Err(Abort::CommitDenied {
            description: "always".to_string(),
        })
    });
    for _ in 0..4 {
        fleet.step(A).unwrap();
    }

    let a = fleet.server(A);
    let unit = a.executor().unit(t).unwrap();
    assert_eq!(unit.execution_attempts, 4);
    assert_eq!(unit.state, UnitState::Queued);
    assert_eq!(a.executor().stats().livelock_reports, 2);
}

#[test]
fn abandoned_unit_leaves_no_trace() {
    let mut fleet = Fleet::new(&[A]);
    let ship = fleet.server_mut(A).spawn(SHIP, "ship", None).unwrap();
    fleet.server_mut(A).enqueue("give up", true, move |txn| {
        txn.set_field(ship, "hp", 0i64)?;
        Err(txn.abandon("target left the sector"))
    });
    fleet.run_until_quiet(5).unwrap();

    let a = fleet.server(A);
    assert!(a.executor().is_empty());
    assert_eq!(a.executor().stats().abandoned, 1);
    assert_eq!(a.world().objects.get(ship).unwrap().get("hp"), Some(&Value::Int(100)));
}
