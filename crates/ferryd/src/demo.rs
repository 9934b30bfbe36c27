//! Demo workload: every server owns a ship and keeps poking its neighbour's.

use ferry_core::{MigrationContext, MigrationSide, ObjectId};
use ferry_services::{work, KindInfo, KindRegistry, KindTag, Object, Server, Value};

pub const SHIP: KindTag = KindTag(1);

fn ship_defaults() -> std::collections::BTreeMap<String, Value> {
    [("hp".to_string(), Value::Int(100)), ("scans".to_string(), Value::Int(0))]
        .into_iter()
        .collect()
}

fn ship_migrated(ship: &mut Object, ctx: &MigrationContext) {
    let how = match ctx.side {
        MigrationSide::Send => ctx.send_type().to_string(),
        MigrationSide::Receive => ctx.recv_type().to_string(),
    };
    tracing::debug!(ship = %ship.name, peer = %ctx.remote, how = %how, "ship migrated");
    ship.set("last_migration", how);
}

pub fn kinds() -> KindRegistry {
    let mut kinds = KindRegistry::new();
    kinds.register(KindInfo {
        tag: SHIP,
        name: "ship",
        defaults: ship_defaults,
        post_migrate: Some(ship_migrated),
    });
    kinds
}

/// Give each server a ship and `units` work units against its neighbour.
pub fn populate(servers: &mut [Server], units: u32) -> Vec<ObjectId> {
    let ships: Vec<ObjectId> = servers
        .iter_mut()
        .filter_map(|s| {
            let name = format!("ship-{}", s.local());
            s.spawn(SHIP, &name, None)
        })
        .collect();
    if ships.len() != servers.len() {
        tracing::warn!("ship kind missing on some servers, demo skipped");
        return ships;
    }

    let count = servers.len();
    for (i, server) in servers.iter_mut().enumerate() {
        let own = ships[i];
        let neighbour = ships[(i + 1) % count];
        let neighbour_server = neighbour.server_id();

        server.register_function("salute", move |args| {
            work(move |txn| {
                let from = args["from"].as_str().unwrap_or("?").to_string();
                txn.set_field(own, "saluted_by", from.as_str())
            })
        });

        for n in 0..units {
            if n % 2 == 0 {
                server.enqueue(format!("scan-{n}"), true, move |txn| {
                    let hp = txn.get_field(neighbour, "hp")?.as_int().unwrap_or(0);
                    let scans = txn.get_field(own, "scans")?.as_int().unwrap_or(0);
                    txn.set_field(own, "scans", scans + 1)?;
                    txn.set_field(own, "last_seen_hp", hp)
                });
            } else {
                let me = server.local().to_string();
                server.enqueue(format!("strike-{n}"), true, move |txn| {
                    let hp = txn.get_field(neighbour, "hp")?.as_int().unwrap_or(0);
                    txn.set_field(neighbour, "hp", hp - 1)?;
                    txn.invoke(neighbour_server, "salute", serde_json::json!({ "from": me }));
                    Ok(())
                });
            }
        }
    }
    ships
}
