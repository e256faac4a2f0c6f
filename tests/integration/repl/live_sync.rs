use std::sync::Arc;
use std::thread;

use entity_replication::core::{ClientId, EntityId, EntityVersion};

use crate::fixtures::rig::Rig;

#[test]
fn sync_under_live_traffic_converges() {
    let rig = Arc::new(Rig::new(4));
    let client = ClientId::random();
    let entities: Vec<EntityId> = (0..3)
        .map(|n| EntityId::new("Ledger", format!("busy-{n}")).unwrap())
        .collect();
    for (n, entity) in entities.iter().enumerate() {
        rig.create(client, n as u64 + 1, entity);
    }

    let first_tx = entities.len() as u64 + 1;
    let ops = 120u64;
    let traffic = {
        let rig = Arc::clone(&rig);
        let entities = entities.clone();
        thread::spawn(move || {
            for n in 0..ops {
                let entity = &entities[(n % 3) as usize];
                let payload = format!("k={};op-{n}", n % 4 + 1);
                rig.invoke(client, first_tx + n, entity, EntityVersion::FIRST, payload.as_bytes());
            }
        })
    };

    rig.sync();
    traffic.join().unwrap();
    for tx in first_tx..first_tx + ops {
        rig.inbox.wait_retired(client, tx);
    }
    rig.settle();

    assert_eq!(rig.active_registry.invokes(), ops as usize);
    assert_eq!(rig.passive_registry.snapshot(), rig.active_registry.snapshot());

    let Ok(rig) = Arc::try_unwrap(rig) else {
        panic!("rig still shared");
    };
    rig.shutdown();
}

#[test]
fn second_passive_sync_is_refused_while_first_is_live() {
    let rig = Rig::new(2);
    rig.sync();
    // A passive that has already synced cannot be synced again on the same stream.
    assert!(rig.active.sync_passive(rig.passive.local()).is_err());
    rig.shutdown();
}
