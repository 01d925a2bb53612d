mod common;

use std::{sync::Arc, thread, time::Duration};

use common::{TestMap, await_until, free_port};
use meshmap::{ReplicationConfig, TcpReplicator};

fn start(map: &TestMap, cfg: ReplicationConfig) -> TcpReplicator {
    TcpReplicator::start(cfg, Arc::new(map.clone()), Arc::new(map.clone()))
        .expect("replicator failed to start")
}

#[test]
fn colliding_identifiers_never_replicate() {
    let addr = free_port();
    let m1 = TestMap::new(5);
    let m2 = TestMap::new(5);
    let _r1 = start(&m1, ReplicationConfig::new(5).with_server(addr).with_heartbeat_interval_ms(200));
    let _r2 = start(
        &m2,
        ReplicationConfig::new(5).with_endpoints([addr]).with_heartbeat_interval_ms(200),
    );

    m1.put("a", "1");

    // The handshake fails on the identifier collision and the dialer does
    // not retry; nothing may ever arrive.
    assert!(!await_until(Duration::from_secs(2), || m2.get("a").is_some()));
    thread::sleep(Duration::from_secs(1));
    assert!(m2.get("a").is_none());
    assert_eq!(m2.len(), 0);
}

#[test]
fn out_of_range_identifier_is_rejected_at_startup() {
    let cfg = ReplicationConfig::new(0).with_server(free_port());
    let map = TestMap::new(1);
    assert!(TcpReplicator::start(cfg, Arc::new(map.clone()), Arc::new(map)).is_err());
}
