mod common;

use std::{sync::Arc, time::Duration};

use common::{TestMap, await_until, free_port};
use meshmap::{ReplicationConfig, TcpReplicator};

fn start(map: &TestMap, cfg: ReplicationConfig) -> TcpReplicator {
    TcpReplicator::start(cfg, Arc::new(map.clone()), Arc::new(map.clone()))
        .expect("replicator failed to start")
}

#[test]
fn put_on_one_peer_appears_on_the_other() {
    let addr = free_port();
    let m1 = TestMap::new(1);
    let m2 = TestMap::new(2);
    let _r1 = start(&m1, ReplicationConfig::new(1).with_server(addr).with_heartbeat_interval_ms(500));
    let _r2 = start(
        &m2,
        ReplicationConfig::new(2).with_endpoints([addr]).with_heartbeat_interval_ms(500),
    );

    m1.put("a", "1");

    assert!(await_until(Duration::from_secs(10), || m2.get("a").as_deref() == Some("1")));
    assert_eq!(m2.len(), 1);
    assert_eq!(m2.origin_of("a"), Some(1));
}

#[test]
fn backlog_written_before_connect_is_replayed() {
    let addr = free_port();
    let m1 = TestMap::new(1);
    let m2 = TestMap::new(2);

    // Writes land before any peer exists; the handshake bootstrap replays
    // them.
    m1.put("k1", "v1");
    m1.put("k2", "v2");
    m2.put("k3", "v3");

    let _r1 = start(&m1, ReplicationConfig::new(1).with_server(addr).with_heartbeat_interval_ms(500));
    let _r2 = start(
        &m2,
        ReplicationConfig::new(2).with_endpoints([addr]).with_heartbeat_interval_ms(500),
    );

    assert!(await_until(Duration::from_secs(10), || {
        m2.get("k1").as_deref() == Some("v1")
            && m2.get("k2").as_deref() == Some("v2")
            && m1.get("k3").as_deref() == Some("v3")
    }));
    assert_eq!(m1.len(), 3);
    assert_eq!(m2.len(), 3);
}

#[test]
fn latest_write_wins_with_identifier_tie_break() {
    let addr = free_port();
    let m1 = TestMap::new(1);
    let m2 = TestMap::new(2);

    // Same wall-clock timestamp on both sides: the higher identifier wins
    // everywhere.
    m1.put_at("k", "from-1", 5_000);
    m2.put_at("k", "from-2", 5_000);
    // A strictly newer write beats a higher identifier.
    m2.put_at("newer", "stale", 5_000);
    m1.put_at("newer", "fresh", 6_000);

    let _r1 = start(&m1, ReplicationConfig::new(1).with_server(addr).with_heartbeat_interval_ms(500));
    let _r2 = start(
        &m2,
        ReplicationConfig::new(2).with_endpoints([addr]).with_heartbeat_interval_ms(500),
    );

    assert!(await_until(Duration::from_secs(10), || {
        m1.get("k").as_deref() == Some("from-2")
            && m2.get("k").as_deref() == Some("from-2")
            && m1.get("newer").as_deref() == Some("fresh")
            && m2.get("newer").as_deref() == Some("fresh")
    }));
}
