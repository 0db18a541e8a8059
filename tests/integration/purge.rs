//! Integration test: history purge.
//!
//! The purge scheduler shares the store and the entry locks with the
//! replication domain. It drops expired facts without touching values, and
//! never loses a write that races with it.

use std::sync::Arc;
use std::time::Duration;

use burrow_historical::NeverAbandon;
use burrow_integration_tests::{T0, Topology, attr, attrs, dn, values_of};
use burrow_purge::{PurgeConfig, PurgeScheduler};
use burrow_types::{Clock, ManualClock, Modification};

fn scheduler(t: &Topology, i: usize, clock: Arc<dyn Clock>, delay: Duration) -> PurgeScheduler {
    let domain = t.domain(i);
    PurgeScheduler::new(
        domain.store().clone(),
        domain.locks().clone(),
        clock,
        PurgeConfig {
            delay,
            interval: Duration::from_secs(3600),
            max_duration: None,
        },
    )
}

/// The user.1 walk-through: retained while inside the window of the
/// newest fact, gone once past it.
#[test]
fn test_scheduled_purge_of_user_history() {
    let t = Topology::new(&[1]);
    let domain = t.domain(0);
    let user = dn("uid=user.1,o=example");
    domain
        .add(
            &user,
            attrs(&[
                ("objectclass", &["top", "person", "organizationalPerson", "inetOrgPerson"]),
                ("uid", &["user.1"]),
                ("cn", &["Aaccf Amar"]),
                ("sn", &["Amar"]),
                ("description", &["Initial description"]),
                ("displayname", &["1"]),
            ]),
        )
        .unwrap();

    t.clock(0).advance(10);
    domain
        .modify(
            &user,
            &[
                Modification::add(attr("cn;lang-en"), &["Aaccf Amar", "Aaccf A Amar"]),
                Modification::replace(attr("description"), &["replaced description"]),
                Modification::add(attr("displayname"), &["2"]),
                Modification::delete(attr("displayname"), &["1"]),
            ],
            &NeverAbandon,
        )
        .unwrap();
    t.clock(0).advance(10);
    domain
        .modify(
            &user,
            &[Modification::replace(attr("displayname"), &["2"])],
            &NeverAbandon,
        )
        .unwrap();
    t.clock(0).advance(1000);
    domain
        .modify(
            &user,
            &[Modification::replace(attr("displayname"), &["3"])],
            &NeverAbandon,
        )
        .unwrap();
    let last_change = t.clock(0).now_ms();
    let history_len = || {
        domain
            .entry(&user)
            .unwrap()
            .unwrap()
            .historical_values()
            .len()
    };
    // The displayname facts overridden by the last replace are still there.
    assert_eq!(history_len(), 7);

    let wall = Arc::new(ManualClock::new(last_change + 200));
    let purge = scheduler(&t, 0, wall.clone(), Duration::from_millis(1000));

    let report = purge.purge_pass().unwrap();
    assert!(report.completed);
    assert_eq!(history_len(), 1, "the newest fact is inside the window");
    // The suffix entry's creation fact goes too.
    assert_eq!(report.values_purged, 6 + 1);

    wall.set(last_change + 1200);
    let report = purge.purge_pass().unwrap();
    assert_eq!(report.values_purged, 1);
    assert_eq!(history_len(), 0);
    assert_eq!(purge.total_purged(), 8);

    let entry = domain.entry(&user).unwrap().unwrap();
    assert_eq!(values_of(&entry, "displayname"), vec!["3"]);
    assert_eq!(values_of(&entry, "description"), vec!["replaced description"]);
    assert_eq!(
        values_of(&entry, "cn;lang-en"),
        vec!["Aaccf A Amar", "Aaccf Amar"]
    );
}

#[test]
#[ntest::timeout(30000)]
fn test_purge_never_loses_racing_writes() {
    let t = Topology::new(&[1]);
    let domain = t.domain(0);
    let target = dn("cn=busy,o=example");
    domain
        .add(&target, attrs(&[("cn", &["busy"]), ("sn", &["Busy"])]))
        .unwrap();

    // Facts expire as soon as the wall clock moves past them.
    let purge = scheduler(&t, 0, Arc::new(ManualClock::new(T0 + 1_000)), Duration::ZERO);

    std::thread::scope(|s| {
        s.spawn(|| {
            for i in 0..50 {
                t.clock(0).advance(1);
                let value = format!("v{i}");
                domain
                    .modify(
                        &target,
                        &[Modification::add(attr("description"), &[value.as_str()])],
                        &NeverAbandon,
                    )
                    .unwrap();
            }
        });
        s.spawn(|| {
            for _ in 0..50 {
                purge.purge_pass().unwrap();
            }
        });
    });

    let entry = domain.entry(&target).unwrap().unwrap();
    assert_eq!(entry.values(&attr("description")).len(), 50);
    assert_eq!(purge.passes(), 50);
}

#[test]
fn test_replicas_keep_converging_after_purge() {
    let mut t = Topology::new(&[1, 2]);
    let target = dn("cn=long,o=example");
    let create = t
        .domain(0)
        .add(&target, attrs(&[("cn", &["long"]), ("description", &["old"])]))
        .unwrap();
    t.broadcast(0, &create);

    let delay = Duration::from_secs(60);
    for i in 0..t.len() {
        let wall = Arc::new(ManualClock::new(T0 + 3_600_000));
        scheduler(&t, i, wall, delay).purge_pass().unwrap();
    }
    t.assert_converged();
    assert!(t.replica(0).state(&target).unwrap().history.is_empty());

    t.clock(0).set(T0 + 3_600_010);
    t.clock(1).set(T0 + 3_600_011);
    let m1 = t
        .domain(0)
        .modify(
            &target,
            &[Modification::replace(attr("description"), &["new"])],
            &NeverAbandon,
        )
        .unwrap();
    let m2 = t
        .domain(1)
        .modify(
            &target,
            &[Modification::add(attr("description"), &["newer"])],
            &NeverAbandon,
        )
        .unwrap();
    t.broadcast(1, &m2);
    t.broadcast(0, &m1);
    t.assert_converged();

    let entry = t.domain(1).entry(&target).unwrap().unwrap();
    assert_eq!(values_of(&entry, "description"), vec!["new", "newer"]);
}
