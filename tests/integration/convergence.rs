//! Integration test: convergence.
//!
//! Replicas accept conflicting writes independently. Whatever order the
//! resulting messages are delivered in, every replica ends with the same
//! values and the same history.

use burrow_historical::{NeverAbandon, ReplayOutcome, UpdateMsg};
use burrow_integration_tests::{
    EntryState, T0, Topology, attr, b, dn, permutations, person, values_of,
};
use burrow_types::{Modification, Rdn};

/// Deliver `msgs` in every order to fresh observers and return the state
/// they all agree on for `target`.
fn agreed_state(t: &Topology, msgs: &[UpdateMsg], target: &str) -> Option<EntryState> {
    let mut agreed: Option<Option<EntryState>> = None;
    for (n, order) in permutations(msgs).into_iter().enumerate() {
        let observer = t.observer(100 + n as u16);
        for msg in &order {
            observer.apply(msg);
        }
        let state = observer.state(&dn(target));
        match &agreed {
            None => agreed = Some(state),
            Some(first) => assert_eq!(
                &state,
                first,
                "delivery order {:?} diverged",
                order.iter().map(|m| m.csn).collect::<Vec<_>>()
            ),
        }
    }
    agreed.flatten()
}

#[test]
fn test_three_writers_converge_in_every_order() {
    let mut t = Topology::new(&[1, 2, 3]);
    let target = "cn=shared,o=example";
    let create = t.domain(0).add(&dn(target), person("shared")).unwrap();
    t.broadcast(0, &create);

    t.clock(0).set(T0 + 10);
    t.clock(1).set(T0 + 11);
    t.clock(2).set(T0 + 12);

    let m1 = t
        .domain(0)
        .modify(
            &dn(target),
            &[Modification::add(attr("description"), &["a", "b"])],
            &NeverAbandon,
        )
        .unwrap();
    let m2 = t
        .domain(1)
        .modify(
            &dn(target),
            &[
                Modification::replace(attr("mail"), &["x@example.com"]),
                Modification::delete(attr("description"), &["a"]),
            ],
            &NeverAbandon,
        )
        .unwrap();
    let m3 = t
        .domain(2)
        .modify(
            &dn(target),
            &[
                Modification::add(attr("mail"), &["y@example.com"]),
                Modification::delete(attr("sn"), &[]),
            ],
            &NeverAbandon,
        )
        .unwrap();

    let msgs = [m1.clone(), m2.clone(), m3.clone()];
    let agreed = agreed_state(&t, &msgs, target).expect("entry exists");

    t.broadcast(0, &m1);
    t.broadcast(1, &m2);
    t.broadcast(2, &m3);
    t.assert_converged();
    assert_eq!(t.replica(0).state(&dn(target)).unwrap(), agreed);

    let entry = t.domain(2).entry(&dn(target)).unwrap().unwrap();
    assert_eq!(values_of(&entry, "description"), vec!["b"]);
    assert_eq!(values_of(&entry, "mail"), vec!["x@example.com", "y@example.com"]);
    assert!(values_of(&entry, "sn").is_empty());
    assert_eq!(values_of(&entry, "cn"), vec!["shared"]);
}

/// Replica 3 adds "A" at t, replica 4 adds "B" at t+1 to a single-valued
/// attribute: "A" wins everywhere.
#[test]
fn test_single_valued_first_writer_wins() {
    let mut t = Topology::new(&[3, 4]);
    let target = "cn=fww,o=example";
    let create = t.domain(0).add(&dn(target), person("fww")).unwrap();
    t.broadcast(0, &create);

    t.clock(0).set(T0 + 100);
    t.clock(1).set(T0 + 101);
    let a = t
        .domain(0)
        .modify(
            &dn(target),
            &[Modification::add(attr("displayName"), &["A"])],
            &NeverAbandon,
        )
        .unwrap();
    let b = t
        .domain(1)
        .modify(
            &dn(target),
            &[Modification::add(attr("displayName"), &["B"])],
            &NeverAbandon,
        )
        .unwrap();
    assert!(a.csn < b.csn);

    let agreed = agreed_state(&t, &[a.clone(), b.clone()], target).unwrap();
    assert_eq!(agreed.values["displayname"], vec!["A"]);

    t.broadcast(0, &a);
    t.broadcast(1, &b);
    t.assert_converged();
}

/// A topology whose replicas all hold `target` with `displayName: A`.
fn single_valued_topology(ids: &[u16], target: &str) -> Topology {
    let mut t = Topology::new(ids);
    let mut attributes = person("single");
    attributes.insert(attr("displayName"), vec![b("A")]);
    let create = t.domain(0).add(&dn(target), attributes).unwrap();
    t.broadcast(0, &create);
    t
}

/// Replica 1 deletes the held value, replica 2 sees that and adds "B".
/// Replica 3 is partitioned and receives the add before the delete.
#[test]
fn test_single_valued_add_after_delete_reaches_partitioned_replica() {
    let target = "cn=handover,o=example";
    let mut t = single_valued_topology(&[1, 2, 3], target);

    t.isolate(2);
    t.clock(0).set(T0 + 10);
    let delete = t
        .domain(0)
        .modify(
            &dn(target),
            &[Modification::delete(attr("displayName"), &["A"])],
            &NeverAbandon,
        )
        .unwrap();
    t.broadcast(0, &delete);

    t.clock(1).set(T0 + 20);
    let add = t
        .domain(1)
        .modify(
            &dn(target),
            &[Modification::add(attr("displayName"), &["B"])],
            &NeverAbandon,
        )
        .unwrap();
    t.broadcast(1, &add);

    t.heal(2);
    t.assert_converged();
    let entry = t.domain(2).entry(&dn(target)).unwrap().unwrap();
    assert_eq!(values_of(&entry, "displayName"), vec!["B"]);

    let agreed = agreed_state(&t, &[delete, add], target).unwrap();
    assert_eq!(agreed.values["displayname"], vec!["B"]);
}

/// Replica 3 replaces the value with "C" while replica 2, later, swaps
/// "A" for "B" in one request. Replica 1 sees the swap first.
#[test]
fn test_single_valued_swap_against_older_replace() {
    let target = "cn=swap,o=example";
    let mut t = single_valued_topology(&[1, 2, 3], target);

    t.clock(2).set(T0 + 10);
    let replace = t
        .domain(2)
        .modify(
            &dn(target),
            &[Modification::replace(attr("displayName"), &["C"])],
            &NeverAbandon,
        )
        .unwrap();
    t.clock(1).set(T0 + 20);
    let swap = t
        .domain(1)
        .modify(
            &dn(target),
            &[
                Modification::add(attr("displayName"), &["B"]),
                Modification::delete(attr("displayName"), &["A"]),
            ],
            &NeverAbandon,
        )
        .unwrap();
    assert_eq!(
        values_of(&t.domain(1).entry(&dn(target)).unwrap().unwrap(), "displayName"),
        vec!["B"]
    );

    let agreed = agreed_state(&t, &[replace.clone(), swap.clone()], target).unwrap();
    t.broadcast(1, &swap);
    t.broadcast(2, &replace);
    t.assert_converged();
    assert_eq!(t.replica(0).state(&dn(target)).unwrap(), agreed);
    assert_eq!(agreed.values["displayname"], vec!["C"]);
}

/// Every pair of single-valued operations from two replicas, delivered in
/// either order, settles on one state holding at most one value.
#[test]
fn test_single_valued_operation_pairs_converge() {
    let display = || attr("displayName");
    let ops: Vec<(&str, Vec<Modification>)> = vec![
        ("add", vec![Modification::add(display(), &["X"])]),
        ("delete held", vec![Modification::delete(display(), &["A"])]),
        ("delete all", vec![Modification::delete(display(), &[])]),
        ("replace", vec![Modification::replace(display(), &["Y"])]),
        (
            "swap",
            vec![
                Modification::add(display(), &["Z"]),
                Modification::delete(display(), &["A"]),
            ],
        ),
    ];

    let target = "cn=pair,o=example";
    for (first_name, first) in &ops {
        for (second_name, second) in &ops {
            let mut t = single_valued_topology(&[1, 2], target);
            t.clock(0).set(T0 + 10);
            t.clock(1).set(T0 + 20);
            let m1 = t.domain(0).modify(&dn(target), first, &NeverAbandon).unwrap();
            let m2 = t.domain(1).modify(&dn(target), second, &NeverAbandon).unwrap();

            let agreed = agreed_state(&t, &[m1.clone(), m2.clone()], target).unwrap();
            t.broadcast(0, &m1);
            t.broadcast(1, &m2);
            t.assert_converged();
            assert_eq!(
                t.replica(0).state(&dn(target)).unwrap(),
                agreed,
                "{first_name} then {second_name}"
            );
            let held = agreed.values.get("displayname").map_or(0, Vec::len);
            assert!(held <= 1, "{first_name} then {second_name} left {held} values");
        }
    }
}

/// Three writers mixing an add, a replace and a delete of the held value.
#[test]
fn test_single_valued_three_writers_converge() {
    let target = "cn=three,o=example";
    let mut t = single_valued_topology(&[1, 2, 3], target);

    t.clock(0).set(T0 + 10);
    t.clock(1).set(T0 + 15);
    t.clock(2).set(T0 + 20);
    let add = t
        .domain(0)
        .modify(&dn(target), &[Modification::add(attr("displayName"), &["X"])], &NeverAbandon)
        .unwrap();
    let delete = t
        .domain(1)
        .modify(
            &dn(target),
            &[Modification::delete(attr("displayName"), &["A"])],
            &NeverAbandon,
        )
        .unwrap();
    let replace = t
        .domain(2)
        .modify(
            &dn(target),
            &[Modification::replace(attr("displayName"), &["Y"])],
            &NeverAbandon,
        )
        .unwrap();

    let agreed =
        agreed_state(&t, &[add.clone(), delete.clone(), replace.clone()], target).unwrap();
    assert_eq!(agreed.values["displayname"], vec!["Y"]);

    t.broadcast(0, &add);
    t.broadcast(1, &delete);
    t.broadcast(2, &replace);
    t.assert_converged();
    assert_eq!(t.replica(0).state(&dn(target)).unwrap(), agreed);
}

#[test]
fn test_duplicate_delivery_is_idempotent() {
    let mut t = Topology::new(&[1, 2]);
    let target = "cn=dup,o=example";
    let create = t.domain(0).add(&dn(target), person("dup")).unwrap();
    t.broadcast(0, &create);

    t.clock(0).set(T0 + 10);
    let modify = t
        .domain(0)
        .modify(
            &dn(target),
            &[
                Modification::add(attr("mail"), &["a@example.com", "b@example.com"]),
                Modification::replace(attr("description"), &["fresh"]),
            ],
            &NeverAbandon,
        )
        .unwrap();
    t.broadcast(0, &modify);
    let once = t.replica(1).state(&dn(target)).unwrap();

    match t.replica(1).apply(&modify) {
        ReplayOutcome::Applied(outcome) => {
            assert_eq!(outcome.applied, 0, "a duplicate changes nothing");
            assert_eq!(outcome.ignored, 3);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(t.replica(1).state(&dn(target)).unwrap(), once);
    assert_eq!(
        t.replica(1).apply(&create),
        ReplayOutcome::Ignored(burrow_historical::IgnoreReason::Duplicate)
    );
    t.assert_converged();
}

#[test]
fn test_rename_concurrent_with_modify() {
    let mut t = Topology::new(&[1, 2]);
    let create = t.domain(0).add(&dn("cn=a,o=example"), person("a")).unwrap();
    t.broadcast(0, &create);

    t.clock(0).set(T0 + 10);
    t.clock(1).set(T0 + 11);
    let rename = t
        .domain(0)
        .modify_dn(&dn("cn=a,o=example"), Rdn::new("cn", "b"), true, None)
        .unwrap();
    let modify = t
        .domain(1)
        .modify(
            &dn("cn=a,o=example"),
            &[Modification::add(attr("description"), &["still here"])],
            &NeverAbandon,
        )
        .unwrap();

    t.broadcast(0, &rename);
    t.broadcast(1, &modify);
    t.assert_converged();

    for i in 0..t.len() {
        let entry = t.domain(i).entry(&dn("cn=b,o=example")).unwrap().unwrap();
        assert_eq!(values_of(&entry, "cn"), vec!["b"]);
        assert_eq!(values_of(&entry, "description"), vec!["still here"]);
        assert!(t.domain(i).entry(&dn("cn=a,o=example")).unwrap().is_none());
    }
}

#[test]
fn test_concurrent_renames_latest_wins() {
    let mut t = Topology::new(&[1, 2]);
    let create = t.domain(0).add(&dn("cn=a,o=example"), person("a")).unwrap();
    t.broadcast(0, &create);

    t.clock(0).set(T0 + 10);
    t.clock(1).set(T0 + 11);
    let to_b = t
        .domain(0)
        .modify_dn(&dn("cn=a,o=example"), Rdn::new("cn", "b"), true, None)
        .unwrap();
    let to_c = t
        .domain(1)
        .modify_dn(&dn("cn=a,o=example"), Rdn::new("cn", "c"), true, None)
        .unwrap();

    assert!(matches!(t.replica(0).apply(&to_c), ReplayOutcome::Applied(_)));
    assert_eq!(
        t.replica(1).apply(&to_b),
        ReplayOutcome::Ignored(burrow_historical::IgnoreReason::Stale)
    );
    t.assert_converged();
    assert!(t.domain(0).entry(&dn("cn=c,o=example")).unwrap().is_some());
}

#[test]
fn test_partitioned_replica_catches_up_out_of_order() {
    let mut t = Topology::new(&[1, 2, 3]);
    let target = "cn=part,o=example";
    let create = t.domain(0).add(&dn(target), person("part")).unwrap();
    t.broadcast(0, &create);

    t.isolate(2);
    for (i, value) in ["one", "two", "three"].iter().enumerate() {
        let writer = i % 2;
        t.clock(writer).set(T0 + 10 * (i as u64 + 1));
        let msg = t
            .domain(writer)
            .modify(
                &dn(target),
                &[Modification::replace(attr("description"), &[*value])],
                &NeverAbandon,
            )
            .unwrap();
        t.broadcast(writer, &msg);
    }
    t.clock(0).set(T0 + 40);
    let delete = t
        .domain(0)
        .modify(
            &dn(target),
            &[Modification::delete(attr("description"), &["two"])],
            &NeverAbandon,
        )
        .unwrap();
    t.broadcast(0, &delete);

    let stale = t.replica(2).state(&dn(target)).unwrap();
    assert!(!stale.values.contains_key("description"));

    t.heal(2);
    t.assert_converged();
    let entry = t.domain(2).entry(&dn(target)).unwrap().unwrap();
    assert_eq!(values_of(&entry, "description"), vec!["three"]);
}

#[test]
fn test_delete_wins_over_late_modify() {
    let mut t = Topology::new(&[1, 2]);
    let target = "cn=doomed,o=example";
    let create = t.domain(0).add(&dn(target), person("doomed")).unwrap();
    t.broadcast(0, &create);

    t.clock(0).set(T0 + 10);
    t.clock(1).set(T0 + 11);
    let delete = t.domain(0).delete(&dn(target)).unwrap();
    let modify = t
        .domain(1)
        .modify(
            &dn(target),
            &[Modification::add(attr("description"), &["too late"])],
            &NeverAbandon,
        )
        .unwrap();

    t.broadcast(0, &delete);
    t.broadcast(1, &modify);
    t.assert_converged();
    assert!(t.replica(0).state(&dn(target)).is_none());
}
