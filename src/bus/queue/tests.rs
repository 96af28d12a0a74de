use super::*;

#[test]
fn test_fifo_order() {
    let mut queue = OutboundQueue::new(4, BackpressurePolicy::RejectNewest);
    for n in 1..=3 {
        assert_eq!(queue.push(n), Ok(Enqueued::Queued));
    }

    assert_eq!(queue.len(), 3);
    assert_eq!(queue.drain(), vec![1, 2, 3]);
    assert!(queue.is_empty());
}

#[test]
fn test_reject_newest_when_full() {
    let mut queue = OutboundQueue::new(2, BackpressurePolicy::RejectNewest);
    queue.push("m1").unwrap();
    queue.push("m2").unwrap();

    assert_eq!(queue.push("m3"), Err(QueueFull { capacity: 2 }));
    assert_eq!(queue.drain(), vec!["m1", "m2"]);
}

#[test]
fn test_drop_oldest_when_full() {
    let mut queue = OutboundQueue::new(2, BackpressurePolicy::DropOldest);
    queue.push("m1").unwrap();
    queue.push("m2").unwrap();

    assert_eq!(queue.push("m3"), Ok(Enqueued::QueuedWithEviction("m1")));
    assert_eq!(queue.drain(), vec!["m2", "m3"]);
}

#[test]
fn test_zero_capacity_refuses_under_both_policies() {
    for policy in [BackpressurePolicy::RejectNewest, BackpressurePolicy::DropOldest] {
        let mut queue = OutboundQueue::new(0, policy);
        assert_eq!(queue.push(1), Err(QueueFull { capacity: 0 }));
        assert!(queue.is_empty());
    }
}

#[test]
fn test_restore_front_keeps_order_ahead_of_new_entries() {
    let mut queue = OutboundQueue::new(4, BackpressurePolicy::RejectNewest);
    queue.push(1).unwrap();
    queue.push(2).unwrap();
    queue.push(3).unwrap();

    let mut flushing = queue.drain();
    let unsent = flushing.split_off(1);
    queue.push(4).unwrap();
    queue.restore_front(unsent);

    assert_eq!(queue.drain(), vec![2, 3, 4]);
}

#[test]
fn test_clear_reports_dropped() {
    let mut queue = OutboundQueue::new(3, BackpressurePolicy::DropOldest);
    queue.push('a').unwrap();
    queue.push('b').unwrap();

    assert_eq!(queue.clear(), 2);
    assert_eq!(queue.clear(), 0);
    assert_eq!(queue.capacity(), 3);
    assert_eq!(queue.policy(), BackpressurePolicy::DropOldest);
}
