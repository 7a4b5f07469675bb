use super::*;
use crate::oop::Oop;

#[test]
fn vm_block_queue_is_fifo() {
    let mut scheduler = Scheduler::new();
    scheduler.enqueue_vm_block(Oop::int(1));
    scheduler.enqueue_vm_block(Oop::int(2));
    assert_eq!(scheduler.dequeue_vm_block(), Some(Oop::int(1)));
    assert_eq!(scheduler.dequeue_vm_block(), Some(Oop::int(2)));
    assert_eq!(scheduler.dequeue_vm_block(), None);
}

#[test]
fn vm_block_queue_rejects_past_capacity() {
    let mut scheduler = Scheduler::new();
    for i in 0..QUEUE_DEPTH {
        assert!(scheduler.enqueue_vm_block(Oop::int(i as isize)));
    }
    assert!(!scheduler.enqueue_vm_block(Oop::int(999)));
}

#[test]
fn high_priority_external_item_jumps_the_queue() {
    let mut scheduler = Scheduler::new();
    scheduler.enqueue_item(ExternalItem {
        block: Oop::int(1),
        arg: Oop::int(0),
        high_priority: false,
    });
    scheduler.enqueue_item(ExternalItem {
        block: Oop::int(2),
        arg: Oop::int(0),
        high_priority: true,
    });
    scheduler.promote_one_external_item();
    assert_eq!(scheduler.dequeue_vm_block(), Some(Oop::int(2)));
}

#[test]
fn run_block_after_enqueues_once_its_countdown_elapses() {
    let mut scheduler = Scheduler::new();
    scheduler.run_block_after(Oop::int(42), 3);
    for _ in 0..2 {
        scheduler.tick();
        assert!(!scheduler.has_vm_block());
    }
    scheduler.tick();
    assert_eq!(scheduler.dequeue_vm_block(), Some(Oop::int(42)));
}

#[test]
fn dequeueing_the_last_block_clears_the_interrupt_flag() {
    let mut scheduler = Scheduler::new();
    scheduler.enqueue_vm_block(Oop::int(1));
    scheduler.request_interrupt();
    scheduler.dequeue_vm_block();
    assert!(!scheduler.is_interrupted());
}
