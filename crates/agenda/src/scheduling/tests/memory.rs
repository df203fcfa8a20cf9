use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::common::*;
use crate::scheduling::domain::{Appointment, AppointmentId, AppointmentStatus, TimeSlot};
use crate::scheduling::memory::InMemoryStore;
use crate::scheduling::repository::{
    booked_length, AppointmentRepository, RepositoryError, SchedulingStore, TransactionScope,
};

fn slot(day: u32, hour: u32, minute: u32, minutes: i64) -> TimeSlot {
    TimeSlot::new(at(day, hour, minute), chrono::Duration::minutes(minutes))
}

#[test]
fn dropped_transaction_rolls_back() {
    let store = InMemoryStore::new();
    {
        let mut tx = store
            .begin(TransactionScope::staff([staff_x()]))
            .expect("begin");
        tx.save(stored_appointment("apt-a", staff_x(), at(10, 9, 0), 60))
            .expect("staged");
        assert!(tx
            .get(&AppointmentId("apt-a".to_string()))
            .expect("get")
            .is_some());
    }

    assert!(committed(&store).is_empty());
}

#[test]
fn writes_outside_the_scope_are_refused() {
    let store = InMemoryStore::new();

    let mut tx = store
        .begin(TransactionScope::staff([staff_x()]))
        .expect("begin");
    let error = tx
        .save(stored_appointment("apt-a", staff_y(), at(10, 9, 0), 60))
        .expect_err("staff y not held");
    assert!(matches!(error, RepositoryError::ScopeViolation(id) if id == staff_y()));
    drop(tx);

    let mut read_only = store.begin(TransactionScope::ReadOnly).expect("begin");
    let error = read_only
        .save(stored_appointment("apt-a", staff_x(), at(10, 9, 0), 60))
        .expect_err("read-only");
    assert!(matches!(error, RepositoryError::ReadOnly));
}

#[test]
fn moving_an_appointment_requires_both_staff_members() {
    let store = InMemoryStore::new();
    seed(&store, stored_appointment("apt-a", staff_x(), at(10, 9, 0), 60));

    let mut tx = store
        .begin(TransactionScope::staff([staff_y()]))
        .expect("begin");
    let mut moved = stored_appointment("apt-a", staff_y(), at(10, 9, 0), 60);
    let error = tx.save(moved.clone()).expect_err("previous staff not held");
    assert!(matches!(error, RepositoryError::ScopeViolation(id) if id == staff_x()));
    drop(tx);

    let mut tx = store
        .begin(TransactionScope::staff([staff_y(), staff_x()]))
        .expect("begin");
    moved.notes = Some("moved".to_string());
    tx.save(moved).expect("both held");
    tx.commit().expect("commit");

    let tx = store.begin(TransactionScope::ReadOnly).expect("begin");
    assert!(tx
        .find_overlapping(&staff_x(), &slot(10, 9, 0, 60), None, &booked_length)
        .expect("query")
        .is_empty());
    assert_eq!(
        tx.find_overlapping(&staff_y(), &slot(10, 9, 0, 60), None, &booked_length)
            .expect("query")
            .len(),
        1
    );
}

#[test]
fn overlap_query_uses_half_open_intervals() {
    let store = InMemoryStore::new();
    seed(&store, stored_appointment("apt-a", staff_x(), at(10, 9, 0), 60));
    let tx = store.begin(TransactionScope::ReadOnly).expect("begin");

    assert!(tx
        .find_overlapping(&staff_x(), &slot(10, 10, 0, 60), None, &booked_length)
        .expect("query")
        .is_empty());
    assert!(tx
        .find_overlapping(&staff_x(), &slot(10, 8, 0, 60), None, &booked_length)
        .expect("query")
        .is_empty());
    assert_eq!(
        tx.find_overlapping(&staff_x(), &slot(10, 8, 1, 60), None, &booked_length)
            .expect("query")
            .len(),
        1
    );
    assert!(tx
        .find_overlapping(
            &staff_x(),
            &slot(10, 9, 30, 15),
            Some(&AppointmentId("apt-a".to_string())),
            &booked_length,
        )
        .expect("query")
        .is_empty());
}

#[test]
fn overlap_query_reaches_back_across_long_appointments() {
    let store = InMemoryStore::new();
    // starts the previous evening and runs into Tuesday morning
    seed(&store, stored_appointment("apt-long", staff_x(), at(10, 17, 0), 1200));
    let tx = store.begin(TransactionScope::ReadOnly).expect("begin");

    let hits = tx
        .find_overlapping(&staff_x(), &slot(11, 12, 30, 60), None, &booked_length)
        .expect("query");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id.0, "apt-long");
}

#[test]
fn overlap_query_measures_stored_appointments_with_the_given_length() {
    let store = InMemoryStore::new();
    // booked at 60 minutes, the caller knows the service now runs a full day
    seed(&store, stored_appointment("apt-a", staff_x(), at(10, 9, 0), 60));
    let tx = store.begin(TransactionScope::ReadOnly).expect("begin");
    let full_day = |_: &Appointment| chrono::Duration::minutes(1440);

    assert!(tx
        .find_overlapping(&staff_x(), &slot(11, 8, 0, 30), None, &booked_length)
        .expect("query")
        .is_empty());
    let hits = tx
        .find_overlapping(&staff_x(), &slot(11, 8, 0, 30), None, &full_day)
        .expect("query");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id.0, "apt-a");
    assert!(tx
        .find_overlapping(&staff_x(), &slot(11, 9, 0, 30), None, &full_day)
        .expect("query")
        .is_empty());
}

#[test]
fn inactive_statuses_do_not_occupy_the_slot() {
    let store = InMemoryStore::new();
    for (id, status) in [
        ("apt-done", AppointmentStatus::Completed),
        ("apt-off", AppointmentStatus::Cancelled),
        ("apt-live", AppointmentStatus::InProgress),
    ] {
        let mut appointment = stored_appointment(id, staff_x(), at(10, 9, 0), 60);
        appointment.status = status;
        seed(&store, appointment);
    }
    let tx = store.begin(TransactionScope::ReadOnly).expect("begin");

    let hits = tx
        .find_overlapping(&staff_x(), &slot(10, 9, 0, 60), None, &booked_length)
        .expect("query");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id.0, "apt-live");
}

#[test]
fn staged_writes_are_visible_to_the_same_transaction() {
    let store = InMemoryStore::new();
    seed(&store, stored_appointment("apt-a", staff_x(), at(10, 9, 0), 60));

    let mut tx = store
        .begin(TransactionScope::staff([staff_x()]))
        .expect("begin");
    tx.delete(&AppointmentId("apt-a".to_string()))
        .expect("delete");
    tx.save(stored_appointment("apt-b", staff_x(), at(10, 9, 30), 60))
        .expect("save");

    let hits = tx
        .find_overlapping(&staff_x(), &slot(10, 9, 0, 30), None, &booked_length)
        .expect("query");
    assert!(hits.is_empty(), "apt-a is deleted, apt-b starts at 09:30");
    let hits = tx
        .find_overlapping(&staff_x(), &slot(10, 10, 0, 30), None, &booked_length)
        .expect("query");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id.0, "apt-b");
}

#[test]
fn deleting_a_missing_appointment_is_not_found() {
    let store = InMemoryStore::new();
    let mut tx = store
        .begin(TransactionScope::staff([staff_x()]))
        .expect("begin");
    assert!(matches!(
        tx.delete(&AppointmentId("apt-none".to_string())),
        Err(RepositoryError::NotFound)
    ));
}

#[test]
fn staff_locks_serialise_writers_and_release_on_drop() {
    let store = Arc::new(InMemoryStore::new().lock_timeout(Duration::from_millis(30)));

    let held = store
        .begin(TransactionScope::staff([staff_x()]))
        .expect("first writer");
    assert!(matches!(
        store.begin(TransactionScope::staff([staff_y(), staff_x()])),
        Err(RepositoryError::Timeout(_))
    ));
    assert!(store.begin(TransactionScope::staff([staff_y()])).is_ok());
    assert!(store.begin(TransactionScope::ReadOnly).is_ok());
    drop(held);

    assert!(store.begin(TransactionScope::staff([staff_x()])).is_ok());
}

#[test]
fn waiting_writer_proceeds_once_lock_is_released() {
    let store = Arc::new(InMemoryStore::new().lock_timeout(Duration::from_secs(5)));
    let held = store
        .begin(TransactionScope::staff([staff_x()]))
        .expect("first writer");

    let waiter = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            let mut tx = store
                .begin(TransactionScope::staff([staff_x()]))
                .expect("second writer");
            tx.save(stored_appointment("apt-late", staff_x(), at(10, 11, 0), 60))
                .expect("save");
            tx.commit().expect("commit");
        })
    };

    thread::sleep(Duration::from_millis(20));
    drop(held);
    waiter.join().expect("waiter finished");

    assert_eq!(committed(&store).len(), 1);
}
