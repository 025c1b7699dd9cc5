//! Add / get / remove round trips for field listeners on a check box.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use trellis_core::widgets::CheckBox;
use trellis_core::{Listener, ReadOnlyStatusChangeEvent, ValueChangeEvent};

fn counting<E: 'static>(counter: &Arc<AtomicUsize>) -> Listener<E> {
    let counter = Arc::clone(counter);
    Listener::new(move |_: &E| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

#[test]
fn test_read_only_status_change_listener_add_get_remove() {
    let check_box = CheckBox::check_box("Agree");
    let fired = Arc::new(AtomicUsize::new(0));
    let listener = counting::<ReadOnlyStatusChangeEvent>(&fired);

    assert!(check_box.listeners().listeners::<ReadOnlyStatusChangeEvent>().is_empty());

    let handle = check_box
        .add_read_only_status_change_listener(listener.clone())
        .unwrap();
    let registered = check_box.listeners().listeners::<ReadOnlyStatusChangeEvent>();
    assert_eq!(registered.len(), 1);
    assert!(registered[0].same_as(&listener));

    assert!(check_box.remove_listener(&handle));
    assert!(check_box.listeners().listeners::<ReadOnlyStatusChangeEvent>().is_empty());
    assert!(!check_box.remove_listener(&handle));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn test_value_change_listener_add_get_remove() {
    let check_box = CheckBox::check_box("Agree");
    let fired = Arc::new(AtomicUsize::new(0));
    let listener = counting::<ValueChangeEvent<bool>>(&fired);

    let handle = check_box.add_value_change_listener(listener.clone()).unwrap();
    let registered = check_box.listeners().listeners::<ValueChangeEvent<bool>>();
    assert_eq!(registered.len(), 1);
    assert!(registered[0].same_as(&listener));

    // other event types are tracked separately
    assert!(check_box.listeners().listeners::<ReadOnlyStatusChangeEvent>().is_empty());

    assert!(check_box.remove_listener(&handle));
    assert!(check_box.listeners().listeners::<ValueChangeEvent<bool>>().is_empty());
}

#[test]
fn test_duplicate_registration_rejected() {
    let check_box = CheckBox::check_box("Agree");
    let listener = counting::<ValueChangeEvent<bool>>(&Arc::new(AtomicUsize::new(0)));

    check_box.add_value_change_listener(listener.clone()).unwrap();
    assert!(check_box.add_value_change_listener(listener).is_err());
    assert_eq!(check_box.listeners().listener_count::<ValueChangeEvent<bool>>(), 1);
}

#[test]
fn test_listeners_fire_only_on_real_change() {
    let mut check_box = CheckBox::check_box("Agree");
    let value_fired = Arc::new(AtomicUsize::new(0));
    let read_only_fired = Arc::new(AtomicUsize::new(0));
    check_box
        .add_value_change_listener(counting(&value_fired))
        .unwrap();
    check_box
        .add_read_only_status_change_listener(counting(&read_only_fired))
        .unwrap();

    check_box.set_value(false).unwrap();
    check_box.set_read_only(false).unwrap();
    assert_eq!(value_fired.load(Ordering::SeqCst), 0);
    assert_eq!(read_only_fired.load(Ordering::SeqCst), 0);

    check_box.set_value(true).unwrap();
    check_box.set_value(true).unwrap();
    check_box.set_read_only(true).unwrap();
    assert_eq!(value_fired.load(Ordering::SeqCst), 1);
    assert_eq!(read_only_fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_removed_listener_not_invoked() {
    let mut check_box = CheckBox::check_box("Agree");
    let fired = Arc::new(AtomicUsize::new(0));
    let handle = check_box
        .add_value_change_listener(counting(&fired))
        .unwrap();

    check_box.set_value(true).unwrap();
    check_box.remove_listener(&handle);
    check_box.set_value(false).unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
}
