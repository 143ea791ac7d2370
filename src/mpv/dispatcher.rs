//! Observer registry for unsolicited MPV events.
//!
//! Callbacks are keyed by [`Topic`] and run on the reader task, in registration
//! order. The registry lock is released before any callback runs, so callbacks
//! may register or unregister observers themselves.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_channel::Receiver;
use parking_lot::Mutex;

use super::protocol::{MpvEvent, Topic};

/// Callbacks slower than this are reported; they hold up the reader loop.
const SLOW_CALLBACK: Duration = Duration::from_millis(50);

pub type Callback = Arc<dyn Fn(&MpvEvent) + Send + Sync>;

/// Returned by [`EventDispatcher::register`]; pass it back to unregister.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObserverHandle {
  id: u64,
  topic: Topic,
}

impl ObserverHandle {
  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn topic(&self) -> &Topic {
    &self.topic
  }
}

pub struct EventDispatcher {
  next_id: AtomicU64,
  observers: Mutex<HashMap<Topic, Vec<(u64, Callback)>>>,
}

impl EventDispatcher {
  pub fn new() -> Self {
    Self {
      next_id: AtomicU64::new(1),
      observers: Mutex::new(HashMap::new()),
    }
  }

  /// Run `callback` for every event on `topic`.
  ///
  /// Callbacks run inline on the reader task and must return quickly; one that
  /// blocks stalls every reply and event behind it. Hand blocking work to
  /// [`EventDispatcher::subscribe`] or spawn it onto the runtime.
  pub fn register<F>(&self, topic: Topic, callback: F) -> ObserverHandle
  where
    F: Fn(&MpvEvent) + Send + Sync + 'static,
  {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    self
      .observers
      .lock()
      .entry(topic.clone())
      .or_default()
      .push((id, Arc::new(callback)));
    log::debug!("Registered observer #{} for {}", id, topic);
    ObserverHandle { id, topic }
  }

  /// Deliver events for `topic` through a channel instead of a callback.
  ///
  /// The channel is unbounded so a slow consumer never blocks the reader loop.
  pub fn subscribe(&self, topic: Topic) -> (ObserverHandle, Receiver<MpvEvent>) {
    let (tx, rx) = async_channel::unbounded();
    let handle = self.register(topic, move |event| {
      if tx.try_send(event.clone()).is_err() {
        log::trace!("Subscriber for {} is gone", event.topic());
      }
    });
    (handle, rx)
  }

  /// Returns false if the handle was already unregistered.
  pub fn unregister(&self, handle: &ObserverHandle) -> bool {
    let mut observers = self.observers.lock();
    let Some(callbacks) = observers.get_mut(&handle.topic) else {
      return false;
    };

    let before = callbacks.len();
    callbacks.retain(|(id, _)| *id != handle.id);
    let removed = callbacks.len() != before;
    if callbacks.is_empty() {
      observers.remove(&handle.topic);
    }
    removed
  }

  pub fn observer_count(&self, topic: &Topic) -> usize {
    self.observers.lock().get(topic).map_or(0, Vec::len)
  }

  /// Drop every registration.
  pub fn clear(&self) {
    self.observers.lock().clear();
  }

  /// Invoke every callback registered for the event's topic. Returns how many ran.
  pub fn dispatch(&self, event: &MpvEvent) -> usize {
    let topic = event.topic();
    let callbacks: Vec<Callback> = match self.observers.lock().get(&topic) {
      Some(callbacks) => callbacks.iter().map(|(_, cb)| cb.clone()).collect(),
      None => {
        log::trace!("No observers for {}", topic);
        return 0;
      }
    };

    for callback in &callbacks {
      let started = Instant::now();
      if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(event))) {
        log::error!(
          "Observer for {} panicked: {}",
          topic,
          panic_message(panic.as_ref())
        );
      }
      let elapsed = started.elapsed();
      if elapsed > SLOW_CALLBACK {
        log::warn!("Observer for {} took {:?}", topic, elapsed);
      }
    }
    callbacks.len()
  }
}

impl Default for EventDispatcher {
  fn default() -> Self {
    Self::new()
  }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
  if let Some(s) = panic.downcast_ref::<&str>() {
    s.to_string()
  } else if let Some(s) = panic.downcast_ref::<String>() {
    s.clone()
  } else {
    "non-string panic payload".to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn time_pos(value: f64) -> MpvEvent {
    MpvEvent::property_change(1, "time-pos", json!(value))
  }

  #[test]
  fn test_events_fire_in_emission_order() {
    let dispatcher = EventDispatcher::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = seen.clone();
    dispatcher.register(Topic::property("time-pos"), move |event| {
      sink.lock().push(event.value().as_f64().unwrap());
    });

    for value in [0.04, 0.08, 0.12] {
      assert_eq!(dispatcher.dispatch(&time_pos(value)), 1);
    }
    assert_eq!(*seen.lock(), vec![0.04, 0.08, 0.12]);
  }

  #[test]
  fn test_callbacks_run_in_registration_order() {
    let dispatcher = EventDispatcher::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    for label in ["first", "second", "third"] {
      let sink = seen.clone();
      dispatcher.register(Topic::event("file-loaded"), move |_| sink.lock().push(label));
    }

    dispatcher.dispatch(&MpvEvent::named("file-loaded"));
    assert_eq!(*seen.lock(), vec!["first", "second", "third"]);
  }

  #[test]
  fn test_other_topics_not_notified() {
    let dispatcher = EventDispatcher::new();
    let hits = Arc::new(Mutex::new(0));
    let sink = hits.clone();
    dispatcher.register(Topic::property("pause"), move |_| *sink.lock() += 1);

    assert_eq!(dispatcher.dispatch(&time_pos(1.0)), 0);
    assert_eq!(dispatcher.dispatch(&MpvEvent::input("pause")), 0);
    assert_eq!(*hits.lock(), 0);
  }

  #[test]
  fn test_unregister_stops_delivery() {
    let dispatcher = EventDispatcher::new();
    let hits = Arc::new(Mutex::new(0));
    let sink = hits.clone();
    let handle = dispatcher.register(Topic::property("time-pos"), move |_| *sink.lock() += 1);

    dispatcher.dispatch(&time_pos(1.0));
    assert!(dispatcher.unregister(&handle));
    assert!(!dispatcher.unregister(&handle));
    dispatcher.dispatch(&time_pos(2.0));

    assert_eq!(*hits.lock(), 1);
    assert_eq!(dispatcher.observer_count(&Topic::property("time-pos")), 0);
  }

  #[test]
  fn test_panicking_callback_is_isolated() {
    let dispatcher = EventDispatcher::new();
    let hits = Arc::new(Mutex::new(0));

    dispatcher.register(Topic::input("MBTN_LEFT"), |_| panic!("boom"));
    let sink = hits.clone();
    dispatcher.register(Topic::input("MBTN_LEFT"), move |_| *sink.lock() += 1);

    assert_eq!(dispatcher.dispatch(&MpvEvent::input("MBTN_LEFT")), 2);
    assert_eq!(dispatcher.dispatch(&MpvEvent::input("MBTN_LEFT")), 2);
    assert_eq!(*hits.lock(), 2);
  }

  #[test]
  fn test_callback_may_register_during_dispatch() {
    let dispatcher = Arc::new(EventDispatcher::new());
    let inner = dispatcher.clone();
    dispatcher.register(Topic::event("idle"), move |_| {
      inner.register(Topic::event("idle"), |_| {});
    });

    dispatcher.dispatch(&MpvEvent::named("idle"));
    assert_eq!(dispatcher.observer_count(&Topic::event("idle")), 2);
  }

  #[tokio::test]
  async fn test_subscribe_delivers_through_channel() {
    let dispatcher = EventDispatcher::new();
    let (handle, rx) = dispatcher.subscribe(Topic::property("time-pos"));

    dispatcher.dispatch(&time_pos(3.5));
    let event = rx.recv().await.unwrap();
    assert_eq!(event.value().as_f64(), Some(3.5));

    dispatcher.unregister(&handle);
    dispatcher.dispatch(&time_pos(4.0));
    assert!(rx.is_empty());
  }

  #[test]
  fn test_undrained_subscriber_never_blocks_dispatch() {
    let dispatcher = EventDispatcher::new();
    let (_handle, rx) = dispatcher.subscribe(Topic::property("time-pos"));

    let started = Instant::now();
    for i in 0..1000 {
      assert_eq!(dispatcher.dispatch(&time_pos(i as f64)), 1);
    }
    assert!(started.elapsed() < SLOW_CALLBACK * 20);
    assert_eq!(rx.len(), 1000);
    assert_eq!(rx.try_recv().unwrap().value().as_f64(), Some(0.0));
  }

  #[test]
  fn test_clear_drops_all_observers() {
    let dispatcher = EventDispatcher::new();
    dispatcher.register(Topic::property("pause"), |_| {});
    dispatcher.register(Topic::input("a"), |_| {});
    dispatcher.clear();
    assert_eq!(dispatcher.observer_count(&Topic::property("pause")), 0);
    assert_eq!(dispatcher.observer_count(&Topic::input("a")), 0);
  }
}
