//! Request/reply correlation.
//!
//! Every outbound command gets a request ID and a pending slot; the reader loop
//! hands each reply to [`Correlator::resolve`], which completes the slot with the
//! matching ID. Replies for IDs that are no longer pending (timed out, duplicated)
//! are dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::ipc::IpcError;
use super::protocol::MpvReply;

pub type ReplyResult = Result<MpvReply, IpcError>;

/// Pending request waiting for its reply.
struct PendingRequest {
  reply_tx: oneshot::Sender<ReplyResult>,
  /// Operation name, for logging.
  command: String,
  created_at: Instant,
}

struct Table {
  pending: HashMap<i64, PendingRequest>,
  /// Set by `cancel_all`; no request is accepted afterwards.
  closed: Option<String>,
}

/// Caller's half of a registered request.
#[derive(Debug)]
pub struct PendingReply {
  request_id: i64,
  reply_rx: oneshot::Receiver<ReplyResult>,
}

impl PendingReply {
  pub fn request_id(&self) -> i64 {
    self.request_id
  }
}

/// Tracks in-flight requests for one connection.
pub struct Correlator {
  next_id: AtomicI64,
  table: Mutex<Table>,
}

impl Correlator {
  pub fn new() -> Self {
    Self {
      next_id: AtomicI64::new(1),
      table: Mutex::new(Table {
        pending: HashMap::new(),
        closed: None,
      }),
    }
  }

  /// Register a pending request.
  ///
  /// `requested` pins the ID; otherwise the next free value of the counter is used.
  /// An ID that is still outstanding is never handed out twice.
  pub fn register(&self, command: &str, requested: Option<i64>) -> Result<PendingReply, IpcError> {
    let mut table = self.table.lock();
    if let Some(reason) = &table.closed {
      return Err(IpcError::ConnectionLost(reason.clone()));
    }

    let request_id = match requested {
      Some(id) if table.pending.contains_key(&id) => {
        return Err(IpcError::DuplicateRequestId(id));
      }
      Some(id) => id,
      None => loop {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if !table.pending.contains_key(&id) {
          break id;
        }
      },
    };

    let (reply_tx, reply_rx) = oneshot::channel();
    table.pending.insert(
      request_id,
      PendingRequest {
        reply_tx,
        command: command.to_string(),
        created_at: Instant::now(),
      },
    );

    Ok(PendingReply {
      request_id,
      reply_rx,
    })
  }

  /// Deliver a reply to its waiting caller. Returns false when nobody was waiting.
  pub fn resolve(&self, reply: MpvReply) -> bool {
    let request_id = reply.request_id;
    let pending = self.table.lock().pending.remove(&request_id);

    match pending {
      Some(request) => {
        log::debug!(
          "Reply for request_id={} ({}) after {:?}: {}",
          request_id,
          request.command,
          request.created_at.elapsed(),
          reply.error
        );
        if request.reply_tx.send(Ok(reply)).is_err() {
          log::debug!("Caller for request_id={} went away before the reply", request_id);
        }
        true
      }
      None => {
        log::debug!("Dropping reply for unknown request_id={}", request_id);
        false
      }
    }
  }

  /// Drop a pending request without completing it.
  pub fn forget(&self, request_id: i64) -> bool {
    self.table.lock().pending.remove(&request_id).is_some()
  }

  /// Fail every outstanding request with `ConnectionLost(reason)` and refuse new ones.
  pub fn cancel_all(&self, reason: &str) -> usize {
    let drained: Vec<(i64, PendingRequest)> = {
      let mut table = self.table.lock();
      if table.closed.is_none() {
        table.closed = Some(reason.to_string());
      }
      table.pending.drain().collect()
    };

    let count = drained.len();
    for (request_id, request) in drained {
      log::debug!("Cancelling request_id={} ({}): {}", request_id, request.command, reason);
      let _ = request
        .reply_tx
        .send(Err(IpcError::ConnectionLost(reason.to_string())));
    }
    if count > 0 {
      log::warn!("Cancelled {} pending MPV request(s): {}", count, reason);
    }
    count
  }

  /// Wait for the reply, giving up after `deadline`.
  ///
  /// On timeout the pending slot is removed so a late reply is dropped by `resolve`.
  pub async fn wait(&self, pending: PendingReply, deadline: Option<Duration>) -> ReplyResult {
    let PendingReply {
      request_id,
      reply_rx,
    } = pending;

    let received = match deadline {
      Some(after) => match tokio::time::timeout(after, reply_rx).await {
        Ok(received) => received,
        Err(_) => {
          self.forget(request_id);
          log::warn!("MPV request_id={} timed out after {:?}", request_id, after);
          return Err(IpcError::Timeout { request_id, after });
        }
      },
      None => reply_rx.await,
    };

    received.unwrap_or_else(|_| Err(IpcError::ConnectionLost("reply slot dropped".into())))
  }

  pub fn pending_count(&self) -> usize {
    self.table.lock().pending.len()
  }

  pub fn is_closed(&self) -> bool {
    self.table.lock().closed.is_some()
  }
}

impl Default for Correlator {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::collections::HashSet;
  use std::sync::Arc;

  #[test]
  fn test_ids_are_unique_and_increasing() {
    let correlator = Correlator::new();
    let a = correlator.register("a", None).unwrap();
    let b = correlator.register("b", None).unwrap();
    let c = correlator.register("c", None).unwrap();

    assert!(a.request_id() < b.request_id());
    assert!(b.request_id() < c.request_id());
    assert_eq!(correlator.pending_count(), 3);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_concurrent_registration_never_shares_ids() {
    let correlator = Arc::new(Correlator::new());
    let mut tasks = Vec::new();
    for _ in 0..8 {
      let correlator = correlator.clone();
      tasks.push(tokio::spawn(async move {
        (0..100)
          .map(|_| correlator.register("get_property", None).unwrap())
          .collect::<Vec<_>>()
      }));
    }

    let mut ids = HashSet::new();
    for task in tasks {
      for pending in task.await.unwrap() {
        assert!(ids.insert(pending.request_id()));
      }
    }
    assert_eq!(ids.len(), 800);
  }

  #[test]
  fn test_pinned_id_rejected_while_outstanding() {
    let correlator = Correlator::new();
    let _first = correlator.register("loadfile", Some(5)).unwrap();
    let err = correlator.register("loadfile", Some(5)).unwrap_err();
    assert!(matches!(err, IpcError::DuplicateRequestId(5)));

    assert!(correlator.forget(5));
    assert!(correlator.register("loadfile", Some(5)).is_ok());
  }

  #[test]
  fn test_counter_skips_pinned_ids() {
    let correlator = Correlator::new();
    let _pinned = correlator.register("x", Some(1)).unwrap();
    let auto = correlator.register("y", None).unwrap();
    assert_eq!(auto.request_id(), 2);
  }

  #[tokio::test]
  async fn test_replies_route_by_id_in_any_order() {
    let correlator = Correlator::new();
    let first = correlator.register("loadfile", None).unwrap();
    let second = correlator.register("get_property", None).unwrap();
    let (first_id, second_id) = (first.request_id(), second.request_id());

    assert!(correlator.resolve(MpvReply::success(second_id, Some(json!(true)))));
    assert!(correlator.resolve(MpvReply::success(first_id, None)));

    let second_reply = correlator.wait(second, None).await.unwrap();
    let first_reply = correlator.wait(first, None).await.unwrap();
    assert_eq!(second_reply.data, Some(json!(true)));
    assert_eq!(first_reply.request_id, first_id);
    assert_eq!(correlator.pending_count(), 0);
  }

  #[test]
  fn test_unknown_reply_is_dropped() {
    let correlator = Correlator::new();
    assert!(!correlator.resolve(MpvReply::success(9999, None)));
  }

  #[tokio::test]
  async fn test_duplicate_reply_resolves_once() {
    let correlator = Correlator::new();
    let pending = correlator.register("stop", None).unwrap();
    let id = pending.request_id();

    assert!(correlator.resolve(MpvReply::success(id, None)));
    assert!(!correlator.resolve(MpvReply::failure(id, "error")));
    assert!(correlator.wait(pending, None).await.unwrap().is_success());
  }

  #[tokio::test]
  async fn test_cancel_all_fails_every_waiter() {
    let correlator = Correlator::new();
    let a = correlator.register("a", None).unwrap();
    let b = correlator.register("b", None).unwrap();

    assert_eq!(correlator.cancel_all("connection lost"), 2);
    assert_eq!(correlator.pending_count(), 0);

    for pending in [a, b] {
      match correlator.wait(pending, Some(Duration::from_secs(1))).await {
        Err(IpcError::ConnectionLost(reason)) => assert_eq!(reason, "connection lost"),
        other => panic!("Expected ConnectionLost, got {:?}", other),
      }
    }

    // Sealed: later requests fail immediately.
    assert!(correlator.is_closed());
    assert!(matches!(
      correlator.register("c", None),
      Err(IpcError::ConnectionLost(_))
    ));
    assert_eq!(correlator.cancel_all("again"), 0);
  }

  #[tokio::test]
  async fn test_timeout_removes_pending_slot() {
    let correlator = Correlator::new();
    let pending = correlator.register("get_property", None).unwrap();
    let id = pending.request_id();

    let started = Instant::now();
    let result = correlator
      .wait(pending, Some(Duration::from_millis(50)))
      .await;
    assert!(matches!(result, Err(IpcError::Timeout { request_id, .. }) if request_id == id));
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(correlator.pending_count(), 0);

    // A late reply finds nobody waiting.
    assert!(!correlator.resolve(MpvReply::success(id, None)));
  }
}
