//! Bounded, prioritized admission of remote fetches.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

/// Scheduling class for a fetch. Subscriber-visible fetches outrank
/// background revalidations; within a class, first come first served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPriority {
  Foreground,
  Background,
}

impl FetchPriority {
  fn rank(self) -> u8 {
    match self {
      FetchPriority::Foreground => 1,
      FetchPriority::Background => 0,
    }
  }
}

/// Bounds concurrent fetches across all keys. Excess acquires queue in
/// priority order; dropping a queued acquire future abandons its slot
/// without side effects.
pub struct RequestScheduler {
  max_concurrent: usize,
  state: Mutex<SchedState>,
}

struct SchedState {
  running: usize,
  next_ticket: u64,
  queue: BinaryHeap<Waiter>,
}

struct Waiter {
  priority: FetchPriority,
  ticket: u64,
  tx: oneshot::Sender<Permit>,
}

impl PartialEq for Waiter {
  fn eq(&self, other: &Self) -> bool {
    self.ticket == other.ticket
  }
}

impl Eq for Waiter {}

impl Ord for Waiter {
  fn cmp(&self, other: &Self) -> Ordering {
    // Higher priority wins; within a class, the older ticket wins.
    self
      .priority
      .rank()
      .cmp(&other.priority.rank())
      .then_with(|| other.ticket.cmp(&self.ticket))
  }
}

impl PartialOrd for Waiter {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

/// Held while a fetch is in flight; releasing it (by drop) admits the
/// next queued fetch.
pub struct Permit {
  sched: Option<Arc<RequestScheduler>>,
}

impl Drop for Permit {
  fn drop(&mut self) {
    if let Some(sched) = self.sched.take() {
      RequestScheduler::release(&sched);
    }
  }
}

impl RequestScheduler {
  pub fn new(max_concurrent: usize) -> Arc<Self> {
    Arc::new(Self {
      max_concurrent: max_concurrent.max(1),
      state: Mutex::new(SchedState {
        running: 0,
        next_ticket: 0,
        queue: BinaryHeap::new(),
      }),
    })
  }

  /// Wait for a fetch slot. Resolves immediately while fewer than
  /// `max_concurrent` permits are out.
  pub async fn acquire(self: &Arc<Self>, priority: FetchPriority) -> Permit {
    let rx = {
      let mut st = self.state.lock().expect("scheduler lock poisoned");
      if st.running < self.max_concurrent {
        st.running += 1;
        return Permit {
          sched: Some(Arc::clone(self)),
        };
      }

      let (tx, rx) = oneshot::channel();
      let ticket = st.next_ticket;
      st.next_ticket += 1;
      st.queue.push(Waiter {
        priority,
        ticket,
        tx,
      });
      rx
    };

    match rx.await {
      Ok(permit) => permit,
      // The scheduler itself went away; nothing left to account against.
      Err(_) => Permit { sched: None },
    }
  }

  /// Permits currently out. Exposed for tests and diagnostics.
  pub fn running(&self) -> usize {
    self.state.lock().expect("scheduler lock poisoned").running
  }

  fn release(sched: &Arc<Self>) {
    let mut st = sched.state.lock().expect("scheduler lock poisoned");
    while let Some(waiter) = st.queue.pop() {
      let permit = Permit {
        sched: Some(Arc::clone(sched)),
      };
      match waiter.tx.send(permit) {
        // Handed off; the running count carries over to the waiter.
        Ok(()) => return,
        Err(mut lost) => {
          // Waiter cancelled its acquire; defuse the permit so dropping
          // it here does not recurse into release.
          lost.sched = None;
        }
      }
    }
    st.running -= 1;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use futures::FutureExt;
  use std::time::Duration;
  use tokio::sync::mpsc;

  #[tokio::test]
  async fn bounds_concurrency() {
    let sched = RequestScheduler::new(2);

    let p1 = sched.acquire(FetchPriority::Foreground).await;
    let _p2 = sched.acquire(FetchPriority::Foreground).await;
    assert_eq!(sched.running(), 2);

    // Third acquire queues
    let sched2 = Arc::clone(&sched);
    let pending = tokio::spawn(async move {
      let _p = sched2.acquire(FetchPriority::Foreground).await;
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!pending.is_finished());

    drop(p1);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(pending.is_finished());
  }

  #[tokio::test]
  async fn foreground_outranks_background() {
    let sched = RequestScheduler::new(1);
    let gate = sched.acquire(FetchPriority::Foreground).await;

    let (tx, mut rx) = mpsc::unbounded_channel();

    let bg_sched = Arc::clone(&sched);
    let bg_tx = tx.clone();
    tokio::spawn(async move {
      let _p = bg_sched.acquire(FetchPriority::Background).await;
      let _ = bg_tx.send("background");
      tokio::time::sleep(Duration::from_millis(20)).await;
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let fg_sched = Arc::clone(&sched);
    tokio::spawn(async move {
      let _p = fg_sched.acquire(FetchPriority::Foreground).await;
      let _ = tx.send("foreground");
      tokio::time::sleep(Duration::from_millis(20)).await;
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    // The background fetch queued first, but the foreground one runs first.
    drop(gate);
    assert_eq!(rx.recv().await, Some("foreground"));
    assert_eq!(rx.recv().await, Some("background"));
  }

  #[tokio::test]
  async fn dropping_queued_acquire_is_side_effect_free() {
    let sched = RequestScheduler::new(1);
    let gate = sched.acquire(FetchPriority::Foreground).await;

    // Poll once so the waiter enters the queue, then drop the future.
    let mut queued = Box::pin(sched.acquire(FetchPriority::Background));
    assert!(queued.as_mut().now_or_never().is_none());
    drop(queued);

    drop(gate);
    tokio::time::sleep(Duration::from_millis(5)).await;

    // The cancelled waiter must not hold the slot.
    assert_eq!(sched.running(), 0);
    let _p = sched.acquire(FetchPriority::Foreground).await;
    assert_eq!(sched.running(), 1);
  }
}
