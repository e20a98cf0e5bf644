//! Collapses concurrent requests for the same key into one operation.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Result, SyncError};

type Flight<T> = Shared<BoxFuture<'static, Result<T>>>;

/// Outcome of [`SingleFlight::run_batch`].
#[derive(Debug, Clone)]
pub struct BatchFlight<K, T> {
  /// Keys this call registered and ran the operation for
  pub claimed: Vec<K>,
  /// Keys that were already in flight elsewhere and were left alone
  pub skipped: Vec<K>,
  /// Result of the operation, `None` when every key was skipped
  pub result: Option<Result<T>>,
}

struct Registry<K, T> {
  next_id: u64,
  flights: HashMap<K, (u64, Flight<T>)>,
}

/// At most one outstanding operation per key.
///
/// Check-and-register happens under one lock, so two callers can never both
/// observe "not running" for the same key. Every caller that arrives while a
/// flight is registered awaits that flight and receives a clone of its result.
///
/// Each flight runs on its own task and unregisters its keys when it
/// resolves, success or failure. Dropping every caller does not stop it, so
/// a key can never be left registered with nobody driving its operation.
pub struct SingleFlight<K, T> {
  registry: Arc<Mutex<Registry<K, T>>>,
}

impl<K, T> Default for SingleFlight<K, T>
where
  K: Eq + Hash + Clone + Send + 'static,
  T: Clone + Send + Sync + 'static,
{
  fn default() -> Self {
    Self::new()
  }
}

impl<K, T> SingleFlight<K, T>
where
  K: Eq + Hash + Clone + Send + 'static,
  T: Clone + Send + Sync + 'static,
{
  pub fn new() -> Self {
    Self {
      registry: Arc::new(Mutex::new(Registry {
        next_id: 0,
        flights: HashMap::new(),
      })),
    }
  }

  fn lock(&self) -> Result<MutexGuard<'_, Registry<K, T>>> {
    self
      .registry
      .lock()
      .map_err(|e| SyncError::Store(format!("Lock poisoned: {}", e)))
  }

  /// Run `operation` for `key`, or join the flight already running for it.
  ///
  /// `operation` is only invoked by the caller that registers the flight.
  pub async fn run<F, Fut>(&self, key: K, operation: F) -> Result<T>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let flight = {
      let mut registry = self.lock()?;
      match registry.flights.get(&key) {
        Some((_, existing)) => existing.clone(),
        None => {
          let id = registry.claim_id();
          let flight = self.launch(id, vec![key.clone()], operation());
          registry.flights.insert(key, (id, flight.clone()));
          flight
        }
      }
    };

    flight.await
  }

  /// Run one operation covering every key in `keys` that is not already in
  /// flight.
  ///
  /// Keys already in flight are reported in `skipped` and are not awaited.
  /// The claimed keys are passed to `operation`, and the single resulting
  /// flight is registered under each of them.
  pub async fn run_batch<F, Fut>(&self, keys: Vec<K>, operation: F) -> Result<BatchFlight<K, T>>
  where
    F: FnOnce(Vec<K>) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let (claimed, skipped, flight) = {
      let mut registry = self.lock()?;
      let mut claimed: Vec<K> = Vec::new();
      let mut skipped = Vec::new();
      for key in keys {
        if registry.flights.contains_key(&key) || claimed.contains(&key) {
          skipped.push(key);
        } else {
          claimed.push(key);
        }
      }

      if claimed.is_empty() {
        return Ok(BatchFlight {
          claimed,
          skipped,
          result: None,
        });
      }

      let id = registry.claim_id();
      let flight = self.launch(id, claimed.clone(), operation(claimed.clone()));
      for key in &claimed {
        registry.flights.insert(key.clone(), (id, flight.clone()));
      }
      (claimed, skipped, flight)
    };

    let result = flight.await;
    Ok(BatchFlight {
      claimed,
      skipped,
      result: Some(result),
    })
  }

  /// Whether an operation is currently registered for `key`.
  pub fn is_in_flight(&self, key: &K) -> bool {
    self
      .lock()
      .map(|registry| registry.flights.contains_key(key))
      .unwrap_or(false)
  }

  pub fn in_flight_count(&self) -> usize {
    self.lock().map(|registry| registry.flights.len()).unwrap_or(0)
  }

  /// Spawn `operation` and hand back a shareable handle to its result.
  ///
  /// Must be called with the registry locked: the task unregisters `keys`
  /// under the same lock, so it cannot run ahead of the insert.
  fn launch<Fut>(&self, id: u64, keys: Vec<K>, operation: Fut) -> Flight<T>
  where
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let registry = Arc::clone(&self.registry);
    let task = tokio::spawn(async move {
      let result = operation.await;
      release(&registry, &keys, id);
      result
    });

    async move {
      match task.await {
        Ok(result) => result,
        Err(e) => Err(SyncError::Network(format!("Fetch task did not finish: {}", e))),
      }
    }
    .boxed()
    .shared()
  }
}

impl<K, T> Registry<K, T> {
  fn claim_id(&mut self) -> u64 {
    self.next_id = self.next_id.wrapping_add(1);
    self.next_id
  }
}

/// Unregister `keys`, but only where they still belong to flight `id`; a
/// newer flight registered after this one resolved must survive.
fn release<K: Eq + Hash, T>(registry: &Mutex<Registry<K, T>>, keys: &[K], id: u64) {
  let mut registry = match registry.lock() {
    Ok(guard) => guard,
    Err(poisoned) => poisoned.into_inner(),
  };
  for key in keys {
    if registry.flights.get(key).is_some_and(|(owner, _)| *owner == id) {
      registry.flights.remove(key);
    }
  }
}
