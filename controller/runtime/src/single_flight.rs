use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Ensures at most one run of a task is in flight while remembering that
/// another run was requested.
///
/// Callers record a request with [`SingleFlight::request`], which also tries
/// to take the flight. Whoever holds the [`Flight`] runs the task, clearing
/// the request with [`SingleFlight::take_request`] right before doing the
/// work. After dropping the flight the holder must check
/// [`SingleFlight::is_requested`] and request again if it is set, so that a
/// request that lost the race for the flight is never lost.
#[derive(Clone, Debug, Default)]
pub struct SingleFlight(Arc<State>);

/// Held while a run is in flight. Released on drop.
#[derive(Debug)]
pub struct Flight(Arc<State>);

#[derive(Debug, Default)]
struct State {
    in_flight: AtomicBool,
    requested: AtomicBool,
}

// === impl SingleFlight ===

impl SingleFlight {
    /// Records a request and takes the flight if no run is in progress.
    pub fn request(&self) -> Option<Flight> {
        self.0.requested.store(true, Ordering::SeqCst);
        self.0
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Flight(self.0.clone()))
    }

    /// Clears the pending request, returning whether one was set.
    pub fn take_request(&self) -> bool {
        self.0.requested.swap(false, Ordering::SeqCst)
    }

    pub fn is_requested(&self) -> bool {
        self.0.requested.load(Ordering::SeqCst)
    }

    pub fn is_in_flight(&self) -> bool {
        self.0.in_flight.load(Ordering::SeqCst)
    }
}

// === impl Flight ===

impl Drop for Flight {
    fn drop(&mut self) {
        self.0.in_flight.store(false, Ordering::SeqCst);
    }
}
