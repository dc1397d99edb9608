//! The prepare barrier (§4.5): a two-counter primitive serializing
//! generation switches against in-flight prepares. Preparers and gen
//! switchers both want exclusivity against each other but not against
//! themselves (many backends can prepare concurrently; a gen switch
//! is itself single-threaded per node). An `RwLock` doesn't fit
//! because a gen switcher and a preparer aren't symmetric: the gen
//! switcher must win any race, never starve behind a stream of
//! preparers.

use std::sync::{Condvar, Mutex};

struct State {
    n_committers: u32,
    n_prepare_holders: u32,
}

pub struct PrepareBarrier {
    state: Mutex<State>,
    cond: Condvar,
}

impl Default for PrepareBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl PrepareBarrier {
    pub fn new() -> Self {
        PrepareBarrier {
            state: Mutex::new(State {
                n_committers: 0,
                n_prepare_holders: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// A backend preparing a transaction holds this from `BEGIN` until
    /// it has either committed or aborted locally (§5). Blocks while a
    /// gen switch is in progress.
    pub fn acquire_preparer(&self) -> PreparerGuard<'_> {
        let mut st = self.state.lock().unwrap();
        while st.n_prepare_holders > 0 {
            st = self.cond.wait(st).unwrap();
        }
        st.n_committers += 1;
        drop(st);
        PreparerGuard { barrier: self }
    }

    /// A gen switch holds this plus exclusive `gen_lock` for the
    /// duration of the switch. Takes priority over waiting preparers:
    /// it increments `n_prepare_holders` immediately, so no new
    /// preparer can start while it waits for in-flight ones to drain.
    pub fn acquire_holder(&self) -> HolderGuard<'_> {
        let mut st = self.state.lock().unwrap();
        st.n_prepare_holders += 1;
        while st.n_committers > 0 {
            st = self.cond.wait(st).unwrap();
        }
        drop(st);
        HolderGuard { barrier: self }
    }
}

pub struct PreparerGuard<'a> {
    barrier: &'a PrepareBarrier,
}

impl Drop for PreparerGuard<'_> {
    fn drop(&mut self) {
        let mut st = self.barrier.state.lock().unwrap();
        st.n_committers -= 1;
        drop(st);
        self.barrier.cond.notify_all();
    }
}

pub struct HolderGuard<'a> {
    barrier: &'a PrepareBarrier,
}

impl Drop for HolderGuard<'_> {
    fn drop(&mut self) {
        let mut st = self.barrier.state.lock().unwrap();
        st.n_prepare_holders -= 1;
        drop(st);
        self.barrier.cond.notify_all();
    }
}
