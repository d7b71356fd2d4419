//! Reload / rollback, component 4.J.
//!
//! Grounded on `worker.c`'s `worker_conf_check`/`_load`/`_rollback` and
//! `conf.c`'s whole-file reparse on `reload`: a new configuration is
//! parsed and checked against the running state *before* anything is
//! mutated, so a bad config file (a device that shrank, a port collision)
//! is refused and the server keeps running on the old config. Every
//! reloadable component implements [`Reloadable`]; the admin `reload`
//! command runs `check` against every component first and only proceeds
//! to `commit` if every one of them passed.

/// Outcome of checking a proposed configuration against live state.
pub trait Reloadable {
    type Config;
    type Error;

    /// Validate `new` against current state without mutating anything.
    /// Returning `Ok` is a promise that `commit` with the same `new` will
    /// not fail.
    fn check(&self, new: &Self::Config) -> Result<(), Self::Error>;

    /// Apply `new`. Only called after every component's `check` passed.
    fn commit(&mut self, new: Self::Config);

    /// Restore whatever `commit` would have replaced. Only called if a
    /// later component's `check` or `commit` failed after this one already
    /// committed, unwinding in reverse order.
    fn rollback(&mut self);
}

/// Drives a two-phase reload across a heterogeneous set of components:
/// check all of them, and only if every check passes, commit all of them;
/// if a check fails partway through, nothing has been committed yet and
/// the failure is simply reported. Rollback only matters when components
/// are committed out of band (e.g. one `ReloadTransaction` per component
/// type chained together by the caller) — see `olivehc`'s `conf.rs` for
/// how the binary composes per-component transactions.
pub struct ReloadTransaction<T: Reloadable> {
    component: T,
}

impl<T: Reloadable> ReloadTransaction<T> {
    pub fn new(component: T) -> Self {
        ReloadTransaction { component }
    }

    pub fn get(&self) -> &T {
        &self.component
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.component
    }

    /// Runs `check` then `commit` if it passed. On failure, the component
    /// is left untouched (per the `Reloadable::check` contract).
    pub fn apply(&mut self, new: T::Config) -> Result<(), T::Error> {
        self.component.check(&new)?;
        self.component.commit(new);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        value: u32,
        previous: u32,
    }

    impl Reloadable for Counter {
        type Config = u32;
        type Error = &'static str;

        fn check(&self, new: &u32) -> Result<(), &'static str> {
            if *new < self.value {
                Err("cannot shrink")
            } else {
                Ok(())
            }
        }

        fn commit(&mut self, new: u32) {
            self.previous = self.value;
            self.value = new;
        }

        fn rollback(&mut self) {
            self.value = self.previous;
        }
    }

    #[test]
    fn apply_commits_a_valid_config() {
        let mut tx = ReloadTransaction::new(Counter { value: 10, previous: 10 });
        assert!(tx.apply(20).is_ok());
        assert_eq!(tx.get().value, 20);
    }

    #[test]
    fn apply_rejects_and_does_not_mutate() {
        let mut tx = ReloadTransaction::new(Counter { value: 10, previous: 10 });
        assert!(tx.apply(5).is_err());
        assert_eq!(tx.get().value, 10, "a failed check must leave state untouched");
    }

    #[test]
    fn rollback_restores_prior_value() {
        let mut tx = ReloadTransaction::new(Counter { value: 10, previous: 10 });
        tx.apply(20).unwrap();
        tx.get_mut().rollback();
        assert_eq!(tx.get().value, 10);
    }
}
