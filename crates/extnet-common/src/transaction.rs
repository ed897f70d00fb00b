//! Unit-of-work helper with commit/rollback semantics.

use tracing::trace;

/// Runs `work` against a staged copy of `state`.
///
/// If `work` returns `Ok`, the staged copy replaces `state` (commit). If it
/// returns `Err`, the staged copy is discarded and `state` is left exactly as
/// it was (rollback). The caller is responsible for holding whatever lock
/// guards `state` for the duration of the call.
///
/// # Example
///
/// ```
/// use extnet_common::run_in_transaction;
///
/// let mut balance = 10_i64;
/// let r: Result<(), &str> = run_in_transaction(&mut balance, |b| {
///     *b -= 20;
///     if *b < 0 { Err("overdrawn") } else { Ok(()) }
/// });
/// assert!(r.is_err());
/// assert_eq!(balance, 10);
/// ```
pub fn run_in_transaction<T, R, E, F>(state: &mut T, work: F) -> Result<R, E>
where
    T: Clone,
    F: FnOnce(&mut T) -> Result<R, E>,
{
    let mut staged = state.clone();
    match work(&mut staged) {
        Ok(out) => {
            *state = staged;
            trace!("Transaction committed");
            Ok(out)
        }
        Err(e) => {
            trace!("Transaction rolled back");
            Err(e)
        }
    }
}
