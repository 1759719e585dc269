/*++

Licensed under the Apache-2.0 license.

File Name:

    wait.rs

Abstract:

    File contains the cooperative polling primitive used while waiting on the
    secure element.

--*/

use std::thread;
use std::time::{Duration, Instant};

/// Poll `predicate` every `interval` until it holds or `timeout` elapses.
///
/// The caller sleeps between polls, yielding the CPU to other tasks. Returns
/// `true` when the predicate became true before the deadline. The predicate
/// is checked one final time at the deadline so a completion that lands
/// during the last sleep is not reported as a timeout.
pub fn until_timeout<F>(interval: Duration, timeout: Duration, predicate: F) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    loop {
        if predicate() {
            return true;
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return predicate();
        }
        thread::sleep(interval.min(timeout - elapsed));
    }
}
