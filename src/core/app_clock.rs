/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Coarse application clock.
//!
//! The response cache and data loader check expiry on every lookup; a
//! background task refreshing an atomic keeps those checks off the syscall
//! path. Resolution is ~10ms which is far below any cache TTL.

use std::ops::Add;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Once, OnceLock};
use std::time::Duration;
use tokio::time::Instant;

static START_INSTANT: OnceLock<Instant> = OnceLock::new();
static GLOBAL_NOW: AtomicU64 = AtomicU64::new(0);
static CLOCK_INIT: Once = Once::new();

pub struct AppClock {}

impl AppClock {
    /// Start the background refresh task. Idempotent.
    pub fn start() {
        CLOCK_INIT.call_once(|| {
            let base = *START_INSTANT.get_or_init(Instant::now);

            tokio::spawn(async move {
                loop {
                    GLOBAL_NOW.store(base.elapsed().as_millis() as u64, Ordering::Relaxed);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            });
        })
    }

    pub fn now() -> Instant {
        let base = START_INSTANT.get_or_init(Instant::now);
        base.add(AppClock::run_dur())
    }

    /// Milliseconds elapsed since process start.
    ///
    /// Falls back to a direct read while the refresh task has not yet
    /// published a value (startup, unit tests without the task).
    pub fn run_millis() -> u64 {
        let cached = GLOBAL_NOW.load(Ordering::Relaxed);
        if cached == 0 {
            let base = START_INSTANT.get_or_init(Instant::now);
            return base.elapsed().as_millis() as u64;
        }
        cached
    }

    pub fn run_dur() -> Duration {
        Duration::from_millis(Self::run_millis())
    }
}

#[tokio::test]
async fn clock_advances() {
    AppClock::start();

    let first = AppClock::run_millis();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(AppClock::run_millis() >= first);
}
