//! Terminal output, in three tiers: `report!` carries the command's actual
//! result and always prints, `status!` is progress chatter silenced by
//! `--quiet`, and `detail!` only shows up under `-v`.

use std::sync::atomic::{AtomicU8, Ordering};

pub const QUIET: u8 = 0;
pub const NORMAL: u8 = 1;
pub const VERBOSE: u8 = 2;

static VERBOSITY: AtomicU8 = AtomicU8::new(NORMAL);

/// Resolves the `--quiet` / `-v` flags once at startup. Quiet wins.
pub fn init(quiet: bool, verbose: u8) {
    let tier = if quiet {
        QUIET
    } else if verbose > 0 {
        VERBOSE
    } else {
        NORMAL
    };
    VERBOSITY.store(tier, Ordering::Relaxed);
}

pub fn at_least(tier: u8) -> bool {
    VERBOSITY.load(Ordering::Relaxed) >= tier
}

#[macro_export]
macro_rules! report {
    ($($arg:tt)*) => {
        println!("dfat: {}", format_args!($($arg)*));
    };
}

#[macro_export]
macro_rules! status {
    ($($arg:tt)*) => {
        if $crate::ui::at_least($crate::ui::NORMAL) {
            println!("dfat: {}", format_args!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! detail {
    ($($arg:tt)*) => {
        if $crate::ui::at_least($crate::ui::VERBOSE) {
            println!("dfat: {}", format_args!($($arg)*));
        }
    };
}
