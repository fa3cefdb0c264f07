use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;

#[repr(u8)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessageLevel {
    Info = 0,
    Warning = 1,
    Error = 2,
    UnrecoverableError = 3,
}

static MESSAGES_CALLBACK: Mutex<Option<fn(MessageLevel, &str)>> = Mutex::new(None);
static MIN_LEVEL: AtomicU8 = AtomicU8::new(MessageLevel::Info as u8);

/// Route all messages to a custom sink instead of stdout.
pub fn setup_logging_callback(callback: fn(MessageLevel, &str)) {
    *MESSAGES_CALLBACK.lock() = Some(callback);
}

/// Messages below this level are dropped before formatting reaches the sink.
pub fn set_min_level(level: MessageLevel) {
    MIN_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn log(level: MessageLevel, message: &str) {
    if (level as u8) < MIN_LEVEL.load(Ordering::Relaxed) {
        return;
    }

    match &*MESSAGES_CALLBACK.lock() {
        Some(callback) => callback(level, message),
        None if matches!(level, MessageLevel::UnrecoverableError) => panic!("{}", message),
        None => println!("{}", message),
    }
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::log($crate::MessageLevel::Info, &format!($($arg)*));
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::log($crate::MessageLevel::Warning, &format!($($arg)*));
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::log($crate::MessageLevel::Error, &format!($($arg)*));
    };
}
