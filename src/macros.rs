#![allow(unused_macros)]

/// Helper macro for locking items
///
/// ```rust, ignore
///  let mut table = lock!(self.views);
///  table.insert(mapping);
/// ```
macro_rules! lock {
    ($lock:expr) => {
        $lock.lock().expect("Failed to acquire lock")
    };
}
