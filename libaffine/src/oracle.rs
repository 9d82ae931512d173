/// Group identification
///
/// The mapping from request size to group index is produced offline from the
/// profiler's locality graph and supplied by the embedder at startup. Until
/// one is installed, a refusing default forwards oversized requests to libc
/// and treats any other routed request as a deployment error.

use once_cell::sync::OnceCell;

use crate::MAX_SIZE;

/// Size → group index in `0..NUM_GROUPS`, or -1 to forward to libc. Sizes
/// above `MAX_SIZE` must return -1.
pub type GroupOracle = fn(size: usize) -> i32;

static ORACLE: OnceCell<GroupOracle> = OnceCell::new();

/// Install the embedder's oracle. Only the first call takes effect; returns
/// whether this call installed it.
pub fn set_group_oracle(oracle: GroupOracle) -> bool {
    ORACLE.set(oracle).is_ok()
}

pub fn get_group_id(size: usize) -> i32 {
    match ORACLE.get() {
        Some(oracle) => oracle(size),
        None => refuse(size),
    }
}

fn refuse(size: usize) -> i32 {
    if size > MAX_SIZE {
        return -1;
    }
    fatal!("error: could not find a valid implementation of 'get_group_id'");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NUM_GROUPS;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static CURRENT_GROUP: AtomicUsize = AtomicUsize::new(0);

    fn rotating_oracle(size: usize) -> i32 {
        if size > MAX_SIZE {
            return -1;
        }
        (CURRENT_GROUP.load(Ordering::Relaxed) % NUM_GROUPS) as i32
    }

    #[test]
    fn test_oracle_installs_once_and_routes() {
        assert!(set_group_oracle(rotating_oracle));
        assert!(!set_group_oracle(rotating_oracle));

        CURRENT_GROUP.store(2, Ordering::Relaxed);
        assert_eq!(get_group_id(64), 2);
        // Oversized requests always fall through to libc.
        assert_eq!(get_group_id(MAX_SIZE + 1), -1);
    }
}
