//! Key and value primitives shared by the storage engine.
//!
//! Every stored key carries an 8-byte commit-timestamp suffix. The suffix is
//! written as `!ts` (bitwise negation, big endian) so that a plain byte
//! comparison of two suffixes orders timestamps descending: among the versions
//! of one user key, the newest sorts first.

mod key;
mod key_range;
mod value;

pub use key::{compare_key, key_with_ts, parse_ts, same_key, user_key, Key};
pub use key_range::KeyRange;
pub use value::{Value, ValuePointer, VALUE_DELETE, VALUE_POINTER};

/// Size in bytes of the timestamp suffix appended to every stored key.
pub const TIMESTAMP_SIZE: usize = core::mem::size_of::<u64>();
