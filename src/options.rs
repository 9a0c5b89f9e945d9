use std::fmt;

use crate::base::utils::read_uint_from_env;

/// Tunables for an [`ObjStorage`](crate::storage::ObjStorage).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ObjStorageOptions {
    /// Number of block pointers the first active array can hold. The array
    /// doubles whenever it fills up.
    pub initial_active_array_size: usize,
    /// Extra iterations allowed per `delete_empty_blocks` call on top of the
    /// current block count. Deferred updates can make a block be counted
    /// twice, so the bound needs a little slack.
    pub delete_slack: usize,
}

impl ObjStorageOptions {
    pub const DEFAULT_INITIAL_ACTIVE_ARRAY_SIZE: usize = 8;
    pub const DEFAULT_DELETE_SLACK: usize = 10;
    /// Largest array any storage grows to. Far above any realistic block
    /// count, and small enough that the array's byte size cannot overflow.
    pub const MAX_ACTIVE_ARRAY_SIZE: usize = 1 << 32;
    /// Largest accepted initial size.
    pub const MAX_INITIAL_ACTIVE_ARRAY_SIZE: usize = 1 << 20;

    /// Defaults, overridden by `OBJSTORAGE_INITIAL_ARRAY_SIZE` and
    /// `OBJSTORAGE_DELETE_SLACK` when set.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Some(size) = read_uint_from_env("OBJSTORAGE_INITIAL_ARRAY_SIZE") {
            options.initial_active_array_size = size;
        }
        if let Some(slack) = read_uint_from_env("OBJSTORAGE_DELETE_SLACK") {
            options.delete_slack = slack;
        }
        options.validated()
    }

    /// Clamps values that would break the storage's invariants.
    pub fn validated(mut self) -> Self {
        self.initial_active_array_size = self
            .initial_active_array_size
            .clamp(1, Self::MAX_INITIAL_ACTIVE_ARRAY_SIZE);
        self
    }
}

impl Default for ObjStorageOptions {
    fn default() -> Self {
        Self {
            initial_active_array_size: Self::DEFAULT_INITIAL_ACTIVE_ARRAY_SIZE,
            delete_slack: Self::DEFAULT_DELETE_SLACK,
        }
    }
}

impl fmt::Display for ObjStorageOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjStorageOptions")
            .field("initial_active_array_size", &self.initial_active_array_size)
            .field("delete_slack", &self.delete_slack)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::ObjStorageOptions;

    #[test]
    fn test_defaults_and_validation() {
        let options = ObjStorageOptions::default();
        assert_eq!(options.initial_active_array_size, 8);
        assert_eq!(options.delete_slack, 10);

        let clamped = ObjStorageOptions {
            initial_active_array_size: 0,
            ..options
        }
        .validated();
        assert_eq!(clamped.initial_active_array_size, 1);

        let huge = ObjStorageOptions {
            initial_active_array_size: 1 << 61,
            ..options
        }
        .validated();
        assert_eq!(
            huge.initial_active_array_size,
            ObjStorageOptions::MAX_INITIAL_ACTIVE_ARRAY_SIZE
        );
    }
}
