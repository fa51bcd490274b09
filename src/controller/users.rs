//! User set differ

use std::collections::HashMap;

use crate::api::UserRecord;

/// Result of comparing two user snapshots
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserDiff {
    pub deleted: Vec<UserRecord>,
    pub added: Vec<UserRecord>,
}

impl UserDiff {
    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty() && self.added.is_empty()
    }
}

/// Compute the records to remove from `old` and add from `new`.
///
/// Records compare by full value. Duplicates are counted rather than
/// collapsed, so `old \ deleted + added` always has the multiset of `new`.
/// Output preserves input order.
pub fn diff_users(old: &[UserRecord], new: &[UserRecord]) -> UserDiff {
    let mut remaining: HashMap<&UserRecord, usize> = HashMap::with_capacity(new.len());
    for user in new {
        *remaining.entry(user).or_default() += 1;
    }

    let mut deleted = Vec::new();
    for user in old {
        match remaining.get_mut(user) {
            Some(count) if *count > 0 => *count -= 1,
            _ => deleted.push(user.clone()),
        }
    }

    // What is left in `remaining` was not matched by anything in `old`
    let mut added = Vec::new();
    for user in new {
        if let Some(count) = remaining.get_mut(user) {
            if *count > 0 {
                *count -= 1;
                added.push(user.clone());
            }
        }
    }

    UserDiff { deleted, added }
}
