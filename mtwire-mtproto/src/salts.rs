//! Server salt bookkeeping.
//!
//! All times are server Unix seconds (local clock corrected by the session's
//! time offset).

use mtwire_tl_types::types::FutureSalt;

/// Lifetime assumed for a salt whose validity window the server did not
/// state (the first salt, `bad_server_salt`, `new_session_created`).
pub const PROVISIONAL_LIFETIME: i32 = 30 * 60;

/// Refresh salts when the newest one expires within this many seconds.
pub const DEFAULT_REFRESH_MARGIN: i32 = 5 * 60;

/// A server salt with its validity window `[valid_since, valid_until)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Salt {
    /// The 64-bit salt value.
    pub salt: i64,
    /// First second this salt is accepted.
    pub valid_since: i32,
    /// Expiry second (exclusive).
    pub valid_until: i32,
}

impl Salt {
    /// A salt the server just told us to use, valid from `now`.
    pub fn provisional(salt: i64, now: i32) -> Self {
        Self { salt, valid_since: now, valid_until: now.saturating_add(PROVISIONAL_LIFETIME) }
    }

    fn is_valid_at(&self, now: i32) -> bool {
        self.valid_since <= now && now < self.valid_until
    }
}

impl From<&FutureSalt> for Salt {
    fn from(s: &FutureSalt) -> Self {
        Self { salt: s.salt, valid_since: s.valid_since, valid_until: s.valid_until }
    }
}

/// Ordered set of current and future salts.
#[derive(Clone, Debug)]
pub struct SaltSet {
    /// Sorted by `valid_since`; never empty.
    salts: Vec<Salt>,
    refresh_margin: i32,
}

impl SaltSet {
    /// Start with a single provisional salt.
    pub fn new(first: i64, now: i32) -> Self {
        Self { salts: vec![Salt::provisional(first, now)], refresh_margin: DEFAULT_REFRESH_MARGIN }
    }

    /// Override the refresh safety margin.
    pub fn with_refresh_margin(mut self, margin: i32) -> Self {
        self.refresh_margin = margin;
        self
    }

    /// Salt to encrypt with at `now`.
    ///
    /// Prefers a currently valid salt. If every known salt is outside its
    /// window, the one expiring last is used and the server is expected to
    /// answer with `bad_server_salt`.
    pub fn current(&self, now: i32) -> i64 {
        if let Some(valid) = self.salts.iter().find(|s| s.is_valid_at(now)) {
            return valid.salt;
        }
        let fallback = self.newest();
        log::warn!("[mtwire] no valid server salt at {now}, falling back to {:#x}", fallback.salt);
        fallback.salt
    }

    /// True when the newest salt expires within the refresh margin.
    pub fn needs_refresh(&self, now: i32) -> bool {
        self.newest().valid_until.saturating_sub(now) < self.refresh_margin
    }

    /// Drop everything and trust `salt` from `now` on.
    pub fn replace(&mut self, salt: i64, now: i32) {
        self.salts.clear();
        self.salts.push(Salt::provisional(salt, now));
    }

    /// Merge a `future_salts` answer.
    pub fn extend(&mut self, future: &[FutureSalt], now: i32) {
        for fs in future {
            let salt = Salt::from(fs);
            if salt.valid_until <= salt.valid_since {
                continue;
            }
            match self.salts.iter_mut().find(|s| s.salt == salt.salt) {
                Some(existing) => *existing = salt,
                None => self.salts.push(salt),
            }
        }
        self.salts.sort_by_key(|s| s.valid_since);
        self.prune(now);
    }

    /// Remove expired salts, always keeping at least the newest one.
    pub fn prune(&mut self, now: i32) {
        let newest = *self.newest();
        self.salts.retain(|s| s.valid_until > now);
        if self.salts.is_empty() {
            self.salts.push(newest);
        }
    }

    /// Every known salt, ordered by `valid_since`.
    pub fn salts(&self) -> &[Salt] {
        &self.salts
    }

    fn newest(&self) -> &Salt {
        // `salts` is never empty: every mutation leaves at least one entry.
        self.salts
            .iter()
            .max_by_key(|s| s.valid_until)
            .unwrap_or(&self.salts[0])
    }
}
