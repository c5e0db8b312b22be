use uuid::Uuid;

/// Per-acquisition random identifier proving which handle owns a lock.
///
/// Stored both as the value under the resource key and inside the handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnershipToken(String);

impl OwnershipToken {
    /// Mint a fresh token (UUID v4).
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OwnershipToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for OwnershipToken {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// What a handle believes about its lock.
///
/// The belief can go stale: a lease that expires before `release` leaves the
/// handle `Held` until the next store round-trip says otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Ownership {
    #[default]
    Unheld,
    Held(OwnershipToken),
}

impl Ownership {
    #[must_use]
    pub fn token(&self) -> Option<&OwnershipToken> {
        match self {
            Self::Held(token) => Some(token),
            Self::Unheld => None,
        }
    }

    #[must_use]
    pub fn is_held(&self) -> bool {
        matches!(self, Self::Held(_))
    }
}
