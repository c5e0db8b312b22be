use std::borrow::Cow;

/// Lua script for releasing a lock.
///
/// KEYS\[1\] = lock key
/// ARGV\[1\] = owner token
///
/// Returns 1 if released, 0 if not held by this owner.
pub const UNLOCK: &str = r"
local owner = redis.call('GET', KEYS[1])
if owner == ARGV[1] then
    redis.call('DEL', KEYS[1])
    return 1
end
return 0
";

/// Lua script for replacing a lock's TTL.
///
/// KEYS\[1\] = lock key
/// ARGV\[1\] = owner token
/// ARGV\[2\] = new TTL in milliseconds
///
/// Returns 1 if extended, 0 if not held by this owner.
pub const EXTEND: &str = r"
local owner = redis.call('GET', KEYS[1])
if owner == ARGV[1] then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
    return 1
end
return 0
";

/// The compare-and-act contract a script implements.
///
/// Stores with a scripting engine run the script source; stores without one
/// perform the equivalent native operation for the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptKind {
    /// Delete the key if its value equals `ARGV[1]`.
    Unlock,
    /// Set the key's TTL to `ARGV[2]` milliseconds if its value equals `ARGV[1]`.
    Extend,
}

impl ScriptKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unlock => "unlock",
            Self::Extend => "extend",
        }
    }
}

impl std::fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A compare-and-act script to be registered with a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockScript {
    kind: ScriptKind,
    source: Cow<'static, str>,
}

impl LockScript {
    /// The built-in compare-and-delete script.
    #[must_use]
    pub fn unlock() -> Self {
        Self {
            kind: ScriptKind::Unlock,
            source: Cow::Borrowed(UNLOCK),
        }
    }

    /// The built-in compare-and-extend script.
    #[must_use]
    pub fn extend() -> Self {
        Self {
            kind: ScriptKind::Extend,
            source: Cow::Borrowed(EXTEND),
        }
    }

    /// A caller-supplied script source honouring the contract of `kind`.
    #[must_use]
    pub fn custom(kind: ScriptKind, source: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ScriptKind {
        self.kind
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }
}

/// The unlock/extend pair a lock registers at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockScripts {
    pub unlock: LockScript,
    pub extend: LockScript,
}

impl Default for LockScripts {
    fn default() -> Self {
        Self {
            unlock: LockScript::unlock(),
            extend: LockScript::extend(),
        }
    }
}

/// A reusable reference to a script registered with a store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptHandle {
    id: String,
    kind: ScriptKind,
}

impl ScriptHandle {
    /// Create a handle from the store-assigned identifier (a SHA1 digest on Redis).
    #[must_use]
    pub fn new(id: impl Into<String>, kind: ScriptKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn kind(&self) -> ScriptKind {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_scripts_compare_before_mutating() {
        let unlock = LockScript::unlock();
        assert_eq!(unlock.kind(), ScriptKind::Unlock);
        assert!(unlock.source().contains("redis.call('GET', KEYS[1])"));
        assert!(unlock.source().contains("redis.call('DEL', KEYS[1])"));

        let extend = LockScript::extend();
        assert_eq!(extend.kind(), ScriptKind::Extend);
        assert!(extend.source().contains("PEXPIRE"));
        assert!(extend.source().contains("ARGV[2]"));
    }

    #[test]
    fn custom_script_keeps_kind() {
        let script = LockScript::custom(ScriptKind::Extend, String::from("return 0"));
        assert_eq!(script.kind(), ScriptKind::Extend);
        assert_eq!(script.source(), "return 0");
    }

    #[test]
    fn default_pair_is_builtin() {
        let scripts = LockScripts::default();
        assert_eq!(scripts.unlock, LockScript::unlock());
        assert_eq!(scripts.extend, LockScript::extend());
    }

    #[test]
    fn kind_as_str() {
        assert_eq!(ScriptKind::Unlock.as_str(), "unlock");
        assert_eq!(ScriptKind::Extend.to_string(), "extend");
    }
}
