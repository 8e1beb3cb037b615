use rusty_ulid::Ulid;
use serde::{Deserialize, Serialize};
use std::{fmt::Display, ops::Deref};

/// Sortable unique id used for scheduler runs and temp files.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub struct Eid(String);

impl Display for Eid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Deref for Eid {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&str> for Eid {
    fn from(fr: &str) -> Self {
        Eid(fr.to_string())
    }
}

impl Eid {
    #[inline]
    pub fn new() -> Eid {
        Eid(Ulid::generate().to_string())
    }
}

impl Default for Eid {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_ordered() {
        let a = Eid::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = Eid::new();
        assert_ne!(a, b);
        assert!(a < b);
        assert_eq!(a.len(), 26);
    }
}
