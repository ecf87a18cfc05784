//! Interface index to name resolution for record decoration.

use std::collections::HashMap;

use parking_lot::RwLock;

/// Concurrent index→name map fed by discovery events. Names of removed
/// interfaces are kept so in-flight records can still be decorated.
#[derive(Default)]
pub struct InterfaceNamer {
    names: RwLock<HashMap<u32, String>>,
}

impl InterfaceNamer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, index: u32, name: &str) {
        self.names.write().insert(index, name.to_string());
    }

    /// Resolved name, or a printable fallback carrying the raw index.
    pub fn name_of(&self, index: u32) -> String {
        match self.names.read().get(&index) {
            Some(name) => name.clone(),
            None => format!("[if:{index}]"),
        }
    }

    pub fn known(&self, index: u32) -> bool {
        self.names.read().contains_key(&index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_resolution() {
        let namer = InterfaceNamer::new();
        namer.insert(2, "eth0");

        assert_eq!(namer.name_of(2), "eth0");
        assert_eq!(namer.name_of(9), "[if:9]");
        assert!(namer.known(2));
        assert!(!namer.known(9));
    }

    #[test]
    fn test_rename_overwrites() {
        let namer = InterfaceNamer::new();
        namer.insert(2, "eth0");
        namer.insert(2, "lan0");
        assert_eq!(namer.name_of(2), "lan0");
    }
}
