// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::credentials::Credentials;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;

/// Safety integrity level of a process, ordered from lowest to highest
/// trust. The ordering is load-bearing: a server aborts when a peer of
/// greater or equal level faults (see the event manager).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
pub enum IntegrityLevel {
    Qm,
    AsilA,
    AsilB,
    AsilC,
    AsilD,
}

impl IntegrityLevel {
    pub const COUNT: usize = 5;

    /// Stable index used for per-class bookkeeping tables.
    pub fn index(self) -> usize {
        match self {
            IntegrityLevel::Qm => 0,
            IntegrityLevel::AsilA => 1,
            IntegrityLevel::AsilB => 2,
            IntegrityLevel::AsilC => 3,
            IntegrityLevel::AsilD => 4,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(IntegrityLevel::Qm),
            1 => Some(IntegrityLevel::AsilA),
            2 => Some(IntegrityLevel::AsilB),
            3 => Some(IntegrityLevel::AsilC),
            4 => Some(IntegrityLevel::AsilD),
            _ => None,
        }
    }
}

impl fmt::Display for IntegrityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IntegrityLevel::Qm => "QM",
            IntegrityLevel::AsilA => "ASIL-A",
            IntegrityLevel::AsilB => "ASIL-B",
            IntegrityLevel::AsilC => "ASIL-C",
            IntegrityLevel::AsilD => "ASIL-D",
        };
        f.write_str(name)
    }
}

/// Resolves the integrity level a peer process runs at.
///
/// The platform deployment decides how levels are assigned; the default
/// implementation maps uids through a configured table.
pub trait IntegrityResolver: Send + Sync {
    fn integrity_level(&self, credentials: &Credentials) -> IntegrityLevel;
}

/// Uid-table backed resolver. Unknown uids resolve to the configured
/// default (QM unless stated otherwise).
#[derive(Debug, Clone, Deserialize)]
pub struct UidTableResolver {
    #[serde(default)]
    table: HashMap<u32, IntegrityLevel>,
    #[serde(default = "UidTableResolver::default_level")]
    default: IntegrityLevel,
}

impl UidTableResolver {
    fn default_level() -> IntegrityLevel {
        IntegrityLevel::Qm
    }

    pub fn new(table: HashMap<u32, IntegrityLevel>, default: IntegrityLevel) -> Self {
        Self { table, default }
    }
}

impl Default for UidTableResolver {
    fn default() -> Self {
        Self {
            table: HashMap::new(),
            default: IntegrityLevel::Qm,
        }
    }
}

impl IntegrityResolver for UidTableResolver {
    fn integrity_level(&self, credentials: &Credentials) -> IntegrityLevel {
        self.table
            .get(&credentials.uid)
            .copied()
            .unwrap_or(self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_totally_ordered() {
        assert!(IntegrityLevel::Qm < IntegrityLevel::AsilA);
        assert!(IntegrityLevel::AsilA < IntegrityLevel::AsilB);
        assert!(IntegrityLevel::AsilB < IntegrityLevel::AsilC);
        assert!(IntegrityLevel::AsilC < IntegrityLevel::AsilD);
    }

    #[test]
    fn index_round_trips() {
        for index in 0..IntegrityLevel::COUNT {
            let level = IntegrityLevel::from_index(index).unwrap();
            assert_eq!(level.index(), index);
        }
        assert_eq!(IntegrityLevel::from_index(5), None);
    }

    #[test]
    fn unknown_uid_resolves_to_default() {
        let mut table = HashMap::new();
        table.insert(100, IntegrityLevel::AsilB);
        let resolver = UidTableResolver::new(table, IntegrityLevel::Qm);

        let known = Credentials {
            uid: 100,
            gid: 0,
            pid: 1,
        };
        let unknown = Credentials {
            uid: 101,
            gid: 0,
            pid: 1,
        };
        assert_eq!(resolver.integrity_level(&known), IntegrityLevel::AsilB);
        assert_eq!(resolver.integrity_level(&unknown), IntegrityLevel::Qm);
    }
}
