//! Identities of the three protocol participants.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One of the three cooperating parties.
///
/// The declaration order is significant: parties are totally ordered and the
/// lower-ordered party always initiates the TCP connection to the
/// higher-ordered one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Party {
    /// The coordinating, non-data-holding party.
    Ph,
    /// The first data holder.
    Db1,
    /// The second data holder.
    Db2,
}

impl Party {
    /// The two data-holding parties, in order.
    pub const DBS: [Party; 2] = [Party::Db1, Party::Db2];

    /// Integer form used on the wire during the handshake.
    pub fn to_int(self) -> i32 {
        match self {
            Party::Ph => 0,
            Party::Db1 => 1,
            Party::Db2 => 2,
        }
    }

    /// Parses the wire integer form.
    pub fn from_int(src: i32) -> Option<Party> {
        match src {
            0 => Some(Party::Ph),
            1 => Some(Party::Db1),
            2 => Some(Party::Db2),
            _ => None,
        }
    }

    /// Whether this party holds data.
    pub fn is_db(self) -> bool {
        matches!(self, Party::Db1 | Party::Db2)
    }

    /// The other data holder. Must only be called on a data holder.
    pub fn peer_db(self) -> Party {
        match self {
            Party::Db1 => Party::Db2,
            Party::Db2 => Party::Db1,
            Party::Ph => unreachable!("PH has no peer DB"),
        }
    }

    /// Whether this party is the one that dials the connection to `other`.
    pub fn connects_to(self, other: Party) -> bool {
        self < other
    }

    /// Index into per-DB arrays (0 for DB1, 1 for DB2).
    pub fn db_index(self) -> usize {
        match self {
            Party::Db1 => 0,
            Party::Db2 => 1,
            Party::Ph => unreachable!("PH has no DB index"),
        }
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Party::Ph => "ph",
            Party::Db1 => "db1",
            Party::Db2 => "db2",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_determines_initiator() {
        assert!(Party::Ph.connects_to(Party::Db1));
        assert!(Party::Ph.connects_to(Party::Db2));
        assert!(Party::Db1.connects_to(Party::Db2));
        assert!(!Party::Db2.connects_to(Party::Db1));
        assert!(!Party::Db1.connects_to(Party::Ph));
    }

    #[test]
    fn int_round_trip() {
        for p in [Party::Ph, Party::Db1, Party::Db2] {
            assert_eq!(Party::from_int(p.to_int()), Some(p));
        }
        assert_eq!(Party::from_int(3), None);
        assert_eq!(Party::from_int(-1), None);
    }

    #[test]
    fn peers() {
        assert_eq!(Party::Db1.peer_db(), Party::Db2);
        assert_eq!(Party::Db2.peer_db(), Party::Db1);
        assert!(!Party::Ph.is_db());
    }
}
