//! On-disk row control header codec.
//!
//! `[flag(1)][reserved(1)][txId(2, little-endian)]` followed by the
//! table's column bytes. The original (`ControlData` in `Datafile.h`)
//! relied on the platform's native byte order for the transaction id;
//! this port fixes little-endian explicitly so the on-disk format
//! doesn't vary across host architectures.

use crate::column::CONTROL_DATA_SIZE;

pub const LIVE: u8 = 0;
pub const TOMBSTONE: u8 = 1;

/// No transaction currently owns the row.
pub const UNLOCKED: i16 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Control {
    pub flag: u8,
    pub tx_id: i16,
}

impl Control {
    pub fn live_unlocked() -> Self {
        Self { flag: LIVE, tx_id: UNLOCKED }
    }

    pub fn is_live(&self) -> bool {
        self.flag == LIVE
    }

    pub fn is_locked(&self) -> bool {
        self.tx_id != UNLOCKED
    }

    pub fn encode(&self) -> [u8; CONTROL_DATA_SIZE] {
        let mut out = [0u8; CONTROL_DATA_SIZE];
        out[0] = self.flag;
        out[1] = 0; // reserved
        out[2..4].copy_from_slice(&self.tx_id.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Self {
        debug_assert_eq!(bytes.len(), CONTROL_DATA_SIZE);
        let tx_id = i16::from_le_bytes([bytes[2], bytes[3]]);
        Self { flag: bytes[0], tx_id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        for (flag, tx_id) in [(LIVE, UNLOCKED), (LIVE, 7i16), (TOMBSTONE, UNLOCKED)] {
            let c = Control { flag, tx_id };
            assert_eq!(Control::decode(&c.encode()), c);
        }
    }

    #[test]
    fn negative_transaction_id_round_trips_little_endian() {
        let c = Control { flag: LIVE, tx_id: -1 };
        let bytes = c.encode();
        assert_eq!(bytes, [0, 0, 0xff, 0xff]);
    }

    proptest::proptest! {
        #[test]
        fn control_round_trips_for_any_flag_and_tx_id(flag: u8, tx_id: i16) {
            let c = Control { flag, tx_id };
            proptest::prop_assert_eq!(Control::decode(&c.encode()), c);
        }
    }
}
